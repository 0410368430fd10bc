use core::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use memfile::MemFile;
use memmap2::{MmapOptions, MmapRaw};
use shmdict_fd::{ListenInit, SharedFd};

use crate::lock::{self, RegionGuard};
use crate::{AttachError, CreationError, RegionError};

/// What a region is stored in, and how other processes find it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    /// A file, found by its path.
    Path(PathBuf),
    /// An anonymous memory file, reachable only by passing its descriptor.
    Anonymous(String),
}

/// A fixed-capacity byte buffer shared with other processes.
pub struct SharedBuffer {
    backing: Backing,
    capacity: usize,
    mapped: Option<Mapped>,
    destroyed: bool,
    /// `flock` only excludes other open file descriptions, this excludes our own threads.
    local: Mutex<()>,
}

pub(crate) struct Mapped {
    /// Declared before `file` so that we unmap before closing.
    pub(crate) map: MmapRaw,
    pub(crate) file: File,
}

impl SharedBuffer {
    /// Create a new named region of exactly `capacity` bytes.
    ///
    /// Fails if the name already exists. The new region is zeroed.
    pub fn create(name: impl AsRef<Path>, capacity: usize) -> Result<Self, CreationError> {
        let path = name.as_ref();
        let shown = path.display().to_string();

        if capacity == 0 {
            return Err(CreationError::ZeroCapacity);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => CreationError::AlreadyExists(shown.clone()),
                _ => CreationError::Allocate {
                    name: shown.clone(),
                    source,
                },
            })?;

        let mapped = match Mapped::size_and_map(file, capacity) {
            Ok(mapped) => mapped,
            Err(source) => {
                // Don't leave a half-made region behind for attachers to find.
                if let Err(cleanup) = fs::remove_file(path) {
                    tracing::warn!(name = %shown, %cleanup, "failed to remove half-made region");
                }
                return Err(CreationError::Allocate {
                    name: shown,
                    source,
                });
            }
        };

        tracing::debug!(name = %shown, capacity, "created shared region");
        Ok(Self::with_mapped(Backing::Path(path.to_owned()), capacity, mapped))
    }

    /// Open an existing named region.
    ///
    /// The `capacity` must be the one it was created with.
    pub fn attach(name: impl AsRef<Path>, capacity: usize) -> Result<Self, AttachError> {
        let path = name.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| {
                let name = path.display().to_string();
                match source.kind() {
                    io::ErrorKind::NotFound => AttachError::NotFound(name),
                    _ => AttachError::Map { name, source },
                }
            })?;

        Self::attach_file(Backing::Path(path.to_owned()), file, capacity)
    }

    /// Create a region in an anonymous memory file.
    ///
    /// Other processes can only reach it when it is passed to them, see
    /// [`SharedBuffer::share_with`].
    pub fn anonymous(label: &str, capacity: usize) -> Result<Self, CreationError> {
        if capacity == 0 {
            return Err(CreationError::ZeroCapacity);
        }

        let backing = Backing::Anonymous(label.to_owned());
        let allocate = |source| CreationError::Allocate {
            name: backing.to_string(),
            source,
        };

        let memfile = MemFile::create_default(label).map_err(allocate)?;
        // Safety: the descriptor was just created and is owned by nothing else.
        let file = unsafe { File::from_raw_fd(memfile.into_raw_fd()) };
        let mapped = Mapped::size_and_map(file, capacity).map_err(allocate)?;

        tracing::debug!(name = %backing, capacity, "created anonymous shared region");
        Ok(Self::with_mapped(backing, capacity, mapped))
    }

    /// Attach to a region our parent passed under `name`.
    ///
    /// The region is reopened, we do not share the open file description and therefore the lock
    /// with the parent. The passed descriptor is closed afterwards.
    ///
    /// # Safety
    /// Caller asserts that the environment variables describe file descriptors that are not
    /// owned by any other resource.
    pub unsafe fn inherited(name: &str, capacity: usize) -> Result<Self, AttachError> {
        let fd = unsafe { SharedFd::from_env(name) }.map_err(|err| match err {
            shmdict_fd::Error::Missing(name) => AttachError::NotFound(name),
            err => AttachError::Environment(err),
        })?;

        Self::reopen(name, fd, capacity)
    }

    /// Attach to a region from a descriptor referring to it.
    pub fn reopen(name: &str, fd: SharedFd, capacity: usize) -> Result<Self, AttachError> {
        let link = format!("/proc/self/fd/{}", fd.as_raw_fd());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(link)
            .map_err(|source| AttachError::Map {
                name: name.to_owned(),
                source,
            })?;
        drop(fd);

        Self::attach_file(Backing::Anonymous(name.to_owned()), file, capacity)
    }

    /// Let the child spawned from `command` attach to this region under `name`.
    ///
    /// # Safety
    /// This buffer must stay open until the command has been spawned.
    pub unsafe fn share_with(&self, command: &mut Command, name: &str) -> Result<(), RegionError> {
        let mapped = self.mapped.as_ref().ok_or(RegionError::Closed)?;

        let mut init = ListenInit::new();
        init.pass(&mapped.file, name);
        unsafe { init.wrap_proc(command) };

        tracing::debug!(region = %self.backing, name, "sharing region with child");
        Ok(())
    }

    fn attach_file(backing: Backing, file: File, capacity: usize) -> Result<Self, AttachError> {
        let map_err = |source| AttachError::Map {
            name: backing.to_string(),
            source,
        };

        // A creator holds the lock while sizing, wait for it.
        lock::lock_exclusive(&file).map_err(map_err)?;
        let actual = file.metadata().map(|meta| meta.len());
        lock::unlock(&file);
        let actual = actual.map_err(map_err)?;

        if actual == 0 {
            return Err(AttachError::Unsized(backing.to_string()));
        }

        if actual != capacity as u64 {
            return Err(AttachError::SizeMismatch {
                name: backing.to_string(),
                expected: capacity,
                actual,
            });
        }

        let mapped = Mapped::map(file, capacity).map_err(map_err)?;

        tracing::debug!(name = %backing, capacity, "attached shared region");
        Ok(Self::with_mapped(backing, capacity, mapped))
    }

    fn with_mapped(backing: Backing, capacity: usize, mapped: Mapped) -> Self {
        SharedBuffer {
            backing,
            capacity,
            mapped: Some(mapped),
            destroyed: false,
            local: Mutex::new(()),
        }
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.mapped.is_none()
    }

    /// Block until this process has exclusive access to the region.
    pub fn lock(&self) -> Result<RegionGuard<'_>, RegionError> {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let mapped = self.mapped.as_ref().ok_or(RegionError::Closed)?;

        lock::lock_exclusive(&mapped.file).map_err(RegionError::Lock)?;
        tracing::trace!(name = %self.backing, "acquired shared region lock");

        // Safety: we hold both locks.
        Ok(unsafe { RegionGuard::new(mapped, self.capacity, local) })
    }

    /// A copy of all bytes of the region.
    pub fn read(&self) -> Result<Vec<u8>, RegionError> {
        Ok(self.lock()?.read())
    }

    /// Write `data` at `offset`. Nothing is written unless all of it fits.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), RegionError> {
        self.lock()?.write(offset, data)?;
        Ok(())
    }

    /// Unmap the region and close our descriptor.
    ///
    /// Can be called any number of times. Dropping the buffer does the same.
    pub fn close(&mut self) {
        if let Some(mapped) = self.mapped.take() {
            drop(mapped);
            tracing::debug!(name = %self.backing, "closed shared region");
        }
    }

    /// Close the region and remove its name, so that no one can attach anymore.
    ///
    /// Can be called any number of times. A name that has already been removed is not an error.
    pub fn destroy(&mut self) -> Result<(), RegionError> {
        self.close();

        if self.destroyed {
            return Ok(());
        }

        if let Backing::Path(path) = &self.backing {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!(name = %self.backing, "removed shared region"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(name = %self.backing, "shared region was already removed")
                }
                Err(source) => {
                    return Err(RegionError::Remove {
                        name: self.backing.to_string(),
                        source,
                    })
                }
            }
        }

        self.destroyed = true;
        Ok(())
    }
}

impl Mapped {
    /// Size a freshly created file and map it.
    fn size_and_map(file: File, capacity: usize) -> io::Result<Self> {
        lock::lock_exclusive(&file)?;
        let sized = file.set_len(capacity as u64);
        lock::unlock(&file);
        sized?;

        Self::map(file, capacity)
    }

    fn map(file: File, capacity: usize) -> io::Result<Self> {
        let map = MmapOptions::new().len(capacity).map_raw(&file)?;
        Ok(Mapped { map, file })
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Path(path) => write!(f, "{}", path.display()),
            Backing::Anonymous(label) => write!(f, "memfd:{label}"),
        }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("backing", &self.backing)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
