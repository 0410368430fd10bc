use core::ffi::c_int;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::MutexGuard;

use crate::buffer::Mapped;
use crate::CapacityError;

/// Exclusive access to the bytes of a region.
///
/// Holds both the process-local mutex of its `SharedBuffer` and the `flock` of the open file.
/// Both are released when the guard is dropped.
pub struct RegionGuard<'lt> {
    mapped: &'lt Mapped,
    capacity: usize,
    // Released after the `flock`, see `Drop`.
    _local: MutexGuard<'lt, ()>,
}

impl<'lt> RegionGuard<'lt> {
    /// Safety: caller holds the local mutex and has locked `mapped.file`.
    pub(crate) unsafe fn new(
        mapped: &'lt Mapped,
        capacity: usize,
        local: MutexGuard<'lt, ()>,
    ) -> Self {
        RegionGuard {
            mapped,
            capacity,
            _local: local,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy out the full region.
    pub fn read(&self) -> Vec<u8> {
        let mut snapshot = vec![0; self.capacity];
        // Safety: the map covers `capacity` bytes. Other processes cooperate by only writing while
        // holding the lock we hold, so nothing modifies the bytes during the copy.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.mapped.map.as_ptr(),
                snapshot.as_mut_ptr(),
                self.capacity,
            );
        }
        snapshot
    }

    /// Copy `data` into the region at `offset`.
    ///
    /// Nothing is written unless all of `data` fits.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), CapacityError> {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.capacity => {}
            _ => {
                return Err(CapacityError {
                    offset,
                    len: data.len(),
                    capacity: self.capacity,
                })
            }
        }

        // Safety: in-bounds as checked above, and exclusive while we hold the lock.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.map.as_mut_ptr().add(offset),
                data.len(),
            );
        }

        tracing::trace!(offset, len = data.len(), "wrote to shared region");
        Ok(())
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        unlock(&self.mapped.file);
        tracing::trace!("released shared region lock");
    }
}

/// Block until we hold the exclusive lock of `file`.
pub(crate) fn lock_exclusive(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_EX)
}

pub(crate) fn unlock(file: &File) {
    if let Err(err) = flock(file, libc::LOCK_UN) {
        // Closing the file releases it in any case.
        tracing::warn!(%err, "failed to release shared region lock");
    }
}

fn flock(file: &File, operation: c_int) -> io::Result<()> {
    loop {
        if 0 == unsafe { libc::flock(file.as_raw_fd(), operation) } {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
