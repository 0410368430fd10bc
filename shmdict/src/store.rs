use std::path::Path;
use std::process::Command;

use shmdict_region::{RegionGuard, SharedBuffer};

use crate::{codec, Mapping, Render, StoreError, Value};

/// How to open a [`Store`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Create and initialize a new region, instead of attaching to an existing one.
    pub create: bool,
    /// The size of the region in bytes. Attachers must use the creator's value.
    pub capacity: usize,
}

impl StoreOptions {
    pub const DEFAULT_CAPACITY: usize = 1024;
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            create: true,
            capacity: Self::DEFAULT_CAPACITY,
        }
    }
}

/// A mapping from strings to [`Value`]s, stored in a shared region.
///
/// Each method is one critical section over the region. Combining several, such as a `get`
/// followed by a `set`, is not atomic; use [`Store::update`] for that.
#[derive(Debug)]
pub struct Store {
    buffer: SharedBuffer,
}

impl Store {
    pub fn open(name: impl AsRef<Path>, options: &StoreOptions) -> Result<Self, StoreError> {
        if options.create {
            Self::create(name, options.capacity)
        } else {
            Self::attach(name, options.capacity)
        }
    }

    /// Create a new named region holding an empty mapping.
    ///
    /// The region is removed again if the empty mapping does not fit into `capacity`.
    pub fn create(name: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let buffer = SharedBuffer::create(name, capacity)?;
        Self::initialized(buffer)
    }

    /// Attach to a region a creator has initialized.
    pub fn attach(name: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let buffer = SharedBuffer::attach(name, capacity)?;
        Self::from_buffer(buffer)
    }

    /// Create a store in an anonymous memory file, see [`Store::share_with`].
    pub fn anonymous(label: &str, capacity: usize) -> Result<Self, StoreError> {
        let buffer = SharedBuffer::anonymous(label, capacity)?;
        Self::initialized(buffer)
    }

    /// Attach to the store our parent passed under `name`.
    ///
    /// # Safety
    /// Caller asserts that the environment variables describe file descriptors that are not
    /// owned by any other resource.
    pub unsafe fn inherited(name: &str, capacity: usize) -> Result<Self, StoreError> {
        let buffer = unsafe { SharedBuffer::inherited(name, capacity) }?;
        Self::from_buffer(buffer)
    }

    /// Wrap a region that already holds a mapping.
    ///
    /// Fails with [`DecodeError::Uninitialized`](crate::DecodeError::Uninitialized) when its
    /// creator has not initialized it yet.
    pub fn from_buffer(buffer: SharedBuffer) -> Result<Self, StoreError> {
        {
            let guard = buffer.lock()?;
            let mapping = Self::read_mapping(&guard)?;
            tracing::debug!(
                name = %buffer.backing(),
                entries = mapping.len(),
                "attached store"
            );
        }

        Ok(Store { buffer })
    }

    /// Write the empty mapping into a fresh region.
    ///
    /// Only the creator does this, once, before anyone attaches.
    pub fn initialize(buffer: &SharedBuffer) -> Result<(), StoreError> {
        let mut guard = buffer.lock()?;
        Self::write_mapping(&mut guard, &Mapping::new())
    }

    fn initialized(mut buffer: SharedBuffer) -> Result<Self, StoreError> {
        if let Err(err) = Self::initialize(&buffer) {
            if let Err(cleanup) = buffer.destroy() {
                tracing::warn!(%cleanup, "failed to remove uninitialized region");
            }

            return Err(err);
        }

        tracing::debug!(name = %buffer.backing(), capacity = buffer.capacity(), "initialized store");
        Ok(Store { buffer })
    }

    /// Let the child spawned from `command` attach with [`Store::inherited`] under `name`.
    ///
    /// # Safety
    /// This store must stay open until the command has been spawned.
    pub unsafe fn share_with(&self, command: &mut Command, name: &str) -> Result<(), StoreError> {
        unsafe { self.buffer.share_with(command, name) }?;
        Ok(())
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> SharedBuffer {
        self.buffer
    }

    /// Run `with` on the current mapping.
    pub fn view<T>(&self, with: impl FnOnce(&Mapping) -> T) -> Result<T, StoreError> {
        let guard = self.buffer.lock()?;
        let mapping = Self::read_mapping(&guard)?;
        Ok(with(&mapping))
    }

    /// Modify the mapping with `with`, in one critical section.
    ///
    /// The mapping is written back whatever `with` did. If the result does not fit into the
    /// region, the region keeps the previous mapping and the error is returned.
    pub fn update<T>(&self, with: impl FnOnce(&mut Mapping) -> T) -> Result<T, StoreError> {
        let mut guard = self.buffer.lock()?;
        let mut mapping = Self::read_mapping(&guard)?;
        let result = with(&mut mapping);
        Self::write_mapping(&mut guard, &mapping)?;
        Ok(result)
    }

    pub fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.view(|mapping| mapping.get(key).cloned())?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_owned()))
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), StoreError> {
        let (key, value) = (key.into(), value.into());
        self.update(move |mapping| {
            mapping.insert(key, value);
        })
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut guard = self.buffer.lock()?;
        let mut mapping = Self::read_mapping(&guard)?;

        let removed = mapping.remove(key);
        if removed.is_some() {
            Self::write_mapping(&mut guard, &mapping)?;
        }

        Ok(removed)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool, StoreError> {
        self.view(|mapping| mapping.contains_key(key))
    }

    /// The number of entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.view(Mapping::len)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.view(Mapping::is_empty)
    }

    /// A private copy of the whole mapping.
    pub fn snapshot(&self) -> Result<Mapping, StoreError> {
        self.view(Mapping::clone)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.update(Mapping::clear)
    }

    /// The mapping as text, for inspection. Not a stable format.
    pub fn render(&self) -> Result<String, StoreError> {
        self.view(|mapping| Render(mapping).to_string())
    }

    /// Release our mapping of the region. Can be called any number of times.
    pub fn close(&mut self) {
        self.buffer.close();
    }

    /// Close, and remove the region for everyone. Can be called any number of times.
    pub fn destroy(&mut self) -> Result<(), StoreError> {
        self.buffer.destroy()?;
        Ok(())
    }

    fn read_mapping(guard: &RegionGuard<'_>) -> Result<Mapping, StoreError> {
        Ok(codec::decode(&guard.read())?)
    }

    fn write_mapping(guard: &mut RegionGuard<'_>, mapping: &Mapping) -> Result<(), StoreError> {
        // Encoded aside first, a payload that does not fit must not clobber the current one. Too
        // deep a mapping is refused here as well, before anything was written.
        let payload = codec::encode(mapping).map_err(StoreError::Encode)?;
        guard.write(0, &payload)?;

        tracing::trace!(
            len = payload.len(),
            capacity = guard.capacity(),
            entries = mapping.len(),
            "wrote mapping"
        );
        Ok(())
    }
}
