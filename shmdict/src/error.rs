use std::io;

use shmdict_region::{AttachError, CapacityError, CreationError, RegionError};

use crate::{DecodeError, EncodeError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Creation(#[from] CreationError),
    #[error(transparent)]
    Attach(AttachError),
    /// The encoded mapping does not fit, the region still holds the previous one.
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("key `{0}` is not present")]
    KeyNotFound(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The mapping cannot be encoded, the region still holds the previous one.
    #[error("failed to encode mapping")]
    Encode(#[source] EncodeError),
    #[error("store has been closed")]
    Closed,
    #[error("failed to lock the shared region")]
    Lock(#[source] io::Error),
    #[error(transparent)]
    Region(RegionError),
}

impl From<AttachError> for StoreError {
    fn from(err: AttachError) -> Self {
        match err {
            // Nothing was written yet, not even the size.
            AttachError::Unsized(_) => StoreError::Decode(DecodeError::Uninitialized),
            err => StoreError::Attach(err),
        }
    }
}

impl From<RegionError> for StoreError {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::Closed => StoreError::Closed,
            RegionError::Capacity(cap) => StoreError::Capacity(cap),
            RegionError::Lock(err) => StoreError::Lock(err),
            err => StoreError::Region(err),
        }
    }
}
