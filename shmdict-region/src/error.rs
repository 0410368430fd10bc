use std::io;

/// The region could not be created.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error("shared region `{0}` already exists")]
    AlreadyExists(String),
    #[error("shared region needs a capacity of at least one byte")]
    ZeroCapacity,
    #[error("failed to allocate shared region `{name}`")]
    Allocate {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// An existing region could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("shared region `{0}` does not exist")]
    NotFound(String),
    /// The backing object exists but its creator has not sized it yet.
    #[error("shared region `{0}` has not been sized by its creator")]
    Unsized(String),
    #[error("shared region `{name}` holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: u64,
    },
    #[error("no shared region was passed by the parent process")]
    Environment(#[source] shmdict_fd::Error),
    #[error("failed to map shared region `{name}`")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// A write that would not fit into the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("writing {len} bytes at offset {offset} exceeds the region capacity of {capacity} bytes")]
pub struct CapacityError {
    pub offset: usize,
    pub len: usize,
    pub capacity: usize,
}

/// Failure to access an open region.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("shared region has been closed")]
    Closed,
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("failed to lock shared region")]
    Lock(#[source] io::Error),
    #[error("failed to remove shared region `{name}`")]
    Remove {
        name: String,
        #[source]
        source: io::Error,
    },
}
