//! A fixed-capacity region of memory shared between processes.
//!
//! The region is a file mapped with `MAP_SHARED`. Either a named file, preferably on a memory
//! file system such as `/dev/shm`, or an anonymous memory file handed to child processes by
//! descriptor (see `shmdict-fd`). Every process opening the region gets its own open file
//! description, and `flock(2)` on it is the process-shared exclusive lock.
//!
//! ## Lifecycle
//!
//! One process, the creator, calls [`SharedBuffer::create`]. Others [`SharedBuffer::attach`]
//! with the same capacity; there is no size discovery and a differing size is refused. The
//! region outlives all processes until someone calls [`SharedBuffer::destroy`], which removes
//! the name. Destroying a region other processes still use is the caller's business, they keep
//! their mapping but nobody can attach anymore.
//!
//! ## Locking
//!
//! `flock` locks are released by the kernel when the holder exits, a crashed process does not
//! leave the region locked. A live process that holds a [`RegionGuard`] forever does block all
//! others forever, there is no timeout.
mod buffer;
mod error;
mod lock;

pub use buffer::{Backing, SharedBuffer};
pub use error::{AttachError, CapacityError, CreationError, RegionError};
pub use lock::RegionGuard;
