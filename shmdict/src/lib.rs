//! A dictionary kept in a shared memory region.
//!
//! Every operation locks the region, decodes the whole mapping from it, applies itself and, if
//! anything changed, encodes the whole mapping and writes it back before unlocking. There is no
//! cached copy in any process: the bytes of the region are the only state. That makes every
//! operation atomic with respect to all other processes attached to the region, at the cost of
//! work proportional to the size of the mapping.
//!
//! ```no_run
//! use shmdict::{Store, Value};
//!
//! let store = Store::create("/dev/shm/counters", 4096)?;
//! store.set("visits", 0)?;
//!
//! // Elsewhere, in another process.
//! let other = Store::attach("/dev/shm/counters", 4096)?;
//! other.update(|map| {
//!     let visits = map.get("visits").and_then(Value::as_int).unwrap_or(0);
//!     map.insert("visits".into(), Value::Int(visits + 1));
//! })?;
//!
//! assert_eq!(store.get("visits")?, Value::Int(1));
//! # Ok::<(), shmdict::StoreError>(())
//! ```
//!
//! ## Attaching before initialization
//!
//! A region is usable once its creator wrote the empty mapping into it. Attaching earlier fails
//! with [`DecodeError::Uninitialized`] instead of waiting; retrying is up to the caller.
//!
//! ## Nesting
//!
//! Lists and maps nest at most [`MAX_DEPTH`] levels deep. Storing a deeper value fails with
//! [`EncodeError::TooDeep`], and a region claiming to hold one fails to decode.
mod codec;
mod error;
mod store;
mod value;

pub use codec::{decode, encode, DecodeError, EncodeError, FORMAT_VERSION, HEADER_LEN, MAGIC};
pub use error::StoreError;
pub use store::{Store, StoreOptions};
pub use value::{Mapping, Render, Value, MAX_DEPTH};

pub use shmdict_region::{
    AttachError, Backing, CapacityError, CreationError, RegionError, SharedBuffer,
};
