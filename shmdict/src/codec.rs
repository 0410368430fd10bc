//! The byte layout of a mapping in the region.
//!
//! A fixed header followed by the bincode body:
//!
//! | offset | size | content                                   |
//! |--------|------|-------------------------------------------|
//! | 0      | 4    | magic `SHMD`                              |
//! | 4      | 4    | format version, little endian             |
//! | 8      | 8    | length of the body in bytes, little endian |
//! | 16     | ..   | body                                      |
//!
//! Bytes after the body are stale leftovers of longer, earlier mappings and are never looked at.
use bincode::Options;
use bytemuck::{Pod, Zeroable};

use crate::value::{self, MAX_DEPTH};
use crate::Mapping;

pub const MAGIC: [u8; 4] = *b"SHMD";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_LEN: usize = core::mem::size_of::<Header>();

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Header {
    magic: [u8; 4],
    version: u32,
    body_len: u64,
}

/// The bytes of a region are not a mapping we can read.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// All zero, as a region is before its creator writes the empty mapping.
    #[error("region does not hold a mapping yet, it has not been initialized")]
    Uninitialized,
    #[error("region does not start with a mapping header, found magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("mapping was written in format version {0}, expected {}", FORMAT_VERSION)]
    UnsupportedVersion(u32),
    #[error("mapping needs {declared} bytes but only {available} are available")]
    Truncated { declared: u64, available: usize },
    #[error("mapping body is malformed")]
    Malformed(#[source] bincode::Error),
}

/// A mapping that cannot be written into a region.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("lists and maps nest deeper than {} levels", MAX_DEPTH)]
    TooDeep,
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
}

/// Encode a full mapping, header included.
///
/// Refuses mappings nesting deeper than [`MAX_DEPTH`], which [`decode`] would not read back.
pub fn encode(mapping: &Mapping) -> Result<Vec<u8>, EncodeError> {
    if value::nests_deeper_than(mapping, MAX_DEPTH) {
        return Err(EncodeError::TooDeep);
    }

    let body = options().serialize(mapping)?;

    let header = Header {
        magic: MAGIC,
        version: FORMAT_VERSION.to_le(),
        body_len: (body.len() as u64).to_le(),
    };

    let mut payload = Vec::with_capacity(HEADER_LEN + body.len());
    payload.extend_from_slice(bytemuck::bytes_of(&header));
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Decode the mapping at the start of `bytes`, ignoring whatever follows it.
///
/// Values nesting deeper than [`MAX_DEPTH`] are [`DecodeError::Malformed`].
pub fn decode(bytes: &[u8]) -> Result<Mapping, DecodeError> {
    let Some(head) = bytes.get(..HEADER_LEN) else {
        return Err(DecodeError::Truncated {
            declared: HEADER_LEN as u64,
            available: bytes.len(),
        });
    };

    let header: Header = bytemuck::pod_read_unaligned(head);

    if header.magic != MAGIC {
        if head.iter().all(|&b| b == 0) {
            return Err(DecodeError::Uninitialized);
        }

        return Err(DecodeError::BadMagic(header.magic));
    }

    let version = u32::from_le(header.version);
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let declared = u64::from_le(header.body_len);
    let tail = &bytes[HEADER_LEN..];
    let Some(body) = usize::try_from(declared)
        .ok()
        .and_then(|len| tail.get(..len))
    else {
        return Err(DecodeError::Truncated {
            declared,
            available: tail.len(),
        });
    };

    options()
        .with_limit(declared)
        .deserialize(body)
        .map_err(DecodeError::Malformed)
}
