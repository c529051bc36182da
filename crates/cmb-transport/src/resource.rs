//! # Resource Identity and Block Math
//!
//! A resource is identified by the 24-byte tuple (MD5 of its bytes, length
//! as a big-endian u64), printed as 48 lowercase hex characters. The resource
//! is partitioned into fixed-size blocks of `MTU × SYMBOLS_PER_BLOCK` bytes;
//! block ids are 1-based and contiguous, and only the final block may be
//! short.

use md5::{Digest, Md5};
use std::fmt;

use crate::BLOCK_SIZE;

/// Size of the binary resource id: 16-byte hash + 8-byte length.
pub const RESOURCE_ID_SIZE: usize = 24;

/// Errors from parsing a textual resource id.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResourceIdError {
    #[error("resource id must be {} hex characters", RESOURCE_ID_SIZE * 2)]
    BadLength,
    #[error("resource id is not valid hex")]
    BadHex,
}

/// 24-byte resource identity: content hash plus byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    hash: [u8; 16],
    length: u64,
}

impl ResourceId {
    pub fn new(hash: [u8; 16], length: u64) -> Self {
        ResourceId { hash, length }
    }

    /// Compute the identity of a resource from its bytes.
    pub fn of(data: &[u8]) -> Self {
        let digest = Md5::digest(data);
        ResourceId {
            hash: digest.into(),
            length: data.len() as u64,
        }
    }

    pub fn hash(&self) -> &[u8; 16] {
        &self.hash
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether `data` hashes to this id's content hash and length.
    pub fn matches(&self, data: &[u8]) -> bool {
        *self == ResourceId::of(data)
    }

    /// Parse the 48-character hex form.
    pub fn from_hex(text: &str) -> Result<Self, ResourceIdError> {
        if text.len() != RESOURCE_ID_SIZE * 2 {
            return Err(ResourceIdError::BadLength);
        }
        let raw: Vec<u8> = hex::decode(text).map_err(|_| ResourceIdError::BadHex)?;
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&raw[..16]);
        let mut length_bytes = [0u8; 8];
        length_bytes.copy_from_slice(&raw[16..]);
        Ok(ResourceId {
            hash,
            length: u64::from_be_bytes(length_bytes),
        })
    }

    /// Number of blocks the resource partitions into.
    pub fn number_of_blocks(&self) -> u64 {
        number_of_blocks(self.length)
    }

    /// Effective size of `block_id`, or `None` when out of range.
    pub fn block_size_of(&self, block_id: u64) -> Option<usize> {
        block_size_of(self.length, block_id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.hash))?;
        write!(f, "{}", hex::encode(self.length.to_be_bytes()))
    }
}

// ─── Block Math ─────────────────────────────────────────────────────────────

/// Number of `BLOCK_SIZE` blocks covering `resource_length` bytes.
pub fn number_of_blocks(resource_length: u64) -> u64 {
    resource_length.div_ceil(BLOCK_SIZE as u64)
}

/// Effective size of block `block_id` (1-based) in a resource of
/// `resource_length` bytes. Every block is `BLOCK_SIZE` except the final one,
/// which holds the remainder (or a full block when the length divides evenly).
pub fn block_size_of(resource_length: u64, block_id: u64) -> Option<usize> {
    let last = number_of_blocks(resource_length);
    if block_id == 0 || block_id > last {
        return None;
    }
    if block_id < last {
        return Some(BLOCK_SIZE);
    }
    let remainder = (resource_length % BLOCK_SIZE as u64) as usize;
    Some(if remainder == 0 { BLOCK_SIZE } else { remainder })
}

/// Byte range `[offset, offset + size)` of block `block_id` within the
/// resource.
pub fn block_byte_range(resource_length: u64, block_id: u64) -> Option<(usize, usize)> {
    let size = block_size_of(resource_length, block_id)?;
    let offset = (block_id - 1) as usize * BLOCK_SIZE;
    Some((offset, offset + size))
}
