//! Content hashing used to match bodies, receipts and state nodes against
//! the hashes a peer was asked for.

use crate::types::{Hash256, Receipt};

/// BLAKE3 hash of arbitrary bytes.
///
/// Used for body roots and state node keys.
pub fn content_hash(data: &[u8]) -> Hash256 {
    Hash256(blake3::hash(data).into())
}

/// Root over an ordered receipt list.
///
/// Each receipt is length-prefixed (u64 little-endian) before hashing so
/// that `[ab, c]` and `[a, bc]` produce different roots.
pub fn receipts_root(receipts: &[Receipt]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(receipts.len() as u64).to_le_bytes());
    for receipt in receipts {
        hasher.update(&(receipt.0.len() as u64).to_le_bytes());
        hasher.update(&receipt.0);
    }
    Hash256(hasher.finalize().into())
}
