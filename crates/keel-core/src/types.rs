//! Core chain types: hashes, headers, blocks, receipts and node identities.
//!
//! Bodies and receipts are opaque byte strings. The sync engine never looks
//! inside them; it only checks them against the roots committed in the header.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::crypto;

/// Cumulative chain difficulty as reported by peers and the local store.
pub type TotalDifficulty = u128;

/// A 32-byte hash value.
///
/// Used for block header hashes (double SHA-256) and content roots (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Parent of the genesis header.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// First four bytes as hex, for compact log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identity of a remote node.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// A fresh random identity.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Where a header request starts.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum HeaderAnchor {
    /// Start at the canonical header with this number.
    Number(u64),
    /// Start at the header with this hash.
    Hash(Hash256),
}

impl fmt::Display for HeaderAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "#{n}"),
            Self::Hash(h) => write!(f, "{}", h.short()),
        }
    }
}

/// Block header as exchanged during header-first sync.
///
/// Hash is computed as double SHA-256 over a fixed byte layout.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Hash of the parent header.
    pub parent_hash: Hash256,
    /// Height of this block; genesis is 0.
    pub number: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Difficulty of this block alone.
    pub difficulty: u64,
    /// BLAKE3 root of the opaque block body.
    pub body_root: Hash256,
    /// BLAKE3 root of the block's receipt list.
    pub receipts_root: Hash256,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing (4 u64 fields + 3 * 32-byte hashes).
    const HASH_SIZE: usize = 4 * 8 + 3 * 32;

    /// Compute the block header hash (double SHA-256).
    ///
    /// Layout: parent_hash || number || timestamp || difficulty || body_root ||
    /// receipts_root || nonce, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(self.parent_hash.as_bytes());
        data.extend_from_slice(&self.number.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(self.body_root.as_bytes());
        data.extend_from_slice(self.receipts_root.as_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    /// Whether this is the genesis header.
    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }
}

/// Opaque block body bytes.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockBody(pub Vec<u8>);

impl BlockBody {
    /// BLAKE3 root committed to by [`BlockHeader::body_root`].
    pub fn root(&self) -> Hash256 {
        crypto::content_hash(&self.0)
    }

    /// Whether this body is the one committed to by `header`.
    pub fn matches(&self, header: &BlockHeader) -> bool {
        self.root() == header.body_root
    }
}

/// A complete block: header plus body.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Block height.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Hash of the header.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

/// Opaque transaction receipt bytes.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Receipt(pub Vec<u8>);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            parent_hash: Hash256::ZERO,
            number: 0,
            timestamp: 1_700_000_000,
            difficulty: 1_000,
            body_root: BlockBody::default().root(),
            receipts_root: crypto::receipts_root(&[]),
            nonce: 0,
        }
    }

    #[test]
    fn hash256_zero_is_zero() {
        let h = Hash256::ZERO;
        assert!(h.is_zero());
        assert_eq!(h, Hash256::default());
    }

    #[test]
    fn hash256_display_hex() {
        let h = Hash256([0xAB; 32]);
        let s = format!("{h}");
        assert_eq!(s.len(), 64);
        assert_eq!(&s[0..2], "ab");
        assert_eq!(h.short(), "abababab");
    }

    #[test]
    fn header_hash_is_deterministic() {
        let h = sample_header();
        assert_eq!(h.hash(), h.clone().hash());
    }

    #[test]
    fn header_hash_changes_with_every_field() {
        let base = sample_header();
        let base_hash = base.hash();

        let mut h = base.clone();
        h.number = 1;
        assert_ne!(h.hash(), base_hash);

        let mut h = base.clone();
        h.parent_hash = Hash256([1; 32]);
        assert_ne!(h.hash(), base_hash);

        let mut h = base.clone();
        h.nonce = 7;
        assert_ne!(h.hash(), base_hash);

        let mut h = base;
        h.body_root = Hash256([2; 32]);
        assert_ne!(h.hash(), base_hash);
    }

    #[test]
    fn body_matches_committed_root() {
        let body = BlockBody(vec![1, 2, 3]);
        let mut header = sample_header();
        header.body_root = body.root();
        assert!(body.matches(&header));
        assert!(!BlockBody(vec![9]).matches(&header));
    }

    #[test]
    fn genesis_detection() {
        let mut h = sample_header();
        assert!(h.is_genesis());
        h.number = 5;
        assert!(!h.is_genesis());
    }

    #[test]
    fn node_ids_are_distinct() {
        assert_ne!(NodeId::random(), NodeId::random());
        assert_eq!(format!("{}", NodeId([0xCD; 32])), "cdcdcdcdcdcdcdcd");
    }
}
