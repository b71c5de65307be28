//! Deterministic synthetic chains.
//!
//! Used by the loopback simulator and by tests across the workspace. Every
//! block commits to a body and a receipt list derived from `(number, salt)`,
//! so two builders with the same inputs agree byte for byte and different
//! salts produce competing forks.

use crate::crypto;
use crate::types::{Block, BlockBody, BlockHeader, Hash256, Receipt};

/// Genesis timestamp of synthetic chains.
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
/// Per-block difficulty of synthetic chains.
pub const SYNTHETIC_DIFFICULTY: u64 = 1_000;

/// Body bytes for a synthetic block.
pub fn synthetic_body(number: u64, salt: u64) -> BlockBody {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(b"keel");
    bytes.extend_from_slice(&number.to_le_bytes());
    bytes.extend_from_slice(&salt.to_le_bytes());
    BlockBody(bytes)
}

/// Receipts for a synthetic block: one receipt echoing the body.
pub fn synthetic_receipts(body: &BlockBody) -> Vec<Receipt> {
    vec![Receipt(body.0.clone())]
}

/// The block following `parent`, with content derived from `salt`.
pub fn block_on(parent: &BlockHeader, salt: u64) -> Block {
    let number = parent.number + 1;
    let body = synthetic_body(number, salt);
    let header = BlockHeader {
        parent_hash: parent.hash(),
        number,
        timestamp: parent.timestamp + 10,
        difficulty: SYNTHETIC_DIFFICULTY,
        body_root: body.root(),
        receipts_root: crypto::receipts_root(&synthetic_receipts(&body)),
        nonce: salt,
    };
    Block { header, body }
}

/// The shared synthetic genesis block.
pub fn genesis() -> Block {
    let body = synthetic_body(0, 0);
    let header = BlockHeader {
        parent_hash: Hash256::ZERO,
        number: 0,
        timestamp: GENESIS_TIMESTAMP,
        difficulty: SYNTHETIC_DIFFICULTY,
        body_root: body.root(),
        receipts_root: crypto::receipts_root(&synthetic_receipts(&body)),
        nonce: 0,
    };
    Block { header, body }
}

/// `len` blocks extending `parent`.
pub fn extend(parent: &BlockHeader, len: usize, salt: u64) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut tip = parent.clone();
    for _ in 0..len {
        let block = block_on(&tip, salt);
        tip = block.header.clone();
        blocks.push(block);
    }
    blocks
}

/// Genesis followed by `len - 1` blocks; `len` blocks in total.
pub fn chain(len: usize) -> Vec<Block> {
    if len == 0 {
        return Vec::new();
    }
    let g = genesis();
    let mut blocks = vec![g.clone()];
    blocks.extend(extend(&g.header, len - 1, 0));
    blocks
}

/// Total difficulty at height `number` of a synthetic chain.
pub fn synthetic_total_difficulty(number: u64) -> u128 {
    (number as u128 + 1) * SYNTHETIC_DIFFICULTY as u128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_and_numbers() {
        let blocks = chain(10);
        assert_eq!(blocks.len(), 10);
        assert!(blocks[0].header.is_genesis());
        for w in blocks.windows(2) {
            assert_eq!(w[1].header.parent_hash, w[0].hash());
            assert_eq!(w[1].number(), w[0].number() + 1);
            assert!(w[1].body.matches(&w[1].header));
        }
    }

    #[test]
    fn salts_fork() {
        let base = chain(3);
        let a = block_on(&base[2].header, 1);
        let b = block_on(&base[2].header, 2);
        assert_eq!(a.number(), b.number());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.header.parent_hash, b.header.parent_hash);
    }

    #[test]
    fn receipts_match_header_root() {
        let b = &chain(2)[1];
        let receipts = synthetic_receipts(&b.body);
        assert_eq!(crypto::receipts_root(&receipts), b.header.receipts_root);
    }

    #[test]
    fn deterministic_across_calls() {
        assert_eq!(chain(5), chain(5));
        assert!(chain(0).is_empty());
        assert_eq!(synthetic_total_difficulty(0), 1_000);
    }
}
