//! In-memory [`BlockStore`].
//!
//! Holds every imported block and follows the heaviest chain. Backs the
//! loopback simulator, the sink for exported blocks, and tests.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::chain;
use crate::crypto;
use crate::error::StoreError;
use crate::traits::BlockStore;
use crate::types::{Block, Hash256, Receipt, TotalDifficulty};

#[derive(Debug, Default)]
struct Inner {
    canonical: Vec<Hash256>,
    blocks: HashMap<Hash256, (Block, TotalDifficulty)>,
    receipts: HashMap<Hash256, Vec<Receipt>>,
    state_nodes: HashMap<Hash256, Vec<u8>>,
}

impl Inner {
    fn tip(&self) -> Option<&(Block, TotalDifficulty)> {
        self.canonical.last().and_then(|h| self.blocks.get(h))
    }

    /// Rewrite the canonical index so it ends at `hash`.
    fn reorg_to(&mut self, hash: Hash256) {
        let mut path = Vec::new();
        let mut cursor = Some(hash);
        while let Some(h) = cursor {
            let Some((block, _)) = self.blocks.get(&h) else { break };
            let number = block.number() as usize;
            if self.canonical.get(number) == Some(&h) {
                break;
            }
            path.push(h);
            cursor = (number > 0).then_some(block.header.parent_hash);
        }
        let fork_point = path
            .last()
            .and_then(|h| self.blocks.get(h))
            .map_or(self.canonical.len(), |(b, _)| b.number() as usize);
        self.canonical.truncate(fork_point);
        self.canonical.extend(path.into_iter().rev());
    }
}

/// Thread-safe in-memory chain store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// A store holding only `genesis`.
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let td = TotalDifficulty::from(genesis.header.difficulty);
        let mut inner = Inner::default();
        inner.canonical.push(hash);
        inner.blocks.insert(hash, (genesis, td));
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// A store seeded with `blocks`, the first of which is genesis.
    pub fn from_chain(blocks: Vec<Block>) -> Result<Self, StoreError> {
        let mut iter = blocks.into_iter();
        let genesis = iter
            .next()
            .ok_or_else(|| StoreError::NotFound("genesis".into()))?;
        let store = Self::new(genesis);
        for block in iter {
            store.import(block)?;
        }
        Ok(store)
    }

    /// The synthetic chain of `len` blocks with receipts for every block.
    pub fn synthetic(len: usize) -> Result<Self, StoreError> {
        let blocks = chain::chain(len.max(1));
        let store = Self::from_chain(blocks.clone())?;
        for b in &blocks {
            store.insert_receipts(b.hash(), chain::synthetic_receipts(&b.body));
        }
        Ok(store)
    }

    /// Add a block whose parent is known. Switches the canonical chain when
    /// the new block is heavier than the current tip. Re-importing a known
    /// block is a no-op.
    pub fn import(&self, block: Block) -> Result<(), StoreError> {
        let hash = block.hash();
        let mut inner = self.inner.write();
        if inner.blocks.contains_key(&hash) {
            return Ok(());
        }
        let parent_td = inner
            .blocks
            .get(&block.header.parent_hash)
            .map(|(_, td)| *td)
            .ok_or_else(|| StoreError::NotFound(format!("parent of block {}", block.number())))?;
        let td = parent_td.saturating_add(TotalDifficulty::from(block.header.difficulty));
        let best_td = inner.tip().map_or(0, |(_, td)| *td);
        inner.blocks.insert(hash, (block, td));
        if td > best_td {
            inner.reorg_to(hash);
        }
        Ok(())
    }

    pub fn insert_receipts(&self, block_hash: Hash256, receipts: Vec<Receipt>) {
        self.inner.write().receipts.insert(block_hash, receipts);
    }

    /// Store a state node under its content hash and return the hash.
    pub fn insert_state_node(&self, value: Vec<u8>) -> Hash256 {
        let hash = crypto::content_hash(&value);
        self.inner.write().state_nodes.insert(hash, value);
        hash
    }

    /// Number of the best block.
    pub fn height(&self) -> u64 {
        (self.inner.read().canonical.len() as u64).saturating_sub(1)
    }
}

impl BlockStore for MemoryStore {
    fn best_block(&self) -> Result<Block, StoreError> {
        self.inner
            .read()
            .tip()
            .map(|(b, _)| b.clone())
            .ok_or_else(|| StoreError::NotFound("best block".into()))
    }

    fn block_by_number(&self, number: u64) -> Result<Option<Block>, StoreError> {
        let inner = self.inner.read();
        Ok(usize::try_from(number)
            .ok()
            .and_then(|n| inner.canonical.get(n))
            .and_then(|h| inner.blocks.get(h))
            .map(|(b, _)| b.clone()))
    }

    fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        Ok(self.inner.read().blocks.get(hash).map(|(b, _)| b.clone()))
    }

    fn total_difficulty(&self, hash: &Hash256) -> Result<Option<TotalDifficulty>, StoreError> {
        Ok(self.inner.read().blocks.get(hash).map(|(_, td)| *td))
    }

    fn receipts(&self, hash: &Hash256) -> Result<Option<Vec<Receipt>>, StoreError> {
        Ok(self.inner.read().receipts.get(hash).cloned())
    }

    fn state_node(&self, hash: &Hash256) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().state_nodes.get(hash).cloned())
    }
}
