//! Collaborator interfaces consumed by the sync engine.
//!
//! - [`BlockStore`] — local chain lookups (persistent storage implements)
//! - [`Discovery`] — candidate nodes for the peer pool (discovery service implements)
//! - [`Dialer`] — opens connections to discovered nodes (transport implements)
//! - [`HeaderValidator`] — checkpoint checks during the handshake

use std::fmt;

use async_trait::async_trait;

use crate::error::{DiscoveryError, HeaderRejected, StoreError};
use crate::types::{Block, BlockHeader, Hash256, NodeId, Receipt, TotalDifficulty};

/// Read-only view of the local chain.
///
/// Used to seed the sync window, to fill in our status message, and to serve
/// requests from remote peers.
pub trait BlockStore: Send + Sync {
    /// Current best block.
    fn best_block(&self) -> Result<Block, StoreError>;

    /// Canonical block at `number`, if any.
    fn block_by_number(&self, number: u64) -> Result<Option<Block>, StoreError>;

    /// Block with the given header hash, if known.
    fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, StoreError>;

    /// Total difficulty of the chain ending at `hash`.
    fn total_difficulty(&self, hash: &Hash256) -> Result<Option<TotalDifficulty>, StoreError>;

    /// Hash of block 0.
    fn genesis_hash(&self) -> Result<Hash256, StoreError> {
        self.block_by_number(0)?
            .map(|b| b.hash())
            .ok_or_else(|| StoreError::NotFound("genesis".into()))
    }

    /// Total difficulty of the best chain.
    fn best_total_difficulty(&self) -> Result<TotalDifficulty, StoreError> {
        let best = self.best_block()?;
        Ok(self.total_difficulty(&best.hash())?.unwrap_or_default())
    }

    /// Header with the given hash, if known.
    fn header_by_hash(&self, hash: &Hash256) -> Result<Option<BlockHeader>, StoreError> {
        Ok(self.block_by_hash(hash)?.map(|b| b.header))
    }

    /// Canonical header at `number`, if any.
    fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>, StoreError> {
        Ok(self.block_by_number(number)?.map(|b| b.header))
    }

    /// Receipts of the block with the given hash. Stores without receipt
    /// data return `None`.
    fn receipts(&self, _hash: &Hash256) -> Result<Option<Vec<Receipt>>, StoreError> {
        Ok(None)
    }

    /// Raw state node keyed by its content hash.
    fn state_node(&self, _hash: &Hash256) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }
}

/// A node known to discovery, not necessarily connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    pub id: NodeId,
    /// Transport address, opaque to the sync engine.
    pub address: String,
    /// Last total difficulty this node was seen advertising.
    pub total_difficulty: Option<TotalDifficulty>,
}

/// Predicate used to filter discovery results.
pub type NodePredicate<'a> = &'a (dyn Fn(&NodeHandle) -> bool + Send + Sync);

/// Source of candidate nodes for the peer pool.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Up to `limit` known nodes matching `predicate`, best first.
    async fn nodes(
        &self,
        predicate: NodePredicate<'_>,
        limit: usize,
    ) -> Result<Vec<NodeHandle>, DiscoveryError>;
}

/// Opens an outbound connection. Completion is reported asynchronously by
/// the transport registering the new connection with the pool.
pub trait Dialer: Send + Sync {
    fn connect(&self, node: &NodeHandle) -> Result<(), DiscoveryError>;
}

/// Validates a checkpoint header fetched during the handshake.
pub trait HeaderValidator: Send + Sync + fmt::Debug {
    fn validate(&self, header: &BlockHeader) -> Result<(), HeaderRejected>;
}

/// Checkpoint that pins the header hash at a height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHash(pub Hash256);

impl HeaderValidator for ExpectedHash {
    fn validate(&self, header: &BlockHeader) -> Result<(), HeaderRejected> {
        let hash = header.hash();
        if hash == self.0 {
            Ok(())
        } else {
            Err(HeaderRejected(format!(
                "block {} hash {} != expected {}",
                header.number,
                hash.short(),
                self.0.short()
            )))
        }
    }
}
