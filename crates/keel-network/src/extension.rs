//! State-sync extension: node data and receipts retrieval.
//!
//! Present on a connection only when the negotiated version enables it.
//! Each retrieval kind allows one request in flight, independent of header
//! and body retrieval.

use keel_core::constants::{MAX_NODE_DATA_PER_REQUEST, MAX_RECEIPTS_PER_REQUEST};
use keel_core::error::{ProtocolError, RequestError};
use keel_core::types::{BlockHeader, Hash256, Receipt};

use crate::capability::Capabilities;
use crate::pending::{Pending, Resolver, pending};
use crate::protocol::Message;
use crate::validation;

/// Node data values keyed by their content hash, in request order.
pub type NodeDataResponse = Vec<(Hash256, Vec<u8>)>;
/// Receipts paired with the header they belong to.
pub type ReceiptsResponse = Vec<(BlockHeader, Vec<Receipt>)>;

#[derive(Debug)]
struct NodeDataSlot {
    hashes: Vec<Hash256>,
    resolver: Resolver<NodeDataResponse>,
}

#[derive(Debug)]
struct ReceiptsSlot {
    headers: Vec<BlockHeader>,
    resolver: Resolver<ReceiptsResponse>,
}

#[derive(Debug)]
pub(crate) struct StateSync {
    caps: Capabilities,
    node_data: Option<NodeDataSlot>,
    receipts: Option<ReceiptsSlot>,
}

impl StateSync {
    /// `None` when `caps` enable nothing from this extension.
    pub(crate) fn new(caps: Capabilities) -> Option<Self> {
        caps.has_state_sync().then_some(Self {
            caps,
            node_data: None,
            receipts: None,
        })
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.node_data.is_some() || self.receipts.is_some()
    }

    /// Build a `GET_NODE_DATA` request. Extra hashes beyond the per-request
    /// limit are left for the caller to ask again.
    pub(crate) fn request_node_data(
        &mut self,
        mut hashes: Vec<Hash256>,
    ) -> Result<(Message, Pending<NodeDataResponse>), RequestError> {
        if !self.caps.node_data {
            return Err(RequestError::Unsupported("node data"));
        }
        if self.node_data.is_some() {
            return Err(RequestError::Busy("node data"));
        }
        if hashes.is_empty() {
            return Err(RequestError::EmptyRequest);
        }
        hashes.truncate(MAX_NODE_DATA_PER_REQUEST);
        let (resolver, fut) = pending();
        let msg = Message::GetNodeData(hashes.clone());
        self.node_data = Some(NodeDataSlot { hashes, resolver });
        Ok((msg, fut))
    }

    pub(crate) fn on_node_data(&mut self, values: Vec<Vec<u8>>) -> Result<usize, ProtocolError> {
        let slot = self.node_data.take().ok_or(ProtocolError::Unsolicited("node data"))?;
        let hashes = validation::validate_node_data(&slot.hashes, &values)?;
        let count = values.len();
        slot.resolver.resolve(hashes.into_iter().zip(values).collect());
        Ok(count)
    }

    pub(crate) fn request_receipts(
        &mut self,
        mut headers: Vec<BlockHeader>,
    ) -> Result<(Message, Pending<ReceiptsResponse>), RequestError> {
        if !self.caps.receipts {
            return Err(RequestError::Unsupported("receipts"));
        }
        if self.receipts.is_some() {
            return Err(RequestError::Busy("receipts"));
        }
        if headers.is_empty() {
            return Err(RequestError::EmptyRequest);
        }
        headers.truncate(MAX_RECEIPTS_PER_REQUEST);
        let (resolver, fut) = pending();
        let msg = Message::GetReceipts(headers.iter().map(BlockHeader::hash).collect());
        self.receipts = Some(ReceiptsSlot { headers, resolver });
        Ok((msg, fut))
    }

    pub(crate) fn on_receipts(&mut self, lists: Vec<Vec<Receipt>>) -> Result<usize, ProtocolError> {
        let slot = self.receipts.take().ok_or(ProtocolError::Unsolicited("receipts"))?;
        validation::validate_receipts(&slot.headers, &lists)?;
        let count = lists.len();
        slot.resolver.resolve(slot.headers.into_iter().zip(lists).collect());
        Ok(count)
    }

    /// Drop both slots, cancelling their waiters.
    pub(crate) fn cancel_all(&mut self) {
        self.node_data = None;
        self.receipts = None;
    }
}
