//! Wire message types for the Keel sync protocol.
//!
//! Every message is framed as MAGIC_BYTES + bincode payload. The transport
//! below is expected to deliver whole frames.

use keel_core::constants::{MAGIC_BYTES, MAX_MESSAGE_SIZE};
use keel_core::error::CodecError;
use keel_core::types::{Block, BlockBody, BlockHeader, Hash256, HeaderAnchor, Receipt, TotalDifficulty};

/// Why a connection was closed. Sent to the remote before closing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum DisconnectReason {
    /// Local shutdown or explicit request.
    Requested,
    /// The peer broke the protocol or served bad data.
    UselessPeer,
    /// Different network, genesis or protocol version.
    IncompatibleProtocol,
    /// The peer failed a checkpoint and is on another fork.
    WrongFork,
    /// A request stayed unanswered for too long.
    Timeout,
    /// The node is shutting down.
    Shutdown,
    /// The underlying transport went away.
    TransportClosed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::IncompatibleProtocol => "incompatible protocol",
            DisconnectReason::WrongFork => "wrong fork",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::TransportClosed => "transport closed",
        };
        f.write_str(s)
    }
}

/// Handshake status, exchanged once in each direction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct Status {
    pub protocol_version: u8,
    pub network_id: u64,
    pub total_difficulty: TotalDifficulty,
    pub best_hash: Hash256,
    pub genesis_hash: Hash256,
}

/// Header query. `hash` set means hash-anchored and `number` is ignored.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetHeaders {
    pub number: u64,
    pub hash: Option<Hash256>,
    pub max_headers: u32,
    pub skip: u64,
    pub reverse: bool,
}

impl GetHeaders {
    pub fn new(anchor: HeaderAnchor, max_headers: usize, skip: u64, reverse: bool) -> Self {
        let (number, hash) = match anchor {
            HeaderAnchor::Number(n) => (n, None),
            HeaderAnchor::Hash(h) => (0, Some(h)),
        };
        Self {
            number,
            hash,
            max_headers: u32::try_from(max_headers).unwrap_or(u32::MAX),
            skip,
            reverse,
        }
    }

    pub fn anchor(&self) -> HeaderAnchor {
        match self.hash {
            Some(h) => HeaderAnchor::Hash(h),
            None => HeaderAnchor::Number(self.number),
        }
    }
}

/// A message on a sync connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub enum Message {
    Status(Status),
    GetHeaders(GetHeaders),
    Headers(Vec<BlockHeader>),
    GetBodies(Vec<Hash256>),
    Bodies(Vec<BlockBody>),
    /// A freshly produced block with the sender's total difficulty.
    NewBlock { block: Block, total_difficulty: TotalDifficulty },
    /// Announced `(hash, number)` pairs.
    NewBlockHashes(Vec<(Hash256, u64)>),
    GetNodeData(Vec<Hash256>),
    NodeData(Vec<Vec<u8>>),
    GetReceipts(Vec<Hash256>),
    Receipts(Vec<Vec<Receipt>>),
    Ping(u64),
    Pong(u64),
    Disconnect(DisconnectReason),
}

impl Message {
    /// Short name for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Status(_) => "status",
            Message::GetHeaders(_) => "get_headers",
            Message::Headers(_) => "headers",
            Message::GetBodies(_) => "get_bodies",
            Message::Bodies(_) => "bodies",
            Message::NewBlock { .. } => "new_block",
            Message::NewBlockHashes(_) => "new_block_hashes",
            Message::GetNodeData(_) => "get_node_data",
            Message::NodeData(_) => "node_data",
            Message::GetReceipts(_) => "get_receipts",
            Message::Receipts(_) => "receipts",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Disconnect(_) => "disconnect",
        }
    }

    /// Whether this message belongs to the state-sync extension.
    pub fn is_state_sync(&self) -> bool {
        matches!(
            self,
            Message::GetNodeData(_) | Message::NodeData(_) | Message::GetReceipts(_) | Message::Receipts(_)
        )
    }

    /// Encode as MAGIC_BYTES + bincode payload.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let total_size = MAGIC_BYTES.len() + payload.len();
        if total_size > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge { size: total_size });
        }
        let mut buf = Vec::with_capacity(total_size);
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a frame produced by [`Message::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge { size: data.len() });
        }
        let Some(payload) = data.strip_prefix(&MAGIC_BYTES[..]) else {
            return Err(CodecError::BadMagic);
        };
        let (msg, _): (Self, usize) = bincode::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(msg)
    }
}
