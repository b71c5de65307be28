//! Error types for the Keel sync engine.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("empty seed chain")] EmptyInitChain,
    #[error("seed chain too short: {len} < {min} and not rooted at genesis")] ShortInitChain { len: usize, min: usize },
    #[error("seed chain does not link at block {number}")] UnlinkedInitChain { number: u64 },
    #[error("store: {0}")] Store(#[from] StoreError),
}

/// A peer broke the sync protocol. Always fatal to that one connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("too many headers: {got} > {max}")] TooManyHeaders { got: usize, max: usize },
    #[error("empty reply to the handshake header request")] EmptyHandshakeReply,
    #[error("empty reply for block {anchor} below claimed best {best}")] EmptyReplyBelowBest { anchor: u64, best: u64 },
    #[error("first header does not match the request anchor")] AnchorMismatch,
    #[error("header {index} breaks the requested number step")] BadStep { index: usize },
    #[error("header {index} does not link to its neighbour")] BrokenLink { index: usize },
    #[error("too many bodies: {got} > {max}")] TooManyBodies { got: usize, max: usize },
    #[error("body {index} does not match the requested header")] BodyMismatch { index: usize },
    #[error("empty {0} reply")] EmptyReply(&'static str),
    #[error("too many {kind} entries: {got} > {max}")] TooManyEntries { kind: &'static str, got: usize, max: usize },
    #[error("{kind} entry {index} was not requested")] UnrequestedEntry { kind: &'static str, index: usize },
    #[error("unsolicited {0} response")] Unsolicited(&'static str),
    #[error("genesis mismatch")] GenesisMismatch,
    #[error("network mismatch: ours {ours}, theirs {theirs}")] NetworkMismatch { ours: u64, theirs: u64 },
    #[error("checkpoint {number} failed: {reason}")] CheckpointFailed { number: u64, reason: String },
    #[error("message {0} not supported by negotiated version")] UnsupportedMessage(&'static str),
    #[error("status received twice")] DuplicateStatus,
    #[error("unsupported protocol version {0}")] UnsupportedVersion(u8),
}

/// Why a local request could not be issued or completed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("{0} retrieval already in flight")] Busy(&'static str),
    #[error("request cancelled")] Cancelled,
    #[error("peer disconnected")] Disconnected,
    #[error("handshake not complete")] NotReady,
    #[error("{0} not supported by negotiated version")] Unsupported(&'static str),
    #[error("empty request")] EmptyRequest,
}

/// A checkpoint validator refused a header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("header rejected: {0}")]
pub struct HeaderRejected(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")] NotFound(String),
    #[error("backend: {0}")] Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery unavailable: {0}")] Unavailable(String),
    #[error("dial failed: {0}")] Dial(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic bytes")] BadMagic,
    #[error("message too large: {size}")] TooLarge { size: usize },
    #[error("encode: {0}")] Encode(String),
    #[error("decode: {0}")] Decode(String),
}

#[derive(Error, Debug)]
pub enum KeelError {
    #[error(transparent)] Window(#[from] WindowError),
    #[error(transparent)] Protocol(#[from] ProtocolError),
    #[error(transparent)] Request(#[from] RequestError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Discovery(#[from] DiscoveryError),
    #[error(transparent)] Codec(#[from] CodecError),
}
