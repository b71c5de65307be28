//! # keel-network
//! Peer connections, the peer pool and the wire protocol of the Keel sync
//! engine.
//!
//! A [`PeerConnection`] runs the handshake and request bookkeeping for one
//! remote node. The [`PeerPool`] keeps the set of peers sync work is handed
//! to. Neither owns a socket: messages flow through channels so any framed
//! transport can drive them.

pub mod capability;
pub mod config;
pub mod connection;
pub mod extension;
pub mod peer_scoring;
pub mod pending;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod validation;

pub use capability::{Capabilities, ProtocolVersion};
pub use config::{Checkpoint, NetworkConfig};
pub use connection::{BodiesResponse, ConnectionContext, ConnectionEvent, HandshakeState, PeerConnection};
pub use extension::{NodeDataResponse, ReceiptsResponse};
pub use peer_scoring::{PeerScoreBoard, SharedScoreBoard};
pub use pending::Pending;
pub use pool::{PeerPool, PeerRecord, PoolEvent, SyncPeer};
pub use protocol::{DisconnectReason, Message, Status};
pub use scheduler::Scheduler;
