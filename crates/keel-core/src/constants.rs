//! Protocol and sync constants.

use std::time::Duration;

/// Four-byte prefix on every encoded wire message.
///
/// # Examples
///
/// ```
/// use keel_core::constants::MAGIC_BYTES;
/// assert_eq!(&MAGIC_BYTES, b"KEEL");
/// ```
pub const MAGIC_BYTES: [u8; 4] = [0x4B, 0x45, 0x45, 0x4C]; // "KEEL"

/// Network id of the production network.
pub const MAINNET_NETWORK_ID: u64 = 1;
/// Network id of the public test network.
pub const TESTNET_NETWORK_ID: u64 = 3;

/// Number of generations kept above the settled ancestor before the window
/// settles older ones. Also the minimum length of a non-genesis seed chain.
pub const DEFAULT_WINDOW_SIZE: usize = 192;

/// Headers further than `window_size * FAR_AHEAD_FACTOR` above the highest
/// known number are dropped.
pub const FAR_AHEAD_FACTOR: u64 = 128;

/// Maximum headers a peer may be asked for (and we serve) per request.
pub const MAX_HEADERS_PER_REQUEST: usize = 192;
/// Maximum bodies served per request.
pub const MAX_BODIES_PER_REQUEST: usize = 128;
/// Maximum state nodes served per request.
pub const MAX_NODE_DATA_PER_REQUEST: usize = 384;
/// Maximum receipt lists served per request.
pub const MAX_RECEIPTS_PER_REQUEST: usize = 256;

/// Largest block body accepted.
pub const MAX_BLOCK_SIZE: usize = 1_048_576;

/// Maximum wire message size, enough for a full batch of large bodies.
pub const MAX_MESSAGE_SIZE: usize = 16 * MAX_BLOCK_SIZE;

/// Number of peers the pool tries to keep in the active sync set.
pub const DEFAULT_SYNC_PEER_COUNT: usize = 8;
/// Number of connected peers the pool tries to keep.
pub const DEFAULT_MAX_ACTIVE_PEERS: usize = 30;

/// Interval of the pool maintenance pass.
pub const POOL_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3);
/// Interval of the pool activity log.
pub const POOL_LOG_INTERVAL: Duration = Duration::from_secs(30);
/// A busy peer that has not answered within this long is dropped.
pub const PEER_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_spells_keel() {
        assert_eq!(&MAGIC_BYTES, b"KEEL");
    }

    #[test]
    fn message_size_fits_a_body_batch() {
        assert!(MAX_MESSAGE_SIZE >= MAX_BLOCK_SIZE * 8);
    }

    #[test]
    fn header_request_size_matches_window() {
        assert_eq!(MAX_HEADERS_PER_REQUEST, DEFAULT_WINDOW_SIZE);
    }
}
