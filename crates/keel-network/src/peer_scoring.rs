//! Peer reputation.
//!
//! Each node accumulates score from the replies its connections receive.
//! Protocol violations cost a lot, slow or empty replies cost a little and
//! valid data earns a capped bonus. Once the score reaches [`BAN_THRESHOLD`]
//! the node is banned for the board's ban duration and the pool stops
//! selecting it. Scores outlive individual connections so a reconnecting
//! node keeps its history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::error::ProtocolError;
use keel_core::types::NodeId;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Penalty for a reply that breaks the protocol.
pub const PENALTY_PROTOCOL_VIOLATION: i64 = -100;
/// Penalty for a header reply that fails validation.
pub const PENALTY_INVALID_HEADERS: i64 = -50;
/// Penalty for bodies that do not match the requested headers.
pub const PENALTY_INVALID_BODIES: i64 = -50;
/// Penalty for a request left unanswered past the read timeout.
pub const PENALTY_TIMEOUT: i64 = -10;
/// Penalty for an empty but permitted reply.
pub const PENALTY_EMPTY_REPLY: i64 = -5;

/// Score at which a node is banned.
pub const BAN_THRESHOLD: i64 = -200;
/// Penalty for a node on another chain; bans immediately.
pub const PENALTY_WRONG_CHAIN: i64 = BAN_THRESHOLD;
/// Default ban length.
pub const BAN_DURATION: Duration = Duration::from_secs(60 * 60);

/// Bonus for a valid header reply.
pub const BONUS_VALID_HEADERS: i64 = 5;
/// Bonus for a valid, non-empty body reply.
pub const BONUS_VALID_BODIES: i64 = 5;

/// Scores are capped at this value.
const MAX_SCORE: i64 = 100;

/// Score board shared between a node's connections.
pub type SharedScoreBoard = Arc<Mutex<PeerScoreBoard>>;

/// Penalty matching a protocol violation.
pub fn penalty_for(err: &ProtocolError) -> i64 {
    match err {
        ProtocolError::GenesisMismatch
        | ProtocolError::NetworkMismatch { .. }
        | ProtocolError::CheckpointFailed { .. } => PENALTY_WRONG_CHAIN,
        ProtocolError::TooManyHeaders { .. }
        | ProtocolError::EmptyHandshakeReply
        | ProtocolError::EmptyReplyBelowBest { .. }
        | ProtocolError::AnchorMismatch
        | ProtocolError::BadStep { .. }
        | ProtocolError::BrokenLink { .. } => PENALTY_INVALID_HEADERS,
        ProtocolError::TooManyBodies { .. } | ProtocolError::BodyMismatch { .. } => PENALTY_INVALID_BODIES,
        _ => PENALTY_PROTOCOL_VIOLATION,
    }
}

/// Reputation of one node.
#[derive(Debug, Clone, Default)]
pub struct PeerScore {
    /// Cumulative score, negative is bad.
    pub score: i64,
    /// When the node was banned, if it is.
    pub banned_at: Option<Instant>,
    pub penalties: u32,
    pub rewards: u32,
}

/// Reputation of every node we have talked to.
#[derive(Debug)]
pub struct PeerScoreBoard {
    scores: HashMap<NodeId, PeerScore>,
    ban_duration: Duration,
}

impl PeerScoreBoard {
    pub fn new() -> Self {
        Self::with_ban_duration(BAN_DURATION)
    }

    pub fn with_ban_duration(ban_duration: Duration) -> Self {
        Self {
            scores: HashMap::new(),
            ban_duration,
        }
    }

    pub fn shared() -> SharedScoreBoard {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Apply a negative adjustment. Returns `true` if this call banned the node.
    pub fn penalize(&mut self, node: &NodeId, penalty: i64) -> bool {
        let entry = self.scores.entry(*node).or_default();
        if entry.banned_at.is_some() {
            debug!(%node, "score: node already banned");
            return false;
        }
        entry.score = entry.score.saturating_add(penalty);
        entry.penalties = entry.penalties.saturating_add(1);
        debug!(%node, score = entry.score, penalty, "score: penalty applied");

        if entry.score <= BAN_THRESHOLD {
            entry.banned_at = Some(Instant::now());
            warn!(%node, score = entry.score, "score: node banned");
            return true;
        }
        false
    }

    /// Apply a positive adjustment, capped at `MAX_SCORE`.
    pub fn reward(&mut self, node: &NodeId, bonus: i64) {
        let entry = self.scores.entry(*node).or_default();
        entry.score = entry.score.saturating_add(bonus).min(MAX_SCORE);
        entry.rewards = entry.rewards.saturating_add(1);
    }

    pub fn is_banned(&self, node: &NodeId) -> bool {
        self.scores
            .get(node)
            .and_then(|s| s.banned_at)
            .is_some_and(|at| at.elapsed() < self.ban_duration)
    }

    /// Current score, `0` for unknown nodes.
    pub fn score(&self, node: &NodeId) -> i64 {
        self.scores.get(node).map_or(0, |s| s.score)
    }

    /// Lift expired bans, resetting those nodes to zero.
    pub fn unban_expired(&mut self) -> Vec<NodeId> {
        let mut lifted = Vec::new();
        for (node, s) in self.scores.iter_mut() {
            if s.banned_at.is_some_and(|at| at.elapsed() >= self.ban_duration) {
                s.banned_at = None;
                s.score = 0;
                lifted.push(*node);
                info!(%node, "score: ban expired");
            }
        }
        lifted
    }

    pub fn banned_nodes(&self) -> Vec<NodeId> {
        self.scores
            .keys()
            .filter(|node| self.is_banned(node))
            .copied()
            .collect()
    }

    pub fn get(&self, node: &NodeId) -> Option<PeerScore> {
        self.scores.get(node).cloned()
    }

    pub fn forget(&mut self, node: &NodeId) {
        self.scores.remove(node);
    }
}

impl Default for PeerScoreBoard {
    fn default() -> Self {
        Self::new()
    }
}
