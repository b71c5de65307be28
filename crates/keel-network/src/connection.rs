//! A sync connection to one remote node.
//!
//! The connection owns the handshake and the request/response bookkeeping
//! for a single peer. Transport is abstracted as an outbound message channel
//! plus [`PeerConnection::handle_message`] for inbound messages, so the same
//! state machine runs over TCP framing or in-process loopback.
//!
//! Handshake: `Init -> StatusSent -> HashConstraintsCheck -> Succeeded`.
//! After the status exchange we fetch the header of the peer's advertised
//! best hash, then every configured checkpoint at or below that height. Any
//! failure moves to `Failed` and closes the connection.
//!
//! At most one header or body retrieval is in flight at a time. Replies are
//! validated against the outstanding request; a bad reply is a protocol
//! violation that penalizes the node and closes the connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::constants::{
    MAX_BODIES_PER_REQUEST, MAX_HEADERS_PER_REQUEST, MAX_NODE_DATA_PER_REQUEST, MAX_RECEIPTS_PER_REQUEST,
};
use keel_core::error::{ProtocolError, RequestError, StoreError};
use keel_core::traits::BlockStore;
use keel_core::types::{Block, BlockBody, BlockHeader, Hash256, HeaderAnchor, NodeId, Receipt, TotalDifficulty};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::capability::{Capabilities, ProtocolVersion};
use crate::config::{Checkpoint, NetworkConfig};
use crate::extension::{NodeDataResponse, ReceiptsResponse, StateSync};
use crate::peer_scoring::{
    BONUS_VALID_BODIES, BONUS_VALID_HEADERS, PENALTY_EMPTY_REPLY, PENALTY_TIMEOUT, SharedScoreBoard, penalty_for,
};
use crate::pending::{Pending, Resolver, pending};
use crate::pool::{PeerRecord, SyncPeer};
use crate::protocol::{DisconnectReason, GetHeaders, Message, Status};
use crate::validation::{self, ReplyContext};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    StatusSent,
    HashConstraintsCheck,
    Succeeded,
    Failed,
}

/// Notifications from connections to whoever drives them.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake finished; the peer can take sync work.
    Ready {
        peer: NodeId,
        total_difficulty: TotalDifficulty,
        best_number: u64,
    },
    /// The connection closed. `unfinished` holds headers whose bodies were
    /// requested but never delivered.
    Disconnected {
        peer: NodeId,
        reason: DisconnectReason,
        unfinished: Vec<BlockHeader>,
    },
    NewBlock {
        peer: NodeId,
        block: Block,
        total_difficulty: TotalDifficulty,
    },
    NewBlockHashes {
        peer: NodeId,
        announced: Vec<(Hash256, u64)>,
    },
}

/// Outcome of a body request: paired blocks in request order plus the
/// headers whose bodies did not arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodiesResponse {
    pub blocks: Vec<Block>,
    pub missing: Vec<BlockHeader>,
}

/// Everything a connection needs from the node, shared by all connections.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<NetworkConfig>,
    pub store: Arc<dyn BlockStore>,
    pub scores: SharedScoreBoard,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

#[derive(Debug)]
enum HeaderPurpose {
    Handshake,
    Checkpoint(Checkpoint),
    External,
    Announced,
}

#[derive(Debug)]
struct HeaderSlot {
    request: GetHeaders,
    purpose: HeaderPurpose,
    /// `None` while queued behind the status message.
    sent_at: Option<Instant>,
    resolver: Option<Resolver<Vec<BlockHeader>>>,
}

#[derive(Debug)]
struct BodySlot {
    headers: Vec<BlockHeader>,
    overflow: Vec<BlockHeader>,
    sent_at: Instant,
    resolver: Resolver<BodiesResponse>,
}

#[derive(Debug, Clone)]
struct Remote {
    status: Status,
    version: ProtocolVersion,
    best_number: Option<u64>,
}

#[derive(Debug)]
struct State {
    handshake: HandshakeState,
    headers: Option<HeaderSlot>,
    bodies: Option<BodySlot>,
    state_sync: Option<StateSync>,
    remote: Option<Remote>,
    checkpoints: VecDeque<Checkpoint>,
    /// The best-hash lookup waits for an external header request to finish.
    lookup_deferred: bool,
    latency: Option<Duration>,
    ping: Option<(u64, Instant)>,
    closed: Option<DisconnectReason>,
}

impl State {
    fn new() -> Self {
        Self {
            handshake: HandshakeState::Init,
            headers: None,
            bodies: None,
            state_sync: None,
            remote: None,
            checkpoints: VecDeque::new(),
            lookup_deferred: false,
            latency: None,
            ping: None,
            closed: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.closed.is_none()
            && self.handshake == HandshakeState::Succeeded
            && self.headers.is_none()
            && self.bodies.is_none()
    }

    fn busy_for(&self) -> Option<Duration> {
        let header_sent = self.headers.as_ref().and_then(|s| s.sent_at);
        let body_sent = self.bodies.as_ref().map(|s| s.sent_at);
        header_sent.into_iter().chain(body_sent).min().map(|t| t.elapsed())
    }

    fn observe_latency(&mut self, sample: Duration) {
        self.latency = Some(match self.latency {
            None => sample,
            Some(prev) => (prev * 4 + sample) / 5,
        });
    }

    fn capabilities(&self) -> Capabilities {
        self.remote
            .as_ref()
            .map_or(Capabilities::BASE, |r| r.version.capabilities())
    }
}

/// One remote peer, shared between the transport task, the pool and the
/// sync driver.
pub struct PeerConnection {
    id: NodeId,
    ctx: ConnectionContext,
    outbound: mpsc::UnboundedSender<Message>,
    state: Mutex<State>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("handshake", &self.state.lock().handshake)
            .finish()
    }
}

impl PeerConnection {
    pub fn new(id: NodeId, ctx: ConnectionContext, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            ctx,
            outbound,
            state: Mutex::new(State::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.state.lock().handshake
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.state.lock().remote.as_ref().map(|r| r.version)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities()
    }

    pub fn peer_total_difficulty(&self) -> Option<TotalDifficulty> {
        self.state.lock().remote.as_ref().map(|r| r.status.total_difficulty)
    }

    pub fn peer_best_number(&self) -> Option<u64> {
        self.state.lock().remote.as_ref().and_then(|r| r.best_number)
    }

    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    // ---------------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------------

    /// Send our status and any header request queued before it.
    pub fn send_status(&self) -> Result<(), StoreError> {
        let status = self.local_status()?;
        let mut st = self.state.lock();
        self.send_status_locked(&mut st, status);
        Ok(())
    }

    fn local_status(&self) -> Result<Status, StoreError> {
        let store = &self.ctx.store;
        Ok(Status {
            protocol_version: self.ctx.config.protocol_version.as_wire(),
            network_id: self.ctx.config.network_id,
            total_difficulty: store.best_total_difficulty()?,
            best_hash: store.best_block()?.hash(),
            genesis_hash: store.genesis_hash()?,
        })
    }

    fn send_status_locked(&self, st: &mut State, status: Status) {
        if st.handshake != HandshakeState::Init || st.closed.is_some() {
            return;
        }
        self.send(Message::Status(status));
        st.handshake = HandshakeState::StatusSent;
        debug!(peer = %self.id, "conn: status sent");
        if let Some(slot) = st.headers.as_mut() {
            if slot.sent_at.is_none() {
                self.send(Message::GetHeaders(slot.request.clone()));
                slot.sent_at = Some(Instant::now());
            }
        }
    }

    fn on_status(&self, remote: Status) {
        let local = match self.local_status() {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %self.id, error = %e, "conn: cannot build local status");
                self.drop_connection(DisconnectReason::Requested);
                return;
            }
        };
        let mut st = self.state.lock();
        if st.closed.is_some() {
            return;
        }
        if st.remote.is_some() {
            return self.violation(&mut st, ProtocolError::DuplicateStatus);
        }
        if st.handshake == HandshakeState::Init {
            self.send_status_locked(&mut st, local.clone());
        }
        if remote.network_id != local.network_id {
            let err = ProtocolError::NetworkMismatch {
                ours: local.network_id,
                theirs: remote.network_id,
            };
            return self.violation(&mut st, err);
        }
        if remote.genesis_hash != local.genesis_hash {
            return self.violation(&mut st, ProtocolError::GenesisMismatch);
        }
        let Some(version) = self.ctx.config.protocol_version.negotiate(remote.protocol_version) else {
            return self.violation(&mut st, ProtocolError::UnsupportedVersion(remote.protocol_version));
        };

        debug!(
            peer = %self.id,
            %version,
            td = remote.total_difficulty,
            best = %remote.best_hash.short(),
            "conn: status received"
        );
        st.state_sync = StateSync::new(version.capabilities());
        st.remote = Some(Remote {
            status: remote,
            version,
            best_number: None,
        });
        self.start_best_lookup(&mut st);
    }

    /// Fetch the header of the peer's advertised best hash.
    fn start_best_lookup(&self, st: &mut State) {
        let Some(best_hash) = st.remote.as_ref().map(|r| r.status.best_hash) else {
            return;
        };
        if st.headers.is_some() {
            st.lookup_deferred = true;
            return;
        }
        let request = GetHeaders::new(HeaderAnchor::Hash(best_hash), 1, 0, false);
        self.issue_headers(st, request, HeaderPurpose::Handshake, None);
    }

    fn next_checkpoint(&self, st: &mut State) {
        if let Some(cp) = st.checkpoints.pop_front() {
            let request = GetHeaders::new(HeaderAnchor::Number(cp.number), 1, 0, false);
            self.issue_headers(st, request, HeaderPurpose::Checkpoint(cp), None);
            return;
        }
        st.handshake = HandshakeState::Succeeded;
        let Some(remote) = st.remote.as_ref() else { return };
        let best_number = remote.best_number.unwrap_or_default();
        info!(
            peer = %self.id,
            version = %remote.version,
            td = remote.status.total_difficulty,
            best = best_number,
            "conn: handshake complete"
        );
        self.emit(ConnectionEvent::Ready {
            peer: self.id,
            total_difficulty: remote.status.total_difficulty,
            best_number,
        });
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Process one message from the remote.
    pub fn handle_message(&self, msg: Message) {
        trace!(peer = %self.id, kind = msg.kind(), "conn: inbound");
        if let Message::Status(status) = msg {
            return self.on_status(status);
        }

        let mut st = self.state.lock();
        if st.closed.is_some() {
            return;
        }
        if !st.capabilities().allows(&msg) {
            return self.violation(&mut st, ProtocolError::UnsupportedMessage(msg.kind()));
        }

        match msg {
            Message::Status(_) => {}
            Message::GetHeaders(req) => self.serve_headers(&req),
            Message::Headers(headers) => self.on_headers(&mut st, headers),
            Message::GetBodies(hashes) => self.serve_bodies(&hashes),
            Message::Bodies(bodies) => self.on_bodies(&mut st, bodies),
            Message::NewBlock {
                block,
                total_difficulty,
            } => self.on_new_block(&mut st, block, total_difficulty),
            Message::NewBlockHashes(announced) => self.on_new_block_hashes(&mut st, announced),
            Message::GetNodeData(hashes) => self.serve_node_data(&hashes),
            Message::NodeData(values) => {
                let result = match st.state_sync.as_mut() {
                    Some(ext) => ext.on_node_data(values),
                    None => Err(ProtocolError::Unsolicited("node data")),
                };
                self.on_extension_reply(&mut st, result);
            }
            Message::GetReceipts(hashes) => self.serve_receipts(&hashes),
            Message::Receipts(lists) => {
                let result = match st.state_sync.as_mut() {
                    Some(ext) => ext.on_receipts(lists),
                    None => Err(ProtocolError::Unsolicited("receipts")),
                };
                self.on_extension_reply(&mut st, result);
            }
            Message::Ping(nonce) => self.send(Message::Pong(nonce)),
            Message::Pong(nonce) => {
                if let Some((expected, sent_at)) = st.ping {
                    if expected == nonce {
                        st.ping = None;
                        st.observe_latency(sent_at.elapsed());
                    }
                }
            }
            Message::Disconnect(reason) => self.close(&mut st, reason, false),
        }
    }

    fn on_headers(&self, st: &mut State, headers: Vec<BlockHeader>) {
        let Some(slot) = st.headers.take() else {
            return self.violation(st, ProtocolError::Unsolicited("headers"));
        };
        let Some(sent_at) = slot.sent_at else {
            return self.violation(st, ProtocolError::Unsolicited("headers"));
        };
        let ctx = ReplyContext {
            handshake: matches!(slot.purpose, HeaderPurpose::Handshake),
            peer_best: st.remote.as_ref().and_then(|r| r.best_number),
        };
        if let Err(e) = validation::validate_headers(&headers, &slot.request, ctx) {
            // Any bad checkpoint reply means the peer is on another fork.
            let e = match &slot.purpose {
                HeaderPurpose::Checkpoint(cp) => ProtocolError::CheckpointFailed {
                    number: cp.number,
                    reason: e.to_string(),
                },
                _ => e,
            };
            return self.violation(st, e);
        }
        st.observe_latency(sent_at.elapsed());
        self.ctx.scores.lock().reward(&self.id, BONUS_VALID_HEADERS);
        debug!(peer = %self.id, count = headers.len(), anchor = %slot.request.anchor(), "conn: headers received");

        match slot.purpose {
            HeaderPurpose::Handshake => {
                let best = headers.first().map_or(0, |h| h.number);
                if let Some(remote) = st.remote.as_mut() {
                    remote.best_number = Some(best);
                }
                st.handshake = HandshakeState::HashConstraintsCheck;
                st.checkpoints = self
                    .ctx
                    .config
                    .checkpoints
                    .iter()
                    .filter(|c| c.number <= best)
                    .cloned()
                    .collect();
                self.next_checkpoint(st);
            }
            HeaderPurpose::Checkpoint(cp) => {
                let verdict = match headers.first() {
                    Some(header) => cp.validator.validate(header).map_err(|r| r.0),
                    None => Err("header missing".to_string()),
                };
                if let Err(reason) = verdict {
                    let err = ProtocolError::CheckpointFailed {
                        number: cp.number,
                        reason,
                    };
                    return self.violation(st, err);
                }
                self.next_checkpoint(st);
            }
            HeaderPurpose::Announced => {
                if let (Some(remote), Some(h)) = (st.remote.as_mut(), headers.first()) {
                    remote.best_number = remote.best_number.max(Some(h.number));
                }
                if let Some(resolver) = slot.resolver {
                    resolver.resolve(headers);
                }
            }
            HeaderPurpose::External => {
                if let Some(resolver) = slot.resolver {
                    resolver.resolve(headers);
                }
            }
        }

        if st.lookup_deferred && st.headers.is_none() && st.closed.is_none() {
            st.lookup_deferred = false;
            self.start_best_lookup(st);
        }
    }

    fn on_bodies(&self, st: &mut State, bodies: Vec<BlockBody>) {
        let Some(slot) = st.bodies.take() else {
            return self.violation(st, ProtocolError::Unsolicited("bodies"));
        };
        if let Err(e) = validation::match_bodies(&slot.headers, &bodies) {
            return self.violation(st, e);
        }
        st.observe_latency(slot.sent_at.elapsed());
        {
            let mut scores = self.ctx.scores.lock();
            if bodies.is_empty() {
                scores.penalize(&self.id, PENALTY_EMPTY_REPLY);
            } else {
                scores.reward(&self.id, BONUS_VALID_BODIES);
            }
        }
        debug!(peer = %self.id, got = bodies.len(), asked = slot.headers.len(), "conn: bodies received");

        let mut headers = slot.headers;
        let mut missing = headers.split_off(bodies.len());
        missing.extend(slot.overflow);
        let blocks = headers
            .into_iter()
            .zip(bodies)
            .map(|(header, body)| Block { header, body })
            .collect();
        slot.resolver.resolve(BodiesResponse { blocks, missing });
    }

    fn on_extension_reply(&self, st: &mut State, result: Result<usize, ProtocolError>) {
        match result {
            Ok(count) => {
                debug!(peer = %self.id, count, "conn: state sync reply");
                self.ctx.scores.lock().reward(&self.id, BONUS_VALID_BODIES);
            }
            Err(e) => self.violation(st, e),
        }
    }

    fn on_new_block(&self, st: &mut State, block: Block, total_difficulty: TotalDifficulty) {
        if st.handshake != HandshakeState::Succeeded {
            debug!(peer = %self.id, "conn: announcement before handshake ignored");
            return;
        }
        if let Some(remote) = st.remote.as_mut() {
            remote.status.total_difficulty = remote.status.total_difficulty.max(total_difficulty);
            remote.best_number = remote.best_number.max(Some(block.number()));
        }
        self.emit(ConnectionEvent::NewBlock {
            peer: self.id,
            block,
            total_difficulty,
        });
    }

    fn on_new_block_hashes(&self, st: &mut State, announced: Vec<(Hash256, u64)>) {
        if st.handshake != HandshakeState::Succeeded || announced.is_empty() {
            return;
        }
        if let Some(remote) = st.remote.as_mut() {
            let highest = announced.iter().map(|(_, n)| *n).max();
            remote.best_number = remote.best_number.max(highest);
        }
        self.emit(ConnectionEvent::NewBlockHashes {
            peer: self.id,
            announced,
        });
    }

    // ---------------------------------------------------------------------
    // Outbound requests
    // ---------------------------------------------------------------------

    fn check_retrieval(&self, st: &State) -> Result<(), RequestError> {
        if st.closed.is_some() || st.handshake == HandshakeState::Failed {
            return Err(RequestError::Disconnected);
        }
        if st.headers.is_some() {
            warn!(peer = %self.id, "conn: header request while another retrieval is in flight");
            return Err(RequestError::Busy("header"));
        }
        if st.bodies.is_some() {
            warn!(peer = %self.id, "conn: request while a body retrieval is in flight");
            return Err(RequestError::Busy("body"));
        }
        Ok(())
    }

    fn issue_headers(
        &self,
        st: &mut State,
        request: GetHeaders,
        purpose: HeaderPurpose,
        resolver: Option<Resolver<Vec<BlockHeader>>>,
    ) {
        let sent_at = if st.handshake == HandshakeState::Init {
            None
        } else {
            self.send(Message::GetHeaders(request.clone()));
            Some(Instant::now())
        };
        st.headers = Some(HeaderSlot {
            request,
            purpose,
            sent_at,
            resolver,
        });
    }

    /// Ask for up to `max_headers` headers. Before our status is sent the
    /// request is queued and goes out right after it.
    pub fn request_headers(
        &self,
        anchor: HeaderAnchor,
        max_headers: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<Pending<Vec<BlockHeader>>, RequestError> {
        if max_headers == 0 {
            return Err(RequestError::EmptyRequest);
        }
        let mut st = self.state.lock();
        self.check_retrieval(&st)?;
        let request = GetHeaders::new(anchor, max_headers.min(MAX_HEADERS_PER_REQUEST), skip, reverse);
        let (resolver, fut) = pending();
        self.issue_headers(&mut st, request, HeaderPurpose::External, Some(resolver));
        Ok(fut)
    }

    /// Fetch the header of an announced block hash.
    pub fn request_announced_header(&self, hash: Hash256) -> Result<Pending<Vec<BlockHeader>>, RequestError> {
        let mut st = self.state.lock();
        if st.handshake != HandshakeState::Succeeded && st.closed.is_none() {
            return Err(RequestError::NotReady);
        }
        self.check_retrieval(&st)?;
        let request = GetHeaders::new(HeaderAnchor::Hash(hash), 1, 0, false);
        let (resolver, fut) = pending();
        self.issue_headers(&mut st, request, HeaderPurpose::Announced, Some(resolver));
        Ok(fut)
    }

    /// Ask for the bodies of `headers`. At most `MAX_BODIES_PER_REQUEST` are
    /// requested; the rest come back in [`BodiesResponse::missing`].
    pub fn request_bodies(&self, mut headers: Vec<BlockHeader>) -> Result<Pending<BodiesResponse>, RequestError> {
        if headers.is_empty() {
            return Err(RequestError::EmptyRequest);
        }
        let mut st = self.state.lock();
        if st.handshake != HandshakeState::Succeeded && st.closed.is_none() {
            return Err(RequestError::NotReady);
        }
        self.check_retrieval(&st)?;
        let overflow = headers.split_off(headers.len().min(MAX_BODIES_PER_REQUEST));
        self.send(Message::GetBodies(headers.iter().map(BlockHeader::hash).collect()));
        let (resolver, fut) = pending();
        st.bodies = Some(BodySlot {
            headers,
            overflow,
            sent_at: Instant::now(),
            resolver,
        });
        Ok(fut)
    }

    fn with_state_sync<T>(
        &self,
        f: impl FnOnce(&mut StateSync) -> Result<(Message, T), RequestError>,
    ) -> Result<T, RequestError> {
        let mut st = self.state.lock();
        if st.closed.is_some() {
            return Err(RequestError::Disconnected);
        }
        if st.handshake != HandshakeState::Succeeded {
            return Err(RequestError::NotReady);
        }
        let ext = st
            .state_sync
            .as_mut()
            .ok_or(RequestError::Unsupported("state sync"))?;
        let (msg, out) = f(ext)?;
        self.send(msg);
        Ok(out)
    }

    /// Ask for state nodes by content hash. Needs protocol V2.
    pub fn request_node_data(&self, hashes: Vec<Hash256>) -> Result<Pending<NodeDataResponse>, RequestError> {
        self.with_state_sync(|ext| ext.request_node_data(hashes))
    }

    /// Ask for the receipts of `headers`. Needs protocol V2.
    pub fn request_receipts(&self, headers: Vec<BlockHeader>) -> Result<Pending<ReceiptsResponse>, RequestError> {
        self.with_state_sync(|ext| ext.request_receipts(headers))
    }

    /// Liveness probe; the pong updates the latency estimate.
    pub fn ping(&self) {
        let mut st = self.state.lock();
        if st.closed.is_some() {
            return;
        }
        let nonce = rand::random();
        st.ping = Some((nonce, Instant::now()));
        self.send(Message::Ping(nonce));
    }

    // ---------------------------------------------------------------------
    // Serving
    // ---------------------------------------------------------------------

    fn serve_headers(&self, req: &GetHeaders) {
        let headers = self.collect_headers(req).unwrap_or_else(|e| {
            warn!(peer = %self.id, error = %e, "conn: store error serving headers");
            Vec::new()
        });
        self.send(Message::Headers(headers));
    }

    fn collect_headers(&self, req: &GetHeaders) -> Result<Vec<BlockHeader>, StoreError> {
        let store = &self.ctx.store;
        let max = (req.max_headers as usize).min(MAX_HEADERS_PER_REQUEST);
        let start = match req.anchor() {
            HeaderAnchor::Number(n) => store.header_by_number(n)?,
            HeaderAnchor::Hash(h) => store.header_by_hash(&h)?,
        };
        let Some(start) = start.filter(|_| max > 0) else {
            return Ok(Vec::new());
        };
        let step = req.skip.saturating_add(1);
        let mut number = start.number;
        let mut headers = vec![start];
        while headers.len() < max {
            let next = if req.reverse {
                number.checked_sub(step)
            } else {
                number.checked_add(step)
            };
            let Some(next) = next else { break };
            let Some(header) = store.header_by_number(next)? else { break };
            number = next;
            headers.push(header);
        }
        Ok(headers)
    }

    fn serve_bodies(&self, hashes: &[Hash256]) {
        let mut bodies = Vec::new();
        for hash in hashes.iter().take(MAX_BODIES_PER_REQUEST) {
            match self.ctx.store.block_by_hash(hash) {
                Ok(Some(block)) => bodies.push(block.body),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %self.id, error = %e, "conn: store error serving bodies");
                    break;
                }
            }
        }
        self.send(Message::Bodies(bodies));
    }

    fn serve_node_data(&self, hashes: &[Hash256]) {
        let values = hashes
            .iter()
            .take(MAX_NODE_DATA_PER_REQUEST)
            .filter_map(|h| self.ctx.store.state_node(h).ok().flatten())
            .collect();
        self.send(Message::NodeData(values));
    }

    fn serve_receipts(&self, hashes: &[Hash256]) {
        let mut lists: Vec<Vec<Receipt>> = Vec::new();
        for hash in hashes.iter().take(MAX_RECEIPTS_PER_REQUEST) {
            match self.ctx.store.receipts(hash) {
                Ok(Some(receipts)) => lists.push(receipts),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %self.id, error = %e, "conn: store error serving receipts");
                    break;
                }
            }
        }
        self.send(Message::Receipts(lists));
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Close because the transport went away. Nothing is sent.
    pub fn on_transport_closed(&self) {
        let mut st = self.state.lock();
        self.close(&mut st, DisconnectReason::TransportClosed, false);
    }

    fn violation(&self, st: &mut State, err: ProtocolError) {
        warn!(peer = %self.id, error = %err, "conn: protocol violation");
        self.ctx.scores.lock().penalize(&self.id, penalty_for(&err));
        let reason = match err {
            ProtocolError::GenesisMismatch
            | ProtocolError::NetworkMismatch { .. }
            | ProtocolError::UnsupportedVersion(_) => DisconnectReason::IncompatibleProtocol,
            ProtocolError::CheckpointFailed { .. } => DisconnectReason::WrongFork,
            _ => DisconnectReason::UselessPeer,
        };
        self.close(st, reason, true);
    }

    fn close(&self, st: &mut State, reason: DisconnectReason, notify_remote: bool) {
        if st.closed.is_some() {
            return;
        }
        st.closed = Some(reason);
        if st.handshake != HandshakeState::Succeeded {
            st.handshake = HandshakeState::Failed;
        }
        if notify_remote {
            self.send(Message::Disconnect(reason));
        }
        if reason == DisconnectReason::Timeout {
            self.ctx.scores.lock().penalize(&self.id, PENALTY_TIMEOUT);
        }
        // Dropping the resolvers cancels every waiter.
        st.headers = None;
        st.checkpoints.clear();
        if let Some(ext) = st.state_sync.as_mut() {
            ext.cancel_all();
        }
        let unfinished = st
            .bodies
            .take()
            .map(|slot| {
                let mut headers = slot.headers;
                headers.extend(slot.overflow);
                headers
            })
            .unwrap_or_default();
        info!(peer = %self.id, %reason, unfinished = unfinished.len(), "conn: disconnected");
        self.emit(ConnectionEvent::Disconnected {
            peer: self.id,
            reason,
            unfinished,
        });
    }

    fn send(&self, msg: Message) {
        if self.outbound.send(msg).is_err() {
            trace!(peer = %self.id, "conn: outbound channel closed");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.ctx.events.send(event);
    }
}

impl SyncPeer for PeerConnection {
    fn id(&self) -> NodeId {
        self.id
    }

    fn record(&self) -> PeerRecord {
        let st = self.state.lock();
        let scores = self.ctx.scores.lock();
        PeerRecord {
            id: self.id,
            ready: st.handshake == HandshakeState::Succeeded,
            idle: st.is_idle(),
            closed: st.closed.is_some(),
            total_difficulty: st.remote.as_ref().map(|r| r.status.total_difficulty),
            best_number: st.remote.as_ref().and_then(|r| r.best_number),
            reputation: scores.score(&self.id),
            banned: scores.is_banned(&self.id),
            latency: st.latency,
            busy_for: st.busy_for(),
        }
    }

    fn drop_connection(&self, reason: DisconnectReason) {
        let mut st = self.state.lock();
        self.close(&mut st, reason, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_scoring::PeerScoreBoard;
    use keel_core::chain;
    use keel_core::memory::MemoryStore;
    use keel_core::traits::ExpectedHash;

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    struct Harness {
        conn: PeerConnection,
        wire: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        scores: SharedScoreBoard,
    }

    impl Harness {
        fn new(config: NetworkConfig, local_len: usize) -> Self {
            let store = Arc::new(MemoryStore::synthetic(local_len).unwrap());
            let (events_tx, events) = mpsc::unbounded_channel();
            let (out_tx, wire) = mpsc::unbounded_channel();
            let scores = PeerScoreBoard::shared();
            let ctx = ConnectionContext {
                config: Arc::new(config),
                store,
                scores: scores.clone(),
                events: events_tx,
            };
            Self {
                conn: PeerConnection::new(NodeId::random(), ctx, out_tx),
                wire,
                events,
                scores,
            }
        }

        fn sent(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(m) = self.wire.try_recv() {
                out.push(m);
            }
            out
        }

        fn last_event(&mut self) -> Option<ConnectionEvent> {
            let mut last = None;
            while let Ok(e) = self.events.try_recv() {
                last = Some(e);
            }
            last
        }

        /// Drive the handshake against a remote whose chain is `remote`.
        fn handshake_with(&mut self, remote: &[Block], version: u8) {
            self.conn.send_status().unwrap();
            self.conn.handle_message(Message::Status(remote_status(remote, version)));
            self.sent();
            let best = remote.last().unwrap().header.clone();
            self.conn.handle_message(Message::Headers(vec![best]));
        }
    }

    fn remote_status(remote: &[Block], version: u8) -> Status {
        let best = remote.last().unwrap();
        Status {
            protocol_version: version,
            network_id: NetworkConfig::default().network_id,
            total_difficulty: chain::synthetic_total_difficulty(best.number()),
            best_hash: best.hash(),
            genesis_hash: remote[0].hash(),
        }
    }

    fn ready(remote_len: usize) -> (Harness, Vec<Block>) {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        let remote = chain::chain(remote_len);
        h.handshake_with(&remote, 2);
        assert_eq!(h.conn.handshake_state(), HandshakeState::Succeeded);
        h.sent();
        (h, remote)
    }

    fn header_slice(blocks: &[Block]) -> Vec<BlockHeader> {
        blocks.iter().map(|b| b.header.clone()).collect()
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    #[test]
    fn handshake_fetches_best_header_then_succeeds() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        let remote = chain::chain(20);
        h.conn.send_status().unwrap();
        assert!(matches!(h.sent()[..], [Message::Status(_)]));
        assert_eq!(h.conn.handshake_state(), HandshakeState::StatusSent);

        h.conn.handle_message(Message::Status(remote_status(&remote, 2)));
        let sent = h.sent();
        let [Message::GetHeaders(req)] = &sent[..] else {
            panic!("expected best-hash lookup, got {sent:?}")
        };
        assert_eq!(req.anchor(), HeaderAnchor::Hash(remote[19].hash()));
        assert_eq!(req.max_headers, 1);

        h.conn.handle_message(Message::Headers(vec![remote[19].header.clone()]));
        assert_eq!(h.conn.handshake_state(), HandshakeState::Succeeded);
        assert_eq!(h.conn.peer_best_number(), Some(19));
        assert_eq!(h.conn.negotiated_version(), Some(ProtocolVersion::V2));
        assert!(matches!(
            h.last_event(),
            Some(ConnectionEvent::Ready { best_number: 19, .. })
        ));
        assert!(h.conn.is_idle());
    }

    #[test]
    fn remote_status_first_triggers_ours() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        let remote = chain::chain(5);
        h.conn.handle_message(Message::Status(remote_status(&remote, 2)));
        let sent = h.sent();
        assert!(matches!(sent[0], Message::Status(_)));
        assert!(matches!(sent[1], Message::GetHeaders(_)));
    }

    #[test]
    fn network_mismatch_fails_handshake() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        let remote = chain::chain(5);
        h.conn.send_status().unwrap();
        let mut status = remote_status(&remote, 2);
        status.network_id = 99;
        h.conn.handle_message(Message::Status(status));

        assert_eq!(h.conn.handshake_state(), HandshakeState::Failed);
        assert!(h.sent().contains(&Message::Disconnect(DisconnectReason::IncompatibleProtocol)));
        assert!(matches!(
            h.last_event(),
            Some(ConnectionEvent::Disconnected {
                reason: DisconnectReason::IncompatibleProtocol,
                ..
            })
        ));
        assert!(h.scores.lock().is_banned(&h.conn.id()));
    }

    #[test]
    fn genesis_mismatch_fails_handshake() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        let mut status = remote_status(&chain::chain(5), 2);
        status.genesis_hash = Hash256([7; 32]);
        h.conn.handle_message(Message::Status(status));
        assert_eq!(h.conn.handshake_state(), HandshakeState::Failed);
    }

    #[test]
    fn empty_best_header_reply_fails_handshake() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        h.conn.send_status().unwrap();
        h.conn.handle_message(Message::Status(remote_status(&chain::chain(5), 2)));
        h.conn.handle_message(Message::Headers(vec![]));
        assert_eq!(h.conn.handshake_state(), HandshakeState::Failed);
        assert!(h.sent().contains(&Message::Disconnect(DisconnectReason::UselessPeer)));
    }

    #[test]
    fn duplicate_status_is_a_violation() {
        let (mut h, remote) = ready(5);
        h.conn.handle_message(Message::Status(remote_status(&remote, 2)));
        assert!(h.conn.is_closed());
    }

    #[test]
    fn checkpoints_are_checked_below_peer_best() {
        let remote = chain::chain(30);
        let config = NetworkConfig::default()
            .with_checkpoint(Checkpoint::new(10, ExpectedHash(remote[10].hash())))
            .with_checkpoint(Checkpoint::new(50, ExpectedHash(Hash256::ZERO)));
        let mut h = Harness::new(config, 1);
        h.handshake_with(&remote, 2);

        assert_eq!(h.conn.handshake_state(), HandshakeState::HashConstraintsCheck);
        let sent = h.sent();
        let [Message::GetHeaders(req)] = &sent[..] else {
            panic!("expected checkpoint request, got {sent:?}")
        };
        assert_eq!(req.anchor(), HeaderAnchor::Number(10));

        h.conn.handle_message(Message::Headers(vec![remote[10].header.clone()]));
        // Checkpoint 50 is above the peer's best and is skipped.
        assert_eq!(h.conn.handshake_state(), HandshakeState::Succeeded);
    }

    #[test]
    fn failed_checkpoint_means_wrong_fork() {
        let remote = chain::chain(30);
        let config = NetworkConfig::default().with_checkpoint(Checkpoint::new(10, ExpectedHash(Hash256::ZERO)));
        let mut h = Harness::new(config, 1);
        h.handshake_with(&remote, 2);
        h.conn.handle_message(Message::Headers(vec![remote[10].header.clone()]));

        assert_eq!(h.conn.handshake_state(), HandshakeState::Failed);
        assert!(h.sent().contains(&Message::Disconnect(DisconnectReason::WrongFork)));
    }

    #[test]
    fn empty_checkpoint_reply_means_wrong_fork() {
        let remote = chain::chain(30);
        let config = NetworkConfig::default().with_checkpoint(Checkpoint::new(10, ExpectedHash(remote[10].hash())));
        let mut h = Harness::new(config, 1);
        h.handshake_with(&remote, 2);
        h.conn.handle_message(Message::Headers(vec![]));

        assert_eq!(h.conn.handshake_state(), HandshakeState::Failed);
        assert!(h.sent().contains(&Message::Disconnect(DisconnectReason::WrongFork)));
    }

    #[test]
    fn external_request_before_status_is_queued() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        let remote = chain::chain(20);
        let fut = h.conn.request_headers(HeaderAnchor::Number(1), 5, 0, false).unwrap();
        assert!(h.sent().is_empty());

        h.conn.send_status().unwrap();
        let sent = h.sent();
        assert!(matches!(sent[..], [Message::Status(_), Message::GetHeaders(_)]));

        // Peer status arrives while the external request is pending; the
        // best-hash lookup waits for it.
        h.conn.handle_message(Message::Status(remote_status(&remote, 2)));
        assert!(h.sent().is_empty());

        h.conn.handle_message(Message::Headers(header_slice(&remote[1..6])));
        let sent = h.sent();
        assert!(matches!(&sent[..], [Message::GetHeaders(r)] if r.anchor() == HeaderAnchor::Hash(remote[19].hash())));

        let mut fut = fut;
        assert_eq!(fut.try_take().unwrap().unwrap().len(), 5);
    }

    // -------------------------------------------------------------------------
    // Retrieval
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn header_request_resolves() {
        let (mut h, remote) = ready(20);
        let fut = h.conn.request_headers(HeaderAnchor::Number(3), 4, 0, false).unwrap();
        assert!(!h.conn.is_idle());
        assert!(matches!(h.sent()[..], [Message::GetHeaders(_)]));
        h.conn.handle_message(Message::Headers(header_slice(&remote[3..7])));
        assert_eq!(fut.await.unwrap(), header_slice(&remote[3..7]));
        assert!(h.conn.is_idle());
    }

    #[test]
    fn second_concurrent_request_is_rejected() {
        let (h, _) = ready(20);
        let _first = h.conn.request_headers(HeaderAnchor::Number(1), 5, 0, false).unwrap();
        assert_eq!(
            h.conn.request_headers(HeaderAnchor::Number(6), 5, 0, false).unwrap_err(),
            RequestError::Busy("header")
        );
        assert_eq!(
            h.conn.request_bodies(vec![chain::genesis().header]).unwrap_err(),
            RequestError::Busy("header")
        );
    }

    #[test]
    fn oversized_header_reply_drops_peer() {
        let (mut h, remote) = ready(20);
        let _fut = h.conn.request_headers(HeaderAnchor::Number(1), 10, 0, false).unwrap();
        h.conn.handle_message(Message::Headers(header_slice(&remote[1..12])));
        assert!(h.conn.is_closed());
        assert!(h.sent().contains(&Message::Disconnect(DisconnectReason::UselessPeer)));
    }

    #[test]
    fn unsolicited_headers_drop_peer() {
        let (mut h, remote) = ready(5);
        h.conn.handle_message(Message::Headers(header_slice(&remote[1..2])));
        assert!(h.conn.is_closed());
        assert!(h.sent().contains(&Message::Disconnect(DisconnectReason::UselessPeer)));
    }

    #[tokio::test]
    async fn partial_bodies_pair_in_order() {
        let (mut h, remote) = ready(20);
        let headers = header_slice(&remote[5..9]);
        let fut = h.conn.request_bodies(headers.clone()).unwrap();
        h.sent();
        h.conn.handle_message(Message::Bodies(vec![remote[5].body.clone(), remote[6].body.clone()]));
        let resp = fut.await.unwrap();
        assert_eq!(resp.blocks, remote[5..7].to_vec());
        assert_eq!(resp.missing, headers[2..].to_vec());
    }

    #[tokio::test]
    async fn empty_bodies_reply_is_tolerated() {
        let (h, remote) = ready(20);
        let fut = h.conn.request_bodies(header_slice(&remote[5..7])).unwrap();
        h.conn.handle_message(Message::Bodies(vec![]));
        let resp = fut.await.unwrap();
        assert!(resp.blocks.is_empty());
        assert_eq!(resp.missing.len(), 2);
        assert!(!h.conn.is_closed());
        assert!(h.scores.lock().score(&h.conn.id()) < BONUS_VALID_HEADERS);
    }

    #[test]
    fn mismatched_body_drops_peer() {
        let (h, remote) = ready(20);
        let _fut = h.conn.request_bodies(header_slice(&remote[5..7])).unwrap();
        h.conn.handle_message(Message::Bodies(vec![remote[6].body.clone()]));
        assert!(h.conn.is_closed());
    }

    #[tokio::test]
    async fn disconnect_returns_unfinished_work_and_cancels() {
        let (mut h, remote) = ready(20);
        let headers = header_slice(&remote[5..9]);
        let fut = h.conn.request_bodies(headers.clone()).unwrap();
        h.conn.handle_message(Message::Disconnect(DisconnectReason::Requested));

        assert_eq!(fut.await, Err(RequestError::Cancelled));
        match h.last_event() {
            Some(ConnectionEvent::Disconnected { unfinished, reason, .. }) => {
                assert_eq!(unfinished, headers);
                assert_eq!(reason, DisconnectReason::Requested);
            }
            other => panic!("expected disconnect event, got {other:?}"),
        }
        // The remote closed; nothing is echoed back.
        assert!(!h.sent().iter().any(|m| matches!(m, Message::Disconnect(_))));
        assert_eq!(
            h.conn.request_headers(HeaderAnchor::Number(1), 1, 0, false).unwrap_err(),
            RequestError::Disconnected
        );
    }

    #[test]
    fn timeout_disconnect_penalizes() {
        let (h, _) = ready(5);
        let before = h.scores.lock().score(&h.conn.id());
        h.conn.drop_connection(DisconnectReason::Timeout);
        assert_eq!(h.scores.lock().score(&h.conn.id()), before + PENALTY_TIMEOUT);
    }

    #[test]
    fn bodies_need_a_completed_handshake() {
        let h = Harness::new(NetworkConfig::default(), 1);
        assert_eq!(
            h.conn.request_bodies(vec![chain::genesis().header]).unwrap_err(),
            RequestError::NotReady
        );
    }

    // -------------------------------------------------------------------------
    // Announcements
    // -------------------------------------------------------------------------

    #[test]
    fn announcements_raise_peer_best() {
        let (mut h, remote) = ready(10);
        let next = chain::block_on(&remote[9].header, 0);
        h.conn.handle_message(Message::NewBlock {
            block: next.clone(),
            total_difficulty: chain::synthetic_total_difficulty(10),
        });
        assert_eq!(h.conn.peer_best_number(), Some(10));
        assert_eq!(h.conn.peer_total_difficulty(), Some(chain::synthetic_total_difficulty(10)));
        assert!(matches!(h.last_event(), Some(ConnectionEvent::NewBlock { .. })));

        h.conn.handle_message(Message::NewBlockHashes(vec![(Hash256([1; 32]), 12)]));
        assert_eq!(h.conn.peer_best_number(), Some(12));
    }

    #[tokio::test]
    async fn announced_header_lookup() {
        let (mut h, remote) = ready(10);
        let fut = h.conn.request_announced_header(remote[9].hash()).unwrap();
        assert!(matches!(&h.sent()[..], [Message::GetHeaders(r)] if r.hash == Some(remote[9].hash())));
        h.conn.handle_message(Message::Headers(vec![remote[9].header.clone()]));
        assert_eq!(fut.await.unwrap().len(), 1);
    }

    // -------------------------------------------------------------------------
    // Extension and serving
    // -------------------------------------------------------------------------

    #[test]
    fn v1_peer_has_no_state_sync() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        h.handshake_with(&chain::chain(5), 1);
        assert_eq!(h.conn.negotiated_version(), Some(ProtocolVersion::V1));
        assert_eq!(
            h.conn.request_node_data(vec![Hash256::ZERO]).unwrap_err(),
            RequestError::Unsupported("state sync")
        );
        h.conn.handle_message(Message::GetReceipts(vec![]));
        assert!(h.conn.is_closed());
    }

    #[tokio::test]
    async fn receipts_over_v2() {
        let (mut h, remote) = ready(10);
        let headers = header_slice(&remote[2..4]);
        let fut = h.conn.request_receipts(headers.clone()).unwrap();
        assert!(matches!(&h.sent()[..], [Message::GetReceipts(hashes)] if hashes.len() == 2));
        let lists = remote[2..4].iter().map(|b| chain::synthetic_receipts(&b.body)).collect();
        h.conn.handle_message(Message::Receipts(lists));
        assert_eq!(fut.await.unwrap().len(), 2);
        assert!(!h.conn.is_closed());
    }

    #[test]
    fn empty_node_data_reply_drops_peer() {
        let (h, _) = ready(10);
        let _fut = h.conn.request_node_data(vec![Hash256([3; 32])]).unwrap();
        h.conn.handle_message(Message::NodeData(vec![]));
        assert!(h.conn.is_closed());
    }

    #[test]
    fn serves_headers_and_bodies_from_store() {
        let mut h = Harness::new(NetworkConfig::default(), 20);
        let local = chain::chain(20);

        h.conn.handle_message(Message::GetHeaders(GetHeaders::new(HeaderAnchor::Number(18), 5, 0, false)));
        assert_eq!(h.sent(), vec![Message::Headers(header_slice(&local[18..20]))]);

        h.conn.handle_message(Message::GetHeaders(GetHeaders::new(HeaderAnchor::Number(10), 3, 1, true)));
        let expected = vec![local[10].header.clone(), local[8].header.clone(), local[6].header.clone()];
        assert_eq!(h.sent(), vec![Message::Headers(expected)]);

        let hashes = vec![local[3].hash(), Hash256([9; 32]), local[4].hash()];
        h.conn.handle_message(Message::GetBodies(hashes));
        assert_eq!(h.sent(), vec![Message::Bodies(vec![local[3].body.clone()])]);
    }

    #[test]
    fn receipts_are_served_up_to_the_cap() {
        let len = MAX_RECEIPTS_PER_REQUEST + 20;
        let remote = chain::chain(len);
        let mut h = Harness::new(NetworkConfig::default(), len);
        h.handshake_with(&remote, 2);
        assert_eq!(h.conn.handshake_state(), HandshakeState::Succeeded);
        h.sent();

        let hashes = remote.iter().map(Block::hash).collect();
        h.conn.handle_message(Message::GetReceipts(hashes));
        let sent = h.sent();
        let [Message::Receipts(lists)] = &sent[..] else {
            panic!("expected one receipts reply, got {sent:?}");
        };
        assert_eq!(lists.len(), MAX_RECEIPTS_PER_REQUEST);
        assert_eq!(lists[0], chain::synthetic_receipts(&remote[0].body));
        assert!(!h.conn.is_closed());
    }

    #[test]
    fn ping_is_answered() {
        let mut h = Harness::new(NetworkConfig::default(), 1);
        h.conn.handle_message(Message::Ping(42));
        assert_eq!(h.sent(), vec![Message::Pong(42)]);
    }

    #[test]
    fn record_reflects_state() {
        let (h, _) = ready(10);
        let rec = h.conn.record();
        assert!(rec.ready && rec.idle && !rec.closed);
        assert_eq!(rec.best_number, Some(9));
        assert_eq!(rec.total_difficulty, Some(chain::synthetic_total_difficulty(9)));
        assert!(rec.busy_for.is_none());
        assert!(rec.latency.is_some());
    }
}
