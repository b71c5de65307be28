//! Framed byte transport for peer connections.
//!
//! A [`Link`] is one end of a bidirectional stream of encoded messages.
//! [`open`] binds a link to a new [`PeerConnection`] and returns the pump
//! future that moves frames in both directions until either side closes.

use std::future::Future;
use std::sync::Arc;

use keel_core::types::NodeId;
use keel_network::{ConnectionContext, DisconnectReason, Message, PeerConnection, SyncPeer};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// One end of a framed message stream.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Link {
    /// Two directly connected ends.
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }
}

/// A connection opened by a remote node, waiting to be attached.
#[derive(Debug)]
pub struct Incoming {
    pub peer: NodeId,
    pub link: Link,
}

/// Create a connection to `peer` over `link`. The returned future must be
/// spawned; it ends when the link closes, the connection closes, or
/// `shutdown` fires.
pub fn open(
    peer: NodeId,
    ctx: ConnectionContext,
    link: Link,
    shutdown: watch::Receiver<bool>,
) -> (Arc<PeerConnection>, impl Future<Output = ()> + Send + 'static) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(PeerConnection::new(peer, ctx, out_tx));
    let pump = pump(Arc::clone(&conn), out_rx, link, shutdown);
    (conn, pump)
}

async fn pump(
    conn: Arc<PeerConnection>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut link: Link,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = conn.id();
    loop {
        if *shutdown.borrow() {
            conn.drop_connection(DisconnectReason::Shutdown);
        }
        if conn.is_closed() {
            // Deliver whatever the connection queued on its way out, the
            // disconnect notice included.
            while let Ok(msg) = outbound.try_recv() {
                write_frame(&link, &msg);
            }
            break;
        }
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if !write_frame(&link, &msg) {
                        conn.on_transport_closed();
                    }
                }
                None => break,
            },
            frame = link.rx.recv() => match frame {
                Some(frame) => match Message::decode(&frame) {
                    Ok(msg) => conn.handle_message(msg),
                    Err(e) => {
                        warn!(%peer, error = %e, "conn: undecodable frame");
                        conn.drop_connection(DisconnectReason::UselessPeer);
                    }
                },
                None => conn.on_transport_closed(),
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    conn.drop_connection(DisconnectReason::Shutdown);
                }
            }
        }
    }
    debug!(%peer, "conn: transport closed");
}

/// Encode and send one message. `false` once the remote end is gone.
fn write_frame(link: &Link, msg: &Message) -> bool {
    let frame = match msg.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(kind = msg.kind(), error = %e, "conn: cannot encode message");
            return true;
        }
    };
    trace!(kind = msg.kind(), bytes = frame.len(), "conn: outbound frame");
    link.tx.send(frame).is_ok()
}
