//! Single-shot result slots for outstanding requests.
//!
//! The requester holds a [`Pending`] future; the connection keeps the
//! matching [`Resolver`]. Dropping the resolver (disconnect, cancellation)
//! completes the future with [`RequestError::Cancelled`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use keel_core::error::RequestError;
use tokio::sync::oneshot;

/// Create a connected resolver / future pair.
pub fn pending<T>() -> (Resolver<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Pending { rx })
}

/// Completing side, held by the connection.
#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Resolver<T> {
    /// Deliver the result. A requester that stopped waiting is ignored.
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(value);
    }

    /// Whether the requester dropped its future.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Waiting side, handed to the requester.
#[derive(Debug)]
#[must_use = "a pending request does nothing unless awaited"]
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    /// Take the result if it is already there.
    pub fn try_take(&mut self) -> Option<Result<T, RequestError>> {
        match self.rx.try_recv() {
            Ok(v) => Some(Ok(v)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RequestError::Cancelled)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| RequestError::Cancelled))
    }
}
