//! Client handles: how a document addresses a connection it does not own.
//!
//! Each connection gets a pair:
//! - [`ClientHandle`] - held by the document; send-only, cheap to clone
//! - [`ClientLink`] - held by the transport's writer task; drains the
//!   outbound buffer and observes the close signal
//!
//! ```text
//!  Document ── ClientHandle ──► mpsc (bounded) ──► ClientLink ──► WebSocket
//!                   │                                  ▲
//!                   └──────── close signal (watch) ────┘
//! ```
//!
//! The transport owns the socket. Once its writer task exits, the link is
//! dropped and every later [`ClientHandle::send`] fails, so the document
//! learns a connection is gone only from the outcome of a send.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Unique identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure to hand content to a connection.
///
/// Either variant means the handle is no longer usable; it is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection was closed, or its writer went away.
    #[error("client connection closed")]
    Closed,
    /// The outbound buffer is full; the client is not keeping up.
    #[error("client outbound buffer full")]
    Lagging,
}

/// Send-only reference to one client connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Arc<str>>,
    closed: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    /// Create a connected handle/link pair with `capacity` buffered messages.
    pub fn channel(capacity: usize) -> (ClientHandle, ClientLink) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = ClientHandle {
            id,
            tx,
            closed: Arc::new(closed_tx),
        };
        let link = ClientLink {
            id,
            rx,
            closed: closed_rx,
        };
        (handle, link)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue `content` for delivery without waiting.
    ///
    /// Never blocks, so it is safe to call while holding a document lock.
    /// A full buffer is reported as [`SendError::Lagging`], and the document
    /// treats it like a dead connection: a client that falls a whole buffer
    /// behind is disconnected and has to rejoin for a fresh snapshot.
    pub fn send(&self, content: Arc<str>) -> Result<(), SendError> {
        if *self.closed.borrow() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(content).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Lagging,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Signal the transport to close this connection. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Whether the connection has been closed from either side.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }
}

/// Transport side of a client connection.
#[derive(Debug)]
pub struct ClientLink {
    id: ClientId,
    rx: mpsc::Receiver<Arc<str>>,
    closed: watch::Receiver<bool>,
}

impl ClientLink {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next outbound message, or `None` once the handle has been closed or
    /// every handle dropped.
    ///
    /// A close takes priority over buffered content.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// A receiver that resolves when the document closes this connection.
    ///
    /// Lets the read side of a transport stop alongside the writer.
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal(self.closed.clone())
    }
}

/// Observer for the close signal of one connection.
#[derive(Debug, Clone)]
pub struct CloseSignal(watch::Receiver<bool>);

impl CloseSignal {
    /// Resolves once the connection is closed or its handles are all gone.
    pub async fn closed(&mut self) {
        let _ = self.0.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}
