//! Physical connection handles.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{RoutingError, ServerMessage};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Response sink for one physical connection.
///
/// The receiving half is drained by whatever owns the socket. Cloning the
/// handle does not open a new connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: ConnectionId::next(),
            tx,
        }
    }

    /// Create a handle together with the receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Write a message to this connection.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` if the receiving side is gone.
    pub fn deliver(&self, message: ServerMessage) -> Result<(), RoutingError> {
        self.tx
            .send(message)
            .map_err(|_| RoutingError::ConnectionClosed(self.id))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
