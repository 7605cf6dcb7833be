//! Broadcast + history feed of session lifecycle events.

use std::{
    collections::VecDeque,
    fmt,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionId;

/// Default number of events kept for late subscribers.
pub const DEFAULT_HISTORY: usize = 1024;

/// Why a session was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Idle,
    Manual,
    RoutingFailure,
    Shutdown,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Manual => "manual",
            Self::RoutingFailure => "routing_failure",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Session lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    SessionCreated {
        session_id: SessionId,
    },
    SessionAuthorized {
        session_id: SessionId,
    },
    SessionEvicted {
        session_id: SessionId,
        reason: EvictionReason,
    },
    RoutingFailed {
        session_id: SessionId,
        error: String,
    },
}

/// Event feed with broadcast and history support.
///
/// New subscribers receive history then seamlessly switch to live events.
pub struct EventFeed {
    history: RwLock<VecDeque<LifecycleEvent>>,
    capacity: usize,
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl EventFeed {
    /// Create a feed keeping at most `capacity` past events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event.clone()); // live listeners

        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<LifecycleEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    ///
    /// Lagging subscribers skip the events they missed.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, LifecycleEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
