//! Core types and collaborator traits.

use std::{any::Any, borrow::Borrow, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{ClientMessage, RoutingError, RoutingTransport};

/// Session identifier.
///
/// Either supplied by the caller or minted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session exists but has no authenticated client yet.
    PendingAuth,
    /// Authorization completed.
    Active,
    /// Removed from the registry; teardown pending or done.
    Evicting,
}

/// Point-in-time view of a session, safe to hand to operators.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
    /// Last dispatch timestamp (Unix epoch milliseconds).
    pub last_used_at: i64,
    pub state: SessionState,
}

/// Authenticated client handle.
///
/// Opaque to the gateway: stored and passed along, never inspected.
#[derive(Clone)]
pub struct AuthHandle(Arc<dyn Any + Send + Sync>);

impl AuthHandle {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(client: T) -> Self {
        Self(Arc::new(client))
    }

    /// Borrow the client as its concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for AuthHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthHandle(..)")
    }
}

/// Protocol handler error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("Invalid params: {0}")]
    InvalidParams(#[from] serde_json::Error),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Per-session protocol handling instance.
///
/// Replies are written through the session's `RoutingTransport`, which the
/// handler receives from its factory.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handle one inbound message.
    async fn handle(&self, message: ClientMessage) -> Result<(), HandlerError>;

    /// Release per-session resources. Called once, on teardown.
    async fn shutdown(&self) {}
}

/// Session factory error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct FactoryError(pub String);

/// Protocol instance and transport adapter for one new session, wired together.
pub struct SessionParts {
    pub protocol: Arc<dyn ProtocolHandler>,
    pub transport: Arc<RoutingTransport>,
}

/// Builds the resources for a new session.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Build a fresh protocol instance and transport for `id`.
    async fn create(&self, id: &SessionId) -> Result<SessionParts, FactoryError>;
}

/// Authorization error.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization provider error: {0}")]
    Provider(String),
    #[error("Authorization not started for session {0}")]
    NotStarted(SessionId),
}

/// Result of polling an authorization handshake.
#[derive(Debug, Clone)]
pub enum AuthStatus {
    Complete(AuthHandle),
    Pending,
}

/// Authorization collaborator.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Start the handshake and return the URL the caller must visit.
    async fn begin_auth(&self, session_id: &SessionId) -> Result<String, AuthError>;

    /// Check whether the handshake has produced a client handle.
    async fn complete_auth(&self, session_id: &SessionId) -> Result<AuthStatus, AuthError>;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_session_id_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(SessionId::from("abc"), 1);
        assert_eq!(map.get("abc"), Some(&1));
        assert_eq!(SessionId::from("abc").to_string(), "abc");
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_auth_handle_downcast() {
        let handle = AuthHandle::new(String::from("token"));
        assert_eq!(handle.downcast_ref::<String>().map(String::as_str), Some("token"));
        assert!(handle.downcast_ref::<u32>().is_none());
    }
}
