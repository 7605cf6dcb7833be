//! Gateway error taxonomy.

use thiserror::Error;

use crate::{ConnectionId, ErrorCode, RequestId, SessionId};

/// Failure to deliver an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("No connection bound for outbound message")]
    Unbound,
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),
    #[error("Transport closed for session {0}")]
    TransportClosed(SessionId),
    #[error("Request {0} is no longer waiting for a reply")]
    ReplyExpired(RequestId),
}

/// Gateway error.
///
/// `Clone` so that one creation failure can be handed to every caller
/// waiting on the same session id.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Session creation failed for {id}: {reason}")]
    SessionCreation { id: SessionId, reason: String },
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("Handler failed: {0}")]
    Handler(String),
    #[error("Routing failed: {0}")]
    Routing(#[from] RoutingError),
    #[error("Authorization failed: {0}")]
    Auth(String),
}

impl GatewayError {
    /// Wire error code reported to the caller.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SessionCreation { .. } => ErrorCode::SessionCreationFailure,
            Self::UnknownSession(_) => ErrorCode::UnknownSession,
            Self::Handler(_) | Self::Routing(_) => ErrorCode::HandlerFailure,
            Self::Auth(_) => ErrorCode::AuthFailure,
        }
    }
}
