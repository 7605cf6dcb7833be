//! Typed messages exchanged between callers and the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConnectionHandle, GatewayError, SessionId};

/// Request identifier. Chosen by the caller, so only unique per connection.
pub type RequestId = u64;

/// Message from client to gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request expecting a `response` or `error` with the same id.
    Request {
        id: RequestId,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Fire-and-forget message.
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Start the authorization handshake for this session.
    Authorize,
    /// Poll the authorization handshake for completion.
    CompleteAuth,
    /// Keepalive, answered by the connection itself.
    Ping,
}

impl ClientMessage {
    /// Build a request message.
    #[must_use]
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    /// Id of the request, if this message expects a reply.
    #[must_use]
    pub const fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Request { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Replace the request id. No-op for messages without one.
    #[must_use]
    pub fn with_request_id(mut self, new_id: RequestId) -> Self {
        if let Self::Request { id, .. } = &mut self {
            *id = new_id;
        }
        self
    }
}

/// Machine-readable error category carried by `ServerMessage::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionCreationFailure,
    UnknownSession,
    HandlerFailure,
    AuthFailure,
    InvalidMessage,
}

/// Message from gateway to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The gateway minted a session id for this caller.
    SessionAssigned { session_id: SessionId },
    /// Successful reply to a request.
    Response { id: RequestId, result: Value },
    /// Server-initiated message.
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Structured error, correlated to a request when `id` is set.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        code: ErrorCode,
        message: String,
    },
    /// Authorization URL the caller should visit.
    AuthUrl { url: String },
    /// Authorization has not completed yet.
    AuthPending,
    /// Authorization completed; the session is active.
    AuthCompleted,
    /// Keepalive reply.
    Pong,
}

impl ServerMessage {
    /// Build a successful response.
    #[must_use]
    pub const fn response(id: RequestId, result: Value) -> Self {
        Self::Response { id, result }
    }

    /// Build an error reply from a gateway error.
    #[must_use]
    pub fn error(id: Option<RequestId>, err: &GatewayError) -> Self {
        Self::Error {
            id,
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Point the reply at a different request id. No-op for uncorrelated
    /// messages.
    #[must_use]
    pub fn with_reply_id(mut self, new_id: RequestId) -> Self {
        if let Self::Response { id, .. } | Self::Error { id: Some(id), .. } = &mut self {
            *id = new_id;
        }
        self
    }

    /// Id of the request this message answers, if any.
    #[must_use]
    pub const fn in_reply_to(&self) -> Option<RequestId> {
        match self {
            Self::Response { id, .. } | Self::Error { id: Some(id), .. } => Some(*id),
            _ => None,
        }
    }
}

/// Inbound message together with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Session the caller claims; `None` asks the gateway to mint one.
    pub session_id: Option<SessionId>,
    /// Connection the message arrived on.
    pub connection: ConnectionHandle,
    pub message: ClientMessage,
}
