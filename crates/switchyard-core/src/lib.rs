//! Core abstractions for the switchyard session gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `RequestContext` and the task-local context carrier
//! - `ClientMessage` / `ServerMessage` - Typed wire message enums
//! - `ConnectionHandle` - Response sink for one physical connection
//! - `RoutingTransport` - Per-session adapter that writes to the originating connection
//! - `EventFeed` - Broadcast + history of session lifecycle events
//! - Collaborator traits (protocol handler, session factory, auth provider)

pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod message;
pub mod routing;
pub mod traits;

pub use connection::{ConnectionHandle, ConnectionId};
pub use context::{RequestContext, current_context, run_with_context, spawn_in_context};
pub use error::{GatewayError, RoutingError};
pub use events::{EventFeed, EvictionReason, LifecycleEvent};
pub use message::{ClientMessage, Envelope, ErrorCode, RequestId, ServerMessage};
pub use routing::{Channel, ContextChannel, RoutingTransport};
pub use traits::{
    AuthError, AuthHandle, AuthProvider, AuthStatus, FactoryError, HandlerError, ProtocolHandler,
    SessionFactory, SessionId, SessionParts, SessionState, SessionSummary,
};
