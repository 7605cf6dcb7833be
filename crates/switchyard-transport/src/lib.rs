//! Network surfaces for the switchyard gateway.
//!
//! Provides:
//! - JSON frame codec
//! - WebSocket listener (feature: websocket)
//! - Operator HTTP endpoints (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod ops;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ClientFrame, FrameError, decode_binary, decode_frame, encode_frame};

#[cfg(feature = "websocket")]
pub use ops::create_ops_router;
#[cfg(feature = "websocket")]
pub use websocket::{WsState, create_ws_router};

/// Full gateway router: `/ws` plus the operator endpoints.
#[cfg(feature = "websocket")]
#[must_use]
pub fn gateway_router(dispatcher: std::sync::Arc<switchyard_session::Dispatcher>) -> axum::Router {
    let registry = dispatcher.registry().clone();
    create_ws_router(dispatcher).merge(create_ops_router(registry))
}
