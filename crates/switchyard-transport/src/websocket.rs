//! WebSocket listener.
//!
//! Each socket becomes one `ConnectionHandle`. Every frame is dispatched on
//! its own task; replies come back through the session's routing transport.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use switchyard_core::{ClientMessage, ConnectionHandle, ServerMessage};
use switchyard_session::Dispatcher;
use tracing::{debug, error, info, warn};

use crate::protocol::{decode_binary, decode_frame, encode_frame};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    /// Dispatcher shared by every connection.
    pub dispatcher: Arc<Dispatcher>,
}

impl WsState {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut rx) = ConnectionHandle::channel();
    let conn_id = connection.id();
    debug!(connection = %conn_id, "websocket connected");

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match encode_frame(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => decode_frame(text.as_str()),
            Ok(Message::Binary(data)) => decode_binary(&data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!(connection = %conn_id, "WebSocket error: {e}");
                break;
            }
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %conn_id, "Invalid client message: {e}");
                let _ = connection.deliver(e.to_server_message());
                continue;
            }
        };

        if frame.message == ClientMessage::Ping {
            let _ = connection.deliver(ServerMessage::Pong);
            continue;
        }

        let dispatcher = Arc::clone(&state.dispatcher);
        let envelope = frame.into_envelope(connection.clone());
        tokio::spawn(async move {
            // Creation failures were already reported to the caller.
            let _ = dispatcher.dispatch(envelope).await;
        });
    }

    // In-flight dispatches keep running; their replies to this socket fail
    // softly once the writer is gone.
    send_task.abort();
    info!(connection = %conn_id, "websocket disconnected");
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(dispatcher));
/// ```
#[must_use]
pub fn create_ws_router(dispatcher: Arc<Dispatcher>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(dispatcher))
}
