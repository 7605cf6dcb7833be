//! Operator HTTP surface.
//!
//! - `GET /sessions` lists sessions
//! - `DELETE /sessions/{id}` evicts one
//! - `GET /stats` reports aggregate counts
//! - `GET /events` streams lifecycle events (history first) as SSE

use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::{Stream, StreamExt};
use switchyard_core::{SessionId, SessionSummary};
use switchyard_session::{GatewayStats, SessionRegistry};
use tracing::info;

/// Create the operator router.
#[must_use]
pub fn create_ops_router(registry: SessionRegistry) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", axum::routing::delete(evict_session))
        .route("/stats", get(stats))
        .route("/events", get(events))
        .with_state(registry)
}

async fn list_sessions(State(registry): State<SessionRegistry>) -> Json<Vec<SessionSummary>> {
    Json(registry.list())
}

async fn evict_session(
    State(registry): State<SessionRegistry>,
    Path(id): Path<String>,
) -> StatusCode {
    let id = SessionId::from(id);
    if registry.remove(&id).await {
        info!(session_id = %id, "session evicted by operator");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn stats(State(registry): State<SessionRegistry>) -> Json<GatewayStats> {
    Json(registry.stats())
}

async fn events(
    State(registry): State<SessionRegistry>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = registry.events().history_plus_stream().map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("unserializable event")))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
