//! Demo gateway serving a per-session notes protocol.
//!
//! Run with: cargo run -p gateway-server [config.toml]
//!
//! Then connect a WebSocket client to ws://localhost:3000/ws and send
//! `{"type":"request","id":1,"method":"put","params":{"key":"a","value":1}}`.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use switchyard_core::{
    AuthError, AuthHandle, AuthProvider, AuthStatus, ClientMessage, EventFeed, FactoryError,
    HandlerError, ProtocolHandler, RoutingTransport, ServerMessage, SessionFactory, SessionId,
    SessionParts, current_context, spawn_in_context,
};
use switchyard_session::{Dispatcher, GatewayConfig, SessionRegistry, Sweeper};
use switchyard_transport::gateway_router;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Key-value notes kept for the lifetime of one session.
struct NotesProtocol {
    transport: Arc<RoutingTransport>,
    notes: Mutex<HashMap<String, Value>>,
}

impl NotesProtocol {
    fn notes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.notes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProtocolHandler for NotesProtocol {
    async fn handle(&self, message: ClientMessage) -> Result<(), HandlerError> {
        let ClientMessage::Request { id, method, params } = message else {
            return Ok(());
        };
        let result = match method.as_str() {
            "put" => {
                let key = key_param(&params)?;
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                let previous = self.notes().insert(key, value);
                json!({ "previous": previous })
            }
            "get" => {
                let key = key_param(&params)?;
                json!({ "value": self.notes().get(&key) })
            }
            "list" => json!({ "keys": self.notes().keys().collect::<Vec<_>>() }),
            "whoami" => {
                let authorized = current_context().is_some_and(|ctx| ctx.auth().is_some());
                json!({ "authorized": authorized })
            }
            // Replies later from a detached task; the answer still reaches
            // the connection that asked.
            "remind" => {
                let secs = params.get("after_secs").and_then(Value::as_u64).unwrap_or(1);
                let transport = Arc::clone(&self.transport);
                spawn_in_context(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    let reminder = json!({ "reminder": params.get("text") });
                    if let Err(e) = transport.send(ServerMessage::response(id, reminder)).await {
                        tracing::debug!("reminder dropped: {e}");
                    }
                });
                return Ok(());
            }
            other => return Err(HandlerError::UnsupportedMethod(other.to_string())),
        };
        self.transport.send(ServerMessage::response(id, result)).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        tracing::debug!(notes = self.notes().len(), "notes discarded");
    }
}

fn key_param(params: &Value) -> Result<String, HandlerError> {
    params
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HandlerError::Failed("missing string param `key`".to_string()))
}

struct NotesFactory;

#[async_trait]
impl SessionFactory for NotesFactory {
    async fn create(&self, id: &SessionId) -> Result<SessionParts, FactoryError> {
        tracing::info!(session_id = %id, "opening notes session");
        let transport = Arc::new(RoutingTransport::for_session(id.clone()));
        Ok(SessionParts {
            protocol: Arc::new(NotesProtocol {
                transport: Arc::clone(&transport),
                notes: Mutex::new(HashMap::new()),
            }),
            transport,
        })
    }
}

/// Approves a session on its second `complete_auth`, standing in for a
/// user finishing an external login.
#[derive(Default)]
struct DemoAuth {
    polls: Mutex<HashMap<SessionId, u32>>,
}

#[async_trait]
impl AuthProvider for DemoAuth {
    async fn begin_auth(&self, session_id: &SessionId) -> Result<String, AuthError> {
        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), 0);
        Ok(format!("https://login.example.com/authorize?state={session_id}"))
    }

    async fn complete_auth(&self, session_id: &SessionId) -> Result<AuthStatus, AuthError> {
        let mut polls = self.polls.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = polls.get_mut(session_id) else {
            return Err(AuthError::NotStarted(session_id.clone()));
        };
        *count += 1;
        if *count < 2 {
            return Ok(AuthStatus::Pending);
        }
        polls.remove(session_id);
        Ok(AuthStatus::Complete(AuthHandle::new(format!("token-{session_id}"))))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SWITCHYARD_CONFIG").ok())
        .map(PathBuf::from);
    let config = GatewayConfig::load(config_path.as_deref()).context("loading configuration")?;

    let registry = SessionRegistry::new(Arc::new(EventFeed::new(config.event_history)));
    let dispatcher = Arc::new(
        Dispatcher::new(registry.clone(), Arc::new(NotesFactory))
            .with_auth(Arc::new(DemoAuth::default())),
    );

    let shutdown = CancellationToken::new();
    let sweeper = Sweeper::new(registry.clone(), config.sweeper()).spawn(shutdown.clone());

    let app = gateway_router(dispatcher)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!("Gateway listening on ws://{}/ws", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("serving")?;

    shutdown.cancel();
    let _ = sweeper.await;
    registry.drain().await;
    tracing::info!("all sessions closed");
    Ok(())
}
