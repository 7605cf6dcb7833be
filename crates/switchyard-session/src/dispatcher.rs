//! Request dispatcher.
//!
//! Entry point for every inbound message: resolves the session, installs
//! the request context and hands the message to the session's protocol
//! instance. Failures are answered on the caller's own connection and never
//! escape to other sessions.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use switchyard_core::{
    AuthProvider, ClientMessage, Envelope, GatewayError, RequestContext, ServerMessage,
    SessionFactory, SessionId, run_with_context,
};
use tracing::{debug, warn};

use crate::{AuthCoordinator, SessionRegistry, record::SessionLease};

/// Routes inbound messages to per-session protocol instances.
pub struct Dispatcher {
    registry: SessionRegistry,
    factory: Arc<dyn SessionFactory>,
    auth: Option<AuthCoordinator>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: SessionRegistry, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            registry,
            factory,
            auth: None,
        }
    }

    /// Answer `authorize` / `complete_auth` through `provider` instead of
    /// forwarding them to the protocol instance.
    #[must_use]
    pub fn with_auth(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(AuthCoordinator::new(provider, self.registry.clone()));
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Dispatch one inbound message.
    ///
    /// A caller without a session id gets a freshly minted one, echoed back
    /// as `session_assigned` before anything else.
    ///
    /// # Errors
    /// Returns `SessionCreation` if the session could not be created. The
    /// caller has already been sent an error frame in that case. Handler
    /// failures are answered on the session's transport and are not
    /// returned.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<SessionId, GatewayError> {
        let Envelope {
            session_id,
            connection,
            message,
        } = envelope;
        let request_id = message.request_id();
        let (id, minted) = match session_id {
            Some(id) => (id, false),
            None => (SessionId::generate(), true),
        };

        // Creation runs under a context bound to this connection so the new
        // transport starts out routed to the caller.
        let bootstrap = RequestContext::new(id.clone(), connection.clone());
        let factory = Arc::clone(&self.factory);
        let create_id = id.clone();
        let created = run_with_context(
            bootstrap,
            self.registry
                .get_or_create(&id, move || async move { factory.create(&create_id).await }),
        )
        .await;

        let session = match created {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %id, error = %e, "could not open session");
                if let Err(route_err) = connection.deliver(ServerMessage::error(request_id, &e)) {
                    debug!(error = %route_err, "caller went away before creation failed");
                }
                return Err(e);
            }
        };
        self.registry.touch(&id);

        let ctx = RequestContext::builder(id.clone(), connection)
            .request_id(request_id)
            .auth(session.auth_handle())
            .cancellation(session.cancellation().clone())
            .build();
        // Replies travel under a session-unique id; the transport hands the
        // caller's own id back on the way out.
        let reply_id = session.transport().bind(&ctx);
        let message = match reply_id {
            Some(routed) => message.with_request_id(routed),
            None => message,
        };

        if minted {
            let assigned = ServerMessage::SessionAssigned {
                session_id: id.clone(),
            };
            if let Err(e) = session.transport().send(assigned).await {
                debug!(session_id = %id, error = %e, "could not echo assigned session id");
            }
        }

        if let Err(e) = run_with_context(ctx, self.handle(&session, message)).await {
            self.registry.record_handler_failure();
            warn!(session_id = %id, error = %e, "handler failed");
            if let Err(route_err) = session
                .transport()
                .send(ServerMessage::error(reply_id, &e))
                .await
            {
                debug!(session_id = %id, error = %route_err, "error reply dropped");
            }
        }

        Ok(id)
    }

    async fn handle(
        &self,
        session: &SessionLease,
        message: ClientMessage,
    ) -> Result<(), GatewayError> {
        let reply = match (&self.auth, &message) {
            (Some(auth), ClientMessage::Authorize) => Some(auth.begin(session).await?),
            (Some(auth), ClientMessage::CompleteAuth) => Some(auth.complete(session).await?),
            (_, ClientMessage::Ping) => Some(ServerMessage::Pong),
            _ => None,
        };
        if let Some(reply) = reply {
            session.transport().send(reply).await?;
            return Ok(());
        }

        AssertUnwindSafe(session.protocol().handle(message))
            .catch_unwind()
            .await
            .map_err(|panic| GatewayError::Handler(panic_message(panic.as_ref())))?
            .map_err(|e| GatewayError::Handler(e.to_string()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
