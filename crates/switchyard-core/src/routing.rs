//! Per-session routing transport.
//!
//! A protocol instance may produce an outbound message long after the
//! dispatch that caused it has returned, e.g. from a spawned completion. At
//! that point the task-local context is gone, or belongs to someone else.
//! [`RoutingTransport`] remembers which connection each request came from and
//! re-enters that context around the physical write, so the message lands on
//! the connection the caller is listening on.
//!
//! Callers pick request ids per connection, and one session may be shared by
//! several connections. [`RoutingTransport::bind`] therefore hands out a
//! session-unique id for every request; the protocol instance replies to that
//! id and the transport restores the caller's own id on the way out.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    RequestContext, RequestId, RoutingError, ServerMessage, SessionId, current_context,
    run_with_context,
};

/// Duplex channel capability.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Write one message.
    async fn send(&self, message: ServerMessage) -> Result<(), RoutingError>;

    /// Stop accepting writes.
    async fn close(&self);
}

/// Physical channel that writes to the connection of the active context.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextChannel;

#[async_trait]
impl Channel for ContextChannel {
    async fn send(&self, message: ServerMessage) -> Result<(), RoutingError> {
        let ctx = current_context().ok_or(RoutingError::Unbound)?;
        ctx.connection().deliver(message)
    }

    async fn close(&self) {}
}

type FailureHook = Box<dyn Fn(&SessionId, &RoutingError) + Send + Sync>;

/// Unanswered requests remembered per session. The oldest is forgotten first.
pub const MAX_PENDING_REPLIES: usize = 1024;

struct PendingReply {
    ctx: RequestContext,
    /// Id as the caller sent it.
    caller_id: RequestId,
}

#[derive(Default)]
struct Bindings {
    /// Context active when the transport was built.
    origin: Option<RequestContext>,
    /// Most recent dispatch on this session.
    latest: Option<RequestContext>,
    /// Requests still waiting for a reply, keyed by session-unique id.
    replies: BTreeMap<RequestId, PendingReply>,
    next_reply: RequestId,
}

/// Routing transport adapter, one per session.
///
/// Writes are serialized: messages reach the channel in the order their
/// `send` calls acquired the write lock.
pub struct RoutingTransport {
    session_id: SessionId,
    inner: Arc<dyn Channel>,
    bindings: Mutex<Bindings>,
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    on_failure: OnceLock<FailureHook>,
}

impl RoutingTransport {
    /// Wrap `inner`, capturing the active context as the origin binding.
    #[must_use]
    pub fn new(session_id: SessionId, inner: Arc<dyn Channel>) -> Self {
        Self {
            session_id,
            inner,
            bindings: Mutex::new(Bindings {
                origin: current_context(),
                ..Bindings::default()
            }),
            write_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            on_failure: OnceLock::new(),
        }
    }

    /// Transport writing straight to connections via [`ContextChannel`].
    #[must_use]
    pub fn for_session(session_id: SessionId) -> Self {
        Self::new(session_id, Arc::new(ContextChannel))
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the context of a dispatch on this session.
    ///
    /// If `ctx` carries a request id, returns the session-unique id the
    /// reply must use. A `Response` or `Error` sent with it goes to `ctx`'s
    /// connection carrying the caller's original id. Uncorrelated messages go
    /// to the most recently bound connection.
    ///
    /// Requests whose connection has closed are forgotten here, and at most
    /// [`MAX_PENDING_REPLIES`] stay pending. A reply to a forgotten request
    /// fails with `ReplyExpired` rather than reaching another connection.
    pub fn bind(&self, ctx: &RequestContext) -> Option<RequestId> {
        if self.is_closed() {
            return None;
        }
        let mut bindings = self.lock_bindings();
        bindings.latest = Some(ctx.clone());
        let caller_id = ctx.request_id()?;

        bindings
            .replies
            .retain(|_, pending| !pending.ctx.connection().is_closed());
        while bindings.replies.len() >= MAX_PENDING_REPLIES {
            if let Some((id, pending)) = bindings.replies.pop_first() {
                debug!(
                    session_id = %self.session_id,
                    request_id = pending.caller_id,
                    routed_id = id,
                    "forgetting unanswered request"
                );
            }
        }

        let routed = bindings.next_reply;
        bindings.next_reply += 1;
        bindings.replies.insert(
            routed,
            PendingReply {
                ctx: ctx.clone(),
                caller_id,
            },
        );
        Some(routed)
    }

    /// Number of requests still waiting for a reply.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.lock_bindings().replies.len()
    }

    /// Install the callback run when a physical write fails.
    ///
    /// Returns `false` if a hook was already installed.
    pub fn on_failure<F>(&self, hook: F) -> bool
    where
        F: Fn(&SessionId, &RoutingError) + Send + Sync + 'static,
    {
        self.on_failure.set(Box::new(hook)).is_ok()
    }

    /// Send a message to the connection it belongs to.
    ///
    /// # Errors
    /// `TransportClosed` after teardown, `Unbound` if no connection has ever
    /// been bound, `ReplyExpired` for a reply nobody waits for any more, or
    /// the channel's error if the physical write fails.
    pub async fn send(&self, message: ServerMessage) -> Result<(), RoutingError> {
        let _write = self.write_lock.lock().await;
        if self.is_closed() {
            debug!(session_id = %self.session_id, "dropping message for closed transport");
            return Err(RoutingError::TransportClosed(self.session_id.clone()));
        }

        let (target, message) = self.route(message)?;

        let result = run_with_context(target, self.inner.send(message)).await;
        if let Err(e) = &result {
            warn!(session_id = %self.session_id, error = %e, "outbound write failed");
            if let Some(hook) = self.on_failure.get() {
                hook(&self.session_id, e);
            }
        }
        result
    }

    /// Close the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _write = self.write_lock.lock().await;
        *self.lock_bindings() = Bindings::default();
        self.inner.close().await;
        debug!(session_id = %self.session_id, "transport closed");
    }

    fn route(
        &self,
        message: ServerMessage,
    ) -> Result<(RequestContext, ServerMessage), RoutingError> {
        let mut bindings = self.lock_bindings();
        if let Some(id) = message.in_reply_to() {
            if let Some(pending) = bindings.replies.remove(&id) {
                return Ok((pending.ctx, message.with_reply_id(pending.caller_id)));
            }
            // Issued by `bind` but answered or forgotten since.
            if id < bindings.next_reply {
                debug!(session_id = %self.session_id, routed_id = id, "dropping late reply");
                return Err(RoutingError::ReplyExpired(id));
            }
        }
        let Some(target) = bindings.latest.clone().or_else(|| bindings.origin.clone()) else {
            warn!(session_id = %self.session_id, "no connection bound, dropping message");
            return Err(RoutingError::Unbound);
        };
        Ok((target, message))
    }

    fn lock_bindings(&self) -> std::sync::MutexGuard<'_, Bindings> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Channel for RoutingTransport {
    async fn send(&self, message: ServerMessage) -> Result<(), RoutingError> {
        Self::send(self, message).await
    }

    async fn close(&self) {
        Self::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{ConnectionHandle, spawn_in_context};

    fn connection() -> (ConnectionHandle, UnboundedReceiver<ServerMessage>) {
        ConnectionHandle::channel()
    }

    fn request_ctx(conn: &ConnectionHandle, id: Option<RequestId>) -> RequestContext {
        RequestContext::builder(SessionId::from("s"), conn.clone())
            .request_id(id)
            .build()
    }

    #[tokio::test]
    async fn test_origin_binding_used_outside_any_scope() {
        let (conn, mut rx) = connection();
        let transport = run_with_context(request_ctx(&conn, None), async {
            RoutingTransport::for_session(SessionId::from("s"))
        })
        .await;

        assert!(current_context().is_none());
        transport.send(ServerMessage::Pong).await.unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_unbound_transport_fails_softly() {
        let transport = RoutingTransport::for_session(SessionId::from("s"));
        assert_eq!(
            transport.send(ServerMessage::Pong).await,
            Err(RoutingError::Unbound)
        );
    }

    #[tokio::test]
    async fn test_deferred_reply_reaches_originating_connection() {
        let (first, mut first_rx) = connection();
        let (second, mut second_rx) = connection();
        let transport = Arc::new(RoutingTransport::for_session(SessionId::from("s")));

        // Request 1 arrives on the first connection and is answered later.
        let ctx = request_ctx(&first, Some(1));
        let late_id = transport.bind(&ctx).unwrap();
        let deferred = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                transport
                    .send(ServerMessage::response(late_id, json!("late")))
                    .await
            })
        };

        // Request 2 arrives on the second connection meanwhile.
        let other = request_ctx(&second, Some(2));
        let early_id = transport.bind(&other).unwrap();
        run_with_context(other, async {
            transport
                .send(ServerMessage::response(early_id, json!("early")))
                .await
                .unwrap();
        })
        .await;

        deferred.await.unwrap().unwrap();
        assert_eq!(
            first_rx.recv().await,
            Some(ServerMessage::response(1, json!("late")))
        );
        assert_eq!(
            second_rx.recv().await,
            Some(ServerMessage::response(2, json!("early")))
        );
        assert!(first_rx.try_recv().is_err());
        assert_eq!(transport.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_same_request_id_on_two_connections() {
        let (first, mut first_rx) = connection();
        let (second, mut second_rx) = connection();
        let transport = Arc::new(RoutingTransport::for_session(SessionId::from("s")));

        // Both callers pick id 1; the first one's reply is deferred.
        let slow = transport.bind(&request_ctx(&first, Some(1))).unwrap();
        let fast = transport.bind(&request_ctx(&second, Some(1))).unwrap();
        assert_ne!(slow, fast);

        transport
            .send(ServerMessage::response(fast, json!("B")))
            .await
            .unwrap();
        transport
            .send(ServerMessage::response(slow, json!("A")))
            .await
            .unwrap();

        assert_eq!(
            first_rx.recv().await,
            Some(ServerMessage::response(1, json!("A")))
        );
        assert_eq!(
            second_rx.recv().await,
            Some(ServerMessage::response(1, json!("B")))
        );
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_active_context_does_not_override_binding() {
        let (owner, mut owner_rx) = connection();
        let (stranger, mut stranger_rx) = connection();
        let transport = RoutingTransport::for_session(SessionId::from("s"));
        let routed = transport.bind(&request_ctx(&owner, Some(5))).unwrap();

        let foreign = RequestContext::new(SessionId::from("other"), stranger);
        run_with_context(foreign, async {
            transport
                .send(ServerMessage::response(routed, json!(null)))
                .await
                .unwrap();
        })
        .await;

        assert_eq!(
            owner_rx.recv().await,
            Some(ServerMessage::response(5, json!(null)))
        );
        assert!(stranger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unanswered_requests_are_bounded() {
        let (conn, mut rx) = connection();
        let transport = RoutingTransport::for_session(SessionId::from("s"));

        let first = transport.bind(&request_ctx(&conn, Some(0))).unwrap();
        for id in 1..2000 {
            transport.bind(&request_ctx(&conn, Some(id)));
        }
        assert_eq!(transport.pending_replies(), MAX_PENDING_REPLIES);

        // The oldest request was forgotten; its late reply goes nowhere.
        assert_eq!(
            transport.send(ServerMessage::response(first, json!(null))).await,
            Err(RoutingError::ReplyExpired(first))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.pending_replies(), MAX_PENDING_REPLIES);
    }

    #[tokio::test]
    async fn test_closed_connections_release_pending_replies() {
        let (gone, gone_rx) = connection();
        let (live, mut live_rx) = connection();
        let transport = RoutingTransport::for_session(SessionId::from("s"));

        let stale = transport.bind(&request_ctx(&gone, Some(0))).unwrap();
        for id in 1..10 {
            transport.bind(&request_ctx(&gone, Some(id)));
        }
        assert_eq!(transport.pending_replies(), 10);

        drop(gone_rx);
        transport.bind(&request_ctx(&live, Some(0)));
        assert_eq!(transport.pending_replies(), 1);

        // The pruned reply must not fall through to the live connection.
        assert_eq!(
            transport.send(ServerMessage::response(stale, json!(null))).await,
            Err(RoutingError::ReplyExpired(stale))
        );
        assert!(live_rx.try_recv().is_err());

        transport.close().await;
        assert_eq!(transport.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_notifications_follow_latest_binding() {
        let (first, mut first_rx) = connection();
        let (second, mut second_rx) = connection();
        let transport = RoutingTransport::for_session(SessionId::from("s"));
        transport.bind(&request_ctx(&first, None));
        transport.bind(&request_ctx(&second, None));

        let note = ServerMessage::Notification {
            method: "changed".into(),
            params: json!({}),
        };
        transport.send(note.clone()).await.unwrap();
        assert_eq!(second_rx.recv().await, Some(note));
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_writes_are_ordered() {
        let (conn, mut rx) = connection();
        let transport = Arc::new(RoutingTransport::for_session(SessionId::from("s")));
        transport.bind(&request_ctx(&conn, None));

        for i in 0..50 {
            transport
                .send(ServerMessage::response(i, json!(i)))
                .await
                .unwrap();
        }
        for i in 0..50 {
            assert_eq!(rx.recv().await, Some(ServerMessage::response(i, json!(i))));
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails_softly() {
        let (conn, _rx) = connection();
        let transport = RoutingTransport::for_session(SessionId::from("s"));
        transport.bind(&request_ctx(&conn, None));
        transport.close().await;
        transport.close().await;

        assert!(transport.is_closed());
        assert_eq!(
            transport.send(ServerMessage::Pong).await,
            Err(RoutingError::TransportClosed(SessionId::from("s")))
        );
    }

    #[tokio::test]
    async fn test_failure_hook_runs_on_closed_connection() {
        let (conn, rx) = connection();
        drop(rx);
        let transport = RoutingTransport::for_session(SessionId::from("s"));
        transport.bind(&request_ctx(&conn, None));

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        assert!(transport.on_failure(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!transport.on_failure(|_, _| {}));

        let result = transport.send(ServerMessage::Pong).await;
        assert_eq!(result, Err(RoutingError::ConnectionClosed(conn.id())));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawned_work_inherits_route() {
        let (conn, mut rx) = connection();
        let ctx = request_ctx(&conn, None);
        let sent = run_with_context(ctx, async {
            spawn_in_context(async { ContextChannel.send(ServerMessage::Pong).await })
        })
        .await;
        sent.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
    }
}
