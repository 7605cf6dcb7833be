//! Request context and the task-local context carrier.
//!
//! Every inbound message is handled inside a [`run_with_context`] scope.
//! Code anywhere below that scope, including code that runs after `.await`
//! points, can call [`current_context`] to find out which session and which
//! connection it is working for. The binding is task-local, not
//! thread-local: concurrently handled messages never observe each other's
//! context even when they share a worker thread.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{AuthHandle, ConnectionHandle, RequestId, SessionId};

tokio::task_local! {
    static CURRENT: RequestContext;
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Immutable per-message context.
///
/// Built once per inbound message. Cloning shares the same instance, and two
/// contexts compare equal only if they are clones of one another.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    serial: u64,
    session_id: SessionId,
    connection: ConnectionHandle,
    request_id: Option<RequestId>,
    auth: Option<AuthHandle>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Context with no request id, no auth handle, and a fresh cancellation token.
    #[must_use]
    pub fn new(session_id: SessionId, connection: ConnectionHandle) -> Self {
        Self::builder(session_id, connection).build()
    }

    #[must_use]
    pub fn builder(session_id: SessionId, connection: ConnectionHandle) -> ContextBuilder {
        ContextBuilder {
            session_id,
            connection,
            request_id: None,
            auth: None,
            cancel: None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Connection the message arrived on.
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.inner.connection
    }

    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.inner.request_id
    }

    /// Auth handle resolved for this request, if the session is authorized.
    #[must_use]
    pub fn auth(&self) -> Option<&AuthHandle> {
        self.inner.auth.as_ref()
    }

    /// Cancelled when the owning session is torn down.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }
}

impl PartialEq for RequestContext {
    fn eq(&self, other: &Self) -> bool {
        self.inner.serial == other.inner.serial
    }
}

impl Eq for RequestContext {}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("serial", &self.inner.serial)
            .field("session_id", &self.inner.session_id)
            .field("connection", &self.inner.connection.id())
            .field("request_id", &self.inner.request_id)
            .field("authorized", &self.inner.auth.is_some())
            .finish()
    }
}

/// Builder for [`RequestContext`].
pub struct ContextBuilder {
    session_id: SessionId,
    connection: ConnectionHandle,
    request_id: Option<RequestId>,
    auth: Option<AuthHandle>,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    #[must_use]
    pub const fn request_id(mut self, id: Option<RequestId>) -> Self {
        self.request_id = id;
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: Option<AuthHandle>) -> Self {
        self.auth = auth;
        self
    }

    /// Tie the context to a session-scoped cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn build(self) -> RequestContext {
        RequestContext {
            inner: Arc::new(ContextInner {
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                session_id: self.session_id,
                connection: self.connection,
                request_id: self.request_id,
                auth: self.auth,
                cancel: self.cancel.unwrap_or_default(),
            }),
        }
    }
}

/// Run `fut` with `ctx` as the active context.
///
/// Nested scopes shadow the outer one for their own extent; the outer context
/// is visible again once the inner future completes.
pub async fn run_with_context<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// Synchronous variant of [`run_with_context`].
pub fn run_with_context_sync<R>(ctx: RequestContext, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(ctx, f)
}

/// The active context, or `None` outside any scope.
#[must_use]
pub fn current_context() -> Option<RequestContext> {
    CURRENT.try_with(RequestContext::clone).ok()
}

/// Spawn a task that inherits the caller's active context, if any.
///
/// `tokio::spawn` starts a new task with no task-locals; use this for
/// background work that must still write to the originating connection.
pub fn spawn_in_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let ctx = current_context();
    tokio::spawn(async move {
        match ctx {
            Some(ctx) => CURRENT.scope(ctx, fut).await,
            None => fut.await,
        }
    })
}
