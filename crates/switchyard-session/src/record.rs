//! Session records and dispatch leases.

use std::{
    ops::Deref,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use switchyard_core::{
    AuthHandle, ProtocolHandler, RoutingTransport, SessionId, SessionParts, SessionState,
    SessionSummary,
};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

struct Usage {
    last_used: Instant,
    last_used_at: i64,
}

/// Isolated resource bundle for one caller.
///
/// Owned by the registry. Other components only reach a record through a
/// [`SessionLease`], which keeps teardown from starting underneath them.
pub struct SessionRecord {
    id: SessionId,
    protocol: Arc<dyn ProtocolHandler>,
    transport: Arc<RoutingTransport>,
    auth: RwLock<Option<AuthHandle>>,
    state: Mutex<SessionState>,
    created_at: i64,
    usage: Mutex<Usage>,
    in_flight: watch::Sender<usize>,
    cancel: CancellationToken,
    registered: AtomicBool,
    torn_down: AtomicBool,
}

impl SessionRecord {
    pub(crate) fn new(id: SessionId, parts: SessionParts) -> Self {
        let now = now_millis();
        Self {
            id,
            protocol: parts.protocol,
            transport: parts.transport,
            auth: RwLock::new(None),
            state: Mutex::new(SessionState::PendingAuth),
            created_at: now,
            usage: Mutex::new(Usage {
                last_used: Instant::now(),
                last_used_at: now,
            }),
            in_flight: watch::Sender::new(0),
            cancel: CancellationToken::new(),
            registered: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn protocol(&self) -> &Arc<dyn ProtocolHandler> {
        &self.protocol
    }

    #[must_use]
    pub const fn transport(&self) -> &Arc<RoutingTransport> {
        &self.transport
    }

    #[must_use]
    pub fn auth_handle(&self) -> Option<AuthHandle> {
        self.auth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancelled on teardown.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Number of dispatches currently holding a lease.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Time since the last dispatch.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock_usage().last_used)
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            last_used_at: self.lock_usage().last_used_at,
            state: self.state(),
        }
    }

    /// Called once, under the registry lock, when the record enters the map.
    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        let mut usage = self.lock_usage();
        usage.last_used = Instant::now();
        usage.last_used_at = now_millis();
    }

    /// Store the authenticated client handle.
    ///
    /// Returns `true` if this moved the session from `PendingAuth` to `Active`.
    pub(crate) fn set_auth(&self, handle: AuthHandle) -> bool {
        *self.auth.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::PendingAuth {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    /// Returns `false` if the record was already evicting.
    pub(crate) fn mark_evicting(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Evicting {
            false
        } else {
            *state = SessionState::Evicting;
            true
        }
    }

    /// Wait until no dispatch holds a lease.
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Cancel session-scoped work and release the protocol instance and
    /// transport. Idempotent.
    pub(crate) async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.protocol.shutdown().await;
        self.transport.close().await;
        debug!(session_id = %self.id, "session torn down");
    }

    fn lock_usage(&self) -> std::sync::MutexGuard<'_, Usage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Access to a session record for the duration of one dispatch.
///
/// While any lease is alive, eviction removes the record from the registry
/// but postpones teardown.
pub struct SessionLease {
    record: Arc<SessionRecord>,
}

impl SessionLease {
    /// Only called by the registry while it holds its map lock, so no lease
    /// can be taken on a record that has already been removed.
    pub(crate) fn acquire(record: &Arc<SessionRecord>) -> Self {
        record.in_flight.send_modify(|count| *count += 1);
        Self {
            record: Arc::clone(record),
        }
    }

    /// Whether two leases refer to the same record.
    #[must_use]
    pub fn same_record(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl Deref for SessionLease {
    type Target = SessionRecord;

    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.record
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use switchyard_core::{ClientMessage, HandlerError};

    use super::*;

    pub(crate) struct NoopProtocol;

    #[async_trait]
    impl ProtocolHandler for NoopProtocol {
        async fn handle(&self, _message: ClientMessage) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    pub(crate) fn parts(id: &str) -> SessionParts {
        SessionParts {
            protocol: Arc::new(NoopProtocol),
            transport: Arc::new(RoutingTransport::for_session(SessionId::from(id))),
        }
    }

    #[test]
    fn test_auth_activates_once() {
        let record = SessionRecord::new(SessionId::from("s"), parts("s"));
        assert_eq!(record.state(), SessionState::PendingAuth);
        assert!(record.auth_handle().is_none());

        assert!(record.set_auth(AuthHandle::new("client")));
        assert_eq!(record.state(), SessionState::Active);
        assert!(!record.set_auth(AuthHandle::new("again")));
        assert!(record.auth_handle().is_some());
    }

    #[test]
    fn test_mark_evicting_once() {
        let record = SessionRecord::new(SessionId::from("s"), parts("s"));
        assert!(record.mark_evicting());
        assert!(!record.mark_evicting());
        assert_eq!(record.summary().state, SessionState::Evicting);
    }

    #[tokio::test]
    async fn test_leases_track_in_flight() {
        let record = Arc::new(SessionRecord::new(SessionId::from("s"), parts("s")));
        let first = SessionLease::acquire(&record);
        let second = SessionLease::acquire(&record);
        assert!(first.same_record(&second));
        assert_eq!(record.in_flight(), 2);

        drop(first);
        assert_eq!(record.in_flight(), 1);

        let waiter = {
            let record = Arc::clone(&record);
            tokio::spawn(async move { record.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(second);
        waiter.await.unwrap();
        assert_eq!(record.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let record = SessionRecord::new(SessionId::from("s"), parts("s"));
        record.teardown().await;
        record.teardown().await;
        assert!(record.is_torn_down());
        assert!(record.cancellation().is_cancelled());
        assert!(record.transport().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle_time() {
        let record = SessionRecord::new(SessionId::from("s"), parts("s"));
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(record.idle_for(Instant::now()) >= Duration::from_secs(90));

        record.touch();
        assert_eq!(record.idle_for(Instant::now()), Duration::ZERO);
    }
}
