//! Session registry.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Serialize;
use switchyard_core::{
    EventFeed, EvictionReason, FactoryError, GatewayError, LifecycleEvent, SessionId, SessionParts,
    SessionSummary,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::record::{SessionLease, SessionRecord};

type Creation = Shared<BoxFuture<'static, Result<Arc<SessionRecord>, GatewayError>>>;

enum Slot {
    Ready(Arc<SessionRecord>),
    /// A factory is running; every caller for this id awaits the same future.
    Pending { generation: u64, creation: Creation },
}

/// How a finished creation ended for one waiter.
enum Finished {
    Leased(SessionLease),
    /// The record was built after its slot disappeared and was never
    /// registered; nobody else will tear it down.
    Orphaned(Arc<SessionRecord>),
    Retry,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    creation_failures: AtomicU64,
    evictions: AtomicU64,
    handler_failures: AtomicU64,
    routing_failures: AtomicU64,
}

struct Inner {
    slots: Mutex<HashMap<SessionId, Slot>>,
    next_generation: AtomicU64,
    counters: Counters,
    events: Arc<EventFeed>,
    started: Instant,
}

impl Inner {
    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Aggregate counts for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub creation_failures: u64,
    pub evictions: u64,
    pub handler_failures: u64,
    pub routing_failures: u64,
    pub uptime_secs: u64,
}

/// Concurrency-safe map from session id to session record.
///
/// Sole owner of record lifetime. Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(EventFeed::default()))
    }
}

impl SessionRegistry {
    /// Create an empty registry publishing lifecycle events to `events`.
    #[must_use]
    pub fn new(events: Arc<EventFeed>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                counters: Counters::default(),
                events,
                started: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventFeed> {
        &self.inner.events
    }

    /// Lease the record for `id`, creating it with `factory` if absent.
    ///
    /// Concurrent callers for the same unseen id share one `factory`
    /// invocation and all observe its outcome.
    ///
    /// # Errors
    /// `SessionCreation` if the factory fails; nothing is registered then.
    /// `UnknownSession` if the record this call created was removed before
    /// it could be leased.
    pub async fn get_or_create<F, Fut>(
        &self,
        id: &SessionId,
        factory: F,
    ) -> Result<SessionLease, GatewayError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<SessionParts, FactoryError>> + Send + 'static,
    {
        let mut factory = Some(factory);
        loop {
            let (generation, creation) = {
                let mut slots = self.inner.lock_slots();
                match slots.get(id) {
                    Some(Slot::Ready(record)) => return Ok(SessionLease::acquire(record)),
                    Some(Slot::Pending {
                        generation,
                        creation,
                    }) => (*generation, creation.clone()),
                    None => {
                        let Some(factory) = factory.take() else {
                            return Err(GatewayError::UnknownSession(id.clone()));
                        };
                        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                        let creation = build(id.clone(), factory);
                        slots.insert(
                            id.clone(),
                            Slot::Pending {
                                generation,
                                creation: creation.clone(),
                            },
                        );
                        (generation, creation)
                    }
                }
            };

            let outcome = creation.await;
            match self.finish_creation(id, generation, outcome)? {
                Finished::Leased(lease) => return Ok(lease),
                Finished::Orphaned(record) => {
                    debug!(session_id = %id, "tearing down session created after removal");
                    record.teardown().await;
                }
                Finished::Retry => {}
            }
        }
    }

    /// Lease an existing record.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<SessionLease> {
        match self.inner.lock_slots().get(id) {
            Some(Slot::Ready(record)) => Some(SessionLease::acquire(record)),
            _ => None,
        }
    }

    /// Mark the session as used now. No-op if absent.
    pub fn touch(&self, id: &SessionId) {
        if let Some(Slot::Ready(record)) = self.inner.lock_slots().get(id) {
            record.touch();
        }
    }

    /// Evict a session on operator request.
    ///
    /// Returns whether a record was removed. Teardown waits for in-flight
    /// dispatches to finish.
    pub async fn remove(&self, id: &SessionId) -> bool {
        self.evict(id, EvictionReason::Manual).await
    }

    /// Evict a session for `reason`. Returns whether a record was removed.
    pub async fn evict(&self, id: &SessionId, reason: EvictionReason) -> bool {
        let record = {
            let mut slots = self.inner.lock_slots();
            if !matches!(slots.get(id), Some(Slot::Ready(_))) {
                return false;
            }
            match slots.remove(id) {
                Some(Slot::Ready(record)) => record,
                _ => return false,
            }
        };
        self.retire(record, reason).await;
        true
    }

    /// Snapshot of registered sessions, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .inner
            .lock_slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(record) => Some(record.summary()),
                Slot::Pending { .. } => None,
            })
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock_slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every session idle for longer than `threshold`.
    ///
    /// Returns the evicted ids.
    pub async fn evict_idle(&self, threshold: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let candidates: Vec<Arc<SessionRecord>> = {
            let slots = self.inner.lock_slots();
            slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(record) if record.idle_for(now) > threshold => {
                        Some(Arc::clone(record))
                    }
                    _ => None,
                })
                .collect()
        };

        let mut evicted = Vec::with_capacity(candidates.len());
        for record in candidates {
            // Earlier teardowns may have taken a while; skip sessions used since.
            let still_idle = |r: &SessionRecord| r.idle_for(Instant::now()) > threshold;
            if self
                .evict_record(&record, EvictionReason::Idle, still_idle)
                .await
            {
                evicted.push(record.id().clone());
            }
        }
        evicted
    }

    /// Evict everything and wait for every teardown to finish.
    pub async fn drain(&self) {
        let records: Vec<Arc<SessionRecord>> = self
            .inner
            .lock_slots()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(record) => Some(record),
                Slot::Pending { .. } => None,
            })
            .collect();

        info!(count = records.len(), "draining sessions");
        for record in records {
            if self.mark_evicted(&record, EvictionReason::Shutdown) {
                record.wait_idle().await;
                record.teardown().await;
            }
        }
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let counters = &self.inner.counters;
        GatewayStats {
            active_sessions: self.len(),
            sessions_created: counters.created.load(Ordering::Relaxed),
            creation_failures: counters.creation_failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            routing_failures: counters.routing_failures.load(Ordering::Relaxed),
            uptime_secs: self.inner.started.elapsed().as_secs(),
        }
    }

    pub(crate) fn record_handler_failure(&self) {
        self.inner
            .counters
            .handler_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_authorized(&self, id: &SessionId) {
        info!(session_id = %id, "session authorized");
        self.inner.events.push(LifecycleEvent::SessionAuthorized {
            session_id: id.clone(),
        });
    }

    fn finish_creation(
        &self,
        id: &SessionId,
        generation: u64,
        outcome: Result<Arc<SessionRecord>, GatewayError>,
    ) -> Result<Finished, GatewayError> {
        let mut slots = self.inner.lock_slots();
        let ours = matches!(
            slots.get(id),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );

        let record = match outcome {
            Ok(record) => record,
            Err(e) => {
                if ours {
                    slots.remove(id);
                    drop(slots);
                    self.inner
                        .counters
                        .creation_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(session_id = %id, error = %e, "session creation failed");
                }
                return Err(e);
            }
        };

        if ours {
            record.mark_registered();
            slots.insert(id.clone(), Slot::Ready(Arc::clone(&record)));
            let lease = SessionLease::acquire(&record);
            drop(slots);
            self.on_created(&record);
            return Ok(Finished::Leased(lease));
        }

        // Another waiter already finished this creation, or the slot was
        // dropped (removed, or drained) before we got here.
        match slots.get(id) {
            Some(Slot::Ready(current)) if Arc::ptr_eq(current, &record) => {
                Ok(Finished::Leased(SessionLease::acquire(current)))
            }
            // Registered records are torn down by whoever evicted them.
            _ if record.is_registered() => Ok(Finished::Retry),
            _ => Ok(Finished::Orphaned(record)),
        }
    }

    fn on_created(&self, record: &Arc<SessionRecord>) {
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        self.inner.events.push(LifecycleEvent::SessionCreated {
            session_id: record.id().clone(),
        });

        let registry = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(record);
        record.transport().on_failure(move |id, err| {
            let (Some(inner), Some(record)) = (registry.upgrade(), target.upgrade()) else {
                return;
            };
            inner.counters.routing_failures.fetch_add(1, Ordering::Relaxed);
            inner.events.push(LifecycleEvent::RoutingFailed {
                session_id: id.clone(),
                error: err.to_string(),
            });
            let registry = SessionRegistry { inner };
            tokio::spawn(async move {
                registry
                    .evict_record(&record, EvictionReason::RoutingFailure, |_| true)
                    .await;
            });
        });

        info!(session_id = %record.id(), "session created");
    }

    /// Remove `record` only if it is still the one registered under its id
    /// and `confirm` holds for it under the map lock.
    async fn evict_record<F>(
        &self,
        record: &Arc<SessionRecord>,
        reason: EvictionReason,
        confirm: F,
    ) -> bool
    where
        F: Fn(&SessionRecord) -> bool,
    {
        {
            let mut slots = self.inner.lock_slots();
            match slots.get(record.id()) {
                Some(Slot::Ready(current)) if Arc::ptr_eq(current, record) && confirm(current) => {
                    slots.remove(record.id());
                }
                _ => return false,
            }
        }
        self.retire(Arc::clone(record), reason).await;
        true
    }

    fn mark_evicted(&self, record: &SessionRecord, reason: EvictionReason) -> bool {
        if !record.mark_evicting() {
            return false;
        }
        self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
        self.inner.events.push(LifecycleEvent::SessionEvicted {
            session_id: record.id().clone(),
            reason,
        });
        info!(session_id = %record.id(), %reason, "session evicted");
        true
    }

    /// Tear down a record already removed from the map.
    async fn retire(&self, record: Arc<SessionRecord>, reason: EvictionReason) {
        if !self.mark_evicted(&record, reason) {
            return;
        }
        if record.in_flight() == 0 {
            record.teardown().await;
        } else {
            debug!(
                session_id = %record.id(),
                in_flight = record.in_flight(),
                "deferring teardown until dispatches finish"
            );
            tokio::spawn(async move {
                record.wait_idle().await;
                record.teardown().await;
            });
        }
    }
}

fn build<F, Fut>(id: SessionId, factory: F) -> Creation
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<SessionParts, FactoryError>> + Send + 'static,
{
    async move {
        match factory().await {
            Ok(parts) => Ok(Arc::new(SessionRecord::new(id, parts))),
            Err(e) => Err(GatewayError::SessionCreation {
                id,
                reason: e.to_string(),
            }),
        }
    }
    .boxed()
    .shared()
}
