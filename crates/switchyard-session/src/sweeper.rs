//! Background eviction of idle sessions.

use std::time::Duration;

use switchyard_core::SessionId;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::SessionRegistry;

/// Sweeper timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Sessions unused for longer than this are evicted.
    pub idle_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Periodically evicts idle sessions from a registry.
pub struct Sweeper {
    registry: SessionRegistry,
    config: SweeperConfig,
}

impl Sweeper {
    #[must_use]
    pub const fn new(registry: SessionRegistry, config: SweeperConfig) -> Self {
        Self { registry, config }
    }

    /// Run one sweep now. Returns the evicted ids.
    pub async fn sweep(&self) -> Vec<SessionId> {
        let evicted = self.registry.evict_idle(self.config.idle_timeout).await;
        if evicted.is_empty() {
            debug!("sweep found no idle sessions");
        } else {
            info!(count = evicted.len(), "evicted idle sessions");
        }
        evicted
    }

    /// Sweep on every tick until `shutdown` is cancelled.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }
}
