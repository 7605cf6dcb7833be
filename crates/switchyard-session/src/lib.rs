//! Session lifecycle and request dispatch for the switchyard gateway.
//!
//! Provides:
//! - `SessionRegistry` - Owns session records: create, lease, touch, evict
//! - `Sweeper` - Background idle-session eviction
//! - `Dispatcher` - Per-message entry point
//! - `AuthCoordinator` - Authorization handshake bookkeeping
//! - `GatewayConfig` - File + environment configuration

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod record;
pub mod registry;
pub mod sweeper;

pub use auth::AuthCoordinator;
pub use config::{ConfigError, GatewayConfig};
pub use dispatcher::Dispatcher;
pub use record::{SessionLease, SessionRecord};
pub use registry::{GatewayStats, SessionRegistry};
pub use sweeper::{Sweeper, SweeperConfig};
