//! Multi-account routing pool for the iFlow chat API
//!
//! Fronts a set of upstream accounts with client-key routing, per-account
//! concurrency caps and circuit breakers, load-balanced selection with
//! failover, and background OAuth token renewal. Account bindings live in
//! a JSON keys file that is hot-reloaded on change.

pub mod admission;
pub mod balance;
pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod refresh;
pub mod registry;

pub use breaker::BreakerStatus;
pub use config::{
    AccountRecord, AuthConfig, KeysStore, ResilienceConfig, RouteRecord, RoutingConfig, Strategy,
    generate_client_key,
};
pub use dispatch::Dispatcher;
pub use error::{Error, PoolCounts, Result};
pub use refresh::Refresher;
pub use registry::{Account, AccountHealth, Registry, Snapshot};
