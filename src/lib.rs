//! phonecheck - Phone number verification scheduler
//!
//! Schedules reputation lookups for batches of phone numbers across a pool of
//! exclusive automation endpoints, one provider per endpoint.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and component wiring
//! - [`models`] - Core data structures and types
//! - [`pool`] - Endpoint pool, health probes and exclusive leases
//! - [`cache`] - Per-(number, provider) result cache with TTL
//! - [`strategy`] - Routing table and provider selection
//! - [`repository`] - Job persistence (in-memory, SQLite)
//! - [`scheduler`] - Job submission, worker pool, retry and backoff
//! - [`coordinator`] - Redis-backed leases and queue for multi-instance setups
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Phone normalization, retry helpers, clocks
//!
//! # Example
//!
//! ```no_run
//! use phonecheck::config::Config;
//! use phonecheck::scheduler::{ProviderRegistry, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let registry = ProviderRegistry::new(); // register lookup drivers here
//!     let components = config.build_components(registry).await?;
//!     let scheduler = Scheduler::new(components, config.scheduler_options())?;
//!     scheduler.start().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod repository;
pub mod scheduler;
pub mod strategy;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{MemoryCache, ResultCache};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, ErrorClass, Result};
    pub use crate::models::{
        CheckStatus, JobId, JobState, JobStatusView, LookupOutcome, NumberResult, PhoneNumber,
        Provider, SubmitOptions,
    };
    pub use crate::pool::{Endpoint, EndpointPool, HealthState, Lease};
    pub use crate::repository::{JobRepository, MemoryJobRepository, SqliteJobRepository};
    pub use crate::scheduler::{
        Components, LookupError, LookupProvider, ProviderRegistry, Scheduler, SchedulerOptions,
    };
    pub use crate::strategy::{RoutingTable, StrategySelector};
}

// Direct re-exports for convenience
pub use models::{CheckStatus, JobId, JobState, PhoneNumber, Provider};
