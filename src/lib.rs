//! flotilla - Multi-region fleet orchestrator
//!
//! Deploys weighted collections of service units ("revisions") onto a pool
//! of worker instances and keeps the desired distribution in sync through
//! churn, concurrent schedulers and partial deployment failures.
//!
//! # Architecture
//!
//! The library is organized into cooperating components:
//!
//! - [`store`] - durable state behind an attribute-level KV trait (SQLite
//!   or in-memory), plus TTL locks
//! - [`models`] - content-addressed units and revisions
//! - [`publisher`] - writes revisions, weights and configuration
//! - [`scheduler`] - leader-elected weighted placement, doctor, messaging
//! - [`agent`] - per-instance reconcile loop and unit convergence
//! - [`messaging`] - typed best-effort queues (Redis or in-memory)
//! - [`crypto`] - envelope encryption for unit environments
//! - [`tasks`] - periodic workers with overrun skipping and stop signals
//!
//! # Example
//!
//! ```no_run
//! use flotilla::config::Config;
//! use flotilla::store::SqliteBackend;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let _backend = SqliteBackend::open(&config.store.sqlite_path, config.environment.as_deref())?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod crypto;
pub mod error;
pub mod loadbalancer;
pub mod messaging;
pub mod models;
pub mod publisher;
pub mod scheduler;
pub mod ssh;
pub mod store;
pub mod tasks;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::Agent;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::models::{ServiceRevision, ServiceUnit};
    pub use crate::publisher::Publisher;
    pub use crate::scheduler::{Scheduler, ServiceDoctor};
    pub use crate::store::{MemoryBackend, SqliteBackend, StoreBackend};
}

// Direct re-exports for convenience
pub use models::{ServiceRevision, ServiceUnit};
