//! CLI command implementations.
//!
//! Each command translates flags into publisher calls or starts one of the
//! daemon supervisors. Shared wiring (instance identity, store backend,
//! queue connections) lives here.

pub mod agent;
pub mod init;
pub mod keys;
pub mod region;
pub mod revision;
pub mod scheduler;
pub mod service;
pub mod user;

use anyhow::{Context, Result};
use std::sync::Arc;

use flotilla::config::Config;
use flotilla::messaging::{MessageQueue, RedisQueue};
use flotilla::store::{SharedBackend, SqliteBackend};

/// Resolve this process's instance identity: `FLOTILLA_INSTANCE_ID`, then
/// the machine id, then a random fallback.
pub fn instance_id() -> String {
    if let Ok(id) = std::env::var("FLOTILLA_INSTANCE_ID") {
        if !id.is_empty() {
            return id;
        }
    }
    if let Ok(machine_id) = std::fs::read_to_string("/etc/machine-id") {
        let machine_id = machine_id.trim();
        if !machine_id.is_empty() {
            return format!("i-{}", &machine_id[..machine_id.len().min(12)]);
        }
    }
    format!("i-{}", uuid::Uuid::new_v4().simple())
}

/// Open the durable store for an environment, creating the parent
/// directory when needed.
pub fn open_backend(config: &Config) -> Result<SharedBackend> {
    if let Some(parent) = config.store.sqlite_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let backend = SqliteBackend::open(&config.store.sqlite_path, config.environment.as_deref())
        .context("Failed to open store")?;
    Ok(Arc::new(backend))
}

/// Connect a queue, failing with context when the broker is unreachable.
pub async fn connect_queue(config: &Config, name: &str) -> Result<Arc<dyn MessageQueue>> {
    let queue = RedisQueue::connect(&config.messaging.redis_url, name)
        .await
        .with_context(|| format!("Failed to connect queue {name}"))?;
    Ok(Arc::new(queue))
}
