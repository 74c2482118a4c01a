//! Attribute-level key/value store behind the control plane.
//!
//! Every piece of durable state (services, revisions, units, assignments,
//! instance status, locks, region params, stacks) lives in one of a fixed
//! set of tables. Rows are flat attribute maps; typed records in
//! [`records`] serialize into that schema at the boundary. Any ordered
//! key/value store with conditional updates and batched reads can back the
//! trait:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Publisher / Scheduler / Doctor / Agent             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StoreBackend trait                      │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                           │
//!                  ▼                           ▼
//!        ┌─────────────────┐         ┌─────────────────┐
//!        │     SQLite      │         │    In-memory    │
//!        │ Implementation  │         │ Implementation  │
//!        └─────────────────┘         └─────────────────┘
//! ```
//!
//! Tables are named `flotilla-<environment>-<table>`, or `flotilla-<table>`
//! when no environment is configured.

pub mod lock;
pub mod memory;
pub mod records;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use lock::DistributedLocks;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// A stored row: flat attribute map, key attributes included.
pub type Attrs = serde_json::Map<String, serde_json::Value>;

/// Shared handle to a store backend.
pub type SharedBackend = Arc<dyn StoreBackend>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level errors. Backend failures never leak provider error types
/// above this layer; "no such row" is an `Option`, not an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row exists but does not deserialize into the expected record shape
    #[error("malformed row in {table}: {reason}")]
    Malformed { table: &'static str, reason: String },

    /// Backend I/O or protocol failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn malformed(table: Table, reason: impl Into<String>) -> Self {
        Self::Malformed {
            table: table.base_name(),
            reason: reason.into(),
        }
    }

    pub fn backend(reason: impl std::fmt::Display) -> Self {
        Self::Backend(reason.to_string())
    }
}

/// The fixed table set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Assignments,
    Locks,
    Regions,
    Revisions,
    Services,
    Stacks,
    Status,
    Units,
    Users,
}

impl Table {
    /// Every table, for setup.
    pub fn all() -> [Table; 9] {
        [
            Table::Assignments,
            Table::Locks,
            Table::Regions,
            Table::Revisions,
            Table::Services,
            Table::Stacks,
            Table::Status,
            Table::Units,
            Table::Users,
        ]
    }

    /// Bare table name without the environment prefix.
    pub fn base_name(&self) -> &'static str {
        match self {
            Table::Assignments => "assignments",
            Table::Locks => "locks",
            Table::Regions => "regions",
            Table::Revisions => "revisions",
            Table::Services => "services",
            Table::Stacks => "stacks",
            Table::Status => "status",
            Table::Units => "units",
            Table::Users => "users",
        }
    }

    /// Partition key attribute.
    pub fn hash_key(&self) -> &'static str {
        match self {
            Table::Assignments => "instance_id",
            Table::Locks => "lock_name",
            Table::Regions => "region_name",
            Table::Revisions => "rev_hash",
            Table::Services => "service_name",
            Table::Stacks => "stack_arn",
            Table::Status => "service",
            Table::Units => "unit_hash",
            Table::Users => "username",
        }
    }

    /// Sort key attribute, for composite-key tables.
    pub fn range_key(&self) -> Option<&'static str> {
        match self {
            Table::Status => Some("instance_id"),
            _ => None,
        }
    }

    /// Extract a row's key from its attributes.
    pub fn key_of(&self, item: &Attrs) -> StoreResult<Key> {
        let partition = item
            .get(self.hash_key())
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::malformed(*self, format!("missing {}", self.hash_key())))?
            .to_string();
        let sort = match self.range_key() {
            Some(range) => Some(
                item.get(range)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| StoreError::malformed(*self, format!("missing {range}")))?
                    .to_string(),
            ),
            None => None,
        };
        Ok(Key { partition, sort })
    }
}

/// Full table name for an optional environment.
pub fn table_name(environment: Option<&str>, table: Table) -> String {
    match environment {
        Some(env) => format!("flotilla-{env}-{}", table.base_name()),
        None => format!("flotilla-{}", table.base_name()),
    }
}

/// Row key: a partition value plus an optional sort value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub partition: String,
    pub sort: Option<String>,
}

impl Key {
    /// Simple partition key.
    pub fn hash(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: None,
        }
    }

    /// Composite key.
    pub fn composite(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }
}

/// Condition attached to a conditional put. The locks table is the only
/// consumer; every ownership transition is a conditional save.
#[derive(Debug, Clone)]
pub enum PutCondition {
    /// Succeed only if no row exists under the key
    NotExists,
    /// Succeed only if the current row carries exactly these attribute values
    AttrsEqual(Attrs),
}

/// Backend contract: batched reads, conditional and attribute-scoped
/// writes, partition query and segmented scan.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Read one row.
    async fn get(&self, table: Table, key: &Key) -> StoreResult<Option<Attrs>>;

    /// Read many rows; missing keys are silently absent from the result.
    async fn batch_get(&self, table: Table, keys: &[Key]) -> StoreResult<Vec<Attrs>>;

    /// Write a whole row, replacing any existing row under the same key.
    async fn put(&self, table: Table, item: Attrs) -> StoreResult<()>;

    /// Write a whole row iff the condition holds. Returns whether the write
    /// happened.
    async fn put_if(&self, table: Table, item: Attrs, condition: PutCondition) -> StoreResult<bool>;

    /// Write many rows.
    async fn batch_put(&self, table: Table, items: Vec<Attrs>) -> StoreResult<()>;

    /// Attribute-scoped partial update: set only the given attributes,
    /// creating the row when absent. Never overwrites unrelated attributes.
    async fn update(&self, table: Table, key: &Key, updates: Attrs) -> StoreResult<()>;

    /// Remove individual attributes from a row, if it exists.
    async fn remove_attributes(&self, table: Table, key: &Key, attrs: &[String]) -> StoreResult<()>;

    /// Delete one row. Deleting a missing row is not an error.
    async fn delete(&self, table: Table, key: &Key) -> StoreResult<()>;

    /// Delete many rows.
    async fn batch_delete(&self, table: Table, keys: &[Key]) -> StoreResult<()>;

    /// All rows under one partition of a composite-key table.
    async fn query(&self, table: Table, partition: &str) -> StoreResult<Vec<Attrs>>;

    /// Scan one segment of a table. Rows are partitioned across
    /// `total_segments` by key so concurrent schedulers can shard a scan.
    async fn scan(&self, table: Table, segment: usize, total_segments: usize)
        -> StoreResult<Vec<Attrs>>;
}

/// Seconds since the Unix epoch, as stored in `status_time` and
/// `acquire_time` columns.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
