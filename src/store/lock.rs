//! TTL locks on top of the conditional-put primitive.
//!
//! The locks table is the only store resource with compare-and-set
//! semantics; every ownership transition is a conditional save. Locks are
//! leases: a row older than its TTL is up for grabs, so a crashed holder
//! never wedges the cluster.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::records::LockRecord;
use super::{epoch_seconds, Attrs, Key, PutCondition, SharedBackend, StoreBackend, StoreResult, Table};

/// Lock client bound to one owner identity (normally the instance id).
pub struct DistributedLocks {
    backend: SharedBackend,
    owner: String,
}

impl DistributedLocks {
    pub fn new(backend: SharedBackend, owner: impl Into<String>) -> Self {
        Self {
            backend,
            owner: owner.into(),
        }
    }

    /// Try to take (or keep) a lock.
    ///
    /// Returns `true` when this owner holds the lock on return. `refresh`
    /// extends a lock we already hold; without it an expired own lock can
    /// be stolen like any other.
    pub async fn try_lock(&self, name: &str, ttl: f64, refresh: bool) -> StoreResult<bool> {
        let acquire_time = epoch_seconds();
        let key = Key::hash(name);

        let existing = match self.backend.get(Table::Locks, &key).await? {
            Some(attrs) => LockRecord::from_attrs(attrs)?,
            None => {
                debug!(lock = %name, "Lock not found, creating");
                let created = self
                    .backend
                    .put_if(Table::Locks, self.record(name, acquire_time), PutCondition::NotExists)
                    .await?;
                if !created {
                    debug!(lock = %name, "Lost race creating lock");
                }
                return Ok(created);
            }
        };

        if acquire_time - existing.acquire_time > ttl {
            debug!(
                lock = %name,
                owner = %existing.owner,
                since = %acquired_at(existing.acquire_time),
                "Lock has expired, attempting to acquire"
            );
            let stolen = self
                .backend
                .put_if(
                    Table::Locks,
                    self.record(name, acquire_time),
                    Self::expected(&existing),
                )
                .await?;
            if stolen {
                debug!(lock = %name, "Acquired expired lock");
            } else {
                debug!(lock = %name, "Did not acquire expired lock");
            }
            return Ok(stolen);
        }

        if existing.owner == self.owner {
            debug!(lock = %name, since = %acquired_at(existing.acquire_time), "Lock is held by me");
            if refresh {
                let refreshed = self
                    .backend
                    .put_if(
                        Table::Locks,
                        self.record(name, acquire_time),
                        Self::expected(&existing),
                    )
                    .await?;
                return Ok(refreshed);
            }
            return Ok(true);
        }

        debug!(
            lock = %name,
            owner = %existing.owner,
            since = %acquired_at(existing.acquire_time),
            "Lock is held by another owner"
        );
        Ok(false)
    }

    /// Release a lock we hold. A lock held by someone else (or missing) is
    /// left alone.
    pub async fn release_lock(&self, name: &str) -> StoreResult<()> {
        let key = Key::hash(name);
        match self.backend.get(Table::Locks, &key).await? {
            Some(attrs) => {
                let lock = LockRecord::from_attrs(attrs)?;
                if lock.owner == self.owner {
                    debug!(lock = %name, "Releasing lock");
                    self.backend.delete(Table::Locks, &key).await?;
                } else {
                    debug!(lock = %name, owner = %lock.owner, "Lock held elsewhere, not releasing");
                }
            }
            None => debug!(lock = %name, "Lock not found to release"),
        }
        Ok(())
    }

    /// Current owner and acquire time, if any.
    pub async fn get_owner(&self, name: &str) -> StoreResult<Option<(String, f64)>> {
        match self.backend.get(Table::Locks, &Key::hash(name)).await? {
            Some(attrs) => {
                let lock = LockRecord::from_attrs(attrs)?;
                Ok(Some((lock.owner, lock.acquire_time)))
            }
            None => Ok(None),
        }
    }

    fn record(&self, name: &str, acquire_time: f64) -> Attrs {
        LockRecord {
            lock_name: name.to_string(),
            owner: self.owner.clone(),
            acquire_time,
        }
        .to_attrs()
    }

    fn expected(existing: &LockRecord) -> PutCondition {
        let mut expected = Attrs::new();
        expected.insert("owner".into(), existing.owner.clone().into());
        expected.insert("acquire_time".into(), existing.acquire_time.into());
        PutCondition::AttrsEqual(expected)
    }
}

/// Stored acquire times are raw epoch seconds; render them readably for
/// lock diagnostics.
pub fn acquired_at(acquire_time: f64) -> String {
    DateTime::<Utc>::from_timestamp(acquire_time as i64, 0)
        .map(|when| when.to_rfc3339())
        .unwrap_or_else(|| acquire_time.to_string())
}
