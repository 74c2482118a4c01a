//! In-memory store backend.
//!
//! Backs unit tests and single-process demos. Semantics match the durable
//! backend: conditional puts are atomic under the table lock, partial
//! updates are attribute scoped, scans shard rows by key hash.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{Attrs, Key, PutCondition, StoreBackend, StoreResult, Table};

type Rows = BTreeMap<Key, Attrs>;

/// Store backend holding every table in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, Rows>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a table, for tests.
    pub async fn len(&self, table: Table) -> usize {
        self.tables
            .read()
            .await
            .get(&table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    fn condition_holds(existing: Option<&Attrs>, condition: &PutCondition) -> bool {
        match condition {
            PutCondition::NotExists => existing.is_none(),
            PutCondition::AttrsEqual(expected) => match existing {
                Some(current) => expected
                    .iter()
                    .all(|(attr, value)| current.get(attr) == Some(value)),
                None => false,
            },
        }
    }

    fn shard_of(key: &Key, total_segments: usize) -> usize {
        let digest = Sha256::digest(key.partition.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % total_segments as u64) as usize
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, table: Table, key: &Key) -> StoreResult<Option<Attrs>> {
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn batch_get(&self, table: Table, keys: &[Key]) -> StoreResult<Vec<Attrs>> {
        let tables = self.tables.read().await;
        let rows = match tables.get(&table) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        Ok(keys.iter().filter_map(|key| rows.get(key).cloned()).collect())
    }

    async fn put(&self, table: Table, item: Attrs) -> StoreResult<()> {
        let key = table.key_of(&item)?;
        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .insert(key, item);
        Ok(())
    }

    async fn put_if(&self, table: Table, item: Attrs, condition: PutCondition) -> StoreResult<bool> {
        let key = table.key_of(&item)?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        if !Self::condition_holds(rows.get(&key), &condition) {
            return Ok(false);
        }
        rows.insert(key, item);
        Ok(true)
    }

    async fn batch_put(&self, table: Table, items: Vec<Attrs>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        for item in items {
            let key = table.key_of(&item)?;
            rows.insert(key, item);
        }
        Ok(())
    }

    async fn update(&self, table: Table, key: &Key, updates: Attrs) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        let row = rows.entry(key.clone()).or_insert_with(|| {
            let mut fresh = Attrs::new();
            fresh.insert(table.hash_key().into(), key.partition.clone().into());
            if let (Some(range), Some(sort)) = (table.range_key(), &key.sort) {
                fresh.insert(range.into(), sort.clone().into());
            }
            fresh
        });
        for (attr, value) in updates {
            row.insert(attr, value);
        }
        Ok(())
    }

    async fn remove_attributes(&self, table: Table, key: &Key, attrs: &[String]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.get_mut(&table).and_then(|rows| rows.get_mut(key)) {
            for attr in attrs {
                row.remove(attr);
            }
        }
        Ok(())
    }

    async fn delete(&self, table: Table, key: &Key) -> StoreResult<()> {
        if let Some(rows) = self.tables.write().await.get_mut(&table) {
            rows.remove(key);
        }
        Ok(())
    }

    async fn batch_delete(&self, table: Table, keys: &[Key]) -> StoreResult<()> {
        if let Some(rows) = self.tables.write().await.get_mut(&table) {
            for key in keys {
                rows.remove(key);
            }
        }
        Ok(())
    }

    async fn query(&self, table: Table, partition: &str) -> StoreResult<Vec<Attrs>> {
        let tables = self.tables.read().await;
        let rows = match tables.get(&table) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        Ok(rows
            .iter()
            .filter(|(key, _)| key.partition == partition)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn scan(
        &self,
        table: Table,
        segment: usize,
        total_segments: usize,
    ) -> StoreResult<Vec<Attrs>> {
        let tables = self.tables.read().await;
        let rows = match tables.get(&table) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        if total_segments <= 1 {
            return Ok(rows.values().cloned().collect());
        }
        Ok(rows
            .iter()
            .filter(|(key, _)| Self::shard_of(key, total_segments) == segment)
            .map(|(_, row)| row.clone())
            .collect())
    }
}
