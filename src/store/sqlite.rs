//! SQLite store backend.
//!
//! One file per region/environment. Rows are kept as JSON attribute blobs
//! under a `(pk, sk)` primary key, which keeps the flat attribute schema
//! intact while SQLite provides the durability, conditional writes and
//! batched access the trait requires.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use super::{table_name, Attrs, Key, PutCondition, StoreBackend, StoreError, StoreResult, Table};

/// Store backend persisting every table into one SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    environment: Option<String>,
}

impl SqliteBackend {
    /// Open (or create) the database and ensure every table exists.
    pub fn open(path: impl AsRef<Path>, environment: Option<&str>) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        Self::with_connection(conn, environment)
    }

    /// Private database for tests.
    pub fn open_in_memory(environment: Option<&str>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::backend)?;
        Self::with_connection(conn, environment)
    }

    fn with_connection(conn: Connection, environment: Option<&str>) -> StoreResult<Self> {
        let backend = Self {
            conn: Mutex::new(conn),
            environment: environment.map(str::to_string),
        };
        backend.setup()?;
        Ok(backend)
    }

    /// Create any missing tables.
    pub fn setup(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        for table in Table::all() {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    pk TEXT NOT NULL,
                    sk TEXT NOT NULL DEFAULT '',
                    attrs TEXT NOT NULL,
                    PRIMARY KEY (pk, sk)
                )",
                self.table(table)
            );
            conn.execute(&sql, []).map_err(StoreError::backend)?;
        }
        Ok(())
    }

    fn table(&self, table: Table) -> String {
        table_name(self.environment.as_deref(), table)
    }

    fn sort_value(key: &Key) -> &str {
        key.sort.as_deref().unwrap_or("")
    }

    fn encode(item: &Attrs) -> StoreResult<String> {
        serde_json::to_string(item).map_err(StoreError::backend)
    }

    fn decode(table: Table, raw: String) -> StoreResult<Attrs> {
        serde_json::from_str(&raw).map_err(|e| StoreError::malformed(table, e.to_string()))
    }

    fn read_row(conn: &Connection, name: &str, table: Table, key: &Key) -> StoreResult<Option<Attrs>> {
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT attrs FROM \"{name}\" WHERE pk = ?1 AND sk = ?2"),
                params![key.partition, Self::sort_value(key)],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)?;
        raw.map(|raw| Self::decode(table, raw)).transpose()
    }

    fn write_row(conn: &Connection, name: &str, key: &Key, item: &Attrs) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT OR REPLACE INTO \"{name}\" (pk, sk, attrs) VALUES (?1, ?2, ?3)"),
            params![key.partition, Self::sort_value(key), Self::encode(item)?],
        )
        .map_err(StoreError::backend)?;
        Ok(())
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

    fn shard_of(partition: &str, total_segments: usize) -> usize {
        let digest = Sha256::digest(partition.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % total_segments as u64) as usize
    }
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    async fn get(&self, table: Table, key: &Key) -> StoreResult<Option<Attrs>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        Self::read_row(&conn, &self.table(table), table, key)
    }

    async fn batch_get(&self, table: Table, keys: &[Key]) -> StoreResult<Vec<Attrs>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let name = self.table(table);
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = Self::read_row(&conn, &name, table, key)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn put(&self, table: Table, item: Attrs) -> StoreResult<()> {
        let key = table.key_of(&item)?;
        let conn = self.conn.lock().expect("store connection poisoned");
        Self::write_row(&conn, &self.table(table), &key, &item)
    }

    async fn put_if(&self, table: Table, item: Attrs, condition: PutCondition) -> StoreResult<bool> {
        let key = table.key_of(&item)?;
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let name = self.table(table);
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(StoreError::backend)?;
        let existing = Self::read_row(&tx, &name, table, &key)?;
        if !Self::condition_holds(existing.as_ref(), &condition) {
            return Ok(false);
        }
        Self::write_row(&tx, &name, &key, &item)?;
        tx.commit().map_err(StoreError::backend)?;
        Ok(true)
    }

    async fn batch_put(&self, table: Table, items: Vec<Attrs>) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let name = self.table(table);
        let tx = conn.transaction().map_err(StoreError::backend)?;
        for item in &items {
            let key = table.key_of(item)?;
            Self::write_row(&tx, &name, &key, item)?;
        }
        tx.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    async fn update(&self, table: Table, key: &Key, updates: Attrs) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let name = self.table(table);
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(StoreError::backend)?;
        let mut row = Self::read_row(&tx, &name, table, key)?.unwrap_or_else(|| {
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
        Self::write_row(&tx, &name, key, &row)?;
        tx.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    async fn remove_attributes(&self, table: Table, key: &Key, attrs: &[String]) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let name = self.table(table);
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(StoreError::backend)?;
        if let Some(mut row) = Self::read_row(&tx, &name, table, key)? {
            for attr in attrs {
                row.remove(attr);
            }
            Self::write_row(&tx, &name, key, &row)?;
            tx.commit().map_err(StoreError::backend)?;
        }
        Ok(())
    }

    async fn delete(&self, table: Table, key: &Key) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            &format!("DELETE FROM \"{}\" WHERE pk = ?1 AND sk = ?2", self.table(table)),
            params![key.partition, Self::sort_value(key)],
        )
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn batch_delete(&self, table: Table, keys: &[Key]) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let name = self.table(table);
        let tx = conn.transaction().map_err(StoreError::backend)?;
        for key in keys {
            tx.execute(
                &format!("DELETE FROM \"{name}\" WHERE pk = ?1 AND sk = ?2"),
                params![key.partition, Self::sort_value(key)],
            )
            .map_err(StoreError::backend)?;
        }
        tx.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    async fn query(&self, table: Table, partition: &str) -> StoreResult<Vec<Attrs>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT attrs FROM \"{}\" WHERE pk = ?1 ORDER BY sk",
                self.table(table)
            ))
            .map_err(StoreError::backend)?;
        let raw_rows = stmt
            .query_map(params![partition], |row| row.get::<_, String>(0))
            .map_err(StoreError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)?;
        raw_rows
            .into_iter()
            .map(|raw| Self::decode(table, raw))
            .collect()
    }

    async fn scan(
        &self,
        table: Table,
        segment: usize,
        total_segments: usize,
    ) -> StoreResult<Vec<Attrs>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT pk, attrs FROM \"{}\" ORDER BY pk, sk",
                self.table(table)
            ))
            .map_err(StoreError::backend)?;
        let raw_rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(StoreError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)?;

        let mut rows = Vec::new();
        for (partition, raw) in raw_rows {
            if total_segments > 1 && Self::shard_of(&partition, total_segments) != segment {
                continue;
            }
            rows.push(Self::decode(table, raw)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pairs: &[(&str, &str)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let backend = SqliteBackend::open_in_memory(Some("test")).unwrap();
        backend
            .put(Table::Locks, item(&[("lock_name", "scheduler"), ("owner", "i-1")]))
            .await
            .unwrap();
        let row = backend
            .get(Table::Locks, &Key::hash("scheduler"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("owner").unwrap().as_str(), Some("i-1"));
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let backend = SqliteBackend::open_in_memory(None).unwrap();
        let row = item(&[("lock_name", "deploy"), ("owner", "i-1")]);
        assert!(backend
            .put_if(Table::Locks, row.clone(), PutCondition::NotExists)
            .await
            .unwrap());
        assert!(!backend
            .put_if(Table::Locks, row.clone(), PutCondition::NotExists)
            .await
            .unwrap());

        let steal = item(&[("lock_name", "deploy"), ("owner", "i-2")]);
        assert!(backend
            .put_if(
                Table::Locks,
                steal,
                PutCondition::AttrsEqual(item(&[("owner", "i-1")]))
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_update_preserves_other_attributes() {
        let backend = SqliteBackend::open_in_memory(None).unwrap();
        backend
            .put(
                Table::Services,
                item(&[("service_name", "testapp"), ("dns_name", "a.example.com")]),
            )
            .await
            .unwrap();
        backend
            .update(
                Table::Services,
                &Key::hash("testapp"),
                item(&[("elb_scheme", "internal")]),
            )
            .await
            .unwrap();
        let row = backend
            .get(Table::Services, &Key::hash("testapp"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("dns_name").unwrap().as_str(), Some("a.example.com"));
        assert_eq!(row.get("elb_scheme").unwrap().as_str(), Some("internal"));
    }

    #[tokio::test]
    async fn test_query_composite() {
        let backend = SqliteBackend::open_in_memory(None).unwrap();
        backend
            .put(
                Table::Status,
                item(&[("service", "testapp"), ("instance_id", "i-1")]),
            )
            .await
            .unwrap();
        backend
            .put(
                Table::Status,
                item(&[("service", "testapp"), ("instance_id", "i-2")]),
            )
            .await
            .unwrap();
        assert_eq!(backend.query(Table::Status, "testapp").await.unwrap().len(), 2);
        assert!(backend.query(Table::Status, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let backend = SqliteBackend::open(&path, None).unwrap();
            backend
                .put(Table::Regions, item(&[("region_name", "us-east-1")]))
                .await
                .unwrap();
        }
        let backend = SqliteBackend::open(&path, None).unwrap();
        assert!(backend
            .get(Table::Regions, &Key::hash("us-east-1"))
            .await
            .unwrap()
            .is_some());
    }
}
