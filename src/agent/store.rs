//! Store access for the agent.
//!
//! The agent reads exactly two assignment rows (its own id and one global
//! shard), resolves them to unit sets, and writes heartbeat status rows.
//! Environments stored as envelope blobs are decrypted here, behind the
//! same [`KeyService`] contract the publisher encrypts with.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crypto::{decrypt_environment, KeyService};
use crate::error::Result;
use crate::models::{global_shard_key, ServiceRevision, ServiceUnit};
use crate::store::records::{
    AssignmentRecord, InstanceStatusRecord, RevisionRecord, UnitRecord, UnitStatus,
};
use crate::store::{epoch_seconds, Key, SharedBackend, StoreBackend, Table};

/// Agent-facing store client, bound to one instance and service.
pub struct AgentStore {
    backend: SharedBackend,
    instance_id: String,
    service: String,
    keys: Arc<dyn KeyService>,
    /// Refuse rows whose stored hash does not match their content.
    strict_content: bool,
}

impl AgentStore {
    pub fn new(
        backend: SharedBackend,
        instance_id: impl Into<String>,
        service: impl Into<String>,
        keys: Arc<dyn KeyService>,
    ) -> Self {
        Self {
            backend,
            instance_id: instance_id.into(),
            service: service.into(),
            keys,
            strict_content: false,
        }
    }

    /// Reject units and revisions whose content hash does not match the
    /// stored key, instead of using them with a warning.
    pub fn with_strict_content(mut self, strict: bool) -> Self {
        self.strict_content = strict;
        self
    }

    /// Write this instance's heartbeat row.
    pub async fn store_status(&self, units: BTreeMap<String, UnitStatus>) -> Result<()> {
        debug!(instance = %self.instance_id, "Storing status");
        let record = InstanceStatusRecord {
            service: self.service.clone(),
            instance_id: self.instance_id.clone(),
            status_time: epoch_seconds(),
            units,
        };
        self.backend.put(Table::Status, record.to_attrs()).await?;
        Ok(())
    }

    /// The sorted, deduplicated revision hashes assigned to this instance:
    /// its own row plus its global shard.
    pub async fn get_assignments(&self) -> Result<Vec<String>> {
        let keys = [
            Key::hash(&self.instance_id),
            Key::hash(global_shard_key(&self.instance_id)),
        ];
        let mut revisions = Vec::new();
        for attrs in self.backend.batch_get(Table::Assignments, &keys).await? {
            let record = AssignmentRecord::from_attrs(attrs)?;
            if let Some(rev_hash) = record.assignment {
                revisions.push(rev_hash);
            }
        }
        revisions.sort();
        revisions.dedup();
        Ok(revisions)
    }

    /// Resolve assigned revisions to the union of their units, each tagged
    /// with the revision it deploys under.
    pub async fn get_units(&self) -> Result<Vec<ServiceUnit>> {
        let mut units = Vec::new();
        for rev_hash in self.get_assignments().await? {
            debug!(revision = %rev_hash, "Assigned, fetching units");
            let revision_units = self.load_revision_units(&rev_hash).await?;
            debug!(revision = %rev_hash, units = revision_units.len(), "Assignment resolved");
            units.extend(revision_units);
        }
        Ok(units)
    }

    async fn load_revision_units(&self, rev_hash: &str) -> Result<Vec<ServiceUnit>> {
        let revision = match self.backend.get(Table::Revisions, &Key::hash(rev_hash)).await? {
            Some(attrs) => RevisionRecord::from_attrs(attrs)?,
            None => {
                warn!(revision = %rev_hash, "Assigned revision not found");
                return Ok(Vec::new());
            }
        };

        let unit_keys: Vec<Key> = revision.units.iter().map(Key::hash).collect();
        let mut units = Vec::new();
        for attrs in self.backend.batch_get(Table::Units, &unit_keys).await? {
            let record = UnitRecord::from_attrs(attrs)?;
            let environment = match &record.environment {
                Some(env) => decrypt_environment(self.keys.as_ref(), env).await?,
                None => BTreeMap::new(),
            };

            let unit = ServiceUnit::new(record.name.clone(), record.unit_file.clone(), environment);
            let unit_hash = unit.unit_hash();
            if unit_hash != record.unit_hash {
                warn!(
                    computed = %unit_hash,
                    stored = %record.unit_hash,
                    "Unit hash mismatch"
                );
                if self.strict_content {
                    continue;
                }
            }
            units.push(unit);
        }

        let computed = ServiceRevision::new(revision.label.clone(), 0, units.clone()).revision_hash();
        if computed != rev_hash {
            warn!(computed = %computed, stored = %rev_hash, "Revision hash mismatch");
            if self.strict_content {
                return Ok(Vec::new());
            }
        }

        Ok(units
            .into_iter()
            .map(|unit| unit.with_rev_hash(rev_hash))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyService;
    use crate::publisher::Publisher;
    use crate::store::{Attrs, MemoryBackend};

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        keys: Arc<LocalKeyService>,
        publisher: Publisher,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let keys = Arc::new(LocalKeyService::new());
        let publisher = Publisher::new(backend.clone(), keys.clone());
        Fixture {
            backend,
            keys,
            publisher,
        }
    }

    fn agent_store(fixture: &Fixture) -> AgentStore {
        AgentStore::new(
            fixture.backend.clone(),
            "i-123",
            "testapp",
            fixture.keys.clone(),
        )
    }

    async fn assign(fixture: &Fixture, instance: &str, rev_hash: &str) {
        let record = AssignmentRecord {
            instance_id: instance.to_string(),
            assignment: Some(rev_hash.to_string()),
            service: Some("testapp".into()),
        };
        fixture
            .backend
            .put(Table::Assignments, record.to_attrs())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_status_writes_row() {
        let fixture = fixture();
        let store = agent_store(&fixture);
        let mut units = BTreeMap::new();
        units.insert("flotilla-app-x.service".to_string(), UnitStatus::running(1.0));
        store.store_status(units).await.unwrap();

        let row = fixture
            .backend
            .get(Table::Status, &Key::composite("testapp", "i-123"))
            .await
            .unwrap()
            .unwrap();
        let record = InstanceStatusRecord::from_attrs(row).unwrap();
        assert!(record.status_time > 0.0);
        assert_eq!(record.units.len(), 1);
    }

    #[tokio::test]
    async fn test_get_assignments_resolves_both_slots() {
        let fixture = fixture();
        let store = agent_store(&fixture);
        assert!(store.get_assignments().await.unwrap().is_empty());

        assign(&fixture, "i-123", &"a".repeat(64)).await;
        assign(&fixture, &global_shard_key("i-123"), &"b".repeat(64)).await;

        let assignments = store.get_assignments().await.unwrap();
        assert_eq!(assignments, vec!["a".repeat(64), "b".repeat(64)]);
    }

    #[tokio::test]
    async fn test_get_assignments_dedups() {
        let fixture = fixture();
        let store = agent_store(&fixture);
        assign(&fixture, "i-123", &"a".repeat(64)).await;
        assign(&fixture, &global_shard_key("i-123"), &"a".repeat(64)).await;
        assert_eq!(store.get_assignments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_units_tags_revision() {
        let fixture = fixture();
        let revision = ServiceRevision::new(
            "v1",
            1,
            vec![
                ServiceUnit::new("a.service", "[Service]\n", env(&[])),
                ServiceUnit::new("b.service", "[Service]\n", env(&[])),
            ],
        );
        let rev_hash = fixture
            .publisher
            .add_revision("testapp", &revision)
            .await
            .unwrap();
        assign(&fixture, "i-123", &rev_hash).await;

        let store = agent_store(&fixture);
        let units = store.get_units().await.unwrap();
        assert_eq!(units.len(), 2);
        for unit in &units {
            assert_eq!(unit.rev_hash.as_deref(), Some(rev_hash.as_str()));
        }
    }

    #[tokio::test]
    async fn test_get_units_decrypts_environment() {
        let fixture = fixture();
        let mut kms = Attrs::new();
        kms.insert("kms_key".into(), "master-1".into());
        fixture.publisher.configure_service("testapp", kms).await.unwrap();

        let revision = ServiceRevision::new(
            "v1",
            1,
            vec![ServiceUnit::new(
                "a.service",
                "[Service]\n",
                env(&[("SECRET", "hunter2")]),
            )],
        );
        let rev_hash = fixture
            .publisher
            .add_revision("testapp", &revision)
            .await
            .unwrap();
        assign(&fixture, "i-123", &rev_hash).await;

        let store = agent_store(&fixture);
        let units = store.get_units().await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].environment.get("SECRET").unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_missing_revision_row_is_empty() {
        let fixture = fixture();
        assign(&fixture, "i-123", &"a".repeat(64)).await;
        let store = agent_store(&fixture);
        assert!(store.get_units().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_unit_warns_but_loads() {
        let fixture = fixture();
        let revision = ServiceRevision::new(
            "v1",
            1,
            vec![ServiceUnit::new("a.service", "[Service]\n", env(&[]))],
        );
        let rev_hash = fixture
            .publisher
            .add_revision("testapp", &revision)
            .await
            .unwrap();
        assign(&fixture, "i-123", &rev_hash).await;

        // Tamper with the stored unit file; the stored value wins.
        let unit_hash = revision.units[0].unit_hash();
        let mut tampered = Attrs::new();
        tampered.insert("unit_file".into(), "[Service]\nRestart=never\n".into());
        fixture
            .backend
            .update(Table::Units, &Key::hash(&unit_hash), tampered)
            .await
            .unwrap();

        let store = agent_store(&fixture);
        let units = store.get_units().await.unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].unit_file.contains("Restart=never"));
    }

    #[tokio::test]
    async fn test_tampered_unit_rejected_when_strict() {
        let fixture = fixture();
        let revision = ServiceRevision::new(
            "v1",
            1,
            vec![ServiceUnit::new("a.service", "[Service]\n", env(&[]))],
        );
        let rev_hash = fixture
            .publisher
            .add_revision("testapp", &revision)
            .await
            .unwrap();
        assign(&fixture, "i-123", &rev_hash).await;

        let unit_hash = revision.units[0].unit_hash();
        let mut tampered = Attrs::new();
        tampered.insert("unit_file".into(), "[Service]\nRestart=never\n".into());
        fixture
            .backend
            .update(Table::Units, &Key::hash(&unit_hash), tampered)
            .await
            .unwrap();

        let store = agent_store(&fixture).with_strict_content(true);
        assert!(store.get_units().await.unwrap().is_empty());
    }
}
