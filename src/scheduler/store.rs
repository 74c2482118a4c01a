//! Store access for the scheduler and doctor.
//!
//! Wraps the backend with the queries the balance loop needs: the weight
//! vectors of every service, the live instance set per service (garbage
//! collecting stale instances on the way), and batched assignment writes.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::models::is_rev_hash;
use crate::store::records::{AssignmentRecord, InstanceStatusRecord, ServiceRecord, UnitStatus};
use crate::store::{epoch_seconds, Attrs, Key, SharedBackend, StoreBackend, StoreResult, Table};

/// Seconds without a heartbeat before an instance is dead.
pub const INSTANCE_EXPIRY: f64 = 300.0;

/// Scheduler-facing store client. `segment`/`segments` shard the service
/// scan so multiple schedulers can split a region.
pub struct SchedulerStore {
    backend: SharedBackend,
    segment: usize,
    segments: usize,
}

impl SchedulerStore {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            segment: 0,
            segments: 1,
        }
    }

    /// Restrict this store to one scan segment.
    pub fn with_segment(mut self, segment: usize, segments: usize) -> Self {
        self.segment = segment;
        self.segments = segments.max(1);
        self
    }

    /// Weight vectors for every service in this store's segment. Only
    /// non-negative weights are returned; quarantined revisions are
    /// invisible to the balance loop.
    pub async fn get_revision_weights(
        &self,
    ) -> StoreResult<BTreeMap<String, BTreeMap<String, i64>>> {
        let mut services = BTreeMap::new();
        let mut rev_count = 0;
        for attrs in self
            .backend
            .scan(Table::Services, self.segment, self.segments)
            .await?
        {
            let name = match attrs.get("service_name").and_then(|v| v.as_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let weights: BTreeMap<String, i64> = attrs
                .iter()
                .filter(|(key, value)| is_rev_hash(key) && value.as_i64().unwrap_or(-1) >= 0)
                .map(|(key, value)| (key.clone(), value.as_i64().unwrap_or(0)))
                .collect();
            rev_count += weights.len();
            services.insert(name, weights);
        }
        debug!(services = services.len(), revisions = rev_count, "Loaded revision weights");
        Ok(services)
    }

    /// One service's record.
    pub async fn get_service(&self, service: &str) -> StoreResult<Option<ServiceRecord>> {
        match self.backend.get(Table::Services, &Key::hash(service)).await? {
            Some(attrs) => Ok(Some(ServiceRecord::from_attrs(attrs)?)),
            None => Ok(None),
        }
    }

    /// Partial update of one weight column.
    pub async fn set_service_weight(
        &self,
        service: &str,
        rev_hash: &str,
        weight: i64,
    ) -> StoreResult<()> {
        let mut update = Attrs::new();
        update.insert(rev_hash.to_string(), weight.into());
        self.backend
            .update(Table::Services, &Key::hash(service), update)
            .await
    }

    /// Instances of a service grouped by their current assignment; `None`
    /// holds unassigned instances. Instances past [`INSTANCE_EXPIRY`] are
    /// deleted from both the status and assignments tables during this
    /// call.
    pub async fn get_instance_assignments(
        &self,
        service: &str,
    ) -> StoreResult<HashMap<Option<String>, Vec<AssignmentRecord>>> {
        let dead_cutoff = epoch_seconds() - INSTANCE_EXPIRY;
        let mut live_instances = Vec::new();
        let mut dead_instances = Vec::new();

        for attrs in self.backend.query(Table::Status, service).await? {
            let instance_id = match attrs.get("instance_id").and_then(|v| v.as_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let status_time = attrs.get("status_time").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if status_time < dead_cutoff {
                dead_instances.push(instance_id);
            } else {
                live_instances.push(instance_id);
            }
        }

        if !dead_instances.is_empty() {
            debug!(count = dead_instances.len(), service = %service, "Removing dead instances");
            let status_keys: Vec<Key> = dead_instances
                .iter()
                .map(|id| Key::composite(service, id.clone()))
                .collect();
            self.backend.batch_delete(Table::Status, &status_keys).await?;
            let assignment_keys: Vec<Key> = dead_instances.iter().map(Key::hash).collect();
            self.backend
                .batch_delete(Table::Assignments, &assignment_keys)
                .await?;
        }

        let mut assignments: HashMap<Option<String>, Vec<AssignmentRecord>> = HashMap::new();
        if live_instances.is_empty() {
            return Ok(assignments);
        }

        let mut unassigned: HashSet<String> = live_instances.iter().cloned().collect();
        let keys: Vec<Key> = live_instances.iter().map(Key::hash).collect();
        for attrs in self.backend.batch_get(Table::Assignments, &keys).await? {
            let record = AssignmentRecord::from_attrs(attrs)?;
            unassigned.remove(&record.instance_id);
            assignments
                .entry(record.assignment.clone())
                .or_default()
                .push(record);
        }

        let unassigned_records: Vec<AssignmentRecord> = unassigned
            .into_iter()
            .map(|instance_id| AssignmentRecord::unassigned(instance_id, service))
            .collect();
        if !unassigned_records.is_empty() {
            assignments.insert(None, unassigned_records);
        } else {
            assignments.entry(None).or_default();
        }

        Ok(assignments)
    }

    /// Store assignments in a batch.
    pub async fn set_assignments(&self, assignments: &[AssignmentRecord]) -> StoreResult<()> {
        let items: Vec<Attrs> = assignments.iter().map(AssignmentRecord::to_attrs).collect();
        self.backend.batch_put(Table::Assignments, items).await
    }

    /// Store one assignment.
    pub async fn set_assignment(
        &self,
        service: &str,
        instance_id: &str,
        rev_hash: &str,
    ) -> StoreResult<()> {
        let record = AssignmentRecord {
            instance_id: instance_id.to_string(),
            assignment: Some(rev_hash.to_string()),
            service: Some(service.to_string()),
        };
        self.backend.put(Table::Assignments, record.to_attrs()).await
    }

    /// Unit status maps of instances currently assigned to a revision,
    /// excluding the reporter.
    pub async fn get_service_status(
        &self,
        service: &str,
        rev_hash: &str,
        exclude_instance: &str,
    ) -> StoreResult<Vec<(String, BTreeMap<String, UnitStatus>)>> {
        let mut statuses = Vec::new();
        let mut records = Vec::new();
        for attrs in self.backend.query(Table::Status, service).await? {
            let record = InstanceStatusRecord::from_attrs(attrs)?;
            if record.instance_id != exclude_instance {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Ok(statuses);
        }

        let keys: Vec<Key> = records.iter().map(|r| Key::hash(&r.instance_id)).collect();
        let mut on_revision: HashSet<String> = HashSet::new();
        for attrs in self.backend.batch_get(Table::Assignments, &keys).await? {
            let record = AssignmentRecord::from_attrs(attrs)?;
            if record.assignment.as_deref() == Some(rev_hash) {
                on_revision.insert(record.instance_id);
            }
        }

        for record in records {
            if on_revision.contains(&record.instance_id) {
                statuses.push((record.instance_id, record.units));
            }
        }
        Ok(statuses)
    }

    /// All provisioned stacks.
    pub async fn get_stacks(&self) -> StoreResult<Vec<Attrs>> {
        self.backend.scan(Table::Stacks, 0, 1).await
    }

    /// Persist stacks returned by the provisioner.
    pub async fn set_stacks(&self, stacks: Vec<Attrs>) -> StoreResult<()> {
        self.backend.batch_put(Table::Stacks, stacks).await
    }

    /// Region parameter rows for the given regions.
    pub async fn get_region_params(&self, regions: &[String]) -> StoreResult<Vec<Attrs>> {
        let keys: Vec<Key> = regions.iter().map(Key::hash).collect();
        self.backend.batch_get(Table::Regions, &keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    async fn heartbeat(backend: &Arc<MemoryBackend>, service: &str, instance: &str, age: f64) {
        let record = InstanceStatusRecord {
            service: service.to_string(),
            instance_id: instance.to_string(),
            status_time: epoch_seconds() - age,
            units: BTreeMap::new(),
        };
        backend.put(Table::Status, record.to_attrs()).await.unwrap();
    }

    #[tokio::test]
    async fn test_revision_weights_filter() {
        let backend = Arc::new(MemoryBackend::new());
        let mut attrs = Attrs::new();
        attrs.insert("service_name".into(), "testapp".into());
        attrs.insert("dns_name".into(), "a.example.com".into());
        attrs.insert("a".repeat(64), 2.into());
        attrs.insert("b".repeat(64), 0.into());
        attrs.insert("c".repeat(64), (-1).into());
        backend.put(Table::Services, attrs).await.unwrap();

        let store = SchedulerStore::new(backend);
        let weights = store.get_revision_weights().await.unwrap();
        let testapp = weights.get("testapp").unwrap();
        assert_eq!(testapp.get(&"a".repeat(64)), Some(&2));
        assert_eq!(testapp.get(&"b".repeat(64)), Some(&0));
        assert!(!testapp.contains_key(&"c".repeat(64)));
    }

    #[tokio::test]
    async fn test_instance_assignments_groups_by_revision() {
        let backend = Arc::new(MemoryBackend::new());
        heartbeat(&backend, "testapp", "i-1", 0.0).await;
        heartbeat(&backend, "testapp", "i-2", 0.0).await;
        heartbeat(&backend, "testapp", "i-3", 0.0).await;

        let store = SchedulerStore::new(backend);
        store.set_assignment("testapp", "i-1", &"a".repeat(64)).await.unwrap();
        store.set_assignment("testapp", "i-2", &"a".repeat(64)).await.unwrap();

        let assignments = store.get_instance_assignments("testapp").await.unwrap();
        assert_eq!(assignments.get(&Some("a".repeat(64))).unwrap().len(), 2);
        assert_eq!(assignments.get(&None).unwrap().len(), 1);
        assert_eq!(assignments.get(&None).unwrap()[0].instance_id, "i-3");
    }

    #[tokio::test]
    async fn test_stale_instances_are_garbage_collected() {
        let backend = Arc::new(MemoryBackend::new());
        heartbeat(&backend, "testapp", "i-1", 0.0).await;
        heartbeat(&backend, "testapp", "i-2", INSTANCE_EXPIRY + 100.0).await;

        let store = SchedulerStore::new(backend.clone());
        store.set_assignment("testapp", "i-2", &"a".repeat(64)).await.unwrap();

        let assignments = store.get_instance_assignments("testapp").await.unwrap();
        let all: Vec<&AssignmentRecord> = assignments.values().flatten().collect();
        assert!(all.iter().all(|record| record.instance_id != "i-2"));

        // Both rows for the dead instance are gone.
        assert!(backend
            .get(Table::Status, &Key::composite("testapp", "i-2"))
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .get(Table::Assignments, &Key::hash("i-2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_no_instances_returns_empty_map() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SchedulerStore::new(backend);
        let assignments = store.get_instance_assignments("testapp").await.unwrap();
        assert!(assignments.is_empty());
    }

    #[tokio::test]
    async fn test_service_status_filters_by_revision_and_reporter() {
        let backend = Arc::new(MemoryBackend::new());
        let rev = "a".repeat(64);
        for instance in ["i-1", "i-2", "i-3"] {
            let mut units = BTreeMap::new();
            units.insert("flotilla-app.service".to_string(), UnitStatus::running(0.0));
            let record = InstanceStatusRecord {
                service: "testapp".into(),
                instance_id: instance.into(),
                status_time: epoch_seconds(),
                units,
            };
            backend.put(Table::Status, record.to_attrs()).await.unwrap();
        }

        let store = SchedulerStore::new(backend);
        store.set_assignment("testapp", "i-1", &rev).await.unwrap();
        store.set_assignment("testapp", "i-2", &rev).await.unwrap();
        store.set_assignment("testapp", "i-3", &"b".repeat(64)).await.unwrap();

        let statuses = store.get_service_status("testapp", &rev, "i-1").await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, "i-2");
    }
}
