//! Service doctor: decides whether a failed deployment is the instance's
//! fault or the revision's.
//!
//! When an agent cannot bring a revision `InService` it reports a
//! `ServiceFailure`. The doctor looks for sibling instances that run the
//! same revision stably and pass the load balancer's health check. Healthy
//! siblings mean the reporter is broken and nothing changes; no healthy
//! sibling means the revision itself is broken, and its weight is negated
//! so the balance loop stops assigning it. The publisher can re-enable a
//! quarantined revision by setting a positive weight.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::loadbalancer::{LoadBalancer, IN_SERVICE};
use crate::store::records::ServiceRecord;
use crate::store::{epoch_seconds, StoreError};

use super::store::SchedulerStore;

/// Seconds a unit must have been running before it counts as a stable
/// sibling.
pub const SERVICE_EXPIRY: f64 = 10.0;

/// Result type for doctor operations
pub type DoctorResult<T> = Result<T, DoctorError>;

/// Doctor errors
#[derive(Debug, Error)]
pub enum DoctorError {
    /// The revision has already been marked broken
    #[error("revision {revision} of {service} is quarantined")]
    Quarantined { service: String, revision: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Diagnoses deploy failures against sibling health.
pub struct ServiceDoctor {
    store: Arc<SchedulerStore>,
    balancer: Arc<dyn LoadBalancer>,
}

impl ServiceDoctor {
    pub fn new(store: Arc<SchedulerStore>, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self { store, balancer }
    }

    /// Callback when an instance reports it failed to deploy a revision.
    ///
    /// Refuses to act unless the service has the revision at a
    /// non-negative weight. Quarantines the revision (weight `*= -1`) when
    /// no sibling is running it stably and healthily.
    pub async fn failed_revision(
        &self,
        service: &str,
        rev_hash: &str,
        instance: &str,
    ) -> DoctorResult<()> {
        let record = match self.store.get_service(service).await? {
            Some(record) => record,
            None => {
                warn!(service = %service, "Service not found");
                return Ok(());
            }
        };
        let weight = match record.weights.get(rev_hash) {
            Some(weight) => *weight,
            None => {
                warn!(service = %service, revision = %rev_hash, "Service does not have revision");
                return Ok(());
            }
        };
        if weight < 0 {
            debug!(service = %service, revision = %rev_hash, "Revision already quarantined");
            return Ok(());
        }

        info!(
            service = %service,
            revision = %rev_hash,
            instance = %instance,
            "Diagnosing deploy failure"
        );

        let running = self.running_instances(service, rev_hash, instance).await?;
        info!(count = running.len(), "Found running instances");
        if !running.is_empty() {
            let healthy = self.healthy_instances(&record, &running).await;
            info!(count = healthy.len(), "Found healthy instances");
            if !healthy.is_empty() {
                info!(instance = %instance, "Diagnosis: instance is broken");
                return Ok(());
            }
        }

        info!(revision = %rev_hash, "Diagnosis: revision is broken");
        self.store
            .set_service_weight(service, rev_hash, -weight)
            .await?;
        Ok(())
    }

    /// Whether a running, balancer-healthy instance of the revision
    /// exists. Raises [`DoctorError::Quarantined`] when the weight is
    /// already negative.
    pub async fn is_healthy_revision(&self, service: &str, rev_hash: &str) -> DoctorResult<bool> {
        let record = match self.store.get_service(service).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        if let Some(weight) = record.weights.get(rev_hash) {
            if *weight < 0 {
                return Err(DoctorError::Quarantined {
                    service: service.to_string(),
                    revision: rev_hash.to_string(),
                });
            }
        }

        let running = self.running_instances(service, rev_hash, "").await?;
        if running.is_empty() {
            return Ok(false);
        }
        Ok(!self.healthy_instances(&record, &running).await.is_empty())
    }

    /// Zero out every other weight column, finalizing a canary rollout.
    pub async fn make_only_revision(&self, service: &str, rev_hash: &str) -> DoctorResult<()> {
        let record = match self.store.get_service(service).await? {
            Some(record) => record,
            None => {
                warn!(service = %service, "Service not found");
                return Ok(());
            }
        };
        for (other, weight) in &record.weights {
            if other != rev_hash && *weight != 0 {
                self.store.set_service_weight(service, other, 0).await?;
            }
        }
        Ok(())
    }

    /// Sibling instances stably running the revision, excluding the
    /// reporter: any per-unit entry `running` for longer than
    /// [`SERVICE_EXPIRY`].
    async fn running_instances(
        &self,
        service: &str,
        rev_hash: &str,
        exclude_instance: &str,
    ) -> DoctorResult<HashSet<String>> {
        let active_cutoff = epoch_seconds() - SERVICE_EXPIRY;
        let mut running = HashSet::new();
        for (instance_id, units) in self
            .store
            .get_service_status(service, rev_hash, exclude_instance)
            .await?
        {
            for status in units.values() {
                if status.sub_state == "running" && status.active_enter_time <= active_cutoff {
                    running.insert(instance_id.clone());
                    break;
                }
            }
        }
        Ok(running)
    }

    /// Which of the running instances the load balancer reports
    /// `InService`.
    async fn healthy_instances(
        &self,
        record: &ServiceRecord,
        running: &HashSet<String>,
    ) -> HashSet<String> {
        let balancer_name = match record.load_balancer() {
            Some(name) => name,
            None => {
                warn!(service = %record.name, "Service has no load balancer");
                return HashSet::new();
            }
        };

        let instances: Vec<String> = running.iter().cloned().collect();
        match self.balancer.instance_health(balancer_name, &instances).await {
            Ok(states) => states
                .into_iter()
                .filter(|state| state.state == IN_SERVICE)
                .map(|state| state.instance_id)
                .collect(),
            Err(e) => {
                warn!(balancer = %balancer_name, error = %e, "Health check failed");
                HashSet::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalancer::{InstanceLbState, LbResult};
    use crate::store::records::{InstanceStatusRecord, UnitStatus};
    use crate::store::{Attrs, MemoryBackend, StoreBackend, Table};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const REV: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const INSTANCE: &str = "i-123456";

    /// Balancer whose health answers are scripted per instance.
    #[derive(Default)]
    struct ScriptedBalancer {
        in_service: Mutex<HashSet<String>>,
    }

    impl ScriptedBalancer {
        fn mark_in_service(&self, instance: &str) {
            self.in_service.lock().unwrap().insert(instance.to_string());
        }
    }

    #[async_trait]
    impl LoadBalancer for ScriptedBalancer {
        async fn register(&self, _balancer: &str, _instance_id: &str) -> LbResult<()> {
            Ok(())
        }

        async fn deregister(&self, _balancer: &str, _instance_id: &str) -> LbResult<()> {
            Ok(())
        }

        async fn instance_health(
            &self,
            _balancer: &str,
            instances: &[String],
        ) -> LbResult<Vec<InstanceLbState>> {
            let in_service = self.in_service.lock().unwrap();
            Ok(instances
                .iter()
                .map(|instance| InstanceLbState {
                    instance_id: instance.clone(),
                    state: if in_service.contains(instance) {
                        IN_SERVICE.to_string()
                    } else {
                        "OutOfService".to_string()
                    },
                })
                .collect())
        }
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        store: Arc<SchedulerStore>,
        balancer: Arc<ScriptedBalancer>,
        doctor: ServiceDoctor,
    }

    async fn fixture(weight: i64) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(SchedulerStore::new(backend.clone()));
        let balancer = Arc::new(ScriptedBalancer::default());
        let doctor = ServiceDoctor::new(store.clone(), balancer.clone());

        let mut attrs = Attrs::new();
        attrs.insert("service_name".into(), "testapp".into());
        attrs.insert(REV.to_string(), weight.into());
        attrs.insert(
            "stack_outputs".into(),
            serde_json::json!({"Elb": "testapp-elb"}),
        );
        backend.put(Table::Services, attrs).await.unwrap();

        Fixture {
            backend,
            store,
            balancer,
            doctor,
        }
    }

    async fn running_sibling(fixture: &Fixture, instance: &str) {
        let mut units = BTreeMap::new();
        units.insert(
            "flotilla-app.service".to_string(),
            UnitStatus::running(epoch_seconds() - SERVICE_EXPIRY - 5.0),
        );
        let record = InstanceStatusRecord {
            service: "testapp".into(),
            instance_id: instance.into(),
            status_time: epoch_seconds(),
            units,
        };
        fixture.backend.put(Table::Status, record.to_attrs()).await.unwrap();
        fixture.store.set_assignment("testapp", instance, REV).await.unwrap();
    }

    async fn weight_of(fixture: &Fixture) -> i64 {
        let record = fixture.store.get_service("testapp").await.unwrap().unwrap();
        *record.weights.get(REV).unwrap()
    }

    #[tokio::test]
    async fn test_failed_revision_missing_service() {
        let fixture = fixture(1).await;
        fixture
            .doctor
            .failed_revision("ghost", REV, INSTANCE)
            .await
            .unwrap();
        assert_eq!(weight_of(&fixture).await, 1);
    }

    #[tokio::test]
    async fn test_failed_revision_unknown_revision() {
        let fixture = fixture(1).await;
        fixture
            .doctor
            .failed_revision("testapp", &"9".repeat(64), INSTANCE)
            .await
            .unwrap();
        assert_eq!(weight_of(&fixture).await, 1);
    }

    #[tokio::test]
    async fn test_failed_revision_no_siblings_quarantines() {
        // Nobody else runs the revision, so it is globally broken.
        let fixture = fixture(1).await;
        fixture
            .doctor
            .failed_revision("testapp", REV, INSTANCE)
            .await
            .unwrap();
        assert_eq!(weight_of(&fixture).await, -1);
    }

    #[tokio::test]
    async fn test_failed_revision_unhealthy_siblings_quarantines() {
        // Siblings run it but the balancer reports none InService.
        let fixture = fixture(1).await;
        running_sibling(&fixture, "i-654321").await;
        fixture
            .doctor
            .failed_revision("testapp", REV, INSTANCE)
            .await
            .unwrap();
        assert_eq!(weight_of(&fixture).await, -1);
    }

    #[tokio::test]
    async fn test_failed_revision_healthy_sibling_blames_instance() {
        let fixture = fixture(1).await;
        running_sibling(&fixture, "i-654321").await;
        fixture.balancer.mark_in_service("i-654321");
        fixture
            .doctor
            .failed_revision("testapp", REV, INSTANCE)
            .await
            .unwrap();
        assert_eq!(weight_of(&fixture).await, 1);
    }

    #[tokio::test]
    async fn test_failed_revision_already_quarantined() {
        let fixture = fixture(-2).await;
        fixture
            .doctor
            .failed_revision("testapp", REV, INSTANCE)
            .await
            .unwrap();
        assert_eq!(weight_of(&fixture).await, -2);
    }

    #[tokio::test]
    async fn test_is_healthy_revision() {
        let fixture = fixture(1).await;
        assert!(!fixture.doctor.is_healthy_revision("testapp", REV).await.unwrap());

        running_sibling(&fixture, "i-654321").await;
        assert!(!fixture.doctor.is_healthy_revision("testapp", REV).await.unwrap());

        fixture.balancer.mark_in_service("i-654321");
        assert!(fixture.doctor.is_healthy_revision("testapp", REV).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_healthy_revision_quarantined() {
        let fixture = fixture(-1).await;
        let result = fixture.doctor.is_healthy_revision("testapp", REV).await;
        assert!(matches!(result, Err(DoctorError::Quarantined { .. })));
    }

    #[tokio::test]
    async fn test_make_only_revision() {
        let fixture = fixture(1).await;
        let other = "9".repeat(64);
        fixture.store.set_service_weight("testapp", &other, 4).await.unwrap();

        fixture.doctor.make_only_revision("testapp", REV).await.unwrap();

        let record = fixture.store.get_service("testapp").await.unwrap().unwrap();
        assert_eq!(record.weights.get(REV), Some(&1));
        assert_eq!(record.weights.get(&other), Some(&0));
    }
}
