//! The agent's periodic functions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::ServiceUnit;
use crate::store::DistributedLocks;

use super::loadbalancer::InstanceBalancer;
use super::messaging::AgentMessaging;
use super::store::AgentStore;
use super::units::UnitFiles;

/// Lease on the deploy lock; long enough to cover a full drain and
/// re-register cycle.
const DEPLOY_LOCK_TTL: f64 = 300.0;

/// Per-instance reconcile loop.
pub struct Agent {
    service: String,
    store: Arc<AgentStore>,
    locks: Arc<DistributedLocks>,
    units: Arc<UnitFiles>,
    balancer: Arc<InstanceBalancer>,
    messaging: Arc<AgentMessaging>,
    /// Last successfully deployed assignment. Also serializes reconciles
    /// within this process: the periodic tick and a messaging retry never
    /// overlap.
    assignment: Mutex<Option<Vec<String>>>,
    first_health: AtomicBool,
}

impl Agent {
    pub fn new(
        service: impl Into<String>,
        store: Arc<AgentStore>,
        locks: Arc<DistributedLocks>,
        units: Arc<UnitFiles>,
        balancer: Arc<InstanceBalancer>,
        messaging: Arc<AgentMessaging>,
    ) -> Self {
        Self {
            service: service.into(),
            store,
            locks,
            units,
            balancer,
            messaging,
            assignment: Mutex::new(None),
            first_health: AtomicBool::new(true),
        }
    }

    /// Health tick: write the heartbeat row. The first tick also enqueues
    /// a `Reschedule` so a newly joined instance is placed immediately.
    pub async fn health(&self) -> Result<()> {
        let status = self.units.unit_status().await?;
        self.store.store_status(status).await?;

        if self.first_health.swap(false, Ordering::SeqCst) {
            debug!(service = %self.service, "First heartbeat, requesting placement");
            self.messaging.reschedule().await?;
        }
        Ok(())
    }

    /// Assignment tick: converge the local unit set when the assigned
    /// revisions changed.
    pub async fn assignment(&self) -> Result<()> {
        let mut current = self.assignment.lock().await;

        let assigned = self.store.get_assignments().await?;
        if current.as_ref() == Some(&assigned) {
            return Ok(());
        }
        debug!(
            assigned = ?assigned,
            previous = ?*current,
            "Updated assignment"
        );

        let units = self.store.get_units().await?;

        let lock_name = format!("{}-deploy", self.service);
        if !self.locks.try_lock(&lock_name, DEPLOY_LOCK_TTL, false).await? {
            debug!(lock = %lock_name, "Deploy lock unavailable, skipping tick");
            return Ok(());
        }

        // Converge with the lock held; release on every path.
        let deployed = self.deploy(&units).await;
        self.locks.release_lock(&lock_name).await?;
        if let Err(e) = self.messaging.deploy_lock_released().await {
            warn!(error = %e, "Unable to announce lock release");
        }

        if deployed {
            *current = Some(assigned);
        } else {
            // Do not commit; report each assigned revision and retry next
            // tick.
            for rev_hash in &assigned {
                if let Err(e) = self.messaging.service_failure(rev_hash).await {
                    warn!(revision = %rev_hash, error = %e, "Unable to report failure");
                }
            }
        }
        Ok(())
    }

    /// Messaging tick: long-poll the service queue; a `DeployLockReleased`
    /// retries the assignment without waiting for the next tick.
    pub async fn receive(&self) -> Result<()> {
        if self.messaging.receive_lock_released().await {
            self.assignment().await?;
        }
        Ok(())
    }

    async fn deploy(&self, units: &[ServiceUnit]) -> bool {
        if !self.balancer.deregister().await {
            warn!(service = %self.service, "Drain did not complete, deploying anyway");
        }
        if let Err(e) = self.units.set_units(units).await {
            warn!(service = %self.service, error = %e, "Unit convergence failed");
            return false;
        }
        self.balancer.register().await
    }

    /// Tick wrappers: periodic runners log and continue on error.
    pub async fn health_tick(&self) {
        if let Err(e) = self.health().await {
            warn!(service = %self.service, error = %e, "Health tick failed");
        }
    }

    pub async fn assignment_tick(&self) {
        if let Err(e) = self.assignment().await {
            warn!(service = %self.service, error = %e, "Assignment tick failed");
        }
    }

    pub async fn receive_tick(&self) {
        if let Err(e) = self.receive().await {
            warn!(service = %self.service, error = %e, "Messaging tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyService;
    use crate::loadbalancer::{InstanceLbState, LbResult, LoadBalancer, IN_SERVICE, OUT_OF_SERVICE};
    use crate::messaging::{parse_message, MemoryQueue, Message, MessageQueue, ParsedMessage};
    use crate::models::{ServiceRevision, ServiceUnit};
    use crate::publisher::Publisher;
    use crate::store::records::AssignmentRecord;
    use crate::store::{Key, MemoryBackend, StoreBackend, Table};
    use crate::agent::units::InMemoryUnitManager;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Balancer that drains instantly and reaches InService only when
    /// scripted healthy.
    struct TestBalancer {
        healthy: std::sync::atomic::AtomicBool,
    }

    impl TestBalancer {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: std::sync::atomic::AtomicBool::new(healthy),
            }
        }
    }

    #[async_trait]
    impl LoadBalancer for TestBalancer {
        async fn register(&self, _b: &str, _i: &str) -> LbResult<()> {
            Ok(())
        }
        async fn deregister(&self, _b: &str, _i: &str) -> LbResult<()> {
            Ok(())
        }
        async fn instance_health(
            &self,
            _b: &str,
            instances: &[String],
        ) -> LbResult<Vec<InstanceLbState>> {
            let state = if self.healthy.load(Ordering::SeqCst) {
                IN_SERVICE
            } else {
                OUT_OF_SERVICE
            };
            Ok(instances
                .iter()
                .map(|instance| InstanceLbState {
                    instance_id: instance.clone(),
                    state: state.to_string(),
                })
                .collect())
        }
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        publisher: Publisher,
        manager: Arc<InMemoryUnitManager>,
        scheduler_queue: Arc<MemoryQueue>,
        agent: Agent,
        _dir: tempfile::TempDir,
    }

    fn fixture(healthy_balancer: bool) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let keys = Arc::new(LocalKeyService::new());
        let publisher = Publisher::new(backend.clone(), keys.clone());
        let store = Arc::new(AgentStore::new(backend.clone(), "i-1", "testapp", keys));
        let locks = Arc::new(DistributedLocks::new(backend.clone(), "i-1"));

        let manager = Arc::new(InMemoryUnitManager::new());
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("units");
        let env_dir = dir.path().join("env");
        std::fs::create_dir_all(&unit_dir).unwrap();
        std::fs::create_dir_all(&env_dir).unwrap();
        let units = Arc::new(UnitFiles::new(manager.clone()).with_dirs(unit_dir, env_dir));

        let balancer = Arc::new(
            InstanceBalancer::new(
                Some(Arc::new(TestBalancer::new(healthy_balancer))),
                "test-elb",
                "i-1",
            )
            .with_timing(
                Duration::from_millis(5),
                Duration::from_millis(50),
                Duration::from_millis(50),
            ),
        );

        let scheduler_queue = Arc::new(MemoryQueue::new("flotilla-test-scheduler"));
        let service_queue = Arc::new(MemoryQueue::new("flotilla-test-testapp"));
        let messaging = Arc::new(AgentMessaging::new(
            "testapp",
            "i-1",
            scheduler_queue.clone(),
            service_queue,
        ));

        let agent = Agent::new("testapp", store, locks, units, balancer, messaging);
        Fixture {
            backend,
            publisher,
            manager,
            scheduler_queue,
            agent,
            _dir: dir,
        }
    }

    async fn assign(fixture: &Fixture, rev_hash: &str) {
        let record = AssignmentRecord {
            instance_id: "i-1".into(),
            assignment: Some(rev_hash.to_string()),
            service: Some("testapp".into()),
        };
        fixture
            .backend
            .put(Table::Assignments, record.to_attrs())
            .await
            .unwrap();
    }

    async fn publish(fixture: &Fixture) -> String {
        let revision = ServiceRevision::new(
            "v1",
            1,
            vec![
                ServiceUnit::new("a.service", "[Service]\nExecStart=/bin/a\n", BTreeMap::new()),
                ServiceUnit::new("b.service", "[Service]\nExecStart=/bin/b\n", BTreeMap::new()),
            ],
        );
        fixture
            .publisher
            .add_revision("testapp", &revision)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_writes_status_and_first_reschedule() {
        let fixture = fixture(true);
        fixture.agent.health().await.unwrap();

        assert!(fixture
            .backend
            .get(Table::Status, &Key::composite("testapp", "i-1"))
            .await
            .unwrap()
            .is_some());

        // Exactly one Reschedule, on the first tick only.
        fixture.agent.health().await.unwrap();
        let received = fixture
            .scheduler_queue
            .receive(Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            parse_message(&received[0].body),
            ParsedMessage::Known(Message::Reschedule { .. })
        ));
    }

    #[tokio::test]
    async fn test_assignment_converges_and_commits() {
        // Empty prev, one assigned revision with two units.
        let fixture = fixture(true);
        let rev_hash = publish(&fixture).await;
        assign(&fixture, &rev_hash).await;

        fixture.agent.assignment().await.unwrap();

        let started = fixture.manager.started();
        assert_eq!(started.len(), 2);
        assert!(started.iter().all(|name| name.contains(&rev_hash)));
        assert_eq!(
            *fixture.agent.assignment.lock().await,
            Some(vec![rev_hash.clone()])
        );

        // Unchanged assignment is a no-op.
        fixture.agent.assignment().await.unwrap();
        assert_eq!(fixture.manager.reloads(), 1);
    }

    #[tokio::test]
    async fn test_failed_register_reports_and_does_not_commit() {
        // The balancer never reaches InService.
        let fixture = fixture(false);
        let rev_hash = publish(&fixture).await;
        assign(&fixture, &rev_hash).await;

        fixture.agent.assignment().await.unwrap();

        assert_eq!(*fixture.agent.assignment.lock().await, None);
        let received = fixture
            .scheduler_queue
            .receive(Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        match parse_message(&received[0].body) {
            ParsedMessage::Known(Message::ServiceFailure {
                service,
                revision,
                instance,
            }) => {
                assert_eq!(service, "testapp");
                assert_eq!(revision, rev_hash);
                assert_eq!(instance, "i-1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deploy_lock_is_released_after_convergence() {
        let fixture = fixture(true);
        let rev_hash = publish(&fixture).await;
        assign(&fixture, &rev_hash).await;

        fixture.agent.assignment().await.unwrap();

        let locks = DistributedLocks::new(fixture.backend.clone(), "i-other");
        assert!(locks.try_lock("testapp-deploy", 60.0, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_deploy_lock_held_elsewhere_skips_tick() {
        let fixture = fixture(true);
        let rev_hash = publish(&fixture).await;
        assign(&fixture, &rev_hash).await;

        let other = DistributedLocks::new(fixture.backend.clone(), "i-other");
        assert!(other.try_lock("testapp-deploy", 60.0, false).await.unwrap());

        fixture.agent.assignment().await.unwrap();

        // Nothing deployed, nothing committed; retried next tick.
        assert!(fixture.manager.started().is_empty());
        assert_eq!(*fixture.agent.assignment.lock().await, None);
    }

    #[tokio::test]
    async fn test_empty_assignment_stops_units() {
        let fixture = fixture(true);
        let rev_hash = publish(&fixture).await;
        assign(&fixture, &rev_hash).await;
        fixture.agent.assignment().await.unwrap();

        // Assignment row goes away; next tick converges to nothing.
        fixture
            .backend
            .delete(Table::Assignments, &Key::hash("i-1"))
            .await
            .unwrap();
        fixture.agent.assignment().await.unwrap();

        assert_eq!(fixture.manager.stopped().len(), 2);
        assert_eq!(*fixture.agent.assignment.lock().await, Some(Vec::new()));
    }
}
