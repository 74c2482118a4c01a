//! Narrow interface to the infrastructure provisioner.
//!
//! Provisioning VPCs, load balancers and scaling groups is an external
//! concern. The core only hands the provisioner a service and its region
//! parameters and persists whatever stack rows come back; the leader gate
//! keeps concurrent schedulers from provisioning the same service twice.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::Attrs;

use super::balance::Scheduler;
use super::store::SchedulerStore;

/// External provisioner contract.
#[async_trait]
pub trait StackProvisioner: Send + Sync {
    /// Ensure infrastructure exists for a service. Returns stack rows to
    /// persist; an empty list means nothing changed.
    async fn provision(
        &self,
        region: &str,
        region_params: &Attrs,
        service: &Attrs,
    ) -> anyhow::Result<Vec<Attrs>>;
}

/// Provisioner that provisions nothing. Used when `provision` is disabled
/// or infrastructure is managed out of band.
pub struct NoopProvisioner;

#[async_trait]
impl StackProvisioner for NoopProvisioner {
    async fn provision(
        &self,
        _region: &str,
        _region_params: &Attrs,
        _service: &Attrs,
    ) -> anyhow::Result<Vec<Attrs>> {
        Ok(Vec::new())
    }
}

/// Leader-gated provision loop for one region.
pub struct ProvisionLoop {
    region: String,
    store: Arc<SchedulerStore>,
    scheduler: Arc<Scheduler>,
    provisioner: Arc<dyn StackProvisioner>,
}

impl ProvisionLoop {
    pub fn new(
        region: impl Into<String>,
        store: Arc<SchedulerStore>,
        scheduler: Arc<Scheduler>,
        provisioner: Arc<dyn StackProvisioner>,
    ) -> Self {
        Self {
            region: region.into(),
            store,
            scheduler,
            provisioner,
        }
    }

    /// One provision pass. No-op unless this process is the leader.
    pub async fn provision(&self) {
        if !self.scheduler.is_active() {
            return;
        }

        let services = match self.store.get_revision_weights().await {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "Unable to load services for provisioning");
                return;
            }
        };

        let region_rows = match self.store.get_region_params(&[self.region.clone()]).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(region = %self.region, error = %e, "Unable to load region params");
                return;
            }
        };
        let region_params = region_rows.into_iter().next().unwrap_or_default();

        for service in services.keys() {
            let record = match self.store.get_service(service).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(service = %service, error = %e, "Unable to load service");
                    continue;
                }
            };
            if record.metadata.provision == Some(false) {
                debug!(service = %service, "Provisioning disabled");
                continue;
            }

            match self
                .provisioner
                .provision(&self.region, &region_params, &record.to_attrs())
                .await
            {
                Ok(stacks) if !stacks.is_empty() => {
                    debug!(service = %service, stacks = stacks.len(), "Persisting stacks");
                    if let Err(e) = self.store.set_stacks(stacks).await {
                        warn!(service = %service, error = %e, "Unable to persist stacks");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(service = %service, error = %e, "Provisioning failed"),
            }
        }
    }
}
