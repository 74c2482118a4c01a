//! Instance-side load balancer operations.
//!
//! Wraps the narrow [`LoadBalancer`] trait with the drain/attach protocol
//! the reconcile loop needs: deregister and wait for `OutOfService` before
//! touching units, re-register and wait for `InService` afterwards. Both
//! waits are bounded polls; a timeout is reported as `false`, not an
//! error, because the caller treats it as a failed deployment.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::loadbalancer::{LbError, LoadBalancer, IN_SERVICE, OUT_OF_SERVICE};

const DEFAULT_POLL: Duration = Duration::from_millis(500);
const DEFAULT_DEREGISTER_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(120);

/// One instance's registration with one balancer. Instances without a
/// balancer (`None`) trivially succeed, so the reconcile path is uniform.
pub struct InstanceBalancer {
    balancer: Option<Arc<dyn LoadBalancer>>,
    name: String,
    instance_id: String,
    poll: Duration,
    deregister_timeout: Duration,
    register_timeout: Duration,
}

impl InstanceBalancer {
    pub fn new(
        balancer: Option<Arc<dyn LoadBalancer>>,
        name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            balancer,
            name: name.into(),
            instance_id: instance_id.into(),
            poll: DEFAULT_POLL,
            deregister_timeout: DEFAULT_DEREGISTER_TIMEOUT,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
        }
    }

    /// Tighten the poll cadence and timeouts, for tests.
    pub fn with_timing(
        mut self,
        poll: Duration,
        deregister_timeout: Duration,
        register_timeout: Duration,
    ) -> Self {
        self.poll = poll;
        self.deregister_timeout = deregister_timeout;
        self.register_timeout = register_timeout;
        self
    }

    /// Drain this instance. Returns once the balancer reports
    /// `OutOfService` or the timeout passes; an instance that was never
    /// registered counts as drained.
    pub async fn deregister(&self) -> bool {
        let balancer = match &self.balancer {
            Some(balancer) => balancer,
            None => return true,
        };

        debug!(balancer = %self.name, "Deregistering");
        match balancer.deregister(&self.name, &self.instance_id).await {
            Ok(()) => {}
            Err(LbError::NotRegistered { .. }) => {
                warn!(balancer = %self.name, "Not a member");
                return true;
            }
            Err(e) => {
                warn!(balancer = %self.name, error = %e, "Deregister failed");
                return false;
            }
        }

        let drained = self
            .wait_for_state(balancer, OUT_OF_SERVICE, self.deregister_timeout)
            .await;
        debug!(balancer = %self.name, drained = drained, "Deregistered");
        drained
    }

    /// Attach this instance and wait until it serves traffic. `false`
    /// means the deployment never became healthy.
    pub async fn register(&self) -> bool {
        let balancer = match &self.balancer {
            Some(balancer) => balancer,
            None => return true,
        };

        debug!(balancer = %self.name, "Registering");
        if let Err(e) = balancer.register(&self.name, &self.instance_id).await {
            warn!(balancer = %self.name, error = %e, "Register failed");
            return false;
        }

        let serving = self
            .wait_for_state(balancer, IN_SERVICE, self.register_timeout)
            .await;
        debug!(balancer = %self.name, serving = serving, "Registered");
        serving
    }

    async fn wait_for_state(
        &self,
        balancer: &Arc<dyn LoadBalancer>,
        state: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let instances = [self.instance_id.clone()];
        loop {
            match balancer.instance_health(&self.name, &instances).await {
                Ok(states) => {
                    if states.iter().any(|s| s.instance_id == self.instance_id && s.state == state)
                    {
                        return true;
                    }
                }
                Err(e) => warn!(balancer = %self.name, error = %e, "Health check failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}
