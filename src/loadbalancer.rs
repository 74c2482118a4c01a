//! Load balancer contract.
//!
//! The control plane only needs three calls: register an instance,
//! deregister it, and read per-instance health. The cloud provider's
//! balancer lives behind this trait; tests drive the agent and doctor with
//! scripted implementations.

use async_trait::async_trait;
use thiserror::Error;

/// State reported for a registered, healthy instance.
pub const IN_SERVICE: &str = "InService";

/// State reported once an instance is fully drained.
pub const OUT_OF_SERVICE: &str = "OutOfService";

/// Result type for load balancer operations
pub type LbResult<T> = Result<T, LbError>;

/// Load balancer errors
#[derive(Debug, Error)]
pub enum LbError {
    /// The instance is not a member of the balancer
    #[error("instance {instance} is not registered with {balancer}")]
    NotRegistered { balancer: String, instance: String },

    #[error("load balancer error: {0}")]
    Backend(String),
}

/// Health of one registered instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLbState {
    pub instance_id: String,
    pub state: String,
}

/// Narrow balancer interface.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Add an instance to the balancer's pool.
    async fn register(&self, balancer: &str, instance_id: &str) -> LbResult<()>;

    /// Remove an instance from the pool so it stops receiving traffic.
    async fn deregister(&self, balancer: &str, instance_id: &str) -> LbResult<()>;

    /// Current state of the given instances.
    async fn instance_health(
        &self,
        balancer: &str,
        instances: &[String],
    ) -> LbResult<Vec<InstanceLbState>>;
}

/// Balancer stub that accepts every call and reports every instance
/// `InService`. Used when no balancer driver is wired into the deployment;
/// health gating then falls back to unit state alone.
pub struct NoopBalancer;

#[async_trait]
impl LoadBalancer for NoopBalancer {
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
        Ok(instances
            .iter()
            .map(|instance| InstanceLbState {
                instance_id: instance.clone(),
                state: IN_SERVICE.to_string(),
            })
            .collect())
    }
}
