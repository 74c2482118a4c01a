//! Worker agent: keeps one instance converged with its assignments.
//!
//! Three periodic functions run per instance:
//!
//! - **health** (fast): report per-unit state as a `status` row; the first
//!   tick also enqueues a `Reschedule` so a freshly joined instance is
//!   placed immediately;
//! - **assignment**: resolve the instance's two assignment slots (own id
//!   plus one global shard), and when they changed, converge the local
//!   unit set behind the per-service deploy lock: drain from the load
//!   balancer, hand the target units to the unit manager, re-register and
//!   wait for `InService`;
//! - **messaging**: long-poll the per-service queue; `DeployLockReleased`
//!   retries the assignment without waiting a full tick.
//!
//! A failed convergence never commits: the agent reports a
//! `ServiceFailure` per assigned revision and the next tick retries. The
//! deploy lock is released on every exit path, which keeps cluster-wide
//! deployments serialized at one per service.

pub mod loadbalancer;
pub mod messaging;
pub mod reconcile;
pub mod store;
pub mod units;

pub use loadbalancer::InstanceBalancer;
pub use messaging::AgentMessaging;
pub use reconcile::Agent;
pub use store::AgentStore;
pub use units::{
    DeployError, InMemoryUnitManager, SystemctlManager, UnitFiles, UnitManager, UnitState,
};
