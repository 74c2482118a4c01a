//! Leader-elected scheduler: keeps weighted revisions spread across live
//! instances.
//!
//! # Overview
//!
//! Every region runs one or more scheduler processes; they coordinate
//! through the `scheduler` lock and only the leader writes. Two periodic
//! functions drive the component:
//!
//! - the lock loop refreshes leadership (TTL is three lock intervals) and
//!   is edge triggered: becoming leader runs one balance pass immediately,
//!   losing leadership suppresses all writes;
//! - the balance loop walks every service, compares the live instance set
//!   against weight-derived targets, and reassigns the difference.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    Scheduler process                      │
//! │  ┌───────────┐  ┌────────────┐  ┌─────────────────────┐   │
//! │  │ lock loop │  │balance loop│  │ queue receive loop  │   │
//! │  └─────┬─────┘  └─────┬──────┘  └──────────┬──────────┘   │
//! │        │              │                    │              │
//! │        ▼              ▼                    ▼              │
//! │   locks table    assignments        Reschedule /          │
//! │                  + status GC        ServiceFailure        │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The doctor shares the scheduler's store and decides whether a reported
//! deploy failure is the instance's fault or the revision's; a broken
//! revision gets its weight negated, which the balance loop treats as
//! absent.

pub mod balance;
pub mod doctor;
pub mod messaging;
pub mod provision;
pub mod store;

pub use balance::{Scheduler, SCHEDULER_LOCK};
pub use doctor::{DoctorError, ServiceDoctor, SERVICE_EXPIRY};
pub use messaging::SchedulerMessaging;
pub use provision::{NoopProvisioner, ProvisionLoop, StackProvisioner};
pub use store::{SchedulerStore, INSTANCE_EXPIRY};
