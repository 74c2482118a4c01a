//! The balance loop and scheduler leadership.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::records::AssignmentRecord;
use crate::store::DistributedLocks;

use super::store::SchedulerStore;

/// Name of the per-region leadership lock.
pub const SCHEDULER_LOCK: &str = "scheduler";

/// Leader-elected scheduler. Multiple processes per region may run this;
/// only the lock holder writes.
pub struct Scheduler {
    store: Arc<SchedulerStore>,
    locks: Arc<DistributedLocks>,
    lock_ttl: f64,
    active: AtomicBool,
    /// Serializes overlapping balance passes within this process.
    pass_mutex: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Arc<SchedulerStore>, locks: Arc<DistributedLocks>, lock_ttl: f64) -> Self {
        Self {
            store,
            locks,
            lock_ttl,
            active: AtomicBool::new(false),
            pass_mutex: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether this process is currently the leader.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Force the leadership flag, for tests and embedded use.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Leadership tick: refresh (or contest) the scheduler lock.
    /// Transitions are edge triggered; winning the lock runs one balance
    /// pass immediately.
    pub async fn lock(&self) -> Result<()> {
        let has_lock = self.locks.try_lock(SCHEDULER_LOCK, self.lock_ttl, true).await?;
        let was_active = self.is_active();
        if has_lock && !was_active {
            info!("We are now the active scheduler");
            self.set_active(true);
            self.balance().await?;
        } else if !has_lock && was_active {
            warn!("We are no longer the active scheduler");
            self.set_active(false);
        }
        Ok(())
    }

    /// One balance pass over every service. No-op unless leader.
    pub async fn balance(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let _pass = self.pass_mutex.lock().await;
        let start = Instant::now();
        debug!("Starting scheduler pass");

        let service_weights = self.store.get_revision_weights().await?;
        for (service, revisions) in service_weights {
            debug!(service = %service, revisions = revisions.len(), "Balancing assignments");
            self.balance_service(&service, &revisions).await?;
        }

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Completed scheduler pass");
        Ok(())
    }

    /// Balance one service on demand (messaging `Reschedule`). No-op
    /// unless leader; the leader's periodic pass covers dropped requests.
    pub async fn schedule_service(&self, service: &str) -> Result<()> {
        if !self.is_active() {
            debug!(service = %service, "Not the leader, skipping reschedule");
            return Ok(());
        }
        let _pass = self.pass_mutex.lock().await;
        let revisions = match self.store.get_service(service).await? {
            Some(record) => record
                .weights
                .into_iter()
                .filter(|(_, weight)| *weight >= 0)
                .collect(),
            None => {
                warn!(service = %service, "Service not found, unable to reschedule");
                return Ok(());
            }
        };
        self.balance_service(service, &revisions).await
    }

    async fn balance_service(
        &self,
        service: &str,
        revisions: &BTreeMap<String, i64>,
    ) -> Result<()> {
        if revisions.is_empty() {
            debug!(service = %service, "No revisions, nothing to balance");
            return Ok(());
        }

        // Live instances grouped by assignment; stale ones are GC'd here.
        let mut assignments = self.store.get_instance_assignments(service).await?;
        let instance_count: usize = assignments.values().map(Vec::len).sum();
        if instance_count == 0 {
            debug!(service = %service, "No instances, can not assign");
            return Ok(());
        }
        debug!(service = %service, instances = instance_count, "Found assignable instances");

        let targets = match Self::instance_targets(revisions, instance_count) {
            Some(targets) => targets,
            None => {
                debug!(service = %service, "Total weight is zero, nothing to assign");
                return Ok(());
            }
        };
        debug!(service = %service, targets = ?targets, "Target instance counts");

        // Instances without an assignment can be scheduled:
        let mut assignable = assignments.remove(&None).unwrap_or_default();
        let unassigned = assignable.len();

        // Remove instances from revisions that are no longer provisioned:
        for (rev, assigned) in &mut assignments {
            let rev = match rev {
                Some(rev) => rev,
                None => continue,
            };
            if !targets.contains_key(rev) {
                debug!(count = assigned.len(), revision = %rev, "Unassigning instances");
                assignable.append(assigned);
            }
        }

        // Remove instances from over-provisioned revisions, from the tail:
        for (rev, target) in &targets {
            if let Some(assigned) = assignments.get_mut(&Some(rev.clone())) {
                let excess = assigned.len().saturating_sub(*target);
                if excess > 0 {
                    debug!(count = excess, revision = %rev, "Unassigning instances");
                    let tail = assigned.split_off(assigned.len() - excess);
                    assignable.extend(tail);
                }
            }
        }
        debug!(
            assignable = assignable.len(),
            unassigned = unassigned,
            "Found assignable instances"
        );

        // Add instances to under-provisioned revisions:
        let mut reassigned: Vec<AssignmentRecord> = Vec::new();
        for (rev, target) in &targets {
            let current = assignments
                .get(&Some(rev.clone()))
                .map(Vec::len)
                .unwrap_or(0);
            let to_schedule = target.saturating_sub(current);
            if to_schedule == 0 {
                continue;
            }
            debug!(count = to_schedule, revision = %rev, "Scheduling instances");
            for mut record in assignable.drain(..to_schedule.min(assignable.len())) {
                record.assignment = Some(rev.clone());
                record.service.get_or_insert_with(|| service.to_string());
                reassigned.push(record);
            }
        }

        // Store assignment updates, unless leadership was lost mid-pass:
        if !reassigned.is_empty() && self.is_active() {
            debug!(count = reassigned.len(), "Storing reassignments");
            self.store.set_assignments(&reassigned).await?;
        }
        Ok(())
    }

    /// Tick wrappers: periodic runners log and continue on error.
    pub async fn lock_tick(&self) {
        if let Err(e) = self.lock().await {
            warn!(error = %e, "Lock tick failed");
        }
    }

    pub async fn balance_tick(&self) {
        if let Err(e) = self.balance().await {
            warn!(error = %e, "Balance tick failed");
        }
    }

    /// Ideal instance count per revision.
    ///
    /// Targets are `round(weight/total * instances)`. Rounding error is
    /// repaired against the revision with the current maximum (when over)
    /// or minimum (when under) target; revisions iterate in ascending hash
    /// order throughout, which fixes the tie-break. Returns `None` when
    /// every weight is zero.
    pub fn instance_targets(
        revisions: &BTreeMap<String, i64>,
        instance_count: usize,
    ) -> Option<BTreeMap<String, usize>> {
        let total_weight: i64 = revisions.values().sum();
        if total_weight <= 0 {
            return None;
        }

        let mut targets: BTreeMap<String, usize> = revisions
            .iter()
            .map(|(rev, weight)| {
                let pct = *weight as f64 / total_weight as f64;
                (rev.clone(), (pct * instance_count as f64).round() as usize)
            })
            .collect();

        loop {
            let assigned: usize = targets.values().sum();
            if assigned == instance_count {
                break;
            }
            if assigned > instance_count {
                let max = *targets.values().max().expect("targets not empty");
                let rev = targets
                    .iter()
                    .find(|(_, count)| **count == max)
                    .map(|(rev, _)| rev.clone())
                    .expect("max target exists");
                *targets.get_mut(&rev).expect("target exists") -= 1;
            } else {
                let min = *targets.values().min().expect("targets not empty");
                let rev = targets
                    .iter()
                    .find(|(_, count)| **count == min)
                    .map(|(rev, _)| rev.clone())
                    .expect("min target exists");
                *targets.get_mut(&rev).expect("target exists") += 1;
            }
        }
        Some(targets)
    }
}
