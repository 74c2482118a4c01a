//! `flotilla scheduler` - run the per-region scheduler supervisors.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use flotilla::config::Config;
use flotilla::loadbalancer::NoopBalancer;
use flotilla::messaging::scheduler_queue_name;
use flotilla::scheduler::{
    NoopProvisioner, ProvisionLoop, Scheduler, SchedulerMessaging, SchedulerStore, ServiceDoctor,
};
use flotilla::store::{DistributedLocks, SqliteBackend};
use flotilla::tasks::{shutdown_all, FnTick, RepeatingTask};

/// Start one scheduler per configured region and block until interrupted.
pub async fn run(config: Config) -> Result<()> {
    config.validate_scheduler()?;
    let instance_id = super::instance_id();
    info!(instance = %instance_id, regions = ?config.regions, "Starting scheduler");

    let mut tasks = Vec::new();
    for region in &config.regions {
        // Each region is an independent control-plane domain with its own
        // store file.
        let mut path = config.store.sqlite_path.clone();
        if config.regions.len() > 1 {
            let file_name = match path.file_stem().and_then(|stem| stem.to_str()) {
                Some(stem) => format!("{stem}-{region}.db"),
                None => format!("flotilla-{region}.db"),
            };
            path.set_file_name(file_name);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let backend = Arc::new(SqliteBackend::open(&path, config.environment.as_deref())?);

        let store = Arc::new(SchedulerStore::new(backend.clone()));
        let locks = Arc::new(DistributedLocks::new(backend, &instance_id));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            locks,
            config.scheduler_lock_ttl(),
        ));

        let lock_scheduler = scheduler.clone();
        tasks.push(RepeatingTask::spawn(
            format!("scheduler-lock-{region}"),
            config.lock_interval(),
            Arc::new(FnTick(move || {
                let scheduler = lock_scheduler.clone();
                async move { scheduler.lock_tick().await }
            })),
        ));

        let balance_scheduler = scheduler.clone();
        tasks.push(RepeatingTask::spawn(
            format!("scheduler-{region}"),
            config.loop_interval(),
            Arc::new(FnTick(move || {
                let scheduler = balance_scheduler.clone();
                async move { scheduler.balance_tick().await }
            })),
        ));

        let provision_loop = Arc::new(ProvisionLoop::new(
            region,
            store.clone(),
            scheduler.clone(),
            Arc::new(NoopProvisioner),
        ));
        tasks.push(RepeatingTask::spawn(
            format!("provisioner-{region}"),
            config.provision_interval(),
            Arc::new(FnTick(move || {
                let provision_loop = provision_loop.clone();
                async move { provision_loop.provision().await }
            })),
        ));

        // Messaging is optional: without a reachable broker the periodic
        // balance loop still converges, just less promptly.
        let queue_name = scheduler_queue_name(config.environment.as_deref());
        match super::connect_queue(&config, &queue_name).await {
            Ok(queue) => {
                let doctor = Arc::new(ServiceDoctor::new(store, Arc::new(NoopBalancer)));
                let messaging = Arc::new(SchedulerMessaging::new(queue, scheduler, doctor));
                tasks.push(RepeatingTask::spawn(
                    format!("scheduler-message-{region}"),
                    Duration::ZERO,
                    Arc::new(FnTick(move || {
                        let messaging = messaging.clone();
                        async move { messaging.receive().await }
                    })),
                ));
            }
            Err(e) => warn!(region = %region, error = %e, "Scheduler message queue not found"),
        }
    }
    info!("Startup complete");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_all(tasks).await;
    Ok(())
}
