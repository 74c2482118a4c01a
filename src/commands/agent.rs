//! `flotilla agent` - run the per-instance reconcile loop.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use flotilla::agent::{Agent, AgentMessaging, AgentStore, InstanceBalancer, SystemctlManager, UnitFiles};
use flotilla::config::Config;
use flotilla::crypto::LocalKeyService;
use flotilla::loadbalancer::{LoadBalancer, NoopBalancer};
use flotilla::messaging::{scheduler_queue_name, service_queue_name};
use flotilla::store::DistributedLocks;
use flotilla::tasks::{shutdown_all, FnTick, RepeatingTask};

/// Start the agent and block until interrupted.
pub async fn run(config: Config) -> Result<()> {
    config.validate_agent()?;
    let service = config.service.clone().expect("validated above");
    let instance_id = super::instance_id();
    info!(instance = %instance_id, service = %service, "Starting agent");

    let backend = super::open_backend(&config)?;
    let keys = Arc::new(LocalKeyService::new());
    let store = Arc::new(
        AgentStore::new(backend.clone(), &instance_id, &service, keys)
            .with_strict_content(config.agent.strict_content),
    );
    let locks = Arc::new(DistributedLocks::new(backend, &instance_id));

    let units = Arc::new(
        UnitFiles::new(Arc::new(SystemctlManager))
            .with_dirs(&config.agent.unit_dir, &config.agent.env_dir),
    );

    let balancer = config.balancer.as_ref().map(|name| {
        // Balancer drivers are deployment specific; the stub keeps the
        // drain/attach protocol intact without an external dependency.
        let driver: Arc<dyn LoadBalancer> = Arc::new(NoopBalancer);
        (driver, name.clone())
    });
    let balancer = match balancer {
        Some((driver, name)) => Arc::new(InstanceBalancer::new(Some(driver), name, &instance_id)),
        None => Arc::new(InstanceBalancer::new(None, "", &instance_id)),
    };

    let environment = config.environment.as_deref();
    let scheduler_queue =
        super::connect_queue(&config, &scheduler_queue_name(environment)).await?;
    let service_queue =
        super::connect_queue(&config, &service_queue_name(environment, &service)).await?;
    let messaging = Arc::new(AgentMessaging::new(
        &service,
        &instance_id,
        scheduler_queue,
        service_queue,
    ));

    let agent = Arc::new(Agent::new(&service, store, locks, units, balancer, messaging));

    let health_agent = agent.clone();
    let assignment_agent = agent.clone();
    let receive_agent = agent.clone();
    let tasks = vec![
        RepeatingTask::spawn(
            "health",
            config.health_interval(),
            Arc::new(FnTick(move || {
                let agent = health_agent.clone();
                async move { agent.health_tick().await }
            })),
        ),
        RepeatingTask::spawn(
            "assignment",
            config.assignment_interval(),
            Arc::new(FnTick(move || {
                let agent = assignment_agent.clone();
                async move { agent.assignment_tick().await }
            })),
        ),
        // The receive tick long-polls internally; no extra sleep.
        RepeatingTask::spawn(
            "messaging",
            Duration::ZERO,
            Arc::new(FnTick(move || {
                let agent = receive_agent.clone();
                async move { agent.receive_tick().await }
            })),
        ),
    ];
    info!("Startup complete");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_all(tasks).await;
    Ok(())
}
