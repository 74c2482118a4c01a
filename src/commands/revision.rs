//! `flotilla revision` - publish and manage revisions.
//!
//! `add` reads a directory of unit definitions: `<name>.service` files are
//! used verbatim, `<name>.env` files provide environments, and `<name>.json`
//! files synthesize docker units (`DOCKER_IMAGE`, `DOCKER_PORT_<host>`,
//! `DOCKER_LOG_DRIVER`). Service-level settings found in environments
//! (`ELB_SCHEME`, `DNS_NAME`, ..., `PUBLIC_PORT*`/`PRIVATE_PORT*`) are
//! split out into a service update instead of being deployed.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use flotilla::config::Config;
use flotilla::crypto::LocalKeyService;
use flotilla::error::DoctorError;
use flotilla::loadbalancer::NoopBalancer;
use flotilla::models::{docker_service_unit, ServiceRevision, ServiceUnit};
use flotilla::publisher::Publisher;
use flotilla::scheduler::{SchedulerStore, ServiceDoctor};
use flotilla::store::Attrs;

use super::service::{parse_private_ports, parse_public_ports};

/// Environment keys that configure the service rather than a unit.
const SERVICE_UPDATE_KEYS: [&str; 7] = [
    "ELB_SCHEME",
    "DNS_NAME",
    "HEALTH_CHECK",
    "INSTANCE_TYPE",
    "INSTANCE_MIN",
    "INSTANCE_MAX",
    "KMS_KEY",
];

const HEALTH_POLL: Duration = Duration::from_secs(5);

/// Publish a revision from a directory of unit definitions.
pub async fn add(
    config: Config,
    name: String,
    label: Option<String>,
    weight: i64,
    dir: &Path,
    env_overrides: Vec<String>,
    timeout_secs: u64,
) -> Result<()> {
    let (services, mut environments) = load_definitions(dir, config.environment.as_deref())?;
    apply_overrides(&mut environments, &env_overrides)?;
    let service_updates = extract_service_updates(&mut environments);

    let units = build_units(services, environments)?;
    if units.is_empty() {
        bail!("No units found in {}", dir.display());
    }

    let label = label.unwrap_or_else(|| format!("rev-{}", Utc::now().timestamp()));
    let revision = ServiceRevision::new(label, weight, units);

    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend.clone(), Arc::new(LocalKeyService::new()));

    if !service_updates.is_empty() {
        publisher.configure_service(&name, service_updates).await?;
    }
    let rev_hash = publisher.add_revision(&name, &revision).await?;
    info!(service = %name, revision = %rev_hash, "Revision published");

    if timeout_secs > 0 {
        wait_for_deployment(&backend, &publisher, &name, &rev_hash, weight, timeout_secs).await?;
    }
    Ok(())
}

/// Set one revision's weight.
pub async fn set_weight(config: Config, name: String, rev_hash: String, weight: i64) -> Result<()> {
    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend, Arc::new(LocalKeyService::new()));
    publisher.set_revision_weight(&name, &rev_hash, weight).await?;
    info!(service = %name, revision = %rev_hash, weight = weight, "Weight updated");
    Ok(())
}

/// Delete a revision.
pub async fn del(config: Config, name: String, rev_hash: String) -> Result<()> {
    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend, Arc::new(LocalKeyService::new()));
    publisher.del_revision(&name, &rev_hash).await?;
    info!(service = %name, revision = %rev_hash, "Revision deleted");
    Ok(())
}

/// Print a service's revisions.
pub async fn list(config: Config, name: String) -> Result<()> {
    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend, Arc::new(LocalKeyService::new()));
    for revision in publisher.get_revisions(&name).await? {
        println!(
            "{}  weight={}  units={}",
            revision.revision_hash(),
            revision.weight,
            revision.units.len()
        );
        for unit in &revision.units {
            println!("  {}", unit.name);
        }
    }
    Ok(())
}

/// Poll until the revision serves traffic somewhere, then retire every
/// other revision ("there can be only one"). On timeout the weight is
/// negated instead.
async fn wait_for_deployment(
    backend: &flotilla::store::SharedBackend,
    publisher: &Publisher,
    service: &str,
    rev_hash: &str,
    weight: i64,
    timeout_secs: u64,
) -> Result<()> {
    let store = Arc::new(SchedulerStore::new(backend.clone()));
    let doctor = ServiceDoctor::new(store, Arc::new(NoopBalancer));
    info!(revision = %rev_hash, "Waiting for deployment");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        match doctor.is_healthy_revision(service, rev_hash).await {
            Ok(true) => {
                info!(revision = %rev_hash, "Revision is healthy, retiring others");
                doctor
                    .make_only_revision(service, rev_hash)
                    .await
                    .context("Failed to finalize rollout")?;
                return Ok(());
            }
            Ok(false) => info!(revision = %rev_hash, "Waiting for a healthy instance"),
            Err(DoctorError::Quarantined { .. }) => {
                bail!("Revision {rev_hash} was quarantined during rollout");
            }
            Err(e) => warn!(error = %e, "Health check failed"),
        }

        if tokio::time::Instant::now() >= deadline {
            warn!(revision = %rev_hash, "Revision not stable before timeout, disabling");
            publisher
                .set_revision_weight(service, rev_hash, -weight.abs())
                .await?;
            bail!("Revision {rev_hash} not stable after {timeout_secs}s");
        }
        tokio::time::sleep(HEALTH_POLL).await;
    }
}

type Definitions = (BTreeMap<String, String>, BTreeMap<String, BTreeMap<String, String>>);

fn load_definitions(dir: &Path, environment: Option<&str>) -> Result<Definitions> {
    let mut services = BTreeMap::new();
    let mut environments = BTreeMap::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read unit directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let (stem, extension) = match (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|e| e.to_str()),
        ) {
            (Some(stem), Some(extension)) => (stem.to_string(), extension),
            _ => continue,
        };

        match extension {
            "service" => {
                let content = std::fs::read_to_string(&path)?;
                if !content.is_empty() {
                    services.insert(stem, content);
                }
            }
            "env" => {
                let content = std::fs::read_to_string(&path)?;
                environments.insert(stem, parse_env(&content));
            }
            "json" => {
                let content = std::fs::read_to_string(&path)?;
                environments.insert(stem, parse_json(&content, environment)?);
            }
            _ => {}
        }
    }
    Ok((services, environments))
}

/// Plain `KEY=value` lines; `#` comments ignored.
fn parse_env(contents: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for line in contents.lines() {
        if line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    env
}

/// JSON environments carry a `defaults` section overridden by the section
/// named after the current environment. An outer `flotilla` wrapper is
/// unwrapped when present.
fn parse_json(contents: &str, environment: Option<&str>) -> Result<BTreeMap<String, String>> {
    let body: serde_json::Value = serde_json::from_str(contents)?;
    let body = body.get("flotilla").unwrap_or(&body);

    let mut merged = BTreeMap::new();
    let mut sections = vec!["defaults"];
    if let Some(environment) = environment {
        sections.push(environment);
    }
    for section in sections {
        if let Some(map) = body.get(section).and_then(|v| v.as_object()) {
            for (key, value) in map {
                let value = match value.as_str() {
                    Some(text) => text.to_string(),
                    None => value.to_string(),
                };
                merged.insert(key.clone(), value);
            }
        }
    }
    Ok(merged)
}

fn apply_overrides(
    environments: &mut BTreeMap<String, BTreeMap<String, String>>,
    overrides: &[String],
) -> Result<()> {
    for env_var in overrides {
        let (key, value) = env_var
            .split_once('=')
            .with_context(|| format!("Invalid --env-var {env_var}, expected KEY=value"))?;
        for environment in environments.values_mut() {
            environment.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

/// Pull service-level settings out of the environments.
fn extract_service_updates(
    environments: &mut BTreeMap<String, BTreeMap<String, String>>,
) -> Attrs {
    let mut updates = Attrs::new();
    let mut public_ports = Vec::new();
    let mut private_ports = Vec::new();

    for environment in environments.values_mut() {
        let keys: Vec<String> = environment.keys().cloned().collect();
        for key in keys {
            if SERVICE_UPDATE_KEYS.contains(&key.as_str()) {
                let value = environment.remove(&key).expect("key just listed");
                updates.insert(key.to_lowercase(), value.into());
            } else if key.starts_with("PUBLIC_PORT") {
                public_ports.push(environment.remove(&key).expect("key just listed"));
            } else if key.starts_with("PRIVATE_PORT") {
                private_ports.push(environment.remove(&key).expect("key just listed"));
            }
        }
    }

    if let Some(ports) = parse_public_ports(&public_ports) {
        updates.insert("public_ports".into(), ports);
    }
    if let Some(ports) = parse_private_ports(&private_ports) {
        updates.insert("private_ports".into(), ports);
    }
    updates
}

fn build_units(
    services: BTreeMap<String, String>,
    environments: BTreeMap<String, BTreeMap<String, String>>,
) -> Result<Vec<ServiceUnit>> {
    let mut units = Vec::new();

    for (name, unit_file) in &services {
        let environment = environments.get(name).cloned().unwrap_or_default();
        units.push(ServiceUnit::new(
            format!("{name}.service"),
            unit_file.clone(),
            environment,
        ));
    }

    // Environments without a unit file synthesize a docker unit.
    for (name, environment) in environments {
        if services.contains_key(&name) {
            continue;
        }
        let mut environment = environment;
        let image = match environment.remove("DOCKER_IMAGE") {
            Some(image) => image,
            None => continue,
        };

        let mut ports = BTreeMap::new();
        let port_keys: Vec<String> = environment
            .keys()
            .filter(|key| key.starts_with("DOCKER_PORT_"))
            .cloned()
            .collect();
        for key in port_keys {
            let value = environment.remove(&key).expect("key just listed");
            if let (Ok(host), Ok(container)) =
                (key["DOCKER_PORT_".len()..].parse::<u16>(), value.parse::<u16>())
            {
                ports.insert(host, container);
            }
        }
        let logdriver = environment.remove("DOCKER_LOG_DRIVER");

        units.push(docker_service_unit(
            &format!("{name}.service"),
            &image,
            &ports,
            environment,
            logdriver.as_deref(),
        ));
    }
    Ok(units)
}
