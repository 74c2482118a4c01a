//! `flotilla service` - configure a service.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use flotilla::config::Config;
use flotilla::crypto::LocalKeyService;
use flotilla::publisher::Publisher;
use flotilla::store::Attrs;

/// Flags accepted by the `service` command.
#[derive(Debug, Default)]
pub struct ServiceUpdates {
    pub elb_scheme: Option<String>,
    pub dns_name: Option<String>,
    pub health_check: Option<String>,
    pub instance_type: Option<String>,
    pub instance_min: Option<i64>,
    pub instance_max: Option<i64>,
    pub kms_key: Option<String>,
    pub provision: Option<bool>,
    pub admins: Vec<String>,
    pub public_ports: Vec<String>,
    pub private_ports: Vec<String>,
}

/// Apply a shallow update to a service record.
pub async fn configure(config: Config, name: String, updates: ServiceUpdates) -> Result<()> {
    let attrs = build_updates(updates);
    if attrs.is_empty() {
        warn!("No updates to do!");
        return Ok(());
    }

    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend, Arc::new(LocalKeyService::new()));
    publisher.configure_service(&name, attrs).await?;
    info!(service = %name, "Service updated");
    Ok(())
}

fn build_updates(updates: ServiceUpdates) -> Attrs {
    let mut attrs = Attrs::new();
    if let Some(elb_scheme) = updates.elb_scheme {
        attrs.insert("elb_scheme".into(), elb_scheme.into());
    }
    if let Some(dns_name) = updates.dns_name {
        attrs.insert("dns_name".into(), dns_name.into());
    }
    if let Some(health_check) = updates.health_check {
        attrs.insert("health_check".into(), health_check.into());
    }
    if let Some(instance_type) = updates.instance_type {
        attrs.insert("instance_type".into(), instance_type.into());
    }
    if let Some(instance_min) = updates.instance_min {
        attrs.insert("instance_min".into(), instance_min.into());
    }
    if let Some(instance_max) = updates.instance_max {
        attrs.insert("instance_max".into(), instance_max.into());
    }
    if let Some(kms_key) = updates.kms_key {
        attrs.insert("kms_key".into(), kms_key.into());
    }
    if let Some(provision) = updates.provision {
        attrs.insert("provision".into(), provision.into());
    }
    if !updates.admins.is_empty() {
        attrs.insert("admins".into(), serde_json::json!(updates.admins));
    }
    if let Some(ports) = parse_public_ports(&updates.public_ports) {
        attrs.insert("public_ports".into(), ports);
    }
    if let Some(ports) = parse_private_ports(&updates.private_ports) {
        attrs.insert("private_ports".into(), ports);
    }
    attrs
}

/// Parse `80-http` style flags into `{"80": "HTTP"}`. Unparseable entries
/// are skipped.
pub fn parse_public_ports(ports: &[String]) -> Option<serde_json::Value> {
    let mut parsed = serde_json::Map::new();
    for entry in ports {
        if let Some((port, proto)) = entry.split_once('-') {
            if port.parse::<u16>().is_ok() {
                parsed.insert(port.to_string(), proto.to_uppercase().into());
            }
        }
    }
    if parsed.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(parsed))
    }
}

/// Parse `9300-tcp` style flags into `{"9300": ["TCP"]}`.
pub fn parse_private_ports(ports: &[String]) -> Option<serde_json::Value> {
    let mut parsed: serde_json::Map<String, serde_json::Value> = serde_json::Map::new();
    for entry in ports {
        if let Some((port, proto)) = entry.split_once('-') {
            if port.parse::<u16>().is_ok() {
                let protocols = parsed
                    .entry(port.to_string())
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                if let Some(list) = protocols.as_array_mut() {
                    list.push(proto.to_uppercase().into());
                }
            }
        }
    }
    if parsed.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(parsed))
    }
}
