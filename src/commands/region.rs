//! `flotilla region` - configure a region.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use flotilla::config::Config;
use flotilla::crypto::LocalKeyService;
use flotilla::publisher::Publisher;
use flotilla::store::Attrs;

/// Apply a shallow update to one or more region records.
pub async fn configure(
    config: Config,
    regions: Vec<String>,
    admins: Vec<String>,
    instance_type: Option<String>,
    settings: Vec<String>,
) -> Result<()> {
    let mut attrs = Attrs::new();
    if !admins.is_empty() {
        attrs.insert("admins".into(), serde_json::json!(admins));
    }
    if let Some(instance_type) = instance_type {
        attrs.insert("instance_type".into(), instance_type.into());
    }
    for setting in settings {
        match setting.split_once('=') {
            Some((key, value)) => {
                attrs.insert(key.to_string(), value.into());
            }
            None => warn!(setting = %setting, "Ignoring setting without '='"),
        }
    }
    if attrs.is_empty() {
        warn!("No updates to do!");
        return Ok(());
    }

    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend, Arc::new(LocalKeyService::new()));
    for region in &regions {
        publisher.configure_region(region, attrs.clone()).await?;
    }
    info!(regions = ?regions, "Regions updated");
    Ok(())
}
