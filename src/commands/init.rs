//! `flotilla init` - bootstrap an environment.
//!
//! Creates the store tables and seeds a region record per configured
//! region. Scheduler instances themselves are provisioned out of band;
//! this only prepares the state they share.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use flotilla::config::Config;
use flotilla::crypto::LocalKeyService;
use flotilla::publisher::Publisher;
use flotilla::store::Attrs;

pub async fn bootstrap(config: Config, regions: Vec<String>) -> Result<()> {
    // Opening the backend creates every table.
    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend, Arc::new(LocalKeyService::new()));

    let regions = if regions.is_empty() {
        config.regions.clone()
    } else {
        regions
    };
    for region in &regions {
        let mut attrs = Attrs::new();
        if let Some(domain) = &config.domain {
            attrs.insert("domain".into(), domain.clone().into());
        }
        publisher.configure_region(region, attrs).await?;
        info!(region = %region, "Region initialized");
    }

    info!(
        environment = config.environment.as_deref().unwrap_or("(none)"),
        "Bootstrap complete"
    );
    Ok(())
}
