//! `flotilla user` - configure a user.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use flotilla::config::Config;
use flotilla::crypto::LocalKeyService;
use flotilla::publisher::Publisher;
use flotilla::store::Attrs;

/// Apply a shallow update to a user record.
pub async fn configure(
    config: Config,
    name: String,
    ssh_keys: Vec<String>,
    active: Option<bool>,
) -> Result<()> {
    let mut attrs = Attrs::new();
    if !ssh_keys.is_empty() {
        attrs.insert("ssh_keys".into(), serde_json::json!(ssh_keys));
    }
    if let Some(active) = active {
        attrs.insert("active".into(), active.into());
    }
    if attrs.is_empty() {
        warn!("No updates to do!");
        return Ok(());
    }

    let backend = super::open_backend(&config)?;
    let publisher = Publisher::new(backend, Arc::new(LocalKeyService::new()));
    publisher.configure_user(&name, attrs).await?;
    info!(user = %name, "User updated");
    Ok(())
}
