//! `flotilla keys` - print authorized SSH keys.
//!
//! Intended as an `AuthorizedKeysCommand`: resolves the admin set for this
//! host (service workers, bastions, or plain region admins) and prints the
//! active users' public keys, one per line.

use anyhow::{bail, Result};

use flotilla::config::Config;
use flotilla::ssh::SshKeys;

pub async fn print(config: Config, service: Option<String>, bastion: bool) -> Result<()> {
    let region = match config.regions.first() {
        Some(region) => region.clone(),
        None => bail!("FLOTILLA_REGION is required to resolve keys"),
    };

    let backend = super::open_backend(&config)?;
    let ssh = SshKeys::new(backend, region);

    let users = if let Some(service) = service {
        ssh.get_service_admins(&service).await?
    } else if bastion {
        ssh.get_bastion_users().await?
    } else {
        ssh.get_region_admins().await?
    };

    for key in ssh.get_keys(&users).await? {
        println!("{key}");
    }
    Ok(())
}
