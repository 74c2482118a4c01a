//! SSH key resolution for worker login.
//!
//! Region rows and service rows both carry an `admins` list; users carry
//! their public keys. The `keys` command resolves the right admin set for
//! a host (service workers, bastions, or plain region admins) and prints
//! the active users' keys, which makes it usable as an
//! `AuthorizedKeysCommand`.

use std::collections::BTreeSet;

use crate::store::records::UserRecord;
use crate::store::{Key, SharedBackend, StoreBackend, StoreResult, Table};

/// Resolves admin users and their SSH keys for one region.
pub struct SshKeys {
    backend: SharedBackend,
    region: String,
}

impl SshKeys {
    pub fn new(backend: SharedBackend, region: impl Into<String>) -> Self {
        Self {
            backend,
            region: region.into(),
        }
    }

    /// Admins of this region.
    pub async fn get_region_admins(&self) -> StoreResult<BTreeSet<String>> {
        let row = self
            .backend
            .get(Table::Regions, &Key::hash(&self.region))
            .await?;
        Ok(row
            .map(|attrs| admins_of(&attrs))
            .unwrap_or_default())
    }

    /// Region admins plus the service's own admins.
    pub async fn get_service_admins(&self, service: &str) -> StoreResult<BTreeSet<String>> {
        let mut admins = self.get_region_admins().await?;
        if let Some(attrs) = self
            .backend
            .get(Table::Services, &Key::hash(service))
            .await?
        {
            admins.extend(admins_of(&attrs));
        }
        Ok(admins)
    }

    /// Region admins plus every service's admins; bastions admit anyone
    /// who can reach some worker.
    pub async fn get_bastion_users(&self) -> StoreResult<BTreeSet<String>> {
        let mut admins = self.get_region_admins().await?;
        for attrs in self.backend.scan(Table::Services, 0, 1).await? {
            admins.extend(admins_of(&attrs));
        }
        Ok(admins)
    }

    /// Public keys of the active users among `users`.
    pub async fn get_keys(&self, users: &BTreeSet<String>) -> StoreResult<BTreeSet<String>> {
        let mut ssh_keys = BTreeSet::new();
        if users.is_empty() {
            return Ok(ssh_keys);
        }

        let keys: Vec<Key> = users.iter().map(Key::hash).collect();
        for attrs in self.backend.batch_get(Table::Users, &keys).await? {
            let user = UserRecord::from_attrs(attrs)?;
            if !user.active {
                continue;
            }
            ssh_keys.extend(user.ssh_keys);
        }
        Ok(ssh_keys)
    }
}

fn admins_of(attrs: &crate::store::Attrs) -> BTreeSet<String> {
    attrs
        .get("admins")
        .and_then(|value| value.as_array())
        .map(|admins| {
            admins
                .iter()
                .filter_map(|admin| admin.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
