//! Publisher: writes content-addressed units and revisions.
//!
//! The publisher is the only writer of `units` and `revisions` rows. Units
//! and revisions are immutable once written; publishing the same content
//! twice is a no-op because rows are keyed by content hash. Weights live as
//! columns on the service row and are the only mutable part of a
//! deployment.
//!
//! When a service carries a `kms_key`, every unit environment is replaced
//! by an envelope-encrypted blob before it is stored. The content hash is
//! computed over the plaintext regardless, so an encrypted and a plaintext
//! copy of the same unit share a row.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crypto::{encrypt_environment, KeyService};
use crate::error::Result;
use crate::models::{ServiceRevision, ServiceUnit, GLOBAL_ASSIGNMENT, GLOBAL_ASSIGNMENT_SHARDS};
use crate::store::records::{
    AssignmentRecord, RevisionRecord, ServiceRecord, UnitEnvironment, UnitRecord,
};
use crate::store::{Attrs, Key, PutCondition, SharedBackend, StoreBackend, Table};

/// Client for publishing revisions and configuring services, regions and
/// users.
pub struct Publisher {
    backend: SharedBackend,
    keys: Arc<dyn KeyService>,
}

impl Publisher {
    pub fn new(backend: SharedBackend, keys: Arc<dyn KeyService>) -> Self {
        Self { backend, keys }
    }

    /// Publish a revision to a service and set its weight. Creates the
    /// service row when missing. Returns the revision hash.
    pub async fn add_revision(&self, service: &str, revision: &ServiceRevision) -> Result<String> {
        let service_row = self
            .backend
            .get(Table::Services, &Key::hash(service))
            .await?;
        let kms_key = match service_row {
            Some(attrs) => ServiceRecord::from_attrs(attrs)?.metadata.kms_key,
            None => None,
        };

        let rev_hash = self.store_revision(revision, kms_key.as_deref()).await?;

        let mut weight_update = Attrs::new();
        weight_update.insert(rev_hash.clone(), revision.weight.into());
        self.backend
            .update(Table::Services, &Key::hash(service), weight_update)
            .await?;
        Ok(rev_hash)
    }

    /// Remove a revision's weight column and its revision row. Unit rows
    /// are content addressed and possibly shared, so they are left alone.
    pub async fn del_revision(&self, service: &str, rev_hash: &str) -> Result<()> {
        match self
            .backend
            .get(Table::Services, &Key::hash(service))
            .await?
        {
            Some(attrs) => {
                if attrs.contains_key(rev_hash) {
                    self.backend
                        .remove_attributes(
                            Table::Services,
                            &Key::hash(service),
                            &[rev_hash.to_string()],
                        )
                        .await?;
                }
            }
            None => {
                warn!(service = %service, revision = %rev_hash, "Service not found, unable to delete");
            }
        }

        match self
            .backend
            .get(Table::Revisions, &Key::hash(rev_hash))
            .await?
        {
            Some(_) => {
                self.backend
                    .delete(Table::Revisions, &Key::hash(rev_hash))
                    .await?
            }
            None => warn!(revision = %rev_hash, "Revision not found, unable to delete"),
        }
        Ok(())
    }

    /// Partial update of one weight column. Missing service is logged, not
    /// fatal.
    pub async fn set_revision_weight(
        &self,
        service: &str,
        rev_hash: &str,
        weight: i64,
    ) -> Result<()> {
        if self
            .backend
            .get(Table::Services, &Key::hash(service))
            .await?
            .is_none()
        {
            warn!(
                service = %service,
                revision = %rev_hash,
                "Service not found, unable to set weight"
            );
            return Ok(());
        }
        let mut update = Attrs::new();
        update.insert(rev_hash.to_string(), weight.into());
        self.backend
            .update(Table::Services, &Key::hash(service), update)
            .await?;
        Ok(())
    }

    /// Resolve a service's revisions with weights, labels and units.
    /// Encrypted environments stay encrypted; callers needing plaintext go
    /// through the agent store.
    pub async fn get_revisions(&self, service: &str) -> Result<Vec<ServiceRevision>> {
        let service_record = match self
            .backend
            .get(Table::Services, &Key::hash(service))
            .await?
        {
            Some(attrs) => ServiceRecord::from_attrs(attrs)?,
            None => return Ok(Vec::new()),
        };

        let rev_keys: Vec<Key> = service_record.weights.keys().map(Key::hash).collect();
        debug!(service = %service, revisions = rev_keys.len(), "Loading revisions");

        let mut revisions = Vec::new();
        let mut unit_hashes: HashSet<String> = HashSet::new();
        let mut rev_records = Vec::new();
        for attrs in self.backend.batch_get(Table::Revisions, &rev_keys).await? {
            let record = RevisionRecord::from_attrs(attrs)?;
            unit_hashes.extend(record.units.iter().cloned());
            rev_records.push(record);
        }

        let unit_keys: Vec<Key> = unit_hashes.iter().map(Key::hash).collect();
        let mut units: BTreeMap<String, ServiceUnit> = BTreeMap::new();
        for attrs in self.backend.batch_get(Table::Units, &unit_keys).await? {
            let record = UnitRecord::from_attrs(attrs)?;
            let environment = match record.environment {
                Some(UnitEnvironment::Plain { environment }) => environment,
                _ => BTreeMap::new(),
            };
            units.insert(
                record.unit_hash.clone(),
                ServiceUnit::new(record.name, record.unit_file, environment),
            );
        }

        for record in rev_records {
            let weight = service_record
                .weights
                .get(&record.rev_hash)
                .copied()
                .unwrap_or(0);
            let rev_units = record
                .units
                .iter()
                .filter_map(|hash| units.get(hash).cloned())
                .collect();
            revisions.push(ServiceRevision::new(record.label, weight, rev_units));
        }
        Ok(revisions)
    }

    /// Shallow field merge on a service row.
    pub async fn configure_service(&self, service: &str, updates: Attrs) -> Result<()> {
        self.backend
            .update(Table::Services, &Key::hash(service), updates)
            .await?;
        Ok(())
    }

    /// Shallow field merge on a region row.
    pub async fn configure_region(&self, region: &str, updates: Attrs) -> Result<()> {
        self.backend
            .update(Table::Regions, &Key::hash(region), updates)
            .await?;
        Ok(())
    }

    /// Shallow field merge on a user row.
    pub async fn configure_user(&self, username: &str, updates: Attrs) -> Result<()> {
        self.backend
            .update(Table::Users, &Key::hash(username), updates)
            .await?;
        Ok(())
    }

    /// Which of these users do not exist yet.
    pub async fn check_users(&self, usernames: &[String]) -> Result<Vec<String>> {
        let keys: Vec<Key> = usernames.iter().map(Key::hash).collect();
        let mut missing: HashSet<&String> = usernames.iter().collect();
        for row in self.backend.batch_get(Table::Users, &keys).await? {
            if let Some(name) = row.get("username").and_then(|v| v.as_str()) {
                missing.retain(|candidate| candidate.as_str() != name);
            }
        }
        Ok(missing.into_iter().cloned().collect())
    }

    /// Publish a revision to every instance: write the revision, then point
    /// all global assignment shards at it.
    pub async fn set_global(&self, revision: &ServiceRevision) -> Result<String> {
        let rev_hash = self.store_revision(revision, None).await?;

        let assignments: Vec<Attrs> = (0..GLOBAL_ASSIGNMENT_SHARDS)
            .map(|shard| {
                AssignmentRecord {
                    instance_id: format!("{GLOBAL_ASSIGNMENT}_{shard}"),
                    assignment: Some(rev_hash.clone()),
                    service: None,
                }
                .to_attrs()
            })
            .collect();
        self.backend
            .batch_put(Table::Assignments, assignments)
            .await?;
        Ok(rev_hash)
    }

    /// Write missing unit rows, then the revision row. Both are skipped
    /// when already present.
    async fn store_revision(
        &self,
        revision: &ServiceRevision,
        kms_key: Option<&str>,
    ) -> Result<String> {
        let mut new_units = Vec::new();
        for unit in &revision.units {
            let unit_hash = unit.unit_hash();
            if self
                .backend
                .get(Table::Units, &Key::hash(&unit_hash))
                .await?
                .is_some()
            {
                debug!(unit = %unit_hash, "Unit exists");
                continue;
            }

            debug!(unit = %unit_hash, "Adding unit");
            let environment = if unit.environment.is_empty() {
                None
            } else if let Some(key_id) = kms_key {
                Some(encrypt_environment(self.keys.as_ref(), key_id, &unit.environment).await?)
            } else {
                Some(UnitEnvironment::Plain {
                    environment: unit.environment.clone(),
                })
            };
            new_units.push(
                UnitRecord {
                    unit_hash,
                    name: unit.name.clone(),
                    unit_file: unit.unit_file.clone(),
                    environment,
                }
                .to_attrs(),
            );
        }
        if !new_units.is_empty() {
            self.backend.batch_put(Table::Units, new_units).await?;
        }

        let rev_hash = revision.revision_hash();
        let mut unit_hashes: Vec<String> =
            revision.units.iter().map(|u| u.unit_hash()).collect();
        unit_hashes.sort();
        let rev_record = RevisionRecord {
            rev_hash: rev_hash.clone(),
            label: revision.label.clone(),
            units: unit_hashes,
        };
        self.backend
            .put_if(
                Table::Revisions,
                rev_record.to_attrs(),
                PutCondition::NotExists,
            )
            .await?;
        Ok(rev_hash)
    }
}
