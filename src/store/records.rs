//! Typed records and their flat-schema serialization.
//!
//! The store keeps every row as a flat attribute map. A service row mixes
//! metadata columns with revision-weight columns distinguished only by key
//! shape (64 hex chars), so the typed [`ServiceRecord`] splits them apart on
//! read and recombines them on write, preserving on-disk compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::is_rev_hash;

use super::{Attrs, StoreError, StoreResult, Table};

/// Service row: metadata plus an explicit weight vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRecord {
    pub name: String,
    pub metadata: ServiceMetadata,
    /// `revision_hash -> weight`. Negative weights are quarantined
    /// revisions, zero is present but inactive.
    pub weights: BTreeMap<String, i64>,
}

/// Mutable service metadata. Unknown columns round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key: Option<String>,

    /// Public ports exposed by the load balancer, `port -> protocol`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ports: Option<BTreeMap<String, String>>,

    /// Private ports exposed to peers, `port -> protocols`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ports: Option<BTreeMap<String, Vec<String>>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_min: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_max: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elb_scheme: Option<String>,

    /// Users allowed to SSH into the service's workers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admins: Option<Vec<String>>,

    /// Outputs of the provisioned stack; `Elb` names the load balancer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_outputs: Option<BTreeMap<String, String>>,

    #[serde(flatten)]
    pub extra: Attrs,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load balancer name from the provisioned stack outputs.
    pub fn load_balancer(&self) -> Option<&str> {
        self.metadata
            .stack_outputs
            .as_ref()
            .and_then(|outputs| outputs.get("Elb"))
            .map(String::as_str)
    }

    /// Split a flat row into metadata and weights. A column is a weight iff
    /// its key is 64 hex chars and its value an integer.
    pub fn from_attrs(attrs: Attrs) -> StoreResult<Self> {
        let mut meta_attrs = Attrs::new();
        let mut weights = BTreeMap::new();
        let mut name = String::new();

        for (key, value) in attrs {
            if key == "service_name" {
                name = value.as_str().unwrap_or_default().to_string();
            } else if is_rev_hash(&key) {
                let weight = value.as_i64().ok_or_else(|| {
                    StoreError::malformed(Table::Services, format!("weight {key} not an integer"))
                })?;
                weights.insert(key, weight);
            } else {
                meta_attrs.insert(key, value);
            }
        }

        if name.is_empty() {
            return Err(StoreError::malformed(Table::Services, "missing service_name"));
        }

        let metadata: ServiceMetadata = serde_json::from_value(Value::Object(meta_attrs))
            .map_err(|e| StoreError::malformed(Table::Services, e.to_string()))?;

        Ok(Self {
            name,
            metadata,
            weights,
        })
    }

    /// Flatten back into the stored shape.
    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = match serde_json::to_value(&self.metadata) {
            Ok(Value::Object(map)) => map,
            _ => Attrs::new(),
        };
        attrs.insert("service_name".into(), self.name.clone().into());
        for (rev_hash, weight) in &self.weights {
            attrs.insert(rev_hash.clone(), (*weight).into());
        }
        attrs
    }
}

/// Revision row: label plus the ordered unit hash list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub rev_hash: String,
    pub label: String,
    pub units: Vec<String>,
}

impl RevisionRecord {
    pub fn from_attrs(attrs: Attrs) -> StoreResult<Self> {
        serde_json::from_value(Value::Object(attrs))
            .map_err(|e| StoreError::malformed(Table::Revisions, e.to_string()))
    }

    pub fn to_attrs(&self) -> Attrs {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Attrs::new(),
        }
    }
}

/// Environment storage for a unit row: plaintext map or envelope blob.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEnvironment {
    /// Envelope-encrypted: all fields base64
    Encrypted {
        environment_key: String,
        environment_iv: String,
        environment_data: String,
    },
    /// Plaintext environment map
    Plain { environment: BTreeMap<String, String> },
}

/// Unit row. Immutable once written; the hash is computed over the
/// plaintext environment regardless of how it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRecord {
    pub unit_hash: String,
    pub name: String,
    pub unit_file: String,
    pub environment: Option<UnitEnvironment>,
}

impl UnitRecord {
    /// The environment columns are `environment` (plaintext map) or the
    /// three `environment_*` blob fields; both shapes share a row layout.
    pub fn from_attrs(attrs: Attrs) -> StoreResult<Self> {
        let string = |field: &str| -> StoreResult<String> {
            attrs
                .get(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| StoreError::malformed(Table::Units, format!("missing {field}")))
        };

        let environment = if attrs.contains_key("environment_data") {
            Some(UnitEnvironment::Encrypted {
                environment_key: string("environment_key")?,
                environment_iv: string("environment_iv")?,
                environment_data: string("environment_data")?,
            })
        } else if let Some(value) = attrs.get("environment") {
            let environment = serde_json::from_value(value.clone())
                .map_err(|e| StoreError::malformed(Table::Units, e.to_string()))?;
            Some(UnitEnvironment::Plain { environment })
        } else {
            None
        };

        Ok(Self {
            unit_hash: string("unit_hash")?,
            name: string("name")?,
            unit_file: string("unit_file")?,
            environment,
        })
    }

    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("unit_hash".into(), self.unit_hash.clone().into());
        attrs.insert("name".into(), self.name.clone().into());
        attrs.insert("unit_file".into(), self.unit_file.clone().into());
        match &self.environment {
            Some(UnitEnvironment::Plain { environment }) => {
                if let Ok(value) = serde_json::to_value(environment) {
                    attrs.insert("environment".into(), value);
                }
            }
            Some(UnitEnvironment::Encrypted {
                environment_key,
                environment_iv,
                environment_data,
            }) => {
                attrs.insert("environment_key".into(), environment_key.clone().into());
                attrs.insert("environment_iv".into(), environment_iv.clone().into());
                attrs.insert("environment_data".into(), environment_data.clone().into());
            }
            None => {}
        }
        attrs
    }
}

/// Assignment row: one instance (or global shard) mapped to one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub instance_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment: Option<String>,

    /// Service the instance reported status for; carried on rows created
    /// for unassigned instances so the scheduler can write them back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl AssignmentRecord {
    pub fn unassigned(instance_id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            assignment: None,
            service: Some(service.into()),
        }
    }

    pub fn from_attrs(attrs: Attrs) -> StoreResult<Self> {
        serde_json::from_value(Value::Object(attrs))
            .map_err(|e| StoreError::malformed(Table::Assignments, e.to_string()))
    }

    pub fn to_attrs(&self) -> Attrs {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Attrs::new(),
        }
    }
}

/// Per-unit state as reported by the unit manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub active_enter_time: f64,
    pub active_exit_time: f64,
}

impl UnitStatus {
    pub fn running(active_enter_time: f64) -> Self {
        Self {
            load_state: "loaded".into(),
            active_state: "active".into(),
            sub_state: "running".into(),
            active_enter_time,
            active_exit_time: 0.0,
        }
    }
}

/// Instance status row, heartbeat-written by the agent. An instance is live
/// iff `now - status_time <= INSTANCE_EXPIRY`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatusRecord {
    pub service: String,
    pub instance_id: String,
    pub status_time: f64,
    /// deployed unit name -> state
    pub units: BTreeMap<String, UnitStatus>,
}

impl InstanceStatusRecord {
    pub fn from_attrs(attrs: Attrs) -> StoreResult<Self> {
        let mut record = Self {
            service: String::new(),
            instance_id: String::new(),
            status_time: 0.0,
            units: BTreeMap::new(),
        };
        for (key, value) in attrs {
            match key.as_str() {
                "service" => record.service = value.as_str().unwrap_or_default().to_string(),
                "instance_id" => {
                    record.instance_id = value.as_str().unwrap_or_default().to_string()
                }
                "status_time" => record.status_time = value.as_f64().unwrap_or(0.0),
                _ => {
                    let status = serde_json::from_value(value)
                        .map_err(|e| StoreError::malformed(Table::Status, e.to_string()))?;
                    record.units.insert(key, status);
                }
            }
        }
        if record.service.is_empty() || record.instance_id.is_empty() {
            return Err(StoreError::malformed(Table::Status, "missing key attributes"));
        }
        Ok(record)
    }

    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("service".into(), self.service.clone().into());
        attrs.insert("instance_id".into(), self.instance_id.clone().into());
        attrs.insert("status_time".into(), self.status_time.into());
        for (unit_name, status) in &self.units {
            if let Ok(value) = serde_json::to_value(status) {
                attrs.insert(unit_name.clone(), value);
            }
        }
        attrs
    }
}

/// Lock row. Ownership changes only through conditional saves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_name: String,
    pub owner: String,
    pub acquire_time: f64,
}

impl LockRecord {
    pub fn from_attrs(attrs: Attrs) -> StoreResult<Self> {
        serde_json::from_value(Value::Object(attrs))
            .map_err(|e| StoreError::malformed(Table::Locks, e.to_string()))
    }

    pub fn to_attrs(&self) -> Attrs {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Attrs::new(),
        }
    }
}

/// User row, consumed by the SSH key resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,

    #[serde(default)]
    pub ssh_keys: Vec<String>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl UserRecord {
    pub fn from_attrs(attrs: Attrs) -> StoreResult<Self> {
        serde_json::from_value(Value::Object(attrs))
            .map_err(|e| StoreError::malformed(Table::Users, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::REV_HASH_LEN;

    fn rev(ch: char) -> String {
        std::iter::repeat(ch).take(REV_HASH_LEN).collect()
    }

    #[test]
    fn test_service_record_round_trip() {
        let mut record = ServiceRecord::new("testapp");
        record.metadata.dns_name = Some("testapp.example.com".into());
        record.metadata.instance_min = Some(2);
        record.weights.insert(rev('a'), 3);
        record.weights.insert(rev('b'), -1);

        let attrs = record.to_attrs();
        assert_eq!(attrs.get(&rev('a')).unwrap().as_i64(), Some(3));
        assert_eq!(attrs.get("dns_name").unwrap().as_str(), Some("testapp.example.com"));

        let parsed = ServiceRecord::from_attrs(attrs).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_service_record_keeps_unknown_metadata() {
        let mut attrs = Attrs::new();
        attrs.insert("service_name".into(), "testapp".into());
        attrs.insert("coreos_channel".into(), "stable".into());
        let record = ServiceRecord::from_attrs(attrs).unwrap();
        assert_eq!(
            record.metadata.extra.get("coreos_channel").unwrap().as_str(),
            Some("stable")
        );
        let attrs = record.to_attrs();
        assert!(attrs.contains_key("coreos_channel"));
    }

    #[test]
    fn test_service_record_load_balancer() {
        let mut record = ServiceRecord::new("testapp");
        assert!(record.load_balancer().is_none());
        let mut outputs = BTreeMap::new();
        outputs.insert("Elb".to_string(), "testapp-elb".to_string());
        record.metadata.stack_outputs = Some(outputs);
        assert_eq!(record.load_balancer(), Some("testapp-elb"));
    }

    #[test]
    fn test_unit_record_plain_environment() {
        let mut environment = BTreeMap::new();
        environment.insert("PORT".to_string(), "8080".to_string());
        let record = UnitRecord {
            unit_hash: rev('c'),
            name: "app.service".into(),
            unit_file: "[Service]\n".into(),
            environment: Some(UnitEnvironment::Plain { environment }),
        };
        let attrs = record.to_attrs();
        assert!(attrs.contains_key("environment"));
        assert!(!attrs.contains_key("environment_data"));
        assert_eq!(UnitRecord::from_attrs(attrs).unwrap(), record);
    }

    #[test]
    fn test_unit_record_encrypted_environment() {
        let record = UnitRecord {
            unit_hash: rev('d'),
            name: "app.service".into(),
            unit_file: "[Service]\n".into(),
            environment: Some(UnitEnvironment::Encrypted {
                environment_key: "a2V5".into(),
                environment_iv: "aXY=".into(),
                environment_data: "ZGF0YQ==".into(),
            }),
        };
        let attrs = record.to_attrs();
        assert!(attrs.contains_key("environment_data"));
        assert!(!attrs.contains_key("environment"));
        assert_eq!(UnitRecord::from_attrs(attrs).unwrap(), record);
    }

    #[test]
    fn test_status_record_round_trip() {
        let mut units = BTreeMap::new();
        units.insert("flotilla-app-abc.service".to_string(), UnitStatus::running(100.0));
        let record = InstanceStatusRecord {
            service: "testapp".into(),
            instance_id: "i-123".into(),
            status_time: 1000.5,
            units,
        };
        let parsed = InstanceStatusRecord::from_attrs(record.to_attrs()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_user_record_defaults() {
        let mut attrs = Attrs::new();
        attrs.insert("username".into(), "alice".into());
        let user = UserRecord::from_attrs(attrs).unwrap();
        assert!(user.active);
        assert!(user.ssh_keys.is_empty());
    }
}
