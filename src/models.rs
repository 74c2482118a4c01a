// Core data structures for the flotilla control plane

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Prefix reserved for every unit and file owned by the agent.
pub const UNIT_PREFIX: &str = "flotilla-";

/// Key stem for system-wide assignments.
pub const GLOBAL_ASSIGNMENT: &str = "GLOBAL";

/// Number of well-known global assignment rows.
pub const GLOBAL_ASSIGNMENT_SHARDS: u64 = 16;

/// Length of a hex-encoded SHA-256 digest. A service-record column whose key
/// has this length is a revision weight, everything else is metadata.
pub const REV_HASH_LEN: usize = 64;

/// Systemd unit file plus configuration (environment variables).
///
/// Units are content addressed: two units with the same name, file text and
/// environment share a hash and a storage row, no matter which revision
/// references them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnit {
    /// Short unit name, e.g. `redis.service`
    pub name: String,

    /// Full unit file text
    pub unit_file: String,

    /// Environment variables, written to an env file at deploy time
    pub environment: BTreeMap<String, String>,

    /// Revision the unit is deployed under, set when resolved from an
    /// assignment. Distinguishes two revisions sharing one unit when both
    /// are deployed side by side.
    pub rev_hash: Option<String>,
}

impl ServiceUnit {
    /// Create a new unit with no revision tag.
    pub fn new(
        name: impl Into<String>,
        unit_file: impl Into<String>,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            unit_file: unit_file.into(),
            environment,
            rev_hash: None,
        }
    }

    /// Tag this unit with the revision it was resolved from.
    pub fn with_rev_hash(mut self, rev_hash: impl Into<String>) -> Self {
        self.rev_hash = Some(rev_hash.into());
        self
    }

    /// Content hash: SHA-256 over name, unit file and sorted environment
    /// pairs. Depends only on content, never on insertion order.
    pub fn unit_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.unit_file.as_bytes());
        for (env_key, env_value) in &self.environment {
            hasher.update(env_key.as_bytes());
            hasher.update(env_value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Name the unit is deployed under: `flotilla-<base>-<hash>.<ext>`,
    /// where the hash is the revision hash when assigned via a revision and
    /// the unit hash otherwise.
    pub fn full_name(&self) -> String {
        let path = Path::new(&self.name);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name);
        let hash = self
            .rev_hash
            .clone()
            .unwrap_or_else(|| self.unit_hash());
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{UNIT_PREFIX}{stem}-{hash}.{ext}"),
            None => format!("{UNIT_PREFIX}{stem}-{hash}"),
        }
    }
}

/// Synthesize a unit that runs a docker image.
///
/// Returns a plain [`ServiceUnit`]; the generated unit file is the only
/// specialization.
pub fn docker_service_unit(
    name: &str,
    image: &str,
    ports: &BTreeMap<u16, u16>,
    environment: BTreeMap<String, String>,
    logdriver: Option<&str>,
) -> ServiceUnit {
    let mut ports_flag = String::new();
    for (host, container) in ports {
        ports_flag.push_str(&format!(" -p {host}:{container}"));
    }

    let mut environment_flag = String::new();
    if !environment.is_empty() {
        environment_flag.push_str(" --env-file /etc/flotilla/%n");
    }
    if let Some(driver) = logdriver {
        environment_flag.push_str(&format!(" --log-driver={driver}"));
    }

    let unit_file = format!(
        r#"[Unit]
Description={name}

[Service]
User=core
TimeoutStartSec=0
Restart=always
StartLimitInterval=0
ExecStartPre=-/usr/bin/docker pull {image}
ExecStartPre=-/usr/bin/docker kill %n
ExecStartPre=-/usr/bin/docker rm %n
ExecStart=/bin/sh -c "/usr/bin/docker run --rm{environment_flag} --name %n{ports_flag} {image} > /dev/null 2>&1"
ExecStop=/usr/bin/docker stop %n
"#
    );

    ServiceUnit::new(name, unit_file, environment)
}

/// Weighted collection of units deployed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRevision {
    /// Human label, e.g. a VCS tag
    pub label: String,

    /// Share of instance capacity. Zero is present but inactive, negative
    /// means quarantined by the doctor.
    pub weight: i64,

    /// Units in this revision
    pub units: Vec<ServiceUnit>,
}

impl ServiceRevision {
    /// Create a revision with the given label and weight.
    pub fn new(label: impl Into<String>, weight: i64, units: Vec<ServiceUnit>) -> Self {
        Self {
            label: label.into(),
            weight,
            units,
        }
    }

    /// Content hash: SHA-256 over the label and the sorted unit hashes.
    /// Unit list order does not matter.
    pub fn revision_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.label.as_bytes());
        let mut unit_hashes: Vec<String> = self.units.iter().map(|u| u.unit_hash()).collect();
        unit_hashes.sort();
        for unit_hash in unit_hashes {
            hasher.update(unit_hash.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Compute the global assignment shard key for an instance.
///
/// Every instance resolves its own id plus exactly one of the 16 well-known
/// `GLOBAL_n` rows, chosen by hashing the instance id. The shard uses the
/// first 8 bytes of SHA-256 so it is stable across processes.
pub fn global_shard_key(instance_id: &str) -> String {
    let digest = Sha256::digest(instance_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let shard = u64::from_be_bytes(prefix) % GLOBAL_ASSIGNMENT_SHARDS;
    format!("{GLOBAL_ASSIGNMENT}_{shard}")
}

/// Check whether a service-record column key names a revision weight.
pub fn is_rev_hash(key: &str) -> bool {
    key.len() == REV_HASH_LEN && key.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_unit_hash_is_stable() {
        let unit = ServiceUnit::new("app.service", "[Service]\n", env(&[("A", "1"), ("B", "2")]));
        let same = ServiceUnit::new("app.service", "[Service]\n", env(&[("B", "2"), ("A", "1")]));
        assert_eq!(unit.unit_hash(), same.unit_hash());
        assert_eq!(unit.unit_hash().len(), REV_HASH_LEN);
    }

    #[test]
    fn test_unit_hash_changes_with_content() {
        let unit = ServiceUnit::new("app.service", "[Service]\n", env(&[]));
        let other_file = ServiceUnit::new("app.service", "[Service]\nRestart=always\n", env(&[]));
        let other_env = ServiceUnit::new("app.service", "[Service]\n", env(&[("A", "1")]));
        assert_ne!(unit.unit_hash(), other_file.unit_hash());
        assert_ne!(unit.unit_hash(), other_env.unit_hash());
    }

    #[test]
    fn test_full_name_uses_unit_hash() {
        let unit = ServiceUnit::new("app.service", "[Service]\n", env(&[]));
        let unit_hash = unit.unit_hash();
        assert_eq!(
            unit.full_name(),
            format!("flotilla-app-{unit_hash}.service")
        );
    }

    #[test]
    fn test_full_name_prefers_rev_hash() {
        let rev_hash = "a".repeat(REV_HASH_LEN);
        let unit =
            ServiceUnit::new("app.service", "[Service]\n", env(&[])).with_rev_hash(&rev_hash);
        assert_eq!(
            unit.full_name(),
            format!("flotilla-app-{rev_hash}.service")
        );
    }

    #[test]
    fn test_revision_hash_ignores_unit_order() {
        let a = ServiceUnit::new("a.service", "[Service]\n", env(&[]));
        let b = ServiceUnit::new("b.service", "[Service]\n", env(&[]));
        let fwd = ServiceRevision::new("v1", 1, vec![a.clone(), b.clone()]);
        let rev = ServiceRevision::new("v1", 1, vec![b, a]);
        assert_eq!(fwd.revision_hash(), rev.revision_hash());
    }

    #[test]
    fn test_revision_hash_depends_on_label() {
        let unit = ServiceUnit::new("a.service", "[Service]\n", env(&[]));
        let v1 = ServiceRevision::new("v1", 1, vec![unit.clone()]);
        let v2 = ServiceRevision::new("v2", 1, vec![unit]);
        assert_ne!(v1.revision_hash(), v2.revision_hash());
    }

    #[test]
    fn test_docker_service_unit() {
        let mut ports = BTreeMap::new();
        ports.insert(80, 8080);
        let unit = docker_service_unit(
            "web.service",
            "example/web:latest",
            &ports,
            env(&[("TOKEN", "secret")]),
            Some("journald"),
        );
        assert!(unit.unit_file.contains("docker pull example/web:latest"));
        assert!(unit.unit_file.contains("-p 80:8080"));
        assert!(unit.unit_file.contains("--env-file /etc/flotilla/%n"));
        assert!(unit.unit_file.contains("--log-driver=journald"));
        assert_eq!(unit.environment.get("TOKEN").unwrap(), "secret");
    }

    #[test]
    fn test_docker_service_unit_no_env() {
        let unit = docker_service_unit("web.service", "example/web", &BTreeMap::new(), env(&[]), None);
        assert!(!unit.unit_file.contains("--env-file"));
        assert!(!unit.unit_file.contains("--log-driver"));
    }

    #[test]
    fn test_global_shard_key_is_deterministic() {
        let key = global_shard_key("i-123456");
        assert_eq!(key, global_shard_key("i-123456"));
        assert!(key.starts_with("GLOBAL_"));
        let shard: u64 = key.trim_start_matches("GLOBAL_").parse().unwrap();
        assert!(shard < GLOBAL_ASSIGNMENT_SHARDS);
    }

    #[test]
    fn test_is_rev_hash() {
        assert!(is_rev_hash(&"0".repeat(64)));
        assert!(is_rev_hash(
            &ServiceUnit::new("a", "b", env(&[])).unit_hash()
        ));
        assert!(!is_rev_hash("dns_name"));
        assert!(!is_rev_hash(&"z".repeat(64)));
        assert!(!is_rev_hash(&"0".repeat(63)));
    }
}
