//! Local unit convergence.
//!
//! The agent owns every unit whose name starts with `flotilla-` under the
//! configured unit and env directories. [`UnitFiles::set_units`] drives the
//! whole local transition: stop and delete anything not in the desired
//! set, write missing unit and env files (existing files are never
//! overwritten; the content hash in the name makes them immutable), reload
//! the daemon and start whatever is not already running.
//!
//! The unit-manager daemon itself is external; [`UnitManager`] is its
//! control and introspection surface, with a `systemctl`-backed
//! implementation for real hosts and an in-memory one for tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{ServiceUnit, UNIT_PREFIX};
use crate::store::records::UnitStatus;

/// Dependency keys rewritten to deployed names within a revision.
const UNIT_DEPS: [&str; 5] = ["Before", "After", "BindsTo", "Wants", "Requires"];

/// Default directory for unit files.
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Default directory for environment files.
pub const DEFAULT_ENV_DIR: &str = "/etc/flotilla";

/// Result type for deploy operations
pub type DeployResult<T> = Result<T, DeployError>;

/// Local deployment errors
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unit manager error: {0}")]
    Manager(String),

    #[error("unit file error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// State of one loaded unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitState {
    pub name: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub active_enter_time: f64,
    pub active_exit_time: f64,
}

impl UnitState {
    /// Whether a start is needed.
    pub fn needs_start(&self) -> bool {
        self.active_state != "active" && self.active_state != "activating"
    }
}

/// Control and introspection surface of the unit-manager daemon.
#[async_trait]
pub trait UnitManager: Send + Sync {
    /// Every loaded unit.
    async fn list_units(&self) -> DeployResult<Vec<UnitState>>;

    /// State of one unit, `None` when not loaded.
    async fn unit_state(&self, name: &str) -> DeployResult<Option<UnitState>>;

    /// Reload unit definitions from disk.
    async fn reload(&self) -> DeployResult<()>;

    /// Start a unit, replacing any queued job.
    async fn start(&self, name: &str) -> DeployResult<()>;

    /// Stop a unit, replacing any queued job.
    async fn stop(&self, name: &str) -> DeployResult<()>;
}

/// File-level convergence over a [`UnitManager`].
pub struct UnitFiles {
    manager: std::sync::Arc<dyn UnitManager>,
    unit_dir: PathBuf,
    env_dir: PathBuf,
}

impl UnitFiles {
    pub fn new(manager: std::sync::Arc<dyn UnitManager>) -> Self {
        Self {
            manager,
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            env_dir: PathBuf::from(DEFAULT_ENV_DIR),
        }
    }

    pub fn with_dirs(mut self, unit_dir: impl Into<PathBuf>, env_dir: impl Into<PathBuf>) -> Self {
        self.unit_dir = unit_dir.into();
        self.env_dir = env_dir.into();
        self
    }

    /// Loaded units owned by the agent.
    pub async fn flotilla_units(&self) -> DeployResult<Vec<UnitState>> {
        let units: Vec<UnitState> = self
            .manager
            .list_units()
            .await?
            .into_iter()
            .filter(|unit| unit.name.starts_with(UNIT_PREFIX))
            .collect();
        debug!(count = units.len(), "Found units");
        Ok(units)
    }

    /// Per-unit status map for the heartbeat row.
    pub async fn unit_status(&self) -> DeployResult<BTreeMap<String, UnitStatus>> {
        let mut statuses = BTreeMap::new();
        for unit in self.flotilla_units().await? {
            statuses.insert(
                unit.name.clone(),
                UnitStatus {
                    load_state: unit.load_state,
                    active_state: unit.active_state,
                    sub_state: unit.sub_state,
                    active_enter_time: unit.active_enter_time,
                    active_exit_time: unit.active_exit_time,
                },
            );
        }
        Ok(statuses)
    }

    /// Stop every owned unit.
    pub async fn stop_units(&self) -> DeployResult<()> {
        for unit in self.flotilla_units().await? {
            if let Err(e) = self.manager.stop(&unit.name).await {
                warn!(unit = %unit.name, error = %e, "Stop failed");
            }
        }
        Ok(())
    }

    /// Converge the local unit set to `units`.
    pub async fn set_units(&self, units: &[ServiceUnit]) -> DeployResult<()> {
        let desired: BTreeMap<String, &ServiceUnit> =
            units.iter().map(|unit| (unit.full_name(), unit)).collect();
        debug!(desired = ?desired.keys().collect::<Vec<_>>(), "Desired units");

        // Remove any units not in the current set:
        for existing in self.flotilla_units().await? {
            debug!(
                unit = %existing.name,
                active = %existing.active_state,
                sub = %existing.sub_state,
                "Existing unit"
            );
            if desired.contains_key(&existing.name) {
                continue;
            }
            debug!(unit = %existing.name, "Unit is unknown, stopping");
            if let Err(e) = self.manager.stop(&existing.name).await {
                warn!(unit = %existing.name, error = %e, "Stop failed");
            }
            remove_if_exists(&self.unit_dir.join(&existing.name)).await?;
            remove_if_exists(&self.env_dir.join(&existing.name)).await?;
        }

        // Ensure desired units are on disk:
        for (name, unit) in &desired {
            let unit_path = self.unit_dir.join(name);
            if !unit_path.exists() {
                let text = rewrite_dependencies(unit, units);
                debug!(path = %unit_path.display(), "Writing unit file");
                tokio::fs::write(&unit_path, text)
                    .await
                    .map_err(|e| DeployError::io(&unit_path, e))?;
            }

            if !unit.environment.is_empty() {
                let env_path = self.env_dir.join(name);
                if !env_path.exists() {
                    debug!(path = %env_path.display(), "Writing environment file");
                    let mut body = String::new();
                    for (key, value) in &unit.environment {
                        body.push_str(key);
                        body.push('=');
                        body.push_str(value);
                        body.push('\n');
                    }
                    tokio::fs::write(&env_path, body)
                        .await
                        .map_err(|e| DeployError::io(&env_path, e))?;
                }
            }
        }

        self.manager.reload().await?;

        // Start anything not already running:
        for name in desired.keys() {
            let state = self.manager.unit_state(name).await?.unwrap_or_default();
            if state.needs_start() {
                debug!(unit = %name, active = %state.active_state, "Starting unit");
                self.manager.start(name).await?;
            } else {
                debug!(unit = %name, sub = %state.sub_state, "Unit already started");
            }
        }
        Ok(())
    }
}

/// Rewrite dependency lines whose target is a short unit name from the
/// same revision to the deployed name.
fn rewrite_dependencies(unit: &ServiceUnit, all_units: &[ServiceUnit]) -> String {
    let siblings: BTreeMap<&str, &ServiceUnit> = all_units
        .iter()
        .filter(|candidate| candidate.rev_hash == unit.rev_hash)
        .map(|candidate| (candidate.name.as_str(), candidate))
        .collect();

    let mut lines: Vec<String> = Vec::new();
    for line in unit.unit_file.split('\n') {
        let mut parts = line.splitn(2, '=');
        let rewritten = match (parts.next(), parts.next()) {
            (Some(key), Some(value)) if UNIT_DEPS.contains(&key) => {
                match siblings.get(value) {
                    Some(sibling) => format!("{key}={}", sibling.full_name()),
                    None => line.to_string(),
                }
            }
            _ => line.to_string(),
        };
        lines.push(rewritten);
    }
    lines.join("\n")
}

async fn remove_if_exists(path: &Path) -> DeployResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DeployError::io(path, e)),
    }
}

/// Unit manager that shells out to `systemctl`.
pub struct SystemctlManager;

impl SystemctlManager {
    async fn run(args: &[&str]) -> DeployResult<String> {
        let output = tokio::process::Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| DeployError::Manager(e.to_string()))?;
        if !output.status.success() {
            return Err(DeployError::Manager(format!(
                "systemctl {} exited {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn show(name: &str) -> DeployResult<UnitState> {
        // --timestamp=unix needs systemd 247; older timestamps parse as 0.
        let output = Self::run(&[
            "show",
            "--timestamp=unix",
            "--property=Id,LoadState,ActiveState,SubState,ActiveEnterTimestamp,ActiveExitTimestamp",
            name,
        ])
        .await?;

        let mut state = UnitState::default();
        for line in output.lines() {
            let mut parts = line.splitn(2, '=');
            let (key, value) = match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => (key, value),
                _ => continue,
            };
            match key {
                "Id" => state.name = value.to_string(),
                "LoadState" => state.load_state = value.to_string(),
                "ActiveState" => state.active_state = value.to_string(),
                "SubState" => state.sub_state = value.to_string(),
                "ActiveEnterTimestamp" => state.active_enter_time = parse_unix_timestamp(value),
                "ActiveExitTimestamp" => state.active_exit_time = parse_unix_timestamp(value),
                _ => {}
            }
        }
        Ok(state)
    }
}

fn parse_unix_timestamp(value: &str) -> f64 {
    value
        .trim()
        .strip_prefix('@')
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[async_trait]
impl UnitManager for SystemctlManager {
    async fn list_units(&self) -> DeployResult<Vec<UnitState>> {
        let output = Self::run(&[
            "list-units",
            "--all",
            "--no-legend",
            "--plain",
            &format!("{UNIT_PREFIX}*"),
        ])
        .await?;

        let mut units = Vec::new();
        for line in output.lines() {
            if let Some(name) = line.split_whitespace().next() {
                units.push(Self::show(name).await?);
            }
        }
        Ok(units)
    }

    async fn unit_state(&self, name: &str) -> DeployResult<Option<UnitState>> {
        let state = Self::show(name).await?;
        if state.load_state == "not-found" || state.name.is_empty() {
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn reload(&self) -> DeployResult<()> {
        Self::run(&["daemon-reload"]).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> DeployResult<()> {
        Self::run(&["start", "--job-mode=replace", name]).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> DeployResult<()> {
        Self::run(&["stop", "--job-mode=replace", name]).await.map(|_| ())
    }
}

/// In-process unit manager for tests and demos. `start` marks a unit
/// running; state can be scripted through [`InMemoryUnitManager::insert`].
#[derive(Default)]
pub struct InMemoryUnitManager {
    units: Mutex<BTreeMap<String, UnitState>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    reloads: Mutex<usize>,
}

impl InMemoryUnitManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a unit's state.
    pub fn insert(&self, state: UnitState) {
        self.units
            .lock()
            .expect("unit state poisoned")
            .insert(state.name.clone(), state);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().expect("unit state poisoned").clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().expect("unit state poisoned").clone()
    }

    pub fn reloads(&self) -> usize {
        *self.reloads.lock().expect("unit state poisoned")
    }
}

#[async_trait]
impl UnitManager for InMemoryUnitManager {
    async fn list_units(&self) -> DeployResult<Vec<UnitState>> {
        Ok(self
            .units
            .lock()
            .expect("unit state poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn unit_state(&self, name: &str) -> DeployResult<Option<UnitState>> {
        Ok(self
            .units
            .lock()
            .expect("unit state poisoned")
            .get(name)
            .cloned())
    }

    async fn reload(&self) -> DeployResult<()> {
        *self.reloads.lock().expect("unit state poisoned") += 1;
        Ok(())
    }

    async fn start(&self, name: &str) -> DeployResult<()> {
        self.started
            .lock()
            .expect("unit state poisoned")
            .push(name.to_string());
        let mut units = self.units.lock().expect("unit state poisoned");
        let state = units.entry(name.to_string()).or_insert_with(|| UnitState {
            name: name.to_string(),
            ..Default::default()
        });
        state.load_state = "loaded".into();
        state.active_state = "active".into();
        state.sub_state = "running".into();
        Ok(())
    }

    async fn stop(&self, name: &str) -> DeployResult<()> {
        self.stopped
            .lock()
            .expect("unit state poisoned")
            .push(name.to_string());
        self.units.lock().expect("unit state poisoned").remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn unit_files(manager: &Arc<InMemoryUnitManager>, dir: &tempfile::TempDir) -> UnitFiles {
        let unit_dir = dir.path().join("units");
        let env_dir = dir.path().join("env");
        std::fs::create_dir_all(&unit_dir).unwrap();
        std::fs::create_dir_all(&env_dir).unwrap();
        UnitFiles::new(manager.clone()).with_dirs(unit_dir, env_dir)
    }

    #[tokio::test]
    async fn test_set_units_writes_and_starts() {
        let manager = Arc::new(InMemoryUnitManager::new());
        let dir = tempfile::tempdir().unwrap();
        let files = unit_files(&manager, &dir);

        let rev_hash = "a".repeat(64);
        let units = vec![
            ServiceUnit::new("a.service", "[Service]\nExecStart=/bin/a\n", env(&[]))
                .with_rev_hash(&rev_hash),
            ServiceUnit::new("b.service", "[Service]\nExecStart=/bin/b\n", env(&[]))
                .with_rev_hash(&rev_hash),
        ];
        files.set_units(&units).await.unwrap();

        // Files named flotilla-<base>-<rev>.service, one reload, both
        // started.
        for base in ["a", "b"] {
            let name = format!("flotilla-{base}-{rev_hash}.service");
            assert!(dir.path().join("units").join(&name).exists());
            assert!(manager.started().contains(&name));
        }
        assert_eq!(manager.reloads(), 1);
    }

    #[tokio::test]
    async fn test_set_units_writes_env_file() {
        let manager = Arc::new(InMemoryUnitManager::new());
        let dir = tempfile::tempdir().unwrap();
        let files = unit_files(&manager, &dir);

        let unit = ServiceUnit::new("a.service", "[Service]\n", env(&[("PORT", "80"), ("A", "1")]));
        let name = unit.full_name();
        files.set_units(&[unit]).await.unwrap();

        let body = std::fs::read_to_string(dir.path().join("env").join(&name)).unwrap();
        assert_eq!(body, "A=1\nPORT=80\n");
    }

    #[tokio::test]
    async fn test_set_units_never_overwrites() {
        let manager = Arc::new(InMemoryUnitManager::new());
        let dir = tempfile::tempdir().unwrap();
        let files = unit_files(&manager, &dir);

        let unit = ServiceUnit::new("a.service", "[Service]\n", env(&[]));
        let name = unit.full_name();
        let path = dir.path().join("units").join(&name);
        std::fs::write(&path, "preexisting").unwrap();

        files.set_units(&[unit]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "preexisting");
    }

    #[tokio::test]
    async fn test_set_units_removes_unknown_units() {
        let manager = Arc::new(InMemoryUnitManager::new());
        let dir = tempfile::tempdir().unwrap();
        let files = unit_files(&manager, &dir);

        let stale = "flotilla-old-abc.service";
        manager.insert(UnitState {
            name: stale.to_string(),
            active_state: "active".into(),
            sub_state: "running".into(),
            ..Default::default()
        });
        std::fs::write(dir.path().join("units").join(stale), "old").unwrap();
        std::fs::write(dir.path().join("env").join(stale), "OLD=1").unwrap();

        files.set_units(&[]).await.unwrap();

        assert!(manager.stopped().contains(&stale.to_string()));
        assert!(!dir.path().join("units").join(stale).exists());
        assert!(!dir.path().join("env").join(stale).exists());
    }

    #[tokio::test]
    async fn test_set_units_skips_already_active() {
        let manager = Arc::new(InMemoryUnitManager::new());
        let dir = tempfile::tempdir().unwrap();
        let files = unit_files(&manager, &dir);

        let unit = ServiceUnit::new("a.service", "[Service]\n", env(&[]));
        let name = unit.full_name();
        manager.insert(UnitState {
            name: name.clone(),
            active_state: "activating".into(),
            sub_state: "start".into(),
            ..Default::default()
        });

        files.set_units(&[unit]).await.unwrap();
        assert!(!manager.started().contains(&name));
    }

    #[tokio::test]
    async fn test_dependency_rewrite_within_revision() {
        let rev_hash = "a".repeat(64);
        let database =
            ServiceUnit::new("db.service", "[Service]\n", env(&[])).with_rev_hash(&rev_hash);
        let app = ServiceUnit::new(
            "app.service",
            "[Unit]\nAfter=db.service\nRequires=db.service\nWants=ntpd.service\n",
            env(&[]),
        )
        .with_rev_hash(&rev_hash);

        let all = vec![database.clone(), app.clone()];
        let rewritten = rewrite_dependencies(&app, &all);
        assert!(rewritten.contains(&format!("After={}", database.full_name())));
        assert!(rewritten.contains(&format!("Requires={}", database.full_name())));
        // Units outside the revision are untouched.
        assert!(rewritten.contains("Wants=ntpd.service"));
    }

    #[tokio::test]
    async fn test_dependency_rewrite_ignores_other_revision() {
        let database = ServiceUnit::new("db.service", "[Service]\n", env(&[]))
            .with_rev_hash("a".repeat(64));
        let app = ServiceUnit::new("app.service", "[Unit]\nAfter=db.service\n", env(&[]))
            .with_rev_hash("b".repeat(64));

        let all = vec![database, app.clone()];
        let rewritten = rewrite_dependencies(&app, &all);
        assert!(rewritten.contains("After=db.service"));
    }

    #[tokio::test]
    async fn test_unit_status_filters_prefix() {
        let manager = Arc::new(InMemoryUnitManager::new());
        manager.insert(UnitState {
            name: "flotilla-a-x.service".into(),
            load_state: "loaded".into(),
            active_state: "active".into(),
            sub_state: "running".into(),
            ..Default::default()
        });
        manager.insert(UnitState {
            name: "sshd.service".into(),
            active_state: "active".into(),
            ..Default::default()
        });

        let dir = tempfile::tempdir().unwrap();
        let files = unit_files(&manager, &dir);
        let status = files.unit_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(status.contains_key("flotilla-a-x.service"));
    }

    #[test]
    fn test_parse_unix_timestamp() {
        assert_eq!(parse_unix_timestamp("@1700000000"), 1_700_000_000.0);
        assert_eq!(parse_unix_timestamp("Thu 2024-01-04 12:00:00 UTC"), 0.0);
        assert_eq!(parse_unix_timestamp(""), 0.0);
    }
}
