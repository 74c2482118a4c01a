//! Configuration management for the flotilla control plane.
//!
//! Daemons configure themselves from `FLOTILLA_*` environment variables,
//! optionally overridden by a TOML file. Missing configuration falls back
//! to defaults; genuinely unusable configuration (an agent without a
//! service name) fails validation at startup, which is the only fatal
//! error class.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment name; prefixes every table and queue name
    pub environment: Option<String>,

    /// Service this process belongs to (agents only)
    pub service: Option<String>,

    /// Regions this process operates in
    pub regions: Vec<String>,

    /// Load balancer name for this instance (agents only)
    pub balancer: Option<String>,

    /// DNS domain for provisioned services
    pub domain: Option<String>,

    /// Store configuration
    pub store: StoreConfig,

    /// Messaging configuration
    pub messaging: MessagingConfig,

    /// Agent configuration
    pub agent: AgentConfig,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// Messaging backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Redis URL (e.g. redis://localhost:6379)
    pub redis_url: String,
}

/// Agent-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Frequency of health writes (seconds)
    pub health_interval_secs: u64,

    /// Frequency of assignment reads (seconds)
    pub assignment_interval_secs: u64,

    /// Directory for unit files
    pub unit_dir: PathBuf,

    /// Directory for environment files
    pub env_dir: PathBuf,

    /// Refuse units and revisions whose stored hash does not match their
    /// content
    pub strict_content: bool,
}

/// Scheduler-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frequency of lock checks (seconds); leadership TTL is three times
    /// this
    pub lock_interval_secs: u64,

    /// Frequency of the balance loop (seconds)
    pub loop_interval_secs: u64,

    /// Frequency of the provision loop (seconds)
    pub provision_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.environment = env_string("FLOTILLA_ENV");
        config.service = env_string("FLOTILLA_SERVICE");
        config.balancer = env_string("FLOTILLA_LB");
        config.domain = env_string("FLOTILLA_DOMAIN");
        if let Some(regions) = env_string("FLOTILLA_REGION") {
            config.regions = regions
                .split(',')
                .map(str::trim)
                .filter(|region| !region.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(path) = env_string("FLOTILLA_SQLITE_PATH") {
            config.store.sqlite_path = path.into();
        }
        if let Some(url) = env_string("FLOTILLA_REDIS_URL").or_else(|| env_string("REDIS_URL")) {
            config.messaging.redis_url = url;
        }

        config.agent.health_interval_secs =
            env_u64("FLOTILLA_HEALTH_INTERVAL", config.agent.health_interval_secs);
        config.agent.assignment_interval_secs = env_u64(
            "FLOTILLA_ASSIGNMENT_INTERVAL",
            config.agent.assignment_interval_secs,
        );
        if let Some(dir) = env_string("FLOTILLA_UNIT_DIR") {
            config.agent.unit_dir = dir.into();
        }
        if let Some(dir) = env_string("FLOTILLA_ENV_DIR") {
            config.agent.env_dir = dir.into();
        }
        config.agent.strict_content = std::env::var("FLOTILLA_STRICT_CONTENT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(config.agent.strict_content);

        config.scheduler.lock_interval_secs =
            env_u64("FLOTILLA_LOCK_INTERVAL", config.scheduler.lock_interval_secs);
        config.scheduler.loop_interval_secs =
            env_u64("FLOTILLA_LOOP_INTERVAL", config.scheduler.loop_interval_secs);
        config.scheduler.provision_interval_secs = env_u64(
            "FLOTILLA_PROVISION_INTERVAL",
            config.scheduler.provision_interval_secs,
        );

        if let Some(level) = env_string("FLOTILLA_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = env_string("FLOTILLA_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.agent.health_interval_secs == 0 {
            anyhow::bail!("health_interval_secs must be greater than 0");
        }
        if self.agent.assignment_interval_secs == 0 {
            anyhow::bail!("assignment_interval_secs must be greater than 0");
        }
        if self.scheduler.lock_interval_secs == 0 {
            anyhow::bail!("lock_interval_secs must be greater than 0");
        }
        Ok(())
    }

    /// The agent requires a service identity.
    pub fn validate_agent(&self) -> Result<()> {
        self.validate()?;
        if self.service.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("FLOTILLA_SERVICE is required to run an agent");
        }
        Ok(())
    }

    /// The scheduler requires at least one region.
    pub fn validate_scheduler(&self) -> Result<()> {
        self.validate()?;
        if self.regions.is_empty() {
            anyhow::bail!("FLOTILLA_REGION is required to run a scheduler");
        }
        Ok(())
    }

    /// Leadership lease: three lock intervals.
    #[must_use]
    pub fn scheduler_lock_ttl(&self) -> f64 {
        (self.scheduler.lock_interval_secs * 3) as f64
    }

    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.agent.health_interval_secs)
    }

    #[must_use]
    pub fn assignment_interval(&self) -> Duration {
        Duration::from_secs(self.agent.assignment_interval_secs)
    }

    #[must_use]
    pub fn lock_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.lock_interval_secs)
    }

    #[must_use]
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.loop_interval_secs)
    }

    #[must_use]
    pub fn provision_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.provision_interval_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: None,
            service: None,
            regions: Vec::new(),
            balancer: None,
            domain: None,
            store: StoreConfig::default(),
            messaging: MessagingConfig::default(),
            agent: AgentConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/flotilla.db"),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            redis_url: String::from("redis://localhost:6379"),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 5,
            assignment_interval_secs: 15,
            unit_dir: PathBuf::from(crate::agent::units::DEFAULT_UNIT_DIR),
            env_dir: PathBuf::from(crate::agent::units::DEFAULT_ENV_DIR),
            strict_content: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_interval_secs: 15,
            loop_interval_secs: 15,
            provision_interval_secs: 15,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_agent_requires_service() {
        let mut config = Config::default();
        assert!(config.validate_agent().is_err());
        config.service = Some("testapp".into());
        assert!(config.validate_agent().is_ok());
    }

    #[test]
    fn test_scheduler_requires_region() {
        let mut config = Config::default();
        assert!(config.validate_scheduler().is_err());
        config.regions = vec!["us-east-1".into()];
        assert!(config.validate_scheduler().is_ok());
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let mut config = Config::default();
        config.scheduler.lock_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_ttl_is_three_intervals() {
        let config = Config::default();
        assert_eq!(config.scheduler_lock_ttl(), 45.0);
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            environment = "prod"
            regions = ["us-east-1", "us-west-2"]

            [agent]
            health_interval_secs = 7

            [logging]
            format = "json"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.environment.as_deref(), Some("prod"));
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.agent.health_interval_secs, 7);
        assert_eq!(config.logging.format, "json");
        // Unset sections keep defaults.
        assert_eq!(config.scheduler.loop_interval_secs, 15);
    }
}
