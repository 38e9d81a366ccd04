//! Daemon configuration

use anyhow::{Context, Result};
use idle_lib::{InstanceInfo, ManagerConfig};
use serde::Deserialize;
use std::path::PathBuf;

/// Default location of the optional configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/idled/idled.toml";

/// Instance entry from the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

impl From<InstanceConfig> for InstanceInfo {
    fn from(config: InstanceConfig) -> Self {
        InstanceInfo {
            instance_name: config.name.unwrap_or_else(|| config.id.clone()),
            instance_id: config.id,
            domain: config.domain,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Name reported in structured log events
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for the control API and health/metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between polling cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum concurrent metric samples per cycle
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Directory for policies, idle state and history
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory of per-instance metric snapshots
    #[serde(default = "default_metrics_spool_dir")]
    pub metrics_spool_dir: PathBuf,

    /// Base URL of the cloud control plane
    #[serde(default = "default_control_plane_url")]
    pub control_plane_url: String,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    #[serde(default)]
    pub manager: ManagerConfig,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    60
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/idled")
}

fn default_metrics_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/idled/metrics")
}

fn default_control_plane_url() -> String {
    "http://localhost:9400".to_string()
}

impl DaemonConfig {
    /// Load from the optional file named by `IDLED_CONFIG` (or the default
    /// path) layered with `IDLED_`-prefixed environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var("IDLED_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("IDLED")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: DaemonConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.poll_interval_secs > 0, "poll_interval_secs must be positive");
        anyhow::ensure!(self.worker_pool_size > 0, "worker_pool_size must be positive");
        anyhow::ensure!(
            self.manager.max_actions_per_sweep > 0,
            "manager.max_actions_per_sweep must be positive"
        );
        anyhow::ensure!(
            self.manager.action_timeout_secs > 0,
            "manager.action_timeout_secs must be positive"
        );
        url::Url::parse(&self.control_plane_url)
            .with_context(|| format!("Invalid control_plane_url '{}'", self.control_plane_url))?;
        Ok(())
    }

    pub fn policy_path(&self) -> PathBuf {
        self.state_dir.join("policies.json")
    }

    pub fn instance_state_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("history.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idled.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_name = "lab-7"
poll_interval_secs = 30
state_dir = "/tmp/idled"

[manager]
dry_run = true
max_actions_per_sweep = 4

[[instances]]
id = "i-0a1"
name = "alphafold"
domain = "machine-learning"

[[instances]]
id = "i-0b2"
"#
        )
        .unwrap();

        let config = DaemonConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.node_name, "lab-7");
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.api_port, 8080);
        assert!(config.manager.dry_run);
        assert_eq!(config.manager.max_actions_per_sweep, 4);
        assert_eq!(config.manager.action_timeout_secs, 30);
        assert_eq!(config.history_path(), PathBuf::from("/tmp/idled/history.jsonl"));

        let infos: Vec<InstanceInfo> = config.instances.into_iter().map(Into::into).collect();
        assert_eq!(infos[0].domain.as_deref(), Some("machine-learning"));
        assert_eq!(infos[1].instance_name, "i-0b2");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = DaemonConfig::load_from("/nonexistent/idled").unwrap();
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.worker_pool_size, 8);
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "poll_interval_secs = 0\n").unwrap();

        assert!(DaemonConfig::load_from(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_rejects_zero_action_limits() {
        let dir = TempDir::new().unwrap();

        let path = dir.path().join("no-actions.toml");
        std::fs::write(&path, "[manager]\nmax_actions_per_sweep = 0\n").unwrap();
        let err = DaemonConfig::load_from(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("max_actions_per_sweep"));

        let path = dir.path().join("no-timeout.toml");
        std::fs::write(&path, "[manager]\naction_timeout_secs = 0\n").unwrap();
        let err = DaemonConfig::load_from(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("action_timeout_secs"));
    }
}
