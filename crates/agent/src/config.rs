//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for the intake, health and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Process table root
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Substring marking orchestrator-managed cgroup lines
    #[serde(default = "default_cgroup_marker")]
    pub cgroup_marker: String,

    /// Process scan interval in seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8082
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_cgroup_marker() -> String {
    sched_lib::resolver::DEFAULT_CGROUP_MARKER.to_string()
}

fn default_scan_interval() -> u64 {
    30
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()
            .context("Failed to read agent configuration")?;

        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_config(config::Config::default()).unwrap();
        assert_eq!(config.api_port, 8082);
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert_eq!(config.cgroup_marker, "kubepods");
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let source = config::Config::builder()
            .set_override("api_port", 9100)
            .unwrap()
            .set_override("proc_root", "/host/proc")
            .unwrap()
            .set_override("scan_interval_secs", 0)
            .unwrap()
            .build()
            .unwrap();

        let config = AgentConfig::from_config(source).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.proc_root, PathBuf::from("/host/proc"));
        assert_eq!(config.scan_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let source = config::Config::builder()
            .set_override("api_port", "not-a-port")
            .unwrap()
            .build()
            .unwrap();

        assert!(AgentConfig::from_config(source).is_err());
    }
}
