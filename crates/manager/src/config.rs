//! Manager configuration

use anyhow::{Context, Result};
use sched_lib::directory::KubeClientOptions;
use sched_lib::distribution::{
    DistributorConfig, HttpTransportConfig, DEFAULT_AGENT_LABEL_KEY, DEFAULT_AGENT_LABEL_VALUE,
};
use sched_lib::models::LabelSelector;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "MANAGER_CONFIG_FILE";

/// Manager configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Port for the strategy, health and metrics API
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Use the pod's service account instead of a kubeconfig
    #[serde(default = "default_in_cluster")]
    pub in_cluster: bool,

    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,

    #[serde(default = "default_agent_label_key")]
    pub agent_label_key: String,

    #[serde(default = "default_agent_label_value")]
    pub agent_label_value: String,

    /// Namespaces searched for agent pods; empty searches all
    #[serde(default, deserialize_with = "comma_list")]
    pub agent_namespaces: Vec<String>,

    /// Agent port used when an agent pod declares none
    #[serde(default = "default_agent_port")]
    pub agent_default_port: u16,

    #[serde(default = "default_agent_request_timeout")]
    pub agent_request_timeout_secs: u64,

    /// How long startup waits for the pod cache before serving unsynced
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_in_cluster() -> bool {
    true
}

fn default_agent_label_key() -> String {
    DEFAULT_AGENT_LABEL_KEY.to_string()
}

fn default_agent_label_value() -> String {
    DEFAULT_AGENT_LABEL_VALUE.to_string()
}

fn default_agent_port() -> u16 {
    8082
}

fn default_agent_request_timeout() -> u64 {
    10
}

fn default_sync_timeout() -> u64 {
    30
}

/// Accept either a list or a comma-separated string
fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

impl ManagerConfig {
    /// Load configuration from the optional file, then `MANAGER_*`
    /// environment variables
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("MANAGER").try_parsing(true))
            .build()
            .context("Failed to read manager configuration")?;

        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("Invalid manager configuration")
    }

    pub fn kube_options(&self) -> KubeClientOptions {
        KubeClientOptions {
            in_cluster: self.in_cluster,
            kubeconfig_path: self.kubeconfig_path.clone(),
            ..Default::default()
        }
    }

    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            agent_label: LabelSelector::equals(&self.agent_label_key, &self.agent_label_value),
            agent_namespaces: self.agent_namespaces.clone(),
        }
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            request_timeout: Duration::from_secs(self.agent_request_timeout_secs),
            default_port: self.agent_default_port,
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}
