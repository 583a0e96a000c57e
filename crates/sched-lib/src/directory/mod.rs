//! Cluster pod directory
//!
//! A cached, concurrency-safe view of workload placement. The cache is fed
//! by a pod watch subscription; until the first full listing arrives every
//! query falls through to a live listing against the cluster API.

mod cache;
mod kube_client;
mod observed;
mod selector;

#[cfg(test)]
mod tests;

pub use kube_client::{KubeClientOptions, KubeClusterClient};
pub use cache::ClusterPodDirectory;
pub use observed::{ObservedContainer, ObservedPod};
pub use selector::LabelQuery;

use crate::models::{AgentPod, LabelSelector, Pod};
use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors surfaced by directory queries
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("compile command regex {pattern:?}: {source}")]
    InvalidCommandRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid label selector {key:?}={value:?}: {reason}")]
    InvalidSelector {
        key: String,
        value: String,
        reason: &'static str,
    },

    #[error("no usable kubernetes client: {0}")]
    NoClient(String),

    #[error("list pods in namespace {namespace}: {source}")]
    List {
        namespace: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Selection of workload pods
#[derive(Debug, Clone, Default)]
pub struct QueryPodsOptions {
    /// Empty means all namespaces
    pub namespaces: Vec<String>,
    pub label_selectors: Vec<LabelSelector>,
    /// Matched against each container's joined command and args
    pub command_regex: Option<String>,
}

/// Selection of scheduling agent pods
#[derive(Debug, Clone, Default)]
pub struct QueryAgentPodsOptions {
    /// Empty means all namespaces
    pub namespaces: Vec<String>,
    pub agent_label: LabelSelector,
    /// Keep only agents on these nodes; empty keeps all
    pub node_ids: Vec<String>,
}

/// Pod and agent lookup used by the distribution engine
#[async_trait]
pub trait PodDirectory: Send + Sync {
    async fn query_pods(&self, opts: &QueryPodsOptions) -> Result<Vec<Pod>, DirectoryError>;

    async fn query_agent_pods(
        &self,
        opts: &QueryAgentPodsOptions,
    ) -> Result<Vec<AgentPod>, DirectoryError>;
}

/// Cache mutation delivered by a watch subscription
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(ObservedPod),
    Updated(ObservedPod),
    Deleted { uid: String },
    /// Full listing; replaces the cache and marks it synced
    Relisted(Vec<ObservedPod>),
}

/// Cluster API capability consumed by [`ClusterPodDirectory`]
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// List pods in one namespace (`None` lists every namespace)
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        query: &LabelQuery,
    ) -> anyhow::Result<Vec<ObservedPod>>;

    /// Push pod events into `events` until `shutdown` flips to true
    async fn watch_pods(&self, events: mpsc::Sender<PodEvent>, shutdown: watch::Receiver<bool>);
}

/// Empty or missing pattern means "no command filter"
pub(crate) fn compile_command_regex(
    pattern: Option<&str>,
) -> Result<Option<Regex>, DirectoryError> {
    match pattern {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|source| DirectoryError::InvalidCommandRegex {
                pattern: p.to_string(),
                source,
            }),
    }
}
