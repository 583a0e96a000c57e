//! Intent distribution engine
//!
//! Turns a strategy into per-pod intents, persists them, and delivers them
//! to the agent serving each pod's node.

mod engine;
pub mod repository;
pub mod transport;


pub use engine::{
    DistributionReport, DistributorConfig, IntentDistributor, DEFAULT_AGENT_LABEL_KEY,
    DEFAULT_AGENT_LABEL_VALUE,
};
pub use repository::{IntentFilter, MemoryRepository, Repository, RepositoryError, StrategyFilter};
pub use transport::{
    AgentTransport, HttpAgentTransport, HttpTransportConfig, TransportError, INTENTS_PATH,
};

use crate::directory::DirectoryError;
use thiserror::Error;

/// Error classes callers map to responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any side effect
    Validation,
    /// Selectors matched no live pod
    NotFound,
    /// Cluster API, persistence or transport failure
    Dependency,
}

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("invalid operator identity {0:?}")]
    InvalidOperator(String),

    #[error("no pods match the strategy criteria")]
    NoMatchingPods,

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("persist strategy: {0}")]
    Persist(#[source] RepositoryError),

    #[error("query repository: {0}")]
    Query(#[source] RepositoryError),

    #[error("deliver intents to agent {agent}: {source}")]
    Delivery {
        agent: String,
        #[source]
        source: TransportError,
    },

    #[error("record intents sent to agent {agent}: {source}")]
    StateUpdate {
        agent: String,
        #[source]
        source: RepositoryError,
    },
}

impl DistributionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DistributionError::InvalidOperator(_) => ErrorKind::Validation,
            DistributionError::Directory(
                DirectoryError::InvalidCommandRegex { .. } | DirectoryError::InvalidSelector { .. },
            ) => ErrorKind::Validation,
            DistributionError::NoMatchingPods => ErrorKind::NotFound,
            _ => ErrorKind::Dependency,
        }
    }
}
