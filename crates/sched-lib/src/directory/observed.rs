//! Cache record for an observed cluster pod

use crate::models::{AgentPod, AgentState, Container, Pod};
use regex::Regex;
use std::collections::BTreeMap;

/// Container spec plus the runtime ID reported in the pod status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedContainer {
    pub name: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub ports: Vec<u16>,
    pub container_id: Option<String>,
}

impl ObservedContainer {
    /// Command followed by args
    pub fn argv(&self) -> Vec<String> {
        self.command.iter().chain(self.args.iter()).cloned().collect()
    }
}

/// Pod as stored in the directory cache. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedPod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub node_name: String,
    pub phase: Option<String>,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    pub containers: Vec<ObservedContainer>,
}

impl ObservedPod {
    /// Project into a workload pod.
    ///
    /// With a command regex only matching containers are kept, and a pod
    /// without any matching container yields `None`.
    pub fn to_pod(&self, command_regex: Option<&Regex>) -> Option<Pod> {
        let containers: Vec<Container> = self
            .containers
            .iter()
            .filter_map(|c| {
                let argv = c.argv();
                if let Some(re) = command_regex {
                    if !re.is_match(&argv.join(" ")) {
                        return None;
                    }
                }
                Some(Container {
                    container_id: c.container_id.clone().unwrap_or_default(),
                    name: c.name.clone(),
                    command: argv,
                })
            })
            .collect();

        if command_regex.is_some() && containers.is_empty() {
            return None;
        }

        Some(Pod {
            namespace: self.namespace.clone(),
            labels: self.labels.clone(),
            pod_id: self.uid.clone(),
            node_id: self.node_name.clone(),
            containers,
        })
    }

    /// Project into an agent endpoint
    pub fn to_agent_pod(&self) -> AgentPod {
        let host = self
            .pod_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.host_ip.as_deref())
            .unwrap_or_default()
            .to_string();

        AgentPod {
            node_id: self.node_name.clone(),
            host,
            port: self.first_port(),
            state: AgentState::from_phase(self.phase.as_deref()),
        }
    }

    /// First declared port of the first container declaring one, else 0
    pub fn first_port(&self) -> u16 {
        self.containers
            .iter()
            .find_map(|c| c.ports.first().copied())
            .unwrap_or(0)
    }
}
