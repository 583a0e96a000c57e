//! Core data models for the scheduling control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Label requirement: empty `value` means "key exists"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct LabelSelector {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl LabelSelector {
    /// Match pods that carry `key` with any value
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
        }
    }

    /// Match pods whose `key` label equals `value`
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match labels.get(&self.key) {
            Some(actual) => self.value.is_empty() || *actual == self.value,
            None => false,
        }
    }
}

/// A container as seen through a matched pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub container_id: String,
    pub name: String,
    /// Command followed by args
    pub command: Vec<String>,
}

/// Point-in-time snapshot of a workload pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub pod_id: String,
    pub node_id: String,
    pub containers: Vec<Container>,
}

/// Liveness of a scheduling agent, derived from its pod phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Online,
    Offline,
    Unknown,
}

impl AgentState {
    /// Map a Kubernetes pod phase
    pub fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => AgentState::Online,
            Some("Pending") => AgentState::Unknown,
            _ => AgentState::Offline,
        }
    }

    /// Lower is preferred when several agents serve one node
    pub(crate) fn preference(&self) -> u8 {
        match self {
            AgentState::Online => 0,
            AgentState::Unknown => 1,
            AgentState::Offline => 2,
        }
    }
}

/// Network endpoint of the per-node scheduling agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPod {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub state: AgentState,
}

impl AgentPod {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for AgentPod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}){}:{}", self.node_id, self.host, self.port)
    }
}

/// Creation request for a scheduling strategy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStrategy {
    #[serde(default)]
    pub strategy_namespace: String,
    #[serde(default, rename = "k8sNamespace")]
    pub namespace_scope: Vec<String>,
    #[serde(default)]
    pub label_selectors: Vec<LabelSelector>,
    #[serde(default)]
    pub command_regex: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub execution_time: i64,
}

/// A stored scheduling strategy. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub strategy_namespace: String,
    #[serde(rename = "k8sNamespace")]
    pub namespace_scope: Vec<String>,
    pub label_selectors: Vec<LabelSelector>,
    pub command_regex: String,
    pub priority: i32,
    pub execution_time: i64,
}

impl Strategy {
    /// Stamp a request with identity and creation metadata
    pub fn create(creator_id: Uuid, request: NewStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            creator_id,
            created_at: Utc::now(),
            strategy_namespace: request.strategy_namespace,
            namespace_scope: request.namespace_scope,
            label_selectors: request.label_selectors,
            command_regex: request.command_regex,
            priority: request.priority,
            execution_time: request.execution_time,
        }
    }
}

/// Delivery state of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentState {
    Created,
    Sent,
}

impl IntentState {
    /// `Sent` is terminal
    pub fn can_transition_to(&self, next: IntentState) -> bool {
        !matches!((self, next), (IntentState::Sent, IntentState::Created))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Created => "created",
            IntentState::Sent => "sent",
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(IntentState::Created),
            "sent" => Ok(IntentState::Sent),
            other => Err(format!("unknown intent state: {}", other)),
        }
    }
}

/// One per-pod instruction materialized from a strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub id: Uuid,
    pub strategy_id: Uuid,
    #[serde(rename = "podID")]
    pub pod_id: String,
    #[serde(rename = "nodeID")]
    pub node_id: String,
    #[serde(rename = "k8sNamespace")]
    pub namespace: String,
    pub command_regex: String,
    pub priority: i32,
    pub execution_time: i64,
    pub pod_labels: BTreeMap<String, String>,
    pub state: IntentState,
}

impl Intent {
    pub fn for_pod(strategy: &Strategy, pod: &Pod) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy.id,
            pod_id: pod.pod_id.clone(),
            node_id: pod.node_id.clone(),
            namespace: pod.namespace.clone(),
            command_regex: strategy.command_regex.clone(),
            priority: strategy.priority,
            execution_time: strategy.execution_time,
            pod_labels: pod.labels.clone(),
            state: IntentState::Created,
        }
    }

    pub fn to_payload(&self) -> IntentPayload {
        IntentPayload {
            pod_id: self.pod_id.clone(),
            node_id: self.node_id.clone(),
            namespace: self.namespace.clone(),
            command_regex: self.command_regex.clone(),
            priority: self.priority,
            execution_time: self.execution_time,
            pod_labels: self.pod_labels.clone(),
        }
    }
}

/// Intent as carried to the agent intake endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentPayload {
    #[serde(rename = "podID", default, skip_serializing_if = "String::is_empty")]
    pub pod_id: String,
    #[serde(rename = "nodeID", default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(rename = "k8sNamespace", default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_regex: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub execution_time: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,
}

/// Request body of the intake endpoint; acknowledged as a whole
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentBatch {
    pub intents: Vec<IntentPayload>,
}

impl IntentBatch {
    pub fn from_intents(intents: &[Intent]) -> Self {
        Self {
            intents: intents.iter().map(Intent::to_payload).collect(),
        }
    }
}

/// An OS process owned by a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    pub command: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub parent_pid: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Processes discovered for one pod during a single scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodProcessSnapshot {
    pub pod_uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub processes: Vec<Process>,
}

/// Authenticated caller identity handed in by the auth layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub id: String,
}

impl Operator {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Parse the identity; `None` if it is not a valid UUID
    pub fn uid(&self) -> Option<Uuid> {
        Uuid::parse_str(self.id.trim()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_label_selector_existence_and_equality() {
        let pod_labels = labels(&[("app", "web"), ("tier", "")]);

        assert!(LabelSelector::exists("app").matches(&pod_labels));
        assert!(LabelSelector::exists("tier").matches(&pod_labels));
        assert!(LabelSelector::equals("app", "web").matches(&pod_labels));
        assert!(!LabelSelector::equals("app", "db").matches(&pod_labels));
        assert!(!LabelSelector::exists("missing").matches(&pod_labels));
    }

    #[test]
    fn test_intent_state_transitions() {
        assert!(IntentState::Created.can_transition_to(IntentState::Sent));
        assert!(IntentState::Sent.can_transition_to(IntentState::Sent));
        assert!(!IntentState::Sent.can_transition_to(IntentState::Created));
        assert_eq!("SENT".parse::<IntentState>(), Ok(IntentState::Sent));
        assert!("failed".parse::<IntentState>().is_err());
    }

    #[test]
    fn test_intent_copies_pod_snapshot() {
        let strategy = Strategy::create(
            Uuid::new_v4(),
            NewStrategy {
                command_regex: "nginx".to_string(),
                priority: 7,
                execution_time: 2000,
                ..Default::default()
            },
        );
        let pod = Pod {
            namespace: "prod".to_string(),
            labels: labels(&[("app", "web")]),
            pod_id: "uid-1".to_string(),
            node_id: "node-a".to_string(),
            containers: vec![],
        };

        let intent = Intent::for_pod(&strategy, &pod);
        assert_eq!(intent.strategy_id, strategy.id);
        assert_eq!(intent.pod_id, "uid-1");
        assert_eq!(intent.node_id, "node-a");
        assert_eq!(intent.namespace, "prod");
        assert_eq!(intent.priority, 7);
        assert_eq!(intent.execution_time, 2000);
        assert_eq!(intent.pod_labels, pod.labels);
        assert_eq!(intent.state, IntentState::Created);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = IntentPayload {
            pod_id: "uid-1".to_string(),
            node_id: "node-a".to_string(),
            priority: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(IntentBatch {
            intents: vec![payload],
        })
        .unwrap();

        let first = &json["intents"][0];
        assert_eq!(first["podID"], "uid-1");
        assert_eq!(first["nodeID"], "node-a");
        assert_eq!(first["priority"], 3);
        assert!(first.get("commandRegex").is_none());
        assert!(first.get("podLabels").is_none());
    }

    #[test]
    fn test_operator_identity() {
        assert!(Operator::new(Uuid::new_v4().to_string()).uid().is_some());
        assert!(Operator::new("not-a-uuid").uid().is_none());
        assert!(Operator::new("").uid().is_none());
    }
}
