//! Strategy creation workflow: match, materialize, persist, deliver, record

use super::{AgentTransport, DistributionError, IntentFilter, Repository, StrategyFilter};
use crate::directory::{PodDirectory, QueryAgentPodsOptions, QueryPodsOptions};
use crate::models::{
    AgentPod, Intent, IntentState, LabelSelector, NewStrategy, Operator, Strategy,
};
use crate::observability::{SchedMetrics, StructuredLogger};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_AGENT_LABEL_KEY: &str = "app";
pub const DEFAULT_AGENT_LABEL_VALUE: &str = "sched-agent";

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Label identifying scheduling agent pods
    pub agent_label: LabelSelector,
    /// Namespaces searched for agents; empty searches all
    pub agent_namespaces: Vec<String>,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            agent_label: LabelSelector::equals(DEFAULT_AGENT_LABEL_KEY, DEFAULT_AGENT_LABEL_VALUE),
            agent_namespaces: Vec::new(),
        }
    }
}

/// Outcome of a successful strategy creation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub strategy: Strategy,
    pub intents_created: usize,
    pub intents_sent: usize,
    pub agents_reached: usize,
    /// Intents left `Created` because no agent serves their node
    pub unrouted: usize,
}

/// One agent's share of a strategy's intents
struct Batch {
    agent: AgentPod,
    intents: Vec<Intent>,
}

pub struct IntentDistributor {
    directory: Arc<dyn PodDirectory>,
    repository: Arc<dyn Repository>,
    transport: Arc<dyn AgentTransport>,
    config: DistributorConfig,
    metrics: SchedMetrics,
    logger: StructuredLogger,
}

impl IntentDistributor {
    pub fn new(
        directory: Arc<dyn PodDirectory>,
        repository: Arc<dyn Repository>,
        transport: Arc<dyn AgentTransport>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            directory,
            repository,
            transport,
            config,
            metrics: SchedMetrics::new(),
            logger: StructuredLogger::new("distributor"),
        }
    }

    /// Create a strategy and push its intents to the agents of the
    /// affected nodes.
    ///
    /// The strategy and its intents are persisted atomically before any
    /// delivery. Delivery stops at the first failing agent; batches already
    /// delivered keep their `Sent` state.
    pub async fn create_strategy(
        &self,
        operator: &Operator,
        request: NewStrategy,
    ) -> Result<DistributionReport, DistributionError> {
        let creator_id = validate_operator(operator)?;

        let pod_query = QueryPodsOptions {
            namespaces: request.namespace_scope.clone(),
            label_selectors: request.label_selectors.clone(),
            command_regex: Some(request.command_regex.clone()).filter(|re| !re.is_empty()),
        };
        let pods = self.directory.query_pods(&pod_query).await?;
        if pods.is_empty() {
            debug!(query = ?pod_query, "No pods match the strategy criteria");
            return Err(DistributionError::NoMatchingPods);
        }
        debug!(pods = pods.len(), "Found pods matching the strategy criteria");

        let strategy = Strategy::create(creator_id, request);
        let intents: Vec<Intent> = pods.iter().map(|pod| Intent::for_pod(&strategy, pod)).collect();

        let mut node_ids: Vec<String> = Vec::new();
        for pod in &pods {
            if !node_ids.contains(&pod.node_id) {
                node_ids.push(pod.node_id.clone());
            }
        }

        self.repository
            .insert_strategy_and_intents(&strategy, &intents)
            .await
            .map_err(DistributionError::Persist)?;
        self.metrics.inc_strategies_created();
        self.metrics.add_intents_created(intents.len() as u64);

        let mut report = DistributionReport {
            strategy,
            intents_created: intents.len(),
            intents_sent: 0,
            agents_reached: 0,
            unrouted: 0,
        };

        let agent_query = QueryAgentPodsOptions {
            namespaces: self.config.agent_namespaces.clone(),
            agent_label: self.config.agent_label.clone(),
            node_ids,
        };
        let agents = self.directory.query_agent_pods(&agent_query).await?;
        if agents.is_empty() {
            warn!(
                strategy_id = %report.strategy.id,
                nodes = ?agent_query.node_ids,
                "No agent pods found for scheduling intents, leaving them pending"
            );
            report.unrouted = intents.len();
            self.log_report(&report);
            return Ok(report);
        }
        debug!(agents = agents.len(), "Found agent pods for scheduling intents");

        let (batches, unrouted) = partition_by_agent(intents, agents);
        report.unrouted = unrouted;
        if unrouted > 0 {
            warn!(
                strategy_id = %report.strategy.id,
                unrouted,
                "Some intents target nodes without an agent, leaving them pending"
            );
        }

        for (endpoint, batch) in batches {
            if let Err(source) = self.transport.send_intents(&batch.agent, &batch.intents).await {
                self.metrics.inc_delivery_failures();
                return Err(DistributionError::Delivery {
                    agent: endpoint,
                    source,
                });
            }

            let ids: Vec<Uuid> = batch.intents.iter().map(|i| i.id).collect();
            self.repository
                .batch_update_intent_state(&ids, IntentState::Sent)
                .await
                .map_err(|source| DistributionError::StateUpdate {
                    agent: endpoint.clone(),
                    source,
                })?;

            self.metrics.add_intents_sent(ids.len() as u64);
            report.intents_sent += ids.len();
            report.agents_reached += 1;
            info!(
                agent = %batch.agent,
                intents = ids.len(),
                "Sent scheduling intents to agent"
            );
        }

        self.log_report(&report);
        Ok(report)
    }

    pub async fn list_strategies(
        &self,
        operator: &Operator,
    ) -> Result<Vec<Strategy>, DistributionError> {
        let creator_id = validate_operator(operator)?;
        self.repository
            .query_strategies(&StrategyFilter::for_creator(creator_id))
            .await
            .map_err(DistributionError::Query)
    }

    /// `filter.creator_ids` is replaced with the operator's own ID
    pub async fn list_intents(
        &self,
        operator: &Operator,
        filter: IntentFilter,
    ) -> Result<Vec<Intent>, DistributionError> {
        let creator_id = validate_operator(operator)?;
        let filter = IntentFilter {
            creator_ids: vec![creator_id],
            ..filter
        };
        self.repository
            .query_intents(&filter)
            .await
            .map_err(DistributionError::Query)
    }

    fn log_report(&self, report: &DistributionReport) {
        self.logger.log_distribution(
            &report.strategy.id.to_string(),
            report.intents_created,
            report.intents_sent,
            report.unrouted,
        );
    }
}

fn validate_operator(operator: &Operator) -> Result<Uuid, DistributionError> {
    operator
        .uid()
        .ok_or_else(|| DistributionError::InvalidOperator(operator.id.clone()))
}

/// Pick one agent per node: Online, then Unknown, then Offline, ties broken
/// by the lowest endpoint.
fn agents_by_node(agents: Vec<AgentPod>) -> HashMap<String, AgentPod> {
    let mut candidates: HashMap<String, Vec<AgentPod>> = HashMap::new();
    for agent in agents {
        candidates.entry(agent.node_id.clone()).or_default().push(agent);
    }

    candidates
        .into_iter()
        .filter_map(|(node_id, mut agents)| {
            agents.sort_by(|a, b| {
                (a.state.preference(), a.endpoint()).cmp(&(b.state.preference(), b.endpoint()))
            });
            let mut agents = agents.into_iter();
            let chosen = agents.next()?;
            let passed_over: Vec<String> = agents.map(|a| a.endpoint()).collect();
            if !passed_over.is_empty() {
                warn!(
                    node = %node_id,
                    chosen = %chosen.endpoint(),
                    passed_over = ?passed_over,
                    "Multiple agent pods serve one node, delivering to one of them"
                );
            }
            Some((node_id, chosen))
        })
        .collect()
}

/// Group intents by destination endpoint. Returns the batches in endpoint
/// order and the number of intents whose node has no agent.
fn partition_by_agent(intents: Vec<Intent>, agents: Vec<AgentPod>) -> (BTreeMap<String, Batch>, usize) {
    let by_node = agents_by_node(agents);
    let mut batches: BTreeMap<String, Batch> = BTreeMap::new();
    let mut unrouted = 0;

    for intent in intents {
        match by_node.get(&intent.node_id) {
            Some(agent) => batches
                .entry(agent.endpoint())
                .or_insert_with(|| Batch {
                    agent: agent.clone(),
                    intents: Vec::new(),
                })
                .intents
                .push(intent),
            None => unrouted += 1,
        }
    }

    (batches, unrouted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentState;

    fn agent(node: &str, host: &str, state: AgentState) -> AgentPod {
        AgentPod {
            node_id: node.to_string(),
            host: host.to_string(),
            port: 8082,
            state,
        }
    }

    #[test]
    fn test_one_agent_per_node_prefers_online() {
        let chosen = agents_by_node(vec![
            agent("node-a", "10.0.0.1", AgentState::Offline),
            agent("node-a", "10.0.0.9", AgentState::Online),
            agent("node-b", "10.0.1.7", AgentState::Unknown),
            agent("node-b", "10.0.1.3", AgentState::Unknown),
        ]);

        assert_eq!(chosen.len(), 2);
        assert_eq!(chosen["node-a"].host, "10.0.0.9");
        assert_eq!(chosen["node-b"].host, "10.0.1.3");
    }
}
