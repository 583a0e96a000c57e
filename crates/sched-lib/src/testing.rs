//! In-memory doubles for the directory, repository and transport seams

use crate::directory::{
    compile_command_regex, ClusterClient, DirectoryError, LabelQuery, ObservedContainer,
    ObservedPod, PodDirectory, PodEvent, QueryAgentPodsOptions, QueryPodsOptions,
};
use crate::distribution::{
    AgentTransport, IntentFilter, MemoryRepository, Repository, RepositoryError, StrategyFilter,
    TransportError,
};
use crate::models::{AgentPod, Intent, IntentState, Pod, Strategy};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build a running workload pod with one container
pub fn observed_pod(
    uid: &str,
    namespace: &str,
    node: &str,
    labels: &[(&str, &str)],
    command: &[&str],
) -> ObservedPod {
    ObservedPod {
        uid: uid.to_string(),
        name: format!("pod-{}", uid),
        namespace: namespace.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        node_name: node.to_string(),
        phase: Some("Running".to_string()),
        pod_ip: Some("10.1.0.1".to_string()),
        host_ip: None,
        containers: vec![ObservedContainer {
            name: "main".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            args: Vec::new(),
            ports: Vec::new(),
            container_id: Some(format!("containerd://{}", uid)),
        }],
    }
}

/// Build an agent pod listening on `ip:port`
pub fn observed_agent(uid: &str, namespace: &str, node: &str, ip: &str, port: u16) -> ObservedPod {
    let mut pod = observed_pod(uid, namespace, node, &[("app", "sched-agent")], &["sched-agent"]);
    pod.pod_ip = Some(ip.to_string());
    pod.containers[0].ports = vec![port];
    pod
}

/// Scripted cluster API.
///
/// `list_pods` answers from the current pod set. Once the directory has
/// started its watch, [`emit`](Self::emit) pushes events into it.
pub struct FakeClusterClient {
    pods: Mutex<Vec<ObservedPod>>,
    list_calls: AtomicUsize,
    fail_lists: AtomicBool,
    list_gate: Mutex<Option<ListGate>>,
    watcher: watch::Sender<WatchState>,
}

struct ListGate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

#[derive(Clone)]
enum WatchState {
    NotStarted,
    Running(mpsc::Sender<PodEvent>),
    Ended,
}

impl FakeClusterClient {
    pub fn new(pods: Vec<ObservedPod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            list_calls: AtomicUsize::new(0),
            fail_lists: AtomicBool::new(false),
            list_gate: Mutex::new(None),
            watcher: watch::Sender::new(WatchState::NotStarted),
        }
    }

    pub fn set_pods(&self, pods: Vec<ObservedPod>) {
        *lock(&self.pods) = pods;
    }

    pub fn pods(&self) -> Vec<ObservedPod> {
        lock(&self.pods).clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Park the next `list_pods` call after it has read the pod set.
    ///
    /// The receiver fires once the call is parked; sending on the returned
    /// sender lets it return its (now stale) result.
    pub fn hold_next_list(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *lock(&self.list_gate) = Some(ListGate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }

    /// Push an event into the watch, waiting for it to start. False once
    /// the watch has ended.
    pub async fn emit(&self, event: PodEvent) -> bool {
        let mut rx = self.watcher.subscribe();
        let state = match rx
            .wait_for(|state| !matches!(state, WatchState::NotStarted))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => return false,
        };
        match state {
            WatchState::Running(tx) => tx.send(event).await.is_ok(),
            _ => false,
        }
    }

    /// Emit a full listing of the current pod set
    pub async fn relist(&self) -> bool {
        let pods = self.pods();
        self.emit(PodEvent::Relisted(pods)).await
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        query: &LabelQuery,
    ) -> anyhow::Result<Vec<ObservedPod>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst) {
            anyhow::bail!("cluster API unavailable");
        }

        let listed: Vec<ObservedPod> = lock(&self.pods)
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace == ns))
            .filter(|p| query.matches(&p.labels))
            .cloned()
            .collect();

        let gate = lock(&self.list_gate).take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.await;
        }
        Ok(listed)
    }

    async fn watch_pods(&self, events: mpsc::Sender<PodEvent>, mut shutdown: watch::Receiver<bool>) {
        self.watcher.send_replace(WatchState::Running(events));
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        self.watcher.send_replace(WatchState::Ended);
    }
}

/// Directory answering from fixed pod and agent sets
#[derive(Default)]
pub struct FakeDirectory {
    pods: Vec<Pod>,
    agents: Vec<AgentPod>,
    agent_queries: Mutex<Vec<QueryAgentPodsOptions>>,
}

impl FakeDirectory {
    pub fn new(pods: Vec<Pod>, agents: Vec<AgentPod>) -> Self {
        Self {
            pods,
            agents,
            agent_queries: Mutex::new(Vec::new()),
        }
    }

    /// Agent lookups seen so far
    pub fn agent_queries(&self) -> Vec<QueryAgentPodsOptions> {
        lock(&self.agent_queries).clone()
    }
}

#[async_trait]
impl PodDirectory for FakeDirectory {
    async fn query_pods(&self, opts: &QueryPodsOptions) -> Result<Vec<Pod>, DirectoryError> {
        let command_regex = compile_command_regex(opts.command_regex.as_deref())?;
        let query = LabelQuery::new(&opts.label_selectors)?;

        Ok(self
            .pods
            .iter()
            .filter(|p| opts.namespaces.is_empty() || opts.namespaces.contains(&p.namespace))
            .filter(|p| query.matches(&p.labels))
            .filter_map(|p| match &command_regex {
                None => Some(p.clone()),
                Some(re) => {
                    let containers: Vec<_> = p
                        .containers
                        .iter()
                        .filter(|c| re.is_match(&c.command.join(" ")))
                        .cloned()
                        .collect();
                    (!containers.is_empty()).then(|| Pod {
                        containers,
                        ..p.clone()
                    })
                }
            })
            .collect())
    }

    async fn query_agent_pods(
        &self,
        opts: &QueryAgentPodsOptions,
    ) -> Result<Vec<AgentPod>, DirectoryError> {
        LabelQuery::new(std::slice::from_ref(&opts.agent_label))?;
        lock(&self.agent_queries).push(opts.clone());
        Ok(self
            .agents
            .iter()
            .filter(|a| opts.node_ids.is_empty() || opts.node_ids.contains(&a.node_id))
            .cloned()
            .collect())
    }
}

/// Transport that records delivered batches and fails chosen endpoints
#[derive(Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<(String, Vec<Intent>)>>,
    attempts: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every batch sent to `endpoint` (`host:port`)
    pub fn fail_endpoint(&self, endpoint: &str) {
        lock(&self.failing).insert(endpoint.to_string());
    }

    /// Accepted batches as `(endpoint, intents)` in delivery order
    pub fn delivered(&self) -> Vec<(String, Vec<Intent>)> {
        lock(&self.delivered).clone()
    }

    /// Every endpoint a batch was sent to, accepted or not
    pub fn attempts(&self) -> Vec<String> {
        lock(&self.attempts).clone()
    }
}

#[async_trait]
impl AgentTransport for RecordingTransport {
    async fn send_intents(&self, agent: &AgentPod, intents: &[Intent]) -> Result<(), TransportError> {
        let endpoint = agent.endpoint();
        lock(&self.attempts).push(endpoint.clone());

        if lock(&self.failing).contains(&endpoint) {
            return Err(TransportError::Status {
                endpoint,
                status: 503,
                body: "agent unavailable".to_string(),
            });
        }
        lock(&self.delivered).push((endpoint, intents.to_vec()));
        Ok(())
    }
}

/// [`MemoryRepository`] with switchable write failures
#[derive(Default)]
pub struct FailingRepository {
    inner: MemoryRepository,
    fail_insert: AtomicBool,
    fail_update: AtomicBool,
}

impl FailingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Repository for FailingRepository {
    async fn insert_strategy_and_intents(
        &self,
        strategy: &Strategy,
        intents: &[Intent],
    ) -> Result<(), RepositoryError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("write rejected".to_string()));
        }
        self.inner.insert_strategy_and_intents(strategy, intents).await
    }

    async fn batch_update_intent_state(
        &self,
        intent_ids: &[Uuid],
        state: IntentState,
    ) -> Result<(), RepositoryError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("write rejected".to_string()));
        }
        self.inner.batch_update_intent_state(intent_ids, state).await
    }

    async fn query_strategies(
        &self,
        filter: &StrategyFilter,
    ) -> Result<Vec<Strategy>, RepositoryError> {
        self.inner.query_strategies(filter).await
    }

    async fn query_intents(&self, filter: &IntentFilter) -> Result<Vec<Intent>, RepositoryError> {
        self.inner.query_intents(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Container, LabelSelector};

    fn container(name: &str, command: &str) -> Container {
        Container {
            container_id: String::new(),
            name: name.to_string(),
            command: vec![command.to_string()],
        }
    }

    #[tokio::test]
    async fn test_fake_directory_filters_like_the_cache() {
        let pod = observed_pod("uid-1", "prod", "node-a", &[("app", "web")], &["nginx"])
            .to_pod(None)
            .unwrap();
        let pod = Pod {
            containers: vec![container("main", "nginx"), container("sidecar", "envoy")],
            ..pod
        };
        let directory = FakeDirectory::new(vec![pod], Vec::new());

        let pods = directory
            .query_pods(&QueryPodsOptions {
                command_regex: Some("nginx".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].containers, vec![container("main", "nginx")]);

        let none = directory
            .query_pods(&QueryPodsOptions {
                command_regex: Some("^redis".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());

        let err = directory
            .query_pods(&QueryPodsOptions {
                label_selectors: vec![LabelSelector::exists("bad key!")],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidSelector { .. }));
    }
}
