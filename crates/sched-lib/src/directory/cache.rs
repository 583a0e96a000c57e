//! Watch-fed pod cache with live-listing fallback

use super::{
    compile_command_regex, ClusterClient, DirectoryError, LabelQuery, ObservedPod, PodDirectory,
    PodEvent, QueryAgentPodsOptions, QueryPodsOptions,
};
use crate::models::{AgentPod, Pod};
use crate::observability::SchedMetrics;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Events buffered between the watch and the updater task
const EVENT_BUFFER: usize = 1024;

/// How long a delete seen while unsynced masks live listing results.
/// Must outlast the slowest live listing.
const TOMBSTONE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct PodCache {
    /// uid -> pod
    pods: HashMap<String, ObservedPod>,
    /// UIDs deleted while unsynced, with the time of the delete; live
    /// listings must not resurrect them
    tombstones: HashMap<String, Instant>,
}

impl PodCache {
    /// Record a delete, expiring tombstones older than [`TOMBSTONE_TTL`]
    fn tombstone(&mut self, uid: String, now: Instant) {
        self.tombstones
            .retain(|_, deleted_at| now.saturating_duration_since(*deleted_at) < TOMBSTONE_TTL);
        self.tombstones.insert(uid, now);
    }

    fn is_tombstoned(&self, uid: &str) -> bool {
        self.tombstones.contains_key(uid)
    }

    fn select(&self, namespaces: &BTreeSet<String>, query: &LabelQuery) -> Vec<ObservedPod> {
        self.pods
            .values()
            .filter(|p| namespaces.is_empty() || namespaces.contains(&p.namespace))
            .filter(|p| query.matches(&p.labels))
            .cloned()
            .collect()
    }
}

enum Subscription {
    Idle,
    Running {
        shutdown: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// State shared with the updater task
struct Shared {
    cache: RwLock<PodCache>,
    /// Set once, after the first full listing has been applied
    synced: AtomicBool,
    sync_notify: Notify,
    metrics: SchedMetrics,
}

impl Shared {
    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    async fn apply(&self, event: PodEvent) {
        let mut cache = self.cache.write().await;
        let mut first_sync = false;

        match event {
            PodEvent::Added(pod) | PodEvent::Updated(pod) => {
                debug!(namespace = %pod.namespace, pod = %pod.name, uid = %pod.uid, "Pod upserted");
                cache.tombstones.remove(&pod.uid);
                cache.pods.insert(pod.uid.clone(), pod);
            }
            PodEvent::Deleted { uid } => {
                debug!(uid = %uid, "Pod deleted");
                cache.pods.remove(&uid);
                if !self.is_synced() {
                    cache.tombstone(uid, Instant::now());
                }
            }
            PodEvent::Relisted(pods) => {
                cache.pods = pods.into_iter().map(|p| (p.uid.clone(), p)).collect();
                cache.tombstones.clear();
                first_sync = !self.synced.swap(true, Ordering::AcqRel);
                if first_sync {
                    info!(pods = cache.pods.len(), "Pod cache synced");
                } else {
                    debug!(pods = cache.pods.len(), "Pod cache relisted");
                }
            }
        }

        self.metrics.set_cached_pods(cache.pods.len() as i64);
        drop(cache);

        if first_sync {
            self.sync_notify.notify_waiters();
        }
    }

    /// Fold a live listing into the cache.
    ///
    /// If the cache synced while the listing was in flight the cache wins
    /// and the live result is discarded.
    async fn merge_live(
        &self,
        namespaces: &BTreeSet<String>,
        query: &LabelQuery,
        listed: Vec<ObservedPod>,
    ) -> Vec<ObservedPod> {
        let mut cache = self.cache.write().await;
        if self.is_synced() {
            return cache.select(namespaces, query);
        }

        let mut kept = Vec::with_capacity(listed.len());
        for pod in listed {
            if cache.is_tombstoned(&pod.uid) {
                continue;
            }
            cache.pods.insert(pod.uid.clone(), pod.clone());
            kept.push(pod);
        }
        self.metrics.set_cached_pods(cache.pods.len() as i64);
        kept
    }
}

async fn run_updater(shared: Arc<Shared>, mut events: mpsc::Receiver<PodEvent>) {
    while let Some(event) = events.recv().await {
        shared.apply(event).await;
    }
    debug!("Pod event channel closed");
}

/// Watch-backed [`PodDirectory`]
pub struct ClusterPodDirectory {
    client: Arc<dyn ClusterClient>,
    shared: Arc<Shared>,
    subscription: Mutex<Subscription>,
}

impl ClusterPodDirectory {
    /// Create a directory; the subscription starts with [`start`](Self::start)
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            shared: Arc::new(Shared {
                cache: RwLock::new(PodCache::default()),
                synced: AtomicBool::new(false),
                sync_notify: Notify::new(),
                metrics: SchedMetrics::new(),
            }),
            subscription: Mutex::new(Subscription::Idle),
        }
    }

    fn subscription(&self) -> MutexGuard<'_, Subscription> {
        self.subscription.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the watch subscription. Returns false if it was already
    /// started or has been stopped. Must be called within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut subscription = self.subscription();
        if !matches!(*subscription, Subscription::Idle) {
            return false;
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = Arc::clone(&self.client);
        let watch_task = tokio::spawn(async move {
            client.watch_pods(event_tx, shutdown_rx).await;
            debug!("Pod watch ended");
        });
        let updater_task = tokio::spawn(run_updater(Arc::clone(&self.shared), event_rx));

        *subscription = Subscription::Running {
            shutdown: shutdown_tx,
            tasks: vec![watch_task, updater_task],
        };
        info!("Starting pod watch subscription");
        true
    }

    /// Stop the subscription and wait for its tasks. Returns false if it
    /// was already stopped. A directory that was never started cannot be
    /// started afterwards.
    pub async fn stop(&self) -> bool {
        let tasks = {
            let mut subscription = self.subscription();
            match std::mem::replace(&mut *subscription, Subscription::Stopped) {
                Subscription::Running { shutdown, tasks } => {
                    let _ = shutdown.send(true);
                    tasks
                }
                Subscription::Idle => Vec::new(),
                Subscription::Stopped => return false,
            }
        };

        for task in tasks {
            let _ = task.await;
        }
        info!("Pod watch subscription stopped");
        true
    }

    pub fn is_synced(&self) -> bool {
        self.shared.is_synced()
    }

    /// Resolve once the first full listing has been applied
    pub async fn wait_until_synced(&self) {
        loop {
            let notified = self.shared.sync_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_synced() {
                return;
            }
            notified.await;
        }
    }

    pub async fn cached_pod_count(&self) -> usize {
        self.shared.cache.read().await.pods.len()
    }

    async fn list(
        &self,
        namespaces: &[String],
        query: &LabelQuery,
    ) -> Result<Vec<ObservedPod>, DirectoryError> {
        let namespaces: BTreeSet<String> = namespaces
            .iter()
            .filter(|ns| !ns.is_empty())
            .cloned()
            .collect();

        let mut pods = if self.is_synced() {
            self.shared.cache.read().await.select(&namespaces, query)
        } else {
            self.list_live(&namespaces, query).await?
        };

        pods.sort_by(|a, b| (&a.namespace, &a.uid).cmp(&(&b.namespace, &b.uid)));
        Ok(pods)
    }

    async fn list_live(
        &self,
        namespaces: &BTreeSet<String>,
        query: &LabelQuery,
    ) -> Result<Vec<ObservedPod>, DirectoryError> {
        self.shared.metrics.inc_live_listings();
        debug!(selector = %query, namespaces = namespaces.len(), "Cache not synced, listing pods live");

        let mut listed = Vec::new();
        if namespaces.is_empty() {
            listed = self
                .client
                .list_pods(None, query)
                .await
                .map_err(|source| DirectoryError::List {
                    namespace: "<all>".to_string(),
                    source,
                })?;
        } else {
            for ns in namespaces {
                let pods = self
                    .client
                    .list_pods(Some(ns), query)
                    .await
                    .map_err(|source| DirectoryError::List {
                        namespace: ns.clone(),
                        source,
                    })?;
                listed.extend(pods);
            }
        }

        Ok(self.shared.merge_live(namespaces, query, listed).await)
    }
}

impl Drop for ClusterPodDirectory {
    fn drop(&mut self) {
        if let Subscription::Running { shutdown, .. } = &*self.subscription() {
            let _ = shutdown.send(true);
        }
    }
}

#[async_trait]
impl PodDirectory for ClusterPodDirectory {
    async fn query_pods(&self, opts: &QueryPodsOptions) -> Result<Vec<Pod>, DirectoryError> {
        let command_regex = compile_command_regex(opts.command_regex.as_deref())?;
        let query = LabelQuery::new(&opts.label_selectors)?;

        let pods = self.list(&opts.namespaces, &query).await?;
        Ok(pods
            .iter()
            .filter_map(|p| p.to_pod(command_regex.as_ref()))
            .collect())
    }

    async fn query_agent_pods(
        &self,
        opts: &QueryAgentPodsOptions,
    ) -> Result<Vec<AgentPod>, DirectoryError> {
        let query = LabelQuery::new(std::slice::from_ref(&opts.agent_label))?;
        let nodes: HashSet<&str> = opts.node_ids.iter().map(String::as_str).collect();

        let pods = self.list(&opts.namespaces, &query).await?;
        Ok(pods
            .iter()
            .filter(|p| nodes.is_empty() || nodes.contains(p.node_name.as_str()))
            .map(ObservedPod::to_agent_pod)
            .collect())
    }
}
