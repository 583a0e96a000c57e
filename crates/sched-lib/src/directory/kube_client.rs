//! Kubernetes implementation of [`ClusterClient`]

use super::{ClusterClient, DirectoryError, LabelQuery, ObservedContainer, ObservedPod, PodEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Config};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// How to reach the cluster API
#[derive(Debug, Clone)]
pub struct KubeClientOptions {
    /// Use the service account mounted into the pod
    pub in_cluster: bool,
    /// Kubeconfig used when not running in-cluster
    pub kubeconfig_path: Option<PathBuf>,
    /// Page size for live listings
    pub page_size: u32,
}

impl Default for KubeClientOptions {
    fn default() -> Self {
        Self {
            in_cluster: true,
            kubeconfig_path: None,
            page_size: 500,
        }
    }
}

/// Cluster client over kube-rs
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    page_size: u32,
}

impl KubeClusterClient {
    pub fn new(client: Client, page_size: u32) -> Self {
        Self { client, page_size }
    }

    /// Build a client from in-cluster config or an explicit kubeconfig
    pub async fn connect(opts: &KubeClientOptions) -> Result<Self, DirectoryError> {
        let config = if opts.in_cluster {
            Config::incluster()
                .map_err(|e| DirectoryError::NoClient(format!("in-cluster config: {}", e)))?
        } else {
            let path = opts.kubeconfig_path.as_ref().ok_or_else(|| {
                DirectoryError::NoClient("no kubeconfig path configured".to_string())
            })?;
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                DirectoryError::NoClient(format!("read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    DirectoryError::NoClient(format!("load kubeconfig {}: {}", path.display(), e))
                })?
        };

        let client = Client::try_from(config)
            .map_err(|e| DirectoryError::NoClient(format!("create kubernetes client: {}", e)))?;
        info!(in_cluster = opts.in_cluster, "Kubernetes client ready");

        Ok(Self::new(client, opts.page_size.max(1)))
    }
}

/// Convert an API pod; pods without a UID are ignored
pub(crate) fn observe(pod: &K8sPod) -> Option<ObservedPod> {
    let uid = pod.metadata.uid.clone()?;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let runtime_ids: HashMap<&str, &str> = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| cs.container_id.as_deref().map(|id| (cs.name.as_str(), id)))
                .collect()
        })
        .unwrap_or_default();

    let containers = spec
        .map(|s| {
            s.containers
                .iter()
                .map(|c| ObservedContainer {
                    name: c.name.clone(),
                    command: c.command.clone().unwrap_or_default(),
                    args: c.args.clone().unwrap_or_default(),
                    ports: c
                        .ports
                        .iter()
                        .flatten()
                        .filter_map(|p| u16::try_from(p.container_port).ok())
                        .collect(),
                    container_id: runtime_ids.get(c.name.as_str()).map(|id| id.to_string()),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ObservedPod {
        uid,
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()),
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        host_ip: status.and_then(|s| s.host_ip.clone()),
        containers,
    })
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        query: &LabelQuery,
    ) -> Result<Vec<ObservedPod>> {
        let api: Api<K8sPod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let selector = query.to_string();

        let mut observed = Vec::new();
        let mut continue_token: Option<String> = None;
        loop {
            let mut params = ListParams::default().limit(self.page_size);
            if !selector.is_empty() {
                params = params.labels(&selector);
            }
            if let Some(token) = &continue_token {
                params = params.continue_token(token);
            }

            let page = api
                .list(&params)
                .await
                .with_context(|| format!("list pods with selector {:?}", selector))?;
            observed.extend(page.items.iter().filter_map(observe));

            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        Ok(observed)
    }

    async fn watch_pods(&self, events: mpsc::Sender<PodEvent>, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        let api: Api<K8sPod> = Api::all(self.client.clone());
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);

        info!("Watching pods across all namespaces");
        let mut known: HashSet<String> = HashSet::new();

        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => break,
                item = stream.next() => item,
            };

            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(error = %e, "Pod watch error, retrying");
                    continue;
                }
                None => break,
            };

            let mapped = match event {
                watcher::Event::Applied(pod) => {
                    let Some(observed) = observe(&pod) else {
                        continue;
                    };
                    if known.insert(observed.uid.clone()) {
                        PodEvent::Added(observed)
                    } else {
                        PodEvent::Updated(observed)
                    }
                }
                watcher::Event::Deleted(pod) => {
                    let Some(uid) = pod.metadata.uid else {
                        continue;
                    };
                    known.remove(&uid);
                    PodEvent::Deleted { uid }
                }
                watcher::Event::Restarted(pods) => {
                    let observed: Vec<ObservedPod> = pods.iter().filter_map(observe).collect();
                    known = observed.iter().map(|p| p.uid.clone()).collect();
                    PodEvent::Relisted(observed)
                }
            };

            if events.send(mapped).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, ContainerStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn test_observe_pod() {
        let pod = K8sPod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("prod".to_string()),
                uid: Some("uid-1".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                containers: vec![Container {
                    name: "app".to_string(),
                    command: Some(vec!["nginx".to_string()]),
                    args: Some(vec!["-g".to_string(), "daemon off;".to_string()]),
                    ports: Some(vec![ContainerPort {
                        container_port: 8080,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.0.0.5".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    container_id: Some("containerd://abc".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };

        let observed = observe(&pod).unwrap();
        assert_eq!(observed.uid, "uid-1");
        assert_eq!(observed.namespace, "prod");
        assert_eq!(observed.node_name, "node-a");
        assert_eq!(observed.labels["app"], "web");
        assert_eq!(observed.containers[0].argv(), vec!["nginx", "-g", "daemon off;"]);
        assert_eq!(observed.containers[0].ports, vec![8080]);
        assert_eq!(
            observed.containers[0].container_id.as_deref(),
            Some("containerd://abc")
        );
    }

    #[test]
    fn test_observe_skips_pod_without_uid() {
        assert!(observe(&K8sPod::default()).is_none());
    }
}
