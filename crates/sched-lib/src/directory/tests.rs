use super::*;
use crate::models::AgentState;
use crate::testing::{observed_agent, observed_pod, FakeClusterClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn snapshot() -> Vec<ObservedPod> {
    vec![
        observed_pod("uid-1", "prod", "node-a", &[("app", "web"), ("tier", "front")], &["nginx"]),
        observed_pod("uid-2", "prod", "node-b", &[("app", "web")], &["nginx", "-g", "daemon off;"]),
        observed_pod("uid-3", "prod", "node-b", &[("app", "db")], &["postgres"]),
        observed_pod("uid-4", "staging", "node-a", &[("app", "web"), ("tier", "")], &["httpd"]),
        observed_agent("agent-a", "sched", "node-a", "10.0.0.1", 9000),
        observed_agent("agent-b", "sched", "node-b", "10.0.0.2", 9000),
    ]
}

fn directory_over(pods: Vec<ObservedPod>) -> (Arc<FakeClusterClient>, ClusterPodDirectory) {
    let client = Arc::new(FakeClusterClient::new(pods));
    let directory = ClusterPodDirectory::new(client.clone());
    (client, directory)
}

async fn synced_directory(pods: Vec<ObservedPod>) -> (Arc<FakeClusterClient>, ClusterPodDirectory) {
    let (client, directory) = directory_over(pods);
    assert!(directory.start());
    assert!(client.relist().await);
    tokio::time::timeout(Duration::from_secs(5), directory.wait_until_synced())
        .await
        .unwrap();
    (client, directory)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn uids(pods: &[crate::models::Pod]) -> Vec<&str> {
    pods.iter().map(|p| p.pod_id.as_str()).collect()
}

fn select(selectors: Vec<LabelSelector>) -> QueryPodsOptions {
    QueryPodsOptions {
        label_selectors: selectors,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_selector_semantics_before_sync() {
    let (_client, directory) = directory_over(snapshot());

    let pods = directory
        .query_pods(&select(vec![LabelSelector::equals("app", "web")]))
        .await
        .unwrap();
    assert_eq!(uids(&pods), vec!["uid-1", "uid-2", "uid-4"]);

    let pods = directory
        .query_pods(&select(vec![
            LabelSelector::equals("app", "web"),
            LabelSelector::exists("tier"),
        ]))
        .await
        .unwrap();
    assert_eq!(uids(&pods), vec!["uid-1", "uid-4"]);

    let pods = directory
        .query_pods(&select(vec![LabelSelector::exists("")]))
        .await
        .unwrap();
    assert_eq!(pods.len(), 6);
}

#[tokio::test]
async fn test_namespace_and_command_filters() {
    let (_client, directory) = directory_over(snapshot());

    let opts = QueryPodsOptions {
        namespaces: vec!["prod".to_string(), "prod".to_string()],
        label_selectors: vec![LabelSelector::equals("app", "web")],
        command_regex: Some("daemon off".to_string()),
    };
    let pods = directory.query_pods(&opts).await.unwrap();
    assert_eq!(uids(&pods), vec!["uid-2"]);
    assert_eq!(pods[0].containers[0].command, vec!["nginx", "-g", "daemon off;"]);

    let bad = QueryPodsOptions {
        command_regex: Some("(".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        directory.query_pods(&bad).await,
        Err(DirectoryError::InvalidCommandRegex { .. })
    ));
}

#[tokio::test]
async fn test_cache_matches_live_listing() {
    let (_live_client, live) = directory_over(snapshot());
    let (client, cached) = synced_directory(snapshot()).await;
    let calls_after_sync = client.list_calls();

    let queries = vec![
        select(vec![]),
        select(vec![LabelSelector::equals("app", "web")]),
        QueryPodsOptions {
            namespaces: vec!["staging".to_string()],
            ..Default::default()
        },
        QueryPodsOptions {
            command_regex: Some("^nginx".to_string()),
            ..Default::default()
        },
    ];
    for query in &queries {
        assert_eq!(
            cached.query_pods(query).await.unwrap(),
            live.query_pods(query).await.unwrap()
        );
    }

    let agents = QueryAgentPodsOptions {
        agent_label: LabelSelector::equals("app", "sched-agent"),
        node_ids: vec!["node-b".to_string()],
        ..Default::default()
    };
    assert_eq!(
        cached.query_agent_pods(&agents).await.unwrap(),
        live.query_agent_pods(&agents).await.unwrap()
    );
    assert_eq!(client.list_calls(), calls_after_sync);
}

#[tokio::test]
async fn test_agent_pods_resolve_endpoints() {
    let (_client, directory) = synced_directory(snapshot()).await;

    let agents = directory
        .query_agent_pods(&QueryAgentPodsOptions {
            agent_label: LabelSelector::equals("app", "sched-agent"),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].node_id, "node-a");
    assert_eq!(agents[0].endpoint(), "10.0.0.1:9000");
    assert_eq!(agents[0].state, AgentState::Online);
}

#[tokio::test]
async fn test_repeated_add_is_idempotent() {
    let (client, directory) = synced_directory(Vec::new()).await;
    let directory = &directory;
    let pod = observed_pod("uid-9", "prod", "node-a", &[("app", "web")], &["nginx"]);

    assert!(client.emit(PodEvent::Added(pod.clone())).await);
    assert!(client.emit(PodEvent::Added(pod.clone())).await);
    let mut relabelled = pod;
    relabelled.labels.insert("tier".to_string(), "front".to_string());
    assert!(client.emit(PodEvent::Updated(relabelled)).await);

    eventually(|| async move {
        let pods = directory
            .query_pods(&select(vec![LabelSelector::exists("tier")]))
            .await
            .unwrap();
        pods.len() == 1
    })
    .await;
    assert_eq!(directory.cached_pod_count().await, 1);
}

#[tokio::test]
async fn test_delete_after_sync() {
    let (client, directory) = synced_directory(snapshot()).await;
    let directory = &directory;

    assert!(client.emit(PodEvent::Deleted { uid: "uid-1".to_string() }).await);
    eventually(|| async move { directory.cached_pod_count().await == 5 }).await;

    let pods = directory.query_pods(&select(vec![])).await.unwrap();
    assert!(pods.iter().all(|p| p.pod_id != "uid-1"));
}

#[tokio::test]
async fn test_delete_before_sync_survives_stale_listing() {
    let (client, directory) = directory_over(snapshot());
    let directory = &directory;
    assert!(directory.start());

    let pod = client.pods()[0].clone();
    assert!(client.emit(PodEvent::Added(pod)).await);
    eventually(|| async move { directory.cached_pod_count().await == 1 }).await;
    assert!(client.emit(PodEvent::Deleted { uid: "uid-1".to_string() }).await);
    eventually(|| async move { directory.cached_pod_count().await == 0 }).await;

    // the cluster API still reports the deleted pod
    let pods = directory.query_pods(&select(vec![])).await.unwrap();
    assert!(!directory.is_synced());
    assert_eq!(pods.len(), 5);
    assert!(pods.iter().all(|p| p.pod_id != "uid-1"));
}

#[tokio::test]
async fn test_delete_during_inflight_listing_leaves_no_trace() {
    let (client, directory) = directory_over(snapshot());
    let directory = &directory;
    assert!(directory.start());
    let (entered, release) = client.hold_next_list();

    let all = select(vec![]);
    let listing = directory.query_pods(&all);
    let cluster = async {
        entered.await.unwrap();
        let pod = client.pods()[0].clone();
        assert!(client.emit(PodEvent::Added(pod)).await);
        eventually(|| async move { directory.cached_pod_count().await == 1 }).await;
        assert!(client.emit(PodEvent::Deleted { uid: "uid-1".to_string() }).await);
        eventually(|| async move { directory.cached_pod_count().await == 0 }).await;
        release.send(()).unwrap();
    };
    let (pods, ()) = tokio::join!(listing, cluster);

    // the listing read the pod set before the delete
    let pods = pods.unwrap();
    assert!(!directory.is_synced());
    assert_eq!(pods.len(), 5);
    assert!(pods.iter().all(|p| p.pod_id != "uid-1"));
    assert_eq!(directory.cached_pod_count().await, 5);

    let again = directory.query_pods(&all).await.unwrap();
    assert!(again.iter().all(|p| p.pod_id != "uid-1"));
}

#[tokio::test]
async fn test_malformed_selectors_rejected_before_and_after_sync() {
    let (live_client, live) = directory_over(snapshot());
    let (_client, cached) = synced_directory(snapshot()).await;

    for selector in [
        LabelSelector::equals("app", "web,tier"),
        LabelSelector::exists("bad key!"),
    ] {
        let opts = select(vec![selector]);
        assert!(matches!(
            live.query_pods(&opts).await,
            Err(DirectoryError::InvalidSelector { .. })
        ));
        assert!(matches!(
            cached.query_pods(&opts).await,
            Err(DirectoryError::InvalidSelector { .. })
        ));
    }

    let agents = QueryAgentPodsOptions {
        agent_label: LabelSelector::equals("app", "sched agent"),
        ..Default::default()
    };
    assert!(matches!(
        cached.query_agent_pods(&agents).await,
        Err(DirectoryError::InvalidSelector { .. })
    ));
    assert_eq!(live_client.list_calls(), 0);
}

#[tokio::test]
async fn test_live_listing_warms_cache() {
    let (client, directory) = directory_over(snapshot());

    directory.query_pods(&select(vec![])).await.unwrap();
    assert_eq!(directory.cached_pod_count().await, 6);
    assert_eq!(client.list_calls(), 1);
}

#[tokio::test]
async fn test_live_listing_failure_carries_namespace() {
    let (client, directory) = directory_over(snapshot());
    client.fail_lists(true);

    let err = directory
        .query_pods(&QueryPodsOptions {
            namespaces: vec!["prod".to_string()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    match err {
        DirectoryError::List { namespace, .. } => assert_eq!(namespace, "prod"),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_relist_replaces_cache() {
    let (client, directory) = synced_directory(snapshot()).await;
    let directory = &directory;

    client.set_pods(vec![observed_pod("uid-7", "prod", "node-c", &[], &["sleep"])]);
    assert!(client.relist().await);
    eventually(|| async move { directory.cached_pod_count().await == 1 }).await;

    let pods = directory.query_pods(&select(vec![])).await.unwrap();
    assert_eq!(uids(&pods), vec!["uid-7"]);
}

#[tokio::test]
async fn test_start_and_stop_run_once() {
    let (client, directory) = directory_over(snapshot());

    assert!(directory.start());
    assert!(!directory.start());
    assert!(client.relist().await);
    directory.wait_until_synced().await;

    assert!(directory.stop().await);
    assert!(!directory.stop().await);
    assert!(!directory.start());
    assert!(!client.emit(PodEvent::Deleted { uid: "uid-1".to_string() }).await);
}

#[tokio::test]
async fn test_stop_without_start() {
    let (_client, directory) = directory_over(snapshot());

    assert!(directory.stop().await);
    assert!(!directory.start());
}
