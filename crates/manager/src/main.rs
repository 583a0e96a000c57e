//! Intent Manager - scheduling strategy control plane
//!
//! Watches pod placement across the cluster and distributes scheduling
//! intents to the per-node agents.

use anyhow::{Context, Result};
use intent_manager::{api, config};
use sched_lib::{
    directory::{ClusterPodDirectory, KubeClusterClient},
    distribution::{HttpAgentTransport, IntentDistributor, MemoryRepository},
    health::{components, HealthRegistry},
    observability::StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MANAGER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting intent-manager");

    let config = config::ManagerConfig::load()?;
    info!(
        listen_port = config.listen_port,
        in_cluster = config.in_cluster,
        agent_namespaces = ?config.agent_namespaces,
        "Manager configured"
    );

    let logger = StructuredLogger::new("intent-manager");
    logger.log_startup(MANAGER_VERSION);

    let health_registry = HealthRegistry::new();
    health_registry.register(components::DIRECTORY).await;
    health_registry.register(components::REPOSITORY).await;
    health_registry
        .set_degraded(components::DIRECTORY, "Pod cache not synced")
        .await;
    health_registry
        .set_pending_reason("Waiting for pod cache sync")
        .await;

    let cluster = KubeClusterClient::connect(&config.kube_options())
        .await
        .context("Failed to connect to the cluster API")?;
    let directory = Arc::new(ClusterPodDirectory::new(Arc::new(cluster)));
    directory.start();

    let transport = HttpAgentTransport::new(config.transport_config())?;
    let distributor = Arc::new(IntentDistributor::new(
        directory.clone(),
        Arc::new(MemoryRepository::new()),
        Arc::new(transport),
        config.distributor_config(),
    ));

    let sync_handle = tokio::spawn({
        let directory = Arc::clone(&directory);
        let health_registry = health_registry.clone();
        let sync_timeout = config.sync_timeout();
        async move {
            if tokio::time::timeout(sync_timeout, directory.wait_until_synced())
                .await
                .is_err()
            {
                warn!(
                    timeout_secs = sync_timeout.as_secs(),
                    "Pod cache not synced in time, answering queries with live listings"
                );
                directory.wait_until_synced().await;
            }
            health_registry.set_healthy(components::DIRECTORY).await;
            health_registry.set_ready(true).await;
        }
    });

    let app_state = Arc::new(api::AppState::new(distributor, health_registry.clone()));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut api_handle = tokio::spawn(api::serve(config.listen_port, app_state, async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    }));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    info!("Shutting down");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(true);
    if !api_handle.is_finished() {
        let _ = api_handle.await;
    }
    sync_handle.abort();
    directory.stop().await;

    Ok(())
}
