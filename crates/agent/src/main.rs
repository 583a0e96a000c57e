//! Sched Agent - per-node scheduling intent receiver
//!
//! This binary runs as a DaemonSet on each Kubernetes node, accepting
//! scheduling intents and mapping pods to their processes.

use anyhow::Result;
use sched_agent::{api, config};
use sched_lib::{
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    resolver::{ProcessResolver, ScanLoop},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting sched-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        proc_root = ?config.proc_root,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RESOLVER).await;
    health_registry.register(components::INTAKE).await;

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION);

    let resolver = Arc::new(
        ProcessResolver::new(config.proc_root.clone()).with_marker(config.cgroup_marker.clone()),
    );
    let (scan_loop, latest_scan) = ScanLoop::new(Arc::clone(&resolver), config.scan_interval());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let scan_handle = tokio::spawn(scan_loop.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        logger.clone(),
        resolver,
        latest_scan,
    ));

    health_registry.set_ready(true).await;

    let mut api_shutdown = shutdown_tx.subscribe();
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
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
    let _ = shutdown_tx.send(());
    let _ = scan_handle.await;
    if !api_handle.is_finished() {
        let _ = api_handle.await;
    }

    Ok(())
}
