//! Observability infrastructure shared by the manager and the agent
//!
//! Provides:
//! - Prometheus metrics for the directory, distribution and process scans
//! - Event-tagged structured logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for process scan latency (in seconds)
const SCAN_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SchedMetricsInner> = OnceLock::new();

struct SchedMetricsInner {
    directory_cached_pods: IntGauge,
    directory_live_listings: IntCounter,
    strategies_created: IntCounter,
    intents_created: IntCounter,
    intents_sent: IntCounter,
    delivery_failures: IntCounter,
    intents_received: IntCounter,
    scan_latency_seconds: Histogram,
    pods_discovered: IntGauge,
    processes_skipped: IntCounter,
}

impl SchedMetricsInner {
    fn new() -> Self {
        Self {
            directory_cached_pods: register_int_gauge!(
                "sched_directory_cached_pods",
                "Pods currently held in the directory cache"
            )
            .expect("Failed to register directory_cached_pods"),

            directory_live_listings: register_int_counter!(
                "sched_directory_live_listings_total",
                "Queries answered by a live listing because the cache was not synced"
            )
            .expect("Failed to register directory_live_listings"),

            strategies_created: register_int_counter!(
                "sched_strategies_created_total",
                "Strategies persisted"
            )
            .expect("Failed to register strategies_created"),

            intents_created: register_int_counter!(
                "sched_intents_created_total",
                "Intents materialized from strategies"
            )
            .expect("Failed to register intents_created"),

            intents_sent: register_int_counter!(
                "sched_intents_sent_total",
                "Intents delivered to agents and recorded as sent"
            )
            .expect("Failed to register intents_sent"),

            delivery_failures: register_int_counter!(
                "sched_delivery_failures_total",
                "Intent batches an agent did not accept"
            )
            .expect("Failed to register delivery_failures"),

            intents_received: register_int_counter!(
                "sched_agent_intents_received_total",
                "Intents accepted by the agent intake endpoint"
            )
            .expect("Failed to register intents_received"),

            scan_latency_seconds: register_histogram!(
                "sched_agent_scan_latency_seconds",
                "Time spent scanning the process table",
                SCAN_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scan_latency_seconds"),

            pods_discovered: register_int_gauge!(
                "sched_agent_pods_discovered",
                "Pods with live processes found by the last scan"
            )
            .expect("Failed to register pods_discovered"),

            processes_skipped: register_int_counter!(
                "sched_agent_processes_skipped_total",
                "Processes skipped because their cgroup record could not be read"
            )
            .expect("Failed to register processes_skipped"),
        }
    }
}

/// Lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct SchedMetrics {
    _private: (),
}

impl Default for SchedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SchedMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SchedMetricsInner {
        GLOBAL_METRICS.get_or_init(SchedMetricsInner::new)
    }

    pub fn set_cached_pods(&self, count: i64) {
        self.inner().directory_cached_pods.set(count);
    }

    pub fn inc_live_listings(&self) {
        self.inner().directory_live_listings.inc();
    }

    pub fn inc_strategies_created(&self) {
        self.inner().strategies_created.inc();
    }

    pub fn add_intents_created(&self, count: u64) {
        self.inner().intents_created.inc_by(count);
    }

    pub fn add_intents_sent(&self, count: u64) {
        self.inner().intents_sent.inc_by(count);
    }

    pub fn inc_delivery_failures(&self) {
        self.inner().delivery_failures.inc();
    }

    pub fn add_intents_received(&self, count: u64) {
        self.inner().intents_received.inc_by(count);
    }

    pub fn observe_scan_latency(&self, duration_secs: f64) {
        self.inner().scan_latency_seconds.observe(duration_secs);
    }

    pub fn set_pods_discovered(&self, count: i64) {
        self.inner().pods_discovered.set(count);
    }

    pub fn inc_processes_skipped(&self) {
        self.inner().processes_skipped.inc();
    }
}

/// Render every registered metric in the Prometheus text format
pub fn render_metrics() -> anyhow::Result<Vec<u8>> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

/// Structured logger for lifecycle and distribution events
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "started",
            component = %self.component,
            version = %version,
            "Service started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "shutdown",
            component = %self.component,
            reason = %reason,
            "Service shutting down"
        );
    }

    /// Outcome of one strategy creation
    pub fn log_distribution(
        &self,
        strategy_id: &str,
        intents_created: usize,
        intents_sent: usize,
        unrouted: usize,
    ) {
        if intents_sent < intents_created {
            warn!(
                event = "strategy_distributed",
                component = %self.component,
                strategy_id = %strategy_id,
                intents_created,
                intents_sent,
                unrouted,
                "Strategy distributed with intents still pending"
            );
        } else {
            info!(
                event = "strategy_distributed",
                component = %self.component,
                strategy_id = %strategy_id,
                intents_created,
                intents_sent,
                "Strategy distributed"
            );
        }
    }

    /// Intake of one batch on the agent
    pub fn log_intents_received(&self, received: usize, with_processes: usize) {
        info!(
            event = "intents_received",
            component = %self.component,
            received,
            with_processes,
            "Intent batch accepted"
        );
    }
}
