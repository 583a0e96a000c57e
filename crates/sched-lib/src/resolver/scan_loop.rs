//! Periodic process table scan
//!
//! Re-runs the resolver on a fixed interval and publishes the latest result
//! through a watch channel.

use super::ProcessResolver;
use crate::models::PodProcessSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// One published scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    /// `None` until the first scan completes
    pub scanned_at: Option<DateTime<Utc>>,
    pub pods: Vec<PodProcessSnapshot>,
}

impl ScanResult {
    fn empty() -> Self {
        Self {
            scanned_at: None,
            pods: Vec::new(),
        }
    }
}

pub struct ScanLoop {
    resolver: Arc<ProcessResolver>,
    interval: Duration,
    latest: watch::Sender<Arc<ScanResult>>,
}

impl ScanLoop {
    pub fn new(
        resolver: Arc<ProcessResolver>,
        interval: Duration,
    ) -> (Self, watch::Receiver<Arc<ScanResult>>) {
        let (latest, latest_rx) = watch::channel(Arc::new(ScanResult::empty()));
        (
            Self {
                resolver,
                interval,
                latest,
            },
            latest_rx,
        )
    }

    /// Scan until `shutdown` fires. The first scan runs immediately.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            proc_root = ?self.resolver.proc_root(),
            "Starting process scan loop"
        );

        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan_once().await,
                _ = shutdown.recv() => {
                    info!("Shutting down process scan loop");
                    break;
                }
            }
        }
    }

    /// Scan and publish; a failed scan keeps the previous result
    pub async fn scan_once(&self) {
        match self.resolver.scan().await {
            Ok(pods) => {
                debug!(pods = pods.len(), "Publishing process scan");
                self.latest.send_replace(Arc::new(ScanResult {
                    scanned_at: Some(Utc::now()),
                    pods,
                }));
            }
            Err(e) => warn!(error = %e, "Process scan failed"),
        }
    }
}
