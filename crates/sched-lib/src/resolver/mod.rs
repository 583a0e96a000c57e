//! Agent process resolver
//!
//! Maps pods to the OS processes running inside them by reading each
//! process's cgroup membership from the process table (`/proc`). Every scan
//! starts from scratch; nothing is carried between scans.

mod scan_loop;


pub use scan_loop::{ScanLoop, ScanResult};

use crate::models::{PodProcessSnapshot, Process};
use crate::observability::SchedMetrics;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Substring identifying the orchestrator's cgroup hierarchy
pub const DEFAULT_CGROUP_MARKER: &str = "kubepods";

/// Pod and container a cgroup path belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupIdentity {
    pub pod_uid: String,
    /// Path segment following the pod segment, if any
    pub container_id: Option<String>,
}

/// Parse one line of `/proc/<pid>/cgroup` (`id:controllers:path`).
///
/// Returns `None` when the line has fewer than three fields or its path
/// carries no pod segment.
pub fn parse_cgroup_line(line: &str, marker: &str) -> Option<CgroupIdentity> {
    let mut fields = line.splitn(3, ':');
    let path = fields.nth(2)?;
    parse_cgroup_path(path, marker)
}

/// Extract the pod identity from a cgroup hierarchy path.
///
/// Recognises the cgroupfs layout (`/kubepods/burstable/pod<uid>/<ctr>`) and
/// the systemd layout (`/kubepods.slice/.../kubepods-burstable-pod<uid>.slice/<ctr>`).
/// Slice units are only recognised under `marker`. Underscores in the UID
/// are normalised to hyphens.
pub fn parse_cgroup_path(path: &str, marker: &str) -> Option<CgroupIdentity> {
    let segments: Vec<&str> = path.split('/').collect();
    let slice_prefix = marker.strip_suffix(".slice").unwrap_or(marker);

    segments.iter().enumerate().find_map(|(i, segment)| {
        let raw_uid = pod_segment_uid(segment, slice_prefix)?;
        if raw_uid.is_empty() {
            return None;
        }
        Some(CgroupIdentity {
            pod_uid: raw_uid.replace('_', "-"),
            container_id: segments
                .get(i + 1)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        })
    })
}

fn pod_segment_uid<'a>(segment: &'a str, slice_prefix: &str) -> Option<&'a str> {
    if let Some(uid) = segment.strip_prefix("pod") {
        return Some(uid);
    }
    // systemd slice unit: <prefix>[-<qos>]-pod<uid>.slice
    let unit = segment.strip_suffix(".slice")?;
    if slice_prefix.is_empty() || !unit.starts_with(slice_prefix) {
        return None;
    }
    let start = unit.rfind("-pod")?;
    Some(&unit[start + "-pod".len()..])
}

/// Parent PID from the contents of `/proc/<pid>/stat`, 0 if unparseable.
///
/// The command field is parenthesised and may contain spaces, so the
/// fields are counted from the last `)`.
pub fn parse_parent_pid(stat: &str) -> u32 {
    let after_command = match stat.rfind(')') {
        Some(end) => stat[end + 1..].split_whitespace().nth(1),
        None => stat.split_whitespace().nth(3),
    };
    after_command.and_then(|p| p.parse().ok()).unwrap_or(0)
}

/// Scans a process table root for pod-owned processes
pub struct ProcessResolver {
    proc_root: PathBuf,
    marker: String,
    metrics: SchedMetrics,
}

impl ProcessResolver {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            marker: DEFAULT_CGROUP_MARKER.to_string(),
            metrics: SchedMetrics::new(),
        }
    }

    /// Use a different cgroup marker substring
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Scan the process table once.
    ///
    /// Fails only if the root cannot be listed. Processes whose cgroup
    /// record cannot be read are logged and skipped.
    pub async fn scan(&self) -> Result<Vec<PodProcessSnapshot>> {
        let start = Instant::now();
        let mut entries = fs::read_dir(&self.proc_root)
            .await
            .with_context(|| format!("Failed to read process table at {:?}", self.proc_root))?;

        let mut pods: BTreeMap<String, PodProcessSnapshot> = BTreeMap::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to read process table at {:?}", self.proc_root))?
        {
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                Some(pid) if pid > 0 => pid,
                _ => continue,
            };

            let identity = match self.identify(pid).await {
                Ok(Some(identity)) => identity,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pid, error = %e, "Skipping process with unreadable cgroup record");
                    self.metrics.inc_processes_skipped();
                    continue;
                }
            };

            let process = self.read_process(pid).await;
            let snapshot = pods
                .entry(identity.pod_uid.clone())
                .or_insert_with(|| PodProcessSnapshot {
                    pod_uid: identity.pod_uid,
                    container_id: None,
                    processes: Vec::new(),
                });
            if snapshot.container_id.is_none() {
                snapshot.container_id = identity.container_id;
            }
            snapshot.processes.push(process);
        }

        let mut snapshots: Vec<PodProcessSnapshot> = pods.into_values().collect();
        for snapshot in &mut snapshots {
            snapshot.processes.sort_by_key(|p| p.pid);
        }

        self.metrics
            .observe_scan_latency(start.elapsed().as_secs_f64());
        self.metrics.set_pods_discovered(snapshots.len() as i64);
        debug!(
            pods = snapshots.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Process table scan complete"
        );
        Ok(snapshots)
    }

    /// First relevant cgroup line that names a pod
    async fn identify(&self, pid: u32) -> Result<Option<CgroupIdentity>> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;

        Ok(content
            .lines()
            .filter(|line| line.contains(&self.marker))
            .find_map(|line| parse_cgroup_line(line, &self.marker)))
    }

    /// Command name and parent PID; missing records leave zero values
    async fn read_process(&self, pid: u32) -> Process {
        let dir = self.proc_root.join(pid.to_string());

        let command = fs::read_to_string(dir.join("comm"))
            .await
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        let parent_pid = fs::read_to_string(dir.join("stat"))
            .await
            .map(|s| parse_parent_pid(&s))
            .unwrap_or(0);

        Process {
            pid,
            command,
            parent_pid,
        }
    }
}
