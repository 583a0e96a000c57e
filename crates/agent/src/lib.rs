//! Sched Agent - per-node scheduling intent receiver
//!
//! Runs as a DaemonSet on each node. Accepts intent batches from the
//! manager and keeps a live map of pods to their processes.

pub mod api;
pub mod config;
pub mod inbox;
