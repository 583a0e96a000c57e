//! Intent Manager - scheduling strategy control plane
//!
//! Accepts scheduling strategies over HTTP, expands them into per-pod
//! intents and pushes those to the agent on each affected node.

pub mod api;
pub mod config;
