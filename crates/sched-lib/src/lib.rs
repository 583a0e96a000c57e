//! Scheduling intent control plane library
//!
//! This crate provides the core functionality for:
//! - Pod and agent discovery through a watch-fed cluster directory
//! - Turning scheduling strategies into per-pod intents and delivering them
//! - Resolving pod-owned processes on a node from cgroup membership
//! - Health checks and observability

pub mod directory;
pub mod distribution;
pub mod health;
pub mod models;
pub mod observability;
pub mod resolver;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SchedMetrics, StructuredLogger};
