//! Autorange engine
//!
//! Learns memory and CPU limits for running workloads by watching their
//! usage, then applies the learned limits once the predictions converge.
//! This crate provides:
//! - Bounded time series and the memory/CPU predictors
//! - The per-workload watcher state machine and its supervisor
//! - cgroup v2 sampling and limit application
//! - Health checks and observability

pub mod applier;
pub mod collector;
pub mod config;
pub mod health;
pub mod models;
pub mod observability;
pub mod observer;
pub mod predictor;
pub mod series;
pub mod supervisor;
pub mod watcher;

pub use applier::{compute_limits, ApplyError, LimitApplier, RetryPolicy};
pub use config::{AutoRangeConfig, AutoRangeSpec, ConfigError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AutoRangeMetrics, StructuredLogger};
pub use observer::Observer;
pub use series::BoundedSeries;
pub use supervisor::{AttachOutcome, Supervisor};
pub use watcher::{
    WatchOutcome, Watcher, WatcherError, WatcherHandle, WatcherPhase, WatcherReport,
    WatcherSettings,
};
