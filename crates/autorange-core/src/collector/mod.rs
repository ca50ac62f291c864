//! Workload runtime integration
//!
//! The engine touches the outside world through two seams: a sampler that
//! reads usage snapshots for a workload, and a runtime that reports workload
//! liveness and applies resource limits. The cgroup v2 implementations read
//! and write the unified hierarchy directly.

mod cgroup_v2;
mod r#loop;

#[cfg(test)]
mod tests;

pub use cgroup_v2::{CgroupV2Runtime, CgroupV2Sampler};
pub use r#loop::{SamplingConfig, SamplingLoop, SamplingLoopBuilder};

use crate::models::{LimitUpdate, UsageSample, Workload, WorkloadState};
use anyhow::Result;

pub use async_trait::async_trait;

/// Produces usage snapshots for a workload
#[async_trait]
pub trait UsageSampler: Send + Sync {
    /// Read the current cumulative counters of a workload
    async fn sample(&self, workload: &Workload) -> Result<UsageSample>;
}

/// Liveness queries and the resource-update primitive
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Report whether the workload is running
    async fn state(&self, workload: &Workload) -> Result<WorkloadState>;

    /// Apply a limit set to the workload
    async fn update_resources(&self, workload: &Workload, update: &LimitUpdate) -> Result<()>;
}
