//! Core data models for the autorange engine

use crate::config::AutoRangeSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One usage snapshot of a watched workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub workload_id: String,
    pub read_at: DateTime<Utc>,
    pub memory_usage_bytes: u64,
    /// Cumulative CPU time used by the workload, in nanoseconds
    pub cpu_total_usage: u64,
    /// Cumulative CPU time of the whole host, in nanoseconds
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
}

/// A sample carrying the current autorange configuration and estimates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentedSample {
    #[serde(flatten)]
    pub sample: UsageSample,
    pub autorange: AutoRangeSpec,
}

/// The workload a watcher observes and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    /// Service the workload belongs to; instances of a service share limits
    #[serde(default)]
    pub service: Option<String>,
    pub cgroup_path: String,
}

impl Workload {
    /// Key used to remember applied limits across instances
    pub fn service_key(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.id)
    }
}

/// A workload together with its autorange declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    #[serde(flatten)]
    pub workload: Workload,
    #[serde(default)]
    pub autorange: AutoRangeSpec,
}

/// Liveness of a workload as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    Running,
    Stopped,
    Dead,
}

impl WorkloadState {
    /// True when samples from the workload can be trusted
    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkloadState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadState::Running => "running",
            WorkloadState::Stopped => "stopped",
            WorkloadState::Dead => "dead",
        }
    }
}

/// Limits committed to the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reservation_bytes: Option<i64>,
    /// `-1` means unlimited swap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_realtime_runtime_us: Option<i64>,
}

impl LimitUpdate {
    pub fn is_empty(&self) -> bool {
        self == &LimitUpdate::default()
    }
}
