//! cgroup v2 sampling and limit application
//!
//! Reads from the unified cgroup v2 hierarchy:
//! - cpu.stat `usage_usec` for cumulative workload CPU time
//! - memory.current for current memory usage
//! - cgroup.procs for liveness
//!
//! and the host-wide `/proc/stat` aggregate for system CPU time. Limits are
//! written to memory.max, memory.low, memory.swap.max, cpuset.cpus and,
//! where the kernel exposes it, cpu.rt_runtime_us.

use super::{UsageSampler, WorkloadRuntime};
use crate::models::{LimitUpdate, UsageSample, Workload, WorkloadState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Kernel USER_HZ used by /proc/stat
const CLOCK_TICKS_PER_SEC: u64 = 100;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Resolve a workload's cgroup path below the hierarchy root
fn cgroup_dir(cgroup_root: &Path, workload: &Workload) -> PathBuf {
    cgroup_root.join(workload.cgroup_path.trim_start_matches('/'))
}

/// Sampler for the cgroup v2 unified hierarchy
pub struct CgroupV2Sampler {
    cgroup_root: PathBuf,
    proc_path: PathBuf,
}

impl CgroupV2Sampler {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_path: PathBuf::from("/proc"),
        }
    }

    /// Create sampler with custom proc path (for testing)
    pub fn with_proc_path(cgroup_root: impl Into<PathBuf>, proc_path: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_path: proc_path.into(),
        }
    }

    /// Parse cpu.stat contents, returning `usage_usec`
    pub fn parse_cpu_usage(content: &str) -> Option<u64> {
        content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("usage_usec"), Some(value)) => value.parse().ok(),
                    _ => None,
                }
            })
            .next()
    }

    /// Parse /proc/stat contents.
    ///
    /// Returns the host CPU time in nanoseconds summed over the aggregate
    /// `cpu` line, and the number of per-core `cpuN` lines.
    pub fn parse_proc_stat(content: &str) -> (u64, u32) {
        let mut system_ticks = 0u64;
        let mut online = 0u32;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("cpu") => {
                    system_ticks = parts
                        .take(8)
                        .filter_map(|v| v.parse::<u64>().ok())
                        .sum();
                }
                Some(name) if name.starts_with("cpu") => online += 1,
                _ => {}
            }
        }

        let system_ns = system_ticks.saturating_mul(NANOS_PER_SEC / CLOCK_TICKS_PER_SEC);
        (system_ns, online)
    }

    /// Read a single value from a cgroup file
    async fn read_cgroup_value(cgroup_path: &Path, filename: &str) -> Result<u64> {
        let file_path = cgroup_path.join(filename);
        let content = fs::read_to_string(&file_path)
            .await
            .with_context(|| format!("Failed to read {}", file_path.display()))?;

        content
            .trim()
            .parse()
            .with_context(|| format!("Failed to parse {} value", filename))
    }
}

#[async_trait]
impl UsageSampler for CgroupV2Sampler {
    async fn sample(&self, workload: &Workload) -> Result<UsageSample> {
        let cgroup_path = cgroup_dir(&self.cgroup_root, workload);
        if !cgroup_path.exists() {
            anyhow::bail!("Cgroup path not found for workload {}", workload.id);
        }

        // Missing counters fail the sample instead of reading as zero
        let cpu_stat_path = cgroup_path.join("cpu.stat");
        let cpu_stat = fs::read_to_string(&cpu_stat_path)
            .await
            .with_context(|| format!("Failed to read {}", cpu_stat_path.display()))?;
        let cpu_total_usage = Self::parse_cpu_usage(&cpu_stat)
            .with_context(|| format!("No usage_usec in {}", cpu_stat_path.display()))?
            .saturating_mul(1000);

        let memory_usage_bytes = Self::read_cgroup_value(&cgroup_path, "memory.current").await?;

        let proc_stat_path = self.proc_path.join("stat");
        let proc_stat = fs::read_to_string(&proc_stat_path)
            .await
            .with_context(|| format!("Failed to read {}", proc_stat_path.display()))?;
        let (system_cpu_usage, online_cpus) = Self::parse_proc_stat(&proc_stat);

        Ok(UsageSample {
            workload_id: workload.id.clone(),
            read_at: chrono::Utc::now(),
            memory_usage_bytes,
            cpu_total_usage,
            system_cpu_usage,
            online_cpus,
        })
    }
}

/// Liveness checks and limit application through cgroup v2 files
pub struct CgroupV2Runtime {
    cgroup_root: PathBuf,
}

impl CgroupV2Runtime {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
        }
    }

    /// cgroup v2 spells unlimited as "max"
    fn format_limit(value: i64) -> String {
        if value < 0 {
            "max".to_string()
        } else {
            value.to_string()
        }
    }

    async fn write_control(dir: &Path, filename: &str, value: &str) -> Result<()> {
        let path = dir.join(filename);
        fs::write(&path, value)
            .await
            .with_context(|| format!("Failed to write {} to {}", value, path.display()))
    }

    /// Control files and values an update writes, in write order
    fn planned_writes(
        dir: &Path,
        workload: &Workload,
        update: &LimitUpdate,
    ) -> Vec<(&'static str, String)> {
        let mut writes = Vec::new();
        if let Some(limit) = update.memory_limit_bytes {
            writes.push(("memory.max", Self::format_limit(limit)));
        }
        if let Some(reservation) = update.memory_reservation_bytes {
            writes.push(("memory.low", Self::format_limit(reservation)));
        }
        if let Some(swap) = update.memory_swap_bytes {
            writes.push(("memory.swap.max", Self::format_limit(swap)));
        }
        if let Some(cpus) = update.cpuset_cpus.as_deref() {
            writes.push(("cpuset.cpus", cpus.to_string()));
        }
        if let Some(runtime) = update.cpu_realtime_runtime_us {
            if dir.join("cpu.rt_runtime_us").exists() {
                writes.push(("cpu.rt_runtime_us", runtime.to_string()));
            } else {
                debug!(
                    workload_id = %workload.id,
                    "Real-time CPU budget not supported by this hierarchy, skipping"
                );
            }
        }
        writes
    }

    /// Write back previously read control values, newest first
    pub(super) async fn restore(dir: &Path, workload: &Workload, previous: &[(&str, String)]) {
        for (filename, value) in previous.iter().rev() {
            if let Err(e) = Self::write_control(dir, filename, value.trim_end()).await {
                warn!(
                    workload_id = %workload.id,
                    control = %filename,
                    error = %format!("{:#}", e),
                    "Failed to restore control value"
                );
            }
        }
    }
}

#[async_trait]
impl WorkloadRuntime for CgroupV2Runtime {
    async fn state(&self, workload: &Workload) -> Result<WorkloadState> {
        let dir = cgroup_dir(&self.cgroup_root, workload);
        if !dir.exists() {
            return Ok(WorkloadState::Dead);
        }

        let procs_path = dir.join("cgroup.procs");
        let procs = fs::read_to_string(&procs_path)
            .await
            .with_context(|| format!("Failed to read {}", procs_path.display()))?;

        if procs.trim().is_empty() {
            Ok(WorkloadState::Stopped)
        } else {
            Ok(WorkloadState::Running)
        }
    }

    async fn update_resources(&self, workload: &Workload, update: &LimitUpdate) -> Result<()> {
        let dir = cgroup_dir(&self.cgroup_root, workload);
        if !dir.exists() {
            anyhow::bail!("Cgroup path not found for workload {}", workload.id);
        }

        let writes = Self::planned_writes(&dir, workload, update);

        // Every control must be readable before anything is written
        let mut previous = Vec::with_capacity(writes.len());
        for (filename, _) in &writes {
            let path = dir.join(filename);
            let value = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            previous.push((*filename, value));
        }

        for (index, (filename, value)) in writes.iter().enumerate() {
            if let Err(e) = Self::write_control(&dir, filename, value).await {
                Self::restore(&dir, workload, &previous[..index]).await;
                return Err(e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_usage() {
        let content = r#"usage_usec 123456789
user_usec 100000000
system_usec 23456789
nr_periods 1000
nr_throttled 50
throttled_usec 5000000"#;

        assert_eq!(CgroupV2Sampler::parse_cpu_usage(content), Some(123456789));
        assert_eq!(CgroupV2Sampler::parse_cpu_usage(""), None);
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = r#"cpu  100 0 50 800 50 0 0 0 0 0
cpu0 50 0 25 400 25 0 0 0 0 0
cpu1 50 0 25 400 25 0 0 0 0 0
intr 12345
ctxt 67890
btime 1700000000"#;

        let (system_ns, online) = CgroupV2Sampler::parse_proc_stat(content);
        assert_eq!(system_ns, 1000 * 10_000_000);
        assert_eq!(online, 2);
    }

    #[test]
    fn test_format_limit() {
        assert_eq!(CgroupV2Runtime::format_limit(-1), "max");
        assert_eq!(CgroupV2Runtime::format_limit(6291456), "6291456");
    }
}
