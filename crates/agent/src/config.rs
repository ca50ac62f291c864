//! Agent configuration

use anyhow::{Context, Result};
use autorange_core::{RetryPolicy, WatcherSettings, WorkloadSpec};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Agent configuration, read from `AUTORANGE_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/watchers
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Mount point of the cgroup v2 hierarchy
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: String,

    #[serde(default = "default_proc_root")]
    pub proc_root: String,

    /// Sampling and watcher tick period in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Maximum random delay added to each sampling pass
    #[serde(default = "default_sampling_jitter_ms")]
    pub sampling_jitter_ms: u64,

    /// Window length and series capacity
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,

    /// JSON file listing the workloads to watch
    #[serde(default = "default_workloads_file")]
    pub workloads_file: String,

    /// How often the workloads file is re-read
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    #[serde(default = "default_apply_attempts")]
    pub apply_attempts: u32,

    #[serde(default = "default_apply_delay")]
    pub apply_delay_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_cgroup_root() -> String {
    "/sys/fs/cgroup".to_string()
}

fn default_proc_root() -> String {
    "/proc".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_sampling_jitter_ms() -> u64 {
    100
}

fn default_series_capacity() -> usize {
    10
}

fn default_workloads_file() -> String {
    "/etc/autorange/workloads.json".to_string()
}

fn default_discovery_interval() -> u64 {
    30
}

fn default_apply_attempts() -> u32 {
    10
}

fn default_apply_delay() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            cgroup_root: default_cgroup_root(),
            proc_root: default_proc_root(),
            tick_interval_ms: default_tick_interval_ms(),
            sampling_jitter_ms: default_sampling_jitter_ms(),
            series_capacity: default_series_capacity(),
            workloads_file: default_workloads_file(),
            discovery_interval_secs: default_discovery_interval(),
            apply_attempts: default_apply_attempts(),
            apply_delay_secs: default_apply_delay(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AUTORANGE").try_parsing(true))
            .build()?;

        config
            .try_deserialize()
            .context("Invalid AUTORANGE_* configuration")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            tick_rate: self.tick_interval(),
            capacity: self.series_capacity,
            retry: RetryPolicy {
                attempts: self.apply_attempts,
                delay: Duration::from_secs(self.apply_delay_secs),
            },
            node_name: self.node_name.clone(),
        }
    }
}

/// Read the workloads file. A missing file means nothing to watch yet.
pub fn load_workloads(path: impl AsRef<Path>) -> Result<Vec<WorkloadSpec>> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "Workloads file not found, watching nothing");
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse workloads in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.series_capacity, 10);

        let settings = config.watcher_settings();
        assert_eq!(settings.tick_rate, Duration::from_secs(1));
        assert_eq!(settings.retry, RetryPolicy::default());
    }

    #[test]
    fn test_load_workloads() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"[
                {
                    "id": "a1",
                    "name": "web-1",
                    "service": "web",
                    "cgroup_path": "/system.slice/web-1.scope",
                    "autorange": { "memory": { "threshold%": "15" } }
                },
                { "id": "b2", "name": "batch", "cgroup_path": "/batch" }
            ]"#,
        )
        .unwrap();

        let workloads = load_workloads(file.path()).unwrap();
        assert_eq!(workloads.len(), 2);
        assert_eq!(workloads[0].workload.service_key(), "web");
        assert!(workloads[1].autorange.is_empty());
    }

    #[test]
    fn test_missing_workloads_file_is_empty() {
        let workloads = load_workloads("/nonexistent/autorange/workloads.json").unwrap();
        assert!(workloads.is_empty());
    }

    #[test]
    fn test_malformed_workloads_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(load_workloads(file.path()).is_err());
    }
}
