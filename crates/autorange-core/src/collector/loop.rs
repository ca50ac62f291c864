//! Sampling loop
//!
//! Periodically reads usage for every workload the supervisor is watching,
//! hands each sample to its watcher and collects the augmented outputs.

use super::UsageSampler;
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::observability::AutoRangeMetrics;
use crate::supervisor::Supervisor;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

/// Configuration for the sampling loop
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Base sampling interval (default: 1 second)
    pub interval: Duration,
    /// Maximum jitter added to the interval (default: 100 milliseconds)
    pub jitter: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Loop that samples every watched workload once per interval
pub struct SamplingLoop {
    sampler: Arc<dyn UsageSampler>,
    supervisor: Arc<Supervisor>,
    health: Option<HealthRegistry>,
    config: SamplingConfig,
    metrics: AutoRangeMetrics,
}

impl SamplingLoop {
    pub fn new(
        sampler: Arc<dyn UsageSampler>,
        supervisor: Arc<Supervisor>,
        config: SamplingConfig,
    ) -> Self {
        Self {
            sampler,
            supervisor,
            health: None,
            config,
            metrics: AutoRangeMetrics::new(),
        }
    }

    /// Run until the shutdown signal fires
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting sampling loop"
        );

        let mut ticker = interval(self.current_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let results = self.sample_all().await;
                    let elapsed = start.elapsed();

                    self.metrics.observe_sampling_latency(elapsed.as_secs_f64());
                    self.report_health(&results).await;

                    if results.sampled + results.errors > 0 {
                        debug!(
                            sampled = results.sampled,
                            dropped = results.dropped,
                            errors = results.errors,
                            outputs = results.outputs,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Sampling pass complete"
                        );
                    }

                    ticker = interval(self.current_interval());
                    // A fresh interval fires immediately; consume that tick
                    ticker.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down sampling loop");
                    break;
                }
            }
        }
    }

    fn current_interval(&self) -> Duration {
        let jitter_ms = rand_jitter(self.config.jitter.as_millis() as u64);
        self.config.interval + Duration::from_millis(jitter_ms)
    }

    /// Sample every workload once, then drain the watchers' outputs
    async fn sample_all(&self) -> SamplingResults {
        let mut results = SamplingResults::default();

        for workload in self.supervisor.workloads() {
            match self.sampler.sample(&workload).await {
                Ok(sample) => {
                    results.sampled += 1;
                    if !self.supervisor.offer(sample) {
                        results.dropped += 1;
                    }
                }
                Err(e) => {
                    results.errors += 1;
                    self.metrics.inc_sample_errors();
                    debug!(
                        workload_id = %workload.id,
                        error = %e,
                        "Failed to sample workload"
                    );
                }
            }
        }

        results.outputs = self.supervisor.poll_outputs();
        results
    }

    async fn report_health(&self, results: &SamplingResults) {
        let Some(health) = &self.health else {
            return;
        };
        health
            .update(
                components::SAMPLER,
                ComponentHealth::from_sampling(results.sampled, results.errors),
            )
            .await;
    }
}

/// Counts from one sampling pass
#[derive(Debug, Default)]
struct SamplingResults {
    sampled: usize,
    dropped: usize,
    errors: usize,
    outputs: usize,
}

/// Pseudo-random jitter between 0 and max_ms
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    now % max_ms
}

/// Builder for the sampling loop
pub struct SamplingLoopBuilder {
    sampler: Option<Arc<dyn UsageSampler>>,
    supervisor: Option<Arc<Supervisor>>,
    health: Option<HealthRegistry>,
    config: SamplingConfig,
}

impl SamplingLoopBuilder {
    pub fn new() -> Self {
        Self {
            sampler: None,
            supervisor: None,
            health: None,
            config: SamplingConfig::default(),
        }
    }

    pub fn sampler(mut self, sampler: Arc<dyn UsageSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Report sampler health after every pass
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<SamplingLoop> {
        let sampler = self
            .sampler
            .ok_or_else(|| anyhow::anyhow!("Sampler is required"))?;
        let supervisor = self
            .supervisor
            .ok_or_else(|| anyhow::anyhow!("Supervisor is required"))?;

        let mut sampling_loop = SamplingLoop::new(sampler, supervisor, self.config);
        sampling_loop.health = self.health;
        Ok(sampling_loop)
    }
}

impl Default for SamplingLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::RetryPolicy;
    use crate::collector::{async_trait, WorkloadRuntime};
    use crate::config::{AutoRangeSpec, MEMORY};
    use crate::health::ComponentStatus;
    use crate::models::{LimitUpdate, UsageSample, Workload, WorkloadSpec, WorkloadState};
    use crate::watcher::WatcherSettings;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockSampler {
        call_count: AtomicUsize,
        failing: Option<String>,
    }

    impl MockSampler {
        fn new() -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                failing: None,
            }
        }
    }

    #[async_trait]
    impl UsageSampler for MockSampler {
        async fn sample(&self, workload: &Workload) -> Result<UsageSample> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.failing.as_deref() == Some(workload.id.as_str()) {
                anyhow::bail!("cgroup vanished");
            }
            Ok(UsageSample {
                workload_id: workload.id.clone(),
                read_at: chrono::Utc::now(),
                memory_usage_bytes: 64_000,
                cpu_total_usage: 1_000,
                system_cpu_usage: 10_000,
                online_cpus: 1,
            })
        }
    }

    struct IdleRuntime;

    #[async_trait]
    impl WorkloadRuntime for IdleRuntime {
        async fn state(&self, _workload: &Workload) -> Result<WorkloadState> {
            Ok(WorkloadState::Running)
        }

        async fn update_resources(&self, _workload: &Workload, _update: &LimitUpdate) -> Result<()> {
            Ok(())
        }
    }

    fn supervisor_with(ids: &[&str]) -> Arc<Supervisor> {
        // Long tick rate so watchers never consume during the test
        let settings = WatcherSettings {
            tick_rate: Duration::from_secs(3600),
            capacity: 4,
            retry: RetryPolicy::default(),
            node_name: "test-node".to_string(),
        };
        let supervisor = Arc::new(Supervisor::new(Arc::new(IdleRuntime), settings));
        for id in ids {
            let mut autorange = AutoRangeSpec::new();
            autorange.insert(MEMORY.to_string(), BTreeMap::new());
            supervisor
                .attach(WorkloadSpec {
                    workload: Workload {
                        id: id.to_string(),
                        name: id.to_string(),
                        service: None,
                        cgroup_path: format!("/{}", id),
                    },
                    autorange,
                })
                .unwrap();
        }
        supervisor
    }

    #[test]
    fn test_sampling_config_default() {
        let config = SamplingConfig::default();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.jitter, Duration::from_millis(100));
    }

    #[test]
    fn test_rand_jitter() {
        assert!(rand_jitter(1000) < 1000);
        assert_eq!(rand_jitter(0), 0);
    }

    #[tokio::test]
    async fn test_builder_requires_sampler() {
        let result = SamplingLoopBuilder::new()
            .supervisor(supervisor_with(&[]))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sample_all_empty_supervisor() {
        let sampler = Arc::new(MockSampler::new());
        let sampling_loop = SamplingLoopBuilder::new()
            .sampler(sampler.clone())
            .supervisor(supervisor_with(&[]))
            .interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let results = sampling_loop.sample_all().await;
        assert_eq!(results.sampled, 0);
        assert_eq!(results.errors, 0);
        assert_eq!(sampler.call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sample_all_offers_and_drops() {
        let sampler = Arc::new(MockSampler::new());
        let sampling_loop = SamplingLoop::new(
            sampler.clone(),
            supervisor_with(&["w1", "w2"]),
            SamplingConfig::default(),
        );

        let first = sampling_loop.sample_all().await;
        assert_eq!(first.sampled, 2);
        assert_eq!(first.dropped, 0);

        // Watchers have not consumed yet, so the single-slot mailboxes are full
        let second = sampling_loop.sample_all().await;
        assert_eq!(second.sampled, 2);
        assert_eq!(second.dropped, 2);
        assert_eq!(sampler.call_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_sampling_errors_degrade_health() {
        let sampler = Arc::new(MockSampler {
            call_count: AtomicUsize::new(0),
            failing: Some("w2".to_string()),
        });
        let health = HealthRegistry::new();
        let sampling_loop = SamplingLoopBuilder::new()
            .sampler(sampler)
            .supervisor(supervisor_with(&["w1", "w2"]))
            .health(health.clone())
            .build()
            .unwrap();

        let results = sampling_loop.sample_all().await;
        assert_eq!(results.errors, 1);
        sampling_loop.report_health(&results).await;

        let report = health.health().await;
        assert_eq!(
            report.components[components::SAMPLER].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sampling_loop = SamplingLoop::new(
            Arc::new(MockSampler::new()),
            supervisor_with(&[]),
            SamplingConfig {
                interval: Duration::from_millis(5),
                jitter: Duration::ZERO,
            },
        );
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let task = tokio::spawn(sampling_loop.run(rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
