//! Registry of watchers on this node
//!
//! Keeps one watcher per workload and remembers, per service, the limits
//! that were successfully applied. A new instance of an already-learned
//! service gets those limits re-applied instead of learning again.

use crate::applier::LimitApplier;
use crate::collector::WorkloadRuntime;
use crate::config::{CPU, MEMORY};
use crate::models::{AugmentedSample, LimitUpdate, UsageSample, Workload, WorkloadSpec};
use crate::observability::AutoRangeMetrics;
use crate::watcher::{
    WatchOutcome, Watcher, WatcherError, WatcherHandle, WatcherPhase, WatcherReport,
    WatcherSettings,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `attach` did with a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachOutcome {
    /// A new watcher started learning
    Spawned,
    /// A paused watcher was resumed
    Resumed,
    /// The workload already has a running watcher
    AlreadyWatching,
    /// The watcher was paused by an operator and stays paused
    HeldPaused,
    /// Stored service limits are being applied to a new instance
    Reapplied,
    /// Stored service limits were already applied to this instance
    AlreadyApplied,
    /// No autorange category declared
    Unconfigured,
}

/// Who asked a watcher to pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseReason {
    /// The workload dropped out of discovery; re-attaching resumes it
    Detached,
    /// Paused through the API; only an explicit resume lifts it
    Operator,
}

struct ActiveWatcher {
    workload: Workload,
    handle: WatcherHandle,
    paused_by: Option<PauseReason>,
}

/// Limits learned for a service and the instances they were applied to
#[derive(Debug, Clone)]
struct FinishedService {
    update: LimitUpdate,
    report: WatcherReport,
    applied_to: Vec<String>,
}

pub struct Supervisor {
    runtime: Arc<dyn WorkloadRuntime>,
    settings: WatcherSettings,
    /// workload id -> running or paused watcher
    active: DashMap<String, ActiveWatcher>,
    /// service key -> applied limits
    finished: DashMap<String, FinishedService>,
    /// workload id -> last report of a watcher that has ended
    retired: DashMap<String, WatcherReport>,
    /// workload id -> most recent augmented sample
    latest: DashMap<String, AugmentedSample>,
    metrics: AutoRangeMetrics,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn WorkloadRuntime>, settings: WatcherSettings) -> Self {
        Self {
            runtime,
            settings,
            active: DashMap::new(),
            finished: DashMap::new(),
            retired: DashMap::new(),
            latest: DashMap::new(),
            metrics: AutoRangeMetrics::new(),
        }
    }

    pub fn settings(&self) -> &WatcherSettings {
        &self.settings
    }

    /// Start, resume or short-circuit learning for a workload
    pub fn attach(self: &Arc<Self>, spec: WorkloadSpec) -> Result<AttachOutcome, WatcherError> {
        let workload = spec.workload;

        if let Some(mut entry) = self.active.get_mut(&workload.id) {
            return Ok(match entry.paused_by {
                Some(PauseReason::Detached) => {
                    entry.handle.resume();
                    entry.paused_by = None;
                    info!(workload_id = %workload.id, "Resumed watcher");
                    AttachOutcome::Resumed
                }
                Some(PauseReason::Operator) => AttachOutcome::HeldPaused,
                None => AttachOutcome::AlreadyWatching,
            });
        }

        if let Some(mut service) = self.finished.get_mut(workload.service_key()) {
            if service.applied_to.contains(&workload.id) {
                return Ok(AttachOutcome::AlreadyApplied);
            }
            service.applied_to.push(workload.id.clone());
            let update = service.update.clone();
            let report = service.report.clone();
            drop(service);

            self.spawn_reapply(workload, update, report);
            return Ok(AttachOutcome::Reapplied);
        }

        if !spec.autorange.contains_key(MEMORY) && !spec.autorange.contains_key(CPU) {
            debug!(workload_id = %workload.id, "No autorange categories declared, skipping");
            return Ok(AttachOutcome::Unconfigured);
        }

        let (watcher, handle) = Watcher::new(
            workload.clone(),
            spec.autorange,
            self.settings.clone(),
            self.runtime.clone(),
        )?;

        self.retired.remove(&workload.id);
        self.active.insert(
            workload.id.clone(),
            ActiveWatcher {
                workload: workload.clone(),
                handle,
                paused_by: None,
            },
        );
        self.metrics.set_watchers_active(self.active.len() as i64);

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = watcher.run().await;
            supervisor.retire(&workload, outcome);
        });

        Ok(AttachOutcome::Spawned)
    }

    fn spawn_reapply(self: &Arc<Self>, workload: Workload, update: LimitUpdate, report: WatcherReport) {
        info!(
            workload_id = %workload.id,
            service = %workload.service_key(),
            "Service already learned, re-applying limits to new instance"
        );

        let supervisor = Arc::clone(self);
        let applier = LimitApplier::new(self.runtime.clone(), self.settings.retry);
        tokio::spawn(async move {
            match applier.apply(&workload, &update).await {
                Ok(_) => {
                    supervisor.metrics.inc_limits_applied();
                    supervisor.retired.insert(
                        workload.id.clone(),
                        WatcherReport {
                            workload,
                            updated_at: Utc::now(),
                            ..report
                        },
                    );
                }
                Err(e) => {
                    supervisor.metrics.inc_apply_failures();
                    warn!(error = %e, "Re-applying service limits failed");
                    if let Some(mut service) = supervisor.finished.get_mut(workload.service_key()) {
                        service.applied_to.retain(|id| id != &workload.id);
                    }
                }
            }
        });
    }

    /// Record how a watcher ended and drop it from the active set
    fn retire(&self, workload: &Workload, outcome: WatchOutcome) {
        let report = self
            .active
            .remove(&workload.id)
            .map(|(_, entry)| entry.handle.report());
        self.metrics.set_watchers_active(self.active.len() as i64);

        debug!(workload_id = %workload.id, outcome = ?outcome, "Watcher ended");

        let Some(report) = report else {
            return;
        };
        if let WatchOutcome::Applied(update) = outcome {
            self.finished.insert(
                workload.service_key().to_string(),
                FinishedService {
                    update,
                    report: report.clone(),
                    applied_to: vec![workload.id.clone()],
                },
            );
        }
        self.retired.insert(workload.id.clone(), report);
    }

    /// Pause a workload's watcher, keeping everything it learned. The next
    /// `attach` of the workload resumes it.
    pub fn detach(&self, workload_id: &str) -> bool {
        self.pause_for(workload_id, PauseReason::Detached)
    }

    /// Operator pause; survives re-attachment until `resume`
    pub fn pause(&self, workload_id: &str) -> bool {
        self.pause_for(workload_id, PauseReason::Operator)
    }

    fn pause_for(&self, workload_id: &str, reason: PauseReason) -> bool {
        let Some(mut entry) = self.active.get_mut(workload_id) else {
            return false;
        };
        // A detach never downgrades an operator pause
        if entry.paused_by != Some(PauseReason::Operator) {
            entry.paused_by = Some(reason);
        }
        entry.handle.pause();
        true
    }

    pub fn resume(&self, workload_id: &str) -> bool {
        let Some(mut entry) = self.active.get_mut(workload_id) else {
            return false;
        };
        entry.paused_by = None;
        entry.handle.resume();
        true
    }

    /// Hand a sample to its watcher. Returns false when there is no watcher
    /// or its mailbox still holds an unread sample.
    pub fn offer(&self, sample: UsageSample) -> bool {
        let Some(entry) = self.active.get(&sample.workload_id) else {
            return false;
        };
        let accepted = entry.handle.offer(sample);
        if !accepted {
            self.metrics.inc_samples_dropped();
        }
        accepted
    }

    /// Collect the newest augmented sample of every watcher. Returns how
    /// many watchers had one waiting.
    pub fn poll_outputs(&self) -> usize {
        let mut received = 0;
        for mut entry in self.active.iter_mut() {
            if let Some(sample) = entry.handle.try_latest() {
                self.latest.insert(entry.key().clone(), sample);
                received += 1;
            }
        }
        received
    }

    pub fn latest(&self, workload_id: &str) -> Option<AugmentedSample> {
        self.latest.get(workload_id).map(|r| r.clone())
    }

    /// Workloads that currently want samples
    pub fn workloads(&self) -> Vec<Workload> {
        self.active
            .iter()
            .filter(|entry| !entry.handle.is_paused())
            .map(|entry| entry.workload.clone())
            .collect()
    }

    pub fn report(&self, workload_id: &str) -> Option<WatcherReport> {
        if let Some(entry) = self.active.get(workload_id) {
            return Some(entry.handle.report());
        }
        self.retired.get(workload_id).map(|r| r.clone())
    }

    /// Reports of every known watcher, active or ended, ordered by workload id
    pub fn summaries(&self) -> Vec<WatcherReport> {
        let mut reports: Vec<WatcherReport> = self
            .active
            .iter()
            .map(|entry| entry.handle.report())
            .chain(self.retired.iter().map(|r| r.value().clone()))
            .collect();
        reports.sort_by(|a, b| a.workload.id.cmp(&b.workload.id));
        reports
    }

    /// Limits remembered for a service
    pub fn service_limits(&self, service: &str) -> Option<LimitUpdate> {
        self.finished.get(service).map(|s| s.update.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of active watchers that are learning, not paused
    pub fn learning_count(&self) -> usize {
        self.active
            .iter()
            .filter(|entry| entry.handle.report().phase != WatcherPhase::Paused)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::RetryPolicy;
    use crate::collector::async_trait;
    use crate::config::AutoRangeSpec;
    use crate::models::WorkloadState;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const WINDOW: usize = 2;

    #[derive(Default)]
    struct RecordingRuntime {
        updates: Mutex<Vec<(String, LimitUpdate)>>,
    }

    #[async_trait]
    impl WorkloadRuntime for RecordingRuntime {
        async fn state(&self, _workload: &Workload) -> anyhow::Result<WorkloadState> {
            Ok(WorkloadState::Running)
        }

        async fn update_resources(
            &self,
            workload: &Workload,
            update: &LimitUpdate,
        ) -> anyhow::Result<()> {
            self.updates
                .lock()
                .unwrap()
                .push((workload.id.clone(), update.clone()));
            Ok(())
        }
    }

    fn supervisor() -> (Arc<Supervisor>, Arc<RecordingRuntime>) {
        let runtime = Arc::new(RecordingRuntime::default());
        let settings = WatcherSettings {
            tick_rate: Duration::from_millis(1),
            capacity: WINDOW,
            retry: RetryPolicy {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
            node_name: "test-node".to_string(),
        };
        (Arc::new(Supervisor::new(runtime.clone(), settings)), runtime)
    }

    fn memory_spec(id: &str) -> WorkloadSpec {
        let mut autorange = AutoRangeSpec::new();
        autorange.insert(MEMORY.to_string(), BTreeMap::new());
        WorkloadSpec {
            workload: Workload {
                id: id.to_string(),
                name: format!("{}-name", id),
                service: Some("db".to_string()),
                cgroup_path: format!("/{}", id),
            },
            autorange,
        }
    }

    fn sample(id: &str) -> UsageSample {
        UsageSample {
            workload_id: id.to_string(),
            read_at: Utc::now(),
            memory_usage_bytes: 80_000,
            cpu_total_usage: 0,
            system_cpu_usage: 0,
            online_cpus: 1,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_attach_twice_does_not_respawn() {
        let (supervisor, _) = supervisor();

        assert_eq!(
            supervisor.attach(memory_spec("a")).unwrap(),
            AttachOutcome::Spawned
        );
        assert_eq!(
            supervisor.attach(memory_spec("a")).unwrap(),
            AttachOutcome::AlreadyWatching
        );
        assert_eq!(supervisor.active_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_then_attach_resumes() {
        let (supervisor, _) = supervisor();
        supervisor.attach(memory_spec("a")).unwrap();

        assert!(supervisor.detach("a"));
        assert!(supervisor.workloads().is_empty());

        assert_eq!(
            supervisor.attach(memory_spec("a")).unwrap(),
            AttachOutcome::Resumed
        );
        assert_eq!(supervisor.workloads().len(), 1);
    }

    #[tokio::test]
    async fn test_operator_pause_survives_rediscovery() {
        let (supervisor, _) = supervisor();
        supervisor.attach(memory_spec("a")).unwrap();

        assert!(supervisor.pause("a"));
        assert_eq!(
            supervisor.attach(memory_spec("a")).unwrap(),
            AttachOutcome::HeldPaused
        );
        assert!(supervisor.workloads().is_empty());

        // Dropping out of discovery keeps the operator's pause
        assert!(supervisor.detach("a"));
        assert_eq!(
            supervisor.attach(memory_spec("a")).unwrap(),
            AttachOutcome::HeldPaused
        );

        assert!(supervisor.resume("a"));
        assert_eq!(
            supervisor.attach(memory_spec("a")).unwrap(),
            AttachOutcome::AlreadyWatching
        );
        assert_eq!(supervisor.workloads().len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_workload_is_skipped() {
        let (supervisor, _) = supervisor();
        let mut spec = memory_spec("a");
        spec.autorange.clear();

        assert_eq!(supervisor.attach(spec).unwrap(), AttachOutcome::Unconfigured);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_offer_to_unknown_workload() {
        let (supervisor, _) = supervisor();
        assert!(!supervisor.offer(sample("ghost")));
        assert!(!supervisor.pause("ghost"));
        assert!(supervisor.report("ghost").is_none());
    }

    #[tokio::test]
    async fn test_learned_limits_reapplied_to_new_instance() {
        let (supervisor, runtime) = supervisor();
        supervisor.attach(memory_spec("db-1")).unwrap();

        // Keep offering until the watcher converges and applies
        for _ in 0..2000 {
            if supervisor.service_limits("db").is_some() {
                break;
            }
            supervisor.offer(sample("db-1"));
            supervisor.poll_outputs();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let limits = supervisor.service_limits("db").expect("service never converged");

        assert!(supervisor.latest("db-1").is_some());
        assert_eq!(supervisor.active_count(), 0);
        let report = supervisor.report("db-1").unwrap();
        assert_eq!(report.phase, WatcherPhase::Applied);
        assert!(report.autorange["memoryAR"].contains_key("sugmax"));

        assert_eq!(
            supervisor.attach(memory_spec("db-1")).unwrap(),
            AttachOutcome::AlreadyApplied
        );
        assert_eq!(
            supervisor.attach(memory_spec("db-2")).unwrap(),
            AttachOutcome::Reapplied
        );

        eventually(|| runtime.updates.lock().unwrap().len() == 2).await;
        let updates = runtime.updates.lock().unwrap().clone();
        assert_eq!(updates[0], ("db-1".to_string(), limits.clone()));
        assert_eq!(updates[1], ("db-2".to_string(), limits));

        eventually(|| supervisor.report("db-2").is_some()).await;
        let ids: Vec<String> = supervisor
            .summaries()
            .into_iter()
            .map(|r| r.workload.id)
            .collect();
        assert_eq!(ids, vec!["db-1", "db-2"]);
    }
}
