//! Per-workload learning loop
//!
//! A watcher owns everything it learns about one workload: the observer
//! series, the predictors and the activated configuration. It is driven by a
//! timer; each tick it waits for either a fresh sample or a control change,
//! checks that the workload is still running, advances every active
//! predictor and publishes an augmented copy of the sample. Once every
//! active category has converged it applies the learned limits and stops.
//!
//! ```text
//! Idle -> Sampling -> Converged -> Applied
//!            ^  |          \-> ApplyFailed
//!            |  v
//!           Paused          Sampling -> Exited (workload not running)
//! ```

mod handle;

pub use handle::WatcherHandle;

use crate::applier::{compute_limits, ApplyError, LimitApplier, RetryPolicy};
use crate::collector::WorkloadRuntime;
use crate::config::{AutoRangeConfig, AutoRangeSpec, ConfigError, CPU, MEMORY};
use crate::models::{AugmentedSample, LimitUpdate, UsageSample, Workload, WorkloadState};
use crate::observability::{AutoRangeMetrics, StructuredLogger};
use crate::observer::Observer;
use crate::predictor::{CpuPredictor, MemoryPredictor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Default tick period
pub const DEFAULT_TICK_RATE: Duration = Duration::from_secs(1);

/// Default window size and series capacity
pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("series capacity must be at least 1")]
    ZeroCapacity,
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub tick_rate: Duration,
    /// Window length N and capacity of every series
    pub capacity: usize,
    pub retry: RetryPolicy,
    pub node_name: String,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            capacity: DEFAULT_CAPACITY,
            retry: RetryPolicy::default(),
            node_name: "local".to_string(),
        }
    }
}

/// Requested run state, set through the handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherPhase {
    Idle,
    Sampling,
    Paused,
    Converged,
    Applied,
    ApplyFailed,
    Exited,
}

impl WatcherPhase {
    /// True once the watcher task has ended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WatcherPhase::Applied | WatcherPhase::ApplyFailed | WatcherPhase::Exited
        )
    }
}

/// Status snapshot published after every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherReport {
    pub workload: Workload,
    pub phase: WatcherPhase,
    pub ticks: u64,
    pub memory_windows: usize,
    pub cpu_windows: usize,
    pub memory_done: bool,
    pub cpu_done: bool,
    pub autorange: AutoRangeSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<LimitUpdate>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one synchronous tick
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Updated(AugmentedSample),
    /// Every active category has converged; limits should be applied
    Converged,
}

/// Why a watcher task ended
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    Applied(LimitUpdate),
    ApplyFailed(String),
    WorkloadExited(WorkloadState),
    /// Every handle was dropped
    Detached,
}

pub struct Watcher {
    workload: Workload,
    config: AutoRangeConfig,
    observer: Observer,
    memory: Option<MemoryPredictor>,
    cpu: Option<CpuPredictor>,
    settings: WatcherSettings,
    started: bool,
    finished: bool,
    ticks: u64,
    applied: Option<LimitUpdate>,
    runtime: Arc<dyn WorkloadRuntime>,
    applier: LimitApplier,
    input: mpsc::Receiver<UsageSample>,
    output: mpsc::Sender<AugmentedSample>,
    control: watch::Receiver<RunState>,
    report: watch::Sender<WatcherReport>,
    metrics: AutoRangeMetrics,
    logger: StructuredLogger,
}

impl Watcher {
    /// Activate `spec` for `workload` and wire up the mailboxes
    pub fn new(
        workload: Workload,
        spec: AutoRangeSpec,
        settings: WatcherSettings,
        runtime: Arc<dyn WorkloadRuntime>,
    ) -> Result<(Self, WatcherHandle), WatcherError> {
        if settings.capacity == 0 {
            return Err(WatcherError::ZeroCapacity);
        }
        let config = AutoRangeConfig::activate(spec)?;

        let window = settings.capacity;
        let observer = Observer::new(window, config.memory().is_some(), config.cpu().is_some());
        let memory = config.memory().map(|b| MemoryPredictor::new(b, window));
        let cpu = config.cpu().map(|_| CpuPredictor::new(window));

        let (input_tx, input_rx) = mpsc::channel(1);
        let (output_tx, output_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = watch::channel(RunState::Running);

        let initial = WatcherReport {
            workload: workload.clone(),
            phase: WatcherPhase::Idle,
            ticks: 0,
            memory_windows: 0,
            cpu_windows: 0,
            memory_done: observer.memory.prediction_done,
            cpu_done: observer.cpu.prediction_done,
            autorange: config.snapshot(),
            applied: None,
            updated_at: Utc::now(),
        };
        let (report_tx, report_rx) = watch::channel(initial);

        let handle = WatcherHandle::new(input_tx, output_rx, control_tx, report_rx);
        let applier = LimitApplier::new(runtime.clone(), settings.retry);
        let logger = StructuredLogger::new(settings.node_name.clone());

        let watcher = Self {
            workload,
            config,
            observer,
            memory,
            cpu,
            settings,
            started: false,
            finished: false,
            ticks: 0,
            applied: None,
            runtime,
            applier,
            input: input_rx,
            output: output_tx,
            control: control_rx,
            report: report_tx,
            metrics: AutoRangeMetrics::new(),
            logger,
        };

        Ok((watcher, handle))
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn config(&self) -> &AutoRangeConfig {
        &self.config
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// True only after limits were successfully applied
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process one sample.
    ///
    /// The first sample seeds the predictors. Afterwards, once every active
    /// category has converged, the tick reports convergence instead of
    /// processing the sample.
    pub fn process(&mut self, sample: &UsageSample) -> Tick {
        if !self.started {
            self.start(sample);
        } else if self.observer.is_converged() && !self.finished {
            return Tick::Converged;
        }

        self.ticks += 1;

        if let Some(predictor) = self.memory.as_mut() {
            if let Some(estimate) =
                predictor.step(sample.memory_usage_bytes, &mut self.observer.memory)
            {
                self.config.record_memory(estimate);
                self.metrics.inc_windows_closed(MEMORY);
                self.logger.log_window_closed(
                    &self.workload.id,
                    MEMORY,
                    self.observer.memory.predicted.min.len(),
                );
            }
        }

        if let Some(predictor) = self.cpu.as_mut() {
            let windows = self.observer.cpu.predicted.percent.len();
            if let Some(estimate) = predictor.step(sample, &mut self.observer.cpu) {
                self.config.record_cpu(estimate);
            }
            let closed = self.observer.cpu.predicted.percent.len();
            if closed != windows {
                self.metrics.inc_windows_closed(CPU);
                self.logger.log_window_closed(&self.workload.id, CPU, closed);
            }
        }

        Tick::Updated(AugmentedSample {
            sample: sample.clone(),
            autorange: self.config.snapshot(),
        })
    }

    fn start(&mut self, sample: &UsageSample) {
        if let Some(predictor) = self.memory.as_mut() {
            predictor.seed(sample.memory_usage_bytes);
        }
        if let Some(seed) = self
            .config
            .cpu()
            .and_then(|baseline| baseline.seed_percent(sample.online_cpus))
        {
            self.observer.cpu.percent.push(seed);
        }
        self.observer.mark_started(sample.read_at);
        self.started = true;
    }

    /// Drive the watcher until it applies limits, its workload exits or
    /// every handle is dropped.
    pub async fn run(mut self) -> WatchOutcome {
        let mut categories = Vec::new();
        if self.memory.is_some() {
            categories.push(MEMORY);
        }
        if self.cpu.is_some() {
            categories.push(CPU);
        }
        self.logger
            .log_watch_started(&self.workload.id, self.workload.service_key(), &categories);
        self.publish(WatcherPhase::Sampling);

        // Give the sample source one period to deliver a first reading
        tokio::time::sleep(self.settings.tick_rate).await;

        let mut ticker = interval(self.settings.tick_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if *self.control.borrow_and_update() == RunState::Paused {
                debug!(workload_id = %self.workload.id, "Watcher paused");
                self.publish(WatcherPhase::Paused);
                if !self.wait_for_resume().await {
                    return WatchOutcome::Detached;
                }
                debug!(workload_id = %self.workload.id, "Watcher resumed");
                self.publish(WatcherPhase::Sampling);
                continue;
            }

            let sample = tokio::select! {
                received = self.input.recv() => match received {
                    Some(sample) => sample,
                    None => return WatchOutcome::Detached,
                },
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return WatchOutcome::Detached;
                    }
                    continue;
                }
            };

            let state = match self.runtime.state(&self.workload).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        workload_id = %self.workload.id,
                        error = %e,
                        "Health query failed, treating workload as dead"
                    );
                    WorkloadState::Dead
                }
            };
            if !state.is_healthy() {
                self.metrics.inc_workloads_exited();
                self.logger
                    .log_workload_exited(&self.workload.id, state.as_str());
                self.publish(WatcherPhase::Exited);
                return WatchOutcome::WorkloadExited(state);
            }

            match self.process(&sample) {
                Tick::Updated(augmented) => {
                    self.metrics.inc_samples_processed();
                    if self.output.try_send(augmented).is_err() {
                        debug!(
                            workload_id = %self.workload.id,
                            "Output not consumed, dropping augmented sample"
                        );
                    }
                    self.publish(WatcherPhase::Sampling);
                }
                Tick::Converged => return self.apply().await,
            }
        }
    }

    /// Block until the run state returns to `Running`. False when the
    /// controlling handle is gone.
    async fn wait_for_resume(&mut self) -> bool {
        loop {
            if self.control.changed().await.is_err() {
                return false;
            }
            if *self.control.borrow_and_update() == RunState::Running {
                return true;
            }
        }
    }

    async fn apply(&mut self) -> WatchOutcome {
        self.logger
            .log_prediction_converged(&self.workload.id, self.ticks);
        self.publish(WatcherPhase::Converged);

        let update = compute_limits(&mut self.config, &self.observer);
        let started = Instant::now();
        let result = self.applier.apply(&self.workload, &update).await;
        self.metrics
            .observe_apply_latency(started.elapsed().as_secs_f64());

        match result {
            Ok(attempts) => {
                self.finished = true;
                self.applied = Some(update.clone());
                self.metrics.inc_limits_applied();
                self.logger
                    .log_limits_applied(&self.workload.id, &update, attempts);
                self.publish(WatcherPhase::Applied);
                WatchOutcome::Applied(update)
            }
            Err(e) => {
                let ApplyError::Exhausted { attempts, .. } = &e;
                self.metrics.inc_apply_failures();
                self.logger
                    .log_apply_failed(&self.workload.id, *attempts, &e.to_string());
                self.publish(WatcherPhase::ApplyFailed);
                WatchOutcome::ApplyFailed(e.to_string())
            }
        }
    }

    fn publish(&self, phase: WatcherPhase) {
        self.report.send_replace(WatcherReport {
            workload: self.workload.clone(),
            phase,
            ticks: self.ticks,
            memory_windows: self.observer.memory.predicted.min.len(),
            cpu_windows: self.observer.cpu.predicted.percent.len(),
            memory_done: self.observer.memory.prediction_done,
            cpu_done: self.observer.cpu.prediction_done,
            autorange: self.config.snapshot(),
            applied: self.applied.clone(),
            updated_at: Utc::now(),
        });
    }
}
