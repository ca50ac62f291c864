//! Final limit computation and application
//!
//! Once every active category has converged, the learned values are turned
//! into a concrete limit set and pushed to the runtime. Application retries
//! at a fixed interval; exhausting the attempts leaves the workload
//! untouched and is reported to the caller.

use crate::collector::WorkloadRuntime;
use crate::config::AutoRangeConfig;
use crate::models::{LimitUpdate, Workload};
use crate::observer::Observer;
use crate::predictor::{cpu_usage_to_config, highest_of, lowest_of, percent, MIN_THRESHOLD};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const KIB: i64 = 1024;
pub const MIB: i64 = 1024 * KIB;

/// Smallest memory limit the runtime accepts
pub const MIN_ALLOWED_MEMORY_LIMIT: i64 = 5 * MIB;

/// Added on top of the floor when a limit has to be raised
const LIMIT_MARGIN: i64 = MIB;
const RESERVATION_MARGIN: i64 = 5 * MIB;

/// Swap value meaning "unlimited"
pub const UNLIMITED_SWAP: i64 = -1;

/// Default number of update attempts
pub const DEFAULT_APPLY_ATTEMPTS: u32 = 10;

/// Default pause between update attempts
pub const DEFAULT_APPLY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to apply limits to {workload_id} after {attempts} attempts: {last_error}")]
    Exhausted {
        workload_id: String,
        attempts: u32,
        last_error: String,
    },
}

/// Fixed-interval retry policy for the update primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_APPLY_ATTEMPTS,
            delay: DEFAULT_APPLY_DELAY,
        }
    }
}

/// Derive `(reservation, limit)` from the learned memory values.
///
/// The limit adds a double-threshold share of the highest observed usage to
/// the suggested maximum; the reservation sits between the suggested minimum
/// and the lowest observed usage. Values under the runtime floor are raised
/// to the floor plus a margin, and an inverted pair is swapped.
pub fn memory_limits(
    suggested_min: i64,
    suggested_max: i64,
    threshold: i64,
    lowest: u64,
    highest: u64,
) -> (i64, i64) {
    let threshold = threshold.max(MIN_THRESHOLD);
    let highest = i64::try_from(highest).unwrap_or(i64::MAX);
    let lowest = i64::try_from(lowest).unwrap_or(i64::MAX);

    let mut limit = suggested_max.saturating_add(percent(highest).saturating_mul(threshold * 2));
    if limit < MIN_ALLOWED_MEMORY_LIMIT {
        limit = MIN_ALLOWED_MEMORY_LIMIT + LIMIT_MARGIN;
    }

    let mut reservation = suggested_min.saturating_add(lowest) / 2;
    if reservation < MIN_ALLOWED_MEMORY_LIMIT {
        reservation = MIN_ALLOWED_MEMORY_LIMIT + RESERVATION_MARGIN;
    }

    if reservation > limit {
        std::mem::swap(&mut reservation, &mut limit);
    }
    (reservation, limit)
}

/// Build the limit set for every activated category and record the chosen
/// values back into the configuration's output categories.
pub fn compute_limits(config: &mut AutoRangeConfig, observer: &Observer) -> LimitUpdate {
    let mut update = LimitUpdate::default();

    if config.memory().is_some() {
        let (suggested_min, suggested_max, threshold) = config
            .memory_estimate()
            .map(|e| (e.nmin, e.nmax, e.opti))
            .unwrap_or((0, 0, 0));

        let (reservation, limit) = memory_limits(
            suggested_min,
            suggested_max,
            threshold,
            lowest_of(&observer.memory.lowest),
            highest_of(&observer.memory.highest),
        );

        update.memory_limit_bytes = Some(limit);
        update.memory_reservation_bytes = Some(reservation);
        update.memory_swap_bytes = Some(UNLIMITED_SWAP);
        config.record_memory_limits(reservation, limit);
    }

    if config.cpu().is_some() {
        let (percent_opti, usage_opti) = config
            .cpu_estimate()
            .map(|e| (e.percent_opti, e.usage_opti))
            .unwrap_or((0.0, 0.0));

        let runtime = usage_opti.round() as i64;
        let cpuset = cpu_usage_to_config(percent_opti);

        update.cpu_realtime_runtime_us = Some(runtime);
        config.record_cpu_limits(cpuset.as_ref().map(|(_, cores)| *cores), runtime);
        update.cpuset_cpus = cpuset.map(|(cpus, _)| cpus);
    }

    update
}

/// Commits limit sets through the runtime with bounded retry
#[derive(Clone)]
pub struct LimitApplier {
    runtime: Arc<dyn WorkloadRuntime>,
    policy: RetryPolicy,
}

impl LimitApplier {
    pub fn new(runtime: Arc<dyn WorkloadRuntime>, policy: RetryPolicy) -> Self {
        Self { runtime, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Apply `update` to `workload`, returning the attempt that succeeded
    pub async fn apply(&self, workload: &Workload, update: &LimitUpdate) -> Result<u32, ApplyError> {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.runtime.update_resources(workload, update).await {
                Ok(()) => {
                    info!(
                        workload_id = %workload.id,
                        workload = %workload.name,
                        service = %workload.service_key(),
                        attempt,
                        "Workload now has limits applied"
                    );
                    return Ok(attempt);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    if attempt < attempts {
                        warn!(
                            workload_id = %workload.id,
                            attempt,
                            error = %last_error,
                            retry_in_secs = self.policy.delay.as_secs(),
                            "Failed to apply limits, retrying"
                        );
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        error!(
            workload_id = %workload.id,
            attempts,
            error = %last_error,
            "Giving up on applying limits"
        );
        Err(ApplyError::Exhausted {
            workload_id: workload.id.clone(),
            attempts,
            last_error,
        })
    }
}
