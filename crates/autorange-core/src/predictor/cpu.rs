//! CPU share estimation
//!
//! Turns successive cumulative CPU counters into an instantaneous
//! percentage, then locks in a stable value through two stages of rolling
//! averages: per window, then over the window averages themselves.

use crate::models::UsageSample;
use crate::observer::CpuSeries;
use crate::series::BoundedSeries;
use serde::Serialize;
use tracing::debug;

/// Values committed once the CPU prediction converges
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuEstimate {
    pub percent_opti: f64,
    pub usage_opti: f64,
}

/// CPU percentage between two cumulative snapshots, scaled by core count.
///
/// Returns NaN when the system counter did not move.
pub fn cpu_percent(total: u64, prev_total: u64, system: u64, prev_system: u64, cores: u32) -> f64 {
    let delta_usage = total as f64 - prev_total as f64;
    let delta_system = system as f64 - prev_system as f64;
    if delta_system == 0.0 {
        return f64::NAN;
    }
    (delta_usage / delta_system) * cores as f64 * 100.0
}

/// Mean of the series, skipping NaN entries. Zero when nothing is left.
pub fn average_float(series: &BoundedSeries<f64>) -> f64 {
    let (total, count) = series
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(total, count), v| (total + v, count + 1));
    if count == 0 {
        return 0.0;
    }
    total / count as f64
}

/// Convert a committed CPU percentage into a cpuset string and core count.
///
/// `1 + floor(percent / 100)` consecutive cores starting at 0.
pub fn cpu_usage_to_config(percent: f64) -> Option<(String, u32)> {
    if percent.is_nan() || percent <= 0.0 {
        return None;
    }
    let cores = 1 + (percent / 100.0) as u32;
    let cpuset = (0..cores)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    Some((cpuset, cores))
}

/// Stateful CPU estimator driven one tick at a time
#[derive(Debug, Clone)]
pub struct CpuPredictor {
    previous: Option<(u64, u64)>,
    turn: usize,
    window: usize,
}

impl CpuPredictor {
    pub fn new(window: usize) -> Self {
        Self {
            previous: None,
            turn: 0,
            window: window.max(1),
        }
    }

    /// Process one sample. The first sample only seeds the previous counters.
    ///
    /// Returns the committed estimate on the tick the prediction latches.
    pub fn step(&mut self, sample: &UsageSample, series: &mut CpuSeries) -> Option<CpuEstimate> {
        if series.prediction_done {
            return None;
        }

        let current = (sample.cpu_total_usage, sample.system_cpu_usage);
        let (prev_total, prev_system) = self.previous.replace(current)?;

        let percent = cpu_percent(
            sample.cpu_total_usage,
            prev_total,
            sample.system_cpu_usage,
            prev_system,
            sample.online_cpus,
        );
        let delta_usage = sample.cpu_total_usage as f64 - prev_total as f64;

        series.percent.push(percent);
        series.usage.push(delta_usage);

        self.turn += 1;
        if self.turn < self.window {
            return None;
        }
        self.turn = 0;

        series.predicted.percent.push(average_float(&series.percent));
        series.predicted.usage.push(average_float(&series.usage));

        debug!(
            windows = series.predicted.percent.len(),
            "CPU window closed"
        );

        if series.predicted.percent.len() < self.window {
            return None;
        }

        series.prediction_done = true;
        Some(CpuEstimate {
            percent_opti: average_float(&series.predicted.percent),
            usage_opti: average_float(&series.predicted.usage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(total: u64, system: u64, cores: u32) -> UsageSample {
        UsageSample {
            workload_id: "w1".to_string(),
            read_at: Utc::now(),
            memory_usage_bytes: 0,
            cpu_total_usage: total,
            system_cpu_usage: system,
            online_cpus: cores,
        }
    }

    fn active_series(capacity: usize) -> CpuSeries {
        let mut series = CpuSeries::new(capacity);
        series.prediction_done = false;
        series
    }

    #[test]
    fn test_cpu_percent_formula() {
        let percent = cpu_percent(100, 50, 1000, 500, 2);
        assert!((percent - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_percent_without_system_delta_is_nan() {
        assert!(cpu_percent(100, 50, 500, 500, 2).is_nan());
    }

    #[test]
    fn test_average_float_skips_nan() {
        let mut series = BoundedSeries::new(4);
        series.push(10.0);
        series.push(f64::NAN);
        series.push(20.0);
        assert_eq!(average_float(&series), 15.0);

        let mut only_nan = BoundedSeries::new(2);
        only_nan.push(f64::NAN);
        assert_eq!(average_float(&only_nan), 0.0);
        assert_eq!(average_float(&BoundedSeries::new(2)), 0.0);
    }

    #[test]
    fn test_cpu_usage_to_config() {
        assert_eq!(cpu_usage_to_config(0.0), None);
        assert_eq!(cpu_usage_to_config(f64::NAN), None);
        assert_eq!(cpu_usage_to_config(42.5), Some(("0".to_string(), 1)));
        assert_eq!(cpu_usage_to_config(250.0), Some(("0,1,2".to_string(), 3)));
    }

    #[test]
    fn test_first_sample_only_seeds() {
        let mut predictor = CpuPredictor::new(3);
        let mut series = active_series(3);

        assert!(predictor.step(&sample(100, 1000, 2), &mut series).is_none());
        assert!(series.percent.is_empty());

        predictor.step(&sample(150, 1500, 2), &mut series);
        assert_eq!(series.percent.to_vec(), vec![20.0]);
        assert_eq!(series.usage.to_vec(), vec![50.0]);
    }

    #[test]
    fn test_two_stage_average_commits() {
        let window = 3;
        let mut predictor = CpuPredictor::new(window);
        let mut series = active_series(window);

        let mut total = 0u64;
        let mut system = 0u64;
        predictor.step(&sample(total, system, 2), &mut series);

        let mut committed = None;
        for _ in 0..(window * window) {
            total += 50;
            system += 500;
            committed = predictor.step(&sample(total, system, 2), &mut series);
        }

        let estimate = committed.expect("prediction should commit after N windows");
        assert!((estimate.percent_opti - 20.0).abs() < 1e-9);
        assert!((estimate.usage_opti - 50.0).abs() < 1e-9);
        assert!(series.prediction_done);
        assert_eq!(series.predicted.percent.len(), window);

        // Latched: nothing more is recorded
        assert!(predictor
            .step(&sample(total + 1000, system + 1000, 2), &mut series)
            .is_none());
    }
}
