//! Memory bracket estimation
//!
//! Keeps a `(min, max)` "box" around observed memory usage, widened or
//! narrowed every tick and weighted by a threshold safety margin. Every
//! window of ticks the box is averaged into a predicted value, biased toward
//! the window's extremes.
//!
//! Integer arithmetic truncates; sub-percent movements are dropped.

use crate::config::MemoryBaseline;
use crate::observer::MemorySeries;
use crate::series::BoundedSeries;
use serde::Serialize;
use tracing::debug;

/// Threshold floor applied to configured and committed margins
pub const MIN_THRESHOLD: i64 = 10;

/// Mean amplitude at or below which the series is considered stable
const STABLE_AMPLITUDE: u64 = 2;

/// Values published when a memory window closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryEstimate {
    pub nmin: i64,
    pub nmax: i64,
    pub opti: i64,
    pub usage: u64,
}

/// One hundredth of `value`, truncated
pub fn percent(value: i64) -> i64 {
    value / 100
}

/// Relative change from `from` to `to`, in whole percent.
///
/// A zero baseline yields zero instead of dividing by zero.
pub fn percentage_change(from: i64, to: i64) -> i64 {
    if from == 0 {
        return 0;
    }
    (((to - from) as f64 / from as f64) * 100.0) as i64
}

/// Truncating integer mean, zero for an empty series
pub fn average(series: &BoundedSeries<u64>) -> u64 {
    if series.is_empty() {
        return 0;
    }
    let total: u128 = series.iter().map(|v| *v as u128).sum();
    (total / series.len() as u128) as u64
}

/// Smallest value of the series, `1` when empty so it can divide safely
pub fn lowest_of(series: &BoundedSeries<u64>) -> u64 {
    series.iter().copied().min().unwrap_or(1)
}

/// Largest value of the series, `0` when empty
pub fn highest_of(series: &BoundedSeries<u64>) -> u64 {
    series.iter().copied().max().unwrap_or(0)
}

/// Move the bracket around a new usage sample.
///
/// Usage above the scaled bracket grows `min` by its relative distance;
/// usage below it snaps `min` just above usage. `max` is always rebuilt as
/// `min` plus the threshold margin. Otherwise the bracket is unchanged.
pub fn adjust_bracket(usage: u64, min: i64, max: i64, threshold: i64) -> (i64, i64) {
    let usage = i64::try_from(usage).unwrap_or(i64::MAX);
    let spread = percent(max - min);

    if usage > (min + spread).saturating_mul(threshold) {
        let distance = percentage_change(min, usage);
        let min = min.saturating_add(distance.saturating_mul(percent(min)));
        let max = min.saturating_add(threshold.saturating_mul(percent(min)));
        (min, max)
    } else if usage < (min - spread).saturating_mul(threshold) {
        let min = usage.saturating_add(threshold.saturating_mul(percent(usage)));
        let max = min.saturating_add(threshold.saturating_mul(percent(min)));
        (min, max)
    } else {
        (min, max)
    }
}

/// Fold a sample into the running `(lowest, highest)` pair
pub fn track_extremes(usage: u64, lowest: u64, highest: u64) -> (u64, u64) {
    (lowest.min(usage), highest.max(usage))
}

/// Weight every value by its closeness to the highest value of `reference`.
///
/// Weights are `1 / (highest / value)` with integer division, so they fall in
/// `(0, 1]`; a zero quotient clamps to `1.0`. A zero value ends generation,
/// and a zero reference yields no weights at all.
pub fn generate_weights(series: &BoundedSeries<u64>, reference: &BoundedSeries<u64>) -> Vec<f32> {
    let highest = highest_of(reference);
    if highest == 0 {
        return Vec::new();
    }

    series
        .iter()
        .take_while(|value| **value != 0)
        .map(|value| {
            let distance = (highest / value) as f32;
            let weight = 1.0 / distance;
            if weight.is_infinite() {
                1.0
            } else {
                weight
            }
        })
        .collect()
}

/// Mean of `value / weight` over every value that has a weight
pub fn weighted_average(series: &BoundedSeries<u64>, weights: &[f32]) -> i64 {
    let pairs = series.len().min(weights.len());
    if pairs == 0 {
        return 0;
    }

    let total: i64 = series
        .iter()
        .zip(weights)
        .map(|(value, weight)| (*value as f32 / weight) as i64)
        .fold(0i64, |acc, v| acc.saturating_add(v));
    total / pairs as i64
}

/// Memory learning ends when the predicted series is full, or past half
/// full with a stable mean amplitude.
pub fn check_memory_end_condition(len: usize, limit: usize, medium_amplitude: u64) -> bool {
    len >= limit || (len > limit / 2 && medium_amplitude <= STABLE_AMPLITUDE)
}

/// Stateful memory estimator driven one tick at a time
#[derive(Debug, Clone)]
pub struct MemoryPredictor {
    min: i64,
    max: i64,
    threshold: i64,
    lowest: u64,
    highest: u64,
    turn: usize,
    window: usize,
}

impl MemoryPredictor {
    /// Start from a configured baseline, closing a window every `window` ticks
    pub fn new(baseline: &MemoryBaseline, window: usize) -> Self {
        Self {
            min: baseline.min,
            max: baseline.max,
            threshold: baseline.threshold,
            lowest: 0,
            highest: 0,
            turn: 0,
            window: window.max(1),
        }
    }

    /// Seed the bracket and extremes from the first accepted sample. The
    /// configured baseline only supplies the threshold from here on.
    pub fn seed(&mut self, usage: u64) {
        self.lowest = usage;
        self.highest = 0;
        self.min = i64::try_from(usage).unwrap_or(i64::MAX);
        self.max = self
            .min
            .saturating_add(self.threshold.saturating_mul(percent(self.min)));
    }

    pub fn bracket(&self) -> (i64, i64) {
        (self.min, self.max)
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Running `(lowest, highest)` of the current window
    pub fn extremes(&self) -> (u64, u64) {
        (self.lowest, self.highest)
    }

    /// Process one usage sample.
    ///
    /// Returns an estimate when this tick closes a window. Does nothing once
    /// the series has latched its prediction.
    pub fn step(&mut self, usage: u64, series: &mut MemorySeries) -> Option<MemoryEstimate> {
        if series.prediction_done {
            return None;
        }

        let (min, max) = adjust_bracket(usage, self.min, self.max, self.threshold);
        self.min = min;
        self.max = max;
        (self.lowest, self.highest) = track_extremes(usage, self.lowest, self.highest);

        series.min.push(min.max(0) as u64);
        series.max.push(max.max(0) as u64);
        series.usage.push(usage);

        self.turn += 1;
        if self.turn < self.window {
            return None;
        }
        self.turn = 0;

        Some(self.close_window(usage, series))
    }

    fn close_window(&mut self, usage: u64, series: &mut MemorySeries) -> MemoryEstimate {
        series.highest.push(self.highest);
        series.lowest.push(self.lowest);
        series.amplitude.push(self.highest / self.lowest.max(1));

        let avg_min = average(&series.min) as i64;
        let avg_max = average(&series.max) as i64;
        let avg_min = avg_min + percent(avg_min) * percentage_change(avg_min, self.lowest as i64);
        let avg_max = avg_max + percent(avg_max) * percentage_change(avg_max, self.highest as i64);

        series.predicted.min.push(avg_min.max(0) as u64);
        series.predicted.max.push(avg_max.max(0) as u64);

        self.highest = 0;
        self.lowest = usage;

        let medium_amplitude = average(&series.amplitude);
        let len = series.predicted.min.len();
        series.predicted.threshold.push(medium_amplitude);
        let threshold_weights =
            generate_weights(&series.predicted.threshold, &series.predicted.threshold);
        self.threshold = weighted_average(&series.predicted.threshold, &threshold_weights);

        series.prediction_done = check_memory_end_condition(len, self.window, medium_amplitude);

        let av_min = weighted_average(
            &series.predicted.min,
            &generate_weights(&series.predicted.min, &series.lowest),
        );
        let av_max = weighted_average(
            &series.predicted.max,
            &generate_weights(&series.predicted.max, &series.highest),
        );

        debug!(
            windows = len,
            medium_amplitude,
            threshold = self.threshold,
            done = series.prediction_done,
            "Memory window closed"
        );

        MemoryEstimate {
            nmin: av_min + percent(av_min) * self.threshold,
            nmax: av_max + percent(av_max) * self.threshold,
            opti: self.threshold,
            usage,
        }
    }
}
