//! Time series held for a single watched workload
//!
//! The observer owns one memory and one CPU series set, each with its own
//! predicted values and a latching "prediction done" flag.

use crate::series::BoundedSeries;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Candidate memory limits produced once per window
#[derive(Debug, Clone, Serialize)]
pub struct MemoryPredicted {
    pub min: BoundedSeries<u64>,
    pub max: BoundedSeries<u64>,
    pub threshold: BoundedSeries<u64>,
}

/// Per-tick memory bracket history plus per-window extremes
#[derive(Debug, Clone, Serialize)]
pub struct MemorySeries {
    pub min: BoundedSeries<u64>,
    pub max: BoundedSeries<u64>,
    pub usage: BoundedSeries<u64>,
    pub highest: BoundedSeries<u64>,
    pub lowest: BoundedSeries<u64>,
    pub amplitude: BoundedSeries<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub predicted: MemoryPredicted,
    pub prediction_done: bool,
}

impl MemorySeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            min: BoundedSeries::new(capacity),
            max: BoundedSeries::new(capacity),
            usage: BoundedSeries::new(capacity),
            highest: BoundedSeries::new(capacity),
            lowest: BoundedSeries::new(capacity),
            amplitude: BoundedSeries::new(capacity),
            started_at: None,
            predicted: MemoryPredicted {
                min: BoundedSeries::new(capacity),
                max: BoundedSeries::new(capacity),
                threshold: BoundedSeries::new(capacity),
            },
            prediction_done: true,
        }
    }
}

/// Window averages of CPU percent and usage
#[derive(Debug, Clone, Serialize)]
pub struct CpuPredicted {
    pub percent: BoundedSeries<f64>,
    pub usage: BoundedSeries<f64>,
}

/// Per-tick CPU percent and usage deltas
#[derive(Debug, Clone, Serialize)]
pub struct CpuSeries {
    pub percent: BoundedSeries<f64>,
    pub usage: BoundedSeries<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub predicted: CpuPredicted,
    pub prediction_done: bool,
}

impl CpuSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            percent: BoundedSeries::new(capacity),
            usage: BoundedSeries::new(capacity),
            started_at: None,
            predicted: CpuPredicted {
                percent: BoundedSeries::new(capacity),
                usage: BoundedSeries::new(capacity),
            },
            prediction_done: true,
        }
    }
}

/// All series tracked for one workload
#[derive(Debug, Clone, Serialize)]
pub struct Observer {
    pub memory: MemorySeries,
    pub cpu: CpuSeries,
    capacity: usize,
}

impl Observer {
    /// Create an observer with window size `capacity`.
    ///
    /// Inactive categories start latched as done so they never hold back
    /// convergence.
    pub fn new(capacity: usize, memory_active: bool, cpu_active: bool) -> Self {
        let mut memory = MemorySeries::new(capacity);
        memory.prediction_done = !memory_active;

        let mut cpu = CpuSeries::new(capacity);
        cpu.prediction_done = !cpu_active;

        Self {
            memory,
            cpu,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once every category has latched its prediction
    pub fn is_converged(&self) -> bool {
        self.memory.prediction_done && self.cpu.prediction_done
    }

    /// Stamp the start time of every active category
    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        if !self.memory.prediction_done {
            self.memory.started_at = Some(at);
        }
        if !self.cpu.prediction_done {
            self.cpu.started_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_categories_start_done() {
        let observer = Observer::new(10, true, false);
        assert!(!observer.memory.prediction_done);
        assert!(observer.cpu.prediction_done);
        assert!(!observer.is_converged());
    }

    #[test]
    fn test_converged_when_all_latched() {
        let mut observer = Observer::new(10, true, true);
        observer.memory.prediction_done = true;
        assert!(!observer.is_converged());
        observer.cpu.prediction_done = true;
        assert!(observer.is_converged());
    }

    #[test]
    fn test_mark_started_only_active() {
        let mut observer = Observer::new(4, false, true);
        let now = Utc::now();
        observer.mark_started(now);

        assert!(observer.memory.started_at.is_none());
        assert_eq!(observer.cpu.started_at, Some(now));
        assert_eq!(observer.capacity(), 4);
    }
}
