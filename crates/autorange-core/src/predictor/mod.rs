//! Streaming limit estimators
//!
//! One predictor per resource category. Each is stepped once per tick with
//! the latest sample and mutates its category's series in the observer.

mod cpu;
mod memory;

pub use cpu::{average_float, cpu_percent, cpu_usage_to_config, CpuEstimate, CpuPredictor};
pub use memory::{
    adjust_bracket, average, check_memory_end_condition, generate_weights, highest_of, lowest_of,
    percent, percentage_change, track_extremes, weighted_average, MemoryEstimate, MemoryPredictor,
    MIN_THRESHOLD,
};
