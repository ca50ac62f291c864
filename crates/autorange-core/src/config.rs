//! Autorange configuration
//!
//! At the boundary the configuration is a two-level string map, as declared
//! on a workload:
//!
//! ```text
//! memory:
//!   min: "110000"
//!   max: "120000"
//!   threshold%: "10"
//! cpu%:
//!   min: "60"
//!   max: "70"
//! ```
//!
//! The presence of a category activates learning for that resource. The map
//! is parsed once into typed baselines on activation; derived estimates are
//! written back under the `memoryAR` and `cpuAR` categories so they travel
//! with every augmented sample.

use crate::predictor::{CpuEstimate, MemoryEstimate, MIN_THRESHOLD};
use std::collections::BTreeMap;
use thiserror::Error;

/// Boundary representation: category -> key -> value
pub type AutoRangeSpec = BTreeMap<String, BTreeMap<String, String>>;

pub const MEMORY: &str = "memory";
pub const CPU: &str = "cpu%";
pub const MEMORY_OUTPUT: &str = "memoryAR";
pub const CPU_OUTPUT: &str = "cpuAR";

/// Floors applied to configured memory baselines, in bytes
const MIN_BASE_MEMORY: i64 = 10_000;
const MIN_BASE_MEMORY_MAX: i64 = 20_000;
const DEFAULT_THRESHOLD: i64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no autorange category configured, expected \"memory\" or \"cpu%\"")]
    NoActiveCategory,
}

/// Starting bracket for memory learning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBaseline {
    pub min: i64,
    pub max: i64,
    pub threshold: i64,
}

impl MemoryBaseline {
    pub fn from_category(values: &BTreeMap<String, String>) -> Self {
        let raw_min = parse_int(values.get("min"));
        let raw_max = parse_int(values.get("max"));
        let threshold = match parse_int(values.get("threshold%")) {
            0 => DEFAULT_THRESHOLD,
            t => t.max(MIN_THRESHOLD),
        };

        Self {
            min: raw_min.max(MIN_BASE_MEMORY),
            max: raw_max.max(MIN_BASE_MEMORY_MAX),
            threshold,
        }
    }
}

/// Optional CPU percentage hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuBaseline {
    pub min: i64,
    pub max: i64,
}

impl CpuBaseline {
    pub fn from_category(values: &BTreeMap<String, String>) -> Self {
        Self {
            min: parse_int(values.get("min")),
            max: parse_int(values.get("max")),
        }
    }

    /// Midpoint of the hint normalized by core count, when both bounds are set
    pub fn seed_percent(&self, cores: u32) -> Option<f64> {
        if self.min == 0 || self.max == 0 {
            return None;
        }
        let cores = i64::from(cores.max(1));
        Some((((self.min + self.max) / 2) / cores) as f64)
    }
}

/// Activated configuration of one watcher
#[derive(Debug, Clone)]
pub struct AutoRangeConfig {
    spec: AutoRangeSpec,
    memory: Option<MemoryBaseline>,
    cpu: Option<CpuBaseline>,
    memory_estimate: Option<MemoryEstimate>,
    cpu_estimate: Option<CpuEstimate>,
}

impl AutoRangeConfig {
    /// Parse the declared categories and open the output categories.
    ///
    /// Fails when neither memory nor CPU learning is requested.
    pub fn activate(mut spec: AutoRangeSpec) -> Result<Self, ConfigError> {
        let memory = spec.get(MEMORY).map(MemoryBaseline::from_category);
        let cpu = spec.get(CPU).map(CpuBaseline::from_category);

        if memory.is_none() && cpu.is_none() {
            return Err(ConfigError::NoActiveCategory);
        }
        if memory.is_some() {
            spec.insert(MEMORY_OUTPUT.to_string(), BTreeMap::new());
        }
        if cpu.is_some() {
            spec.insert(CPU_OUTPUT.to_string(), BTreeMap::new());
        }

        Ok(Self {
            spec,
            memory,
            cpu,
            memory_estimate: None,
            cpu_estimate: None,
        })
    }

    pub fn is_activated(&self, category: &str) -> bool {
        self.spec.contains_key(category)
    }

    pub fn memory(&self) -> Option<&MemoryBaseline> {
        self.memory.as_ref()
    }

    pub fn cpu(&self) -> Option<&CpuBaseline> {
        self.cpu.as_ref()
    }

    pub fn memory_estimate(&self) -> Option<&MemoryEstimate> {
        self.memory_estimate.as_ref()
    }

    pub fn cpu_estimate(&self) -> Option<&CpuEstimate> {
        self.cpu_estimate.as_ref()
    }

    /// Publish the latest memory window estimate
    pub fn record_memory(&mut self, estimate: MemoryEstimate) {
        self.set_output(MEMORY_OUTPUT, "nmin", estimate.nmin.to_string());
        self.set_output(MEMORY_OUTPUT, "nmax", estimate.nmax.to_string());
        self.set_output(MEMORY_OUTPUT, "opti", estimate.opti.to_string());
        self.set_output(MEMORY_OUTPUT, "usage", estimate.usage.to_string());
        self.memory_estimate = Some(estimate);
    }

    /// Publish the committed CPU estimate
    pub fn record_cpu(&mut self, estimate: CpuEstimate) {
        self.set_output(CPU_OUTPUT, "percentOpti", format!("{:.3}", estimate.percent_opti));
        self.set_output(CPU_OUTPUT, "usageOpti", format!("{:.0}", estimate.usage_opti));
        self.cpu_estimate = Some(estimate);
    }

    /// Publish the memory limits chosen for application
    pub fn record_memory_limits(&mut self, reservation: i64, limit: i64) {
        self.set_output(MEMORY_OUTPUT, "sugmin", reservation.to_string());
        self.set_output(MEMORY_OUTPUT, "sugmax", limit.to_string());
    }

    /// Publish the CPU values chosen for application
    pub fn record_cpu_limits(&mut self, cores: Option<u32>, runtime: i64) {
        let cores = cores.map(|n| n.to_string()).unwrap_or_default();
        self.set_output(CPU_OUTPUT, "numCPU", cores);
        self.set_output(CPU_OUTPUT, "usageOpti", runtime.to_string());
    }

    /// Copy of the whole map, inputs and outputs
    pub fn snapshot(&self) -> AutoRangeSpec {
        self.spec.clone()
    }

    fn set_output(&mut self, category: &str, key: &str, value: String) {
        self.spec
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

/// Lenient integer parsing: anything malformed reads as zero
fn parse_int(value: Option<&String>) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}
