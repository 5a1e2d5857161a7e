//! Metric collection framework for the mtrcs agent.
//!
//! Each [`Collector`] samples one category of readings (process, memory, CPU,
//! runtime) and returns them as [`Reading`]s. The agent writes the readings
//! into its local storage on every poll tick.

pub mod cpu;
pub mod memory;
pub mod process;
pub mod runtime;

use anyhow::Result;
use mtrcs_common::types::{CounterMetric, GaugeMetric};

/// One sampled value, tagged with how the store should apply it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Overwrites the stored gauge.
    Gauge(GaugeMetric),
    /// Adds to the stored counter.
    Counter(CounterMetric),
}

impl Reading {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Reading::Gauge(GaugeMetric {
            name: name.into(),
            value,
        })
    }

    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Reading::Counter(CounterMetric {
            name: name.into(),
            value: delta,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Reading::Gauge(g) => &g.name,
            Reading::Counter(c) => &c.name,
        }
    }
}

/// A metric source polled by the agent.
///
/// Implementations are registered in the agent's collection loop and called
/// at each poll interval. The trait requires `Send + Sync` so the collector
/// set can live inside the agent's shared state.
pub trait Collector: Send + Sync {
    /// Returns the collector name (e.g., `"cpu"`, `"memory"`), used for logging.
    fn name(&self) -> &str;

    /// Samples current values.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system API call fails.
    fn collect(&mut self) -> Result<Vec<Reading>>;
}

/// The default collector set used by the agent.
pub fn default_collectors() -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(runtime::RuntimeCollector::new()),
        Box::new(process::ProcessCollector::new()),
        Box::new(memory::MemoryCollector::new()),
        Box::new(cpu::CpuCollector::new()),
    ]
}
