use crate::{Collector, Reading};
use anyhow::Result;
use sysinfo::System;

/// Per-core utilisation as `CPUutilization1` .. `CPUutilizationN` (percent).
pub struct CpuCollector {
    system: System,
}

impl CpuCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // usage is a delta between two refreshes, so prime the first sample
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    fn collect(&mut self) -> Result<Vec<Reading>> {
        self.system.refresh_cpu_all();
        Ok(self
            .system
            .cpus()
            .iter()
            .enumerate()
            .map(|(i, cpu)| Reading::gauge(format!("CPUutilization{}", i + 1), cpu.cpu_usage() as f64))
            .collect())
    }
}
