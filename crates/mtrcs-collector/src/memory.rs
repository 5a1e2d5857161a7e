use crate::{Collector, Reading};
use anyhow::Result;
use sysinfo::System;

/// Host memory totals: `TotalMemory` and `FreeMemory`, in bytes.
pub struct MemoryCollector {
    system: System,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        "memory"
    }

    fn collect(&mut self) -> Result<Vec<Reading>> {
        self.system.refresh_memory();
        Ok(vec![
            Reading::gauge("TotalMemory", self.system.total_memory() as f64),
            Reading::gauge("FreeMemory", self.system.free_memory() as f64),
        ])
    }
}
