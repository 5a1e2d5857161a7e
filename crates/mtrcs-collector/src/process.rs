use crate::{Collector, Reading};
use anyhow::{anyhow, Result};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Statistics of the agent's own process.
pub struct ProcessCollector {
    system: System,
    pid: Option<Pid>,
}

impl ProcessCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ProcessCollector {
    fn name(&self) -> &str {
        "process"
    }

    fn collect(&mut self) -> Result<Vec<Reading>> {
        let pid = self
            .pid
            .ok_or_else(|| anyhow!("current process id is not available on this platform"))?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| anyhow!("process {pid} not found"))?;

        Ok(vec![
            Reading::gauge("ResidentMemory", process.memory() as f64),
            Reading::gauge("VirtualMemory", process.virtual_memory() as f64),
            Reading::gauge("ProcessCPUUsage", process.cpu_usage() as f64),
            Reading::gauge("Uptime", process.run_time() as f64),
        ])
    }
}
