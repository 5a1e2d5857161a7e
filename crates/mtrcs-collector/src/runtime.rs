use crate::{Collector, Reading};
use anyhow::Result;
use rand::Rng;

/// Name of the counter bumped once per poll tick.
pub const POLL_COUNT: &str = "PollCount";

/// Emits `RandomValue` and bumps [`POLL_COUNT`] by one on every poll.
pub struct RuntimeCollector;

impl RuntimeCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RuntimeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for RuntimeCollector {
    fn name(&self) -> &str {
        "runtime"
    }

    fn collect(&mut self) -> Result<Vec<Reading>> {
        let random: f64 = rand::thread_rng().gen();
        Ok(vec![
            Reading::gauge("RandomValue", random),
            Reading::counter(POLL_COUNT, 1),
        ])
    }
}
