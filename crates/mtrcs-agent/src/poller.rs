//! Collect phase: samples every collector into the agent's local storage.

use mtrcs_collector::{Collector, Reading};
use mtrcs_storage::{MetricUpdater, Storage};

/// Runs each collector once and applies its readings: gauges overwrite,
/// counters accumulate. A failing collector is logged and skipped.
pub async fn poll_once(collectors: &mut [Box<dyn Collector>], storage: &dyn Storage) -> usize {
    let mut applied = 0;
    for collector in collectors.iter_mut() {
        let readings = match collector.collect() {
            Ok(readings) => readings,
            Err(e) => {
                tracing::warn!(collector = collector.name(), error = %e, "Collection failed");
                continue;
            }
        };
        for reading in readings {
            let result = match &reading {
                Reading::Gauge(g) => storage.update_gauge(&g.name, g.value).await,
                Reading::Counter(c) => storage.update_counter(&c.name, c.value).await.map(|_| ()),
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!(metric = reading.name(), error = %e, "Failed to store reading")
                }
            }
        }
    }
    tracing::debug!(applied, "Poll complete");
    applied
}
