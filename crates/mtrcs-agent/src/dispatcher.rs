//! Report pipeline: batch assembly, a fixed worker pool and error draining.
//!
//! A report reserves one of `rate_limit` delivery slots, builds a batch from
//! the current storage state and queues it on a channel of the same capacity.
//! The slot is released only after a worker finished delivering the batch, so
//! a report blocks while every worker is busy instead of piling up batches.
//!
//! Counters are sent as deltas. The total sent last time for counter `X` is
//! kept in the local gauge `LastX`, which is advanced as soon as the batch is
//! built. A failed delivery therefore drops that interval's delta; nothing is
//! ever sent twice.
//!
//! Markers are gauges and hold an `f64`, so totals are tracked exactly only up
//! to 2^53. Beyond that consecutive deltas may be off by the rounding error,
//! and a difference that does not fit in an `i64` resends the full total.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use mtrcs_common::types::MetricRecord;
use mtrcs_storage::{MetricGetter, MetricUpdater, Storage, StorageError};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::transport::Transport;

const LAST_PREFIX: &str = "Last";

/// Name of the local gauge tracking the last reported total of `counter`.
pub fn last_reported_name(counter: &str) -> String {
    format!("{LAST_PREFIX}{counter}")
}

struct Job {
    records: Vec<MetricRecord>,
    _slot: OwnedSemaphorePermit,
}

/// A delivery that failed, as published on the error channel.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub worker: usize,
    pub records: usize,
    pub error: anyhow::Error,
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Worker count and job channel capacity.
    pub rate_limit: usize,
    /// Deadline for one delivery attempt.
    pub request_timeout: Duration,
}

#[derive(Debug, Default)]
struct Stats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    jobs: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    slots: Arc<Semaphore>,
    report_lock: Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    error_logger: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    /// Spawns `rate_limit` workers and the error logger.
    pub fn start(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        options: DispatcherOptions,
    ) -> Self {
        let rate_limit = options.rate_limit.max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(rate_limit);
        let (errs_tx, errs_rx) = mpsc::unbounded_channel::<DeliveryFailure>();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let stats = Arc::new(Stats::default());

        let workers = (0..rate_limit)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    jobs_rx.clone(),
                    transport.clone(),
                    errs_tx.clone(),
                    options.request_timeout,
                    stats.clone(),
                ))
            })
            .collect();
        drop(errs_tx);

        let error_logger = tokio::spawn(log_failures(errs_rx, stats.clone()));
        tracing::info!(workers = rate_limit, transport = transport.name(), "Dispatcher started");

        Self {
            storage,
            jobs: std::sync::Mutex::new(Some(jobs_tx)),
            slots: Arc::new(Semaphore::new(rate_limit)),
            report_lock: Mutex::new(()),
            workers: Mutex::new(workers),
            error_logger: Mutex::new(Some(error_logger)),
            stats,
        }
    }

    /// Runs one report cycle: waits for a free delivery slot, builds the batch
    /// and hands it to the workers. Returns the number of queued records.
    pub async fn report(&self) -> Result<usize> {
        let jobs = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("dispatcher is shut down"))?;

        let slot = self.slots.clone().acquire_owned().await?;
        let records = {
            let _guard = self.report_lock.lock().await;
            build_batch(self.storage.as_ref()).await?
        };
        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        jobs.send(Job {
            records,
            _slot: slot,
        })
        .await
        .map_err(|_| anyhow!("worker pool is gone"))?;
        tracing::debug!(records = count, "Batch queued");
        Ok(count)
    }

    /// Closes the job channel and waits up to `timeout` for the workers to
    /// finish what is already queued.
    pub async fn shutdown(&self, timeout: Duration) {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        let drain = async {
            for handle in workers {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Worker task failed");
                }
            }
            if let Some(logger) = self.error_logger.lock().await.take() {
                let _ = logger.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Workers did not drain in time");
        }
        tracing::info!(
            delivered = self.delivered(),
            failed = self.failed(),
            "Dispatcher stopped"
        );
    }

    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }
}

/// Reads all gauges and counters and converts counters to deltas, advancing
/// each `LastX` marker to the total just read.
pub async fn build_batch(storage: &dyn Storage) -> Result<Vec<MetricRecord>, StorageError> {
    let gauges = storage.get_all_gauges().await?;
    let counters = storage.get_all_counters().await?;

    let markers: HashSet<String> = counters
        .iter()
        .map(|c| last_reported_name(&c.name))
        .collect();

    let mut batch = Vec::with_capacity(gauges.len() + counters.len());
    batch.extend(
        gauges
            .into_iter()
            .filter(|g| !markers.contains(&g.name))
            .map(MetricRecord::from),
    );

    for counter in counters {
        let marker = last_reported_name(&counter.name);
        let last = match storage.get_gauge(&marker).await {
            Ok(g) => g.value as i64,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        storage.update_gauge(&marker, counter.value as f64).await?;
        let delta = counter.value.checked_sub(last).unwrap_or_else(|| {
            tracing::warn!(
                counter = %counter.name,
                total = counter.value,
                last,
                "Counter delta out of range, sending the full total"
            );
            counter.value
        });
        batch.push(MetricRecord::counter(counter.name, delta));
    }
    Ok(batch)
}

async fn worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    transport: Arc<dyn Transport>,
    errors: mpsc::UnboundedSender<DeliveryFailure>,
    timeout: Duration,
    stats: Arc<Stats>,
) {
    loop {
        // Only the receive is serialised; delivery runs outside the lock.
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            tracing::debug!(worker = id, "Job channel closed, worker exiting");
            return;
        };

        tracing::debug!(worker = id, records = job.records.len(), "Worker started delivery");
        let result = match tokio::time::timeout(timeout, transport.send(&job.records)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("delivery timed out after {}s", timeout.as_secs())),
        };
        match result {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                let _ = errors.send(DeliveryFailure {
                    worker: id,
                    records: job.records.len(),
                    error,
                });
            }
        }
        tracing::debug!(worker = id, "Worker finished delivery");
        // job (and its slot) dropped here
    }
}

async fn log_failures(mut errors: mpsc::UnboundedReceiver<DeliveryFailure>, stats: Arc<Stats>) {
    while let Some(failure) = errors.recv().await {
        stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            worker = failure.worker,
            records = failure.records,
            error = %failure.error,
            "Batch delivery failed, dropping it"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mtrcs_storage::MemStorage;
    use tokio::time::Instant;

    /// Records every batch; optionally slow and/or failing.
    #[derive(Default)]
    struct FakeTransport {
        sent: std::sync::Mutex<Vec<Vec<MetricRecord>>>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send(&self, records: &[MetricRecord]) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.sent.lock().unwrap().push(records.to_vec());
            if self.fail {
                Err(anyhow!("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    fn options(rate_limit: usize) -> DispatcherOptions {
        DispatcherOptions {
            rate_limit,
            request_timeout: Duration::from_secs(60),
        }
    }

    fn counter_delta(batch: &[MetricRecord], name: &str) -> Option<i64> {
        batch.iter().find(|r| r.name == name).and_then(|r| r.delta)
    }

    #[tokio::test]
    async fn counters_are_sent_as_deltas() {
        let storage = Arc::new(MemStorage::new());
        storage.update_counter("PollCount", 5).await.unwrap();

        let first = build_batch(storage.as_ref()).await.unwrap();
        assert_eq!(counter_delta(&first, "PollCount"), Some(5));

        storage.update_counter("PollCount", 3).await.unwrap();
        let second = build_batch(storage.as_ref()).await.unwrap();
        assert_eq!(counter_delta(&second, "PollCount"), Some(3));

        // the stored counter itself is never reset
        assert_eq!(storage.get_counter("PollCount").await.unwrap().value, 8);
    }

    #[tokio::test]
    async fn extreme_totals_do_not_overflow_the_delta() {
        let storage = Arc::new(MemStorage::new());
        storage.update_counter("Huge", i64::MAX).await.unwrap();
        // reads back as i64::MIN, so the plain difference would overflow
        storage
            .update_gauge(&last_reported_name("Huge"), -1.0e19)
            .await
            .unwrap();

        let batch = build_batch(storage.as_ref()).await.unwrap();
        assert_eq!(counter_delta(&batch, "Huge"), Some(i64::MAX));

        // i64::MAX rounds up as f64 and saturates back to i64::MAX
        let batch = build_batch(storage.as_ref()).await.unwrap();
        assert_eq!(counter_delta(&batch, "Huge"), Some(0));
    }

    #[tokio::test]
    async fn markers_are_not_sent() {
        let storage = Arc::new(MemStorage::new());
        storage.update_counter("PollCount", 1).await.unwrap();
        storage.update_gauge("LastGC", 12.0).await.unwrap();
        build_batch(storage.as_ref()).await.unwrap();

        let batch = build_batch(storage.as_ref()).await.unwrap();
        let names: Vec<_> = batch.iter().map(|r| r.name.as_str()).collect();
        assert!(!names.contains(&"LastPollCount"));
        // a gauge that merely looks like a marker is still reported
        assert!(names.contains(&"LastGC"));
        assert_eq!(counter_delta(&batch, "PollCount"), Some(0));
    }

    #[tokio::test]
    async fn failed_delivery_drops_the_delta() {
        let storage = Arc::new(MemStorage::new());
        let transport = Arc::new(FakeTransport {
            fail: true,
            ..Default::default()
        });
        let dispatcher = Dispatcher::start(storage.clone(), transport.clone(), options(1));

        storage.update_counter("PollCount", 3).await.unwrap();
        dispatcher.report().await.unwrap();
        storage.update_counter("PollCount", 2).await.unwrap();
        dispatcher.report().await.unwrap();
        dispatcher.shutdown(Duration::from_secs(5)).await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(counter_delta(&sent[0], "PollCount"), Some(3));
        // not 5: the first delta was lost with the failed attempt
        assert_eq!(counter_delta(&sent[1], "PollCount"), Some(2));
        assert_eq!(dispatcher.failed(), 2);
        assert_eq!(dispatcher.delivered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn report_blocks_while_workers_are_busy() {
        let storage = Arc::new(MemStorage::new());
        storage.update_gauge("Alloc", 1.0).await.unwrap();
        let transport = Arc::new(FakeTransport {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let dispatcher = Dispatcher::start(storage, transport.clone(), options(1));

        let started = Instant::now();
        dispatcher.report().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        dispatcher.report().await.unwrap();
        // the second report waited for the first delivery to finish
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        dispatcher.shutdown(Duration::from_secs(30)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
        assert_eq!(dispatcher.delivered(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_deliver_concurrently() {
        let storage = Arc::new(MemStorage::new());
        storage.update_gauge("Alloc", 1.0).await.unwrap();
        let transport = Arc::new(FakeTransport {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        let dispatcher = Dispatcher::start(storage, transport.clone(), options(3));

        let started = Instant::now();
        for _ in 0..3 {
            dispatcher.report().await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        dispatcher.shutdown(Duration::from_secs(30)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_delivery_times_out() {
        let storage = Arc::new(MemStorage::new());
        storage.update_gauge("Alloc", 1.0).await.unwrap();
        let transport = Arc::new(FakeTransport {
            delay: Duration::from_secs(120),
            ..Default::default()
        });
        let dispatcher = Dispatcher::start(storage, transport, options(1));

        dispatcher.report().await.unwrap();
        dispatcher.shutdown(Duration::from_secs(300)).await;
        assert_eq!(dispatcher.failed(), 1);
    }

    #[tokio::test]
    async fn report_after_shutdown_fails() {
        let storage = Arc::new(MemStorage::new());
        let dispatcher = Dispatcher::start(storage, Arc::new(FakeTransport::default()), options(1));
        dispatcher.shutdown(Duration::from_secs(1)).await;
        assert!(dispatcher.report().await.is_err());
    }
}
