//! Load Generator - Supervised Pool of Insert Workers
//!
//! For each partition the generator acquires one dedicated connection per
//! requested worker and spawns a [`BatchInsertWorker`] on it. It returns as
//! soon as the workers are launched; they run until their partition's stop
//! signal flips.
//!
//! Every spawned task is recorded together with its live counters, so the
//! orchestrator can drain the pool at the end of the run instead of
//! abandoning tasks at process exit.
//!
//! ## Connection Failures
//!
//! A worker whose connection cannot be acquired is simply not started. The
//! failure is logged and counted; effective concurrency for that partition
//! shrinks accordingly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::LoadConfig;
use crate::generator::RowGenerator;
use crate::limiter::RateLimiter;
use crate::registry::Partition;
use crate::report::{PartitionReport, WorkerOutcome, WorkerReport};
use crate::schema::TableLayout;
use crate::store::RowStoreClient;
use crate::worker::{BatchInsertWorker, WorkerStats};

/// Request to put `workers` concurrent writers on one partition.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub partition: Arc<Partition>,
    pub workers: usize,
    pub batch_size: usize,
}

struct PoolEntry {
    worker: usize,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<WorkerReport>,
}

struct PartitionPool {
    partition: Arc<Partition>,
    requested: usize,
    connection_failures: usize,
    entries: Vec<PoolEntry>,
}

pub struct LoadGenerator {
    client: Arc<dyn RowStoreClient>,
    layout: Arc<TableLayout>,
    load: LoadConfig,
    limiter: Option<Arc<RateLimiter>>,
    pools: BTreeMap<u32, PartitionPool>,
    next_worker: usize,
}

impl LoadGenerator {
    pub fn new(client: Arc<dyn RowStoreClient>, layout: TableLayout, load: LoadConfig) -> Self {
        let limiter = load
            .rate_limit
            .map(|rate| Arc::new(RateLimiter::per_second(rate)));
        Self {
            client,
            layout: Arc::new(layout),
            load,
            limiter,
            pools: BTreeMap::new(),
            next_worker: 0,
        }
    }

    /// Job for `partition` using the configured concurrency and batch size.
    pub fn job_for(&self, partition: Arc<Partition>) -> WorkerJob {
        WorkerJob {
            partition,
            workers: self.load.concurrency,
            batch_size: self.load.batch_size,
        }
    }

    /// Launch the job's workers. Returns how many actually started.
    pub async fn spawn(&mut self, job: WorkerJob) -> usize {
        let ordinal = job.partition.ordinal();
        let widths: Vec<usize> = self.layout.columns.iter().map(|c| c.width).collect();

        info!(
            partition = ordinal,
            range = %job.partition.range(),
            workers = job.workers,
            batch_size = job.batch_size,
            "Starting insert workers"
        );

        let mut started = Vec::with_capacity(job.workers);
        let mut failures = 0;

        for _ in 0..job.workers {
            let connection = match self.client.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    failures += 1;
                    error!(partition = ordinal, error = %e, "Failed to acquire connection, worker not started");
                    continue;
                }
            };

            let id = self.next_worker;
            self.next_worker += 1;

            let seed = self
                .load
                .seed
                .map(|s| s.wrapping_add((ordinal as u64) << 32).wrapping_add(id as u64));
            let generator = RowGenerator::new(widths.clone(), self.load.key_pattern, seed);

            let mut worker = BatchInsertWorker::new(
                id,
                job.partition.clone(),
                connection,
                generator,
                self.layout.clone(),
                job.batch_size,
            );
            if let Some(limiter) = &self.limiter {
                worker = worker.with_limiter(limiter.clone());
            }

            let stats = worker.stats();
            let handle = tokio::spawn(worker.run());
            started.push(PoolEntry {
                worker: id,
                stats,
                handle,
            });
        }

        let count = started.len();
        if failures > 0 {
            warn!(
                partition = ordinal,
                started = count,
                failed = failures,
                "Partition running below requested concurrency"
            );
        }

        let pool = self
            .pools
            .entry(ordinal)
            .or_insert_with(|| PartitionPool {
                partition: job.partition.clone(),
                requested: 0,
                connection_failures: 0,
                entries: Vec::new(),
            });
        pool.requested += job.workers;
        pool.connection_failures += failures;
        pool.entries.extend(started);

        count
    }

    /// Whether workers have been launched for this partition.
    pub fn is_running(&self, ordinal: u32) -> bool {
        self.pools
            .get(&ordinal)
            .is_some_and(|pool| !pool.entries.is_empty())
    }

    /// Workers launched so far across all partitions.
    pub fn worker_count(&self) -> usize {
        self.pools.values().map(|p| p.entries.len()).sum()
    }

    /// Join every recorded worker. Workers still running when `timeout`
    /// expires are aborted and reported as such. Callers are expected to have
    /// set the stop signals first.
    pub async fn drain(&mut self, timeout: Duration) -> Vec<PartitionReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        let pools = std::mem::take(&mut self.pools);
        let mut reports = Vec::with_capacity(pools.len());

        for (ordinal, pool) in pools {
            let mut workers = Vec::with_capacity(pool.entries.len());

            for mut entry in pool.entries {
                let report = match tokio::time::timeout_at(deadline, &mut entry.handle).await {
                    Ok(Ok(report)) => report,
                    Ok(Err(e)) => {
                        error!(partition = ordinal, worker = entry.worker, error = %e, "Insert worker panicked");
                        entry
                            .stats
                            .report(ordinal, entry.worker, WorkerOutcome::Panicked)
                    }
                    Err(_) => {
                        entry.handle.abort();
                        warn!(
                            partition = ordinal,
                            worker = entry.worker,
                            stopped = pool.partition.is_stopped(),
                            "Insert worker did not exit before shutdown deadline, aborted"
                        );
                        entry
                            .stats
                            .report(ordinal, entry.worker, WorkerOutcome::Aborted)
                    }
                };
                workers.push(report);
            }

            reports.push(PartitionReport {
                partition: ordinal,
                name: pool.partition.name().to_string(),
                range: pool.partition.range(),
                workers_requested: pool.requested,
                workers_started: workers.len(),
                connection_failures: pool.connection_failures,
                workers,
            });
        }

        reports
    }
}
