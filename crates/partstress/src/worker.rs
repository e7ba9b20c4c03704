//! Batch insert worker.
//!
//! One worker = one tokio task + one dedicated store connection + one
//! partition. The loop polls the partition's stop signal once per iteration;
//! that poll is the only way out. A failed INSERT is logged, counted and
//! forgotten: no retry, no backoff, no exit.
//!
//! ```text
//! loop:
//!   stop signal set?         -> release connection, return report
//!   rate limit (optional)    -> wait for token, or stop if signaled meanwhile
//!   generate batch           -> RowGenerator
//!   submit one INSERT        -> ok: count rows / err: warn + count failure
//! ```
//!
//! The statement in flight when the signal flips is never interrupted, so a
//! worker issues at most one INSERT after its partition is stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::generator::RowGenerator;
use crate::limiter::RateLimiter;
use crate::registry::Partition;
use crate::report::{WorkerOutcome, WorkerReport};
use crate::schema::TableLayout;
use crate::store::StoreConnection;

/// Live counters for one worker. Shared with the pool so the numbers survive
/// even if the task has to be aborted.
#[derive(Debug, Default)]
pub struct WorkerStats {
    statements_ok: AtomicU64,
    statements_failed: AtomicU64,
    rows_ok: AtomicU64,
}

impl WorkerStats {
    pub fn record_success(&self, rows: usize) {
        self.statements_ok.fetch_add(1, Ordering::Relaxed);
        self.rows_ok.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.statements_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statements_ok(&self) -> u64 {
        self.statements_ok.load(Ordering::Relaxed)
    }

    pub fn statements_failed(&self) -> u64 {
        self.statements_failed.load(Ordering::Relaxed)
    }

    pub fn rows_ok(&self) -> u64 {
        self.rows_ok.load(Ordering::Relaxed)
    }

    pub fn report(&self, partition: u32, worker: usize, outcome: WorkerOutcome) -> WorkerReport {
        WorkerReport {
            partition,
            worker,
            statements_ok: self.statements_ok(),
            statements_failed: self.statements_failed(),
            rows_ok: self.rows_ok(),
            outcome,
        }
    }
}

pub struct BatchInsertWorker {
    id: usize,
    partition: Arc<Partition>,
    connection: Box<dyn StoreConnection>,
    generator: RowGenerator,
    layout: Arc<TableLayout>,
    batch_size: usize,
    limiter: Option<Arc<RateLimiter>>,
    stats: Arc<WorkerStats>,
}

impl BatchInsertWorker {
    pub fn new(
        id: usize,
        partition: Arc<Partition>,
        connection: Box<dyn StoreConnection>,
        generator: RowGenerator,
        layout: Arc<TableLayout>,
        batch_size: usize,
    ) -> Self {
        Self {
            id,
            partition,
            connection,
            generator,
            layout,
            batch_size,
            limiter: None,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Run until the partition's stop signal is observed.
    pub async fn run(mut self) -> WorkerReport {
        let stop = self.partition.stop_signal();
        let range = self.partition.range();
        let ordinal = self.partition.ordinal();

        debug!(partition = ordinal, worker = self.id, "Insert worker started");

        loop {
            if stop.is_cancelled() {
                break;
            }

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = limiter.acquire() => {}
                }
            }

            let rows = self.generator.batch(range, self.batch_size);
            let sql = self.layout.insert_sql(&rows);

            match self.connection.execute(&sql).await {
                Ok(_) => self.stats.record_success(rows.len()),
                Err(e) => {
                    self.stats.record_failure();
                    warn!(
                        partition = ordinal,
                        worker = self.id,
                        error = %e,
                        "Insert failed"
                    );
                }
            }
        }

        // Release the connection before reporting.
        drop(self.connection);

        debug!(
            partition = ordinal,
            worker = self.id,
            statements_ok = self.stats.statements_ok(),
            statements_failed = self.stats.statements_failed(),
            "Insert worker stopped"
        );

        self.stats.report(ordinal, self.id, WorkerOutcome::Stopped)
    }
}
