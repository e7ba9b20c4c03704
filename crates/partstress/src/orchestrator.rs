//! Phase Orchestrator
//!
//! Drives one run through a strictly linear, timer-driven sequence:
//!
//! ```text
//! Idle ─► WarmupInsert ─┬───────────────────────────────────────────────► Done
//!  │                    │ (drop test disabled)                             ▲
//!  └────────────────────┴► LiveTraffic ─► AwaitingDrop ─► Dropping ─► Draining
//! ```
//!
//! - **WarmupInsert** (optional): create the table, load every partition, wait
//! - **LiveTraffic**: optional cache-warming count, then start workers on the
//!   live partitions that are not already running
//! - **AwaitingDrop**: wait the drop delay
//! - **Dropping**: drop each target partition, in the configured order
//! - **Draining**: wait and watch the store cope, then optionally count what
//!   is left in each dropped range
//! - **Done**: stop every partition and drain the worker pool
//!
//! Transitions happen on timer expiry only; workers are never awaited before
//! Done. An interrupt cuts the current wait short and jumps to Done. No phase
//! is ever re-entered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CountPolicy, HarnessConfig};
use crate::controller::PartitionController;
use crate::error::Result;
use crate::load::LoadGenerator;
use crate::registry::PartitionRegistry;
use crate::report::{CountReport, DropReport, PhaseTransition, RunReport};
use crate::schema::TableLayout;
use crate::store::RowStoreClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    WarmupInsert,
    LiveTraffic,
    AwaitingDrop,
    Dropping,
    Draining,
    Done,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WarmupInsert => "warmup-insert",
            Self::LiveTraffic => "live-traffic",
            Self::AwaitingDrop => "awaiting-drop",
            Self::Dropping => "dropping",
            Self::Draining => "draining",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

pub struct Orchestrator {
    config: HarnessConfig,
    client: Arc<dyn RowStoreClient>,
    layout: Arc<TableLayout>,
    registry: PartitionRegistry,
    load: LoadGenerator,
    controller: PartitionController,
    interrupt: CancellationToken,
    interrupted: bool,

    phase: RunPhase,
    phase_tx: watch::Sender<RunPhase>,
    started: Instant,
    started_at: DateTime<Utc>,
    transitions: Vec<PhaseTransition>,
    drops: Vec<DropReport>,
    counts: Vec<CountReport>,
}

impl Orchestrator {
    /// Validate the configuration and wire up the components.
    pub fn new(config: HarnessConfig, client: Arc<dyn RowStoreClient>) -> Result<Self> {
        config.validate()?;

        let layout = Arc::new(config.layout.clone());
        let registry = PartitionRegistry::from_layout(&layout);
        let load = LoadGenerator::new(client.clone(), config.layout.clone(), config.load.clone());
        let controller = PartitionController::new(
            client.clone(),
            registry.clone(),
            layout.clone(),
            config.phases.drop_order,
        );
        let (phase_tx, _) = watch::channel(RunPhase::Idle);

        Ok(Self {
            config,
            client,
            layout,
            registry,
            load,
            controller,
            interrupt: CancellationToken::new(),
            interrupted: false,
            phase: RunPhase::Idle,
            phase_tx,
            started: Instant::now(),
            started_at: Utc::now(),
            transitions: Vec::new(),
            drops: Vec::new(),
            counts: Vec::new(),
        })
    }

    /// Cancelling `token` ends the current wait and moves straight to Done.
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }

    /// Observe phase transitions while the run is in progress.
    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase_tx.subscribe()
    }

    /// Run every configured phase and return the aggregated report.
    pub async fn run(mut self) -> Result<RunReport> {
        self.started = Instant::now();
        self.started_at = Utc::now();
        self.record(RunPhase::Idle);

        info!(
            store = %self.client.describe(),
            partitions = self.registry.len(),
            concurrency = self.config.load.concurrency,
            batch_size = self.config.load.batch_size,
            "Harness starting"
        );

        self.run_phases().await;
        Ok(self.finish().await)
    }

    async fn run_phases(&mut self) {
        let phases = self.config.phases.clone();

        if phases.warmup {
            self.ensure_table().await;
            self.advance(RunPhase::WarmupInsert);
            for partition in self.registry.all().to_vec() {
                let job = self.load.job_for(partition);
                self.load.spawn(job).await;
            }
            info!(workers = self.load.worker_count(), "All insert jobs started");

            if !self.wait(phases.warmup_duration).await {
                return;
            }
            info!("Warm-up insert done");
        }

        if !phases.drop_test {
            return;
        }

        if phases.count_policy == CountPolicy::BeforeLive {
            self.count_table().await;
        }
        self.advance(RunPhase::LiveTraffic);
        for &ordinal in &phases.live_partitions {
            if self.load.is_running(ordinal) {
                continue;
            }
            match self.registry.get(ordinal) {
                Ok(partition) => {
                    let job = self.load.job_for(partition);
                    self.load.spawn(job).await;
                }
                Err(e) => error!(partition = ordinal, error = %e, "Skipping live partition"),
            }
        }

        self.advance(RunPhase::AwaitingDrop);
        if phases.count_policy == CountPolicy::BeforeDrop {
            self.count_table().await;
        }
        info!(
            delay = %humantime::format_duration(phases.drop_delay),
            "Waiting to drop"
        );
        if !self.wait(phases.drop_delay).await {
            return;
        }

        self.advance(RunPhase::Dropping);
        for &ordinal in &phases.drop_targets {
            let report = self.controller.drop_partition(ordinal).await;
            self.drops.push(report);
        }

        self.advance(RunPhase::Draining);
        if !self.wait(phases.drain_duration).await {
            return;
        }

        if phases.verify_dropped {
            self.verify_dropped().await;
        }
    }

    async fn finish(mut self) -> RunReport {
        self.advance(RunPhase::Done);

        let stopped = self.registry.stop_all();
        info!(partitions = stopped, "Stopping remaining workers");
        let partitions = self.load.drain(self.config.phases.shutdown_timeout).await;

        let report = RunReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            interrupted: self.interrupted,
            phases: self.transitions,
            partitions,
            drops: self.drops,
            counts: self.counts,
        };
        info!(
            statements_ok = report.statements_ok(),
            statements_failed = report.statements_failed(),
            abandoned = report.abandoned_workers(),
            "All tests done"
        );
        report
    }

    /// Sleep for `duration` unless interrupted. Returns `false` on interrupt.
    async fn wait(&mut self, duration: Duration) -> bool {
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.interrupt.cancelled() => true,
        };
        if interrupted {
            warn!(phase = %self.phase, "Interrupted, skipping to shutdown");
            self.interrupted = true;
        }
        !interrupted
    }

    fn advance(&mut self, next: RunPhase) {
        debug_assert!(next > self.phase, "phase {} cannot follow {}", next, self.phase);
        self.phase = next;
        self.record(next);
        info!(phase = %next, "Entering phase");
    }

    fn record(&mut self, phase: RunPhase) {
        self.transitions.push(PhaseTransition {
            phase,
            at: Utc::now(),
            offset_ms: self.started.elapsed().as_millis() as u64,
        });
        self.phase_tx.send_replace(phase);
    }

    async fn ensure_table(&self) {
        match self.client.execute(&self.layout.create_table_sql()).await {
            Ok(_) => info!(table = %self.layout.table, "Table ready"),
            Err(e) => error!(table = %self.layout.table, error = %e, "Create table failed"),
        }
    }

    async fn count_table(&mut self) {
        info!("Select count(*) ...");
        let result = self.client.fetch_count(&self.layout.count_sql()).await;
        self.push_count(None, result);
    }

    async fn verify_dropped(&mut self) {
        let dropped: Vec<u32> = self
            .drops
            .iter()
            .filter(|d| d.ok)
            .map(|d| d.partition)
            .collect();
        for ordinal in dropped {
            let result = match self.layout.key_range(ordinal) {
                Some(range) => {
                    let count = self.client.fetch_count(&self.layout.count_range_sql(range)).await;
                    if let Ok(n) = count {
                        info!(partition = ordinal, rows = n, "Rows left in dropped range");
                    }
                    count
                }
                None => continue,
            };
            self.push_count(Some(ordinal), result);
        }
    }

    fn push_count(&mut self, partition: Option<u32>, result: Result<i64>) {
        let range = partition.and_then(|p| self.layout.key_range(p));
        let (count, error) = match result {
            Ok(n) => (Some(n), None),
            Err(e) => {
                error!(error = %e, "Count query failed");
                (None, Some(e.to_string()))
            }
        };
        self.counts.push(CountReport {
            phase: self.phase,
            partition,
            range,
            count,
            error,
        });
    }
}
