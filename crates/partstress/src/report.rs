//! Run reports.
//!
//! Workers accumulate counters, the load generator folds them into per
//! partition reports, and the orchestrator adds phase timings, drop outcomes
//! and count results. The final [`RunReport`] is what tests assert on and
//! what the CLI prints.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::DropOrder;
use crate::error::Result;
use crate::orchestrator::RunPhase;
use crate::schema::KeyRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerOutcome {
    /// Observed the stop signal and returned.
    Stopped,
    /// Still running at the shutdown deadline and aborted.
    Aborted,
    /// The task panicked.
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub partition: u32,
    pub worker: usize,
    pub statements_ok: u64,
    pub statements_failed: u64,
    pub rows_ok: u64,
    pub outcome: WorkerOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub partition: u32,
    pub name: String,
    pub range: KeyRange,
    pub workers_requested: usize,
    pub workers_started: usize,
    pub connection_failures: usize,
    pub workers: Vec<WorkerReport>,
}

impl PartitionReport {
    pub fn statements_ok(&self) -> u64 {
        self.workers.iter().map(|w| w.statements_ok).sum()
    }

    pub fn statements_failed(&self) -> u64 {
        self.workers.iter().map(|w| w.statements_failed).sum()
    }

    pub fn rows_ok(&self) -> u64 {
        self.workers.iter().map(|w| w.rows_ok).sum()
    }

    pub fn aborted(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.outcome != WorkerOutcome::Stopped)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DropReport {
    pub partition: u32,
    pub name: String,
    pub order: DropOrder,
    /// Whether this drop flipped the stop signal (false if already stopped).
    pub signaled: bool,
    pub ok: bool,
    pub error: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountReport {
    pub phase: RunPhase,
    /// Dropped partition whose former range was counted, if any.
    pub partition: Option<u32>,
    pub range: Option<KeyRange>,
    pub count: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTransition {
    pub phase: RunPhase,
    pub at: DateTime<Utc>,
    /// Milliseconds since the run started.
    pub offset_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub interrupted: bool,
    pub phases: Vec<PhaseTransition>,
    pub partitions: Vec<PartitionReport>,
    pub drops: Vec<DropReport>,
    pub counts: Vec<CountReport>,
}

impl RunReport {
    pub fn partition(&self, ordinal: u32) -> Option<&PartitionReport> {
        self.partitions.iter().find(|p| p.partition == ordinal)
    }

    pub fn phase_sequence(&self) -> Vec<RunPhase> {
        self.phases.iter().map(|t| t.phase).collect()
    }

    pub fn statements_ok(&self) -> u64 {
        self.partitions.iter().map(|p| p.statements_ok()).sum()
    }

    pub fn statements_failed(&self) -> u64 {
        self.partitions.iter().map(|p| p.statements_failed()).sum()
    }

    pub fn rows_ok(&self) -> u64 {
        self.partitions.iter().map(|p| p.rows_ok()).sum()
    }

    pub fn connection_failures(&self) -> usize {
        self.partitions.iter().map(|p| p.connection_failures).sum()
    }

    /// Workers that never observed their stop signal.
    pub fn abandoned_workers(&self) -> usize {
        self.partitions.iter().map(|p| p.aborted()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let duration = self.finished_at - self.started_at;
        writeln!(
            f,
            "Run {} after {}s{}",
            if self.interrupted { "interrupted" } else { "complete" },
            duration.num_seconds(),
            if self.interrupted { " (Ctrl-C)" } else { "" }
        )?;

        let phases: Vec<String> = self
            .phases
            .iter()
            .map(|t| format!("{}@{}s", t.phase, t.offset_ms / 1000))
            .collect();
        writeln!(f, "  Phases:     {}", phases.join(" -> "))?;

        for p in &self.partitions {
            writeln!(
                f,
                "  {:<4} {:<16} workers {}/{}  ok {:>10}  failed {:>8}  rows {:>12}{}",
                p.name,
                p.range.to_string(),
                p.workers_started,
                p.workers_requested,
                p.statements_ok(),
                p.statements_failed(),
                p.rows_ok(),
                if p.aborted() > 0 {
                    format!("  aborted {}", p.aborted())
                } else {
                    String::new()
                }
            )?;
        }

        for d in &self.drops {
            match &d.error {
                None => writeln!(f, "  DROP {:<4} ok in {}ms", d.name, d.elapsed_ms)?,
                Some(e) => writeln!(f, "  DROP {:<4} failed: {}", d.name, e)?,
            }
        }

        for c in &self.counts {
            let target = match (c.partition, c.range) {
                (Some(p), Some(r)) => format!("p{} {}", p, r),
                _ => "table".to_string(),
            };
            match (&c.count, &c.error) {
                (Some(n), _) => writeln!(f, "  COUNT {:<20} {} ({})", target, n, c.phase)?,
                (None, Some(e)) => writeln!(f, "  COUNT {:<20} failed: {}", target, e)?,
                _ => {}
            }
        }

        write!(
            f,
            "  Total:      ok {}  failed {}  rows {}  connection failures {}  abandoned {}",
            self.statements_ok(),
            self.statements_failed(),
            self.rows_ok(),
            self.connection_failures(),
            self.abandoned_workers()
        )
    }
}
