//! partstress: Partition-Drop Load Harness
//!
//! Drives sustained concurrent INSERT traffic into a range-partitioned table
//! and then drops partitions while that traffic is live, to watch how the
//! store copes with DML racing administrative DDL.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  spawn   ┌───────────────┐  INSERT   ┌────────────────┐
//! │ Orchestrator │ ───────► │ LoadGenerator │ ────────► │ RowStoreClient │
//! └──────┬───────┘          │ (worker pool) │           │ (MySQL/memory) │
//!        │                  └───────▲───────┘           └───────▲────────┘
//!        │ drop                     │ stop signal               │ DROP PARTITION
//!        ▼                  ┌───────┴───────┐                   │
//! ┌──────────────┐  flips   │   Partition   │                   │
//! │  Controller  │ ───────► │   Registry    │                   │
//! └──────┬───────┘          └───────────────┘                   │
//!        └──────────────────────────────────────────────────────┘
//! ```
//!
//! - [`generator`]: random fixed-width rows with keys inside a partition
//! - [`worker`]: one task, one connection, one partition, until stopped
//! - [`registry`]: per-partition key range and one-shot stop signal
//! - [`load`]: supervised pool of workers, drained at the end of a run
//! - [`controller`]: flips a stop signal and drops the partition
//! - [`orchestrator`]: timer-driven phases from warm-up to Done
//!
//! ## Usage Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use partstress::{HarnessConfig, MemoryStore, Orchestrator};
//!
//! let config = HarnessConfig::default();
//! let store = MemoryStore::with_table(config.layout.clone());
//! let report = Orchestrator::new(config, Arc::new(store))?.run().await?;
//! println!("{}", report);
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod generator;
pub mod limiter;
pub mod load;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod schema;
pub mod store;
pub mod worker;

pub use config::{CountPolicy, DropOrder, HarnessConfig, LoadConfig, PhaseConfig, StoreConfig};
pub use controller::PartitionController;
pub use error::{HarnessError, Result, StatementKind};
pub use generator::{KeyPattern, RowGenerator, SyntheticRow};
pub use limiter::RateLimiter;
pub use load::{LoadGenerator, WorkerJob};
pub use orchestrator::{Orchestrator, RunPhase};
pub use registry::{Partition, PartitionRegistry};
pub use report::{CountReport, DropReport, PartitionReport, RunReport, WorkerOutcome, WorkerReport};
pub use schema::{ColumnSpec, KeyRange, TableLayout};
pub use store::{MemoryStore, MySqlStore, RowStoreClient, StatementRecord, StoreConnection};
pub use worker::BatchInsertWorker;
