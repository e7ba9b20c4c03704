//! partstress CLI
//!
//! Runs the partition-drop harness against a MySQL-protocol server, or
//! against the in-memory store with `--dry-run`.
//!
//! ## Quick Start
//!
//! ```bash
//! # Load every partition for 10 minutes, then drop p0, p2 and p3 while p1
//! # keeps receiving inserts
//! partstress --ip 127.0.0.1 --port 4000 --insert true --insert-time 10m \
//!     --drop-delay 5m --drain 5m
//!
//! # Rehearse the same schedule without a server
//! partstress --dry-run --insert true --insert-time 30s --drop-delay 10s --drain 10s
//! ```
//!
//! ## Configuration
//!
//! Settings are resolved from lowest to highest precedence:
//! 1. Built-in defaults
//! 2. A TOML file passed with `--config`
//! 3. Command-line flags, or the matching `PARTSTRESS_*` environment variables
//!
//! Logging is controlled with `RUST_LOG` (default `info`).
//!
//! Ctrl-C skips the remaining phases: every partition is stopped and the
//! worker pool drained before the report is printed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use partstress::{
    CountPolicy, DropOrder, HarnessConfig, KeyPattern, MemoryStore, MySqlStore, Orchestrator,
    RowStoreClient,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "partstress")]
#[command(about = "Concurrent insert load with partition drops under live traffic", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PARTSTRESS_CONFIG")]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long = "ip", alias = "host", env = "PARTSTRESS_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(long, env = "PARTSTRESS_PORT")]
    port: Option<u16>,

    /// Database name
    #[arg(long = "db", env = "PARTSTRESS_DB")]
    database: Option<String>,

    #[arg(long, env = "PARTSTRESS_USER")]
    user: Option<String>,

    #[arg(long, env = "PARTSTRESS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Insert workers per partition
    #[arg(long = "concurrent", env = "PARTSTRESS_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Rows per INSERT statement
    #[arg(long = "batch", env = "PARTSTRESS_BATCH")]
    batch_size: Option<usize>,

    /// Create the table and load every partition before the drop test
    #[arg(long = "insert", env = "PARTSTRESS_WARMUP")]
    warmup: Option<bool>,

    /// How long the warm-up load runs (e.g. "6h")
    #[arg(long = "insert-time", env = "PARTSTRESS_WARMUP_DURATION", value_parser = humantime::parse_duration)]
    warmup_duration: Option<Duration>,

    /// Run the partition drop test
    #[arg(long, env = "PARTSTRESS_DROP_TEST")]
    drop_test: Option<bool>,

    /// Live traffic before the first drop (e.g. "45m")
    #[arg(long, env = "PARTSTRESS_DROP_DELAY", value_parser = humantime::parse_duration)]
    drop_delay: Option<Duration>,

    /// Observation window after the drops (e.g. "40m")
    #[arg(long = "drain", env = "PARTSTRESS_DRAIN", value_parser = humantime::parse_duration)]
    drain_duration: Option<Duration>,

    /// Partitions to drop, in order (e.g. "0,2,3")
    #[arg(long, env = "PARTSTRESS_DROP_TARGETS", value_delimiter = ',')]
    drop_targets: Option<Vec<u32>>,

    /// Partitions that receive traffic during the drop test
    #[arg(long, env = "PARTSTRESS_LIVE_PARTITIONS", value_delimiter = ',')]
    live_partitions: Option<Vec<u32>>,

    /// off, before-live or before-drop
    #[arg(long, env = "PARTSTRESS_COUNT_POLICY")]
    count_policy: Option<CountPolicy>,

    /// signal-then-drop or drop-then-signal
    #[arg(long, env = "PARTSTRESS_DROP_ORDER")]
    drop_order: Option<DropOrder>,

    /// contiguous or scattered
    #[arg(long, env = "PARTSTRESS_KEY_PATTERN")]
    key_pattern: Option<KeyPattern>,

    /// INSERT statements per second across all workers
    #[arg(long, env = "PARTSTRESS_RATE_LIMIT")]
    rate_limit: Option<f64>,

    /// Seed for reproducible row generation
    #[arg(long, env = "PARTSTRESS_SEED")]
    seed: Option<u64>,

    /// Count the rows left in each dropped range after draining
    #[arg(long, env = "PARTSTRESS_VERIFY_DROPPED")]
    verify_dropped: Option<bool>,

    /// How long to wait for workers to exit at the end of the run
    #[arg(long, env = "PARTSTRESS_SHUTDOWN_TIMEOUT", value_parser = humantime::parse_duration)]
    shutdown_timeout: Option<Duration>,

    /// Run against the in-memory store instead of a server
    #[arg(long)]
    dry_run: bool,

    /// Simulated statement latency for --dry-run
    #[arg(long, default_value = "2ms", value_parser = humantime::parse_duration)]
    dry_run_latency: Duration,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Merge the config file (if any) with flags and environment overrides.
    fn resolve(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => HarnessConfig::default(),
        };

        let store = &mut config.store;
        override_with(&mut store.host, &self.host);
        override_with(&mut store.port, &self.port);
        override_with(&mut store.database, &self.database);
        override_with(&mut store.user, &self.user);
        if self.password.is_some() {
            store.password = self.password.clone();
        }

        let load = &mut config.load;
        override_with(&mut load.concurrency, &self.concurrency);
        override_with(&mut load.batch_size, &self.batch_size);
        override_with(&mut load.key_pattern, &self.key_pattern);
        if self.rate_limit.is_some() {
            load.rate_limit = self.rate_limit;
        }
        if self.seed.is_some() {
            load.seed = self.seed;
        }

        let phases = &mut config.phases;
        override_with(&mut phases.warmup, &self.warmup);
        override_with(&mut phases.warmup_duration, &self.warmup_duration);
        override_with(&mut phases.drop_test, &self.drop_test);
        override_with(&mut phases.drop_delay, &self.drop_delay);
        override_with(&mut phases.drain_duration, &self.drain_duration);
        override_with(&mut phases.drop_targets, &self.drop_targets);
        override_with(&mut phases.live_partitions, &self.live_partitions);
        override_with(&mut phases.count_policy, &self.count_policy);
        override_with(&mut phases.drop_order, &self.drop_order);
        override_with(&mut phases.verify_dropped, &self.verify_dropped);
        override_with(&mut phases.shutdown_timeout, &self.shutdown_timeout);

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn override_with<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *slot = v.clone();
    }
}

/// Cancel `token` on the first Ctrl-C.
fn spawn_interrupt_handler(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, skipping to shutdown");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.resolve()?;

    let mut mysql = None;
    let client: Arc<dyn RowStoreClient> = if cli.dry_run {
        info!(latency = ?cli.dry_run_latency, "Dry run against in-memory store");
        let store = MemoryStore::with_table(config.layout.clone()).without_log();
        store.set_latency(cli.dry_run_latency);
        Arc::new(store)
    } else {
        let store = MySqlStore::connect(&config.store, config.max_connections())
            .await
            .with_context(|| format!("failed to connect to {}", config.store.redacted_url()))?;
        let store = Arc::new(store);
        mysql = Some(Arc::clone(&store));
        store
    };

    let interrupt = CancellationToken::new();
    spawn_interrupt_handler(interrupt.clone());

    let report = Orchestrator::new(config, client)?
        .with_interrupt(interrupt)
        .run()
        .await
        .context("harness run failed")?;

    if let Some(store) = mysql {
        store.close().await;
    }

    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }

    Ok(())
}
