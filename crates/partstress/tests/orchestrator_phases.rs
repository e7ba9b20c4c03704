//! Integration tests for the phase orchestrator, on paused tokio time

use std::sync::Arc;
use std::time::Duration;

use partstress::{
    CountPolicy, HarnessConfig, HarnessError, KeyRange, LoadConfig, MemoryStore, Orchestrator,
    PhaseConfig, RunPhase, TableLayout, WorkerOutcome,
};
use tokio_util::sync::CancellationToken;

const SECOND: Duration = Duration::from_secs(1);

fn config(phases: PhaseConfig) -> HarnessConfig {
    HarnessConfig {
        layout: TableLayout {
            partition_width: 100,
            ..TableLayout::default()
        },
        load: LoadConfig {
            concurrency: 2,
            batch_size: 2,
            seed: Some(3),
            ..LoadConfig::default()
        },
        phases,
        ..HarnessConfig::default()
    }
}

fn short_phases() -> PhaseConfig {
    PhaseConfig {
        warmup: true,
        warmup_duration: SECOND,
        drop_test: true,
        drop_delay: SECOND,
        drain_duration: SECOND,
        ..PhaseConfig::default()
    }
}

fn store_for(config: &HarnessConfig) -> MemoryStore {
    let store = MemoryStore::new(config.layout.clone());
    store.set_latency(Duration::from_millis(5));
    store
}

#[tokio::test(start_paused = true)]
async fn test_full_run_visits_every_phase_in_order() {
    let config = config(PhaseConfig {
        count_policy: CountPolicy::BeforeDrop,
        verify_dropped: true,
        ..short_phases()
    });
    let store = store_for(&config);

    let report = Orchestrator::new(config, Arc::new(store.clone()))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(
        report.phase_sequence(),
        vec![
            RunPhase::Idle,
            RunPhase::WarmupInsert,
            RunPhase::LiveTraffic,
            RunPhase::AwaitingDrop,
            RunPhase::Dropping,
            RunPhase::Draining,
            RunPhase::Done,
        ]
    );
    assert!(!report.interrupted);
    assert!(report.phases[2].offset_ms >= 1000);
    assert!(report.phases[4].offset_ms >= 2000);

    assert!(store.table_exists());
    assert_eq!(store.dropped_partitions(), vec![0, 2, 3]);
    assert!(report.drops.iter().all(|d| d.ok && d.signaled));

    // Warm-up already put workers on p1; LiveTraffic must not double them.
    assert_eq!(report.partitions.len(), 4);
    assert_eq!(report.partition(1).unwrap().workers_started, 2);
    assert!(report.partition(1).unwrap().statements_ok() > 0);
    assert_eq!(report.abandoned_workers(), 0);
    assert!(report
        .partitions
        .iter()
        .flat_map(|p| &p.workers)
        .all(|w| w.outcome == WorkerOutcome::Stopped));

    let table_count = &report.counts[0];
    assert_eq!(table_count.phase, RunPhase::AwaitingDrop);
    assert_eq!(table_count.partition, None);
    assert!(table_count.count.unwrap() > 0);

    let verified: Vec<_> = report.counts[1..].iter().collect();
    assert_eq!(verified.len(), 3);
    for count in verified {
        assert_eq!(count.phase, RunPhase::Draining);
        // At most one in-flight batch per worker survives the drop.
        assert!(count.count.unwrap() <= 4);
    }
    assert_eq!(report.counts[1].range, Some(KeyRange::new(0, 100)));
    assert_eq!(store.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_warmup_only_goes_straight_to_done() {
    let config = config(PhaseConfig {
        drop_test: false,
        ..short_phases()
    });
    let store = store_for(&config);

    let report = Orchestrator::new(config, Arc::new(store.clone()))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(
        report.phase_sequence(),
        vec![RunPhase::Idle, RunPhase::WarmupInsert, RunPhase::Done]
    );
    assert!(report.drops.is_empty());
    assert!(store.dropped_partitions().is_empty());
    assert_eq!(report.partitions.len(), 4);
    assert!(report.partitions.iter().all(|p| p.statements_ok() > 0));
}

#[tokio::test(start_paused = true)]
async fn test_drop_test_without_warmup_loads_only_live_partitions() {
    let config = config(PhaseConfig {
        warmup: false,
        drop_targets: vec![0],
        live_partitions: vec![1, 2],
        ..short_phases()
    });
    let store = MemoryStore::with_table(config.layout.clone());
    store.set_latency(Duration::from_millis(5));

    let report = Orchestrator::new(config, Arc::new(store.clone()))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(
        report.phase_sequence(),
        vec![
            RunPhase::Idle,
            RunPhase::LiveTraffic,
            RunPhase::AwaitingDrop,
            RunPhase::Dropping,
            RunPhase::Draining,
            RunPhase::Done,
        ]
    );
    let loaded: Vec<u32> = report.partitions.iter().map(|p| p.partition).collect();
    assert_eq!(loaded, vec![1, 2]);
    assert_eq!(store.inserts_into(KeyRange::new(0, 100)), 0);
    assert_eq!(store.dropped_partitions(), vec![0]);
    // Dropping an idle partition signals it even though nothing listens.
    assert!(report.drops[0].signaled);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_jumps_to_done_and_drains() {
    let config = config(PhaseConfig {
        warmup: false,
        drop_delay: Duration::from_secs(3600),
        ..short_phases()
    });
    let store = MemoryStore::with_table(config.layout.clone());
    store.set_latency(Duration::from_millis(5));

    let interrupt = CancellationToken::new();
    let orchestrator = Orchestrator::new(config, Arc::new(store.clone()))
        .unwrap()
        .with_interrupt(interrupt.clone());
    let mut phases = orchestrator.subscribe();

    tokio::spawn(async move {
        phases
            .wait_for(|p| *p == RunPhase::AwaitingDrop)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        interrupt.cancel();
    });

    let report = orchestrator.run().await.unwrap();

    assert!(report.interrupted);
    assert_eq!(
        report.phase_sequence(),
        vec![
            RunPhase::Idle,
            RunPhase::LiveTraffic,
            RunPhase::AwaitingDrop,
            RunPhase::Done,
        ]
    );
    assert!(report.drops.is_empty());
    assert!(store.dropped_partitions().is_empty());
    assert!(report.phases[3].offset_ms < 1000);
    assert_eq!(report.abandoned_workers(), 0);
    assert!(report.partition(1).unwrap().statements_ok() > 0);
    assert_eq!(store.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_statement_failures_do_not_stop_the_run() {
    let config = config(PhaseConfig {
        warmup: false,
        count_policy: CountPolicy::BeforeLive,
        ..short_phases()
    });
    // No table: every insert, drop and count fails.
    let store = store_for(&config);

    let report = Orchestrator::new(config, Arc::new(store.clone()))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.phase_sequence().last(), Some(&RunPhase::Done));
    assert_eq!(report.counts.len(), 1);
    assert_eq!(report.counts[0].phase, RunPhase::Idle);
    assert!(report.counts[0].error.as_deref().unwrap().contains("doesn't exist"));
    assert_eq!(report.drops.len(), 3);
    assert!(report.drops.iter().all(|d| !d.ok && d.error.is_some()));
    assert_eq!(report.statements_ok(), 0);
    assert!(report.statements_failed() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_refusals_shrink_concurrency() {
    let config = config(PhaseConfig {
        warmup: false,
        live_partitions: vec![1],
        ..short_phases()
    });
    let store = MemoryStore::with_table(config.layout.clone());
    store.set_latency(Duration::from_millis(5));
    store.refuse_connections_after(1);

    let report = Orchestrator::new(config, Arc::new(store))
        .unwrap()
        .run()
        .await
        .unwrap();

    let p1 = report.partition(1).unwrap();
    assert_eq!(p1.workers_requested, 2);
    assert_eq!(p1.workers_started, 1);
    assert_eq!(report.connection_failures(), 1);
}

#[test]
fn test_invalid_config_is_rejected_before_running() {
    let config = config(PhaseConfig {
        drop_targets: vec![0, 7],
        ..short_phases()
    });
    let store = MemoryStore::new(config.layout.clone());

    match Orchestrator::new(config, Arc::new(store)) {
        Err(HarnessError::UnknownPartition(7)) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("config with unknown drop target accepted"),
    }
}
