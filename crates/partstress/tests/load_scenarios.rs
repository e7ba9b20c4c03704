//! Load generator and partition controller scenarios against the in-memory store

use std::sync::Arc;
use std::time::Duration;

use partstress::{
    DropOrder, KeyRange, LoadConfig, LoadGenerator, MemoryStore, PartitionController,
    PartitionRegistry, RowStoreClient, StatementKind, TableLayout,
};
use tokio::time::Instant;

fn layout(partitions: u32, width: i64) -> TableLayout {
    TableLayout {
        partition_count: partitions,
        partition_width: width,
        ..TableLayout::default()
    }
}

fn load_config(concurrency: usize, batch_size: usize) -> LoadConfig {
    LoadConfig {
        concurrency,
        batch_size,
        seed: Some(42),
        ..LoadConfig::default()
    }
}

fn harness(
    store: &MemoryStore,
    load: LoadConfig,
) -> (LoadGenerator, PartitionRegistry, PartitionController) {
    let layout = store.layout().clone();
    let registry = PartitionRegistry::from_layout(&layout);
    let client: Arc<dyn RowStoreClient> = Arc::new(store.clone());
    let generator = LoadGenerator::new(Arc::clone(&client), layout.clone(), load);
    let controller = PartitionController::new(
        client,
        registry.clone(),
        Arc::new(layout),
        DropOrder::SignalThenDrop,
    );
    (generator, registry, controller)
}

/// INSERTs into `range` that started in `[from, to)`.
fn inserts_started_between(
    store: &MemoryStore,
    range: KeyRange,
    from: Instant,
    to: Instant,
) -> usize {
    store
        .statements()
        .iter()
        .filter(|s| s.kind == StatementKind::Insert)
        .filter(|s| s.started_at >= from && s.started_at < to)
        .filter(|s| matches!(s.key_span, Some((lo, _)) if range.contains(lo)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_single_partition_keys_stay_in_range() {
    let store = MemoryStore::with_table(layout(1, 100));
    store.set_latency(Duration::from_millis(1));
    let (mut load, registry, _) = harness(&store, load_config(4, 2));

    let p0 = registry.get(0).unwrap();
    assert_eq!(load.spawn(load.job_for(p0)).await, 4);

    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.stop_all();
    let reports = load.drain(Duration::from_secs(1)).await;

    assert!(store.insert_count() > 0);
    assert_eq!(reports[0].statements_ok() as usize, store.insert_count());
    assert!(store.keys().iter().all(|k| (0..100).contains(k)));
}

#[tokio::test(start_paused = true)]
async fn test_insert_carries_exactly_batch_size_tuples() {
    let store = MemoryStore::with_table(layout(2, 1000));
    store.set_latency(Duration::from_millis(1));
    let (mut load, registry, _) = harness(&store, load_config(2, 7));

    load.spawn(load.job_for(registry.get(1).unwrap())).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.stop_all();
    load.drain(Duration::from_secs(1)).await;

    let inserts: Vec<_> = store
        .statements()
        .into_iter()
        .filter(|s| s.kind == StatementKind::Insert)
        .collect();
    assert!(!inserts.is_empty());
    for insert in inserts {
        assert_eq!(insert.rows, 7);
        let (lo, hi) = insert.key_span.unwrap();
        assert_eq!(hi - lo, 6);
        assert!(KeyRange::new(1000, 2000).contains(lo));
    }
}

#[tokio::test(start_paused = true)]
async fn test_live_partition_keeps_inserting_after_drop() {
    let store = MemoryStore::with_table(layout(2, 100));
    store.set_latency(Duration::from_millis(1));
    let (mut load, registry, controller) = harness(&store, load_config(4, 2));

    let p0 = registry.get(0).unwrap();
    let p1 = registry.get(1).unwrap();
    let started = Instant::now();
    load.spawn(load.job_for(p0.clone())).await;
    load.spawn(load.job_for(p1.clone())).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let signaled_at = Instant::now();
    let drop = controller.drop_partition(0).await;
    assert!(drop.ok);
    let dropped_at = Instant::now();

    tokio::time::sleep(Duration::from_millis(20)).await;

    // No new INSERT targets p0 once its signal is set.
    assert_eq!(store.inserts_started_after(p0.range(), signaled_at), 0);
    assert!(!p1.is_stopped());

    // p1 runs at the same pace after the drop as before it.
    let window = signaled_at - started;
    let before = inserts_started_between(&store, p1.range(), started, signaled_at);
    let after = inserts_started_between(&store, p1.range(), dropped_at, dropped_at + window);
    assert!(before > 0);
    assert_eq!(before, after);

    registry.stop_all();
    let reports = load.drain(Duration::from_secs(1)).await;
    assert!(reports.iter().all(|r| r.aborted() == 0));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_range_holds_only_racing_rows() {
    let store = MemoryStore::with_table(layout(3, 100));
    store.set_latency(Duration::from_millis(3));
    let (concurrency, batch) = (4, 5);
    let (mut load, registry, controller) = harness(&store, load_config(concurrency, batch));

    for partition in registry.all().to_vec() {
        load.spawn(load.job_for(partition)).await;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(store.rows_in_range(KeyRange::new(0, 100)) > 0);

    assert!(controller.drop_partition(0).await.ok);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let leftover = store.rows_in_range(KeyRange::new(0, 100));
    assert!(leftover <= (concurrency * batch) as u64);

    let count = store
        .fetch_count("SELECT COUNT(*) FROM t WHERE id >= 0 AND id < 100")
        .await
        .unwrap();
    assert_eq!(count as u64, leftover);

    registry.stop_all();
    load.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_create_table_if_not_exists_is_idempotent() {
    let layout = layout(4, 5000);
    let store = MemoryStore::new(layout.clone());
    let sql = layout.create_table_sql();

    store.execute(&sql).await.unwrap();
    store
        .execute("INSERT INTO t VALUES (1, 'a', 'b', 'c', 'd', 'e')")
        .await
        .unwrap();
    store.execute(&sql).await.unwrap();

    assert!(store.table_exists());
    assert_eq!(store.row_count(), 1);
    assert!(store.dropped_partitions().is_empty());
}

#[tokio::test]
async fn test_insert_into_missing_table_is_counted_not_fatal() {
    let store = MemoryStore::new(layout(1, 100));
    let (mut load, registry, _) = harness(&store, load_config(1, 2));

    load.spawn(load.job_for(registry.get(0).unwrap())).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    registry.stop_all();
    let reports = load.drain(Duration::from_secs(1)).await;

    let worker = &reports[0].workers[0];
    assert_eq!(worker.statements_ok, 0);
    assert!(worker.statements_failed > 0);
}
