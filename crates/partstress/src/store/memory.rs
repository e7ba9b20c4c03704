//! In-process simulation of a range-partitioned table.
//!
//! `MemoryStore` understands exactly the statements the harness emits
//! (`CREATE TABLE IF NOT EXISTS`, multi-row `INSERT`, `ALTER TABLE ... DROP
//! PARTITION`, `SELECT COUNT(*)` with an optional key range) and applies them
//! with MySQL's range-partition semantics:
//!
//! - a key belongs to the first surviving partition whose `LESS THAN` bound
//!   exceeds it
//! - dropping a partition deletes its rows; later inserts in that range fall
//!   through to the next surviving partition
//! - a key above the highest surviving bound is rejected, failing the whole
//!   statement
//!
//! Each statement sleeps for the configured latency before it is applied, so
//! an INSERT that started before a drop can still land after it. Faults can be
//! injected on inserts and on connection acquisition.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{HarnessError, Result, StatementKind};
use crate::schema::{partition_name, KeyRange, TableLayout};
use crate::store::{RowStoreClient, StoreConnection};

/// One executed statement, as seen by the simulation.
#[derive(Debug, Clone)]
pub struct StatementRecord {
    pub kind: StatementKind,
    /// Connection id; `None` for statements issued through the client.
    pub connection: Option<usize>,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub ok: bool,
    /// Tuples in an INSERT.
    pub rows: usize,
    /// Smallest and largest key of an INSERT.
    pub key_span: Option<(i64, i64)>,
}

#[derive(Default)]
struct MemoryState {
    table_exists: bool,
    /// Ordinals not yet dropped, ascending.
    surviving: Vec<u32>,
    dropped: Vec<u32>,
    /// key -> number of rows with that key
    rows: BTreeMap<i64, u64>,
    log: Vec<StatementRecord>,
    record_log: bool,

    latency: Duration,
    fail_inserts_every: Option<u64>,
    insert_attempts: u64,
    refuse_connections_after: Option<usize>,
    connections_acquired: usize,
    connections_open: usize,
}

struct Inner {
    layout: TableLayout,
    state: Mutex<MemoryState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle; clones share the same simulated table.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

enum Parsed {
    Create { if_not_exists: bool },
    Insert { keys: Vec<i64> },
    Drop { ordinal: u32 },
    Count { range: Option<KeyRange> },
}

impl Parsed {
    fn kind(&self) -> StatementKind {
        match self {
            Parsed::Create { .. } => StatementKind::CreateTable,
            Parsed::Insert { .. } => StatementKind::Insert,
            Parsed::Drop { .. } => StatementKind::DropPartition,
            Parsed::Count { .. } => StatementKind::Count,
        }
    }
}

impl MemoryStore {
    /// A store in which the table does not exist yet.
    pub fn new(layout: TableLayout) -> Self {
        let state = MemoryState {
            record_log: true,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                layout,
                state: Mutex::new(state),
            }),
        }
    }

    /// A store in which the table has already been created.
    pub fn with_table(layout: TableLayout) -> Self {
        let store = Self::new(layout);
        {
            let mut state = store.inner.state();
            state.table_exists = true;
            state.surviving = (0..store.inner.layout.partition_count).collect();
        }
        store
    }

    /// Stop recording the statement log. Long dry runs would otherwise grow it
    /// without bound.
    pub fn without_log(self) -> Self {
        self.inner.state().record_log = false;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.state().latency = latency;
    }

    /// Fail one out of every `n` INSERT attempts, starting with the first.
    pub fn fail_inserts_every(&self, n: u64) {
        self.inner.state().fail_inserts_every = Some(n.max(1));
    }

    /// Refuse connection requests once `n` connections have been handed out.
    pub fn refuse_connections_after(&self, n: usize) {
        self.inner.state().refuse_connections_after = Some(n);
    }

    pub fn layout(&self) -> &TableLayout {
        &self.inner.layout
    }

    pub fn table_exists(&self) -> bool {
        self.inner.state().table_exists
    }

    pub fn dropped_partitions(&self) -> Vec<u32> {
        self.inner.state().dropped.clone()
    }

    pub fn statements(&self) -> Vec<StatementRecord> {
        self.inner.state().log.clone()
    }

    /// Successful INSERT statements.
    pub fn insert_count(&self) -> usize {
        self.inner
            .state()
            .log
            .iter()
            .filter(|r| r.kind == StatementKind::Insert && r.ok)
            .count()
    }

    /// INSERT statements (successful or not) whose keys lie in `range` and
    /// that started strictly after `instant`.
    pub fn inserts_started_after(&self, range: KeyRange, instant: Instant) -> usize {
        self.inner
            .state()
            .log
            .iter()
            .filter(|r| r.kind == StatementKind::Insert && r.started_at > instant)
            .filter(|r| matches!(r.key_span, Some((lo, _)) if range.contains(lo)))
            .count()
    }

    /// Successful INSERT statements whose keys lie in `range`.
    pub fn inserts_into(&self, range: KeyRange) -> usize {
        self.inner
            .state()
            .log
            .iter()
            .filter(|r| r.kind == StatementKind::Insert && r.ok)
            .filter(|r| matches!(r.key_span, Some((lo, _)) if range.contains(lo)))
            .count()
    }

    pub fn row_count(&self) -> u64 {
        self.inner.state().rows.values().sum()
    }

    pub fn rows_in_range(&self, range: KeyRange) -> u64 {
        self.inner
            .state()
            .rows
            .range(range.lo..range.hi)
            .map(|(_, n)| n)
            .sum()
    }

    /// Distinct keys currently stored.
    pub fn keys(&self) -> Vec<i64> {
        self.inner.state().rows.keys().copied().collect()
    }

    pub fn connections_acquired(&self) -> usize {
        self.inner.state().connections_acquired
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state().connections_open
    }

    async fn run(&self, sql: &str, connection: Option<usize>) -> Result<u64> {
        let parsed = self.parse(sql)?;
        let kind = parsed.kind();
        let started_at = Instant::now();

        let latency = self.inner.state().latency;
        if latency.is_zero() {
            // Keep tight worker loops from starving the scheduler.
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.inner.state();
        let (rows, key_span) = match &parsed {
            Parsed::Insert { keys } => (
                keys.len(),
                keys.iter().min().zip(keys.iter().max()).map(|(a, b)| (*a, *b)),
            ),
            _ => (0, None),
        };
        let result = self.apply(&mut state, parsed);

        if state.record_log {
            state.log.push(StatementRecord {
                kind,
                connection,
                started_at,
                finished_at: Instant::now(),
                ok: result.is_ok(),
                rows,
                key_span,
            });
        }
        result
    }

    fn apply(&self, state: &mut MemoryState, parsed: Parsed) -> Result<u64> {
        let layout = &self.inner.layout;
        let table = layout.table.as_str();

        match parsed {
            Parsed::Create { if_not_exists } => {
                if state.table_exists {
                    if if_not_exists {
                        return Ok(0);
                    }
                    return Err(HarnessError::statement(
                        StatementKind::CreateTable,
                        format!("Table '{}' already exists", table),
                    ));
                }
                state.table_exists = true;
                state.surviving = (0..layout.partition_count).collect();
                state.dropped.clear();
                state.rows.clear();
                Ok(0)
            }
            Parsed::Insert { keys } => {
                ensure_table(state, table, StatementKind::Insert)?;
                state.insert_attempts += 1;
                if let Some(n) = state.fail_inserts_every {
                    if (state.insert_attempts - 1) % n == 0 {
                        return Err(HarnessError::statement(
                            StatementKind::Insert,
                            "Lock wait timeout exceeded (injected)",
                        ));
                    }
                }
                for &key in &keys {
                    if self.owning_partition(state, key).is_none() {
                        return Err(HarnessError::statement(
                            StatementKind::Insert,
                            format!("Table has no partition for value {}", key),
                        ));
                    }
                }
                for &key in &keys {
                    *state.rows.entry(key).or_insert(0) += 1;
                }
                Ok(keys.len() as u64)
            }
            Parsed::Drop { ordinal } => {
                ensure_table(state, table, StatementKind::DropPartition)?;
                let Some(pos) = state.surviving.iter().position(|&p| p == ordinal) else {
                    return Err(HarnessError::statement(
                        StatementKind::DropPartition,
                        format!(
                            "Error in list of partitions to DROP: {}",
                            partition_name(ordinal)
                        ),
                    ));
                };
                if state.surviving.len() == 1 {
                    return Err(HarnessError::statement(
                        StatementKind::DropPartition,
                        "Cannot remove all partitions, use DROP TABLE instead",
                    ));
                }

                let lower = match pos {
                    0 => i64::MIN,
                    _ => layout
                        .declared_upper_bound(state.surviving[pos - 1])
                        .unwrap_or(i64::MAX),
                };
                let upper = layout.declared_upper_bound(ordinal).unwrap_or(i64::MAX);
                let doomed: Vec<i64> = state.rows.range(lower..upper).map(|(k, _)| *k).collect();
                let mut removed = 0;
                for key in doomed {
                    removed += state.rows.remove(&key).unwrap_or(0);
                }

                state.surviving.remove(pos);
                state.dropped.push(ordinal);
                Ok(removed)
            }
            Parsed::Count { range } => {
                ensure_table(state, table, StatementKind::Count)?;
                let count: u64 = match range {
                    Some(r) => state.rows.range(r.lo..r.hi).map(|(_, n)| n).sum(),
                    None => state.rows.values().sum(),
                };
                Ok(count)
            }
        }
    }

    fn owning_partition(&self, state: &MemoryState, key: i64) -> Option<u32> {
        state.surviving.iter().copied().find(|&ordinal| {
            match self.inner.layout.declared_upper_bound(ordinal) {
                Some(hi) => key < hi,
                None => true,
            }
        })
    }

    fn parse(&self, sql: &str) -> Result<Parsed> {
        let text = sql.trim();
        let upper = text.to_ascii_uppercase();

        if upper.starts_with("CREATE TABLE") {
            return Ok(Parsed::Create {
                if_not_exists: upper.starts_with("CREATE TABLE IF NOT EXISTS"),
            });
        }
        if upper.starts_with("INSERT INTO") {
            return parse_insert_keys(text, &upper).map(|keys| Parsed::Insert { keys });
        }
        if upper.starts_with("ALTER TABLE") {
            if let Some(idx) = upper.find("DROP PARTITION") {
                let name = text[idx + "DROP PARTITION".len()..].trim();
                let ordinal = name
                    .strip_prefix('p')
                    .or_else(|| name.strip_prefix('P'))
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| {
                        HarnessError::statement(
                            StatementKind::DropPartition,
                            format!("Error in list of partitions to DROP: {}", name),
                        )
                    })?;
                return Ok(Parsed::Drop { ordinal });
            }
        }
        if upper.starts_with("SELECT COUNT(*)") {
            let range = match upper.find(" WHERE ") {
                Some(idx) => Some(parse_range(&upper[idx..]).ok_or_else(|| {
                    HarnessError::statement(StatementKind::Count, "unsupported WHERE clause")
                })?),
                None => None,
            };
            return Ok(Parsed::Count { range });
        }

        Err(HarnessError::statement(
            StatementKind::Unsupported,
            truncate(text, 60),
        ))
    }
}

fn ensure_table(state: &MemoryState, table: &str, kind: StatementKind) -> Result<()> {
    if state.table_exists {
        Ok(())
    } else {
        Err(HarnessError::statement(
            kind,
            format!("Table '{}' doesn't exist", table),
        ))
    }
}

/// First value of every tuple after `VALUES`.
fn parse_insert_keys(text: &str, upper: &str) -> Result<Vec<i64>> {
    let malformed = || HarnessError::statement(StatementKind::Insert, "malformed VALUES list");
    let start = upper.find("VALUES").ok_or_else(malformed)? + "VALUES".len();

    let mut keys = Vec::new();
    let mut in_quote = false;
    let mut token: Option<String> = None;

    for c in text[start..].chars() {
        if in_quote {
            if c == '\'' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => token = Some(String::new()),
            ',' | ')' => {
                if let Some(t) = token.take() {
                    keys.push(t.trim().parse::<i64>().map_err(|_| malformed())?);
                }
            }
            _ => {
                if let Some(t) = token.as_mut() {
                    t.push(c);
                }
            }
        }
    }

    if keys.is_empty() {
        return Err(malformed());
    }
    Ok(keys)
}

/// `WHERE <col> >= lo AND <col> < hi`
fn parse_range(clause: &str) -> Option<KeyRange> {
    let lo = clause.split(">=").nth(1)?.split_whitespace().next()?.parse().ok()?;
    let hi = clause.split(" < ").nth(1)?.split_whitespace().next()?.parse().ok()?;
    Some(KeyRange::new(lo, hi))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

struct MemoryConnection {
    id: usize,
    store: MemoryStore,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.store.inner.state();
        state.connections_open = state.connections_open.saturating_sub(1);
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.store.run(sql, Some(self.id)).await
    }
}

#[async_trait]
impl RowStoreClient for MemoryStore {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>> {
        let id = {
            let mut state = self.inner.state();
            if let Some(limit) = state.refuse_connections_after {
                if state.connections_acquired >= limit {
                    return Err(HarnessError::Connection(
                        "Too many connections (injected)".to_string(),
                    ));
                }
            }
            state.connections_acquired += 1;
            state.connections_open += 1;
            state.connections_acquired
        };
        Ok(Box::new(MemoryConnection {
            id,
            store: self.clone(),
        }))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.run(sql, None).await
    }

    async fn fetch_count(&self, sql: &str) -> Result<i64> {
        let count = self.run(sql, None).await?;
        Ok(count as i64)
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.inner.layout.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::SyntheticRow;

    fn rows(keys: &[i64]) -> Vec<SyntheticRow> {
        keys.iter()
            .map(|&key| SyntheticRow {
                key,
                fields: vec!["xy".to_string(), "zz".to_string()],
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_table_is_idempotent() {
        let layout = TableLayout::default();
        let store = MemoryStore::new(layout.clone());
        assert!(!store.table_exists());

        store.execute(&layout.create_table_sql()).await.unwrap();
        store
            .execute(&layout.insert_sql(&rows(&[1, 2, 3])))
            .await
            .unwrap();
        store.execute(&layout.create_table_sql()).await.unwrap();

        assert!(store.table_exists());
        assert_eq!(store.row_count(), 3);
    }

    #[tokio::test]
    async fn test_insert_without_table_fails() {
        let layout = TableLayout::default();
        let store = MemoryStore::new(layout.clone());
        let err = store
            .execute(&layout.insert_sql(&rows(&[1])))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[tokio::test]
    async fn test_insert_counts_tuples() {
        let layout = TableLayout::default();
        let store = MemoryStore::with_table(layout.clone());
        let affected = store
            .execute(&layout.insert_sql(&rows(&[10, 11, 11, 12])))
            .await
            .unwrap();
        assert_eq!(affected, 4);
        assert_eq!(store.keys(), vec![10, 11, 12]);
        assert_eq!(store.rows_in_range(KeyRange::new(11, 12)), 2);
    }

    #[tokio::test]
    async fn test_drop_clears_range_and_reroutes() {
        let layout = TableLayout::default();
        let store = MemoryStore::with_table(layout.clone());
        store
            .execute(&layout.insert_sql(&rows(&[100, 6000])))
            .await
            .unwrap();

        let removed = store.execute(&layout.drop_partition_sql(0)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.rows_in_range(KeyRange::new(0, 5000)), 0);
        assert_eq!(store.row_count(), 1);

        // p1 now owns everything below 10000
        store
            .execute(&layout.insert_sql(&rows(&[200])))
            .await
            .unwrap();
        assert_eq!(store.rows_in_range(KeyRange::new(0, 5000)), 1);
        assert_eq!(store.dropped_partitions(), vec![0]);
    }

    #[tokio::test]
    async fn test_drop_maxvalue_partition_rejects_high_keys() {
        let layout = TableLayout::default();
        let store = MemoryStore::with_table(layout.clone());
        store.execute(&layout.drop_partition_sql(3)).await.unwrap();

        let err = store
            .execute(&layout.insert_sql(&rows(&[16000])))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no partition for value 16000"));
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_twice_fails() {
        let layout = TableLayout::default();
        let store = MemoryStore::with_table(layout.clone());
        store.execute(&layout.drop_partition_sql(2)).await.unwrap();
        assert!(store.execute(&layout.drop_partition_sql(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_cannot_drop_last_partition() {
        let mut layout = TableLayout::default();
        layout.partition_count = 1;
        let store = MemoryStore::with_table(layout.clone());
        assert!(store.execute(&layout.drop_partition_sql(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_count_queries() {
        let layout = TableLayout::default();
        let store = MemoryStore::with_table(layout.clone());
        store
            .execute(&layout.insert_sql(&rows(&[1, 2, 5001])))
            .await
            .unwrap();

        assert_eq!(store.fetch_count(&layout.count_sql()).await.unwrap(), 3);
        let p0 = layout.key_range(0).unwrap();
        assert_eq!(
            store.fetch_count(&layout.count_range_sql(p0)).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_injected_insert_failures() {
        let layout = TableLayout::default();
        let store = MemoryStore::with_table(layout.clone());
        store.fail_inserts_every(2);

        let sql = layout.insert_sql(&rows(&[1]));
        assert!(store.execute(&sql).await.is_err());
        assert!(store.execute(&sql).await.is_ok());
        assert!(store.execute(&sql).await.is_err());
        assert_eq!(store.insert_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_accounting() {
        let store = MemoryStore::with_table(TableLayout::default());
        store.refuse_connections_after(2);

        let a = store.acquire().await.unwrap();
        let b = store.acquire().await.unwrap();
        assert!(store.acquire().await.is_err());
        assert_eq!(store.open_connections(), 2);

        drop(a);
        drop(b);
        assert_eq!(store.open_connections(), 0);
        assert_eq!(store.connections_acquired(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_statement() {
        let store = MemoryStore::with_table(TableLayout::default());
        match store.execute("DELETE FROM t WHERE id < 10").await {
            Err(HarnessError::Statement { kind, message }) => {
                assert_eq!(kind, StatementKind::Unsupported);
                assert_eq!(message, "DELETE FROM t WHERE id < 10");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(store.statements().is_empty());
    }
}
