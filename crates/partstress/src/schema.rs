//! Table layout and the SQL text the harness issues.
//!
//! The table is range-partitioned on an integer key into `partition_count`
//! contiguous partitions of equal width. Partition `pN` owns
//! `[N * width, (N + 1) * width)`; the last partition is declared
//! `VALUES LESS THAN MAXVALUE` but workers still generate keys inside
//! `[lo, lo + width)` for it.
//!
//! ```text
//! p0: [0, 5000)   p1: [5000, 10000)   p2: [10000, 15000)   p3: [15000, MAXVALUE)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::generator::SyntheticRow;

/// Half-open numeric key range `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lo: i64,
    pub hi: i64,
}

impl KeyRange {
    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    pub fn width(&self) -> i64 {
        self.hi - self.lo
    }

    pub fn contains(&self, key: i64) -> bool {
        key >= self.lo && key < self.hi
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.lo, self.hi)
    }
}

/// A fixed-width text column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub width: usize,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            width,
        }
    }
}

/// Name of the partition with the given ordinal.
pub fn partition_name(ordinal: u32) -> String {
    format!("p{}", ordinal)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLayout {
    pub table: String,
    pub key_column: String,
    pub columns: Vec<ColumnSpec>,
    pub partition_count: u32,
    pub partition_width: i64,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            table: "t".to_string(),
            key_column: "id".to_string(),
            columns: vec![
                ColumnSpec::new("c1", 64),
                ColumnSpec::new("c2", 128),
                ColumnSpec::new("c3", 64),
                ColumnSpec::new("c4", 128),
                ColumnSpec::new("c5", 64),
            ],
            partition_count: 4,
            partition_width: 5000,
        }
    }
}

impl TableLayout {
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.table) {
            return Err(HarnessError::Config(format!(
                "invalid table name: '{}'",
                self.table
            )));
        }
        if !is_identifier(&self.key_column) {
            return Err(HarnessError::Config(format!(
                "invalid key column: '{}'",
                self.key_column
            )));
        }
        for column in &self.columns {
            if !is_identifier(&column.name) || column.name == self.key_column {
                return Err(HarnessError::Config(format!(
                    "invalid column name: '{}'",
                    column.name
                )));
            }
            if column.width == 0 || column.width > 255 {
                return Err(HarnessError::Config(format!(
                    "column {} width must be in 1..=255, got {}",
                    column.name, column.width
                )));
            }
        }
        if self.partition_count == 0 {
            return Err(HarnessError::Config(
                "partition_count must be at least 1".to_string(),
            ));
        }
        if self.partition_width <= 0 {
            return Err(HarnessError::Config(
                "partition_width must be positive".to_string(),
            ));
        }
        // The key column is a signed 32-bit INT.
        let max_key = i32::MAX as i64;
        match (self.partition_count as i64).checked_mul(self.partition_width) {
            Some(end) if end - 1 <= max_key => {}
            _ => {
                return Err(HarnessError::Config(format!(
                    "{} partitions of width {} exceed the INT key column (max key {})",
                    self.partition_count, self.partition_width, max_key
                )));
            }
        }
        Ok(())
    }

    /// Key range owned by a partition, for key generation. The last
    /// partition's declared bound is MAXVALUE but generation stays within one
    /// partition width.
    pub fn key_range(&self, ordinal: u32) -> Option<KeyRange> {
        if ordinal >= self.partition_count {
            return None;
        }
        let lo = ordinal as i64 * self.partition_width;
        Some(KeyRange::new(lo, lo + self.partition_width))
    }

    /// Declared upper bound of a partition; `None` is MAXVALUE.
    pub fn declared_upper_bound(&self, ordinal: u32) -> Option<i64> {
        if ordinal + 1 >= self.partition_count {
            None
        } else {
            Some((ordinal as i64 + 1) * self.partition_width)
        }
    }

    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {} INT NOT NULL",
            self.table, self.key_column
        );
        for column in &self.columns {
            sql.push_str(&format!(",\n    {} CHAR({})", column.name, column.width));
        }
        sql.push_str(&format!(
            "\n)\nPARTITION BY RANGE ({}) (",
            self.key_column
        ));
        for ordinal in 0..self.partition_count {
            if ordinal > 0 {
                sql.push(',');
            }
            let bound = match self.declared_upper_bound(ordinal) {
                Some(hi) => hi.to_string(),
                None => "MAXVALUE".to_string(),
            };
            sql.push_str(&format!(
                "\n    PARTITION {} VALUES LESS THAN ({})",
                partition_name(ordinal),
                bound
            ));
        }
        sql.push_str("\n)");
        sql
    }

    /// One multi-row INSERT covering every row of the batch.
    ///
    /// Payloads are alphanumeric, so they are embedded as literals without
    /// escaping.
    pub fn insert_sql(&self, rows: &[SyntheticRow]) -> String {
        let row_width: usize = self.columns.iter().map(|c| c.width + 4).sum::<usize>() + 16;
        let mut sql = String::with_capacity(32 + rows.len() * row_width);
        sql.push_str("INSERT INTO ");
        sql.push_str(&self.table);
        sql.push_str(" VALUES ");

        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            sql.push_str(&row.key.to_string());
            for field in &row.fields {
                sql.push_str(", '");
                sql.push_str(field);
                sql.push('\'');
            }
            sql.push(')');
        }

        sql
    }

    pub fn drop_partition_sql(&self, ordinal: u32) -> String {
        format!(
            "ALTER TABLE {} DROP PARTITION {}",
            self.table,
            partition_name(ordinal)
        )
    }

    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {}", self.table)
    }

    pub fn count_range_sql(&self, range: KeyRange) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE {} >= {} AND {} < {}",
            self.table, self.key_column, range.lo, self.key_column, range.hi
        )
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
