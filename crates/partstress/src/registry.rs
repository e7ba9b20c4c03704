//! Partition registry.
//!
//! Built once from the [`TableLayout`] and never resized. Each [`Partition`]
//! carries its key range and a one-shot stop signal. The signal is a
//! `CancellationToken`: setting it is idempotent, it never resets, and every
//! clone handed to a worker observes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{HarnessError, Result};
use crate::schema::{partition_name, KeyRange, TableLayout};

#[derive(Debug)]
pub struct Partition {
    ordinal: u32,
    name: String,
    range: KeyRange,
    stop: CancellationToken,
    flipped: AtomicBool,
}

impl Partition {
    pub fn new(ordinal: u32, range: KeyRange) -> Self {
        Self {
            ordinal,
            name: partition_name(ordinal),
            range,
            stop: CancellationToken::new(),
            flipped: AtomicBool::new(false),
        }
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    /// Set the stop signal. Returns `true` only for the call that flipped it.
    pub fn stop(&self) -> bool {
        if self.flipped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// A handle workers can poll or await.
    pub fn stop_signal(&self) -> CancellationToken {
        self.stop.clone()
    }
}

#[derive(Debug, Clone)]
pub struct PartitionRegistry {
    partitions: Vec<Arc<Partition>>,
}

impl PartitionRegistry {
    pub fn from_layout(layout: &TableLayout) -> Self {
        let partitions = (0..layout.partition_count)
            .filter_map(|ordinal| {
                layout
                    .key_range(ordinal)
                    .map(|range| Arc::new(Partition::new(ordinal, range)))
            })
            .collect();
        Self { partitions }
    }

    pub fn get(&self, ordinal: u32) -> Result<Arc<Partition>> {
        self.partitions
            .get(ordinal as usize)
            .cloned()
            .ok_or(HarnessError::UnknownPartition(ordinal))
    }

    pub fn all(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Signal every partition. Returns how many were still running.
    pub fn stop_all(&self) -> usize {
        self.partitions.iter().filter(|p| p.stop()).count()
    }
}
