//! Partition controller.
//!
//! A drop has two halves: flip the partition's stop signal and issue
//! `ALTER TABLE ... DROP PARTITION`. Their order is a [`DropOrder`] policy.
//! Signaling first narrows, but does not close, the window in which a worker
//! submits an INSERT against a partition that is being dropped: the signal
//! is only polled between statements, and the statement in flight is never
//! interrupted. That race is what the harness is here to observe.
//!
//! Drop failures are logged and recorded; they never stop the run.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::DropOrder;
use crate::error::{HarnessError, Result, StatementKind};
use crate::registry::{Partition, PartitionRegistry};
use crate::report::DropReport;
use crate::schema::{partition_name, TableLayout};
use crate::store::RowStoreClient;

pub struct PartitionController {
    client: Arc<dyn RowStoreClient>,
    registry: PartitionRegistry,
    layout: Arc<TableLayout>,
    order: DropOrder,
}

impl PartitionController {
    pub fn new(
        client: Arc<dyn RowStoreClient>,
        registry: PartitionRegistry,
        layout: Arc<TableLayout>,
        order: DropOrder,
    ) -> Self {
        Self {
            client,
            registry,
            layout,
            order,
        }
    }

    /// Stop the partition's workers and drop it from the store.
    pub async fn drop_partition(&self, ordinal: u32) -> DropReport {
        let issued_at = Utc::now();
        let start = Instant::now();

        let partition = match self.registry.get(ordinal) {
            Ok(p) => p,
            Err(e) => {
                error!(partition = ordinal, error = %e, "Cannot drop partition");
                return DropReport {
                    partition: ordinal,
                    name: partition_name(ordinal),
                    order: self.order,
                    signaled: false,
                    ok: false,
                    error: Some(e.to_string()),
                    issued_at,
                    elapsed_ms: 0,
                };
            }
        };

        info!(
            partition = ordinal,
            order = ?self.order,
            at = %issued_at,
            "Dropping partition"
        );

        let (signaled, result) = match self.order {
            DropOrder::SignalThenDrop => {
                let signaled = partition.stop();
                (signaled, self.issue_drop(&partition).await)
            }
            DropOrder::DropThenSignal => {
                let result = self.issue_drop(&partition).await;
                (partition.stop(), result)
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let error = match &result {
            Ok(()) => {
                info!(partition = ordinal, elapsed_ms, "Partition dropped");
                None
            }
            Err(e) => {
                error!(partition = ordinal, error = %e, "Drop partition failed");
                Some(e.to_string())
            }
        };

        DropReport {
            partition: ordinal,
            name: partition.name().to_string(),
            order: self.order,
            signaled,
            ok: result.is_ok(),
            error,
            issued_at,
            elapsed_ms,
        }
    }

    async fn issue_drop(&self, partition: &Partition) -> Result<()> {
        let sql = self.layout.drop_partition_sql(partition.ordinal());
        self.client
            .execute(&sql)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                HarnessError::Statement { .. } => e,
                other => HarnessError::statement(StatementKind::DropPartition, other.to_string()),
            })
    }
}
