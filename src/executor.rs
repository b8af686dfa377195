//! Copies and verifies a single migration unit.
//!
//! Every execution first clears the unit's partition in the target, so a
//! retry after a partial copy never duplicates rows. The source is only
//! read.

use crate::engine::{PartitionPredicate, StorageEngine};
use crate::error::MigrationError;
use crate::metrics;
use crate::model::{MigrationUnit, UnitId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub unit_id: UnitId,
    pub rows: u64,
    pub checksum: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub unit_id: UnitId,
    pub error: MigrationError,
    pub duration: Duration,
}

impl UnitFailure {
    pub fn diagnostic(&self) -> String {
        self.error.to_string()
    }
}

/// Result of one execution. The executor never touches the ledger; the
/// controller applies outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Done(UnitReport),
    Failed(UnitFailure),
}

pub struct UnitExecutor {
    engine: Arc<dyn StorageEngine>,
    source: String,
    target: String,
    partition_column: String,
}

impl UnitExecutor {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        source: impl Into<String>,
        target: impl Into<String>,
        partition_column: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            source: source.into(),
            target: target.into(),
            partition_column: partition_column.into(),
        }
    }

    pub fn predicate(&self, unit_id: &UnitId) -> PartitionPredicate {
        PartitionPredicate::new(self.partition_column.clone(), unit_id.as_str())
    }

    pub async fn execute(&self, unit: &MigrationUnit) -> UnitOutcome {
        let start = Instant::now();
        let result = self.copy_and_verify(unit).await;
        let duration = start.elapsed();

        match result {
            Ok((rows, checksum)) => {
                metrics::record_unit_execution(true, duration, rows);
                debug!(unit_id = %unit.id, rows, ?duration, "Unit copied and verified");
                UnitOutcome::Done(UnitReport {
                    unit_id: unit.id.clone(),
                    rows,
                    checksum,
                    duration,
                })
            }
            Err(error) => {
                metrics::record_unit_execution(false, duration, 0);
                warn!(unit_id = %unit.id, attempt = unit.attempts, %error, "Unit execution failed");
                UnitOutcome::Failed(UnitFailure {
                    unit_id: unit.id.clone(),
                    error,
                    duration,
                })
            }
        }
    }

    async fn copy_and_verify(&self, unit: &MigrationUnit) -> Result<(u64, String), MigrationError> {
        let predicate = self.predicate(&unit.id);

        self.engine.delete_partition(&self.target, &predicate).await?;
        let written = self
            .engine
            .copy_partition(&self.source, &self.target, &predicate)
            .await?;

        let source = self.engine.partition_aggregate(&self.source, &predicate).await?;
        let target = self.engine.partition_aggregate(&self.target, &predicate).await?;

        if source.rows != target.rows {
            return Err(MigrationError::Integrity {
                unit: unit.id.to_string(),
                detail: format!(
                    "row count mismatch on {}: source {} target {} (copy reported {})",
                    predicate, source.rows, target.rows, written
                ),
            });
        }
        if source.checksum != target.checksum {
            return Err(MigrationError::Integrity {
                unit: unit.id.to_string(),
                detail: format!(
                    "checksum mismatch on {}: source {} target {}",
                    predicate, source.checksum, target.checksum
                ),
            });
        }
        Ok((target.rows, target.checksum))
    }
}
