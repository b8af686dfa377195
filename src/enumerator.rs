//! Discovers the migration units of a source dataset.

use crate::config::UnitOrder;
use crate::engine::StorageEngine;
use crate::error::{MigrationError, Result};
use crate::model::{MigrationUnit, UnitId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct PartitionEnumerator {
    engine: Arc<dyn StorageEngine>,
    order: UnitOrder,
}

impl PartitionEnumerator {
    pub fn new(engine: Arc<dyn StorageEngine>, order: UnitOrder) -> Self {
        Self { engine, order }
    }

    /// One pending unit per partition of `source` at call time, in a
    /// deterministic order. Rows arriving after this call belong to no unit.
    pub async fn enumerate(&self, source: &str) -> Result<Vec<MigrationUnit>> {
        let partitions = self
            .engine
            .list_partitions(source)
            .await
            .map_err(|e| MigrationError::Enumeration(format!("{}: {}", source, e)))?;

        let mut seen = HashSet::with_capacity(partitions.len());
        for p in &partitions {
            if p.id.is_empty() {
                return Err(MigrationError::Enumeration(format!(
                    "{}: partition with empty id",
                    source
                )));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(MigrationError::Enumeration(format!(
                    "{}: partition {} reported twice",
                    source, p.id
                )));
            }
        }

        let mut units: Vec<MigrationUnit> = partitions
            .into_iter()
            .map(|p| MigrationUnit::new(UnitId::new(p.id), p.rows, p.bytes))
            .collect();

        match self.order {
            UnitOrder::ById => units.sort_by(|a, b| a.id.cmp(&b.id)),
            UnitOrder::LargestFirst => units.sort_by(|a, b| {
                b.estimated_bytes
                    .cmp(&a.estimated_bytes)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            UnitOrder::SmallestFirst => units.sort_by(|a, b| {
                a.estimated_bytes
                    .cmp(&b.estimated_bytes)
                    .then_with(|| a.id.cmp(&b.id))
            }),
        }

        info!(
            source,
            units = units.len(),
            rows = units.iter().map(|u| u.estimated_rows).sum::<u64>(),
            "Enumerated partitions"
        );
        Ok(units)
    }
}
