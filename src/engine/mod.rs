//! Contract of the storage engine the migrator drives.
//!
//! The engine itself is an external collaborator. The migrator only needs
//! read-only introspection (mutations, volumes, merges, replica lag,
//! partitions, per-partition aggregates) and four write primitives:
//! partition copy, partition delete, atomic exchange and dataset drop.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod memory;

pub use memory::InMemoryEngine;

/// Equality predicate selecting exactly one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionPredicate {
    pub column: String,
    pub value: String,
}

impl PartitionPredicate {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for PartitionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = '{}'", self.column, self.value.replace('\'', "''"))
    }
}

/// Partition as reported by the engine's partitioning metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: String,
    pub rows: u64,
    pub bytes: u64,
}

/// Row count and order-independent content digest of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAggregate {
    pub rows: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub name: String,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl VolumeUsage {
    pub fn free_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.free_bytes as f64 / self.total_bytes as f64
    }
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Mutations not yet finished on any of `datasets`.
    async fn outstanding_mutations(&self, datasets: &[String]) -> Result<u64>;

    /// Volumes backing any of `datasets`.
    async fn volumes(&self, datasets: &[String]) -> Result<Vec<VolumeUsage>>;

    async fn merge_queue_depth(&self) -> Result<u64>;

    /// `None` when replication is not in use.
    async fn replica_lag(&self) -> Result<Option<Duration>>;

    async fn dataset_exists(&self, dataset: &str) -> Result<bool>;

    async fn list_partitions(&self, dataset: &str) -> Result<Vec<PartitionInfo>>;

    async fn partition_aggregate(
        &self,
        dataset: &str,
        predicate: &PartitionPredicate,
    ) -> Result<PartitionAggregate>;

    /// `INSERT INTO target SELECT * FROM source WHERE predicate`; returns rows written.
    async fn copy_partition(
        &self,
        source: &str,
        target: &str,
        predicate: &PartitionPredicate,
    ) -> Result<u64>;

    /// Removes every row of `dataset` matching `predicate`.
    async fn delete_partition(&self, dataset: &str, predicate: &PartitionPredicate) -> Result<()>;

    /// Swaps the identities of two datasets in one indivisible step.
    async fn exchange(&self, first: &str, second: &str) -> Result<()>;

    async fn drop_dataset(&self, dataset: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_rendering_escapes_quotes() {
        let p = PartitionPredicate::new("toYYYYMM(ts)", "2024'01");
        assert_eq!(p.to_string(), "toYYYYMM(ts) = '2024''01'");
    }

    #[test]
    fn test_free_fraction() {
        let v = VolumeUsage {
            name: "default".into(),
            free_bytes: 25,
            total_bytes: 100,
        };
        assert!((v.free_fraction() - 0.25).abs() < f64::EPSILON);

        let empty = VolumeUsage {
            name: "broken".into(),
            free_bytes: 0,
            total_bytes: 0,
        };
        assert_eq!(empty.free_fraction(), 0.0);
    }
}
