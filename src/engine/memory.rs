//! In-memory storage engine with scripted health signals and fault
//! injection. Every call is recorded as an [`EngineEvent`] so callers can
//! assert on dispatch order and concurrency.
//!
//! Partition predicates are matched on their value only; the column name
//! is carried for rendering.

use super::{PartitionAggregate, PartitionInfo, PartitionPredicate, StorageEngine, VolumeUsage};
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Row {
    pub key: u64,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MutationPoll { outstanding: u64 },
    Copy { partition: String },
    Delete { dataset: String, partition: String },
    Exchange { first: String, second: String },
    Drop { dataset: String },
}

/// Misbehaviour injected into the next copy of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFault {
    /// Copy nothing and report a timeout.
    Transient,
    /// Write half of the rows, then report a timeout.
    PartialThenTransient,
    /// Silently lose one row.
    DropRow,
    /// Silently write one row twice.
    DuplicateRow,
}

#[derive(Debug, Default)]
struct Dataset {
    partitions: BTreeMap<String, Vec<Row>>,
}

#[derive(Debug)]
struct State {
    datasets: HashMap<String, Dataset>,
    outstanding_mutations: u64,
    mutation_script: VecDeque<u64>,
    volumes: Vec<VolumeUsage>,
    merge_queue_depth: u64,
    replica_lag: Option<Duration>,
    copy_faults: HashMap<String, VecDeque<CopyFault>>,
    exchange_failure: Option<String>,
    listing_failure: Option<String>,
    events: Vec<EngineEvent>,
}

pub struct InMemoryEngine {
    state: Mutex<State>,
    copy_latency: Duration,
    exchange_latency: Duration,
    active_copies: AtomicUsize,
    peak_copies: AtomicUsize,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                datasets: HashMap::new(),
                outstanding_mutations: 0,
                mutation_script: VecDeque::new(),
                volumes: vec![VolumeUsage {
                    name: "default".to_string(),
                    free_bytes: 800 * 1024 * 1024 * 1024,
                    total_bytes: 1024 * 1024 * 1024 * 1024,
                }],
                merge_queue_depth: 0,
                replica_lag: None,
                copy_faults: HashMap::new(),
                exchange_failure: None,
                listing_failure: None,
                events: Vec::new(),
            }),
            copy_latency: Duration::ZERO,
            exchange_latency: Duration::ZERO,
            active_copies: AtomicUsize::new(0),
            peak_copies: AtomicUsize::new(0),
        }
    }

    /// Simulated duration of every partition copy.
    pub fn with_copy_latency(mut self, latency: Duration) -> Self {
        self.copy_latency = latency;
        self
    }

    pub fn with_exchange_latency(mut self, latency: Duration) -> Self {
        self.exchange_latency = latency;
        self
    }

    pub fn create_dataset(&self, name: &str) {
        self.state.lock().datasets.entry(name.to_string()).or_default();
    }

    pub fn insert_rows<I>(&self, dataset: &str, partition: &str, rows: I)
    where
        I: IntoIterator<Item = (u64, String)>,
    {
        let mut state = self.state.lock();
        let ds = state.datasets.entry(dataset.to_string()).or_default();
        let part = ds.partitions.entry(partition.to_string()).or_default();
        part.extend(rows.into_iter().map(|(key, payload)| Row { key, payload }));
    }

    /// Creates `source` with `rows_per_partition` rows in each partition and
    /// an empty `target`.
    pub fn seed(&self, source: &str, target: &str, partitions: &[&str], rows_per_partition: u64) {
        for partition in partitions {
            self.insert_rows(
                source,
                partition,
                (0..rows_per_partition).map(|k| (k, format!("{}:{}", partition, k))),
            );
        }
        self.create_dataset(target);
    }

    pub fn rows(&self, dataset: &str, partition: &str) -> Vec<Row> {
        self.state
            .lock()
            .datasets
            .get(dataset)
            .and_then(|ds| ds.partitions.get(partition))
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, dataset: &str) -> u64 {
        self.state
            .lock()
            .datasets
            .get(dataset)
            .map(|ds| ds.partitions.values().map(|p| p.len() as u64).sum())
            .unwrap_or(0)
    }

    pub fn has_dataset(&self, dataset: &str) -> bool {
        self.state.lock().datasets.contains_key(dataset)
    }

    pub fn set_outstanding_mutations(&self, count: u64) {
        self.state.lock().outstanding_mutations = count;
    }

    /// Values returned by the next mutation polls, one per poll, before
    /// falling back to the static count.
    pub fn script_outstanding_mutations<I: IntoIterator<Item = u64>>(&self, values: I) {
        self.state.lock().mutation_script.extend(values);
    }

    pub fn set_volume(&self, name: &str, free_bytes: u64, total_bytes: u64) {
        let mut state = self.state.lock();
        state.volumes.retain(|v| v.name != name);
        state.volumes.push(VolumeUsage {
            name: name.to_string(),
            free_bytes,
            total_bytes,
        });
    }

    pub fn set_merge_queue_depth(&self, depth: u64) {
        self.state.lock().merge_queue_depth = depth;
    }

    pub fn set_replica_lag(&self, lag: Option<Duration>) {
        self.state.lock().replica_lag = lag;
    }

    pub fn inject_copy_fault(&self, partition: &str, fault: CopyFault, times: usize) {
        let mut state = self.state.lock();
        let queue = state.copy_faults.entry(partition.to_string()).or_default();
        queue.extend(std::iter::repeat(fault).take(times));
    }

    pub fn fail_next_exchange(&self, message: &str) {
        self.state.lock().exchange_failure = Some(message.to_string());
    }

    pub fn fail_partition_listing(&self, message: &str) {
        self.state.lock().listing_failure = Some(message.to_string());
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.state.lock().events.clone()
    }

    pub fn copy_calls(&self, partition: &str) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Copy { partition: p } if p == partition))
            .count()
    }

    pub fn total_copy_calls(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Copy { .. }))
            .count()
    }

    pub fn peak_concurrent_copies(&self) -> usize {
        self.peak_copies.load(Ordering::SeqCst)
    }

    fn missing(dataset: &str) -> MigrationError {
        MigrationError::Engine(format!("Table {} doesn't exist", dataset))
    }
}

fn digest(rows: &[Row]) -> String {
    let mut sorted: Vec<&Row> = rows.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for row in sorted {
        hasher.update(row.key.to_le_bytes());
        hasher.update((row.payload.len() as u32).to_le_bytes());
        hasher.update(row.payload.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

struct CopyGuard<'a>(&'a AtomicUsize);

impl Drop for CopyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageEngine for InMemoryEngine {
    async fn outstanding_mutations(&self, _datasets: &[String]) -> Result<u64> {
        let mut state = self.state.lock();
        let outstanding = match state.mutation_script.pop_front() {
            Some(v) => v,
            None => state.outstanding_mutations,
        };
        state.events.push(EngineEvent::MutationPoll { outstanding });
        Ok(outstanding)
    }

    async fn volumes(&self, _datasets: &[String]) -> Result<Vec<VolumeUsage>> {
        Ok(self.state.lock().volumes.clone())
    }

    async fn merge_queue_depth(&self) -> Result<u64> {
        Ok(self.state.lock().merge_queue_depth)
    }

    async fn replica_lag(&self) -> Result<Option<Duration>> {
        Ok(self.state.lock().replica_lag)
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        Ok(self.has_dataset(dataset))
    }

    async fn list_partitions(&self, dataset: &str) -> Result<Vec<PartitionInfo>> {
        let state = self.state.lock();
        if let Some(msg) = &state.listing_failure {
            return Err(MigrationError::Engine(msg.clone()));
        }
        let ds = state.datasets.get(dataset).ok_or_else(|| Self::missing(dataset))?;
        Ok(ds
            .partitions
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(id, rows)| PartitionInfo {
                id: id.clone(),
                rows: rows.len() as u64,
                bytes: rows.iter().map(|r| 8 + r.payload.len() as u64).sum(),
            })
            .collect())
    }

    async fn partition_aggregate(
        &self,
        dataset: &str,
        predicate: &PartitionPredicate,
    ) -> Result<PartitionAggregate> {
        let state = self.state.lock();
        let ds = state.datasets.get(dataset).ok_or_else(|| Self::missing(dataset))?;
        let rows = ds
            .partitions
            .get(&predicate.value)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(PartitionAggregate {
            rows: rows.len() as u64,
            checksum: digest(rows),
        })
    }

    async fn copy_partition(
        &self,
        source: &str,
        target: &str,
        predicate: &PartitionPredicate,
    ) -> Result<u64> {
        let fault = {
            let mut state = self.state.lock();
            state.events.push(EngineEvent::Copy {
                partition: predicate.value.clone(),
            });
            state
                .copy_faults
                .get_mut(&predicate.value)
                .and_then(|q| q.pop_front())
        };

        let active = self.active_copies.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_copies.fetch_max(active, Ordering::SeqCst);
        let _guard = CopyGuard(&self.active_copies);

        if !self.copy_latency.is_zero() {
            tokio::time::sleep(self.copy_latency).await;
        }

        let mut state = self.state.lock();
        let mut rows = state
            .datasets
            .get(source)
            .ok_or_else(|| Self::missing(source))?
            .partitions
            .get(&predicate.value)
            .cloned()
            .unwrap_or_default();
        if !state.datasets.contains_key(target) {
            return Err(Self::missing(target));
        }

        let mut error = None;
        match fault {
            Some(CopyFault::Transient) => {
                return Err(MigrationError::TransientEngine(format!(
                    "timeout while copying partition {}",
                    predicate.value
                )));
            }
            Some(CopyFault::PartialThenTransient) => {
                rows.truncate(rows.len() / 2);
                error = Some(MigrationError::TransientEngine(format!(
                    "connection reset after {} rows of partition {}",
                    rows.len(),
                    predicate.value
                )));
            }
            Some(CopyFault::DropRow) => {
                rows.pop();
            }
            Some(CopyFault::DuplicateRow) => {
                if let Some(first) = rows.first().cloned() {
                    rows.push(first);
                }
            }
            None => {}
        }

        let written = rows.len() as u64;
        if let Some(ds) = state.datasets.get_mut(target) {
            ds.partitions
                .entry(predicate.value.clone())
                .or_default()
                .extend(rows);
        }
        match error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn delete_partition(&self, dataset: &str, predicate: &PartitionPredicate) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(EngineEvent::Delete {
            dataset: dataset.to_string(),
            partition: predicate.value.clone(),
        });
        let ds = state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| Self::missing(dataset))?;
        ds.partitions.remove(&predicate.value);
        Ok(())
    }

    async fn exchange(&self, first: &str, second: &str) -> Result<()> {
        if !self.exchange_latency.is_zero() {
            tokio::time::sleep(self.exchange_latency).await;
        }
        let mut state = self.state.lock();
        state.events.push(EngineEvent::Exchange {
            first: first.to_string(),
            second: second.to_string(),
        });
        if let Some(msg) = state.exchange_failure.take() {
            return Err(MigrationError::Engine(msg));
        }
        let a = state.datasets.remove(first).ok_or_else(|| Self::missing(first))?;
        let b = match state.datasets.remove(second) {
            Some(b) => b,
            None => {
                state.datasets.insert(first.to_string(), a);
                return Err(Self::missing(second));
            }
        };
        state.datasets.insert(first.to_string(), b);
        state.datasets.insert(second.to_string(), a);
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(EngineEvent::Drop {
            dataset: dataset.to_string(),
        });
        state
            .datasets
            .remove(dataset)
            .map(|_| ())
            .ok_or_else(|| Self::missing(dataset))
    }
}
