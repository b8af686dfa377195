//! Health gate: decides whether migration work may be dispatched right now.
//!
//! Checks run in a fixed order and stop at the first failing one:
//! outstanding mutations, free disk, merge queue depth, replica lag.
//! A negative verdict is advisory; the controller pauses and re-polls.

use crate::config::HealthThresholds;
use crate::engine::{StorageEngine, VolumeUsage};
use crate::metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Signals read during one gate evaluation. Checks after the first
/// failing one are not read and stay `None`/empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    pub taken_at: Option<SystemTime>,
    pub outstanding_mutations: Option<u64>,
    pub volumes: Vec<VolumeUsage>,
    pub merge_queue_depth: Option<u64>,
    pub merge_queue_saturated: bool,
    pub replica_lag: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthVerdict {
    pub ok: bool,
    pub reasons: Vec<String>,
    pub snapshot: HealthSnapshot,
}

impl HealthVerdict {
    fn deny(snapshot: HealthSnapshot, category: &str, reason: String) -> Self {
        metrics::record_gate_denial(category);
        Self {
            ok: false,
            reasons: vec![reason],
            snapshot,
        }
    }

    pub fn summary(&self) -> String {
        if self.ok {
            "healthy".to_string()
        } else {
            self.reasons.join("; ")
        }
    }
}

pub struct HealthGate {
    engine: Arc<dyn StorageEngine>,
    thresholds: HealthThresholds,
    datasets: Vec<String>,
}

impl HealthGate {
    /// `datasets` are the source and target whose namespaces and volumes
    /// are inspected.
    pub fn new(engine: Arc<dyn StorageEngine>, thresholds: HealthThresholds, datasets: Vec<String>) -> Self {
        Self {
            engine,
            thresholds,
            datasets,
        }
    }

    pub async fn check(&self) -> HealthVerdict {
        let mut snapshot = HealthSnapshot {
            taken_at: Some(SystemTime::now()),
            ..Default::default()
        };
        let t = &self.thresholds;

        let mutations = match self.engine.outstanding_mutations(&self.datasets).await {
            Ok(n) => n,
            Err(e) => return unavailable(snapshot, "mutations", e),
        };
        snapshot.outstanding_mutations = Some(mutations);
        if mutations > t.max_outstanding_mutations {
            return HealthVerdict::deny(
                snapshot,
                "mutations",
                format!(
                    "{} outstanding mutations (ceiling {})",
                    mutations, t.max_outstanding_mutations
                ),
            );
        }

        let volumes = match self.engine.volumes(&self.datasets).await {
            Ok(v) => v,
            Err(e) => return unavailable(snapshot, "disk", e),
        };
        let low = volumes
            .iter()
            .find(|v| v.free_fraction() < t.min_free_disk_fraction)
            .cloned();
        snapshot.volumes = volumes;
        if let Some(v) = low {
            return HealthVerdict::deny(
                snapshot,
                "disk",
                format!(
                    "volume {} has {:.1}% free (floor {:.1}%)",
                    v.name,
                    v.free_fraction() * 100.0,
                    t.min_free_disk_fraction * 100.0
                ),
            );
        }

        let depth = match self.engine.merge_queue_depth().await {
            Ok(d) => d,
            Err(e) => return unavailable(snapshot, "merges", e),
        };
        snapshot.merge_queue_depth = Some(depth);
        if depth > t.max_merge_queue_depth {
            snapshot.merge_queue_saturated = true;
            return HealthVerdict::deny(
                snapshot,
                "merges",
                format!(
                    "merge queue depth {} exceeds ceiling {}",
                    depth, t.max_merge_queue_depth
                ),
            );
        }

        if let Some(max_lag_ms) = t.max_replica_lag_ms {
            let lag = match self.engine.replica_lag().await {
                Ok(l) => l,
                Err(e) => return unavailable(snapshot, "replica_lag", e),
            };
            snapshot.replica_lag = lag;
            if let Some(lag) = lag {
                if lag > Duration::from_millis(max_lag_ms) {
                    return HealthVerdict::deny(
                        snapshot,
                        "replica_lag",
                        format!(
                            "replica lag {:.1}s exceeds ceiling {:.1}s",
                            lag.as_secs_f64(),
                            max_lag_ms as f64 / 1000.0
                        ),
                    );
                }
            }
        }

        debug!(datasets = ?self.datasets, "Health gate open");
        HealthVerdict {
            ok: true,
            reasons: Vec::new(),
            snapshot,
        }
    }
}

fn unavailable(snapshot: HealthSnapshot, category: &str, err: crate::error::MigrationError) -> HealthVerdict {
    HealthVerdict::deny(
        snapshot,
        category,
        format!("introspection unavailable ({}): {}", category, err),
    )
}
