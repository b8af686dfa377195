#![allow(dead_code)]

pub mod setup;

use partition_migrator::model::StatusChange;
use partition_migrator::{GateBackoff, JobStatus, MigratorConfig, RetryPolicy};

/// Small delays and a low retry ceiling so scenarios finish quickly.
pub fn fast_config() -> MigratorConfig {
    MigratorConfig {
        parallelism: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter: false,
        },
        gate_backoff: GateBackoff {
            initial_ms: 5,
            max_ms: 20,
            multiplier: 2.0,
        },
        retention_secs: 3600,
        ..Default::default()
    }
}

pub fn partition_names(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("p{}", i)).collect()
}

pub fn statuses(history: &[StatusChange]) -> Vec<JobStatus> {
    history.iter().map(|c| c.status).collect()
}
