//! Migrator configuration.
//!
//! Loaded from a JSON file, then overridden from `PARTITION_MIGRATOR_*`
//! environment variables, then validated. Durations are stored as integer
//! milliseconds or seconds so config files stay readable.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "PARTITION_MIGRATOR_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Directory holding the durable progress ledger.
    pub ledger_dir: PathBuf,
    /// Maximum number of units copied concurrently.
    pub parallelism: usize,
    pub health: HealthThresholds,
    pub retry: RetryPolicy,
    pub gate_backoff: GateBackoff,
    /// Run cutover as soon as every unit is done.
    pub auto_cutover: bool,
    /// How long the previous dataset is kept for rollback after cutover.
    pub retention_secs: u64,
    pub unit_order: UnitOrder,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            ledger_dir: PathBuf::from("./migrator-ledger"),
            parallelism: 4,
            health: HealthThresholds::default(),
            retry: RetryPolicy::default(),
            gate_backoff: GateBackoff::default(),
            auto_cutover: true,
            retention_secs: 7 * 24 * 60 * 60,
            unit_order: UnitOrder::ById,
        }
    }
}

/// Health gate ceilings and floors. Ceilings are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub max_outstanding_mutations: u64,
    pub min_free_disk_fraction: f64,
    pub max_merge_queue_depth: u64,
    /// `None` disables the replica lag check.
    pub max_replica_lag_ms: Option<u64>,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_outstanding_mutations: 0,
            min_free_disk_fraction: 0.20,
            max_merge_queue_depth: 100,
            max_replica_lag_ms: Some(300_000),
        }
    }
}

/// Per-unit retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retry ceiling: a unit failing on this attempt fails the job.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1` of a unit that has failed
    /// `attempts` times.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(63) as i32;
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = base.min(self.max_delay_ms as f64);
        let millis = if self.jitter {
            use rand::Rng;
            let factor = rand::rng().random_range(0.75..=1.25);
            (capped * factor).min(self.max_delay_ms as f64)
        } else {
            capped
        };
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Exponential backoff between negative health gate polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateBackoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for GateBackoff {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl GateBackoff {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn next(&self, current: Duration) -> Duration {
        let next = current.as_millis() as f64 * self.multiplier;
        Duration::from_millis(next.min(self.max_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOrder {
    ById,
    LargestFirst,
    SmallestFirst,
}

impl MigratorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: MigratorConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("LEDGER_DIR") {
            self.ledger_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("PARALLELISM") {
            self.parallelism = parse_env("PARALLELISM", &v)?;
        }
        if let Some(v) = lookup("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("MAX_OUTSTANDING_MUTATIONS") {
            self.health.max_outstanding_mutations = parse_env("MAX_OUTSTANDING_MUTATIONS", &v)?;
        }
        if let Some(v) = lookup("MIN_FREE_DISK_FRACTION") {
            self.health.min_free_disk_fraction = parse_env("MIN_FREE_DISK_FRACTION", &v)?;
        }
        if let Some(v) = lookup("MAX_MERGE_QUEUE_DEPTH") {
            self.health.max_merge_queue_depth = parse_env("MAX_MERGE_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = lookup("AUTO_CUTOVER") {
            self.auto_cutover = parse_env("AUTO_CUTOVER", &v)?;
        }
        if let Some(v) = lookup("RETENTION_SECS") {
            self.retention_secs = parse_env("RETENTION_SECS", &v)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(MigrationError::Config("parallelism must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(MigrationError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.health.min_free_disk_fraction) {
            return Err(MigrationError::Config(format!(
                "health.min_free_disk_fraction must be within [0, 1], got {}",
                self.health.min_free_disk_fraction
            )));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(MigrationError::Config(
                "retry.initial_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if self.gate_backoff.initial_ms == 0 || self.gate_backoff.initial_ms > self.gate_backoff.max_ms {
            return Err(MigrationError::Config(
                "gate_backoff.initial_ms must be positive and not exceed gate_backoff.max_ms".into(),
            ));
        }
        if self.retry.multiplier < 1.0 || self.gate_backoff.multiplier < 1.0 {
            return Err(MigrationError::Config("backoff multipliers must be >= 1.0".into()));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        MigrationError::Config(format!("invalid value for {}{}: {:?}", ENV_PREFIX, key, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = MigratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.max_outstanding_mutations, 0);
        assert!((config.health.min_free_disk_fraction - 0.20).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = MigratorConfig::default();
        config.parallelism = 0;
        assert!(matches!(config.validate(), Err(MigrationError::Config(_))));

        let mut config = MigratorConfig::default();
        config.health.min_free_disk_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = MigratorConfig::default();
        config.gate_backoff.initial_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"parallelism": 8, "health": {{"max_merge_queue_depth": 10}}}}"#).unwrap();

        let config = MigratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.parallelism, 8);
        assert_eq!(config.health.max_merge_queue_depth, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.auto_cutover);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PARALLELISM", "2"),
            ("AUTO_CUTOVER", "false"),
            ("MIN_FREE_DISK_FRACTION", "0.35"),
        ]
        .into_iter()
        .collect();

        let config = MigratorConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.parallelism, 2);
        assert!(!config.auto_cutover);
        assert!((config.health.min_free_disk_fraction - 0.35).abs() < f64::EPSILON);

        let bad = MigratorConfig::default().with_overrides(|k| {
            (k == "PARALLELISM").then(|| "many".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_gate_backoff_caps() {
        let backoff = GateBackoff {
            initial_ms: 10,
            max_ms: 35,
            multiplier: 2.0,
        };
        let d = backoff.initial();
        let d = backoff.next(d);
        assert_eq!(d, Duration::from_millis(20));
        let d = backoff.next(d);
        assert_eq!(d, Duration::from_millis(35));
    }
}
