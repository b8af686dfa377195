use super::partition_names;
use partition_migrator::{InMemoryEngine, JobSpec, MigrationService, MigratorConfig, ProgressLedger};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

pub const SOURCE: &str = "events";
pub const TARGET: &str = "events_v2";

pub struct TestCluster {
    pub engine: Arc<InMemoryEngine>,
    pub service: MigrationService,
    pub _temp_dir: Option<TempDir>, // Keep alive for durable ledgers
}

impl TestCluster {
    /// `partitions` partitions of `rows` rows each, in-memory ledger.
    pub fn new(partitions: usize, rows: u64, config: MigratorConfig) -> Self {
        Self::with_engine(seeded(InMemoryEngine::new(), partitions, rows), config)
    }

    pub fn with_latency(partitions: usize, rows: u64, latency: Duration, config: MigratorConfig) -> Self {
        Self::with_engine(
            seeded(InMemoryEngine::new().with_copy_latency(latency), partitions, rows),
            config,
        )
    }

    pub fn with_engine(engine: Arc<InMemoryEngine>, config: MigratorConfig) -> Self {
        let ledger = Arc::new(ProgressLedger::in_memory());
        let service = MigrationService::new(engine.clone(), ledger, config).unwrap();
        Self {
            engine,
            service,
            _temp_dir: None,
        }
    }

    /// Same cluster backed by a journaled ledger in a temp directory.
    pub fn durable(partitions: usize, rows: u64, mut config: MigratorConfig) -> Self {
        let dir = tempdir().unwrap();
        config.ledger_dir = dir.path().to_path_buf();
        let engine = seeded(InMemoryEngine::new(), partitions, rows);
        let service = MigrationService::open(engine.clone(), config).unwrap();
        Self {
            engine,
            service,
            _temp_dir: Some(dir),
        }
    }
}

pub fn seeded(engine: InMemoryEngine, partitions: usize, rows: u64) -> Arc<InMemoryEngine> {
    let names = partition_names(partitions);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    engine.seed(SOURCE, TARGET, &refs, rows);
    Arc::new(engine)
}

pub fn spec() -> JobSpec {
    JobSpec::new(SOURCE, TARGET, "_partition_id")
}
