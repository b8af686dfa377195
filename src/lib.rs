//! Partition-by-partition migration of a live table into a re-laid-out
//! shadow table, gated on cluster health, resumable across restarts and
//! finished by an atomic name exchange.
//!
//! ```no_run
//! use partition_migrator::{InMemoryEngine, JobSpec, MigrationService, MigratorConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> partition_migrator::Result<()> {
//! let engine = Arc::new(InMemoryEngine::new());
//! engine.seed("events", "events_v2", &["202401", "202402"], 1000);
//!
//! let service = MigrationService::open(engine, MigratorConfig::default())?;
//! let job_id = service
//!     .start(JobSpec::new("events", "events_v2", "toYYYYMM(ts)"))
//!     .await?;
//! let outcome = service.wait(&job_id).await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod cutover;
pub mod engine;
pub mod enumerator;
pub mod error;
pub mod executor;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod report;
pub mod service;

pub use config::{GateBackoff, HealthThresholds, MigratorConfig, RetryPolicy, UnitOrder};
pub use controller::{ControlSignal, MigrationController, PlanPreview, RunOutcome};
pub use cutover::CutoverCoordinator;
pub use engine::{InMemoryEngine, PartitionPredicate, StorageEngine};
pub use enumerator::PartitionEnumerator;
pub use error::{MigrationError, Result};
pub use executor::{UnitExecutor, UnitOutcome};
pub use health::{HealthGate, HealthVerdict};
pub use ledger::ProgressLedger;
pub use model::{
    CutoverOutcome, CutoverRecord, JobId, JobSpec, JobStatus, MigrationJob, MigrationUnit, UnitId,
    UnitState,
};
pub use report::JobStatusReport;
pub use service::MigrationService;
