//! Operator surface: starts controllers on the tokio runtime and routes
//! pause, resume, cancel, cutover and rollback requests to them.

use crate::config::MigratorConfig;
use crate::controller::{ControlSignal, MigrationController, PlanPreview, RunOutcome};
use crate::cutover::CutoverCoordinator;
use crate::engine::StorageEngine;
use crate::error::{MigrationError, Result};
use crate::ledger::ProgressLedger;
use crate::model::{CutoverRecord, JobId, JobSpec, JobStatus, MigrationJob};
use crate::report::JobStatusReport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{info, warn};

struct ActiveJob {
    control: watch::Sender<ControlSignal>,
    outcome: watch::Receiver<Option<Result<RunOutcome>>>,
}

impl ActiveJob {
    fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }
}

pub struct MigrationService {
    engine: Arc<dyn StorageEngine>,
    ledger: Arc<ProgressLedger>,
    config: Arc<MigratorConfig>,
    active: DashMap<JobId, ActiveJob>,
}

impl MigrationService {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        ledger: Arc<ProgressLedger>,
        config: MigratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            ledger,
            config: Arc::new(config),
            active: DashMap::new(),
        })
    }

    /// Service backed by a durable ledger under `config.ledger_dir`.
    pub fn open(engine: Arc<dyn StorageEngine>, config: MigratorConfig) -> Result<Self> {
        let ledger = Arc::new(ProgressLedger::open(&config.ledger_dir)?);
        Self::new(engine, ledger, config)
    }

    pub fn ledger(&self) -> &Arc<ProgressLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Plans the job and starts its controller. Returns once planning has
    /// been persisted; the copy runs in the background.
    pub async fn start(&self, spec: JobSpec) -> Result<JobId> {
        let job =
            MigrationController::plan(&spec, self.engine.clone(), &self.ledger, &self.config).await?;
        self.spawn(&job)?;
        Ok(job.id)
    }

    /// Enumerates the source without creating a job.
    pub async fn plan_only(&self, spec: &JobSpec) -> Result<PlanPreview> {
        MigrationController::preview(spec, self.engine.clone(), &self.config).await
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobStatusReport> {
        JobStatusReport::build(&self.ledger, job_id)
    }

    pub fn list(&self) -> Result<Vec<MigrationJob>> {
        self.ledger.list_jobs()
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.active
            .get(job_id)
            .map(|a| a.is_running())
            .unwrap_or(false)
    }

    /// Asks the controller to stop dispatching. In-flight units finish
    /// first; the job is `paused` once `wait` returns.
    pub fn pause(&self, job_id: &JobId) -> Result<()> {
        if self.signal(job_id, ControlSignal::Pause) {
            info!(%job_id, "Pause requested");
            return Ok(());
        }
        let job = self.ledger.job(job_id)?;
        match job.status {
            JobStatus::Paused => Ok(()),
            JobStatus::Planning | JobStatus::Running => {
                self.ledger.set_job_status(
                    job_id,
                    JobStatus::Paused,
                    Some("paused by operator".into()),
                )?;
                Ok(())
            }
            status => Err(MigrationError::Precondition(format!(
                "job {} is {} and cannot be paused",
                job_id, status
            ))),
        }
    }

    /// Starts a fresh controller for a paused, planning or interrupted job.
    pub fn resume(&self, job_id: &JobId) -> Result<()> {
        if self.is_active(job_id) {
            return Err(MigrationError::JobActive(job_id.to_string()));
        }
        let job = self.ledger.job(job_id)?;
        match job.status {
            JobStatus::Planning | JobStatus::Running | JobStatus::Paused => {
                info!(%job_id, status = %job.status, "Resuming job");
                self.spawn(&job)
            }
            status => Err(MigrationError::Precondition(format!(
                "job {} is {} and cannot be resumed",
                job_id, status
            ))),
        }
    }

    /// Stops the job and marks it failed. The shadow target is left as is
    /// and may be discarded by the operator.
    pub fn cancel(&self, job_id: &JobId) -> Result<()> {
        if self.signal(job_id, ControlSignal::Cancel) {
            warn!(%job_id, "Cancel requested");
            return Ok(());
        }
        cancel_idle(&self.ledger, job_id)
    }

    pub async fn cutover(&self, job_id: &JobId) -> Result<CutoverRecord> {
        if self.is_active(job_id) {
            return Err(MigrationError::JobActive(job_id.to_string()));
        }
        self.coordinator().cutover(job_id).await
    }

    /// Settles a job left `cutting_over` or `rolling_back` by a crash.
    /// `exchanged` is the operator's finding on whether the engine swap ran.
    pub fn resolve_cutover(&self, job_id: &JobId, exchanged: bool) -> Result<JobStatus> {
        if self.is_active(job_id) {
            return Err(MigrationError::JobActive(job_id.to_string()));
        }
        self.coordinator().resolve_interrupted(job_id, exchanged)
    }

    pub async fn rollback(&self, job_id: &JobId) -> Result<()> {
        self.coordinator().rollback(job_id).await
    }

    pub async fn finalize(&self, job_id: &JobId) -> Result<()> {
        self.coordinator().finalize(job_id, SystemTime::now()).await?;
        self.active.remove(job_id);
        Ok(())
    }

    /// Waits for the job's current controller run to end.
    pub async fn wait(&self, job_id: &JobId) -> Result<RunOutcome> {
        let mut outcome = match self.active.get(job_id) {
            Some(active) => active.outcome.clone(),
            None => {
                return Err(MigrationError::Precondition(format!(
                    "job {} has no controller",
                    job_id
                )))
            }
        };
        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MigrationError::Internal(format!("controller for {} vanished", job_id)))?;
        match finished.as_ref() {
            Some(result) => result.clone(),
            None => Err(MigrationError::Internal(format!(
                "controller for {} ended without an outcome",
                job_id
            ))),
        }
    }

    fn coordinator(&self) -> CutoverCoordinator {
        CutoverCoordinator::new(self.engine.clone(), self.ledger.clone(), self.config.retention())
    }

    fn signal(&self, job_id: &JobId, signal: ControlSignal) -> bool {
        match self.active.get(job_id) {
            Some(active) if active.is_running() => active.control.send(signal).is_ok(),
            _ => false,
        }
    }

    fn spawn(&self, job: &MigrationJob) -> Result<()> {
        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let active = ActiveJob {
            control: control_tx,
            outcome: outcome_rx,
        };

        match self.active.entry(job.id.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().is_running() {
                    return Err(MigrationError::JobActive(job.id.to_string()));
                }
                e.insert(active);
            }
            Entry::Vacant(e) => {
                e.insert(active);
            }
        }

        let mut controller = MigrationController::new(
            job,
            self.engine.clone(),
            self.ledger.clone(),
            self.config.clone(),
            control_rx,
        );
        tokio::spawn(async move {
            let result = controller.run().await;
            if let Err(e) = &result {
                warn!(job_id = %controller.job_id(), error = %e, "Controller ended with error");
            }
            let _ = outcome_tx.send(Some(result));
        });
        Ok(())
    }
}

/// Cancels a job that has no running controller.
pub fn cancel_idle(ledger: &ProgressLedger, job_id: &JobId) -> Result<()> {
    let job = ledger.job(job_id)?;
    match job.status {
        JobStatus::Planning | JobStatus::Running | JobStatus::Paused | JobStatus::Completed => {
            ledger.set_job_status(
                job_id,
                JobStatus::Failed,
                Some("cancelled by operator".into()),
            )?;
            ledger.release_target(&job.target, job_id)?;
            warn!(%job_id, target = %job.target, "Job cancelled; target is discardable");
            Ok(())
        }
        status => Err(MigrationError::Precondition(format!(
            "job {} is {} and cannot be cancelled",
            job_id, status
        ))),
    }
}
