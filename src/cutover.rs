//! Atomic swap of source and shadow target, rollback within the retention
//! window, and final cleanup.

use crate::engine::StorageEngine;
use crate::error::{MigrationError, Result};
use crate::ledger::ProgressLedger;
use crate::model::{CutoverOutcome, CutoverRecord, JobId, JobStatus};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

pub struct CutoverCoordinator {
    engine: Arc<dyn StorageEngine>,
    ledger: Arc<ProgressLedger>,
    retention: Duration,
}

impl CutoverCoordinator {
    pub fn new(engine: Arc<dyn StorageEngine>, ledger: Arc<ProgressLedger>, retention: Duration) -> Self {
        Self {
            engine,
            ledger,
            retention,
        }
    }

    /// Exchanges the source and target names in one engine operation.
    ///
    /// Requires a `completed` job whose units are all `done`. The job is
    /// claimed as `cutting_over` in the ledger before the engine is called,
    /// so a concurrent or repeated cutover is refused instead of swapping
    /// the names back. On success the source name serves the migrated data
    /// and the previous data stays under the target name until the
    /// retention window closes. On failure nothing is renamed, the job
    /// fails and the engine's error is returned unchanged.
    pub async fn cutover(&self, job_id: &JobId) -> Result<CutoverRecord> {
        let job = self.ledger.job(job_id)?;
        if job.status == JobStatus::CuttingOver {
            return Err(interrupted(job_id, job.status));
        }
        if job.status != JobStatus::Completed {
            return Err(MigrationError::Precondition(format!(
                "job {} is {}; cutover requires completed",
                job_id, job.status
            )));
        }
        if !self.ledger.all_done(job_id)? {
            return Err(MigrationError::Precondition(format!(
                "job {} has units that are not done",
                job_id
            )));
        }
        self.ledger.claim_status(
            job_id,
            JobStatus::Completed,
            JobStatus::CuttingOver,
            Some(format!("exchanging {} and {}", job.source, job.target)),
        )?;

        info!(%job_id, source = %job.source, target = %job.target, "Exchanging datasets");
        match self.engine.exchange(&job.source, &job.target).await {
            Ok(()) => {
                let record = self.success_record(job_id, &job.target);
                self.ledger.record_cutover(job_id, record.clone())?;
                self.ledger.set_job_status(
                    job_id,
                    JobStatus::CutoverDone,
                    Some(format!(
                        "{} serves migrated data; previous data retained as {}",
                        job.source, job.target
                    )),
                )?;
                self.ledger.release_target(&job.target, job_id)?;
                info!(%job_id, retained_as = %job.target, "Cutover done");
                Ok(record)
            }
            Err(e) => {
                error!(%job_id, error = %e, "Cutover failed; datasets unchanged");
                let record = CutoverRecord {
                    job_id: job_id.clone(),
                    performed_at: SystemTime::now(),
                    prior_target_name: job.target.clone(),
                    outcome: CutoverOutcome::Failure,
                    rollback_available: false,
                    retained_until: None,
                    error: Some(e.to_string()),
                };
                self.ledger.record_cutover(job_id, record)?;
                self.ledger
                    .set_job_status(job_id, JobStatus::Failed, Some(e.to_string()))?;
                self.ledger.release_target(&job.target, job_id)?;
                Err(e)
            }
        }
    }

    /// Swaps the names back while the previous data is still retained.
    pub async fn rollback(&self, job_id: &JobId) -> Result<()> {
        let job = self.ledger.job(job_id)?;
        if job.status == JobStatus::RollingBack {
            return Err(interrupted(job_id, job.status));
        }
        if job.status != JobStatus::CutoverDone {
            return Err(MigrationError::Precondition(format!(
                "job {} is {}; rollback requires cutover_done",
                job_id, job.status
            )));
        }
        let record = self.ledger.cutover_record(job_id)?.ok_or_else(|| {
            MigrationError::Internal(format!("job {} has no cutover record", job_id))
        })?;
        let open = record.rollback_available
            && record
                .retained_until
                .is_some_and(|until| SystemTime::now() <= until);
        if !open {
            return Err(MigrationError::Precondition(format!(
                "rollback window for job {} has closed",
                job_id
            )));
        }
        self.ledger.claim_status(
            job_id,
            JobStatus::CutoverDone,
            JobStatus::RollingBack,
            Some(format!("exchanging {} and {} back", job.source, job.target)),
        )?;

        if let Err(e) = self.engine.exchange(&job.source, &job.target).await {
            error!(%job_id, error = %e, "Rollback failed; cutover stays in place");
            self.ledger.set_job_status(
                job_id,
                JobStatus::CutoverDone,
                Some(format!("rollback failed: {}", e)),
            )?;
            return Err(e);
        }
        self.ledger.set_job_status(
            job_id,
            JobStatus::RolledBack,
            Some(format!("{} restored to pre-migration data", job.source)),
        )?;
        warn!(%job_id, source = %job.source, "Cutover rolled back");
        Ok(())
    }

    /// Settles a job whose exchange was claimed but never recorded, after
    /// the operator has checked which name holds the migrated data.
    ///
    /// `exchanged` says whether the engine completed the swap. A cutover
    /// that ran becomes `cutover_done`; one that did not returns the job to
    /// `completed` so it can be cut over again. Rollbacks are settled the
    /// same way into `rolled_back` or back to `cutover_done`.
    pub fn resolve_interrupted(&self, job_id: &JobId, exchanged: bool) -> Result<JobStatus> {
        let job = self.ledger.job(job_id)?;
        let recorded = self.ledger.cutover_record(job_id)?;
        let recorded_outcome = recorded.as_ref().map(|r| r.outcome);
        let (to, reason) = match (job.status, exchanged, recorded_outcome) {
            (JobStatus::CuttingOver, true, Some(CutoverOutcome::Failure)) => {
                return Err(MigrationError::Precondition(format!(
                    "job {} recorded a failed exchange",
                    job_id
                )))
            }
            (JobStatus::CuttingOver, false, Some(CutoverOutcome::Success)) => {
                return Err(MigrationError::Precondition(format!(
                    "job {} recorded a successful exchange",
                    job_id
                )))
            }
            (JobStatus::CuttingOver, true, _) => (
                JobStatus::CutoverDone,
                format!("operator confirmed {} serves migrated data", job.source),
            ),
            (JobStatus::CuttingOver, false, Some(CutoverOutcome::Failure)) => (
                JobStatus::Failed,
                recorded
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "cutover failed".to_string()),
            ),
            (JobStatus::CuttingOver, false, None) => (
                JobStatus::Completed,
                format!("operator confirmed {} was not exchanged", job.source),
            ),
            (JobStatus::RollingBack, true, _) => (
                JobStatus::RolledBack,
                format!("operator confirmed {} serves pre-migration data", job.source),
            ),
            (JobStatus::RollingBack, false, _) => (
                JobStatus::CutoverDone,
                format!("operator confirmed {} still serves migrated data", job.source),
            ),
            (status, _, _) => {
                return Err(MigrationError::Precondition(format!(
                    "job {} is {} and has no interrupted exchange",
                    job_id, status
                )))
            }
        };

        let from = job.status;
        if from == JobStatus::CuttingOver && to == JobStatus::CutoverDone && recorded_outcome.is_none() {
            self.ledger
                .record_cutover(job_id, self.success_record(job_id, &job.target))?;
        }
        self.ledger.claim_status(job_id, from, to, Some(reason))?;
        if from == JobStatus::CuttingOver && to != JobStatus::Completed {
            self.ledger.release_target(&job.target, job_id)?;
        }
        warn!(%job_id, %from, %to, "Interrupted exchange resolved");
        Ok(to)
    }

    fn success_record(&self, job_id: &JobId, target: &str) -> CutoverRecord {
        let now = SystemTime::now();
        CutoverRecord {
            job_id: job_id.clone(),
            performed_at: now,
            prior_target_name: target.to_string(),
            outcome: CutoverOutcome::Success,
            rollback_available: true,
            retained_until: Some(now + self.retention),
            error: None,
        }
    }

    /// Drops the retained dataset once the window has closed and archives
    /// the job. Failed and rolled-back jobs are archived without dropping
    /// anything.
    pub async fn finalize(&self, job_id: &JobId, now: SystemTime) -> Result<()> {
        let job = self.ledger.job(job_id)?;
        match job.status {
            JobStatus::CutoverDone => {
                let retained_until = self
                    .ledger
                    .cutover_record(job_id)?
                    .and_then(|r| r.retained_until);
                if let Some(until) = retained_until {
                    if now < until {
                        return Err(MigrationError::Precondition(format!(
                            "job {} retains {} for another {:?}",
                            job_id,
                            job.target,
                            until.duration_since(now).unwrap_or_default()
                        )));
                    }
                }
                self.engine.drop_dataset(&job.target).await?;
                info!(%job_id, dropped = %job.target, "Dropped retained dataset");
            }
            JobStatus::Failed | JobStatus::RolledBack => {}
            status => {
                return Err(MigrationError::Precondition(format!(
                    "job {} is {} and cannot be finalized",
                    job_id, status
                )))
            }
        }
        self.ledger.archive(job_id)
    }
}

pub(crate) fn interrupted(job_id: &JobId, status: JobStatus) -> MigrationError {
    MigrationError::Precondition(format!(
        "job {} is {}: another exchange is in progress or was interrupted; \
         if no process is running it, check which dataset holds the migrated \
         data and resolve the job",
        job_id, status
    ))
}
