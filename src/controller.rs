//! Migration controller: the control loop driving one job.
//!
//! The loop polls the health gate before every dispatch, keeps up to
//! `parallelism` units copying at once, applies every executor outcome
//! through the ledger and stops on completion, operator pause/cancel, or
//! a unit exhausting its retry ceiling. In-flight copies are always
//! allowed to finish before the loop returns.

use crate::config::MigratorConfig;
use crate::cutover::{interrupted, CutoverCoordinator};
use crate::engine::StorageEngine;
use crate::enumerator::PartitionEnumerator;
use crate::error::{MigrationError, Result};
use crate::executor::{UnitExecutor, UnitFailure, UnitOutcome};
use crate::health::HealthGate;
use crate::ledger::ProgressLedger;
use crate::metrics;
use crate::model::{
    sanitize, CutoverRecord, JobId, JobSpec, JobStatus, MigrationJob, MigrationUnit, UnitId,
    UnitState,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Operator instruction delivered to a running controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// How a controller run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every unit is done; cutover is left to the operator.
    Completed,
    CutoverDone(CutoverRecord),
    /// Stopped on operator request; resumable.
    Paused,
    Cancelled,
    Failed { reason: String },
}

#[derive(Debug)]
enum LoopExit {
    AllDone,
    Paused,
    Cancelled,
    RetriesExhausted(String),
}

impl LoopExit {
    /// A failure outranks a cancel, which outranks a pause.
    fn rank(&self) -> u8 {
        match self {
            LoopExit::AllDone => 0,
            LoopExit::Paused => 1,
            LoopExit::Cancelled => 2,
            LoopExit::RetriesExhausted(_) => 3,
        }
    }
}

enum Selection {
    Dispatch(UnitId),
    /// Only units waiting out their retry delay remain.
    RetryIn(Duration),
    Exhausted(UnitId),
    Idle,
}

enum Wake {
    Finished(UnitOutcome),
    Timer,
    Control,
    ControlClosed,
    Idle,
}

type InFlight = FuturesUnordered<BoxFuture<'static, UnitOutcome>>;

/// Summary of a dry-run enumeration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanPreview {
    pub source: String,
    pub target: String,
    pub units: Vec<MigrationUnit>,
    pub total_rows: u64,
    pub total_bytes: u64,
}

pub struct MigrationController {
    job_id: JobId,
    config: Arc<MigratorConfig>,
    ledger: Arc<ProgressLedger>,
    gate: HealthGate,
    executor: Arc<UnitExecutor>,
    cutover: CutoverCoordinator,
    control: watch::Receiver<ControlSignal>,
    control_open: bool,
    retry_after: HashMap<UnitId, Instant>,
}

impl MigrationController {
    /// Validates the spec, claims the target, enumerates the source once and
    /// persists the job with every unit pending. An enumeration failure
    /// leaves a `failed` job behind and returns the error.
    pub async fn plan(
        spec: &JobSpec,
        engine: Arc<dyn StorageEngine>,
        ledger: &ProgressLedger,
        config: &MigratorConfig,
    ) -> Result<MigrationJob> {
        Self::check_spec(spec, engine.as_ref()).await?;

        let job_id = spec
            .job_id
            .clone()
            .unwrap_or_else(|| JobId::generate(&spec.target));
        if sanitize(job_id.as_str()) != job_id.as_str() {
            return Err(MigrationError::Config(format!(
                "job id {:?} may only contain [A-Za-z0-9._-]",
                job_id.as_str()
            )));
        }
        if ledger.job(&job_id).is_ok() {
            return Err(MigrationError::JobExists(job_id.to_string()));
        }
        let job = MigrationJob::new(job_id.clone(), spec);

        ledger.acquire_target(&spec.target, &job_id)?;
        let enumerated = PartitionEnumerator::new(engine, config.unit_order)
            .enumerate(&spec.source)
            .await;

        match enumerated {
            Ok(units) => {
                if let Err(e) = ledger.create_job(job.clone(), units) {
                    ledger.release_target(&spec.target, &job_id)?;
                    return Err(e);
                }
                Ok(job)
            }
            Err(e) => {
                error!(%job_id, error = %e, "Planning failed");
                let created = ledger
                    .create_job(job, Vec::new())
                    .and_then(|_| ledger.set_job_status(&job_id, JobStatus::Failed, Some(e.to_string())));
                ledger.release_target(&spec.target, &job_id)?;
                created?;
                Err(e)
            }
        }
    }

    /// Enumerates without creating a job.
    pub async fn preview(
        spec: &JobSpec,
        engine: Arc<dyn StorageEngine>,
        config: &MigratorConfig,
    ) -> Result<PlanPreview> {
        Self::check_spec(spec, engine.as_ref()).await?;
        let units = PartitionEnumerator::new(engine, config.unit_order)
            .enumerate(&spec.source)
            .await?;
        Ok(PlanPreview {
            source: spec.source.clone(),
            target: spec.target.clone(),
            total_rows: units.iter().map(|u| u.estimated_rows).sum(),
            total_bytes: units.iter().map(|u| u.estimated_bytes).sum(),
            units,
        })
    }

    async fn check_spec(spec: &JobSpec, engine: &dyn StorageEngine) -> Result<()> {
        if spec.source.is_empty() || spec.target.is_empty() || spec.partition_column.is_empty() {
            return Err(MigrationError::Config(
                "source, target and partition column are required".into(),
            ));
        }
        if spec.source == spec.target {
            return Err(MigrationError::Config(format!(
                "source and target are both {}",
                spec.source
            )));
        }
        if !engine.dataset_exists(&spec.target).await? {
            return Err(MigrationError::Precondition(format!(
                "shadow target {} does not exist",
                spec.target
            )));
        }
        Ok(())
    }

    pub fn new(
        job: &MigrationJob,
        engine: Arc<dyn StorageEngine>,
        ledger: Arc<ProgressLedger>,
        config: Arc<MigratorConfig>,
        control: watch::Receiver<ControlSignal>,
    ) -> Self {
        let gate = HealthGate::new(
            engine.clone(),
            config.health.clone(),
            vec![job.source.clone(), job.target.clone()],
        );
        let executor = Arc::new(UnitExecutor::new(
            engine.clone(),
            job.source.clone(),
            job.target.clone(),
            job.partition_column.clone(),
        ));
        let cutover = CutoverCoordinator::new(engine, ledger.clone(), config.retention());
        Self {
            job_id: job.id.clone(),
            config,
            ledger,
            gate,
            executor,
            cutover,
            control,
            control_open: true,
            retry_after: HashMap::new(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Runs (or resumes) the job until it completes, pauses or fails.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let _guard = metrics::ControllerGuard::new();
        let job = self.ledger.job(&self.job_id)?;
        match job.status {
            JobStatus::Planning | JobStatus::Running | JobStatus::Paused => {}
            JobStatus::Completed => return self.finish(&job).await,
            JobStatus::CuttingOver | JobStatus::RollingBack => {
                return Err(interrupted(&self.job_id, job.status))
            }
            status => {
                return Err(MigrationError::Precondition(format!(
                    "job {} is {} and cannot run",
                    self.job_id, status
                )))
            }
        }

        self.ledger.acquire_target(&job.target, &self.job_id)?;
        if let Err(e) = self.recover_in_flight() {
            return self.fail_fatally(&job, e);
        }
        self.ledger
            .set_job_status(&self.job_id, JobStatus::Running, None)?;
        info!(job_id = %self.job_id, source = %job.source, target = %job.target, "Migration running");

        match self.drive().await {
            Ok(LoopExit::AllDone) => {
                let job = self.ledger.set_job_status(
                    &self.job_id,
                    JobStatus::Completed,
                    Some("all units done".into()),
                )?;
                info!(job_id = %self.job_id, "All units migrated");
                self.finish(&job).await
            }
            Ok(LoopExit::Paused) => {
                self.ledger.set_job_status(
                    &self.job_id,
                    JobStatus::Paused,
                    Some("paused by operator".into()),
                )?;
                info!(job_id = %self.job_id, "Migration paused by operator");
                Ok(RunOutcome::Paused)
            }
            Ok(LoopExit::Cancelled) => {
                self.ledger.set_job_status(
                    &self.job_id,
                    JobStatus::Failed,
                    Some("cancelled by operator".into()),
                )?;
                self.ledger.release_target(&job.target, &self.job_id)?;
                warn!(job_id = %self.job_id, target = %job.target, "Migration cancelled; target is discardable");
                Ok(RunOutcome::Cancelled)
            }
            Ok(LoopExit::RetriesExhausted(reason)) => {
                self.ledger
                    .set_job_status(&self.job_id, JobStatus::Failed, Some(reason.clone()))?;
                self.ledger.release_target(&job.target, &self.job_id)?;
                error!(job_id = %self.job_id, %reason, "Migration failed");
                Ok(RunOutcome::Failed { reason })
            }
            Err(e) => self.fail_fatally(&job, e),
        }
    }

    fn fail_fatally(&self, job: &MigrationJob, e: MigrationError) -> Result<RunOutcome> {
        error!(job_id = %self.job_id, error = %e, "Migration aborted");
        if let Err(status_err) =
            self.ledger
                .set_job_status(&self.job_id, JobStatus::Failed, Some(e.to_string()))
        {
            warn!(job_id = %self.job_id, error = %status_err, "Could not record job failure");
        }
        if let Err(lock_err) = self.ledger.release_target(&job.target, &self.job_id) {
            warn!(job_id = %self.job_id, target = %job.target, error = %lock_err, "Could not release target lock");
        }
        Err(e)
    }

    async fn finish(&self, job: &MigrationJob) -> Result<RunOutcome> {
        if !self.config.auto_cutover {
            info!(job_id = %self.job_id, "Completed; waiting for manual cutover");
            return Ok(RunOutcome::Completed);
        }
        match self.cutover.cutover(&self.job_id).await {
            Ok(record) => Ok(RunOutcome::CutoverDone(record)),
            Err(e) => {
                if self.ledger.job(&job.id)?.status == JobStatus::Failed {
                    Ok(RunOutcome::Failed {
                        reason: e.to_string(),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Units left `in_flight` by a crashed controller are failed so the
    /// normal retry path clears and recopies them.
    fn recover_in_flight(&self) -> Result<()> {
        for unit in self.ledger.load(&self.job_id)? {
            if unit.state == UnitState::InFlight {
                warn!(job_id = %self.job_id, unit_id = %unit.id, attempt = unit.attempts, "Recovering interrupted unit");
                self.ledger.transition(
                    &self.job_id,
                    &unit.id,
                    UnitState::Failed,
                    Some("interrupted before completion".into()),
                )?;
            }
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<LoopExit> {
        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut stop: Option<LoopExit> = None;
        let mut gate_delay: Option<Duration> = None;

        loop {
            let signal = *self.control.borrow();
            match signal {
                ControlSignal::Pause => raise(&mut stop, LoopExit::Paused),
                ControlSignal::Cancel => raise(&mut stop, LoopExit::Cancelled),
                ControlSignal::Run => {}
            }

            if stop.is_some() {
                if in_flight.is_empty() {
                    return Ok(stop.unwrap_or(LoopExit::Paused));
                }
                if let Some(exit) = self.wait(&mut in_flight, None).await? {
                    raise(&mut stop, exit);
                }
                continue;
            }

            let units = self.ledger.load(&self.job_id)?;
            if in_flight.is_empty() && units.iter().all(MigrationUnit::is_done) {
                return Ok(LoopExit::AllDone);
            }

            let selection = if in_flight.len() < self.config.parallelism {
                self.select_next(&units)
            } else {
                Selection::Idle
            };

            match selection {
                Selection::Dispatch(unit_id) => {
                    let verdict = self.gate.check().await;
                    if !verdict.ok {
                        let delay = match gate_delay {
                            Some(d) => self.config.gate_backoff.next(d),
                            None => self.config.gate_backoff.initial(),
                        };
                        gate_delay = Some(delay);
                        let reason = format!("health gate: {}", verdict.summary());
                        warn!(job_id = %self.job_id, %reason, retry_in = ?delay, "Dispatch paused");
                        self.ledger
                            .set_job_status(&self.job_id, JobStatus::Paused, Some(reason))?;
                        if let Some(exit) = self.wait(&mut in_flight, Some(delay)).await? {
                            raise(&mut stop, exit);
                        }
                        continue;
                    }
                    if gate_delay.take().is_some() {
                        info!(job_id = %self.job_id, "Health gate reopened");
                        self.ledger
                            .set_job_status(&self.job_id, JobStatus::Running, None)?;
                    }
                    let unit = self.claim(&unit_id)?;
                    in_flight.push(self.dispatch(unit));
                }
                Selection::RetryIn(delay) => {
                    if let Some(exit) = self.wait(&mut in_flight, Some(delay)).await? {
                        raise(&mut stop, exit);
                    }
                }
                Selection::Exhausted(unit_id) => {
                    let unit = self.ledger.unit(&self.job_id, &unit_id)?;
                    raise(&mut stop, LoopExit::RetriesExhausted(exhausted_reason(&unit)));
                }
                Selection::Idle => {
                    if let Some(exit) = self.wait(&mut in_flight, None).await? {
                        raise(&mut stop, exit);
                    }
                }
            }
        }
    }

    /// Ready failed units (below the ceiling, retry delay elapsed) first,
    /// then pending units, both in enumeration order.
    fn select_next(&self, units: &[MigrationUnit]) -> Selection {
        let now = Instant::now();
        let mut soonest: Option<Duration> = None;
        for unit in units.iter().filter(|u| u.state == UnitState::Failed) {
            if unit.attempts >= self.config.retry.max_attempts {
                return Selection::Exhausted(unit.id.clone());
            }
            match self.retry_after.get(&unit.id) {
                Some(at) if *at > now => {
                    let wait = *at - now;
                    soonest = Some(soonest.map_or(wait, |s| s.min(wait)));
                }
                _ => return Selection::Dispatch(unit.id.clone()),
            }
        }
        if let Some(unit) = units.iter().find(|u| u.state == UnitState::Pending) {
            return Selection::Dispatch(unit.id.clone());
        }
        match soonest {
            Some(wait) => Selection::RetryIn(wait),
            None => Selection::Idle,
        }
    }

    fn claim(&mut self, unit_id: &UnitId) -> Result<MigrationUnit> {
        let unit = self.ledger.unit(&self.job_id, unit_id)?;
        if unit.state == UnitState::Failed {
            self.ledger
                .transition(&self.job_id, unit_id, UnitState::Pending, None)?;
            self.retry_after.remove(unit_id);
        }
        let unit = self
            .ledger
            .transition(&self.job_id, unit_id, UnitState::InFlight, None)?;
        info!(job_id = %self.job_id, unit_id = %unit.id, attempt = unit.attempts, "Dispatching unit");
        Ok(unit)
    }

    fn dispatch(&self, unit: MigrationUnit) -> BoxFuture<'static, UnitOutcome> {
        let executor = self.executor.clone();
        let unit_id = unit.id.clone();
        let handle = tokio::spawn(async move { executor.execute(&unit).await });
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => UnitOutcome::Failed(UnitFailure {
                    unit_id,
                    error: MigrationError::Internal(format!("unit task aborted: {}", e)),
                    duration: Duration::ZERO,
                }),
            }
        }
        .boxed()
    }

    /// Waits for a unit to finish, the timer, or a control change,
    /// whichever comes first. Returns a loop exit if an outcome demands one.
    async fn wait(&mut self, in_flight: &mut InFlight, timer: Option<Duration>) -> Result<Option<LoopExit>> {
        let has_timer = timer.is_some();
        let sleep_for = timer.unwrap_or(Duration::from_secs(3600));
        let has_work = !in_flight.is_empty();
        let control_open = self.control_open;

        let wake = tokio::select! {
            Some(outcome) = in_flight.next(), if has_work => Wake::Finished(outcome),
            _ = tokio::time::sleep(sleep_for), if has_timer => Wake::Timer,
            changed = self.control.changed(), if control_open => {
                if changed.is_ok() { Wake::Control } else { Wake::ControlClosed }
            }
            else => Wake::Idle,
        };

        match wake {
            Wake::Finished(outcome) => self.apply(outcome),
            Wake::ControlClosed => {
                self.control_open = false;
                Ok(None)
            }
            Wake::Timer | Wake::Control | Wake::Idle => Ok(None),
        }
    }

    fn apply(&mut self, outcome: UnitOutcome) -> Result<Option<LoopExit>> {
        match outcome {
            UnitOutcome::Done(report) => {
                self.ledger
                    .transition(&self.job_id, &report.unit_id, UnitState::Done, None)?;
                info!(
                    job_id = %self.job_id,
                    unit_id = %report.unit_id,
                    rows = report.rows,
                    duration_ms = report.duration.as_millis() as u64,
                    "Unit done"
                );
                Ok(None)
            }
            UnitOutcome::Failed(failure) => {
                let unit = self.ledger.transition(
                    &self.job_id,
                    &failure.unit_id,
                    UnitState::Failed,
                    Some(failure.diagnostic()),
                )?;
                if failure.error.is_fatal() {
                    return Err(failure.error);
                }
                if unit.attempts >= self.config.retry.max_attempts {
                    return Ok(Some(LoopExit::RetriesExhausted(exhausted_reason(&unit))));
                }
                let delay = self.config.retry.delay_for(unit.attempts);
                self.retry_after
                    .insert(unit.id.clone(), Instant::now() + delay);
                warn!(
                    job_id = %self.job_id,
                    unit_id = %unit.id,
                    attempt = unit.attempts,
                    retry_in = ?delay,
                    error = %failure.error,
                    "Unit failed; will retry"
                );
                Ok(None)
            }
        }
    }
}

fn raise(stop: &mut Option<LoopExit>, exit: LoopExit) {
    let replace = match stop {
        Some(current) => exit.rank() > current.rank(),
        None => true,
    };
    if replace {
        *stop = Some(exit);
    }
}

fn exhausted_reason(unit: &MigrationUnit) -> String {
    format!(
        "unit {} failed {} attempts; last error: {}",
        unit.id,
        unit.attempts,
        unit.last_error.as_deref().unwrap_or("unknown")
    )
}
