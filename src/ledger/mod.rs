//! Progress ledger: the durable record of job and unit state.
//!
//! Every mutation is journaled before it is applied in memory, so a
//! restarted controller resumes exactly where the previous one stopped.
//! Unit transitions are individually atomic: each job has its own mutex
//! and a transition is validated, journaled and applied under it.
//!
//! On-disk layout under the ledger root:
//!
//! ```text
//! jobs/<job-id>/ledger.log     journal of one job
//! locks/<target>.lock          id of the job owning a target
//! archive/<job-id>/            journals of archived jobs
//! ```

mod journal;

use crate::error::{MigrationError, Result};
use crate::metrics;
use crate::model::{
    sanitize, CutoverRecord, JobId, JobStatus, MigrationJob, MigrationUnit, StatusChange, UnitId,
    UnitState,
};
use journal::{Journal, LedgerRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "ledger.log";

struct JobLedger {
    job: MigrationJob,
    units: Vec<MigrationUnit>,
    index: HashMap<UnitId, usize>,
    history: Vec<StatusChange>,
    cutover: Option<CutoverRecord>,
    journal: Option<Journal>,
}

impl JobLedger {
    fn new(job: MigrationJob, units: Vec<MigrationUnit>, journal: Option<Journal>) -> Self {
        let index = units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.id.clone(), i))
            .collect();
        let history = vec![StatusChange {
            status: job.status,
            reason: job.status_reason.clone(),
            at: job.created_at,
        }];
        Self {
            job,
            units,
            index,
            history,
            cutover: None,
            journal,
        }
    }

    fn replay(journal: Journal, records: Vec<LedgerRecord>) -> Result<Self> {
        let mut records = records.into_iter();
        let mut ledger = match records.next() {
            Some(LedgerRecord::JobCreated { job, units }) => JobLedger::new(job, units, None),
            _ => {
                return Err(MigrationError::LedgerCorrupted(format!(
                    "{}: journal does not start with a job record",
                    journal.path().display()
                )))
            }
        };
        for record in records {
            match record {
                LedgerRecord::JobCreated { .. } => {
                    return Err(MigrationError::LedgerCorrupted(format!(
                        "{}: duplicate job record",
                        journal.path().display()
                    )))
                }
                LedgerRecord::UnitTransition {
                    unit_id,
                    to,
                    error,
                    at,
                } => {
                    let idx = ledger.unit_index(&unit_id)?;
                    apply_unit_transition(&mut ledger.units[idx], to, error, at);
                }
                LedgerRecord::JobStatus { change } => ledger.apply_status(change),
                LedgerRecord::Cutover { record } => ledger.cutover = Some(record),
            }
        }
        ledger.journal = Some(journal);
        Ok(ledger)
    }

    fn unit_index(&self, unit_id: &UnitId) -> Result<usize> {
        self.index
            .get(unit_id)
            .copied()
            .ok_or_else(|| MigrationError::UnitNotFound {
                job: self.job.id.to_string(),
                unit: unit_id.to_string(),
            })
    }

    fn append(&mut self, record: &LedgerRecord) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(record),
            None => Ok(()),
        }
    }

    fn apply_status(&mut self, change: StatusChange) {
        self.job.status = change.status;
        self.job.status_reason = change.reason.clone();
        self.job.updated_at = change.at;
        self.history.push(change);
    }
}

fn apply_unit_transition(unit: &mut MigrationUnit, to: UnitState, error: Option<String>, at: SystemTime) {
    match to {
        UnitState::InFlight => {
            unit.attempts += 1;
            unit.last_attempt_at = Some(at);
        }
        UnitState::Failed => unit.last_error = error,
        UnitState::Pending | UnitState::Done => {}
    }
    unit.state = to;
}

pub struct ProgressLedger {
    root: Option<PathBuf>,
    jobs: Mutex<HashMap<JobId, Arc<Mutex<JobLedger>>>>,
    memory_locks: Mutex<HashMap<String, JobId>>,
}

impl ProgressLedger {
    /// Opens (or initialises) a durable ledger rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("jobs"))?;
        std::fs::create_dir_all(root.join("locks"))?;
        std::fs::create_dir_all(root.join("archive"))?;
        info!(root = %root.display(), "Opened progress ledger");
        Ok(Self {
            root: Some(root),
            jobs: Mutex::new(HashMap::new()),
            memory_locks: Mutex::new(HashMap::new()),
        })
    }

    /// A ledger that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            jobs: Mutex::new(HashMap::new()),
            memory_locks: Mutex::new(HashMap::new()),
        }
    }

    fn job_dir(&self, job_id: &JobId) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|r| r.join("jobs").join(sanitize(job_id.as_str())))
    }

    fn entry(&self, job_id: &JobId) -> Result<Arc<Mutex<JobLedger>>> {
        let mut jobs = self.jobs.lock();
        if let Some(entry) = jobs.get(job_id) {
            return Ok(entry.clone());
        }
        let path = match self.job_dir(job_id) {
            Some(dir) => dir.join(JOURNAL_FILE),
            None => return Err(MigrationError::JobNotFound(job_id.to_string())),
        };
        if !path.exists() {
            return Err(MigrationError::JobNotFound(job_id.to_string()));
        }
        let (journal, records) = Journal::open(&path)?;
        let ledger = JobLedger::replay(journal, records)?;
        debug!(%job_id, units = ledger.units.len(), status = %ledger.job.status, "Loaded job from journal");
        let entry = Arc::new(Mutex::new(ledger));
        jobs.insert(job_id.clone(), entry.clone());
        Ok(entry)
    }

    /// Persists a new job in `planning` (or whatever status `job` carries)
    /// together with its units.
    pub fn create_job(&self, job: MigrationJob, units: Vec<MigrationUnit>) -> Result<()> {
        let mut seen = HashSet::with_capacity(units.len());
        if let Some(dup) = units.iter().find(|u| !seen.insert(u.id.clone())) {
            return Err(MigrationError::Enumeration(format!(
                "unit id {} is not unique in job {}",
                dup.id, job.id
            )));
        }

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(MigrationError::JobExists(job.id.to_string()));
        }

        let journal = match self.job_dir(&job.id) {
            Some(dir) => {
                if dir.exists() {
                    return Err(MigrationError::JobExists(job.id.to_string()));
                }
                std::fs::create_dir_all(&dir)?;
                let mut journal = Journal::create(dir.join(JOURNAL_FILE))?;
                journal.append(&LedgerRecord::JobCreated {
                    job: job.clone(),
                    units: units.clone(),
                })?;
                Some(journal)
            }
            None => None,
        };

        info!(job_id = %job.id, units = units.len(), source = %job.source, target = %job.target, "Created job");
        jobs.insert(
            job.id.clone(),
            Arc::new(Mutex::new(JobLedger::new(job, units, journal))),
        );
        Ok(())
    }

    /// Units of `job_id` in enumeration order, reading the journal if the
    /// job is not loaded yet.
    pub fn load(&self, job_id: &JobId) -> Result<Vec<MigrationUnit>> {
        Ok(self.entry(job_id)?.lock().units.clone())
    }

    pub fn job(&self, job_id: &JobId) -> Result<MigrationJob> {
        Ok(self.entry(job_id)?.lock().job.clone())
    }

    pub fn unit(&self, job_id: &JobId, unit_id: &UnitId) -> Result<MigrationUnit> {
        let entry = self.entry(job_id)?;
        let ledger = entry.lock();
        let idx = ledger.unit_index(unit_id)?;
        Ok(ledger.units[idx].clone())
    }

    pub fn status_history(&self, job_id: &JobId) -> Result<Vec<StatusChange>> {
        Ok(self.entry(job_id)?.lock().history.clone())
    }

    pub fn cutover_record(&self, job_id: &JobId) -> Result<Option<CutoverRecord>> {
        Ok(self.entry(job_id)?.lock().cutover.clone())
    }

    /// Moves one unit to `to`, enforcing the unit state machine. Entering
    /// `in_flight` counts an attempt; entering `failed` records `error`.
    pub fn transition(
        &self,
        job_id: &JobId,
        unit_id: &UnitId,
        to: UnitState,
        error: Option<String>,
    ) -> Result<MigrationUnit> {
        let entry = self.entry(job_id)?;
        let mut ledger = entry.lock();
        let idx = ledger.unit_index(unit_id)?;
        let from = ledger.units[idx].state;
        if !from.can_transition_to(to) {
            return Err(MigrationError::illegal(format!("unit {}", unit_id), from, to));
        }

        let at = SystemTime::now();
        ledger.append(&LedgerRecord::UnitTransition {
            unit_id: unit_id.clone(),
            to,
            error: error.clone(),
            at,
        })?;
        apply_unit_transition(&mut ledger.units[idx], to, error, at);
        metrics::record_unit_transition(to);
        debug!(%job_id, %unit_id, %from, %to, "Unit transition");
        Ok(ledger.units[idx].clone())
    }

    /// Moves the job to `to`, enforcing the job state machine. Re-entering
    /// the current status is a no-op.
    pub fn set_job_status(
        &self,
        job_id: &JobId,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<MigrationJob> {
        self.change_status(job_id, None, to, reason)
    }

    /// Moves the job from `expected` to `to` only if it is still in
    /// `expected`. Exactly one of several concurrent callers wins; the
    /// others get a `Precondition` error and must not act on the job.
    pub fn claim_status(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<MigrationJob> {
        self.change_status(job_id, Some(expected), to, reason)
    }

    fn change_status(
        &self,
        job_id: &JobId,
        expected: Option<JobStatus>,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<MigrationJob> {
        let entry = self.entry(job_id)?;
        let mut ledger = entry.lock();
        let from = ledger.job.status;
        if let Some(expected) = expected {
            if from != expected {
                return Err(MigrationError::Precondition(format!(
                    "job {} is {}, expected {}",
                    job_id, from, expected
                )));
            }
        } else if from == to {
            return Ok(ledger.job.clone());
        }
        if !from.can_transition_to(to) {
            return Err(MigrationError::illegal(format!("job {}", job_id), from, to));
        }

        let change = StatusChange {
            status: to,
            reason,
            at: SystemTime::now(),
        };
        ledger.append(&LedgerRecord::JobStatus {
            change: change.clone(),
        })?;
        ledger.apply_status(change);
        metrics::record_job_status(to);
        info!(%job_id, %from, %to, reason = ?ledger.job.status_reason, "Job status changed");
        Ok(ledger.job.clone())
    }

    /// True when every unit of the job is `done`.
    pub fn all_done(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.entry(job_id)?.lock().units.iter().all(MigrationUnit::is_done))
    }

    /// Stores the job's cutover record; a job has at most one.
    pub fn record_cutover(&self, job_id: &JobId, record: CutoverRecord) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut ledger = entry.lock();
        if ledger.cutover.is_some() {
            return Err(MigrationError::Precondition(format!(
                "job {} already has a cutover record",
                job_id
            )));
        }
        ledger.append(&LedgerRecord::Cutover {
            record: record.clone(),
        })?;
        ledger.cutover = Some(record);
        Ok(())
    }

    /// Every known job, oldest first. Unreadable journals are skipped.
    pub fn list_jobs(&self) -> Result<Vec<MigrationJob>> {
        let mut ids: HashSet<JobId> = self.jobs.lock().keys().cloned().collect();
        if let Some(root) = &self.root {
            for dir in std::fs::read_dir(root.join("jobs"))? {
                let dir = dir?;
                if dir.path().join(JOURNAL_FILE).exists() {
                    ids.insert(JobId::new(dir.file_name().to_string_lossy().to_string()));
                }
            }
        }

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.job(&id) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable job"),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Claims exclusive ownership of `target` for `job_id`. Re-acquiring by
    /// the owner succeeds; a lock whose owner is terminal or unknown is
    /// taken over.
    pub fn acquire_target(&self, target: &str, job_id: &JobId) -> Result<()> {
        let root = match &self.root {
            Some(root) => root,
            None => {
                let mut locks = self.memory_locks.lock();
                if let Some(holder) = locks.get(target) {
                    if holder != job_id && !self.is_stale_holder(holder) {
                        return Err(MigrationError::TargetLocked {
                            target: target.to_string(),
                            holder: holder.to_string(),
                        });
                    }
                }
                locks.insert(target.to_string(), job_id.clone());
                return Ok(());
            }
        };

        let path = lock_path(root, target);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(job_id.as_str().as_bytes())?;
                    file.sync_all()?;
                    debug!(target, %job_id, "Acquired target lock");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = JobId::new(std::fs::read_to_string(&path)?.trim().to_string());
                    if &holder == job_id {
                        return Ok(());
                    }
                    if !self.is_stale_holder(&holder) {
                        return Err(MigrationError::TargetLocked {
                            target: target.to_string(),
                            holder: holder.to_string(),
                        });
                    }
                    warn!(target, stale_holder = %holder, "Reclaiming stale target lock");
                    std::fs::remove_file(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MigrationError::TargetLocked {
            target: target.to_string(),
            holder: "unknown".to_string(),
        })
    }

    pub fn release_target(&self, target: &str, job_id: &JobId) -> Result<()> {
        match &self.root {
            None => {
                let mut locks = self.memory_locks.lock();
                if locks.get(target) == Some(job_id) {
                    locks.remove(target);
                }
            }
            Some(root) => {
                let path = lock_path(root, target);
                match std::fs::read_to_string(&path) {
                    Ok(holder) if holder.trim() == job_id.as_str() => {
                        std::fs::remove_file(&path)?;
                        debug!(target, %job_id, "Released target lock");
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    pub fn target_holder(&self, target: &str) -> Result<Option<JobId>> {
        match &self.root {
            None => Ok(self.memory_locks.lock().get(target).cloned()),
            Some(root) => match std::fs::read_to_string(lock_path(root, target)) {
                Ok(holder) => Ok(Some(JobId::new(holder.trim().to_string()))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn is_stale_holder(&self, holder: &JobId) -> bool {
        match self.job(holder) {
            Ok(job) => job.status.is_terminal(),
            Err(MigrationError::JobNotFound(_)) => true,
            Err(_) => false,
        }
    }

    /// Removes a terminal job from the active set. Durable ledgers move the
    /// journal to `archive/`.
    pub fn archive(&self, job_id: &JobId) -> Result<()> {
        let job = self.job(job_id)?;
        if !job.status.is_terminal() {
            return Err(MigrationError::Precondition(format!(
                "job {} is {} and cannot be archived",
                job_id, job.status
            )));
        }
        self.release_target(&job.target, job_id)?;
        self.jobs.lock().remove(job_id);

        if let (Some(root), Some(dir)) = (&self.root, self.job_dir(job_id)) {
            let dest = root.join("archive").join(sanitize(job_id.as_str()));
            std::fs::rename(&dir, &dest)?;
        }
        info!(%job_id, "Archived job");
        Ok(())
    }
}

fn lock_path(root: &Path, target: &str) -> PathBuf {
    root.join("locks").join(format!("{}.lock", sanitize(target)))
}
