//! Job, unit and cutover records shared by the ledger, the controller and
//! the operator surface.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a migration job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates `<target>-<millis hex>-<random hex>`; the target part is
    /// reduced to characters that are safe in a file name.
    pub fn generate(target: &str) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix: u16 = rand::random();
        Self(format!("{}-{:x}-{:04x}", sanitize(target), millis, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable unit identifier: the source dataset's own partition id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    CutoverDone,
    RolledBack,
    /// The exchange has been claimed and may or may not have run.
    CuttingOver,
    RollingBack,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Planning, Running)
                | (Planning, Paused)
                | (Planning, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
                | (Completed, CuttingOver)
                | (Completed, Failed)
                | (CuttingOver, CutoverDone)
                | (CuttingOver, Failed)
                | (CuttingOver, Completed)
                | (CutoverDone, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, CutoverDone)
        )
    }

    /// No further work can be scheduled for the job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::CutoverDone | JobStatus::RolledBack
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Planning => "planning",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::CutoverDone => "cutover_done",
            JobStatus::RolledBack => "rolled_back",
            JobStatus::CuttingOver => "cutting_over",
            JobStatus::RollingBack => "rolling_back",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl UnitState {
    /// `pending -> in_flight -> {done | failed}`, `failed -> pending`.
    pub fn can_transition_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Pending, InFlight) | (InFlight, Done) | (InFlight, Failed) | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::InFlight => "in_flight",
            UnitState::Done => "done",
            UnitState::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operator submits to start a migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub source: String,
    pub target: String,
    /// Column or expression the engine partitions the source by.
    pub partition_column: String,
    #[serde(default)]
    pub job_id: Option<JobId>,
}

impl JobSpec {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        partition_column: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            partition_column: partition_column.into(),
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(JobId::new(id));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MigrationJob {
    pub id: JobId,
    pub source: String,
    pub target: String,
    pub partition_column: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub status: JobStatus,
    /// Reason attached to the latest status change (gate reasons, failure cause).
    pub status_reason: Option<String>,
}

impl MigrationJob {
    pub fn new(id: JobId, spec: &JobSpec) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            source: spec.source.clone(),
            target: spec.target.clone(),
            partition_column: spec.partition_column.clone(),
            created_at: now,
            updated_at: now,
            status: JobStatus::Planning,
            status_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MigrationUnit {
    pub id: UnitId,
    pub estimated_rows: u64,
    pub estimated_bytes: u64,
    pub state: UnitState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<SystemTime>,
}

impl MigrationUnit {
    pub fn new(id: UnitId, estimated_rows: u64, estimated_bytes: u64) -> Self {
        Self {
            id,
            estimated_rows,
            estimated_bytes,
            state: UnitState::Pending,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == UnitState::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum CutoverOutcome {
    Success,
    Failure,
}

/// Immutable record of a cutover attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CutoverRecord {
    pub job_id: JobId,
    pub performed_at: SystemTime,
    /// Name under which the previous dataset of record is retained.
    pub prior_target_name: String,
    pub outcome: CutoverOutcome,
    pub rollback_available: bool,
    pub retained_until: Option<SystemTime>,
    pub error: Option<String>,
}

/// One journaled job status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct StatusChange {
    pub status: JobStatus,
    pub reason: Option<String>,
    pub at: SystemTime,
}
