use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum MigrationError {
    /// Timeouts and temporary unavailability of the storage engine.
    #[error("Transient engine error: {0}")]
    TransientEngine(String),

    /// Row count or checksum mismatch between source and target partition.
    #[error("Integrity check failed for unit {unit}: {detail}")]
    Integrity { unit: String, detail: String },

    /// Health gate negative or an operation's precondition is unmet.
    #[error("Precondition not met: {0}")]
    Precondition(String),

    #[error("Illegal transition for {entity}: {from} -> {to}")]
    IllegalTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Partition enumeration failed: {0}")]
    Enumeration(String),

    /// Non-transient rejection by the storage engine, message kept verbatim.
    #[error("{0}")]
    Engine(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Unit {unit} not found in job {job}")]
    UnitNotFound { job: String, unit: String },

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Job {0} already has an active controller")]
    JobActive(String),

    #[error("Target {target} is locked by job {holder}")]
    TargetLocked { target: String, holder: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Ledger corrupted: {0}")]
    LedgerCorrupted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => MigrationError::TransientEngine(err.to_string()),
            _ => MigrationError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::Serialization(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for MigrationError {
    fn from(err: bincode::error::EncodeError) -> Self {
        MigrationError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for MigrationError {
    fn from(err: bincode::error::DecodeError) -> Self {
        MigrationError::LedgerCorrupted(err.to_string())
    }
}

impl MigrationError {
    pub fn error_code(&self) -> i32 {
        match self {
            MigrationError::TransientEngine(_) => -1,
            MigrationError::Integrity { .. } => -2,
            MigrationError::Precondition(_) => -3,
            MigrationError::IllegalTransition { .. } => -4,
            MigrationError::Enumeration(_) => -5,
            MigrationError::Engine(_) => -6,
            MigrationError::JobNotFound(_) => -7,
            MigrationError::JobExists(_) => -8,
            MigrationError::JobActive(_) => -9,
            MigrationError::TargetLocked { .. } => -10,
            MigrationError::Config(_) => -11,
            MigrationError::Io(_) => -12,
            MigrationError::Serialization(_) => -13,
            MigrationError::LedgerCorrupted(_) => -14,
            MigrationError::UnitNotFound { .. } => -16,
            MigrationError::Internal(_) => -99,
        }
    }

    /// Errors that end the job immediately, even when raised by a single
    /// unit. Everything else a unit reports is retried up to the ceiling.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::IllegalTransition { .. }
                | MigrationError::Enumeration(_)
                | MigrationError::LedgerCorrupted(_)
        )
    }

    pub(crate) fn illegal<F: std::fmt::Display, T: std::fmt::Display>(
        entity: impl Into<String>,
        from: F,
        to: T,
    ) -> Self {
        MigrationError::IllegalTransition {
            entity: entity.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
