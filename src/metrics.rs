use crate::error::{MigrationError, Result};
use crate::model::{JobStatus, UnitState};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

lazy_static::lazy_static! {
    // Unit state transitions, labelled by the state entered
    static ref UNIT_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "partition_migrator_unit_transitions_total",
        "Migration unit state transitions",
        &["state"]
    ).unwrap();

    static ref UNIT_DURATION: HistogramVec = register_histogram_vec!(
        HistogramOpts::new(
            "partition_migrator_unit_duration_seconds",
            "Time to clear, copy and verify one unit"
        ).buckets(vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 1800.0]),
        &["outcome"]
    ).unwrap();

    static ref ROWS_COPIED: IntCounter = register_int_counter!(
        "partition_migrator_rows_copied_total",
        "Rows copied into shadow targets and verified"
    ).unwrap();

    static ref GATE_DENIALS: IntCounterVec = register_int_counter_vec!(
        "partition_migrator_gate_denials_total",
        "Negative health gate verdicts by failing check",
        &["reason"]
    ).unwrap();

    static ref JOB_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "partition_migrator_job_outcomes_total",
        "Jobs reaching a completed or terminal status",
        &["status"]
    ).unwrap();

    static ref ACTIVE_CONTROLLERS: IntGauge = register_int_gauge!(
        "partition_migrator_active_controllers",
        "Controller loops currently running"
    ).unwrap();
}

pub fn record_unit_transition(state: UnitState) {
    UNIT_TRANSITIONS.with_label_values(&[state.as_str()]).inc();
}

pub fn record_unit_execution(success: bool, duration: Duration, rows: u64) {
    let outcome = if success { "done" } else { "failed" };
    UNIT_DURATION
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
    if success {
        ROWS_COPIED.inc_by(rows);
    }
}

pub fn record_gate_denial(reason: &str) {
    GATE_DENIALS.with_label_values(&[reason]).inc();
}

pub fn record_job_status(status: JobStatus) {
    if status == JobStatus::Completed || status.is_terminal() {
        JOB_OUTCOMES.with_label_values(&[status.as_str()]).inc();
    }
}

/// Guard counting a running controller loop.
pub struct ControllerGuard;

impl ControllerGuard {
    pub fn new() -> Self {
        ACTIVE_CONTROLLERS.inc();
        Self
    }
}

impl Default for ControllerGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        ACTIVE_CONTROLLERS.dec();
    }
}

/// Prometheus text exposition of every registered metric.
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| MigrationError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MigrationError::Internal(e.to_string()))
}
