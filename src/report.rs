//! Operator-facing job status reports.

use crate::error::Result;
use crate::ledger::ProgressLedger;
use crate::model::{CutoverRecord, JobId, MigrationJob, MigrationUnit, StatusChange, UnitId, UnitState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

impl UnitCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.done + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUnit {
    pub unit_id: UnitId,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Snapshot of one job as read from the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub job: MigrationJob,
    pub counts: UnitCounts,
    /// Done share of estimated bytes, or of units when sizes are unknown.
    pub progress_percent: f64,
    pub failed_units: Vec<FailedUnit>,
    pub units: Vec<MigrationUnit>,
    pub history: Vec<StatusChange>,
    pub cutover: Option<CutoverRecord>,
}

impl JobStatusReport {
    pub fn build(ledger: &ProgressLedger, job_id: &JobId) -> Result<Self> {
        let job = ledger.job(job_id)?;
        let units = ledger.load(job_id)?;
        let history = ledger.status_history(job_id)?;
        let cutover = ledger.cutover_record(job_id)?;
        Ok(Self::from_parts(job, units, history, cutover))
    }

    pub fn from_parts(
        job: MigrationJob,
        units: Vec<MigrationUnit>,
        history: Vec<StatusChange>,
        cutover: Option<CutoverRecord>,
    ) -> Self {
        let mut counts = UnitCounts::default();
        for unit in &units {
            match unit.state {
                UnitState::Pending => counts.pending += 1,
                UnitState::InFlight => counts.in_flight += 1,
                UnitState::Done => counts.done += 1,
                UnitState::Failed => counts.failed += 1,
            }
        }

        let total_bytes: u64 = units.iter().map(|u| u.estimated_bytes).sum();
        let progress_percent = if units.is_empty() {
            100.0
        } else if total_bytes == 0 {
            counts.done as f64 * 100.0 / units.len() as f64
        } else {
            let done_bytes: u64 = units
                .iter()
                .filter(|u| u.is_done())
                .map(|u| u.estimated_bytes)
                .sum();
            done_bytes as f64 * 100.0 / total_bytes as f64
        };

        let failed_units = units
            .iter()
            .filter(|u| u.state == UnitState::Failed)
            .map(|u| FailedUnit {
                unit_id: u.id.clone(),
                attempts: u.attempts,
                last_error: u.last_error.clone(),
            })
            .collect();

        Self {
            job,
            counts,
            progress_percent,
            failed_units,
            units,
            history,
            cutover,
        }
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} [{}] {} -> {}: {}/{} units done ({:.1}%)",
            self.job.id,
            self.job.status,
            self.job.source,
            self.job.target,
            self.counts.done,
            self.counts.total(),
            self.progress_percent
        );
        if self.counts.failed > 0 {
            line.push_str(&format!(", {} failed", self.counts.failed));
        }
        if let Some(reason) = &self.job.status_reason {
            line.push_str(&format!(" - {}", reason));
        }
        line
    }

    pub fn format_detailed(&self) -> String {
        let mut report = String::new();

        report.push_str(&format!("Migration Job {}\n", self.job.id));
        report.push_str("=====================\n\n");
        report.push_str(&format!("Status: {}\n", self.job.status));
        if let Some(reason) = &self.job.status_reason {
            report.push_str(&format!("Reason: {}\n", reason));
        }
        report.push_str(&format!(
            "Source: {}  Target: {}  Partitioned by: {}\n",
            self.job.source, self.job.target, self.job.partition_column
        ));
        report.push_str(&format!("Created: {}\n", timestamp(self.job.created_at)));
        report.push_str(&format!("Progress: {:.1}%\n", self.progress_percent));
        report.push_str(&format!(
            "Units: {} pending, {} in flight, {} done, {} failed\n",
            self.counts.pending, self.counts.in_flight, self.counts.done, self.counts.failed
        ));

        if !self.failed_units.is_empty() {
            report.push_str(&format!("\nFailed Units ({}):\n", self.failed_units.len()));
            for unit in &self.failed_units {
                report.push_str(&format!(
                    "  {} after {} attempt(s): {}\n",
                    unit.unit_id,
                    unit.attempts,
                    unit.last_error.as_deref().unwrap_or("no error recorded")
                ));
            }
        }

        if !self.history.is_empty() {
            report.push_str("\nHistory:\n");
            for change in &self.history {
                report.push_str(&format!("  {} {}", timestamp(change.at), change.status));
                if let Some(reason) = &change.reason {
                    report.push_str(&format!(" ({})", reason));
                }
                report.push('\n');
            }
        }

        if let Some(cutover) = &self.cutover {
            report.push_str(&format!(
                "\nCutover: {:?} at {}\n",
                cutover.outcome,
                timestamp(cutover.performed_at)
            ));
            if let Some(until) = cutover.retained_until {
                report.push_str(&format!(
                    "  Previous data retained as {} until {}\n",
                    cutover.prior_target_name,
                    timestamp(until)
                ));
            }
            if let Some(error) = &cutover.error {
                report.push_str(&format!("  Error: {}\n", error));
            }
        }

        report
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn timestamp(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).to_rfc3339()
}
