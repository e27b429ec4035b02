//! Job state: status machine, per-table progress, counters.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cursor, DetectedChange};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Full,
    #[default]
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Cancellation always passes through `Paused`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Paused)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Stage of the per-table state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePhase {
    #[default]
    Pending,
    Detecting,
    Transforming,
    Validating,
    Resolving,
    Applying,
    Checkpointing,
    Completed,
    Paused,
    Failed,
}

/// Committed progress of one table within a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableProgress {
    pub phase: TablePhase,
    pub cursor: Option<Cursor>,
    pub batches: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub detected: u64,
    pub applied: u64,
    pub no_change: u64,
    pub skipped: u64,
    pub conflicts_parked: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub batches: u64,
    pub retries: u64,
}

impl JobCounters {
    pub fn absorb(&mut self, other: &JobCounters) {
        self.detected += other.detected;
        self.applied += other.applied;
        self.no_change += other.no_change;
        self.skipped += other.skipped;
        self.conflicts_parked += other.conflicts_parked;
        self.dead_lettered += other.dead_lettered;
        self.requeued += other.requeued;
        self.batches += other.batches;
        self.retries += other.retries;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub at: DateTime<Utc>,
    pub table: Option<String>,
    pub kind: String,
    pub message: String,
}

/// A batch kept for replay after the retry ceiling was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedBatch {
    pub table: String,
    pub changes: Vec<DetectedChange>,
    pub reason: String,
}

/// Schema drift that paused the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftInfo {
    pub table: String,
    pub missing_columns: Vec<String>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: JobId,
    pub mode: JobMode,
    pub tables: Vec<String>,
    pub status: JobStatus,
    pub progress: BTreeMap<String, TableProgress>,
    pub counters: JobCounters,
    pub errors: Vec<JobError>,
    pub preserved_batch: Option<PreservedBatch>,
    pub drift: Option<DriftInfo>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(id: JobId, mode: JobMode, tables: Vec<String>) -> Self {
        let now = Utc::now();
        let progress = tables
            .iter()
            .map(|t| (t.clone(), TableProgress::default()))
            .collect();
        Self {
            id,
            mode,
            tables,
            status: JobStatus::Pending,
            progress,
            counters: JobCounters::default(),
            errors: Vec::new(),
            preserved_batch: None,
            drift: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions out of terminal states.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), SyncError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_error(&mut self, table: Option<&str>, kind: &str, message: impl Into<String>) {
        self.errors.push(JobError {
            at: Utc::now(),
            table: table.map(str::to_string),
            kind: kind.to_string(),
            message: message.into(),
        });
        self.updated_at = Utc::now();
    }

    pub fn set_phase(&mut self, table: &str, phase: TablePhase) {
        self.progress.entry(table.to_string()).or_default().phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut job = JobState::new(JobId::new(), JobMode::Incremental, vec!["parcels".into()]);
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = JobState::new(JobId::new(), JobMode::Full, vec![]);
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Failed).unwrap();
        assert!(job.transition(JobStatus::Running).is_err());
        assert!(job.transition(JobStatus::Completed).is_err());
    }

    #[test]
    fn test_cancel_requires_pause() {
        let mut job = JobState::new(JobId::new(), JobMode::Full, vec![]);
        job.transition(JobStatus::Running).unwrap();
        assert!(job.transition(JobStatus::Cancelled).is_err());
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Cancelled).unwrap();
    }

    #[test]
    fn test_new_job_has_progress_per_table() {
        let job = JobState::new(
            JobId::new(),
            JobMode::Incremental,
            vec!["owners".into(), "parcels".into()],
        );
        assert_eq!(job.progress.len(), 2);
        assert_eq!(job.progress["owners"].phase, TablePhase::Pending);
    }
}
