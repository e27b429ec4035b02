//! Dead letters.
//!
//! Records that cannot be applied are persisted with full context: the
//! transformed record, its validation verdict, and why it was rejected.
//! Dead letters are keyed by `(job, table, source key)`.
//!
//! Two kinds exist:
//! - **Permanent**: blocked by validation or out of retries. Not replayed
//!   automatically.
//! - **Retryable**: rejected by a target constraint after the in-batch
//!   requeues ran out. The job's deferred constraint pass replays them once
//!   every table has been processed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, RecordKey, Severity, TransformedRecord, ValidationVerdict};

/// Why a record was dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionDetails {
    /// Validation reached a blocking severity.
    Validation { severity: Severity },
    /// The target rejected the write.
    ConstraintViolation { error: String, attempts: u32 },
}

/// Dead letter entry for a record that did not reach the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub table: String,
    pub key: RecordKey,
    pub record: TransformedRecord,
    pub verdict: Option<ValidationVerdict>,
    /// Human-readable reason for rejection.
    pub reason: String,
    pub details: RejectionDetails,
    /// Replayed by the deferred constraint pass.
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
    /// Additional context.
    pub metadata: BTreeMap<String, String>,
}

impl DeadLetter {
    /// Create a dead letter for a record blocked by validation.
    pub fn from_validation(
        job_id: JobId,
        record: &TransformedRecord,
        verdict: &ValidationVerdict,
    ) -> Self {
        let severity = verdict.max_severity().unwrap_or(Severity::Error);
        let codes: Vec<&str> = verdict
            .issues
            .iter()
            .filter(|i| i.severity >= Severity::Error)
            .map(|i| i.code.as_str())
            .collect();
        let reason = format!("Validation blocked apply ({:?}): {}", severity, codes.join(", "));

        Self {
            job_id,
            table: record.table.clone(),
            key: record.key.clone(),
            record: record.clone(),
            verdict: Some(verdict.clone()),
            reason,
            details: RejectionDetails::Validation { severity },
            retryable: false,
            occurred_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Create a retryable dead letter for a constraint violation.
    pub fn from_constraint_violation(
        job_id: JobId,
        record: &TransformedRecord,
        verdict: Option<&ValidationVerdict>,
        error: &str,
        attempts: u32,
    ) -> Self {
        let reason = format!(
            "Target constraint violated after {} attempts: {}",
            attempts, error
        );

        Self {
            job_id,
            table: record.table.clone(),
            key: record.key.clone(),
            record: record.clone(),
            verdict: verdict.cloned(),
            reason,
            details: RejectionDetails::ConstraintViolation {
                error: error.to_string(),
                attempts,
            },
            retryable: true,
            occurred_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Stop automatic replay. Used when the deferred pass gives up.
    pub fn into_permanent(mut self, error: &str) -> Self {
        self.retryable = false;
        if let RejectionDetails::ConstraintViolation { attempts, .. } = &self.details {
            self.details = RejectionDetails::ConstraintViolation {
                error: error.to_string(),
                attempts: attempts + 1,
            };
        }
        self.reason = format!("Deferred pass could not apply: {}", error);
        self
    }
}
