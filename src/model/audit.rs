//! Audit entries and watermarks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Cursor, JobId, Operation, RecordKey, Row};

/// Monotonically increasing audit entry id.
pub type AuditId = u64;

/// Who performed a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Job(JobId),
    User(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Job(id) => write!(f, "job:{}", id),
            Actor::User(name) => write!(f, "user:{}", name),
        }
    }
}

/// Append-only record of one applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub job_id: Option<JobId>,
    pub table: String,
    pub key: RecordKey,
    pub operation: Operation,
    /// `None` for inserts.
    pub pre_image: Option<Row>,
    /// `None` for deletes.
    pub post_image: Option<Row>,
    pub applied_at: DateTime<Utc>,
    pub actor: Actor,
    /// Id of the compensating entry that reversed this one.
    pub reversed_by: Option<AuditId>,
    /// Id of the entry this one compensates, for rollback entries.
    pub compensates: Option<AuditId>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

/// An audit entry before the log assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub job_id: Option<JobId>,
    pub table: String,
    pub key: RecordKey,
    pub operation: Operation,
    pub pre_image: Option<Row>,
    pub post_image: Option<Row>,
    pub applied_at: DateTime<Utc>,
    pub actor: Actor,
    pub compensates: Option<AuditId>,
    pub annotations: Vec<String>,
}

impl NewAuditEntry {
    pub fn into_entry(self, id: AuditId) -> AuditEntry {
        AuditEntry {
            id,
            job_id: self.job_id,
            table: self.table,
            key: self.key,
            operation: self.operation,
            pre_image: self.pre_image,
            post_image: self.post_image,
            applied_at: self.applied_at,
            actor: self.actor,
            reversed_by: None,
            compensates: self.compensates,
            annotations: self.annotations,
        }
    }

    /// Check the pre/post-image shape required for `operation`.
    pub fn is_well_formed(&self) -> bool {
        match self.operation {
            Operation::Insert => self.post_image.is_some(),
            Operation::Update => self.post_image.is_some(),
            Operation::Delete => self.post_image.is_none() && self.pre_image.is_some(),
        }
    }
}

/// Committed high-water mark for one table of one sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub table: String,
    /// Last committed `(timestamp, key)` of the main table scan.
    pub cursor: Cursor,
    /// Last committed cursor of the tombstone table, if one is configured.
    pub tombstone_cursor: Option<Cursor>,
    /// Total number of changes committed for this table; strictly grows with
    /// every non-empty batch.
    pub change_id: u64,
    pub committed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn initial(table: &str) -> Self {
        Self {
            table: table.to_string(),
            cursor: Cursor::at_timestamp(i64::MIN),
            tombstone_cursor: None,
            change_id: 0,
            committed_at: DateTime::<Utc>::default(),
        }
    }

    /// True if committing `self` after `prior` would move any component backwards.
    pub fn regresses_from(&self, prior: &Watermark) -> bool {
        if self.change_id < prior.change_id || self.cursor < prior.cursor {
            return true;
        }
        match (&self.tombstone_cursor, &prior.tombstone_cursor) {
            (Some(next), Some(prev)) => next < prev,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wm(ts: i64, key: i64, change_id: u64) -> Watermark {
        Watermark {
            table: "parcels".into(),
            cursor: Cursor::new(ts, RecordKey::int(key)),
            tombstone_cursor: None,
            change_id,
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_watermark_regression() {
        assert!(wm(100, 1, 1).regresses_from(&wm(101, 2, 2)));
        assert!(wm(101, 1, 3).regresses_from(&wm(101, 2, 2)));
        assert!(!wm(101, 2, 2).regresses_from(&wm(101, 2, 2)));
        assert!(!wm(102, 1, 5).regresses_from(&wm(101, 2, 2)));
    }

    #[test]
    fn test_change_id_regression() {
        assert!(wm(200, 1, 1).regresses_from(&wm(100, 1, 4)));
    }

    #[test]
    fn test_delete_entry_shape() {
        let entry = NewAuditEntry {
            job_id: None,
            table: "parcels".into(),
            key: RecordKey::int(1),
            operation: Operation::Delete,
            pre_image: Some(Row::new()),
            post_image: None,
            applied_at: Utc::now(),
            actor: Actor::User("clerk".into()),
            compensates: None,
            annotations: vec![],
        };
        assert!(entry.is_well_formed());

        let bad = NewAuditEntry {
            post_image: Some(Row::new()),
            ..entry
        };
        assert!(!bad.is_well_formed());
    }
}
