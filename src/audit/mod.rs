//! Audit & rollback log.
//!
//! The log itself lives in the [`SyncStore`](crate::storage::SyncStore) and
//! is appended by every commit. This module builds entries, plans
//! compensating rollbacks and plans retention compaction.

use chrono::{DateTime, Utc};

use crate::model::{Actor, JobId, NewAuditEntry, Operation, RecordKey, Row};

pub mod retention;
pub mod rollback;

pub use retention::{plan_compaction, CompactionPlan};
pub use rollback::{plan_rollback, RollbackPlan, RollbackRange};

/// Operation that takes a key from `pre` to `post`; `None` when both are absent.
pub fn operation_for(pre: Option<&Row>, post: Option<&Row>) -> Option<Operation> {
    match (pre, post) {
        (None, Some(_)) => Some(Operation::Insert),
        (Some(_), Some(_)) => Some(Operation::Update),
        (Some(_), None) => Some(Operation::Delete),
        (None, None) => None,
    }
}

/// Audit entry for one mutation.
pub struct EntryBuilder {
    job_id: Option<JobId>,
    actor: Actor,
    applied_at: DateTime<Utc>,
}

impl EntryBuilder {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            actor: Actor::Job(job_id),
            applied_at: Utc::now(),
        }
    }

    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            job_id: None,
            actor: Actor::User(user.into()),
            applied_at: Utc::now(),
        }
    }

    pub fn at(mut self, applied_at: DateTime<Utc>) -> Self {
        self.applied_at = applied_at;
        self
    }

    /// `None` when neither image exists.
    pub fn entry(
        &self,
        table: &str,
        key: &RecordKey,
        pre_image: Option<Row>,
        post_image: Option<Row>,
        annotations: Vec<String>,
    ) -> Option<NewAuditEntry> {
        let operation = operation_for(pre_image.as_ref(), post_image.as_ref())?;
        Some(NewAuditEntry {
            job_id: self.job_id,
            table: table.to_string(),
            key: key.clone(),
            operation,
            pre_image,
            post_image,
            applied_at: self.applied_at,
            actor: self.actor.clone(),
            compensates: None,
            annotations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_inferred_from_images() {
        let row = Row::new();
        assert_eq!(operation_for(None, Some(&row)), Some(Operation::Insert));
        assert_eq!(operation_for(Some(&row), Some(&row)), Some(Operation::Update));
        assert_eq!(operation_for(Some(&row), None), Some(Operation::Delete));
        assert_eq!(operation_for(None, None), None);
    }

    #[test]
    fn test_builder_sets_actor() {
        let job = JobId::new();
        let entry = EntryBuilder::for_job(job)
            .entry("parcels", &RecordKey::int(1), None, Some(Row::new()), vec![])
            .unwrap();
        assert_eq!(entry.actor, Actor::Job(job));
        assert_eq!(entry.job_id, Some(job));
        assert!(entry.is_well_formed());

        let entry = EntryBuilder::for_user("clerk")
            .entry("parcels", &RecordKey::int(1), Some(Row::new()), None, vec![])
            .unwrap();
        assert_eq!(entry.operation, Operation::Delete);
        assert_eq!(entry.job_id, None);
    }
}
