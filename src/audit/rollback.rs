//! Compensating rollback.
//!
//! Entries are reversed newest first. Each reversal restores the original
//! pre-image and is itself audited, pointing back at the entry it
//! compensates. The whole plan commits as one write set, so a constraint
//! violation anywhere leaves the target untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::EntryBuilder;
use crate::detect::content_hash;
use crate::error::SyncError;
use crate::model::{AuditEntry, AuditId, JobId, RecordKey, Row};
use crate::storage::{AuditFilter, KeyState, SyncStore, WriteSet};

/// Which entries to roll back.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackRange {
    Ids(Vec<AuditId>),
    /// Inclusive id range.
    IdRange { from: AuditId, to: AuditId },
    /// Inclusive time window on `applied_at`.
    Window {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    /// Everything a job applied.
    Job(JobId),
}

/// A rollback ready to commit.
#[derive(Debug)]
pub struct RollbackPlan {
    pub writes: WriteSet,
    /// Entries that will be marked reversed, newest first.
    pub compensated: Vec<AuditId>,
    /// Entries in range left alone: already reversed, themselves
    /// compensations, or with nothing to restore.
    pub skipped: Vec<AuditId>,
}

async fn select(store: &dyn SyncStore, range: &RollbackRange) -> Result<Vec<AuditEntry>, SyncError> {
    let entries = match range {
        RollbackRange::Ids(ids) => {
            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                let entry = store
                    .audit_entry(*id)
                    .await?
                    .ok_or_else(|| SyncError::Rollback(format!("audit entry {} not found", id)))?;
                entries.push(entry);
            }
            entries
        }
        RollbackRange::IdRange { from, to } => {
            store
                .audit_entries(&AuditFilter {
                    from_id: Some(*from),
                    to_id: Some(*to),
                    ..AuditFilter::default()
                })
                .await?
        }
        RollbackRange::Window { since, until } => {
            store
                .audit_entries(&AuditFilter {
                    since: Some(*since),
                    until: Some(*until),
                    ..AuditFilter::default()
                })
                .await?
        }
        RollbackRange::Job(job_id) => store.audit_entries(&AuditFilter::for_job(*job_id)).await?,
    };
    Ok(entries)
}

/// Plan the compensations for `range`. `pipeline` scopes the key-state
/// updates that keep later conflict detection from mistaking the rollback
/// for an outside edit.
pub async fn plan_rollback(
    store: &dyn SyncStore,
    range: &RollbackRange,
    builder: &EntryBuilder,
    pipeline: &str,
) -> Result<RollbackPlan, SyncError> {
    let mut entries = select(store, range).await?;
    entries.sort_by(|a, b| b.id.cmp(&a.id));
    entries.dedup_by_key(|e| e.id);

    let mut plan = RollbackPlan {
        writes: WriteSet::new(pipeline),
        compensated: Vec::new(),
        skipped: Vec::new(),
    };

    // Simulated target state per key as the plan progresses.
    let mut current: BTreeMap<(String, RecordKey), Option<Row>> = BTreeMap::new();

    for entry in entries {
        if entry.reversed_by.is_some() || entry.compensates.is_some() {
            plan.skipped.push(entry.id);
            continue;
        }
        let slot = (entry.table.clone(), entry.key.clone());
        let before = match current.get(&slot) {
            Some(row) => row.clone(),
            None => store
                .read_current(&entry.table, std::slice::from_ref(&entry.key))
                .await?
                .remove(&entry.key),
        };
        let restored = entry.pre_image.clone();

        let Some(mut compensation) =
            builder.entry(&entry.table, &entry.key, before, restored.clone(), vec![format!("rollback:{}", entry.id)])
        else {
            warn!(id = entry.id, table = %entry.table, key = %entry.key, "Nothing to restore, skipping");
            plan.skipped.push(entry.id);
            continue;
        };
        compensation.compensates = Some(entry.id);

        match &restored {
            Some(row) => plan
                .writes
                .upsert_batch(&entry.table, [(entry.key.clone(), row.clone())]),
            None => plan.writes.delete_batch(&entry.table, [entry.key.clone()]),
        }
        debug!(id = entry.id, table = %entry.table, key = %entry.key, "Planned compensation");
        plan.writes.audit.push(compensation);
        plan.compensated.push(entry.id);
        current.insert(slot, restored);
    }

    for ((table, key), row) in current {
        let states = store.key_states(pipeline, &table).await?;
        if let Some(state) = states.get(&key) {
            plan.writes.key_states.push((
                table,
                key,
                Some(KeyState {
                    target_hash: row.as_ref().map(content_hash),
                    ..state.clone()
                }),
            ));
        }
    }

    Ok(plan)
}
