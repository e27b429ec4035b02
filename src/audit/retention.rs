//! Retention compaction.
//!
//! Entries older than the horizon collapse into one snapshot per key: the
//! post-image of the newest such entry. The boundary state stays
//! restorable; intermediate states before it do not.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::model::{AuditEntry, RecordKey};
use crate::storage::{AuditFilter, CompactedSnapshot, SyncStore, WriteSet};

#[derive(Debug)]
pub struct CompactionPlan {
    pub writes: WriteSet,
    /// Keys that received a snapshot.
    pub keys: usize,
    /// Audit entries removed.
    pub pruned: usize,
}

/// Plan compaction of every entry applied strictly before `horizon`.
pub async fn plan_compaction(
    store: &dyn SyncStore,
    horizon: DateTime<Utc>,
) -> Result<CompactionPlan, SyncError> {
    let expired: Vec<AuditEntry> = store
        .audit_entries(&AuditFilter {
            until: Some(horizon),
            ..AuditFilter::default()
        })
        .await?
        .into_iter()
        .filter(|e| e.applied_at < horizon)
        .collect();

    let mut latest: BTreeMap<(String, RecordKey), &AuditEntry> = BTreeMap::new();
    for entry in &expired {
        let slot = (entry.table.clone(), entry.key.clone());
        match latest.get(&slot) {
            Some(existing) if existing.id > entry.id => {}
            _ => {
                latest.insert(slot, entry);
            }
        }
    }

    let now = Utc::now();
    let mut writes = WriteSet::default();
    for ((table, key), entry) in &latest {
        writes.compacted.push(CompactedSnapshot {
            table: table.clone(),
            key: key.clone(),
            state: entry.post_image.clone(),
            boundary_id: entry.id,
            compacted_at: now,
        });
    }
    writes.pruned_audit = expired.iter().map(|e| e.id).collect();

    Ok(CompactionPlan {
        keys: latest.len(),
        pruned: expired.len(),
        writes,
    })
}
