//! In-memory store.
//!
//! Commits apply to a working copy of the whole state and swap it in only
//! when every write succeeded. Fault switches let tests fail a commit
//! midway, or make it transiently unavailable, and observe that nothing
//! leaked.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use super::constraints::{orphan, referenced, Reference};
use super::{
    check_write_set, grant_lease, AuditFilter, CompactedSnapshot, Constraints, KeyState, Lease,
    LeaseGrant, LeaseMode, Result, RowWrite, StorageError, SyncStore, WriteSet,
};
use crate::dlq::DeadLetter;
use crate::model::{AuditEntry, AuditId, JobId, JobState, Operation, RecordKey, Row, Watermark};
use crate::resolve::ParkedConflict;

type PipelineTable = (String, String);

#[derive(Debug, Clone, Default)]
struct State {
    rows: BTreeMap<String, BTreeMap<RecordKey, Row>>,
    audit: BTreeMap<AuditId, AuditEntry>,
    next_audit_id: AuditId,
    watermarks: BTreeMap<PipelineTable, Watermark>,
    key_states: BTreeMap<PipelineTable, BTreeMap<RecordKey, KeyState>>,
    dead_letters: BTreeMap<(JobId, String, RecordKey), DeadLetter>,
    parked: BTreeMap<(String, RecordKey), ParkedConflict>,
    compacted: BTreeMap<(String, RecordKey), CompactedSnapshot>,
    jobs: BTreeMap<JobId, JobState>,
    leases: BTreeMap<String, Vec<Lease>>,
}

impl State {
    fn exists(&self, reference: &Reference) -> bool {
        let Some(rows) = self.rows.get(&reference.table) else {
            return false;
        };
        match &reference.key {
            Some(key) => rows.contains_key(key),
            None => rows.values().any(|row| reference.matches(row)),
        }
    }
}

/// In-memory [`SyncStore`] with fault injection.
#[derive(Default)]
pub struct MemoryStore {
    constraints: Constraints,
    state: RwLock<State>,
    fail_after_writes: RwLock<Option<usize>>,
    fail_on_commit: RwLock<bool>,
    transient_failures: RwLock<u32>,
    stall_commits: RwLock<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constraints(constraints: Constraints) -> Self {
        Self {
            constraints,
            ..Self::default()
        }
    }

    /// Seed target rows directly, bypassing audit. For fixtures.
    pub async fn seed_rows(&self, table: &str, rows: Vec<(RecordKey, Row)>) {
        let mut state = self.state.write().await;
        state.rows.entry(table.to_string()).or_default().extend(rows);
    }

    /// Overwrite a target row without audit, as an out-of-band CAMA edit would.
    pub async fn write_unaudited(&self, table: &str, key: RecordKey, row: Row) {
        let mut state = self.state.write().await;
        state.rows.entry(table.to_string()).or_default().insert(key, row);
    }

    /// Fail the next commit that writes rows, after `writes` of them have
    /// been applied to its working copy. Clears itself once triggered.
    pub async fn set_fail_after_writes(&self, writes: Option<usize>) {
        *self.fail_after_writes.write().await = writes;
    }

    /// Fail every commit after all of its writes were applied to the
    /// working copy, until cleared.
    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.fail_on_commit.write().await = fail;
    }

    /// Reject the next `count` commits that write target rows with a
    /// transient error.
    pub async fn set_transient_failures(&self, count: u32) {
        *self.transient_failures.write().await = count;
    }

    /// Leave every commit that writes target rows pending forever, as a hung
    /// connection would, until cleared.
    pub async fn set_stall_commits(&self, stall: bool) {
        *self.stall_commits.write().await = stall;
    }

    pub async fn audit_len(&self) -> usize {
        self.state.read().await.audit.len()
    }

    fn apply_rows(&self, state: &mut State, writes: &[RowWrite], fail_after: Option<usize>) -> Result<()> {
        for (applied, write) in writes.iter().enumerate() {
            if fail_after == Some(applied) {
                return Err(StorageError::Aborted(format!(
                    "injected failure after {} writes",
                    applied
                )));
            }
            match write {
                RowWrite::Upsert { table, key, row } => {
                    self.constraints.check_key(table, key, row)?;
                    for parent in self.constraints.parent_references(table, row) {
                        if !state.exists(&parent) {
                            return Err(orphan(table, key, &parent));
                        }
                    }
                    state
                        .rows
                        .entry(table.clone())
                        .or_default()
                        .insert(key.clone(), row.clone());
                }
                RowWrite::Delete { table, key } => {
                    let current = state.rows.get(table).and_then(|rows| rows.get(key)).cloned();
                    if let Some(current) = current {
                        for child in self.constraints.child_references(table, &current) {
                            if state.exists(&child) {
                                return Err(referenced(table, key, &child));
                            }
                        }
                        if let Some(rows) = state.rows.get_mut(table) {
                            rows.remove(key);
                        }
                    }
                }
            }
        }
        if fail_after.is_some() {
            return Err(StorageError::Aborted("injected failure at commit".into()));
        }
        Ok(())
    }

    fn apply(&self, state: &mut State, writes: WriteSet, fail_after: Option<usize>) -> Result<Vec<AuditEntry>> {
        self.apply_rows(state, &writes.rows, fail_after)?;

        let mut appended = Vec::with_capacity(writes.audit.len());
        for entry in writes.audit {
            state.next_audit_id += 1;
            let id = state.next_audit_id;
            if let Some(target) = entry.compensates {
                let original = state.audit.get_mut(&target).ok_or_else(|| {
                    StorageError::Invariant(format!("compensated audit entry {} not found", target))
                })?;
                if let Some(by) = original.reversed_by {
                    return Err(StorageError::Invariant(format!(
                        "audit entry {} already reversed by {}",
                        target, by
                    )));
                }
                original.reversed_by = Some(id);
            }
            let entry = entry.into_entry(id);
            state.audit.insert(id, entry.clone());
            appended.push(entry);
        }

        let now = Utc::now();
        for mut watermark in writes.watermarks {
            let slot = (writes.pipeline.clone(), watermark.table.clone());
            if let Some(prior) = state.watermarks.get(&slot) {
                if watermark.regresses_from(prior) {
                    return Err(StorageError::Invariant(format!(
                        "watermark for {} would regress from {} to {}",
                        watermark.table, prior.cursor, watermark.cursor
                    )));
                }
            }
            watermark.committed_at = now;
            state.watermarks.insert(slot, watermark);
        }

        for (table, key, key_state) in writes.key_states {
            let states = state
                .key_states
                .entry((writes.pipeline.clone(), table))
                .or_default();
            match key_state {
                Some(s) => {
                    states.insert(key, s);
                }
                None => {
                    states.remove(&key);
                }
            }
        }

        for (job_id, table, key) in writes.resolved_dead_letters {
            state.dead_letters.remove(&(job_id, table, key));
        }
        for letter in writes.dead_letters {
            state
                .dead_letters
                .insert((letter.job_id, letter.table.clone(), letter.key.clone()), letter);
        }

        for (table, key) in writes.cleared_conflicts {
            state.parked.remove(&(table, key));
        }
        for conflict in writes.parked {
            state
                .parked
                .insert((conflict.table.clone(), conflict.key.clone()), conflict);
        }

        for snapshot in writes.compacted {
            state
                .compacted
                .insert((snapshot.table.clone(), snapshot.key.clone()), snapshot);
        }
        for id in writes.pruned_audit {
            state.audit.remove(&id);
        }

        if let Some(job) = writes.job {
            state.jobs.insert(job.id, job);
        }

        Ok(appended)
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn read_current(&self, table: &str, keys: &[RecordKey]) -> Result<BTreeMap<RecordKey, Row>> {
        let state = self.state.read().await;
        let Some(rows) = state.rows.get(table) else {
            return Ok(BTreeMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| rows.get(k).map(|r| (k.clone(), r.clone())))
            .collect())
    }

    async fn scan_rows(&self, table: &str) -> Result<Vec<(RecordKey, Row)>> {
        let state = self.state.read().await;
        Ok(state
            .rows
            .get(table)
            .map(|rows| rows.iter().map(|(k, r)| (k.clone(), r.clone())).collect())
            .unwrap_or_default())
    }

    async fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn audit_entry(&self, id: AuditId) -> Result<Option<AuditEntry>> {
        Ok(self.state.read().await.audit.get(&id).cloned())
    }

    async fn recent_post_images(&self, table: &str, limit: usize) -> Result<Vec<Row>> {
        let state = self.state.read().await;
        let mut images: Vec<Row> = state
            .audit
            .values()
            .rev()
            .filter(|e| e.table == table && e.operation != Operation::Delete)
            .filter_map(|e| e.post_image.clone())
            .take(limit)
            .collect();
        images.reverse();
        Ok(images)
    }

    async fn compacted(&self, table: Option<&str>) -> Result<Vec<CompactedSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .compacted
            .values()
            .filter(|s| table.map_or(true, |t| s.table == t))
            .cloned()
            .collect())
    }

    async fn watermark(&self, pipeline: &str, table: &str) -> Result<Option<Watermark>> {
        let state = self.state.read().await;
        Ok(state
            .watermarks
            .get(&(pipeline.to_string(), table.to_string()))
            .cloned())
    }

    async fn key_states(&self, pipeline: &str, table: &str) -> Result<BTreeMap<RecordKey, KeyState>> {
        let state = self.state.read().await;
        Ok(state
            .key_states
            .get(&(pipeline.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn dead_letters(&self, job_id: Option<JobId>, table: Option<&str>) -> Result<Vec<DeadLetter>> {
        let state = self.state.read().await;
        Ok(state
            .dead_letters
            .values()
            .filter(|d| job_id.map_or(true, |j| d.job_id == j))
            .filter(|d| table.map_or(true, |t| d.table == t))
            .cloned()
            .collect())
    }

    async fn parked_conflicts(&self, table: Option<&str>) -> Result<Vec<ParkedConflict>> {
        let state = self.state.read().await;
        Ok(state
            .parked
            .values()
            .filter(|c| table.map_or(true, |t| c.table == t))
            .cloned()
            .collect())
    }

    async fn job(&self, id: JobId) -> Result<Option<JobState>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn jobs(&self) -> Result<Vec<JobState>> {
        let state = self.state.read().await;
        let mut jobs: Vec<JobState> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        Ok(jobs)
    }

    async fn acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        mode: LeaseMode,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let held = state.leases.entry(resource.to_string()).or_default();
        let request = Lease {
            resource: resource.to_string(),
            holder: holder.to_string(),
            mode,
            expires_at: now + ttl,
        };
        let grant = grant_lease(held, request, now)?;
        held.retain(|l| l.holder != holder && l.is_live(now));
        held.push(grant.lease.clone());
        Ok(grant)
    }

    async fn release_lease(&self, resource: &str, holder: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(held) = state.leases.get_mut(resource) {
            held.retain(|l| l.holder != holder);
        }
        Ok(())
    }

    async fn leases(&self, resource: &str) -> Result<Vec<Lease>> {
        let now = Utc::now();
        let state = self.state.read().await;
        Ok(state
            .leases
            .get(resource)
            .map(|held| held.iter().filter(|l| l.is_live(now)).cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, writes: WriteSet) -> Result<Vec<AuditEntry>> {
        check_write_set(&writes)?;
        if !writes.rows.is_empty() && *self.stall_commits.read().await {
            return std::future::pending().await;
        }
        if !writes.rows.is_empty() {
            let mut remaining = self.transient_failures.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Transient("injected transient failure".into()));
            }
        }
        let armed = if writes.rows.is_empty() {
            None
        } else {
            self.fail_after_writes.write().await.take()
        };
        let fail_after = match armed {
            Some(n) => Some(n),
            None if *self.fail_on_commit.read().await => Some(usize::MAX),
            None => None,
        };

        let mut state = self.state.write().await;
        let mut working = state.clone();
        let appended = self.apply(&mut working, writes, fail_after)?;
        *state = working;
        Ok(appended)
    }
}

#[cfg(test)]
mod tests;
