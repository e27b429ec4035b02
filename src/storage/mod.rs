//! Transactional store.
//!
//! One store holds the CAMA target rows together with everything the engine
//! needs to keep consistent with them: the audit log, watermarks, key-state
//! snapshots, dead letters, parked conflicts, job state and leases. Every
//! mutation goes through [`SyncStore::commit`], so target rows, their audit
//! entries and the watermark that covers them land together or not at all.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::dlq::DeadLetter;
use crate::model::{AuditEntry, AuditId, JobId, JobState, NewAuditEntry, RecordKey, Row, Watermark};
use crate::resolve::ParkedConflict;

pub mod constraints;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use constraints::Constraints;
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Version of the store layout; reported in export metadata.
pub const STORE_SCHEMA_VERSION: i64 = 2;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Constraint violation on {table}/{key}: {reason}")]
    RowRejected {
        table: String,
        key: RecordKey,
        reason: String,
    },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lease held: {0}")]
    LeaseHeld(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Transient(_) => true,
            #[cfg(feature = "sqlite")]
            StorageError::Database(e) => is_busy(e),
            _ => false,
        }
    }
}

#[cfg(feature = "sqlite")]
fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("database is locked") || message.contains("busy")
        }
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Last synced hashes for one key of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    /// Hash of the source row as last processed.
    pub source_hash: String,
    /// Hash of the target row as last written or accepted by the engine.
    pub target_hash: Option<String>,
    pub source_timestamp: Option<i64>,
}

/// Last known state of a key at a compaction boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedSnapshot {
    pub table: String,
    pub key: RecordKey,
    /// `None` when the key was deleted at the boundary.
    pub state: Option<Row>,
    /// Highest audit id folded into this snapshot.
    pub boundary_id: AuditId,
    pub compacted_at: DateTime<Utc>,
}

/// How a lease may be shared between holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    /// One holder at a time.
    Exclusive,
    /// Any number of shared holders while nobody holds it exclusively.
    Shared,
}

impl LeaseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseMode::Exclusive => "exclusive",
            LeaseMode::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exclusive" => Some(LeaseMode::Exclusive),
            "shared" => Some(LeaseMode::Shared),
            _ => None,
        }
    }
}

/// One holder's claim on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: String,
    pub holder: String,
    pub mode: LeaseMode,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A granted or renewed lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub lease: Lease,
    /// Other holders whose expired claims were dropped to make room.
    pub expired: Vec<String>,
}

/// Decide `request` against the claims currently recorded for its resource.
pub(crate) fn grant_lease(held: &[Lease], request: Lease, now: DateTime<Utc>) -> Result<LeaseGrant> {
    let others = held.iter().filter(|l| l.holder != request.holder);
    let mut expired = Vec::new();
    for lease in others {
        if !lease.is_live(now) {
            expired.push(lease.holder.clone());
        } else if request.mode == LeaseMode::Exclusive || lease.mode == LeaseMode::Exclusive {
            return Err(StorageError::LeaseHeld(format!(
                "{} (held by {} until {})",
                request.resource, lease.holder, lease.expires_at
            )));
        }
    }
    Ok(LeaseGrant {
        lease: request,
        expired,
    })
}

/// Selects audit entries. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub table: Option<String>,
    pub key: Option<RecordKey>,
    pub job_id: Option<JobId>,
    /// Inclusive.
    pub from_id: Option<AuditId>,
    /// Inclusive.
    pub to_id: Option<AuditId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn for_key(table: &str, key: &RecordKey) -> Self {
        Self {
            table: Some(table.to_string()),
            key: Some(key.clone()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.table.as_ref().map_or(true, |t| &entry.table == t)
            && self.key.as_ref().map_or(true, |k| &entry.key == k)
            && self.job_id.map_or(true, |j| entry.job_id == Some(j))
            && self.from_id.map_or(true, |id| entry.id >= id)
            && self.to_id.map_or(true, |id| entry.id <= id)
            && self.since.map_or(true, |t| entry.applied_at >= t)
            && self.until.map_or(true, |t| entry.applied_at <= t)
    }
}

/// A single target mutation, applied in write-set order.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Upsert {
        table: String,
        key: RecordKey,
        row: Row,
    },
    Delete {
        table: String,
        key: RecordKey,
    },
}

impl RowWrite {
    pub fn table(&self) -> &str {
        match self {
            RowWrite::Upsert { table, .. } | RowWrite::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &RecordKey {
        match self {
            RowWrite::Upsert { key, .. } | RowWrite::Delete { key, .. } => key,
        }
    }
}

/// Everything one unit of work changes. Committed atomically by
/// [`SyncStore::commit`]; dropping it unapplied is the rollback.
///
/// Audit entries with `compensates` set mark the compensated entry reversed;
/// reversing an entry twice is an invariant violation. Watermarks and key
/// states are scoped to `pipeline`.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    pub pipeline: String,
    pub rows: Vec<RowWrite>,
    pub audit: Vec<NewAuditEntry>,
    pub watermarks: Vec<Watermark>,
    /// `None` removes the key's state.
    pub key_states: Vec<(String, RecordKey, Option<KeyState>)>,
    pub dead_letters: Vec<DeadLetter>,
    /// `(job, table, key)` dead letters to drop.
    pub resolved_dead_letters: Vec<(JobId, String, RecordKey)>,
    pub parked: Vec<ParkedConflict>,
    pub cleared_conflicts: Vec<(String, RecordKey)>,
    pub compacted: Vec<CompactedSnapshot>,
    pub pruned_audit: Vec<AuditId>,
    pub job: Option<JobState>,
}

impl WriteSet {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            ..Self::default()
        }
    }

    /// Queue upserts of `rows` into `table`, in order.
    pub fn upsert_batch(&mut self, table: &str, rows: impl IntoIterator<Item = (RecordKey, Row)>) {
        self.rows.extend(rows.into_iter().map(|(key, row)| RowWrite::Upsert {
            table: table.to_string(),
            key,
            row,
        }));
    }

    /// Queue deletes of `keys` from `table`, in order.
    pub fn delete_batch(&mut self, table: &str, keys: impl IntoIterator<Item = RecordKey>) {
        self.rows.extend(keys.into_iter().map(|key| RowWrite::Delete {
            table: table.to_string(),
            key,
        }));
    }

    /// Only job state, no data.
    pub fn job_only(job: JobState) -> Self {
        Self {
            job: Some(job),
            ..Self::default()
        }
    }
}

/// The transactional store the engine writes through.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Current target rows for `keys`; absent keys are omitted.
    async fn read_current(&self, table: &str, keys: &[RecordKey]) -> Result<BTreeMap<RecordKey, Row>>;

    /// Every target row of `table` in key order.
    async fn scan_rows(&self, table: &str) -> Result<Vec<(RecordKey, Row)>>;

    async fn row_keys(&self, table: &str) -> Result<BTreeSet<RecordKey>> {
        Ok(self.scan_rows(table).await?.into_iter().map(|(k, _)| k).collect())
    }

    /// Matching audit entries in ascending id order.
    async fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    async fn audit_entry(&self, id: AuditId) -> Result<Option<AuditEntry>>;

    /// Post-images of the newest `limit` non-delete entries for `table`,
    /// oldest first.
    async fn recent_post_images(&self, table: &str, limit: usize) -> Result<Vec<Row>>;

    async fn compacted(&self, table: Option<&str>) -> Result<Vec<CompactedSnapshot>>;

    /// State of `key` at its compaction boundary.
    async fn compacted_state(&self, table: &str, key: &RecordKey) -> Result<Option<CompactedSnapshot>> {
        Ok(self
            .compacted(Some(table))
            .await?
            .into_iter()
            .find(|s| &s.key == key))
    }

    async fn watermark(&self, pipeline: &str, table: &str) -> Result<Option<Watermark>>;

    async fn key_states(&self, pipeline: &str, table: &str) -> Result<BTreeMap<RecordKey, KeyState>>;

    async fn dead_letters(&self, job_id: Option<JobId>, table: Option<&str>) -> Result<Vec<DeadLetter>>;

    async fn parked_conflicts(&self, table: Option<&str>) -> Result<Vec<ParkedConflict>>;

    async fn job(&self, id: JobId) -> Result<Option<JobState>>;

    async fn jobs(&self) -> Result<Vec<JobState>>;

    /// Claim `resource` for `holder` until `ttl` from now. Re-acquiring by
    /// the same holder renews the claim. Expired claims of other holders are
    /// dropped and reported in the grant.
    async fn acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        mode: LeaseMode,
        ttl: Duration,
    ) -> Result<LeaseGrant>;

    async fn release_lease(&self, resource: &str, holder: &str) -> Result<()>;

    /// Live claims on `resource`.
    async fn leases(&self, resource: &str) -> Result<Vec<Lease>>;

    /// Apply `writes` atomically and return the appended audit entries with
    /// their assigned ids.
    async fn commit(&self, writes: WriteSet) -> Result<Vec<AuditEntry>>;
}

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
    constraints: Constraints,
) -> std::result::Result<Arc<dyn SyncStore>, crate::error::SyncError> {
    info!(storage = ?config.storage_type, path = %config.path, "Initializing store");
    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryStore::with_constraints(constraints))),
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            let store = SqliteStore::open(&config.path, constraints).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => Err(crate::error::SyncError::Config(
            "sqlite storage requested but the 'sqlite' feature is not enabled".into(),
        )),
    }
}

/// Checks shared by every backend before a write set is applied.
pub(crate) fn check_write_set(writes: &WriteSet) -> Result<()> {
    if let Some(bad) = writes.audit.iter().find(|e| !e.is_well_formed()) {
        return Err(StorageError::Invariant(format!(
            "malformed {} audit entry for {}/{}",
            bad.operation.as_str(),
            bad.table,
            bad.key
        )));
    }
    let mut compensated = BTreeSet::new();
    for id in writes.audit.iter().filter_map(|e| e.compensates) {
        if !compensated.insert(id) {
            return Err(StorageError::Invariant(format!(
                "audit entry {} compensated twice",
                id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, Operation};

    fn entry(id: AuditId, table: &str, key: i64) -> AuditEntry {
        NewAuditEntry {
            job_id: None,
            table: table.into(),
            key: RecordKey::int(key),
            operation: Operation::Insert,
            pre_image: None,
            post_image: Some(Row::new()),
            applied_at: Utc::now(),
            actor: Actor::User("clerk".into()),
            compensates: None,
            annotations: vec![],
        }
        .into_entry(id)
    }

    #[test]
    fn test_audit_filter_matches() {
        let e = entry(7, "parcels", 1);
        assert!(AuditFilter::default().matches(&e));
        assert!(AuditFilter::for_key("parcels", &RecordKey::int(1)).matches(&e));
        assert!(!AuditFilter::for_key("parcels", &RecordKey::int(2)).matches(&e));
        let range = AuditFilter {
            from_id: Some(8),
            ..AuditFilter::default()
        };
        assert!(!range.matches(&e));
    }

    #[test]
    fn test_double_compensation_rejected() {
        let mut writes = WriteSet::new("pacs->cama");
        for _ in 0..2 {
            writes.audit.push(NewAuditEntry {
                job_id: None,
                table: "parcels".into(),
                key: RecordKey::int(1),
                operation: Operation::Delete,
                pre_image: Some(Row::new()),
                post_image: None,
                applied_at: Utc::now(),
                actor: Actor::User("clerk".into()),
                compensates: Some(3),
                annotations: vec![],
            });
        }
        assert!(matches!(check_write_set(&writes), Err(StorageError::Invariant(_))));
    }

    fn lease(holder: &str, mode: LeaseMode, expires_in: i64) -> Lease {
        Lease {
            resource: "export:pacs->cama".into(),
            holder: holder.into(),
            mode,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }

    #[test]
    fn test_shared_leases_coexist() {
        let held = vec![lease("export-a", LeaseMode::Shared, 60)];
        let grant = grant_lease(&held, lease("export-b", LeaseMode::Shared, 60), Utc::now()).unwrap();
        assert!(grant.expired.is_empty());
        assert!(matches!(
            grant_lease(&held, lease("job", LeaseMode::Exclusive, 60), Utc::now()),
            Err(StorageError::LeaseHeld(_))
        ));
    }

    #[test]
    fn test_expired_holder_is_displaced() {
        let held = vec![
            lease("crashed", LeaseMode::Exclusive, -5),
            lease("job", LeaseMode::Exclusive, -5),
        ];
        let grant = grant_lease(&held, lease("job", LeaseMode::Exclusive, 60), Utc::now()).unwrap();
        assert_eq!(grant.expired, vec!["crashed".to_string()]);
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Transient("busy".into()).is_transient());
        assert!(!StorageError::Invariant("x".into()).is_transient());
    }
}
