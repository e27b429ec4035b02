//! SyncStore interface tests.
//!
//! These tests verify the contract of the SyncStore trait. Each store is
//! expected to be fresh and built with [`constraints`].

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use assessment_sync::config::EngineConfig;
use assessment_sync::dlq::DeadLetter;
use assessment_sync::model::{
    Actor, Cursor, JobId, JobMode, JobState, JobStatus, NewAuditEntry, Operation, Provenance,
    RecordKey, Row, TransformedRecord, Watermark,
};
use assessment_sync::resolve::ParkedConflict;
use assessment_sync::schema::SchemaRegistry;
use assessment_sync::storage::{
    AuditFilter, CompactedSnapshot, Constraints, KeyState, LeaseMode, RowWrite, StorageError,
    SyncStore, WriteSet,
};

pub const PIPELINE: &str = "pacs->cama";

const TABLES: &str = r#"
tables:
  - name: parcels
    primary_key: [id]
    source_columns:
      - { name: id, type: int }
      - { name: owner, type: string }
    columns:
      - { name: id, type: int, nullable: false }
      - { name: owner, type: string }
    deletes: { strategy: none }
  - name: improvements
    primary_key: [id]
    source_columns:
      - { name: id, type: int }
      - { name: parcel_id, type: int }
    columns:
      - { name: id, type: int, nullable: false }
      - { name: parcel_id, type: int }
    deletes: { strategy: none }
    foreign_keys:
      - { columns: [parcel_id], references: parcels }
"#;

/// Constraints every contract store must be built with.
pub fn constraints() -> Constraints {
    let config = EngineConfig::from_yaml_str(TABLES).expect("fixture config");
    let registry =
        SchemaRegistry::from_config(&config.tables, config.lookups.clone()).expect("registry");
    Constraints::from_registry(&registry)
}

pub fn row(v: Value) -> Row {
    serde_json::from_value(v).expect("row")
}

fn upsert(table: &str, id: i64, v: Value) -> RowWrite {
    RowWrite::Upsert {
        table: table.into(),
        key: RecordKey::int(id),
        row: row(v),
    }
}

fn entry(table: &str, id: i64, post: Value) -> NewAuditEntry {
    NewAuditEntry {
        job_id: None,
        table: table.into(),
        key: RecordKey::int(id),
        operation: Operation::Insert,
        pre_image: None,
        post_image: Some(row(post)),
        applied_at: Utc::now(),
        actor: Actor::User("clerk".into()),
        compensates: None,
        annotations: vec!["seed".into()],
    }
}

fn watermark(table: &str, ts: i64, key: i64, change_id: u64) -> Watermark {
    Watermark {
        table: table.into(),
        cursor: Cursor::new(ts, RecordKey::int(key)),
        tombstone_cursor: None,
        change_id,
        committed_at: Utc::now(),
    }
}

fn record(table: &str, id: i64) -> TransformedRecord {
    TransformedRecord {
        table: table.into(),
        key: RecordKey::int(id),
        payload: row(json!({ "id": id, "parcel_id": 999 })),
        operation: Operation::Insert,
        provenance: Provenance::default(),
        annotations: Vec::new(),
        source_timestamp: Some(10),
        source_hash: Some("h".into()),
    }
}

// =============================================================================
// Commit atomicity
// =============================================================================

pub async fn test_commit_rows_audit_and_watermark<S: SyncStore>(store: &S) {
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 1, json!({ "id": 1, "owner": "Ada" })));
    writes.rows.push(upsert("parcels", 2, json!({ "id": 2, "owner": "Bea" })));
    writes.audit.push(entry("parcels", 1, json!({ "id": 1, "owner": "Ada" })));
    writes.audit.push(entry("parcels", 2, json!({ "id": 2, "owner": "Bea" })));
    writes.watermarks.push(watermark("parcels", 100, 2, 2));

    let appended = store.commit(writes).await.expect("commit should succeed");
    assert_eq!(appended.len(), 2);
    assert!(appended[0].id < appended[1].id, "audit ids should increase");
    assert_eq!(appended[0].annotations, vec!["seed".to_string()]);

    let rows = store.scan_rows("parcels").await.expect("scan");
    assert_eq!(rows.len(), 2);
    let current = store
        .read_current("parcels", &[RecordKey::int(2), RecordKey::int(7)])
        .await
        .expect("read_current");
    assert_eq!(current.len(), 1);
    assert_eq!(current[&RecordKey::int(2)]["owner"], json!("Bea"));

    let mark = store
        .watermark(PIPELINE, "parcels")
        .await
        .expect("watermark")
        .expect("watermark should exist");
    assert_eq!(mark.change_id, 2);
    assert_eq!(mark.cursor, Cursor::new(100, RecordKey::int(2)));
}

pub async fn test_rejected_commit_rolls_back<S: SyncStore>(store: &S) {
    let before = store.audit_entries(&AuditFilter::default()).await.expect("audit").len();

    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("improvements", 10, json!({ "id": 10, "parcel_id": 1 })));
    writes.rows.push(upsert("improvements", 11, json!({ "id": 11, "parcel_id": 404 })));
    writes.audit.push(entry("improvements", 10, json!({ "id": 10, "parcel_id": 1 })));
    writes.watermarks.push(watermark("improvements", 50, 11, 2));

    match store.commit(writes).await {
        Err(StorageError::RowRejected { table, key, .. }) => {
            assert_eq!(table, "improvements");
            assert_eq!(key, RecordKey::int(11));
        }
        other => panic!("expected RowRejected, got {:?}", other),
    }
    assert!(store.scan_rows("improvements").await.expect("scan").is_empty());
    assert_eq!(
        store.audit_entries(&AuditFilter::default()).await.expect("audit").len(),
        before
    );
    assert!(store
        .watermark(PIPELINE, "improvements")
        .await
        .expect("watermark")
        .is_none());
}

pub async fn test_delete_of_referenced_parent_rejected<S: SyncStore>(store: &S) {
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("improvements", 20, json!({ "id": 20, "parcel_id": 1 })));
    store.commit(writes).await.expect("child insert");

    let mut writes = WriteSet::new(PIPELINE);
    writes.delete_batch("parcels", [RecordKey::int(1)]);
    assert!(matches!(
        store.commit(writes).await,
        Err(StorageError::RowRejected { .. })
    ));
    assert_eq!(
        store
            .read_current("parcels", &[RecordKey::int(1)])
            .await
            .expect("read")
            .len(),
        1
    );

    let mut writes = WriteSet::new(PIPELINE);
    writes.delete_batch("improvements", [RecordKey::int(20)]);
    writes.delete_batch("parcels", [RecordKey::int(1)]);
    store.commit(writes).await.expect("child first, then parent");
}

pub async fn test_watermark_regression_rejected<S: SyncStore>(store: &S) {
    let mut writes = WriteSet::new(PIPELINE);
    writes.watermarks.push(watermark("parcels", 90, 1, 1));
    assert!(matches!(
        store.commit(writes).await,
        Err(StorageError::Invariant(_))
    ));

    let mut writes = WriteSet::new("pacs->archive");
    writes.watermarks.push(watermark("parcels", 5, 1, 1));
    store.commit(writes).await.expect("other pipelines are independent");
}

pub async fn test_compensation_marks_reversed<S: SyncStore>(store: &S) {
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 3, json!({ "id": 3, "owner": "Cy" })));
    writes.audit.push(entry("parcels", 3, json!({ "id": 3, "owner": "Cy" })));
    let original = store.commit(writes).await.expect("insert")[0].id;

    let compensation = NewAuditEntry {
        operation: Operation::Delete,
        pre_image: Some(row(json!({ "id": 3, "owner": "Cy" }))),
        post_image: None,
        compensates: Some(original),
        ..entry("parcels", 3, json!({}))
    };
    let mut writes = WriteSet::new(PIPELINE);
    writes.delete_batch("parcels", [RecordKey::int(3)]);
    writes.audit.push(compensation.clone());
    let reversal = store.commit(writes).await.expect("compensate")[0].id;

    let stored = store
        .audit_entry(original)
        .await
        .expect("audit_entry")
        .expect("original exists");
    assert_eq!(stored.reversed_by, Some(reversal));
    let filtered = store
        .audit_entries(&AuditFilter::for_key("parcels", &RecordKey::int(3)))
        .await
        .expect("audit");
    assert_eq!(filtered.len(), 2);

    let mut writes = WriteSet::new(PIPELINE);
    writes.audit.push(compensation);
    assert!(matches!(
        store.commit(writes).await,
        Err(StorageError::Invariant(_))
    ));
}

// =============================================================================
// Engine state
// =============================================================================

pub async fn test_key_states_roundtrip<S: SyncStore>(store: &S) {
    let state = KeyState {
        source_hash: "abc".into(),
        target_hash: Some("def".into()),
        source_timestamp: Some(100),
    };
    let mut writes = WriteSet::new(PIPELINE);
    writes.key_states.push(("parcels".into(), RecordKey::int(1), Some(state.clone())));
    writes.key_states.push(("parcels".into(), RecordKey::int(2), Some(state.clone())));
    store.commit(writes).await.expect("set");

    let mut writes = WriteSet::new(PIPELINE);
    writes.key_states.push(("parcels".into(), RecordKey::int(2), None));
    store.commit(writes).await.expect("remove");

    let states = store.key_states(PIPELINE, "parcels").await.expect("key_states");
    assert_eq!(states.len(), 1);
    assert_eq!(states.get(&RecordKey::int(1)), Some(&state));
    assert!(store
        .key_states("pacs->archive", "parcels")
        .await
        .expect("key_states")
        .is_empty());
}

pub async fn test_dead_letters_and_parked<S: SyncStore>(store: &S) {
    let job_id = JobId::new();
    let letter = DeadLetter::from_constraint_violation(job_id, &record("improvements", 30), None, "no parent", 4);
    let conflict = ParkedConflict {
        table: "parcels".into(),
        key: RecordKey::int(31),
        job_id,
        record: record("parcels", 31),
        target_row: Some(row(json!({ "id": 31, "owner": "Clerk" }))),
        rationale: "manual resolution required".into(),
        parked_at: Utc::now(),
    };
    let mut writes = WriteSet::new(PIPELINE);
    writes.dead_letters.push(letter);
    writes.parked.push(conflict);
    store.commit(writes).await.expect("park");

    let letters = store.dead_letters(Some(job_id), None).await.expect("letters");
    assert_eq!(letters.len(), 1);
    assert!(letters[0].retryable);
    assert_eq!(letters[0].key, RecordKey::int(30));
    assert!(store
        .dead_letters(Some(JobId::new()), None)
        .await
        .expect("letters")
        .is_empty());
    let parked = store.parked_conflicts(Some("parcels")).await.expect("parked");
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].target_row.as_ref().expect("target")["owner"], json!("Clerk"));

    let mut writes = WriteSet::new(PIPELINE);
    writes
        .resolved_dead_letters
        .push((job_id, "improvements".into(), RecordKey::int(30)));
    writes.cleared_conflicts.push(("parcels".into(), RecordKey::int(31)));
    store.commit(writes).await.expect("clear");
    assert!(store.dead_letters(Some(job_id), None).await.expect("letters").is_empty());
    assert!(store.parked_conflicts(None).await.expect("parked").is_empty());
}

pub async fn test_job_state_roundtrip<S: SyncStore>(store: &S) {
    let mut state = JobState::new(JobId::new(), JobMode::Full, vec!["parcels".into()]);
    store.commit(WriteSet::job_only(state.clone())).await.expect("submit");

    state.transition(JobStatus::Running).expect("transition");
    state.counters.applied = 7;
    let mut writes = WriteSet::new(PIPELINE);
    writes.job = Some(state.clone());
    store.commit(writes).await.expect("update");

    let stored = store.job(state.id).await.expect("job").expect("job exists");
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.counters.applied, 7);
    assert_eq!(stored.tables, vec!["parcels".to_string()]);
    assert!(store.jobs().await.expect("jobs").iter().any(|j| j.id == state.id));
    assert!(store.job(JobId::new()).await.expect("job").is_none());
}

fn ttl() -> Duration {
    Duration::seconds(60)
}

pub async fn test_lease_exclusive<S: SyncStore>(store: &S) {
    let sync = "sync:pacs->cama";
    let grant = store
        .acquire_lease(sync, "job-a", LeaseMode::Exclusive, ttl())
        .await
        .expect("acquire");
    assert!(grant.expired.is_empty());
    store
        .acquire_lease(sync, "job-a", LeaseMode::Exclusive, ttl())
        .await
        .expect("renew");
    assert!(matches!(
        store.acquire_lease(sync, "job-b", LeaseMode::Exclusive, ttl()).await,
        Err(StorageError::LeaseHeld(_))
    ));
    store.release_lease(sync, "job-b").await.expect("foreign release is a no-op");
    assert!(store
        .acquire_lease(sync, "job-b", LeaseMode::Exclusive, ttl())
        .await
        .is_err());
    store.release_lease(sync, "job-a").await.expect("release");
    store
        .acquire_lease(sync, "job-b", LeaseMode::Exclusive, ttl())
        .await
        .expect("acquire after release");
    store.release_lease(sync, "job-b").await.expect("release");
    assert!(store.leases(sync).await.expect("leases").is_empty());
}

pub async fn test_expired_lease_taken_over<S: SyncStore>(store: &S) {
    let sync = "sync:county-a->cama";
    store
        .acquire_lease(sync, "crashed-job", LeaseMode::Exclusive, Duration::milliseconds(-1))
        .await
        .expect("acquire");

    let grant = store
        .acquire_lease(sync, "next-job", LeaseMode::Exclusive, ttl())
        .await
        .expect("takeover");

    assert_eq!(grant.expired, vec!["crashed-job".to_string()]);
    let live = store.leases(sync).await.expect("leases");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].holder, "next-job");
    assert!(live[0].expires_at > Utc::now());
    store.release_lease(sync, "next-job").await.expect("release");
}

pub async fn test_shared_lease_holders<S: SyncStore>(store: &S) {
    let export = "export:pacs->cama";
    store
        .acquire_lease(export, "export-1", LeaseMode::Shared, ttl())
        .await
        .expect("first shared");
    store
        .acquire_lease(export, "export-2", LeaseMode::Shared, ttl())
        .await
        .expect("second shared");
    assert_eq!(store.leases(export).await.expect("leases").len(), 2);
    assert!(matches!(
        store.acquire_lease(export, "compactor", LeaseMode::Exclusive, ttl()).await,
        Err(StorageError::LeaseHeld(_))
    ));

    store.release_lease(export, "export-1").await.expect("release");
    store.release_lease(export, "export-2").await.expect("release");
    store
        .acquire_lease(export, "compactor", LeaseMode::Exclusive, ttl())
        .await
        .expect("exclusive once shared holders left");
    assert!(matches!(
        store.acquire_lease(export, "export-3", LeaseMode::Shared, ttl()).await,
        Err(StorageError::LeaseHeld(_))
    ));
    store.release_lease(export, "compactor").await.expect("release");
}

// =============================================================================
// Audit reads and retention
// =============================================================================

pub async fn test_audit_time_filter<S: SyncStore>(store: &S) {
    let old = Utc::now() - Duration::days(40);
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 40, json!({ "id": 40 })));
    writes.audit.push(NewAuditEntry {
        applied_at: old,
        ..entry("parcels", 40, json!({ "id": 40 }))
    });
    store.commit(writes).await.expect("old entry");

    let filter = AuditFilter {
        table: Some("parcels".into()),
        until: Some(Utc::now() - Duration::days(30)),
        ..AuditFilter::default()
    };
    let entries = store.audit_entries(&filter).await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, RecordKey::int(40));
}

pub async fn test_recent_post_images<S: SyncStore>(store: &S) {
    let mut writes = WriteSet::new(PIPELINE);
    for id in 50..55 {
        writes.rows.push(upsert("parcels", id, json!({ "id": id })));
        writes.audit.push(entry("parcels", id, json!({ "id": id })));
    }
    store.commit(writes).await.expect("insert");

    let images = store.recent_post_images("parcels", 2).await.expect("images");
    assert_eq!(images, vec![row(json!({ "id": 53 })), row(json!({ "id": 54 }))]);
}

pub async fn test_compaction_prunes_and_snapshots<S: SyncStore>(store: &S) {
    let filter = AuditFilter::for_key("parcels", &RecordKey::int(40));
    let pruned = store.audit_entries(&filter).await.expect("audit")[0].id;

    let mut writes = WriteSet::new(PIPELINE);
    writes.compacted.push(CompactedSnapshot {
        table: "parcels".into(),
        key: RecordKey::int(40),
        state: Some(row(json!({ "id": 40 }))),
        boundary_id: pruned,
        compacted_at: Utc::now(),
    });
    writes.pruned_audit.push(pruned);
    store.commit(writes).await.expect("compact");

    assert!(store.audit_entry(pruned).await.expect("audit_entry").is_none());
    let snapshot = store
        .compacted_state("parcels", &RecordKey::int(40))
        .await
        .expect("compacted_state")
        .expect("snapshot exists");
    assert_eq!(snapshot.boundary_id, pruned);
    assert_eq!(snapshot.state, Some(row(json!({ "id": 40 }))));
}

/// Run the full contract, in order, against a fresh store.
#[macro_export]
macro_rules! run_sync_store_tests {
    ($store:expr) => {
        use $crate::storage::sync_store_tests::*;

        // commit tests
        test_commit_rows_audit_and_watermark($store).await;
        println!("  test_commit_rows_audit_and_watermark: PASSED");

        test_rejected_commit_rolls_back($store).await;
        println!("  test_rejected_commit_rolls_back: PASSED");

        test_delete_of_referenced_parent_rejected($store).await;
        println!("  test_delete_of_referenced_parent_rejected: PASSED");

        test_watermark_regression_rejected($store).await;
        println!("  test_watermark_regression_rejected: PASSED");

        test_compensation_marks_reversed($store).await;
        println!("  test_compensation_marks_reversed: PASSED");

        // state tests
        test_key_states_roundtrip($store).await;
        println!("  test_key_states_roundtrip: PASSED");

        test_dead_letters_and_parked($store).await;
        println!("  test_dead_letters_and_parked: PASSED");

        test_job_state_roundtrip($store).await;
        println!("  test_job_state_roundtrip: PASSED");

        test_lease_exclusive($store).await;
        println!("  test_lease_exclusive: PASSED");

        test_expired_lease_taken_over($store).await;
        println!("  test_expired_lease_taken_over: PASSED");

        test_shared_lease_holders($store).await;
        println!("  test_shared_lease_holders: PASSED");

        // audit tests
        test_audit_time_filter($store).await;
        println!("  test_audit_time_filter: PASSED");

        test_recent_post_images($store).await;
        println!("  test_recent_post_images: PASSED");

        test_compaction_prunes_and_snapshots($store).await;
        println!("  test_compaction_prunes_and_snapshots: PASSED");
    };
}
