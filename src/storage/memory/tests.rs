use super::*;
use crate::config::EngineConfig;
use crate::model::{Actor, Cursor, NewAuditEntry};
use crate::schema::SchemaRegistry;
use chrono::Utc;
use serde_json::{json, Value};

const TABLES: &str = r#"
tables:
  - name: parcels
    primary_key: [id]
    source_columns:
      - { name: id, type: int }
    columns:
      - { name: id, type: int, nullable: false }
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

const PIPELINE: &str = "pacs->cama";

fn store() -> MemoryStore {
    let config = EngineConfig::from_yaml_str(TABLES).unwrap();
    let registry = SchemaRegistry::from_config(&config.tables, config.lookups.clone()).unwrap();
    MemoryStore::with_constraints(Constraints::from_registry(&registry))
}

fn row(v: Value) -> Row {
    serde_json::from_value(v).unwrap()
}

fn upsert(table: &str, id: i64, v: Value) -> RowWrite {
    RowWrite::Upsert {
        table: table.into(),
        key: RecordKey::int(id),
        row: row(v),
    }
}

fn insert_entry(table: &str, id: i64, post: Value) -> NewAuditEntry {
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
        annotations: vec![],
    }
}

fn watermark(ts: i64, key: i64, change_id: u64) -> Watermark {
    Watermark {
        table: "parcels".into(),
        cursor: Cursor::new(ts, RecordKey::int(key)),
        tombstone_cursor: None,
        change_id,
        committed_at: Utc::now(),
    }
}

// ============================================================================
// Commit atomicity
// ============================================================================

#[tokio::test]
async fn test_commit_assigns_increasing_audit_ids() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 1, json!({"id": 1})));
    writes.rows.push(upsert("parcels", 2, json!({"id": 2})));
    writes.audit.push(insert_entry("parcels", 1, json!({"id": 1})));
    writes.audit.push(insert_entry("parcels", 2, json!({"id": 2})));
    writes.watermarks.push(watermark(100, 2, 2));

    let appended = store.commit(writes).await.unwrap();
    assert_eq!(appended.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(store.scan_rows("parcels").await.unwrap().len(), 2);
    assert_eq!(
        store.watermark(PIPELINE, "parcels").await.unwrap().unwrap().change_id,
        2
    );
}

#[tokio::test]
async fn test_failed_commit_leaves_no_trace() {
    let store = store();
    store.set_fail_after_writes(Some(1)).await;

    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 1, json!({"id": 1})));
    writes.rows.push(upsert("parcels", 2, json!({"id": 2})));
    writes.audit.push(insert_entry("parcels", 1, json!({"id": 1})));
    writes.watermarks.push(watermark(100, 2, 2));

    let err = store.commit(writes).await.unwrap_err();
    assert!(matches!(err, StorageError::Aborted(_)));
    assert!(!err.is_transient());
    assert!(store.scan_rows("parcels").await.unwrap().is_empty());
    assert_eq!(store.audit_len().await, 0);
    assert!(store.watermark(PIPELINE, "parcels").await.unwrap().is_none());
}

#[tokio::test]
async fn test_transient_failures_count_down() {
    let store = store();
    store.set_transient_failures(2).await;
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 1, json!({"id": 1})));
    assert!(store.commit(WriteSet::new(PIPELINE)).await.is_ok());
    for _ in 0..2 {
        assert!(store.commit(writes.clone()).await.unwrap_err().is_transient());
    }
    assert!(store.commit(writes).await.is_ok());
    assert_eq!(store.scan_rows("parcels").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stalled_commits_never_land() {
    let store = store();
    store.set_stall_commits(true).await;
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 1, json!({"id": 1})));

    let stalled = tokio::time::timeout(std::time::Duration::from_millis(50), store.commit(writes.clone())).await;
    assert!(stalled.is_err());
    assert!(store.commit(WriteSet::new(PIPELINE)).await.is_ok());
    assert!(store.scan_rows("parcels").await.unwrap().is_empty());

    store.set_stall_commits(false).await;
    store.commit(writes).await.unwrap();
    assert_eq!(store.scan_rows("parcels").await.unwrap().len(), 1);
}

// ============================================================================
// Constraints
// ============================================================================

#[tokio::test]
async fn test_orphan_child_rejected() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("improvements", 5, json!({"id": 5, "parcel_id": 9})));
    let err = store.commit(writes).await.unwrap_err();
    match err {
        StorageError::RowRejected { table, key, .. } => {
            assert_eq!(table, "improvements");
            assert_eq!(key, RecordKey::int(5));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_parent_in_same_commit_satisfies_child() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 9, json!({"id": 9})));
    writes.rows.push(upsert("improvements", 5, json!({"id": 5, "parcel_id": 9})));
    assert!(store.commit(writes).await.is_ok());
}

#[tokio::test]
async fn test_delete_of_referenced_parent_rejected() {
    let store = store();
    store.seed_rows("parcels", vec![(RecordKey::int(9), row(json!({"id": 9})))]).await;
    store
        .seed_rows(
            "improvements",
            vec![(RecordKey::int(5), row(json!({"id": 5, "parcel_id": 9})))],
        )
        .await;

    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(RowWrite::Delete {
        table: "parcels".into(),
        key: RecordKey::int(9),
    });
    assert!(matches!(
        store.commit(writes).await,
        Err(StorageError::RowRejected { .. })
    ));

    // Children first, then the parent.
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(RowWrite::Delete {
        table: "improvements".into(),
        key: RecordKey::int(5),
    });
    writes.rows.push(RowWrite::Delete {
        table: "parcels".into(),
        key: RecordKey::int(9),
    });
    assert!(store.commit(writes).await.is_ok());
    assert!(store.scan_rows("parcels").await.unwrap().is_empty());
}

// ============================================================================
// Invariants
// ============================================================================

#[tokio::test]
async fn test_watermark_regression_rejected() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    writes.watermarks.push(watermark(101, 2, 2));
    store.commit(writes).await.unwrap();

    let mut writes = WriteSet::new(PIPELINE);
    writes.watermarks.push(watermark(100, 1, 3));
    assert!(matches!(
        store.commit(writes).await,
        Err(StorageError::Invariant(_))
    ));
}

#[tokio::test]
async fn test_watermarks_are_per_pipeline() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    writes.watermarks.push(watermark(101, 2, 2));
    store.commit(writes).await.unwrap();

    let mut writes = WriteSet::new("pacs->archive");
    writes.watermarks.push(watermark(5, 1, 1));
    assert!(store.commit(writes).await.is_ok());
}

#[tokio::test]
async fn test_compensation_marks_reversed_once() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 1, json!({"id": 1})));
    writes.audit.push(insert_entry("parcels", 1, json!({"id": 1})));
    store.commit(writes).await.unwrap();

    let compensation = NewAuditEntry {
        operation: Operation::Delete,
        pre_image: Some(row(json!({"id": 1}))),
        post_image: None,
        compensates: Some(1),
        ..insert_entry("parcels", 1, json!({}))
    };
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(RowWrite::Delete {
        table: "parcels".into(),
        key: RecordKey::int(1),
    });
    writes.audit.push(compensation.clone());
    let appended = store.commit(writes).await.unwrap();
    assert_eq!(appended[0].id, 2);
    assert_eq!(store.audit_entry(1).await.unwrap().unwrap().reversed_by, Some(2));

    let mut writes = WriteSet::new(PIPELINE);
    writes.audit.push(compensation);
    assert!(matches!(
        store.commit(writes).await,
        Err(StorageError::Invariant(_))
    ));
}

// ============================================================================
// State reads
// ============================================================================

#[tokio::test]
async fn test_key_states_set_and_remove() {
    let store = store();
    let state = KeyState {
        source_hash: "abc".into(),
        target_hash: Some("def".into()),
        source_timestamp: Some(100),
    };
    let mut writes = WriteSet::new(PIPELINE);
    writes.key_states.push(("parcels".into(), RecordKey::int(1), Some(state.clone())));
    store.commit(writes).await.unwrap();
    assert_eq!(
        store.key_states(PIPELINE, "parcels").await.unwrap().get(&RecordKey::int(1)),
        Some(&state)
    );

    let mut writes = WriteSet::new(PIPELINE);
    writes.key_states.push(("parcels".into(), RecordKey::int(1), None));
    store.commit(writes).await.unwrap();
    assert!(store.key_states(PIPELINE, "parcels").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recent_post_images_oldest_first() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    for id in 1..=5 {
        writes.rows.push(upsert("parcels", id, json!({"id": id})));
        writes.audit.push(insert_entry("parcels", id, json!({"id": id})));
    }
    store.commit(writes).await.unwrap();

    let images = store.recent_post_images("parcels", 2).await.unwrap();
    assert_eq!(images, vec![row(json!({"id": 4})), row(json!({"id": 5}))]);
}

#[tokio::test]
async fn test_prune_and_compact() {
    let store = store();
    let mut writes = WriteSet::new(PIPELINE);
    writes.rows.push(upsert("parcels", 1, json!({"id": 1})));
    writes.audit.push(insert_entry("parcels", 1, json!({"id": 1})));
    store.commit(writes).await.unwrap();

    let mut writes = WriteSet::new(PIPELINE);
    writes.compacted.push(CompactedSnapshot {
        table: "parcels".into(),
        key: RecordKey::int(1),
        state: Some(row(json!({"id": 1}))),
        boundary_id: 1,
        compacted_at: Utc::now(),
    });
    writes.pruned_audit.push(1);
    store.commit(writes).await.unwrap();

    assert_eq!(store.audit_len().await, 0);
    assert_eq!(store.compacted(Some("parcels")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lease_exclusive_per_resource() {
    let store = store();
    let ttl = chrono::Duration::seconds(60);
    store.acquire_lease("sync:pacs->cama", "job-a", LeaseMode::Exclusive, ttl).await.unwrap();
    store.acquire_lease("sync:pacs->cama", "job-a", LeaseMode::Exclusive, ttl).await.unwrap();
    assert!(matches!(
        store.acquire_lease("sync:pacs->cama", "job-b", LeaseMode::Exclusive, ttl).await,
        Err(StorageError::LeaseHeld(_))
    ));
    store.release_lease("sync:pacs->cama", "job-a").await.unwrap();
    store.acquire_lease("sync:pacs->cama", "job-b", LeaseMode::Exclusive, ttl).await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_taken_over() {
    let store = store();
    store
        .acquire_lease("sync:pacs->cama", "crashed", LeaseMode::Exclusive, chrono::Duration::milliseconds(-1))
        .await
        .unwrap();
    assert!(store.leases("sync:pacs->cama").await.unwrap().is_empty());

    let grant = store
        .acquire_lease("sync:pacs->cama", "job-b", LeaseMode::Exclusive, chrono::Duration::seconds(60))
        .await
        .unwrap();

    assert_eq!(grant.expired, vec!["crashed".to_string()]);
    let live = store.leases("sync:pacs->cama").await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].holder, "job-b");
}

#[tokio::test]
async fn test_fail_on_commit_until_cleared() {
    let store = store();
    store.set_fail_on_commit(true).await;
    for _ in 0..2 {
        let mut writes = WriteSet::new(PIPELINE);
        writes.upsert_batch("parcels", vec![(RecordKey::int(1), row(json!({"id": 1})))]);
        assert!(matches!(store.commit(writes).await, Err(StorageError::Aborted(_))));
    }
    store.set_fail_on_commit(false).await;
    let mut writes = WriteSet::new(PIPELINE);
    writes.upsert_batch("parcels", vec![(RecordKey::int(1), row(json!({"id": 1})))]);
    store.commit(writes).await.unwrap();
    assert_eq!(
        store.read_current("parcels", &[RecordKey::int(1)]).await.unwrap().len(),
        1
    );
    assert!(store.compacted_state("parcels", &RecordKey::int(1)).await.unwrap().is_none());
}
