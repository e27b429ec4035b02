use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde_json::{json, Value};

use super::apply::{diverged, BatchPlan, Outcome, PlanContext, Staged, StateUpdate};
use super::*;
use crate::config::{ConflictStrategy, EngineConfig, TableJobConfig, ValidationMode};
use crate::connectors::MemorySource;
use crate::detect::KeyStates;
use crate::model::{
    Actor, JobMode, Provenance, Severity, TransformedRecord, ValidationIssue, ValidationVerdict,
    Watermark,
};
use crate::storage::{AuditFilter, Constraints, MemoryStore};

const TABLES: &str = r#"
tables:
  - name: parcels
    primary_key: [id]
    last_modified: mtime
    source_columns:
      - { name: id, type: int }
      - { name: owner, type: string }
      - { name: total_value, type: float }
      - { name: mtime, type: int }
    columns:
      - { name: id, type: int, nullable: false }
      - { name: owner, type: string }
      - { name: total_value, type: float }
    deletes: { strategy: none }
    rules:
      - id: non_negative_total
        expr: "total_value >= 0"
        severity: error
"#;

fn registry() -> SchemaRegistry {
    let config = EngineConfig::from_yaml_str(TABLES).unwrap();
    SchemaRegistry::from_config(&config.tables, config.lookups.clone()).unwrap()
}

fn row(v: Value) -> Row {
    serde_json::from_value(v).unwrap()
}

fn pk() -> Vec<String> {
    vec!["id".to_string()]
}

// ============================================================================
// Apply planning
// ============================================================================

fn record(id: i64, owner: &str, operation: Operation) -> TransformedRecord {
    TransformedRecord {
        table: "parcels".to_string(),
        key: RecordKey::int(id),
        payload: row(json!({ "id": id, "owner": owner })),
        operation,
        provenance: Provenance::default(),
        annotations: Vec::new(),
        source_timestamp: Some(100),
        source_hash: Some(format!("src-{}", id)),
    }
}

fn verdict(key: RecordKey, issues: Vec<ValidationIssue>) -> ValidationVerdict {
    ValidationVerdict {
        key,
        passed: issues.iter().all(|i| i.severity < Severity::Error),
        issues,
        anomaly_score: 0.0,
    }
}

fn staged(record: TransformedRecord) -> Staged {
    let verdict = verdict(record.key.clone(), Vec::new());
    Staged { record, verdict }
}

fn error_issue() -> ValidationIssue {
    ValidationIssue {
        code: "non_negative_total".to_string(),
        severity: Severity::Error,
        field: Some("total_value".to_string()),
        message: "total_value >= 0".to_string(),
    }
}

struct Planner {
    mode: JobMode,
    validation_mode: ValidationMode,
    settings: TableJobConfig,
    resolver: ConflictResolver,
    current: BTreeMap<RecordKey, Row>,
    states: KeyStates,
    parked: BTreeSet<RecordKey>,
    target_times: BTreeMap<RecordKey, DateTime<Utc>>,
}

impl Planner {
    fn new() -> Self {
        Self {
            mode: JobMode::Incremental,
            validation_mode: ValidationMode::Tolerant,
            settings: TableJobConfig::named("parcels"),
            resolver: ConflictResolver::new(),
            current: BTreeMap::new(),
            states: KeyStates::new(),
            parked: BTreeSet::new(),
            target_times: BTreeMap::new(),
        }
    }

    fn synced(mut self, id: i64, target: Row) -> Self {
        self.states.insert(
            RecordKey::int(id),
            KeyState {
                source_hash: format!("old-{}", id),
                target_hash: Some(content_hash(&target)),
                source_timestamp: Some(50),
            },
        );
        self.current.insert(RecordKey::int(id), target);
        self
    }

    fn plan(&self, staged: Vec<Staged>) -> Result<BatchPlan, SyncError> {
        let ctx = PlanContext {
            job_id: JobId::new(),
            mode: self.mode,
            validation_mode: self.validation_mode,
            settings: &self.settings,
            resolver: &self.resolver,
            current: &self.current,
            states: &self.states,
            parked: &self.parked,
            target_times: &self.target_times,
        };
        let count = staged.len() as u64;
        ctx.plan("parcels", staged, Watermark::initial("parcels"), count, 0)
    }
}

#[test]
fn test_diverged_cases() {
    let target = row(json!({ "id": 1, "owner": "Ada" }));
    let state = KeyState {
        source_hash: "s".into(),
        target_hash: Some(content_hash(&target)),
        source_timestamp: None,
    };
    let edited = row(json!({ "id": 1, "owner": "Clerk" }));

    assert!(!diverged(JobMode::Incremental, None, None));
    assert!(!diverged(JobMode::Incremental, Some(&target), Some(&state)));
    assert!(diverged(JobMode::Incremental, Some(&edited), Some(&state)));
    assert!(diverged(JobMode::Incremental, None, Some(&state)));
    assert!(diverged(JobMode::Incremental, Some(&target), None));
    assert!(!diverged(JobMode::Full, Some(&target), None));
}

#[test]
fn test_new_record_is_written_and_audited() {
    let plan = Planner::new()
        .plan(vec![staged(record(1, "Ada", Operation::Insert))])
        .unwrap();

    let planned = &plan.records[0];
    assert!(matches!(planned.outcome, Outcome::Applied));
    assert!(matches!(planned.write, Some(RowWrite::Upsert { .. })));
    assert!(planned.audit.is_some());
    match &planned.state {
        StateUpdate::Set(state) => {
            assert_eq!(state.source_hash, "src-1");
            assert_eq!(
                state.target_hash.as_deref(),
                Some(content_hash(&planned.record.payload).as_str())
            );
        }
        other => panic!("expected a key state, got {:?}", other),
    }
    assert_eq!(planned.fallback_state, StateUpdate::Keep);

    let writes = plan.write_set("pacs->cama");
    assert_eq!(writes.rows.len(), 1);
    assert_eq!(writes.audit.len(), 1);
    assert_eq!(writes.watermarks.len(), 1);
    assert_eq!(plan.counters().applied, 1);
}

#[test]
fn test_identical_target_row_is_unchanged() {
    let target = row(json!({ "id": 1, "owner": "Ada" }));
    let plan = Planner::new()
        .synced(1, target)
        .plan(vec![staged(record(1, "Ada", Operation::Update))])
        .unwrap();

    let planned = &plan.records[0];
    assert!(matches!(planned.outcome, Outcome::Unchanged));
    assert!(planned.write.is_none());
    assert!(planned.audit.is_none());
    assert!(matches!(planned.state, StateUpdate::Set(_)));
    assert_eq!(plan.counters().no_change, 1);
}

#[test]
fn test_delete_of_absent_row_removes_state() {
    let plan = Planner::new()
        .plan(vec![staged(record(4, "gone", Operation::Delete))])
        .unwrap();

    assert!(matches!(plan.records[0].outcome, Outcome::Unchanged));
    assert_eq!(plan.records[0].state, StateUpdate::Remove);
}

#[test]
fn test_strict_mode_fails_on_blocking_issue() {
    let mut planner = Planner::new();
    planner.validation_mode = ValidationMode::Strict;
    let bad = record(2, "Bea", Operation::Insert);
    let verdict = verdict(bad.key.clone(), vec![error_issue()]);

    let err = planner
        .plan(vec![Staged { record: bad, verdict }])
        .unwrap_err();
    match err {
        SyncError::ValidationFailure { table, message, .. } => {
            assert_eq!(table, "parcels");
            assert_eq!(message, "non_negative_total");
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn test_tolerant_mode_dead_letters_blocking_issue() {
    let bad = record(2, "Bea", Operation::Insert);
    let verdict = verdict(bad.key.clone(), vec![error_issue()]);
    let plan = Planner::new()
        .plan(vec![
            staged(record(1, "Ada", Operation::Insert)),
            Staged { record: bad, verdict },
        ])
        .unwrap();

    assert!(matches!(plan.records[1].outcome, Outcome::DeadLettered(_)));
    let writes = plan.write_set("pacs->cama");
    assert_eq!(writes.rows.len(), 1);
    assert_eq!(writes.dead_letters.len(), 1);
    assert!(!writes.dead_letters[0].retryable);

    let counters = plan.counters();
    assert_eq!(counters.applied, 1);
    assert_eq!(counters.dead_lettered, 1);
}

#[test]
fn test_parked_key_stays_parked() {
    let mut planner = Planner::new();
    planner.parked.insert(RecordKey::int(1));
    let plan = planner
        .plan(vec![staged(record(1, "Ada", Operation::Update))])
        .unwrap();

    match &plan.records[0].outcome {
        Outcome::Parked(conflict) => assert_eq!(conflict.rationale, "awaiting operator decision"),
        other => panic!("expected parked, got {:?}", other),
    }
    assert!(plan.records[0].write.is_none());
    assert_eq!(plan.write_set("pacs->cama").parked.len(), 1);
}

#[test]
fn test_target_wins_skips_diverged_row() {
    let synced = row(json!({ "id": 1, "owner": "Ada" }));
    let mut planner = Planner::new().synced(1, synced);
    let edited = row(json!({ "id": 1, "owner": "Clerk" }));
    planner.current.insert(RecordKey::int(1), edited.clone());
    planner.settings.conflict = ConflictStrategy::TargetWins;

    let plan = planner
        .plan(vec![staged(record(1, "Bea", Operation::Update))])
        .unwrap();

    let planned = &plan.records[0];
    assert!(matches!(planned.outcome, Outcome::Skipped(_)));
    assert!(planned.write.is_none());
    match &planned.state {
        StateUpdate::Set(state) => {
            assert_eq!(state.target_hash.as_deref(), Some(content_hash(&edited).as_str()))
        }
        other => panic!("expected a key state, got {:?}", other),
    }
    assert!(plan
        .events()
        .iter()
        .any(|e| matches!(e, SyncEvent::RecordSkipped { .. })));
}

#[test]
fn test_source_wins_notes_conflict_in_audit() {
    let mut planner = Planner::new().synced(1, row(json!({ "id": 1, "owner": "Ada" })));
    planner
        .current
        .insert(RecordKey::int(1), row(json!({ "id": 1, "owner": "Clerk" })));

    let plan = planner
        .plan(vec![staged(record(1, "Bea", Operation::Update))])
        .unwrap();

    let audit = plan.records[0].audit.as_ref().unwrap();
    assert!(audit
        .annotations
        .iter()
        .any(|a| a == "conflict: source_wins"));
}

#[test]
fn test_requeue_then_dead_letter() {
    let mut plan = Planner::new()
        .plan(vec![
            staged(record(1, "Ada", Operation::Insert)),
            staged(record(2, "Bea", Operation::Insert)),
        ])
        .unwrap();
    let key = RecordKey::int(1);

    plan.requeue(&key, "missing parent", 1).unwrap();
    assert_eq!(plan.requeued, 1);
    assert_eq!(plan.records[1].record.key, key);
    assert!(plan.records[1].write.is_some());

    plan.requeue(&key, "missing parent", 1).unwrap();
    let last = plan.records.last().unwrap();
    assert!(last.write.is_none());
    assert_eq!(last.state, last.fallback_state);
    match &last.outcome {
        Outcome::DeadLettered(letter) => {
            assert!(letter.retryable);
            assert_eq!(letter.key, key);
        }
        other => panic!("expected dead letter, got {:?}", other),
    }

    let counters = plan.counters();
    assert_eq!(counters.applied, 1);
    assert_eq!(counters.dead_lettered, 1);
    assert_eq!(counters.requeued, 1);

    assert!(plan.requeue(&key, "missing parent", 1).is_err());
}

#[test]
fn test_events_end_with_batch_committed() {
    let plan = Planner::new()
        .plan(vec![
            staged(record(1, "Ada", Operation::Insert)),
            staged(record(2, "Bea", Operation::Insert)),
        ])
        .unwrap();

    match plan.events().last() {
        Some(SyncEvent::BatchCommitted { applied, table, .. }) => {
            assert_eq!(*applied, 2);
            assert_eq!(table, "parcels");
        }
        other => panic!("expected batch committed, got {:?}", other),
    }
}

// ============================================================================
// Engine lifecycle
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

async fn setup(rows: Vec<Value>) -> (Engine, Arc<MemorySource>) {
    let registry = registry();
    let source = Arc::new(MemorySource::new());
    source
        .insert_table("parcels", rows.into_iter().map(row).collect())
        .await;
    let store = MemoryStore::with_constraints(Constraints::from_registry(&registry));
    let engine = Engine::builder()
        .with_registry(Arc::new(registry))
        .with_source(source.clone())
        .with_store(Arc::new(store))
        .build()
        .await
        .unwrap();
    (engine, source)
}

fn parcels() -> Vec<Value> {
    vec![
        json!({ "id": 1, "owner": "Ada", "total_value": 100.0, "mtime": 100 }),
        json!({ "id": 2, "owner": "Bea", "total_value": 200.0, "mtime": 110 }),
        json!({ "id": 3, "owner": "Cy", "total_value": 300.0, "mtime": 120 }),
    ]
}

fn job(conflict: ConflictStrategy) -> JobConfig {
    JobConfig {
        batch_size: 2,
        tables: vec![TableJobConfig {
            conflict,
            ..TableJobConfig::named("parcels")
        }],
        ..JobConfig::default()
    }
}

async fn run(engine: &Engine, config: JobConfig) -> JobState {
    let job_id = engine.submit(config).await.unwrap();
    tokio::time::timeout(WAIT, engine.wait(job_id))
        .await
        .unwrap()
        .unwrap()
}

async fn owner(engine: &Engine, id: i64) -> Option<Value> {
    let key = RecordKey::int(id);
    engine
        .store()
        .read_current("parcels", std::slice::from_ref(&key))
        .await
        .unwrap()
        .remove(&key)
        .and_then(|r| r.get("owner").cloned())
}

#[tokio::test]
async fn test_submit_runs_to_completion() {
    let (engine, _source) = setup(parcels()).await;
    let mut events = engine.subscribe();

    let state = run(&engine, job(ConflictStrategy::SourceWins)).await;

    assert_eq!(state.status, JobStatus::Completed);
    assert_eq!(state.counters.applied, 3);
    assert_eq!(state.counters.batches, 2);
    assert_eq!(owner(&engine, 2).await, Some(json!("Bea")));

    let audit = engine
        .store()
        .audit_entries(&AuditFilter::for_job(state.id))
        .await
        .unwrap();
    assert_eq!(audit.len(), 3);
    assert!(audit.iter().all(|e| e.actor == Actor::Job(state.id)));

    let first = events.recv().await.unwrap();
    assert!(matches!(first.as_ref(), SyncEvent::JobSubmitted { .. }));
}

#[tokio::test]
async fn test_second_run_applies_nothing() {
    let (engine, _source) = setup(parcels()).await;
    run(&engine, job(ConflictStrategy::SourceWins)).await;

    let state = run(&engine, job(ConflictStrategy::SourceWins)).await;

    assert_eq!(state.status, JobStatus::Completed);
    assert_eq!(state.counters.applied, 0);
    assert_eq!(engine.store().audit_entries(&AuditFilter::default()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_pipeline_lease_blocks_concurrent_job() {
    let (engine, source) = setup(parcels()).await;
    source.set_delay(Some(Duration::from_millis(100))).await;

    let first = engine.submit(job(ConflictStrategy::SourceWins)).await.unwrap();
    let second = engine.submit(job(ConflictStrategy::SourceWins)).await;
    assert!(matches!(second, Err(SyncError::LeaseHeld(_))));

    let state = tokio::time::timeout(WAIT, engine.wait(first)).await.unwrap().unwrap();
    assert_eq!(state.status, JobStatus::Completed);

    source.set_delay(None).await;
    let again = run(&engine, job(ConflictStrategy::SourceWins)).await;
    assert_eq!(again.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let (engine, source) = setup(parcels()).await;
    source.set_delay(Some(Duration::from_millis(20))).await;
    let config = JobConfig {
        batch_size: 1,
        ..job(ConflictStrategy::SourceWins)
    };

    let job_id = engine.submit(config).await.unwrap();
    engine.pause(job_id).await.unwrap();
    let paused = tokio::time::timeout(WAIT, engine.wait_settled(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(engine.status(job_id).await.unwrap().status, JobStatus::Paused);

    engine.resume(job_id).await.unwrap();
    let done = tokio::time::timeout(WAIT, engine.wait(job_id)).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.applied, 3);
}

#[tokio::test]
async fn test_cancel_releases_lease() {
    let (engine, source) = setup(parcels()).await;
    source.set_delay(Some(Duration::from_millis(20))).await;

    let job_id = engine.submit(job(ConflictStrategy::SourceWins)).await.unwrap();
    engine.cancel(job_id).await.unwrap();
    let state = tokio::time::timeout(WAIT, engine.wait(job_id)).await.unwrap().unwrap();
    assert_eq!(state.status, JobStatus::Cancelled);

    assert!(matches!(
        engine.pause(job_id).await,
        Err(SyncError::InvalidTransition { .. })
    ));
    assert!(engine.resume(job_id).await.is_err());

    source.set_delay(None).await;
    let next = run(&engine, job(ConflictStrategy::SourceWins)).await;
    assert_eq!(next.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_expired_lease_fails_abandoned_job() {
    let (engine, _source) = setup(parcels()).await;
    let config = job(ConflictStrategy::SourceWins);
    let lease = sync_lease(&config.pipeline());
    let store = engine.store();

    // Its runner is gone: the job still reads running and its lease lapsed.
    let mut stranded = JobState::new(JobId::new(), JobMode::Incremental, vec!["parcels".to_string()]);
    stranded.transition(JobStatus::Running).unwrap();
    store.commit(WriteSet::job_only(stranded.clone())).await.unwrap();
    store
        .acquire_lease(
            &lease,
            &stranded.id.to_string(),
            LeaseMode::Exclusive,
            ChronoDuration::milliseconds(-1),
        )
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let state = run(&engine, config).await;

    assert_eq!(state.status, JobStatus::Completed);
    let abandoned = engine.status(stranded.id).await.unwrap();
    assert_eq!(abandoned.status, JobStatus::Failed);
    assert_eq!(abandoned.errors.last().unwrap().kind, "lease_expired");
    let published: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(published.iter().any(|e| matches!(
        e.as_ref(),
        SyncEvent::JobStatusChanged { job_id, to: JobStatus::Failed, .. } if *job_id == stranded.id
    )));
}

#[tokio::test]
async fn test_lease_taken_over_fails_running_job() {
    let (engine, source) = setup(parcels()).await;
    source.set_delay(Some(Duration::from_millis(150))).await;
    let config = JobConfig {
        batch_size: 1,
        lease_ttl_secs: 1,
        ..job(ConflictStrategy::SourceWins)
    };
    let lease = sync_lease(&config.pipeline());
    let store = engine.store();

    let job_id = engine.submit(config).await.unwrap();
    store.release_lease(&lease, &job_id.to_string()).await.unwrap();
    store
        .acquire_lease(&lease, "other-runner", LeaseMode::Exclusive, ChronoDuration::seconds(60))
        .await
        .unwrap();

    let state = tokio::time::timeout(WAIT, engine.wait(job_id)).await.unwrap().unwrap();
    assert_eq!(state.status, JobStatus::Failed);
    assert_eq!(state.errors.last().unwrap().kind, "lease_held");
    let holders = store.leases(&lease).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].holder, "other-runner");

    // Control requests cannot revive a job that lost its lease.
    assert!(engine.resume(job_id).await.is_err());
}

#[tokio::test]
async fn test_lease_lost_is_sticky() {
    let (control, _) = watch::channel(Control::Run);
    request(&control, Control::Pause);
    assert_eq!(*control.borrow(), Control::Pause);

    control.send_replace(Control::LeaseLost);
    request(&control, Control::Run);
    request(&control, Control::Cancel);
    assert_eq!(*control.borrow(), Control::LeaseLost);
}

#[tokio::test]
async fn test_schema_drift_needs_acknowledgement() {
    let (engine, source) = setup(parcels()).await;
    source.drop_column("parcels", "owner").await;

    let job_id = engine.submit(job(ConflictStrategy::SourceWins)).await.unwrap();
    let paused = tokio::time::timeout(WAIT, engine.wait_settled(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    let drift = paused.drift.clone().unwrap();
    assert_eq!(drift.table, "parcels");
    assert_eq!(drift.missing_columns, vec!["owner".to_string()]);
    assert_eq!(paused.counters.applied, 0);

    assert!(matches!(
        engine.resume(job_id).await,
        Err(SyncError::SchemaDrift { .. })
    ));

    engine.acknowledge_drift(job_id).await.unwrap();
    source.restore_column("parcels", "owner").await;
    engine.resume(job_id).await.unwrap();

    let done = tokio::time::timeout(WAIT, engine.wait(job_id)).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.drift.is_none());
    assert_eq!(done.counters.applied, 3);
}

#[tokio::test]
async fn test_acknowledge_without_drift_fails() {
    let (engine, _source) = setup(parcels()).await;
    let state = run(&engine, job(ConflictStrategy::SourceWins)).await;
    assert!(engine.acknowledge_drift(state.id).await.is_err());
}

#[tokio::test]
async fn test_tolerant_job_dead_letters_invalid_row() {
    let mut rows = parcels();
    rows.push(json!({ "id": 4, "owner": "Dee", "total_value": -5.0, "mtime": 130 }));
    let (engine, _source) = setup(rows).await;

    let state = run(&engine, job(ConflictStrategy::SourceWins)).await;

    assert_eq!(state.status, JobStatus::Completed);
    assert_eq!(state.counters.applied, 3);
    assert_eq!(state.counters.dead_lettered, 1);
    assert_eq!(owner(&engine, 4).await, None);
    let letters = engine.store().dead_letters(Some(state.id), None).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].key, RecordKey::int(4));
}

#[tokio::test]
async fn test_strict_job_fails_on_invalid_row() {
    let mut rows = parcels();
    rows.push(json!({ "id": 4, "owner": "Dee", "total_value": -5.0, "mtime": 130 }));
    let (engine, _source) = setup(rows).await;
    let config = JobConfig {
        validation_mode: ValidationMode::Strict,
        ..job(ConflictStrategy::SourceWins)
    };

    let state = run(&engine, config).await;

    assert_eq!(state.status, JobStatus::Failed);
    assert!(state.errors.iter().any(|e| e.kind == "validation_failure"));
}

// ============================================================================
// Operator actions
// ============================================================================

async fn edit_then_update(engine: &Engine, source: &MemorySource) {
    run(engine, job(ConflictStrategy::SourceWins)).await;
    let edit = OperatorEdit::upsert(
        "parcels",
        RecordKey::int(1),
        row(json!({ "id": 1, "owner": "Clerk", "total_value": 100.0 })),
        "alice",
    );
    let entry = engine.apply_operator_edit(edit).await.unwrap().unwrap();
    assert_eq!(entry.actor, Actor::User("alice".into()));
    source
        .upsert(
            "parcels",
            &pk(),
            row(json!({ "id": 1, "owner": "Ada Lovelace", "total_value": 100.0, "mtime": 200 })),
        )
        .await;
}

#[tokio::test]
async fn test_operator_edit_noop_when_unchanged() {
    let (engine, _source) = setup(parcels()).await;
    run(&engine, job(ConflictStrategy::SourceWins)).await;
    let current = engine
        .store()
        .read_current("parcels", &[RecordKey::int(2)])
        .await
        .unwrap()
        .remove(&RecordKey::int(2))
        .unwrap();

    let result = engine
        .apply_operator_edit(OperatorEdit::upsert("parcels", RecordKey::int(2), current, "alice"))
        .await
        .unwrap();
    assert!(result.is_none());

    let wrong_key = OperatorEdit::upsert("parcels", RecordKey::int(9), row(json!({ "id": 2 })), "alice");
    assert!(engine.apply_operator_edit(wrong_key).await.is_err());
}

#[tokio::test]
async fn test_source_wins_overwrites_operator_edit() {
    let (engine, source) = setup(parcels()).await;
    edit_then_update(&engine, &source).await;

    let state = run(&engine, job(ConflictStrategy::SourceWins)).await;

    assert_eq!(state.counters.applied, 1);
    assert_eq!(owner(&engine, 1).await, Some(json!("Ada Lovelace")));
    let audit = engine
        .store()
        .audit_entries(&AuditFilter::for_job(state.id))
        .await
        .unwrap();
    assert!(audit[0].annotations.iter().any(|a| a == "conflict: source_wins"));
}

#[tokio::test]
async fn test_newest_wins_keeps_later_operator_edit() {
    let (engine, source) = setup(parcels()).await;
    edit_then_update(&engine, &source).await;

    let state = run(&engine, job(ConflictStrategy::NewestWins)).await;

    assert_eq!(state.status, JobStatus::Completed);
    assert_eq!(state.counters.skipped, 1);
    assert_eq!(state.counters.applied, 0);
    assert_eq!(owner(&engine, 1).await, Some(json!("Clerk")));
}

#[tokio::test]
async fn test_manual_conflict_parks_until_decided() {
    let (engine, source) = setup(parcels()).await;
    edit_then_update(&engine, &source).await;

    let state = run(&engine, job(ConflictStrategy::Manual)).await;
    assert_eq!(state.counters.conflicts_parked, 1);
    assert_eq!(owner(&engine, 1).await, Some(json!("Clerk")));
    let parked = engine.store().parked_conflicts(Some("parcels")).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].target_row.as_ref().unwrap()["owner"], json!("Clerk"));

    let entry = engine
        .decide_conflict("parcels", &RecordKey::int(1), ManualResolution::Source)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.actor, Actor::User(OPERATOR.into()));
    assert_eq!(
        entry.annotations,
        vec!["conflict: manual decision source".to_string()]
    );
    assert_eq!(owner(&engine, 1).await, Some(json!("Ada Lovelace")));
    assert!(engine.store().parked_conflicts(None).await.unwrap().is_empty());

    let again = engine
        .decide_conflict("parcels", &RecordKey::int(1), ManualResolution::Target)
        .await;
    assert!(matches!(again, Err(SyncError::ConflictNotFound { .. })));
}

#[tokio::test]
async fn test_target_decision_keeps_target_without_audit() {
    let (engine, source) = setup(parcels()).await;
    edit_then_update(&engine, &source).await;
    run(&engine, job(ConflictStrategy::Manual)).await;

    let entry = engine
        .decide_conflict("parcels", &RecordKey::int(1), ManualResolution::Target)
        .await
        .unwrap();

    assert!(entry.is_none());
    assert_eq!(owner(&engine, 1).await, Some(json!("Clerk")));
    assert!(engine.store().parked_conflicts(None).await.unwrap().is_empty());

    // The decision accepted the target image, so a rerun finds nothing to do.
    let state = run(&engine, job(ConflictStrategy::Manual)).await;
    assert_eq!(state.counters.conflicts_parked, 0);
}
