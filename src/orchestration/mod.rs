//! Orchestrator and job control surface.
//!
//! [`Engine`] is the only entry point the surrounding web or CLI layer
//! calls: submit, status, pause, resume, cancel, rollback and export, plus
//! the operator actions on parked conflicts and schema drift. Each submitted
//! job runs on its own task; its tables run in dependency waves through the
//! per-table state machine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{plan_compaction, plan_rollback, EntryBuilder, RollbackRange};
use crate::bus::{EventBus, SyncEvent};
use crate::config::{JobConfig, MergeTake};
use crate::connectors::SourceConnector;
use crate::detect::content_hash;
use crate::error::SyncError;
use crate::export::{self, ExportArtifact, ExportFormat, ExportQuery};
use crate::model::{AuditEntry, AuditId, JobId, JobState, JobStatus, Operation, RecordKey, Row};
use crate::resolve::{ConflictResolver, ManualResolution};
use crate::schema::SchemaRegistry;
use crate::storage::{KeyState, LeaseMode, RowWrite, StorageError, SyncStore, WriteSet};
use crate::transform::Transformer;
use crate::utils::retry::bounded;
use crate::validate::Validator;

mod apply;
mod builder;
mod job;
mod pipeline;

pub use builder::EngineBuilder;

use job::{commit_job_state, request, sync_lease, Control, JobContext};

/// Actor recorded on operator decisions of parked conflicts.
pub const OPERATOR: &str = "operator";

/// Lease shared by exports of one source/target pair. Compaction takes it
/// exclusively.
pub(crate) fn export_lease(pipeline: &str) -> String {
    format!("export:{}", pipeline)
}

/// Shared, read-mostly engine parts.
pub(crate) struct EngineCore {
    pub registry: Arc<SchemaRegistry>,
    pub source: Arc<dyn SourceConnector>,
    pub store: Arc<dyn SyncStore>,
    pub transformer: Transformer,
    pub resolver: ConflictResolver,
    pub bus: EventBus,
    pub defaults: JobConfig,
    /// Serializes apply and checkpoint commits.
    pub commit_lock: Mutex<()>,
}

#[derive(Clone)]
struct JobHandle {
    state: Arc<Mutex<JobState>>,
    published: Arc<watch::Sender<JobState>>,
    control: Arc<watch::Sender<Control>>,
    pipeline: String,
}

/// A direct target edit made outside any sync job.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorEdit {
    pub table: String,
    pub key: RecordKey,
    /// `None` deletes the row.
    pub row: Option<Row>,
    pub user: String,
    /// Defaults to now.
    pub applied_at: Option<DateTime<Utc>>,
}

impl OperatorEdit {
    pub fn upsert(table: &str, key: RecordKey, row: Row, user: &str) -> Self {
        Self {
            table: table.to_string(),
            key,
            row: Some(row),
            user: user.to_string(),
            applied_at: None,
        }
    }

    pub fn delete(table: &str, key: RecordKey, user: &str) -> Self {
        Self {
            table: table.to_string(),
            key,
            row: None,
            user: user.to_string(),
            applied_at: None,
        }
    }

    pub fn at(mut self, applied_at: DateTime<Utc>) -> Self {
        self.applied_at = Some(applied_at);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    /// Compensating entries, in the order they were applied.
    pub entries: Vec<AuditEntry>,
    /// Original entries now marked reversed.
    pub compensated: Vec<AuditId>,
    pub skipped: Vec<AuditId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub keys: usize,
    pub pruned: usize,
}

/// The sync engine.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
    jobs: Arc<RwLock<HashMap<JobId, JobHandle>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn from_core(core: EngineCore) -> Self {
        Self {
            core: Arc::new(core),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.core.registry
    }

    pub fn store(&self) -> Arc<dyn SyncStore> {
        self.core.store.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.core.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SyncEvent>> {
        self.core.bus.subscribe()
    }

    /// The job configuration `submit` callers usually start from.
    pub fn job_defaults(&self) -> &JobConfig {
        &self.core.defaults
    }

    // ========================================================================
    // Job control
    // ========================================================================

    /// Validate `config`, take the pipeline lease and start the job.
    pub async fn submit(&self, config: JobConfig) -> Result<JobId, SyncError> {
        config.validate(&self.core.registry)?;
        for table in &config.tables {
            for rule in table.merge.iter().filter(|r| r.take == MergeTake::Combiner) {
                let name = rule.combiner.as_deref().unwrap_or_default();
                if !self.core.resolver.has_combiner(name) {
                    return Err(SyncError::Config(format!(
                        "merge rule '{}.{}' names unknown combiner '{}'",
                        table.name, rule.column, name
                    )));
                }
            }
        }

        let job_id = JobId::new();
        let pipeline = config.pipeline();
        let lease = sync_lease(&pipeline);
        let holder = job_id.to_string();
        let timeout = config.call_timeout();
        let acquire = self.core.store.acquire_lease(
            &lease,
            &holder,
            LeaseMode::Exclusive,
            config.lease_ttl(),
        );
        let grant = bounded(timeout, "acquire_lease", acquire).await?;
        for stale in &grant.expired {
            self.fail_abandoned(stale, &lease).await;
        }

        let tables = config.table_names(&self.core.registry);
        let state = JobState::new(job_id, config.mode, tables.clone());
        let created = self.core.store.commit(WriteSet::job_only(state.clone()));
        if let Err(e) = bounded(timeout, "commit", created).await {
            let release = self.core.store.release_lease(&lease, &holder);
            if let Err(release_err) = bounded(timeout, "release_lease", release).await {
                warn!(%job_id, error = %release_err, "Failed to release sync lease");
            }
            return Err(e.into());
        }

        let (published, _) = watch::channel(state.clone());
        let (control, _) = watch::channel(Control::Run);
        let handle = JobHandle {
            state: Arc::new(Mutex::new(state)),
            published: Arc::new(published),
            control: Arc::new(control),
            pipeline: pipeline.clone(),
        };

        let ctx = Arc::new(JobContext {
            core: self.core.clone(),
            validator: Validator::new(config.z_threshold),
            config: config.clone(),
            job_id,
            pipeline,
            state: handle.state.clone(),
            published: handle.published.clone(),
            control: handle.control.clone(),
            stats: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            heartbeat_stop: Notify::new(),
        });
        self.jobs.write().await.insert(job_id, handle);

        info!(%job_id, mode = ?config.mode, ?tables, "Job submitted");
        self.core.bus.publish(SyncEvent::JobSubmitted {
            job_id,
            mode: config.mode,
            tables,
        });
        tokio::spawn(ctx.run());
        Ok(job_id)
    }

    /// Fail the job whose lease on `lease` lapsed without renewal. Its
    /// runner is gone, so the stored state would otherwise stay live.
    async fn fail_abandoned(&self, holder: &str, lease: &str) {
        let Ok(id) = Uuid::parse_str(holder) else {
            warn!(%holder, %lease, "Expired lease holder is not a job");
            return;
        };
        let job_id = JobId(id);
        if self.jobs.read().await.contains_key(&job_id) {
            // Still running here; its heartbeat notices the takeover.
            return;
        }
        let mut state = match self.core.store.job(job_id).await {
            Ok(Some(state)) if !state.status.is_terminal() => state,
            Ok(_) => return,
            Err(e) => {
                warn!(%job_id, error = %e, "Could not load job behind expired lease");
                return;
            }
        };
        let from = state.status;
        state.record_error(None, "lease_expired", format!("{} lapsed without a heartbeat", lease));
        if let Err(e) = state.transition(JobStatus::Failed) {
            warn!(%job_id, error = %e, "Could not fail abandoned job");
            return;
        }
        let commit = self.core.store.commit(WriteSet::job_only(state));
        if let Err(e) = bounded(self.core.defaults.call_timeout(), "commit", commit).await {
            warn!(%job_id, error = %e, "Could not persist abandoned job failure");
            return;
        }
        warn!(%job_id, %from, %lease, "Failed job abandoned by a crashed runner");
        self.core.bus.publish(SyncEvent::JobStatusChanged {
            job_id,
            from,
            to: JobStatus::Failed,
        });
    }

    /// Last committed state of the job.
    pub async fn status(&self, job_id: JobId) -> Result<JobState, SyncError> {
        self.core
            .store
            .job(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))
    }

    pub async fn jobs(&self) -> Result<Vec<JobState>, SyncError> {
        Ok(self.core.store.jobs().await?)
    }

    async fn handle(&self, job_id: JobId) -> Result<JobHandle, SyncError> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(SyncError::JobNotFound(job_id))
    }

    /// Ask the job to pause at the next batch boundary.
    pub async fn pause(&self, job_id: JobId) -> Result<(), SyncError> {
        let handle = self.handle(job_id).await?;
        let status = handle.state.lock().await.status;
        if status.is_terminal() {
            return Err(SyncError::InvalidTransition {
                job_id,
                from: status,
                to: JobStatus::Paused,
            });
        }
        info!(%job_id, "Pause requested");
        request(&handle.control, Control::Pause);
        Ok(())
    }

    /// Resume a paused job. A job paused on schema drift must have the
    /// drift acknowledged first.
    pub async fn resume(&self, job_id: JobId) -> Result<(), SyncError> {
        let handle = self.handle(job_id).await?;
        let (status, drift) = {
            let state = handle.state.lock().await;
            (state.status, state.drift.clone())
        };
        if let Some(drift) = drift.filter(|d| !d.acknowledged) {
            return Err(SyncError::SchemaDrift {
                table: drift.table,
                missing: drift.missing_columns,
            });
        }
        match status {
            JobStatus::Paused => {
                commit_job_state(
                    &self.core,
                    &handle.state,
                    &handle.published,
                    self.core.defaults.call_timeout(),
                    WriteSet::new(&handle.pipeline),
                    |state| state.transition(JobStatus::Running),
                )
                .await?;
                self.core.bus.publish(SyncEvent::JobStatusChanged {
                    job_id,
                    from: JobStatus::Paused,
                    to: JobStatus::Running,
                });
            }
            JobStatus::Pending | JobStatus::Running => {}
            terminal => {
                return Err(SyncError::InvalidTransition {
                    job_id,
                    from: terminal,
                    to: JobStatus::Running,
                })
            }
        }
        info!(%job_id, "Resumed");
        request(&handle.control, Control::Run);
        Ok(())
    }

    /// Cancel the job. A running job pauses at the next batch boundary and
    /// then moves to `Cancelled`.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), SyncError> {
        let handle = self.handle(job_id).await?;
        let status = handle.state.lock().await.status;
        if status.is_terminal() {
            return Err(SyncError::InvalidTransition {
                job_id,
                from: status,
                to: JobStatus::Cancelled,
            });
        }
        info!(%job_id, "Cancel requested");
        request(&handle.control, Control::Cancel);
        Ok(())
    }

    /// Mark the job's pending schema drift as seen by an operator.
    pub async fn acknowledge_drift(&self, job_id: JobId) -> Result<(), SyncError> {
        let handle = self.handle(job_id).await?;
        commit_job_state(
            &self.core,
            &handle.state,
            &handle.published,
            self.core.defaults.call_timeout(),
            WriteSet::new(&handle.pipeline),
            |state| match state.drift.as_mut() {
                Some(drift) => {
                    drift.acknowledged = true;
                    Ok(())
                }
                None => Err(SyncError::Config(format!("job {} has no schema drift", job_id))),
            },
        )
        .await?;
        info!(%job_id, "Schema drift acknowledged");
        Ok(())
    }

    async fn wait_until(
        &self,
        job_id: JobId,
        done: impl Fn(JobStatus) -> bool,
    ) -> Result<JobState, SyncError> {
        let Ok(handle) = self.handle(job_id).await else {
            return self.status(job_id).await;
        };
        let mut rx = handle.published.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if done(state.status) {
                    return Ok(state.clone());
                }
            }
            if rx.changed().await.is_err() {
                return self.status(job_id).await;
            }
        }
    }

    /// Wait for a terminal state.
    pub async fn wait(&self, job_id: JobId) -> Result<JobState, SyncError> {
        self.wait_until(job_id, |s| s.is_terminal()).await
    }

    /// Wait for a terminal or paused state.
    pub async fn wait_settled(&self, job_id: JobId) -> Result<JobState, SyncError> {
        self.wait_until(job_id, |s| s.is_terminal() || s == JobStatus::Paused)
            .await
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Reverse the selected audit entries with compensating entries, newest
    /// first. All-or-nothing: a constraint violation aborts the whole
    /// rollback.
    pub async fn rollback(&self, range: RollbackRange, user: &str) -> Result<RollbackReport, SyncError> {
        let _guard = self.core.commit_lock.lock().await;
        let pipeline = self.core.defaults.pipeline();
        let plan = plan_rollback(
            self.core.store.as_ref(),
            &range,
            &EntryBuilder::for_user(user),
            &pipeline,
        )
        .await?;
        if plan.compensated.is_empty() {
            return Ok(RollbackReport {
                entries: Vec::new(),
                compensated: Vec::new(),
                skipped: plan.skipped,
            });
        }

        let entries = self.core.store.commit(plan.writes).await.map_err(|e| match e {
            StorageError::RowRejected { .. } | StorageError::ConstraintViolation(_) => {
                SyncError::Rollback(e.to_string())
            }
            other => other.into(),
        })?;
        info!(compensated = plan.compensated.len(), %user, "Rollback committed");
        self.core.bus.publish(SyncEvent::RolledBack {
            compensations: entries.iter().map(|e| e.id).collect(),
        });
        Ok(RollbackReport {
            entries,
            compensated: plan.compensated,
            skipped: plan.skipped,
        })
    }

    /// Fold audit entries older than the retention horizon into per-key
    /// snapshots. Fails with `LeaseHeld` while an export is reading.
    pub async fn compact(&self, now: DateTime<Utc>) -> Result<CompactionReport, SyncError> {
        let lease = export_lease(&self.core.defaults.pipeline());
        let holder = format!("compaction-{}", Uuid::new_v4());
        self.core
            .store
            .acquire_lease(&lease, &holder, LeaseMode::Exclusive, self.core.defaults.lease_ttl())
            .await?;
        let result = self.compact_locked(now).await;
        self.release(&lease, &holder).await;
        result
    }

    async fn compact_locked(&self, now: DateTime<Utc>) -> Result<CompactionReport, SyncError> {
        let _guard = self.core.commit_lock.lock().await;
        let horizon = now - ChronoDuration::days(i64::from(self.core.defaults.audit_retention_days));
        let plan = plan_compaction(self.core.store.as_ref(), horizon).await?;
        if plan.pruned == 0 {
            return Ok(CompactionReport { keys: 0, pruned: 0 });
        }
        self.core.store.commit(plan.writes).await?;
        info!(keys = plan.keys, pruned = plan.pruned, %horizon, "Audit log compacted");
        self.core.bus.publish(SyncEvent::RetentionCompacted {
            keys: plan.keys,
            pruned: plan.pruned,
        });
        Ok(CompactionReport {
            keys: plan.keys,
            pruned: plan.pruned,
        })
    }

    // ========================================================================
    // Operator actions
    // ========================================================================

    /// Write `edit` to the target with a user actor. Key states are left
    /// alone so the next sync sees the divergence.
    pub async fn apply_operator_edit(&self, edit: OperatorEdit) -> Result<Option<AuditEntry>, SyncError> {
        let descriptor = self.core.registry.require(&edit.table)?;
        if let Some(row) = &edit.row {
            if RecordKey::from_row(row, &descriptor.primary_key).as_ref() != Some(&edit.key) {
                return Err(SyncError::Config(format!(
                    "operator edit row does not carry key {}",
                    edit.key
                )));
            }
        }

        let _guard = self.core.commit_lock.lock().await;
        let current = self
            .core
            .store
            .read_current(&edit.table, std::slice::from_ref(&edit.key))
            .await?
            .remove(&edit.key);
        if current == edit.row {
            return Ok(None);
        }

        let builder = EntryBuilder::for_user(edit.user.clone()).at(edit.applied_at.unwrap_or_else(Utc::now));
        let mut writes = WriteSet::new(self.core.defaults.pipeline());
        writes.rows.push(row_write(&edit.table, &edit.key, edit.row.clone()));
        writes.audit.extend(builder.entry(
            &edit.table,
            &edit.key,
            current,
            edit.row.clone(),
            vec!["operator edit".to_string()],
        ));
        let entries = self.core.store.commit(writes).await?;
        info!(table = %edit.table, key = %edit.key, user = %edit.user, "Operator edit applied");
        Ok(entries.into_iter().next())
    }

    /// Settle a parked conflict. Returns the audit entry when the target
    /// changed.
    pub async fn decide_conflict(
        &self,
        table: &str,
        key: &RecordKey,
        resolution: ManualResolution,
    ) -> Result<Option<AuditEntry>, SyncError> {
        let _guard = self.core.commit_lock.lock().await;
        let parked = self
            .core
            .store
            .parked_conflicts(Some(table))
            .await?
            .into_iter()
            .find(|c| &c.key == key)
            .ok_or_else(|| SyncError::ConflictNotFound {
                table: table.to_string(),
                key: key.to_string(),
            })?;

        let current = self
            .core
            .store
            .read_current(table, std::slice::from_ref(key))
            .await?
            .remove(key);
        let (desired, label) = match resolution {
            ManualResolution::Source => match parked.record.operation {
                Operation::Delete => (None, "source"),
                Operation::Insert | Operation::Update => (Some(parked.record.payload.clone()), "source"),
            },
            ManualResolution::Target => (current.clone(), "target"),
            ManualResolution::Merged(row) => (Some(row), "merged"),
        };

        let pipeline = self.core.defaults.pipeline();
        let mut writes = WriteSet::new(&pipeline);
        writes.cleared_conflicts.push((table.to_string(), key.clone()));
        if current != desired {
            writes.rows.push(row_write(table, key, desired.clone()));
            writes.audit.extend(EntryBuilder::for_user(OPERATOR).entry(
                table,
                key,
                current,
                desired.clone(),
                vec![format!("conflict: manual decision {}", label)],
            ));
        }

        let prior = self.core.store.key_states(&pipeline, table).await?.remove(key);
        let source_hash = parked
            .record
            .source_hash
            .clone()
            .or_else(|| prior.as_ref().map(|s| s.source_hash.clone()));
        match (&desired, source_hash) {
            (None, _) => writes.key_states.push((table.to_string(), key.clone(), None)),
            (Some(row), Some(source_hash)) => writes.key_states.push((
                table.to_string(),
                key.clone(),
                Some(KeyState {
                    source_hash,
                    target_hash: Some(content_hash(row)),
                    source_timestamp: parked.record.source_timestamp,
                }),
            )),
            (Some(_), None) => warn!(%table, %key, "No source hash for decided conflict"),
        }

        let entries = self.core.store.commit(writes).await?;
        info!(%table, %key, decision = label, "Parked conflict decided");
        Ok(entries.into_iter().next())
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Materialize a slice of the target. Read-only; holds the shared export
    /// lease, so it runs alongside sync jobs and other exports.
    pub async fn export(&self, query: &ExportQuery, format: ExportFormat) -> Result<ExportArtifact, SyncError> {
        let lease = export_lease(&self.core.defaults.pipeline());
        let holder = format!("export-{}", Uuid::new_v4());
        self.core
            .store
            .acquire_lease(&lease, &holder, LeaseMode::Shared, self.core.defaults.lease_ttl())
            .await?;
        let artifact = export::export(self.core.store.as_ref(), &self.core.registry, query, format).await;
        self.release(&lease, &holder).await;
        let artifact = artifact?;
        self.core.bus.publish(SyncEvent::ExportCompleted {
            table: query.table.clone(),
            format: format.as_str().to_string(),
            records: artifact.metadata.record_count,
        });
        Ok(artifact)
    }

    async fn release(&self, lease: &str, holder: &str) {
        let release = self.core.store.release_lease(lease, holder);
        if let Err(e) = bounded(self.core.defaults.call_timeout(), "release_lease", release).await {
            warn!(%lease, %holder, error = %e, "Failed to release lease");
        }
    }
}

fn row_write(table: &str, key: &RecordKey, row: Option<Row>) -> RowWrite {
    match row {
        Some(row) => RowWrite::Upsert {
            table: table.to_string(),
            key: key.clone(),
            row,
        },
        None => RowWrite::Delete {
            table: table.to_string(),
            key: key.clone(),
        },
    }
}

#[cfg(test)]
mod tests;
