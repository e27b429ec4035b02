//! Per-table state machine.
//!
//! Each batch walks detect, transform, validate, resolve and apply, and the
//! apply commit carries the checkpoint: target rows, audit entries, key
//! states and the advanced watermark land in one transaction. A stop request
//! seen between stages drops the uncommitted batch; it is detected again on
//! resume.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::apply::{BatchPlan, PlanContext, Staged};
use super::job::JobContext;
use crate::config::{ConflictStrategy, DetectionStrategy, TableJobConfig};
use crate::detect::{
    timed, BatchLimits, ContentHashDetector, DetectedBatch, KeyStates, TableDetector,
    TimestampDetector,
};
use crate::error::SyncError;
use crate::model::{
    AuditEntry, JobMode, PreservedBatch, RecordKey, Row, TablePhase, Watermark,
};
use crate::schema::TableDescriptor;
use crate::storage::{AuditFilter, StorageError};
use crate::validate::rules::numeric;

/// How a table's run ended.
#[derive(Debug)]
pub(crate) enum TableOutcome {
    /// Drained: the detector returned an empty batch.
    Completed,
    /// Stopped at a batch or stage boundary on a pause or cancel request.
    Interrupted,
    /// Required source columns are missing.
    Drift(Vec<String>),
    Failed(SyncError),
}

pub(crate) struct TablePipeline<'a> {
    ctx: &'a JobContext,
    descriptor: &'a TableDescriptor,
    settings: TableJobConfig,
    strategy: DetectionStrategy,
}

impl<'a> TablePipeline<'a> {
    pub fn new(ctx: &'a JobContext, descriptor: &'a TableDescriptor) -> Self {
        Self {
            ctx,
            descriptor,
            settings: ctx.config.table(&descriptor.name),
            strategy: ctx
                .config
                .detection_for(&descriptor.name, &ctx.core.registry),
        }
    }

    fn table(&self) -> &str {
        &self.descriptor.name
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_records: self.ctx.config.batch_size,
            max_elapsed: self.ctx.config.batch_time_limit(),
            call_timeout: self.ctx.config.call_timeout(),
        }
    }

    pub async fn run(&self) -> TableOutcome {
        let table = self.table();
        let mut detector: Option<TableDetector> = None;

        loop {
            if self.ctx.stop_requested() {
                self.ctx.set_phase(table, TablePhase::Paused).await;
                return TableOutcome::Interrupted;
            }

            match self.check_drift().await {
                Ok(None) => {}
                Ok(Some(missing)) => {
                    self.ctx.set_phase(table, TablePhase::Paused).await;
                    return TableOutcome::Drift(missing);
                }
                Err(e) => return self.failed(e, None).await,
            }

            self.ctx.set_phase(table, TablePhase::Detecting).await;
            let batch = match self.detect(&mut detector).await {
                Ok(batch) => batch,
                Err(e) => return self.failed(e, None).await,
            };
            let Some((batch, states)) = batch else {
                info!(%table, "Table drained");
                self.ctx.set_phase(table, TablePhase::Completed).await;
                return TableOutcome::Completed;
            };

            match self.process(&batch, &states).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(%table, changes = batch.changes.len(), "Stop requested, batch dropped before apply");
                    self.ctx.set_phase(table, TablePhase::Paused).await;
                    return TableOutcome::Interrupted;
                }
                Err(e) => return self.failed(e, Some(&batch)).await,
            }
        }
    }

    /// Record the failure on the job, keeping the batch for replay.
    async fn failed(&self, err: SyncError, batch: Option<&DetectedBatch>) -> TableOutcome {
        let table = self.table().to_string();
        let preserved = batch.map(|b| PreservedBatch {
            table: table.clone(),
            changes: b.changes.clone(),
            reason: err.to_string(),
        });
        self.ctx
            .with_state(|state| {
                state.set_phase(&table, TablePhase::Failed);
                if preserved.is_some() {
                    state.preserved_batch = preserved;
                }
            })
            .await;
        TableOutcome::Failed(err)
    }

    /// Missing required source columns, if any. A source that reports no
    /// columns at all is not checked.
    async fn check_drift(&self) -> Result<Option<Vec<String>>, SyncError> {
        let source = self.ctx.core.source.as_ref();
        let name = self.descriptor.source_name.as_str();
        let timeout = self.ctx.config.call_timeout();
        let columns = self
            .ctx
            .retry("columns", move || async move {
                timed(timeout, "columns", source.columns(name)).await.map_err(SyncError::from)
            })
            .await?;
        if columns.is_empty() {
            return Ok(None);
        }

        let present: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
        let missing: Vec<String> = self
            .descriptor
            .required_source_columns()
            .into_iter()
            .filter(|c| !present.contains(c.as_str()))
            .collect();
        if !missing.is_empty() {
            return Ok(Some(missing));
        }

        let table = self.table();
        self.ctx
            .with_state(|state| {
                if state.drift.as_ref().is_some_and(|d| d.table == table) {
                    state.drift = None;
                }
            })
            .await;
        Ok(None)
    }

    /// Next batch and the key states it was detected against; `None` once
    /// the table is drained.
    async fn detect(
        &self,
        detector: &mut Option<TableDetector>,
    ) -> Result<Option<(DetectedBatch, KeyStates)>, SyncError> {
        let store = self.ctx.core.store.as_ref();
        let source = self.ctx.core.source.as_ref();
        let pipeline = self.ctx.pipeline.as_str();
        let table = self.table();
        let limits = self.limits();

        let prior = self
            .ctx
            .retry_store("watermark", move || store.watermark(pipeline, table))
            .await?
            .unwrap_or_else(|| Watermark::initial(table));
        let states = self
            .ctx
            .retry_store("key_states", move || store.key_states(pipeline, table))
            .await?;

        if detector.is_none() {
            *detector = Some(match self.strategy {
                DetectionStrategy::Timestamp => {
                    let timestamp = TimestampDetector::for_table(self.descriptor).ok_or_else(|| {
                        SyncError::Config(format!("table '{}' has no last_modified column", table))
                    })?;
                    TableDetector::Timestamp(timestamp)
                }
                DetectionStrategy::ContentHash => {
                    TableDetector::ContentHash(self.plan_content_hash(&states).await?)
                }
            });
        }

        let batch = match detector {
            Some(TableDetector::Timestamp(timestamp)) => {
                let (timestamp, prior_ref, states_ref) = (&*timestamp, &prior, &states);
                self.ctx
                    .retry("detect", move || async move {
                        timestamp
                            .next_batch(source, prior_ref, states_ref, limits)
                            .await
                            .map_err(SyncError::from)
                    })
                    .await?
            }
            Some(TableDetector::ContentHash(planned)) => {
                planned.next_batch(&prior, limits.max_records)
            }
            None => return Ok(None),
        };
        debug!(%table, changes = batch.changes.len(), "Detected batch");
        Ok((!batch.is_empty()).then_some((batch, states)))
    }

    /// Full syncs diff against the target's key set with an empty baseline;
    /// incremental runs diff against the stored snapshot.
    async fn plan_content_hash(&self, states: &KeyStates) -> Result<ContentHashDetector, SyncError> {
        let store = self.ctx.core.store.as_ref();
        let source = self.ctx.core.source.as_ref();
        let descriptor = self.descriptor;
        let timeout = self.ctx.config.call_timeout();
        let table = self.table();

        let (baseline, target_keys) = match self.ctx.config.mode {
            JobMode::Full => {
                let keys: BTreeSet<RecordKey> = self
                    .ctx
                    .retry_store("row_keys", move || store.row_keys(table))
                    .await?
                    .into_iter()
                    .collect();
                (KeyStates::new(), Some(keys))
            }
            JobMode::Incremental => (states.clone(), None),
        };
        let (baseline, target_keys) = (&baseline, target_keys.as_ref());
        let planned = self
            .ctx
            .retry("snapshot", move || async move {
                ContentHashDetector::plan(descriptor, source, baseline, target_keys, timeout)
                    .await
                    .map_err(SyncError::from)
            })
            .await?;
        debug!(%table, pending = planned.remaining(), unchanged = planned.unchanged(), "Planned content-hash diff");
        Ok(planned)
    }

    /// Run one batch through to its commit. `Ok(false)` means a stop was
    /// requested between stages and nothing was written.
    async fn process(&self, batch: &DetectedBatch, states: &KeyStates) -> Result<bool, SyncError> {
        let ctx = self.ctx;
        let table = self.table();
        let store = ctx.core.store.as_ref();

        ctx.set_phase(table, TablePhase::Transforming).await;
        let mut unchanged = 0u64;
        let mut records = Vec::with_capacity(batch.changes.len());
        for change in &batch.changes {
            match ctx.core.transformer.transform(self.descriptor, change) {
                Some(record) => records.push(record),
                None => unchanged += 1,
            }
        }
        if ctx.stop_requested() {
            return Ok(false);
        }

        ctx.set_phase(table, TablePhase::Validating).await;
        let staged: Vec<Staged> = {
            let stats = ctx.stats.lock().await;
            let table_stats = stats.get(table);
            records
                .into_iter()
                .map(|record| {
                    let verdict = ctx.validator.validate(self.descriptor, &record, table_stats);
                    Staged { record, verdict }
                })
                .collect()
        };
        if ctx.stop_requested() {
            return Ok(false);
        }

        ctx.set_phase(table, TablePhase::Resolving).await;
        let keys: Vec<RecordKey> = staged.iter().map(|s| s.record.key.clone()).collect();
        let keys = keys.as_slice();
        let current = ctx
            .retry_store("read_current", move || store.read_current(table, keys))
            .await?;
        let parked: BTreeSet<RecordKey> = ctx
            .retry_store("parked_conflicts", move || store.parked_conflicts(Some(table)))
            .await?
            .into_iter()
            .map(|c| c.key)
            .collect();
        let target_times = match self.settings.conflict {
            ConflictStrategy::NewestWins => self.target_times(&current).await?,
            _ => BTreeMap::new(),
        };

        let mut plan = PlanContext {
            job_id: ctx.job_id,
            mode: ctx.config.mode,
            validation_mode: ctx.config.validation_mode,
            settings: &self.settings,
            resolver: &ctx.core.resolver,
            current: &current,
            states,
            parked: &parked,
            target_times: &target_times,
        }
        .plan(
            table,
            staged,
            batch.watermark.clone(),
            batch.changes.len() as u64,
            unchanged,
        )?;
        if ctx.stop_requested() {
            return Ok(false);
        }

        ctx.set_phase(table, TablePhase::Applying).await;
        let entries = self.commit(&mut plan).await?;

        {
            let mut stats = ctx.stats.lock().await;
            if let Some(table_stats) = stats.get_mut(table) {
                for row in plan.written_rows() {
                    for column in self.descriptor.columns.iter().filter(|c| c.zscore) {
                        if let Some(v) = row.get(&column.name).and_then(numeric) {
                            table_stats.observe(&column.name, v);
                        }
                    }
                }
            }
        }
        for event in plan.events() {
            ctx.core.bus.publish(event);
        }
        info!(
            %table,
            audited = entries.len(),
            change_id = plan.watermark.change_id,
            "Batch committed"
        );
        Ok(true)
    }

    /// `applied_at` of the latest audit entry for each current target row.
    async fn target_times(
        &self,
        current: &BTreeMap<RecordKey, Row>,
    ) -> Result<BTreeMap<RecordKey, DateTime<Utc>>, SyncError> {
        let store = self.ctx.core.store.as_ref();
        let mut times = BTreeMap::new();
        for key in current.keys() {
            let filter = AuditFilter::for_key(self.table(), key);
            let filter = &filter;
            let entries = self
                .ctx
                .retry_store("audit_entries", move || store.audit_entries(filter))
                .await?;
            if let Some(latest) = entries.iter().map(|e| e.applied_at).max() {
                times.insert(key.clone(), latest);
            }
        }
        Ok(times)
    }

    /// Commit the plan, requeueing records the target rejects.
    async fn commit(&self, plan: &mut BatchPlan) -> Result<Vec<AuditEntry>, SyncError> {
        let ctx = self.ctx;
        let table = self.table();
        loop {
            let writes = plan.write_set(&ctx.pipeline);
            let counters = plan.counters();
            let cursor = plan.watermark.cursor.clone();
            let result = ctx
                .retry("commit", || {
                    let writes = writes.clone();
                    let counters = counters.clone();
                    let cursor = cursor.clone();
                    async move {
                        ctx.commit(writes, move |state| {
                            state.counters.absorb(&counters);
                            let progress = state.progress.entry(table.to_string()).or_default();
                            progress.cursor = Some(cursor);
                            progress.batches += 1;
                            progress.phase = TablePhase::Checkpointing;
                            Ok(())
                        })
                        .await
                    }
                })
                .await;

            match result {
                Ok(entries) => return Ok(entries),
                Err(SyncError::Storage(StorageError::RowRejected { key, reason, .. })) => {
                    plan.requeue(&key, &reason, ctx.config.max_requeues)?;
                }
                Err(SyncError::Storage(other)) => return Err(other.into()),
                Err(e) => return Err(e),
            }
        }
    }
}
