//! Job runner.
//!
//! Runs the selected tables in dependency waves, at most
//! `max_parallel_tables` at a time, then replays retryable dead letters in
//! the deferred constraint pass. Pause and cancel requests are honoured at
//! batch boundaries; cancellation always passes through `Paused`.
//!
//! A heartbeat renews the pipeline lease while the job runs. If another
//! holder took the lease over, the job stops at the next boundary and fails.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::pipeline::{TableOutcome, TablePipeline};
use super::EngineCore;
use crate::audit::EntryBuilder;
use crate::bus::SyncEvent;
use crate::config::JobConfig;
use crate::detect::content_hash;
use crate::dlq::DeadLetter;
use crate::error::SyncError;
use crate::model::{AuditEntry, DriftInfo, JobId, JobState, JobStatus, Operation, TablePhase};
use crate::storage::{KeyState, LeaseMode, RowWrite, StorageError, WriteSet};
use crate::utils::retry::{bounded, retry_transient};
use crate::validate::rules::numeric;
use crate::validate::{TableStats, Validator};

/// Requested run state, set by the engine and read at batch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Pause,
    Cancel,
    /// The heartbeat found the lease taken over. Sticky.
    LeaseLost,
}

/// Set the requested run state unless the lease is already lost.
pub(crate) fn request(control: &watch::Sender<Control>, next: Control) {
    control.send_if_modified(|current| {
        if *current == Control::LeaseLost || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Lease serializing sync jobs of one source/target pair.
pub(crate) fn sync_lease(pipeline: &str) -> String {
    format!("sync:{}", pipeline)
}

/// Commit `writes` together with a snapshot of the job state as changed by
/// `update`. The in-memory state only moves once the commit succeeds.
///
/// Storage errors are wrapped as-is so callers can see rejected rows. A
/// commit outliving `timeout` fails transiently.
pub(crate) async fn commit_job_state<F>(
    core: &EngineCore,
    state: &Mutex<JobState>,
    published: &watch::Sender<JobState>,
    timeout: Duration,
    mut writes: WriteSet,
    update: F,
) -> Result<Vec<AuditEntry>, SyncError>
where
    F: FnOnce(&mut JobState) -> Result<(), SyncError>,
{
    let _guard = core.commit_lock.lock().await;
    let mut current = state.lock().await;
    let mut next = current.clone();
    update(&mut next)?;
    next.updated_at = chrono::Utc::now();
    writes.job = Some(next.clone());
    let entries = bounded(timeout, "commit", core.store.commit(writes))
        .await
        .map_err(SyncError::Storage)?;
    *current = next.clone();
    published.send_replace(next);
    Ok(entries)
}

/// Everything a running job shares across its table pipelines.
pub(crate) struct JobContext {
    pub core: Arc<EngineCore>,
    pub config: JobConfig,
    pub job_id: JobId,
    pub pipeline: String,
    pub state: Arc<Mutex<JobState>>,
    pub published: Arc<watch::Sender<JobState>>,
    pub control: Arc<watch::Sender<Control>>,
    pub validator: Validator,
    pub stats: Mutex<HashMap<String, TableStats>>,
    pub heartbeat: Mutex<Option<JoinHandle<()>>>,
    pub heartbeat_stop: Notify,
}

impl JobContext {
    pub async fn commit<F>(&self, writes: WriteSet, update: F) -> Result<Vec<AuditEntry>, SyncError>
    where
        F: FnOnce(&mut JobState) -> Result<(), SyncError>,
    {
        commit_job_state(
            &self.core,
            &self.state,
            &self.published,
            self.config.call_timeout(),
            writes,
            update,
        )
        .await
    }

    /// Retry `op` on transient failures, counting retries on the job.
    pub async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let retried = retry_transient(what, self.config.retry_ceiling, op).await;
        if retried.retries > 0 {
            let mut state = self.state.lock().await;
            state.counters.retries += u64::from(retried.retries);
        }
        retried.result
    }

    /// [`retry`](Self::retry) for a single store call, each attempt bounded
    /// by the call timeout.
    pub async fn retry_store<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let timeout = self.config.call_timeout();
        self.retry(what, move || {
            let attempt = call();
            async move { bounded(timeout, what, attempt).await.map_err(SyncError::from) }
        })
        .await
    }

    pub fn stop_requested(&self) -> bool {
        *self.control.borrow() != Control::Run
    }

    /// Update in-memory progress; persisted with the next commit.
    pub async fn set_phase(&self, table: &str, phase: TablePhase) {
        let mut state = self.state.lock().await;
        state.set_phase(table, phase);
        self.published.send_replace(state.clone());
    }

    pub async fn with_state<R>(&self, f: impl FnOnce(&mut JobState) -> R) -> R {
        let mut state = self.state.lock().await;
        let out = f(&mut state);
        self.published.send_replace(state.clone());
        out
    }

    /// Persist a status change and announce it. A no-op if already there.
    pub async fn transition(&self, next: JobStatus) -> Result<(), SyncError> {
        let from = self.state.lock().await.status;
        if from == next {
            return Ok(());
        }
        self.commit(WriteSet::new(&self.pipeline), |state| state.transition(next))
            .await?;
        info!(job_id = %self.job_id, %from, to = %next, "Job status changed");
        self.core.bus.publish(SyncEvent::JobStatusChanged {
            job_id: self.job_id,
            from,
            to: next,
        });
        Ok(())
    }

    fn lease_lost(&self) -> bool {
        *self.control.borrow() == Control::LeaseLost
    }

    /// Renew the pipeline lease every heartbeat interval until stopped.
    /// Stops only between renewals, so none lands after the release.
    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.heartbeat_stop.notified() => return,
            }
            match self.renew_lease().await {
                Ok(()) => debug!(job_id = %self.job_id, "Sync lease renewed"),
                Err(StorageError::LeaseHeld(holder)) => {
                    error!(job_id = %self.job_id, %holder, "Sync lease taken over, stopping job");
                    self.control.send_replace(Control::LeaseLost);
                    return;
                }
                Err(e) => warn!(job_id = %self.job_id, error = %e, "Sync lease renewal failed"),
            }
        }
    }

    async fn renew_lease(&self) -> Result<(), StorageError> {
        let holder = self.job_id.to_string();
        let lease = sync_lease(&self.pipeline);
        let renewal = self.core.store.acquire_lease(
            &lease,
            &holder,
            LeaseMode::Exclusive,
            self.config.lease_ttl(),
        );
        bounded(self.config.call_timeout(), "renew_lease", renewal).await?;
        Ok(())
    }

    async fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().await.take() {
            self.heartbeat_stop.notify_one();
            if let Err(e) = task.await {
                warn!(job_id = %self.job_id, error = %e, "Lease heartbeat task failed");
            }
        }
    }

    async fn release_lease(&self) {
        self.stop_heartbeat().await;
        let holder = self.job_id.to_string();
        let resource = sync_lease(&self.pipeline);
        let release = self
            .core
            .store
            .release_lease(&resource, &holder);
        if let Err(e) = bounded(self.config.call_timeout(), "release_lease", release).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to release sync lease");
        }
    }

    /// Fail the job. The failure is kept in memory even if it cannot be
    /// persisted, so waiters are released.
    async fn fail(&self, table: Option<&str>, err: SyncError) {
        error!(job_id = %self.job_id, table = ?table, error = %err, "Job failed");
        let kind = err.kind();
        let message = err.to_string();
        let from = self.state.lock().await.status;
        let persisted = self
            .commit(WriteSet::new(&self.pipeline), |state| {
                state.record_error(table, kind, message.clone());
                state.transition(JobStatus::Failed)
            })
            .await;
        if let Err(e) = persisted {
            error!(job_id = %self.job_id, error = %e, "Could not persist job failure");
            self.with_state(|state| {
                state.record_error(table, kind, message.clone());
                state.status = JobStatus::Failed;
            })
            .await;
        }
        self.core.bus.publish(SyncEvent::JobStatusChanged {
            job_id: self.job_id,
            from,
            to: JobStatus::Failed,
        });
        self.release_lease().await;
    }

    /// Block while paused; returns the first non-pause request.
    async fn wait_for_control(&self) -> Control {
        let mut rx = self.control.subscribe();
        loop {
            let requested = *rx.borrow_and_update();
            if requested != Control::Pause {
                return requested;
            }
            if rx.changed().await.is_err() {
                return Control::Cancel;
            }
        }
    }

    /// Prime the statistical windows from the most recent target rows.
    async fn seed_stats(&self) {
        let capacity = self.config.stat_window;
        let mut seeded = HashMap::new();
        let tables = self.state.lock().await.tables.clone();
        for table in tables {
            let Some(descriptor) = self.core.registry.get(&table) else {
                continue;
            };
            let columns: Vec<&str> = descriptor
                .columns
                .iter()
                .filter(|c| c.zscore)
                .map(|c| c.name.as_str())
                .collect();
            if columns.is_empty() {
                continue;
            }
            let mut stats = TableStats::new(capacity);
            let recent = self.core.store.recent_post_images(&table, capacity);
            match bounded(self.config.call_timeout(), "recent_post_images", recent).await {
                Ok(rows) => {
                    for row in &rows {
                        for column in &columns {
                            if let Some(v) = row.get(*column).and_then(numeric) {
                                stats.observe(column, v);
                            }
                        }
                    }
                }
                Err(e) => warn!(%table, error = %e, "Could not seed statistics"),
            }
            seeded.insert(table, stats);
        }
        *self.stats.lock().await = seeded;
    }

    /// Drive the job to a terminal state.
    pub async fn run(self: Arc<Self>) {
        let heartbeat = tokio::spawn(self.clone().heartbeat());
        *self.heartbeat.lock().await = Some(heartbeat);
        if let Err(e) = self.transition(JobStatus::Running).await {
            self.fail(None, e).await;
            return;
        }
        self.seed_stats().await;

        let tables = self.state.lock().await.tables.clone();
        let waves = self.core.registry.dependency_waves(&tables);
        let mut done: BTreeSet<String> = BTreeSet::new();

        loop {
            let mut interrupted = false;
            let mut drift: Option<(String, Vec<String>)> = None;

            for wave in &waves {
                let pending: Vec<String> = wave
                    .iter()
                    .filter(|t| !done.contains(*t))
                    .cloned()
                    .collect();
                if pending.is_empty() {
                    continue;
                }

                let this = &self;
                let outcomes: Vec<(String, TableOutcome)> = stream::iter(pending)
                    .map(|table| async move {
                        let outcome = this.run_table(&table).await;
                        (table, outcome)
                    })
                    .buffer_unordered(self.config.max_parallel_tables)
                    .collect()
                    .await;

                let mut failure = None;
                for (table, outcome) in outcomes {
                    match outcome {
                        TableOutcome::Completed => {
                            done.insert(table);
                        }
                        TableOutcome::Interrupted => interrupted = true,
                        TableOutcome::Drift(missing) => {
                            drift.get_or_insert((table, missing));
                        }
                        TableOutcome::Failed(e) => {
                            failure.get_or_insert((table, e));
                        }
                    }
                }
                if let Some((table, e)) = failure {
                    self.fail(Some(&table), e).await;
                    return;
                }
                if interrupted || drift.is_some() {
                    break;
                }
            }

            if !interrupted && drift.is_none() {
                break;
            }
            if self.lease_lost() {
                self.fail(None, SyncError::LeaseHeld(sync_lease(&self.pipeline)))
                    .await;
                return;
            }

            if let Some((table, missing)) = drift {
                warn!(job_id = %self.job_id, %table, ?missing, "Schema drift, pausing job");
                self.with_state(|state| {
                    state.drift = Some(DriftInfo {
                        table: table.clone(),
                        missing_columns: missing.clone(),
                        acknowledged: false,
                    });
                })
                .await;
                request(&self.control, Control::Pause);
                self.core.bus.publish(SyncEvent::SchemaDrift {
                    job_id: self.job_id,
                    table,
                    missing,
                });
            }

            if let Err(e) = self.transition(JobStatus::Paused).await {
                self.fail(None, e).await;
                return;
            }
            match self.wait_for_control().await {
                Control::Run => {
                    if let Err(e) = self.transition(JobStatus::Running).await {
                        self.fail(None, e).await;
                        return;
                    }
                }
                Control::Cancel | Control::Pause => {
                    if let Err(e) = self.transition(JobStatus::Cancelled).await {
                        self.fail(None, e).await;
                        return;
                    }
                    info!(job_id = %self.job_id, "Job cancelled");
                    self.release_lease().await;
                    return;
                }
                Control::LeaseLost => {
                    self.fail(None, SyncError::LeaseHeld(sync_lease(&self.pipeline)))
                        .await;
                    return;
                }
            }
        }

        if let Err(e) = self.deferred_pass().await {
            self.fail(None, e).await;
            return;
        }
        if let Err(e) = self.transition(JobStatus::Completed).await {
            self.fail(None, e).await;
            return;
        }
        let counters = self.state.lock().await.counters.clone();
        info!(job_id = %self.job_id, ?counters, "Job completed");
        self.release_lease().await;
    }

    async fn run_table(&self, table: &str) -> TableOutcome {
        match self.core.registry.require(table) {
            Ok(descriptor) => TablePipeline::new(self, descriptor).run().await,
            Err(e) => TableOutcome::Failed(e.into()),
        }
    }

    /// Replay retryable dead letters once every table has run: upserts in
    /// dependency order, then deletes in reverse. Whatever still fails
    /// becomes permanent.
    async fn deferred_pass(&self) -> Result<(), SyncError> {
        let store = self.core.store.as_ref();
        let job_id = self.job_id;
        let letters: Vec<DeadLetter> = self
            .retry_store("dead_letters", move || store.dead_letters(Some(job_id), None))
            .await?
            .into_iter()
            .filter(|d| d.retryable)
            .collect();
        if letters.is_empty() {
            return Ok(());
        }
        info!(job_id = %self.job_id, count = letters.len(), "Running deferred constraint pass");

        let order = self.core.registry.dependency_order();
        let rank = |table: &str| order.iter().position(|t| t == table).unwrap_or(order.len());
        let (mut deletes, mut upserts): (Vec<DeadLetter>, Vec<DeadLetter>) = letters
            .into_iter()
            .partition(|d| d.record.operation == Operation::Delete);
        upserts.sort_by_key(|d| (rank(&d.table), d.key.clone()));
        deletes.sort_by_key(|d| (Reverse(rank(&d.table)), d.key.clone()));

        for letter in upserts.into_iter().chain(deletes) {
            self.replay(letter).await?;
        }
        Ok(())
    }

    async fn replay(&self, letter: DeadLetter) -> Result<(), SyncError> {
        let store = self.core.store.as_ref();
        let table = letter.table.as_str();
        let key = &letter.key;
        let mut current = self
            .retry_store("read_current", move || {
                store.read_current(table, std::slice::from_ref(key))
            })
            .await?;
        let current = current.remove(key);
        let desired = match letter.record.operation {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => Some(letter.record.payload.clone()),
        };

        let mut writes = WriteSet::new(&self.pipeline);
        writes
            .resolved_dead_letters
            .push((self.job_id, letter.table.clone(), letter.key.clone()));
        let changed = current != desired;
        if changed {
            writes.rows.push(match &desired {
                Some(row) => RowWrite::Upsert {
                    table: letter.table.clone(),
                    key: letter.key.clone(),
                    row: row.clone(),
                },
                None => RowWrite::Delete {
                    table: letter.table.clone(),
                    key: letter.key.clone(),
                },
            });
            writes.audit.extend(EntryBuilder::for_job(self.job_id).entry(
                table,
                key,
                current.clone(),
                desired.clone(),
                vec!["deferred constraint pass".to_string()],
            ));
        }
        match (&desired, &letter.record.source_hash) {
            (None, _) => writes.key_states.push((letter.table.clone(), letter.key.clone(), None)),
            (Some(row), Some(source_hash)) => writes.key_states.push((
                letter.table.clone(),
                letter.key.clone(),
                Some(KeyState {
                    source_hash: source_hash.clone(),
                    target_hash: Some(content_hash(row)),
                    source_timestamp: letter.record.source_timestamp,
                }),
            )),
            (Some(_), None) => {}
        }

        let result = self
            .retry("deferred_commit", || {
                let writes = writes.clone();
                async move {
                    self.commit(writes, |state| {
                        if changed {
                            state.counters.applied += 1;
                        }
                        state.counters.dead_lettered = state.counters.dead_lettered.saturating_sub(1);
                        Ok(())
                    })
                    .await
                }
            })
            .await;

        match result {
            Ok(_) => {
                info!(table = %letter.table, key = %letter.key, "Deferred record applied");
                Ok(())
            }
            Err(SyncError::Storage(StorageError::RowRejected { reason, .. })) => {
                let permanent = letter.into_permanent(&reason);
                self.core.bus.publish(SyncEvent::DeadLettered {
                    job_id: self.job_id,
                    table: permanent.table.clone(),
                    key: permanent.key.clone(),
                    retryable: false,
                    reason: permanent.reason.clone(),
                });
                let mut writes = WriteSet::new(&self.pipeline);
                writes.dead_letters.push(permanent);
                self.commit(writes, |_| Ok(())).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
