//! Per-record apply decisions for one batch.
//!
//! Planning is pure: given the transformed records, their verdicts, the
//! target's current rows and the stored key states, it decides for every
//! record whether it is written, skipped, parked or dead-lettered. The
//! resulting [`BatchPlan`] turns into a [`WriteSet`] and can requeue a record
//! the target rejected.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::audit::EntryBuilder;
use crate::bus::SyncEvent;
use crate::config::{TableJobConfig, ValidationMode};
use crate::detect::{content_hash, KeyStates};
use crate::dlq::DeadLetter;
use crate::error::SyncError;
use crate::model::{
    JobCounters, JobId, JobMode, NewAuditEntry, Operation, RecordKey, Row, Severity,
    TransformedRecord, ValidationVerdict, Watermark, Winner,
};
use crate::resolve::{ConflictInput, ConflictResolver, ParkedConflict};
use crate::storage::{KeyState, RowWrite, WriteSet};

/// A record after transform and validation.
#[derive(Debug, Clone)]
pub(crate) struct Staged {
    pub record: TransformedRecord,
    pub verdict: ValidationVerdict,
}

/// Change to the stored key state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StateUpdate {
    Keep,
    Set(KeyState),
    Remove,
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Applied,
    Unchanged,
    Skipped(String),
    Parked(ParkedConflict),
    DeadLettered(DeadLetter),
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedRecord {
    pub record: TransformedRecord,
    pub verdict: ValidationVerdict,
    pub write: Option<RowWrite>,
    pub audit: Option<NewAuditEntry>,
    pub state: StateUpdate,
    /// State to store if the write is abandoned.
    pub fallback_state: StateUpdate,
    pub outcome: Outcome,
    pub requeues: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct BatchPlan {
    pub table: String,
    pub job_id: JobId,
    pub records: Vec<PlannedRecord>,
    pub watermark: Watermark,
    pub detected: u64,
    /// Changes the detector or transformer found identical to the last sync.
    pub unchanged: u64,
    pub requeued: u64,
}

/// Whether the target moved since this key was last synced.
///
/// A key never synced whose target row already exists only counts as
/// diverged in incremental mode; full syncs reconcile such rows.
pub(crate) fn diverged(mode: JobMode, current: Option<&Row>, state: Option<&KeyState>) -> bool {
    match (current, state.and_then(|s| s.target_hash.as_deref())) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(row), Some(hash)) => content_hash(row) != hash,
        (Some(_), None) => mode == JobMode::Incremental,
    }
}

/// Key state after processing `record`, with `target_hash` as the target's
/// accepted image. `Keep` when nothing is known about the source side.
fn state_with(
    prior: Option<&KeyState>,
    record: &TransformedRecord,
    target_hash: Option<String>,
) -> StateUpdate {
    let source_hash = record
        .source_hash
        .clone()
        .or_else(|| prior.map(|s| s.source_hash.clone()));
    match source_hash {
        Some(source_hash) => StateUpdate::Set(KeyState {
            source_hash,
            target_hash,
            source_timestamp: record
                .source_timestamp
                .or_else(|| prior.and_then(|s| s.source_timestamp)),
        }),
        None => StateUpdate::Keep,
    }
}

fn annotations(record: &TransformedRecord, verdict: &ValidationVerdict) -> Vec<String> {
    let mut out: Vec<String> = record
        .annotations
        .iter()
        .map(|a| format!("{}: {}", a.rule, a.message))
        .collect();
    out.extend(
        verdict
            .issues
            .iter()
            .filter(|i| i.severity < Severity::Error)
            .map(|i| format!("{}: {}", i.code, i.message)),
    );
    out
}

/// Inputs shared by every record of a batch.
pub(crate) struct PlanContext<'a> {
    pub job_id: JobId,
    pub mode: JobMode,
    pub validation_mode: ValidationMode,
    pub settings: &'a TableJobConfig,
    pub resolver: &'a ConflictResolver,
    pub current: &'a BTreeMap<RecordKey, Row>,
    pub states: &'a KeyStates,
    pub parked: &'a BTreeSet<RecordKey>,
    /// Latest audit time per key, for `newest_wins`.
    pub target_times: &'a BTreeMap<RecordKey, DateTime<Utc>>,
}

impl PlanContext<'_> {
    /// Decide every record. Fails only in strict mode, on the first record
    /// validation blocks.
    pub fn plan(
        &self,
        table: &str,
        staged: Vec<Staged>,
        watermark: Watermark,
        detected: u64,
        unchanged: u64,
    ) -> Result<BatchPlan, SyncError> {
        let builder = EntryBuilder::for_job(self.job_id);
        let mut records = Vec::with_capacity(staged.len());
        for Staged { record, verdict } in staged {
            records.push(self.plan_record(&builder, record, verdict)?);
        }
        Ok(BatchPlan {
            table: table.to_string(),
            job_id: self.job_id,
            records,
            watermark,
            detected,
            unchanged,
            requeued: 0,
        })
    }

    fn plan_record(
        &self,
        builder: &EntryBuilder,
        record: TransformedRecord,
        verdict: ValidationVerdict,
    ) -> Result<PlannedRecord, SyncError> {
        let key = record.key.clone();
        let prior = self.states.get(&key);
        let current = self.current.get(&key);
        let carry = state_with(prior, &record, prior.and_then(|s| s.target_hash.clone()));

        let planned = |outcome: Outcome,
                       state: StateUpdate,
                       record: TransformedRecord,
                       verdict: ValidationVerdict| {
            PlannedRecord {
                record,
                verdict,
                write: None,
                audit: None,
                state: state.clone(),
                fallback_state: state,
                outcome,
                requeues: 0,
            }
        };

        if verdict.max_severity() >= Some(Severity::Error) {
            if self.validation_mode == ValidationMode::Strict {
                let codes: Vec<&str> = verdict
                    .issues
                    .iter()
                    .filter(|i| i.severity >= Severity::Error)
                    .map(|i| i.code.as_str())
                    .collect();
                return Err(SyncError::ValidationFailure {
                    table: record.table.clone(),
                    key: key.to_string(),
                    message: codes.join(", "),
                });
            }
            let letter = DeadLetter::from_validation(self.job_id, &record, &verdict);
            return Ok(planned(Outcome::DeadLettered(letter), carry, record, verdict));
        }

        if self.parked.contains(&key) {
            let conflict = self.park(&record, current, "awaiting operator decision");
            return Ok(planned(Outcome::Parked(conflict), carry, record, verdict));
        }

        let is_diverged = diverged(self.mode, current, prior);
        let decision = self.resolver.resolve(
            self.settings.conflict,
            &self.settings.merge,
            ConflictInput {
                record: &record,
                target_row: current,
                target_applied_at: self.target_times.get(&key).copied(),
                diverged: is_diverged,
            },
        );

        let desired = match decision.winner {
            Winner::Target => {
                let state = state_with(prior, &record, current.map(content_hash));
                return Ok(planned(Outcome::Skipped(decision.rationale), state, record, verdict));
            }
            Winner::Skip => {
                let conflict = self.park(&record, current, &decision.rationale);
                return Ok(planned(Outcome::Parked(conflict), carry, record, verdict));
            }
            Winner::Source | Winner::Merged => match record.operation {
                Operation::Delete => None,
                Operation::Insert | Operation::Update => {
                    Some(decision.merged.clone().unwrap_or_else(|| record.payload.clone()))
                }
            },
        };

        match (current, desired) {
            (None, None) => Ok(planned(Outcome::Unchanged, StateUpdate::Remove, record, verdict)),
            (Some(row), Some(desired)) if *row == desired => {
                let state = state_with(prior, &record, Some(content_hash(&desired)));
                Ok(planned(Outcome::Unchanged, state, record, verdict))
            }
            (current, desired) => {
                let mut notes = annotations(&record, &verdict);
                if is_diverged {
                    notes.push(format!("conflict: {}", decision.rationale));
                }
                let audit = builder.entry(
                    &record.table,
                    &key,
                    current.cloned(),
                    desired.clone(),
                    notes,
                );
                let (write, state) = match desired {
                    Some(row) => {
                        let hash = content_hash(&row);
                        (
                            RowWrite::Upsert {
                                table: record.table.clone(),
                                key: key.clone(),
                                row,
                            },
                            state_with(prior, &record, Some(hash)),
                        )
                    }
                    None => (
                        RowWrite::Delete {
                            table: record.table.clone(),
                            key: key.clone(),
                        },
                        StateUpdate::Remove,
                    ),
                };
                Ok(PlannedRecord {
                    record,
                    verdict,
                    write: Some(write),
                    audit,
                    state,
                    fallback_state: carry,
                    outcome: Outcome::Applied,
                    requeues: 0,
                })
            }
        }
    }

    fn park(&self, record: &TransformedRecord, current: Option<&Row>, rationale: &str) -> ParkedConflict {
        ParkedConflict {
            table: record.table.clone(),
            key: record.key.clone(),
            job_id: self.job_id,
            record: record.clone(),
            target_row: current.cloned(),
            rationale: rationale.to_string(),
            parked_at: Utc::now(),
        }
    }
}

impl BatchPlan {
    /// Everything this batch commits, in record order.
    pub fn write_set(&self, pipeline: &str) -> WriteSet {
        let mut writes = WriteSet::new(pipeline);
        for planned in &self.records {
            if let Some(write) = &planned.write {
                writes.rows.push(write.clone());
            }
            if let Some(entry) = &planned.audit {
                writes.audit.push(entry.clone());
            }
            let key = planned.record.key.clone();
            match &planned.state {
                StateUpdate::Keep => {}
                StateUpdate::Set(state) => {
                    writes
                        .key_states
                        .push((self.table.clone(), key, Some(state.clone())));
                }
                StateUpdate::Remove => writes.key_states.push((self.table.clone(), key, None)),
            }
            match &planned.outcome {
                Outcome::Parked(conflict) => writes.parked.push(conflict.clone()),
                Outcome::DeadLettered(letter) => writes.dead_letters.push(letter.clone()),
                _ => {}
            }
        }
        writes.watermarks.push(self.watermark.clone());
        writes
    }

    pub fn counters(&self) -> JobCounters {
        let mut counters = JobCounters {
            detected: self.detected,
            no_change: self.unchanged,
            requeued: self.requeued,
            batches: 1,
            ..JobCounters::default()
        };
        for planned in &self.records {
            match planned.outcome {
                Outcome::Applied => counters.applied += 1,
                Outcome::Unchanged => counters.no_change += 1,
                Outcome::Skipped(_) => counters.skipped += 1,
                Outcome::Parked(_) => counters.conflicts_parked += 1,
                Outcome::DeadLettered(_) => counters.dead_lettered += 1,
            }
        }
        counters
    }

    /// Handle a target rejection of `key`: move the record to the end of the
    /// batch, or dead-letter it once `max_requeues` is spent.
    pub fn requeue(&mut self, key: &RecordKey, reason: &str, max_requeues: u32) -> Result<(), SyncError> {
        let Some(index) = self
            .records
            .iter()
            .position(|p| p.write.as_ref().is_some_and(|w| w.key() == key))
        else {
            return Err(SyncError::ConstraintViolation(reason.to_string()));
        };
        let mut planned = self.records.remove(index);

        if planned.requeues < max_requeues {
            planned.requeues += 1;
            self.requeued += 1;
            debug!(table = %self.table, %key, attempt = planned.requeues, "Requeued record after constraint violation");
        } else {
            let mut record = planned.record.clone();
            if let Some(RowWrite::Upsert { row, .. }) = &planned.write {
                record.payload = row.clone();
            }
            let letter = DeadLetter::from_constraint_violation(
                self.job_id,
                &record,
                Some(&planned.verdict),
                reason,
                planned.requeues + 1,
            );
            planned.write = None;
            planned.audit = None;
            planned.state = planned.fallback_state.clone();
            planned.outcome = Outcome::DeadLettered(letter);
        }
        self.records.push(planned);
        Ok(())
    }

    /// Events describing the committed batch.
    pub fn events(&self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        let mut applied = 0;
        for planned in &self.records {
            let table = self.table.clone();
            let key = planned.record.key.clone();
            match &planned.outcome {
                Outcome::Applied => applied += 1,
                Outcome::Unchanged => {}
                Outcome::Skipped(reason) => events.push(SyncEvent::RecordSkipped {
                    job_id: self.job_id,
                    table,
                    key,
                    reason: reason.clone(),
                }),
                Outcome::Parked(_) => events.push(SyncEvent::ConflictParked {
                    job_id: self.job_id,
                    table,
                    key,
                }),
                Outcome::DeadLettered(letter) => events.push(SyncEvent::DeadLettered {
                    job_id: self.job_id,
                    table,
                    key,
                    retryable: letter.retryable,
                    reason: letter.reason.clone(),
                }),
            }
        }
        events.push(SyncEvent::BatchCommitted {
            job_id: self.job_id,
            table: self.table.clone(),
            applied,
            cursor: self.watermark.cursor.clone(),
            change_id: self.watermark.change_id,
        });
        events
    }

    /// Rows written by upserts, for the statistical windows.
    pub fn written_rows(&self) -> impl Iterator<Item = &Row> {
        self.records.iter().filter_map(|p| match &p.write {
            Some(RowWrite::Upsert { row, .. }) => Some(row),
            _ => None,
        })
    }
}
