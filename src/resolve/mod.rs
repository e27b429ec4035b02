//! Conflict Resolver.
//!
//! Invoked when the target was written since the last sync, so the image
//! the source believes it is replacing no longer matches the target. Pure:
//! decisions depend only on the record, the target's current row and the
//! target's last audit time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConflictStrategy, MergeRuleConfig, MergeTake};
use crate::model::{
    ConflictDecision, JobId, Operation, RecordKey, Row, TransformedRecord, Winner,
};
use crate::validate::rules::numeric;

/// Column-wise combiner for the `merge` strategy.
///
/// Returning `None` means the combiner cannot decide, which sends the record
/// to the manual queue.
pub trait Combiner: Send + Sync {
    fn combine(&self, source: &Value, target: &Value) -> Option<Value>;
}

impl<F> Combiner for F
where
    F: Fn(&Value, &Value) -> Option<Value> + Send + Sync,
{
    fn combine(&self, source: &Value, target: &Value) -> Option<Value> {
        self(source, target)
    }
}

fn max_combiner(source: &Value, target: &Value) -> Option<Value> {
    match (numeric(source), numeric(target)) {
        (Some(s), Some(t)) => Some(if s >= t { source.clone() } else { target.clone() }),
        (Some(_), None) if target.is_null() => Some(source.clone()),
        (None, Some(_)) if source.is_null() => Some(target.clone()),
        _ => None,
    }
}

fn min_combiner(source: &Value, target: &Value) -> Option<Value> {
    match (numeric(source), numeric(target)) {
        (Some(s), Some(t)) => Some(if s <= t { source.clone() } else { target.clone() }),
        (Some(_), None) if target.is_null() => Some(source.clone()),
        (None, Some(_)) if source.is_null() => Some(target.clone()),
        _ => None,
    }
}

fn source_non_null(source: &Value, target: &Value) -> Option<Value> {
    Some(if source.is_null() { target.clone() } else { source.clone() })
}

fn target_non_null(source: &Value, target: &Value) -> Option<Value> {
    Some(if target.is_null() { source.clone() } else { target.clone() })
}

/// A record parked for an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedConflict {
    pub table: String,
    pub key: RecordKey,
    pub job_id: JobId,
    pub record: TransformedRecord,
    pub target_row: Option<Row>,
    pub rationale: String,
    pub parked_at: DateTime<Utc>,
}

/// Operator verdict on a parked conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    /// Apply the parked source record.
    Source,
    /// Keep the target as is.
    Target,
    /// Apply this payload instead.
    Merged(Row),
}

/// Inputs to a conflict decision.
#[derive(Debug, Clone, Copy)]
pub struct ConflictInput<'a> {
    pub record: &'a TransformedRecord,
    pub target_row: Option<&'a Row>,
    /// `applied_at` of the target's most recent audit entry for this key.
    pub target_applied_at: Option<DateTime<Utc>>,
    /// Whether the target changed since the last sync of this key.
    pub diverged: bool,
}

#[derive(Clone)]
pub struct ConflictResolver {
    combiners: HashMap<String, Arc<dyn Combiner>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.combiners.keys().collect();
        names.sort();
        f.debug_struct("ConflictResolver")
            .field("combiners", &names)
            .finish()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    /// Resolver with the built-in combiners: `max`, `min`,
    /// `source_non_null`, `target_non_null`.
    pub fn new() -> Self {
        let mut combiners: HashMap<String, Arc<dyn Combiner>> = HashMap::new();
        combiners.insert("max".into(), Arc::new(max_combiner));
        combiners.insert("min".into(), Arc::new(min_combiner));
        combiners.insert("source_non_null".into(), Arc::new(source_non_null));
        combiners.insert("target_non_null".into(), Arc::new(target_non_null));
        Self { combiners }
    }

    pub fn with_combiner(mut self, name: &str, combiner: impl Combiner + 'static) -> Self {
        self.combiners.insert(name.to_string(), Arc::new(combiner));
        self
    }

    pub fn has_combiner(&self, name: &str) -> bool {
        self.combiners.contains_key(name)
    }

    pub fn resolve(
        &self,
        strategy: ConflictStrategy,
        merge: &[MergeRuleConfig],
        input: ConflictInput<'_>,
    ) -> ConflictDecision {
        let key = input.record.key.clone();
        if !input.diverged {
            return ConflictDecision::no_conflict(key);
        }

        match strategy {
            ConflictStrategy::SourceWins => decision(key, Winner::Source, "source_wins"),
            ConflictStrategy::TargetWins => decision(key, Winner::Target, "target_wins"),
            ConflictStrategy::NewestWins => {
                let source_ts = input.record.source_timestamp;
                let target_ts = input.target_applied_at.map(|t| t.timestamp_millis());
                match (source_ts, target_ts) {
                    (Some(s), Some(t)) if t > s => decision(
                        key,
                        Winner::Target,
                        &format!("newest_wins: target applied at {} after source {}", t, s),
                    ),
                    (Some(s), Some(t)) => decision(
                        key,
                        Winner::Source,
                        &format!("newest_wins: source {} not older than target {}", s, t),
                    ),
                    _ => decision(key, Winner::Source, "newest_wins: no target timestamp"),
                }
            }
            ConflictStrategy::Merge => self.merge(merge, input),
            ConflictStrategy::Manual => park(key, "manual resolution required"),
        }
    }

    fn merge(&self, rules: &[MergeRuleConfig], input: ConflictInput<'_>) -> ConflictDecision {
        let key = input.record.key.clone();
        let (Some(target), Operation::Insert | Operation::Update) =
            (input.target_row, input.record.operation)
        else {
            return park(key, "merge: nothing to merge, degraded to manual");
        };

        let mut merged = input.record.payload.clone();
        for rule in rules {
            let source_value = merged.get(&rule.column).cloned().unwrap_or(Value::Null);
            let target_value = target.get(&rule.column).cloned().unwrap_or(Value::Null);
            let value = match rule.take {
                MergeTake::Source => Some(source_value),
                MergeTake::Target => Some(target_value),
                MergeTake::Combiner => rule
                    .combiner
                    .as_ref()
                    .and_then(|name| self.combiners.get(name))
                    .and_then(|c| c.combine(&source_value, &target_value)),
            };
            match value {
                Some(v) => {
                    merged.insert(rule.column.clone(), v);
                }
                None => {
                    return park(
                        key,
                        &format!("merge: combiner failed on '{}', degraded to manual", rule.column),
                    );
                }
            }
        }

        ConflictDecision {
            key,
            winner: Winner::Merged,
            rationale: "merge".to_string(),
            merged: Some(merged),
            parked: false,
        }
    }
}

fn decision(key: RecordKey, winner: Winner, rationale: &str) -> ConflictDecision {
    ConflictDecision {
        key,
        winner,
        rationale: rationale.to_string(),
        merged: None,
        parked: false,
    }
}

fn park(key: RecordKey, rationale: &str) -> ConflictDecision {
    ConflictDecision {
        key,
        winner: Winner::Skip,
        rationale: rationale.to_string(),
        merged: None,
        parked: true,
    }
}
