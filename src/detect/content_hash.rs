//! Content-hash detection.
//!
//! The table is read once per run and each row hashed; the diff against the
//! stored snapshot is then handed out in key order, one batch at a time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use chrono::Utc;

use super::{is_truthy, source_hash, timed, timestamp_value, DetectedBatch, KeyStates};
use crate::config::DeleteDetection;
use crate::connectors::{ConnectorError, SourceConnector};
use crate::model::{ChangeKind, DetectedChange, RecordKey, Watermark};
use crate::schema::TableDescriptor;

#[derive(Debug)]
pub struct ContentHashDetector {
    pending: VecDeque<DetectedChange>,
    unchanged: usize,
}

impl ContentHashDetector {
    /// Diff the current source against `baseline`.
    ///
    /// Keys in `baseline` or `target_keys` that the source no longer holds
    /// become deletes. Full syncs pass an empty baseline and the target's
    /// key set; incremental runs pass the stored snapshot and `None`.
    pub async fn plan(
        descriptor: &TableDescriptor,
        source: &dyn SourceConnector,
        baseline: &KeyStates,
        target_keys: Option<&BTreeSet<RecordKey>>,
        call_timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let rows = timed(call_timeout, "snapshot", source.snapshot(&descriptor.source_name)).await?;
        let soft_delete = match &descriptor.deletes {
            DeleteDetection::SoftDelete { column } => Some(column.as_str()),
            _ => None,
        };

        let mut present: BTreeMap<RecordKey, DetectedChange> = BTreeMap::new();
        let mut unchanged = 0;
        for row in rows {
            let Some(key) = RecordKey::from_row(&row, &descriptor.primary_key) else {
                continue;
            };
            if soft_delete
                .and_then(|column| row.get(column))
                .is_some_and(is_truthy)
            {
                continue;
            }
            let hash = source_hash(&row, descriptor.last_modified.as_deref());
            let kind = match baseline.get(&key) {
                Some(state) if state.source_hash == hash => {
                    unchanged += 1;
                    ChangeKind::NoChange
                }
                Some(_) => ChangeKind::Update,
                None => ChangeKind::Insert,
            };
            let source_timestamp = descriptor
                .last_modified
                .as_ref()
                .and_then(|column| row.get(column))
                .and_then(timestamp_value);
            present.insert(
                key.clone(),
                DetectedChange {
                    table: descriptor.name.clone(),
                    key,
                    kind,
                    old_image: None,
                    new_image: Some(row),
                    source_timestamp,
                    source_hash: Some(hash),
                },
            );
        }

        let mut gone: BTreeSet<RecordKey> = baseline.keys().cloned().collect();
        if let Some(target) = target_keys {
            gone.extend(target.iter().cloned());
        }
        gone.retain(|key| !present.contains_key(key));

        let mut changes: BTreeMap<RecordKey, DetectedChange> = present
            .into_iter()
            .filter(|(_, change)| change.kind != ChangeKind::NoChange)
            .collect();
        for key in gone {
            changes.insert(
                key.clone(),
                DetectedChange {
                    table: descriptor.name.clone(),
                    key,
                    kind: ChangeKind::Delete,
                    old_image: None,
                    new_image: None,
                    source_timestamp: None,
                    source_hash: None,
                },
            );
        }

        Ok(Self {
            pending: changes.into_values().collect(),
            unchanged,
        })
    }

    /// Rows whose hash matched the snapshot.
    pub fn unchanged(&self) -> usize {
        self.unchanged
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Up to `max_records` planned changes. The cursor is carried over
    /// unchanged; only `change_id` advances.
    pub fn next_batch(&mut self, prior: &Watermark, max_records: usize) -> DetectedBatch {
        let take = max_records.min(self.pending.len());
        let changes: Vec<DetectedChange> = self.pending.drain(..take).collect();
        let mut watermark = prior.clone();
        watermark.change_id = prior.change_id + changes.len() as u64;
        watermark.committed_at = Utc::now();
        DetectedBatch { changes, watermark }
    }
}
