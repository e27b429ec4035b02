//! Timestamp-watermark detection.
//!
//! The main table and the optional tombstone table are scanned as two
//! ordered streams and merged by `(timestamp, key)`. An item is only taken
//! once every other live stream has been read at least that far, so a
//! delete never overtakes an earlier re-insert of the same key.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use tracing::warn;

use super::{
    is_truthy, source_hash, timed, timestamp_value, BatchLimits, DetectedBatch, KeyStates,
};
use crate::config::DeleteDetection;
use crate::connectors::{ConnectorError, ScanPage, ScanSpec, SourceConnector};
use crate::model::{ChangeKind, Cursor, DetectedChange, RecordKey, Row, Watermark};
use crate::schema::TableDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Origin {
    Main,
    Tombstone,
}

#[derive(Debug)]
struct Observed {
    position: Cursor,
    origin: Origin,
    key: RecordKey,
    row: Row,
}

/// Per-stream scan state within one batch.
struct Stream {
    origin: Origin,
    cursor: Cursor,
    done: bool,
}

#[derive(Debug, Clone)]
pub struct TimestampDetector {
    table: String,
    source_table: String,
    spec: ScanSpec,
    soft_delete: Option<String>,
    tombstones: Option<String>,
}

impl TimestampDetector {
    /// `None` when the table has no modification-time column.
    pub fn for_table(descriptor: &TableDescriptor) -> Option<Self> {
        let timestamp_column = descriptor.last_modified.clone()?;
        let (soft_delete, tombstones) = match &descriptor.deletes {
            DeleteDetection::SoftDelete { column } => (Some(column.clone()), None),
            DeleteDetection::Tombstone { table } => (None, Some(table.clone())),
            DeleteDetection::None => (None, None),
        };
        Some(Self {
            table: descriptor.name.clone(),
            source_table: descriptor.source_name.clone(),
            spec: ScanSpec {
                timestamp_column,
                primary_key: descriptor.primary_key.clone(),
            },
            soft_delete,
            tombstones,
        })
    }

    /// Next batch strictly past `prior`. An empty batch means the table is
    /// drained.
    pub async fn next_batch(
        &self,
        source: &dyn SourceConnector,
        prior: &Watermark,
        states: &KeyStates,
        limits: BatchLimits,
    ) -> Result<DetectedBatch, ConnectorError> {
        let started = Instant::now();
        let mut streams = vec![Stream {
            origin: Origin::Main,
            cursor: prior.cursor.clone(),
            done: false,
        }];
        if self.tombstones.is_some() {
            streams.push(Stream {
                origin: Origin::Tombstone,
                cursor: prior
                    .tombstone_cursor
                    .clone()
                    .unwrap_or_else(|| Cursor::at_timestamp(i64::MIN)),
                done: false,
            });
        }

        let mut taken: Vec<Observed> = Vec::new();
        while taken.len() < limits.max_records && streams.iter().any(|s| !s.done) {
            if !taken.is_empty() && started.elapsed() >= limits.max_elapsed {
                break;
            }
            let remaining = limits.max_records - taken.len();

            let mut pages: Vec<(Origin, ScanPage)> = Vec::new();
            for stream in streams.iter_mut().filter(|s| !s.done) {
                let table = match stream.origin {
                    Origin::Main => self.source_table.as_str(),
                    Origin::Tombstone => self.tombstones.as_deref().unwrap_or_default(),
                };
                let page = timed(
                    limits.call_timeout,
                    "scan",
                    source.scan(table, &self.spec, &stream.cursor, remaining),
                )
                .await?;
                if page.rows.is_empty() {
                    stream.done = true;
                } else {
                    pages.push((stream.origin, page));
                }
            }
            if pages.is_empty() {
                break;
            }

            // Everything at or before the frontier is known for every live stream.
            let frontier = pages
                .iter()
                .filter_map(|(_, page)| page.next_cursor.clone())
                .min();

            let mut round: Vec<Observed> = Vec::new();
            for (origin, page) in &pages {
                for row in &page.rows {
                    match self.observe(*origin, row) {
                        Some(observed) => round.push(observed),
                        None => warn!(
                            table = %self.table,
                            "Skipping source row without key or timestamp"
                        ),
                    }
                }
            }
            round.retain(|o| frontier.as_ref().map_or(true, |f| &o.position <= f));
            round.sort_by(|a, b| (&a.position, a.origin).cmp(&(&b.position, b.origin)));
            let truncated = round.len() > remaining;
            round.truncate(remaining);

            for stream in streams.iter_mut() {
                let Some((_, page)) = pages.iter().find(|(o, _)| *o == stream.origin) else {
                    continue;
                };
                let last_taken = round
                    .iter()
                    .rev()
                    .find(|o| o.origin == stream.origin)
                    .map(|o| o.position.clone());
                let fully_consumed = !truncated
                    && page.next_cursor.is_some()
                    && page.next_cursor <= frontier;
                if fully_consumed {
                    if let Some(next) = &page.next_cursor {
                        stream.cursor = next.clone();
                    }
                } else if let Some(position) = last_taken {
                    stream.cursor = position;
                }
            }
            taken.extend(round);
        }

        let mut latest: BTreeMap<RecordKey, Observed> = BTreeMap::new();
        for observed in taken {
            match latest.get(&observed.key) {
                Some(existing)
                    if (&existing.position, existing.origin)
                        > (&observed.position, observed.origin) => {}
                _ => {
                    latest.insert(observed.key.clone(), observed);
                }
            }
        }

        let changes: Vec<DetectedChange> = latest
            .into_values()
            .map(|observed| self.classify(observed, states))
            .collect();

        let mut watermark = prior.clone();
        for stream in &streams {
            match stream.origin {
                Origin::Main => watermark.cursor = stream.cursor.clone(),
                Origin::Tombstone => watermark.tombstone_cursor = Some(stream.cursor.clone()),
            }
        }
        watermark.change_id = prior.change_id + changes.len() as u64;
        watermark.committed_at = Utc::now();

        Ok(DetectedBatch { changes, watermark })
    }

    fn observe(&self, origin: Origin, row: &Row) -> Option<Observed> {
        let key = RecordKey::from_row(row, &self.spec.primary_key)?;
        let timestamp = timestamp_value(row.get(&self.spec.timestamp_column)?)?;
        Some(Observed {
            position: Cursor::new(timestamp, key.clone()),
            origin,
            key,
            row: row.clone(),
        })
    }

    fn classify(&self, observed: Observed, states: &KeyStates) -> DetectedChange {
        let timestamp = Some(observed.position.timestamp);
        let deleted = observed.origin == Origin::Tombstone
            || self
                .soft_delete
                .as_ref()
                .and_then(|column| observed.row.get(column))
                .is_some_and(is_truthy);

        if deleted {
            return DetectedChange {
                table: self.table.clone(),
                key: observed.key,
                kind: ChangeKind::Delete,
                old_image: None,
                new_image: None,
                source_timestamp: timestamp,
                source_hash: None,
            };
        }

        let hash = source_hash(&observed.row, Some(&self.spec.timestamp_column));
        let kind = match states.get(&observed.key) {
            Some(state) if state.source_hash == hash => ChangeKind::NoChange,
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        DetectedChange {
            table: self.table.clone(),
            key: observed.key,
            kind,
            old_image: None,
            new_image: Some(observed.row),
            source_timestamp: timestamp,
            source_hash: Some(hash),
        }
    }
}
