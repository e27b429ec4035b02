//! Change Detector.
//!
//! Produces batches of [`DetectedChange`] for one table, in primary-key
//! order, together with the watermark the batch would commit. Two
//! strategies exist:
//!
//! - [`TimestampDetector`]: ordered scans past a `(timestamp, key)` cursor,
//!   with deletes from a soft-delete column or a tombstone table.
//! - [`ContentHashDetector`]: full read, canonical row hashes diffed against
//!   the stored `{key -> hash}` snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::connectors::ConnectorError;
use crate::model::{DetectedChange, RecordKey, Row, Watermark};
pub use crate::storage::KeyState;

pub mod content_hash;
pub mod timestamp;

pub use content_hash::ContentHashDetector;
pub use timestamp::TimestampDetector;

/// One batch of changes plus the watermark that commits it.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedBatch {
    pub changes: Vec<DetectedChange>,
    pub watermark: Watermark,
}

impl DetectedBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Batch bounds.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_elapsed: Duration,
    /// Per source call.
    pub call_timeout: Duration,
}

/// Either strategy, chosen per table.
#[derive(Debug)]
pub enum TableDetector {
    Timestamp(TimestampDetector),
    ContentHash(ContentHashDetector),
}

/// Stored snapshot of a table: last synced hashes per key.
pub type KeyStates = BTreeMap<RecordKey, KeyState>;

/// SHA-256 over the canonical JSON form of `row`. Column order is fixed by
/// the ordered map, so equal rows always hash equal.
pub fn content_hash(row: &Row) -> String {
    let mut hasher = Sha256::new();
    match serde_json::to_vec(row) {
        Ok(bytes) => hasher.update(&bytes),
        Err(_) => hasher.update(format!("{:?}", row).as_bytes()),
    }
    hex::encode(hasher.finalize())
}

/// Hash of a source row, ignoring the modification-time column so that a
/// touched-but-unchanged row reads as no-change.
pub fn source_hash(row: &Row, last_modified: Option<&str>) -> String {
    match last_modified {
        Some(column) if row.contains_key(column) => {
            let mut trimmed = row.clone();
            trimmed.remove(column);
            content_hash(&trimmed)
        }
        _ => content_hash(row),
    }
}

/// Last-modified value as epoch seconds: an integer, a float (truncated) or
/// a numeric string.
pub fn timestamp_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Soft-delete flag semantics: true, non-zero, or a yes-like string.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "y" | "yes" | "1"
        ),
        _ => false,
    }
}

/// Bound a single source call by `timeout`; elapsing counts as transient.
pub(crate) async fn timed<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T, ConnectorError>
where
    F: std::future::Future<Output = Result<T, ConnectorError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout(format!("{} exceeded {:?}", op, timeout))),
    }
}
