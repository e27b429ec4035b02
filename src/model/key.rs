//! Record keys and composite cursors.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Row;

/// One component of a primary key.
///
/// Integers sort before text so that numeric parcel ids keep their natural
/// order (`2 < 10`) regardless of how the source renders them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Text(String),
}

impl KeyPart {
    /// Convert a JSON value into a key part. Nulls, arrays and objects are not keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(KeyPart::Int(i)),
                None => Some(KeyPart::Text(n.to_string())),
            },
            Value::String(s) => Some(KeyPart::Text(s.clone())),
            Value::Bool(b) => Some(KeyPart::Text(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            KeyPart::Int(i) => Value::from(*i),
            KeyPart::Text(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Primary key of a record, one part per primary-key column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(pub Vec<KeyPart>);

impl RecordKey {
    pub fn int(id: i64) -> Self {
        Self(vec![KeyPart::Int(id)])
    }

    pub fn text(id: impl Into<String>) -> Self {
        Self(vec![KeyPart::Text(id.into())])
    }

    /// Extract the key of `row` for the given primary-key columns.
    ///
    /// Returns `None` if any key column is missing or not a scalar.
    pub fn from_row(row: &Row, primary_key: &[String]) -> Option<Self> {
        primary_key
            .iter()
            .map(|col| row.get(col).and_then(KeyPart::from_value))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Render the key back into `column -> value` form.
    pub fn to_row(&self, primary_key: &[String]) -> Row {
        primary_key
            .iter()
            .zip(self.0.iter())
            .map(|(col, part)| (col.clone(), part.to_value()))
            .collect()
    }

    /// Stable string encoding used as a storage key.
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        serde_json::from_str::<Vec<KeyPart>>(encoded).ok().map(Self)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

/// Composite `(timestamp, key)` cursor for timestamp-watermark detection.
///
/// Ordering is by timestamp first, then key; a cursor without a key sorts
/// before every keyed cursor at the same timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Cursor {
    pub timestamp: i64,
    pub key: Option<RecordKey>,
}

impl Cursor {
    pub fn new(timestamp: i64, key: RecordKey) -> Self {
        Self {
            timestamp,
            key: Some(key),
        }
    }

    /// Cursor positioned before everything with a timestamp greater than `timestamp`.
    ///
    /// Rows with exactly this timestamp are considered already synced.
    pub fn at_timestamp(timestamp: i64) -> Self {
        Self {
            timestamp,
            key: None,
        }
    }

    /// Whether a row at `(timestamp, key)` lies strictly past this cursor.
    ///
    /// A keyless cursor excludes every row at its timestamp.
    pub fn admits(&self, timestamp: i64, key: &RecordKey) -> bool {
        match timestamp.cmp(&self.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match &self.key {
                Some(k) => key > k,
                None => false,
            },
        }
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(k) => write!(f, "({}, {})", self.timestamp, k),
            None => write!(f, "({}, -)", self.timestamp),
        }
    }
}
