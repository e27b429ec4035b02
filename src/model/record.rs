//! Records flowing through the pipeline: detected changes, transformed
//! records, validation verdicts and conflict decisions.

use serde::{Deserialize, Serialize};

use super::{RecordKey, Row};

/// Kind of change observed on the source side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    NoChange,
}

/// A change produced by the Change Detector. Consumed once per batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedChange {
    pub table: String,
    pub key: RecordKey,
    pub kind: ChangeKind,
    /// Last synced source image, when known.
    pub old_image: Option<Row>,
    /// Current source image; `None` for deletes.
    pub new_image: Option<Row>,
    /// Source modification timestamp, if the table has one.
    pub source_timestamp: Option<i64>,
    /// Canonical content hash of `new_image`.
    pub source_hash: Option<String>,
}

/// Mutation applied to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Where a transformed record came from and which rules touched it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_key: Option<RecordKey>,
    pub rules: Vec<String>,
}

/// Why the Transformer flagged a record. The Validator decides severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    /// A sanitization tag rejected the input format.
    SanitizeComplaint,
    /// A non-nullable target column evaluated to null.
    MissingRequired,
    /// A `cast` could not convert the value.
    CastFailed,
    /// A `lookup` had no entry for the key.
    LookupMiss,
    /// The source row carried a column the registry does not know.
    UnknownColumn,
}

/// Transformer remark attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub rule: String,
    pub column: Option<String>,
    pub message: String,
}

/// Output of the Transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub table: String,
    pub key: RecordKey,
    pub payload: Row,
    pub operation: Operation,
    pub provenance: Provenance,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub source_timestamp: Option<i64>,
    pub source_hash: Option<String>,
}

/// Issue severity. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    /// Weight used for the anomaly score.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Info => 0.1,
            Severity::Warn => 0.3,
            Severity::Error => 0.7,
            Severity::Critical => 1.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub severity: Severity,
    pub field: Option<String>,
    pub message: String,
}

/// Per-record validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub key: RecordKey,
    /// True when no issue reaches `error`.
    pub passed: bool,
    pub issues: Vec<ValidationIssue>,
    /// In `[0, 1]`.
    pub anomaly_score: f64,
}

impl ValidationVerdict {
    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    pub fn has_critical(&self) -> bool {
        self.max_severity() == Some(Severity::Critical)
    }
}

/// Which side a conflict decision favours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Source,
    Target,
    Merged,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDecision {
    pub key: RecordKey,
    pub winner: Winner,
    pub rationale: String,
    pub merged: Option<Row>,
    /// The record goes to the manual conflicts queue.
    pub parked: bool,
}

impl ConflictDecision {
    pub fn no_conflict(key: RecordKey) -> Self {
        Self {
            key,
            winner: Winner::Source,
            rationale: "no divergence".to_string(),
            merged: None,
            parked: false,
        }
    }
}
