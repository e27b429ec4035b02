//! Core entities shared by every stage of the sync pipeline.

use std::collections::BTreeMap;

use serde_json::Value;

pub mod audit;
pub mod job;
pub mod key;
pub mod record;

pub use audit::{Actor, AuditEntry, AuditId, NewAuditEntry, Watermark};
pub use job::{
    DriftInfo, JobCounters, JobError, JobId, JobMode, JobState, JobStatus, PreservedBatch,
    TablePhase, TableProgress,
};
pub use key::{Cursor, KeyPart, RecordKey};
pub use record::{
    Annotation, AnnotationKind, ChangeKind, ConflictDecision, DetectedChange, Operation,
    Provenance, Severity, TransformedRecord, ValidationIssue, ValidationVerdict, Winner,
};

/// A record as `column -> value`. Ordered so that canonical hashing and
/// exports are deterministic.
pub type Row = BTreeMap<String, Value>;
