//! Engine-level error type.
//!
//! Validation and conflict outcomes are data, not errors; only failures that
//! stop a batch or a job surface here.

use crate::connectors::ConnectorError;
use crate::model::{JobId, JobStatus};
use crate::schema::SchemaError;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Schema drift on table '{table}': missing columns {missing:?}")]
    SchemaDrift { table: String, missing: Vec<String> },

    #[error("Transient I/O error: {0}")]
    Transient(String),

    #[error("Validation failure on {table}/{key}: {message}")]
    ValidationFailure {
        table: String,
        key: String,
        message: String,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Connector error: {0}")]
    Connector(ConnectorError),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Lease held for {0}")]
    LeaseHeld(String),

    #[error("No parked conflict for {table}/{key}")]
    ConflictNotFound { table: String, key: String },

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Export failed: {0}")]
    Export(String),
}

impl SyncError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transient(_) => true,
            SyncError::Storage(e) => e.is_transient(),
            SyncError::Connector(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short kind label used in job error records and events.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) | SyncError::Schema(_) => "config",
            SyncError::SchemaDrift { .. } => "schema_drift",
            SyncError::Transient(_) => "transient",
            SyncError::ValidationFailure { .. } => "validation_failure",
            SyncError::ConstraintViolation(_) => "constraint_violation",
            SyncError::Invariant(_) => "invariant",
            SyncError::Storage(e) if e.is_transient() => "transient",
            SyncError::Storage(StorageError::ConstraintViolation(_)) => "constraint_violation",
            SyncError::Storage(StorageError::Invariant(_)) => "invariant",
            SyncError::Storage(_) => "storage",
            SyncError::Connector(e) if e.is_transient() => "transient",
            SyncError::Connector(_) => "connector",
            SyncError::JobNotFound(_) => "job_not_found",
            SyncError::InvalidTransition { .. } => "invalid_transition",
            SyncError::LeaseHeld(_) => "lease_held",
            SyncError::ConflictNotFound { .. } => "conflict_not_found",
            SyncError::Rollback(_) => "rollback",
            SyncError::Export(_) => "export",
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ConstraintViolation(msg) => SyncError::ConstraintViolation(msg),
            rejected @ StorageError::RowRejected { .. } => {
                SyncError::ConstraintViolation(rejected.to_string())
            }
            StorageError::Invariant(msg) => SyncError::Invariant(msg),
            StorageError::LeaseHeld(what) => SyncError::LeaseHeld(what),
            other => SyncError::Storage(other),
        }
    }
}

impl From<ConnectorError> for SyncError {
    fn from(e: ConnectorError) -> Self {
        SyncError::Connector(e)
    }
}
