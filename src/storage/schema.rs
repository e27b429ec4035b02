//! SQLite schema definitions using sea-query.
//!
//! Target rows are stored generically, one JSON payload per `(table, key)`,
//! so any table the schema registry declares can be persisted without DDL.

use sea_query::Iden;

/// Target rows.
#[derive(Clone, Copy, Iden)]
pub enum SyncRows {
    Table,
    #[iden = "table_name"]
    TableName,
    #[iden = "row_key"]
    RowKey,
    #[iden = "payload"]
    Payload,
}

/// Append-only audit log.
#[derive(Clone, Copy, Iden)]
pub enum AuditLog {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "job_id"]
    JobId,
    #[iden = "table_name"]
    TableName,
    #[iden = "row_key"]
    RowKey,
    #[iden = "operation"]
    Operation,
    #[iden = "pre_image"]
    PreImage,
    #[iden = "post_image"]
    PostImage,
    #[iden = "applied_at"]
    AppliedAt,
    #[iden = "actor"]
    Actor,
    #[iden = "reversed_by"]
    ReversedBy,
    #[iden = "compensates"]
    Compensates,
    #[iden = "annotations"]
    Annotations,
}

#[derive(Clone, Copy, Iden)]
pub enum Watermarks {
    Table,
    #[iden = "pipeline"]
    Pipeline,
    #[iden = "table_name"]
    TableName,
    #[iden = "data"]
    Data,
}

#[derive(Clone, Copy, Iden)]
pub enum KeyStates {
    Table,
    #[iden = "pipeline"]
    Pipeline,
    #[iden = "table_name"]
    TableName,
    #[iden = "row_key"]
    RowKey,
    #[iden = "data"]
    Data,
}

#[derive(Clone, Copy, Iden)]
pub enum DeadLetters {
    Table,
    #[iden = "job_id"]
    JobId,
    #[iden = "table_name"]
    TableName,
    #[iden = "row_key"]
    RowKey,
    #[iden = "data"]
    Data,
}

#[derive(Clone, Copy, Iden)]
pub enum ParkedConflicts {
    Table,
    #[iden = "table_name"]
    TableName,
    #[iden = "row_key"]
    RowKey,
    #[iden = "data"]
    Data,
}

#[derive(Clone, Copy, Iden)]
pub enum Compacted {
    Table,
    #[iden = "table_name"]
    TableName,
    #[iden = "row_key"]
    RowKey,
    #[iden = "data"]
    Data,
}

#[derive(Clone, Copy, Iden)]
pub enum Jobs {
    Table,
    #[iden = "job_id"]
    JobId,
    #[iden = "submitted_at"]
    SubmittedAt,
    #[iden = "data"]
    Data,
}

/// One row per holder, so shared leases can have several.
#[derive(Clone, Copy, Iden)]
pub enum LeaseHolders {
    Table,
    #[iden = "resource"]
    Resource,
    #[iden = "holder"]
    Holder,
    #[iden = "mode"]
    Mode,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// Applied store layout versions. Migrations only add tables; version 2
/// moved leases to `lease_holders`.
#[derive(Clone, Copy, Iden)]
pub enum SchemaVersion {
    Table,
    #[iden = "version"]
    Version,
    #[iden = "applied_at"]
    AppliedAt,
}

/// SQL for creating every store table.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sync_rows (
    table_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (table_name, row_key)
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT,
    table_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    operation TEXT NOT NULL,
    pre_image TEXT,
    post_image TEXT,
    applied_at TEXT NOT NULL,
    actor TEXT NOT NULL,
    reversed_by INTEGER,
    compensates INTEGER,
    annotations TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_audit_table_key ON audit_log(table_name, row_key);
CREATE INDEX IF NOT EXISTS idx_audit_job ON audit_log(job_id);

CREATE TABLE IF NOT EXISTS watermarks (
    pipeline TEXT NOT NULL,
    table_name TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (pipeline, table_name)
);

CREATE TABLE IF NOT EXISTS key_states (
    pipeline TEXT NOT NULL,
    table_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (pipeline, table_name, row_key)
);

CREATE TABLE IF NOT EXISTS dead_letters (
    job_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (job_id, table_name, row_key)
);

CREATE TABLE IF NOT EXISTS parked_conflicts (
    table_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (table_name, row_key)
);

CREATE TABLE IF NOT EXISTS compacted (
    table_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (table_name, row_key)
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    submitted_at TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lease_holders (
    resource TEXT NOT NULL,
    holder TEXT NOT NULL,
    mode TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    PRIMARY KEY (resource, holder)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;
