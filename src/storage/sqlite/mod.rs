//! SQLite implementation of [`SyncStore`].
//!
//! Every commit runs inside one `BEGIN IMMEDIATE` transaction on a single
//! pooled connection.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row as _, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::constraints::{orphan, referenced, Reference};
use super::schema::{
    AuditLog, Compacted, DeadLetters, Jobs, KeyStates, LeaseHolders, ParkedConflicts, SchemaVersion,
    SyncRows, Watermarks, CREATE_TABLES,
};
use super::{
    check_write_set, grant_lease, AuditFilter, CompactedSnapshot, Constraints, KeyState, Lease,
    LeaseGrant, LeaseMode, Result, RowWrite, StorageError, SyncStore, WriteSet,
    STORE_SCHEMA_VERSION,
};
use crate::dlq::DeadLetter;
use crate::model::{
    AuditEntry, AuditId, JobId, JobState, NewAuditEntry, Operation, RecordKey, Row, Watermark,
};
use crate::resolve::ParkedConflict;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    constraints: Constraints,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, constraints: Constraints) -> Self {
        Self { pool, constraints }
    }

    /// Open (creating if needed) the database at `path` and initialize it.
    pub async fn open(path: &str, constraints: Constraints) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Transient(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::new(pool, constraints);
        store.init().await?;
        Ok(store)
    }

    /// Create tables and record the layout version.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TABLES).execute(&self.pool).await?;

        let query = Query::insert()
            .into_table(SchemaVersion::Table)
            .columns([SchemaVersion::Version, SchemaVersion::AppliedAt])
            .values_panic([STORE_SCHEMA_VERSION.into(), format_time(&Utc::now()).into()])
            .on_conflict(OnConflict::column(SchemaVersion::Version).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&self.pool).await?;

        info!("SQLite store initialized (layout v{})", STORE_SCHEMA_VERSION);
        Ok(())
    }

    /// Highest applied layout version.
    pub async fn schema_version(&self) -> Result<Option<i64>> {
        let query = Query::select()
            .expr(Expr::col(SchemaVersion::Version).max())
            .from(SchemaVersion::Table)
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.and_then(|r| r.get::<Option<i64>, _>(0)))
    }

    async fn commit_now(&self, writes: WriteSet) -> Result<Vec<AuditEntry>> {
        // BEGIN IMMEDIATE takes the write lock upfront so concurrent commits
        // queue instead of failing to upgrade a shared lock.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match self.apply(&mut conn, writes).await {
            Ok(appended) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(appended)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn claim_now(&self, request: Lease, now: DateTime<Utc>) -> Result<LeaseGrant> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        match claim_lease(&mut conn, request, now).await {
            Ok(grant) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(grant)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn fetch_data<T: DeserializeOwned>(&self, select: SelectStatement) -> Result<Vec<T>> {
        let query = select.to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("data"))?))
            .collect()
    }

    async fn exists(&self, conn: &mut SqliteConnection, reference: &Reference) -> Result<bool> {
        if let Some(key) = &reference.key {
            return Ok(read_row(conn, &reference.table, key).await?.is_some());
        }
        let query = Query::select()
            .column(SyncRows::Payload)
            .from(SyncRows::Table)
            .and_where(Expr::col(SyncRows::TableName).eq(reference.table.as_str()))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
        for row in rows {
            let payload: Row = serde_json::from_str(&row.get::<String, _>("payload"))?;
            if reference.matches(&payload) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn apply(&self, conn: &mut SqliteConnection, writes: WriteSet) -> Result<Vec<AuditEntry>> {
        for write in &writes.rows {
            match write {
                RowWrite::Upsert { table, key, row } => {
                    self.constraints.check_key(table, key, row)?;
                    for parent in self.constraints.parent_references(table, row) {
                        if !self.exists(conn, &parent).await? {
                            return Err(orphan(table, key, &parent));
                        }
                    }
                    let query = Query::insert()
                        .into_table(SyncRows::Table)
                        .columns([SyncRows::TableName, SyncRows::RowKey, SyncRows::Payload])
                        .values_panic([
                            table.as_str().into(),
                            key.encode().into(),
                            serde_json::to_string(row)?.into(),
                        ])
                        .on_conflict(
                            OnConflict::columns([SyncRows::TableName, SyncRows::RowKey])
                                .update_column(SyncRows::Payload)
                                .to_owned(),
                        )
                        .to_string(SqliteQueryBuilder);
                    sqlx::query(&query).execute(&mut *conn).await?;
                }
                RowWrite::Delete { table, key } => {
                    let Some(current) = read_row(conn, table, key).await? else {
                        continue;
                    };
                    for child in self.constraints.child_references(table, &current) {
                        if self.exists(conn, &child).await? {
                            return Err(referenced(table, key, &child));
                        }
                    }
                    let query = Query::delete()
                        .from_table(SyncRows::Table)
                        .and_where(Expr::col(SyncRows::TableName).eq(table.as_str()))
                        .and_where(Expr::col(SyncRows::RowKey).eq(key.encode()))
                        .to_string(SqliteQueryBuilder);
                    sqlx::query(&query).execute(&mut *conn).await?;
                }
            }
        }

        let mut appended = Vec::with_capacity(writes.audit.len());
        for entry in writes.audit {
            appended.push(append_audit(conn, entry).await?);
        }

        let now = Utc::now();
        for mut watermark in writes.watermarks {
            let query = Query::select()
                .column(Watermarks::Data)
                .from(Watermarks::Table)
                .and_where(Expr::col(Watermarks::Pipeline).eq(writes.pipeline.as_str()))
                .and_where(Expr::col(Watermarks::TableName).eq(watermark.table.as_str()))
                .to_string(SqliteQueryBuilder);
            if let Some(row) = sqlx::query(&query).fetch_optional(&mut *conn).await? {
                let prior: Watermark = serde_json::from_str(&row.get::<String, _>("data"))?;
                if watermark.regresses_from(&prior) {
                    return Err(StorageError::Invariant(format!(
                        "watermark for {} would regress from {} to {}",
                        watermark.table, prior.cursor, watermark.cursor
                    )));
                }
            }
            watermark.committed_at = now;
            let query = Query::insert()
                .into_table(Watermarks::Table)
                .columns([Watermarks::Pipeline, Watermarks::TableName, Watermarks::Data])
                .values_panic([
                    writes.pipeline.as_str().into(),
                    watermark.table.as_str().into(),
                    serde_json::to_string(&watermark)?.into(),
                ])
                .on_conflict(
                    OnConflict::columns([Watermarks::Pipeline, Watermarks::TableName])
                        .update_column(Watermarks::Data)
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        for (table, key, state) in writes.key_states {
            let query = match state {
                Some(state) => Query::insert()
                    .into_table(KeyStates::Table)
                    .columns([
                        KeyStates::Pipeline,
                        KeyStates::TableName,
                        KeyStates::RowKey,
                        KeyStates::Data,
                    ])
                    .values_panic([
                        writes.pipeline.as_str().into(),
                        table.into(),
                        key.encode().into(),
                        serde_json::to_string(&state)?.into(),
                    ])
                    .on_conflict(
                        OnConflict::columns([
                            KeyStates::Pipeline,
                            KeyStates::TableName,
                            KeyStates::RowKey,
                        ])
                        .update_column(KeyStates::Data)
                        .to_owned(),
                    )
                    .to_string(SqliteQueryBuilder),
                None => Query::delete()
                    .from_table(KeyStates::Table)
                    .and_where(Expr::col(KeyStates::Pipeline).eq(writes.pipeline.as_str()))
                    .and_where(Expr::col(KeyStates::TableName).eq(table))
                    .and_where(Expr::col(KeyStates::RowKey).eq(key.encode()))
                    .to_string(SqliteQueryBuilder),
            };
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        for (job_id, table, key) in writes.resolved_dead_letters {
            let query = Query::delete()
                .from_table(DeadLetters::Table)
                .and_where(Expr::col(DeadLetters::JobId).eq(job_id.to_string()))
                .and_where(Expr::col(DeadLetters::TableName).eq(table))
                .and_where(Expr::col(DeadLetters::RowKey).eq(key.encode()))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }
        for letter in writes.dead_letters {
            let query = Query::insert()
                .into_table(DeadLetters::Table)
                .columns([
                    DeadLetters::JobId,
                    DeadLetters::TableName,
                    DeadLetters::RowKey,
                    DeadLetters::Data,
                ])
                .values_panic([
                    letter.job_id.to_string().into(),
                    letter.table.as_str().into(),
                    letter.key.encode().into(),
                    serde_json::to_string(&letter)?.into(),
                ])
                .on_conflict(
                    OnConflict::columns([
                        DeadLetters::JobId,
                        DeadLetters::TableName,
                        DeadLetters::RowKey,
                    ])
                    .update_column(DeadLetters::Data)
                    .to_owned(),
                )
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        for (table, key) in writes.cleared_conflicts {
            let query = Query::delete()
                .from_table(ParkedConflicts::Table)
                .and_where(Expr::col(ParkedConflicts::TableName).eq(table))
                .and_where(Expr::col(ParkedConflicts::RowKey).eq(key.encode()))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }
        for conflict in writes.parked {
            upsert_keyed(
                conn,
                ParkedConflicts::Table,
                [ParkedConflicts::TableName, ParkedConflicts::RowKey, ParkedConflicts::Data],
                &conflict.table,
                &conflict.key,
                &conflict,
            )
            .await?;
        }

        for snapshot in writes.compacted {
            upsert_keyed(
                conn,
                Compacted::Table,
                [Compacted::TableName, Compacted::RowKey, Compacted::Data],
                &snapshot.table,
                &snapshot.key,
                &snapshot,
            )
            .await?;
        }
        if !writes.pruned_audit.is_empty() {
            let ids: Vec<i64> = writes.pruned_audit.iter().map(|id| *id as i64).collect();
            let query = Query::delete()
                .from_table(AuditLog::Table)
                .and_where(Expr::col(AuditLog::Id).is_in(ids))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        if let Some(job) = writes.job {
            let query = Query::insert()
                .into_table(Jobs::Table)
                .columns([Jobs::JobId, Jobs::SubmittedAt, Jobs::Data])
                .values_panic([
                    job.id.to_string().into(),
                    format_time(&job.submitted_at).into(),
                    serde_json::to_string(&job)?.into(),
                ])
                .on_conflict(
                    OnConflict::column(Jobs::JobId)
                        .update_column(Jobs::Data)
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        Ok(appended)
    }
}

async fn held_leases(conn: &mut SqliteConnection, resource: &str) -> Result<Vec<Lease>> {
    let query = Query::select()
        .columns([LeaseHolders::Holder, LeaseHolders::Mode, LeaseHolders::ExpiresAt])
        .from(LeaseHolders::Table)
        .and_where(Expr::col(LeaseHolders::Resource).eq(resource))
        .to_string(SqliteQueryBuilder);
    let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            let mode: String = row.get("mode");
            Ok(Lease {
                resource: resource.to_string(),
                holder: row.get("holder"),
                mode: LeaseMode::parse(&mode)
                    .ok_or_else(|| StorageError::Invariant(format!("bad lease mode '{}'", mode)))?,
                expires_at: parse_time(&row.get::<String, _>("expires_at"))?,
            })
        })
        .collect()
}

async fn claim_lease(conn: &mut SqliteConnection, request: Lease, now: DateTime<Utc>) -> Result<LeaseGrant> {
    let held = held_leases(conn, &request.resource).await?;
    let grant = grant_lease(&held, request, now)?;
    let lease = &grant.lease;

    if !grant.expired.is_empty() {
        let query = Query::delete()
            .from_table(LeaseHolders::Table)
            .and_where(Expr::col(LeaseHolders::Resource).eq(lease.resource.as_str()))
            .and_where(Expr::col(LeaseHolders::Holder).is_in(grant.expired.iter().map(String::as_str)))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;
    }

    let query = Query::insert()
        .into_table(LeaseHolders::Table)
        .columns([
            LeaseHolders::Resource,
            LeaseHolders::Holder,
            LeaseHolders::Mode,
            LeaseHolders::ExpiresAt,
        ])
        .values_panic([
            lease.resource.as_str().into(),
            lease.holder.as_str().into(),
            lease.mode.as_str().into(),
            format_time(&lease.expires_at).into(),
        ])
        .on_conflict(
            OnConflict::columns([LeaseHolders::Resource, LeaseHolders::Holder])
                .update_columns([LeaseHolders::Mode, LeaseHolders::ExpiresAt])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder);
    sqlx::query(&query).execute(&mut *conn).await?;
    Ok(grant)
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Invariant(format!("bad timestamp '{}': {}", s, e)))
}

fn decode_key(encoded: &str) -> Result<RecordKey> {
    RecordKey::decode(encoded)
        .ok_or_else(|| StorageError::Invariant(format!("bad row key '{}'", encoded)))
}

async fn read_row(conn: &mut SqliteConnection, table: &str, key: &RecordKey) -> Result<Option<Row>> {
    let query = Query::select()
        .column(SyncRows::Payload)
        .from(SyncRows::Table)
        .and_where(Expr::col(SyncRows::TableName).eq(table))
        .and_where(Expr::col(SyncRows::RowKey).eq(key.encode()))
        .to_string(SqliteQueryBuilder);
    match sqlx::query(&query).fetch_optional(&mut *conn).await? {
        Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("payload"))?)),
        None => Ok(None),
    }
}

async fn upsert_keyed<T, I>(
    conn: &mut SqliteConnection,
    table: T,
    columns: [I; 3],
    table_name: &str,
    key: &RecordKey,
    data: &impl Serialize,
) -> Result<()>
where
    T: sea_query::IntoIden + 'static,
    I: sea_query::IntoIden + Clone + 'static,
{
    let [name_col, key_col, data_col] = columns;
    let query = Query::insert()
        .into_table(table)
        .columns([name_col.clone(), key_col.clone(), data_col.clone()])
        .values_panic([
            table_name.into(),
            key.encode().into(),
            serde_json::to_string(data)?.into(),
        ])
        .on_conflict(
            OnConflict::columns([name_col, key_col])
                .update_column(data_col)
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder);
    sqlx::query(&query).execute(&mut *conn).await?;
    Ok(())
}

async fn append_audit(conn: &mut SqliteConnection, entry: NewAuditEntry) -> Result<AuditEntry> {
    if let Some(target) = entry.compensates {
        let query = Query::select()
            .column(AuditLog::ReversedBy)
            .from(AuditLog::Table)
            .and_where(Expr::col(AuditLog::Id).eq(target as i64))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                StorageError::Invariant(format!("compensated audit entry {} not found", target))
            })?;
        if let Some(by) = row.get::<Option<i64>, _>(0) {
            return Err(StorageError::Invariant(format!(
                "audit entry {} already reversed by {}",
                target, by
            )));
        }
    }

    let pre_image = entry.pre_image.as_ref().map(serde_json::to_string).transpose()?;
    let post_image = entry.post_image.as_ref().map(serde_json::to_string).transpose()?;
    let query = Query::insert()
        .into_table(AuditLog::Table)
        .columns([
            AuditLog::JobId,
            AuditLog::TableName,
            AuditLog::RowKey,
            AuditLog::Operation,
            AuditLog::PreImage,
            AuditLog::PostImage,
            AuditLog::AppliedAt,
            AuditLog::Actor,
            AuditLog::Compensates,
            AuditLog::Annotations,
        ])
        .values_panic([
            entry.job_id.map(|j| j.to_string()).into(),
            entry.table.as_str().into(),
            entry.key.encode().into(),
            entry.operation.as_str().into(),
            pre_image.into(),
            post_image.into(),
            format_time(&entry.applied_at).into(),
            serde_json::to_string(&entry.actor)?.into(),
            entry.compensates.map(|id| id as i64).into(),
            serde_json::to_string(&entry.annotations)?.into(),
        ])
        .to_string(SqliteQueryBuilder);
    let id = sqlx::query(&query).execute(&mut *conn).await?.last_insert_rowid() as AuditId;

    if let Some(target) = entry.compensates {
        let query = Query::update()
            .table(AuditLog::Table)
            .value(AuditLog::ReversedBy, id as i64)
            .and_where(Expr::col(AuditLog::Id).eq(target as i64))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;
    }

    debug!(id, table = %entry.table, key = %entry.key, "Audit entry appended");
    Ok(entry.into_entry(id))
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let job_id = match row.get::<Option<String>, _>("job_id") {
        Some(s) => Some(JobId(Uuid::parse_str(&s).map_err(|e| {
            StorageError::Invariant(format!("bad job id '{}': {}", s, e))
        })?)),
        None => None,
    };
    let operation: String = row.get("operation");
    let image = |column: &str| -> Result<Option<Row>> {
        row.get::<Option<String>, _>(column)
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(StorageError::from)
    };
    Ok(AuditEntry {
        id: row.get::<i64, _>("id") as AuditId,
        job_id,
        table: row.get("table_name"),
        key: decode_key(&row.get::<String, _>("row_key"))?,
        operation: Operation::parse(&operation)
            .ok_or_else(|| StorageError::Invariant(format!("bad operation '{}'", operation)))?,
        pre_image: image("pre_image")?,
        post_image: image("post_image")?,
        applied_at: parse_time(&row.get::<String, _>("applied_at"))?,
        actor: serde_json::from_str(&row.get::<String, _>("actor"))?,
        reversed_by: row.get::<Option<i64>, _>("reversed_by").map(|id| id as AuditId),
        compensates: row.get::<Option<i64>, _>("compensates").map(|id| id as AuditId),
        annotations: serde_json::from_str(&row.get::<String, _>("annotations"))?,
    })
}

fn audit_select() -> SelectStatement {
    Query::select()
        .columns([
            AuditLog::Id,
            AuditLog::JobId,
            AuditLog::TableName,
            AuditLog::RowKey,
            AuditLog::Operation,
            AuditLog::PreImage,
            AuditLog::PostImage,
            AuditLog::AppliedAt,
            AuditLog::Actor,
            AuditLog::ReversedBy,
            AuditLog::Compensates,
            AuditLog::Annotations,
        ])
        .from(AuditLog::Table)
        .to_owned()
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn read_current(&self, table: &str, keys: &[RecordKey]) -> Result<BTreeMap<RecordKey, Row>> {
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        let encoded: Vec<String> = keys.iter().map(RecordKey::encode).collect();
        let query = Query::select()
            .columns([SyncRows::RowKey, SyncRows::Payload])
            .from(SyncRows::Table)
            .and_where(Expr::col(SyncRows::TableName).eq(table))
            .and_where(Expr::col(SyncRows::RowKey).is_in(encoded))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok((
                    decode_key(&row.get::<String, _>("row_key"))?,
                    serde_json::from_str(&row.get::<String, _>("payload"))?,
                ))
            })
            .collect()
    }

    async fn scan_rows(&self, table: &str) -> Result<Vec<(RecordKey, Row)>> {
        let query = Query::select()
            .columns([SyncRows::RowKey, SyncRows::Payload])
            .from(SyncRows::Table)
            .and_where(Expr::col(SyncRows::TableName).eq(table))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut out = rows
            .iter()
            .map(|row| {
                Ok((
                    decode_key(&row.get::<String, _>("row_key"))?,
                    serde_json::from_str(&row.get::<String, _>("payload"))?,
                ))
            })
            .collect::<Result<Vec<(RecordKey, Row)>>>()?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut select = audit_select();
        if let Some(table) = &filter.table {
            select.and_where(Expr::col(AuditLog::TableName).eq(table.as_str()));
        }
        if let Some(key) = &filter.key {
            select.and_where(Expr::col(AuditLog::RowKey).eq(key.encode()));
        }
        if let Some(job_id) = filter.job_id {
            select.and_where(Expr::col(AuditLog::JobId).eq(job_id.to_string()));
        }
        if let Some(from) = filter.from_id {
            select.and_where(Expr::col(AuditLog::Id).gte(from as i64));
        }
        if let Some(to) = filter.to_id {
            select.and_where(Expr::col(AuditLog::Id).lte(to as i64));
        }
        if let Some(since) = filter.since {
            select.and_where(Expr::col(AuditLog::AppliedAt).gte(format_time(&since)));
        }
        if let Some(until) = filter.until {
            select.and_where(Expr::col(AuditLog::AppliedAt).lte(format_time(&until)));
        }
        let query = select.order_by(AuditLog::Id, Order::Asc).to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn audit_entry(&self, id: AuditId) -> Result<Option<AuditEntry>> {
        let query = audit_select()
            .and_where(Expr::col(AuditLog::Id).eq(id as i64))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(audit_from_row).transpose()
    }

    async fn recent_post_images(&self, table: &str, limit: usize) -> Result<Vec<Row>> {
        let query = Query::select()
            .column(AuditLog::PostImage)
            .from(AuditLog::Table)
            .and_where(Expr::col(AuditLog::TableName).eq(table))
            .and_where(Expr::col(AuditLog::PostImage).is_not_null())
            .order_by(AuditLog::Id, Order::Desc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut images = rows
            .iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("post_image"))?))
            .collect::<Result<Vec<Row>>>()?;
        images.reverse();
        Ok(images)
    }

    async fn compacted(&self, table: Option<&str>) -> Result<Vec<CompactedSnapshot>> {
        let mut select = Query::select()
            .column(Compacted::Data)
            .from(Compacted::Table)
            .to_owned();
        if let Some(table) = table {
            select.and_where(Expr::col(Compacted::TableName).eq(table));
        }
        let mut snapshots: Vec<CompactedSnapshot> = self.fetch_data(select).await?;
        snapshots.sort_by(|a, b| (&a.table, &a.key).cmp(&(&b.table, &b.key)));
        Ok(snapshots)
    }

    async fn watermark(&self, pipeline: &str, table: &str) -> Result<Option<Watermark>> {
        let select = Query::select()
            .column(Watermarks::Data)
            .from(Watermarks::Table)
            .and_where(Expr::col(Watermarks::Pipeline).eq(pipeline))
            .and_where(Expr::col(Watermarks::TableName).eq(table))
            .to_owned();
        Ok(self.fetch_data(select).await?.into_iter().next())
    }

    async fn key_states(&self, pipeline: &str, table: &str) -> Result<BTreeMap<RecordKey, KeyState>> {
        let query = Query::select()
            .columns([KeyStates::RowKey, KeyStates::Data])
            .from(KeyStates::Table)
            .and_where(Expr::col(KeyStates::Pipeline).eq(pipeline))
            .and_where(Expr::col(KeyStates::TableName).eq(table))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok((
                    decode_key(&row.get::<String, _>("row_key"))?,
                    serde_json::from_str(&row.get::<String, _>("data"))?,
                ))
            })
            .collect()
    }

    async fn dead_letters(&self, job_id: Option<JobId>, table: Option<&str>) -> Result<Vec<DeadLetter>> {
        let mut select = Query::select()
            .column(DeadLetters::Data)
            .from(DeadLetters::Table)
            .to_owned();
        if let Some(job_id) = job_id {
            select.and_where(Expr::col(DeadLetters::JobId).eq(job_id.to_string()));
        }
        if let Some(table) = table {
            select.and_where(Expr::col(DeadLetters::TableName).eq(table));
        }
        let mut letters: Vec<DeadLetter> = self.fetch_data(select).await?;
        letters.sort_by(|a, b| (&a.table, &a.key).cmp(&(&b.table, &b.key)));
        Ok(letters)
    }

    async fn parked_conflicts(&self, table: Option<&str>) -> Result<Vec<ParkedConflict>> {
        let mut select = Query::select()
            .column(ParkedConflicts::Data)
            .from(ParkedConflicts::Table)
            .to_owned();
        if let Some(table) = table {
            select.and_where(Expr::col(ParkedConflicts::TableName).eq(table));
        }
        let mut conflicts: Vec<ParkedConflict> = self.fetch_data(select).await?;
        conflicts.sort_by(|a, b| (&a.table, &a.key).cmp(&(&b.table, &b.key)));
        Ok(conflicts)
    }

    async fn job(&self, id: JobId) -> Result<Option<JobState>> {
        let select = Query::select()
            .column(Jobs::Data)
            .from(Jobs::Table)
            .and_where(Expr::col(Jobs::JobId).eq(id.to_string()))
            .to_owned();
        Ok(self.fetch_data(select).await?.into_iter().next())
    }

    async fn jobs(&self) -> Result<Vec<JobState>> {
        let select = Query::select()
            .column(Jobs::Data)
            .from(Jobs::Table)
            .order_by(Jobs::SubmittedAt, Order::Asc)
            .to_owned();
        self.fetch_data(select).await
    }

    async fn acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        mode: LeaseMode,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        let now = Utc::now();
        let request = Lease {
            resource: resource.to_string(),
            holder: holder.to_string(),
            mode,
            expires_at: now + ttl,
        };
        // Same as commit: a renewal abandoned by its caller still finishes
        // or rolls back its transaction.
        let store = self.clone();
        tokio::spawn(async move { store.claim_now(request, now).await })
            .await
            .map_err(|e| StorageError::Aborted(format!("lease task: {}", e)))?
    }

    async fn release_lease(&self, resource: &str, holder: &str) -> Result<()> {
        let query = Query::delete()
            .from_table(LeaseHolders::Table)
            .and_where(Expr::col(LeaseHolders::Resource).eq(resource))
            .and_where(Expr::col(LeaseHolders::Holder).eq(holder))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn leases(&self, resource: &str) -> Result<Vec<Lease>> {
        let now = Utc::now();
        let mut conn = self.pool.acquire().await?;
        Ok(held_leases(&mut conn, resource)
            .await?
            .into_iter()
            .filter(|l| l.is_live(now))
            .collect())
    }

    async fn commit(&self, writes: WriteSet) -> Result<Vec<AuditEntry>> {
        check_write_set(&writes)?;

        // The transaction runs on its own task, so a caller that stops
        // waiting never leaves a connection mid-transaction.
        let store = self.clone();
        tokio::spawn(async move { store.commit_now(writes).await })
            .await
            .map_err(|e| StorageError::Aborted(format!("commit task: {}", e)))?
    }
}
