//! In-memory source connector.
//!
//! Backs tests and the headless runner, which loads it from a directory of
//! JSON fixtures (`<table>.json`, each an array of objects). Carries fault
//! switches for retry and drift scenarios.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ConnectorError, Result, ScanPage, ScanSpec, SourceCapabilities, SourceConnector};
use crate::detect::timestamp_value;
use crate::model::{Cursor, RecordKey, Row};

#[derive(Default)]
pub struct MemorySource {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    hidden_columns: RwLock<HashMap<String, BTreeSet<String>>>,
    transient_failures: RwLock<u32>,
    delay: RwLock<Option<Duration>>,
    page_limit: RwLock<Option<usize>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` file in `dir` as a table named after the file stem.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ConnectorError::Fatal(format!("{}: {}", dir.display(), e)))?;
        let mut tables = HashMap::new();
        for entry in entries {
            let path = entry
                .map_err(|e| ConnectorError::Fatal(e.to_string()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConnectorError::Fatal(format!("{}: {}", path.display(), e)))?;
            let rows: Vec<Row> = serde_json::from_str(&text)
                .map_err(|e| ConnectorError::Fatal(format!("{}: {}", path.display(), e)))?;
            debug!(table = name, rows = rows.len(), "Loaded source fixture");
            tables.insert(name.to_string(), rows);
        }
        info!(dir = %dir.display(), tables = tables.len(), "Source fixtures loaded");
        Ok(Self {
            tables: RwLock::new(tables),
            ..Self::default()
        })
    }

    pub async fn insert_table(&self, table: &str, rows: Vec<Row>) {
        self.tables.write().await.insert(table.to_string(), rows);
    }

    /// Insert or replace a row, matching on `primary_key`.
    pub async fn upsert(&self, table: &str, primary_key: &[String], row: Row) {
        let key = RecordKey::from_row(&row, primary_key);
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|r| key.is_some() && RecordKey::from_row(r, primary_key) == key)
        {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    pub async fn remove(&self, table: &str, primary_key: &[String], key: &RecordKey) {
        if let Some(rows) = self.tables.write().await.get_mut(table) {
            rows.retain(|r| RecordKey::from_row(r, primary_key).as_ref() != Some(key));
        }
    }

    /// Simulate a column disappearing from the source schema.
    pub async fn drop_column(&self, table: &str, column: &str) {
        self.hidden_columns
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string());
    }

    pub async fn restore_column(&self, table: &str, column: &str) {
        if let Some(hidden) = self.hidden_columns.write().await.get_mut(table) {
            hidden.remove(column);
        }
    }

    /// Fail the next `count` calls with a transient error.
    pub async fn set_transient_failures(&self, count: u32) {
        *self.transient_failures.write().await = count;
    }

    /// Sleep before answering every call.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    /// Cap every scan page below the requested batch size.
    pub async fn set_page_limit(&self, limit: Option<usize>) {
        *self.page_limit.write().await = limit;
    }

    async fn enter(&self, op: &str) -> Result<()> {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut failures = self.transient_failures.write().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(ConnectorError::Transient(format!("injected failure in {}", op)));
        }
        Ok(())
    }

    async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| ConnectorError::UnknownTable(table.to_string()))?;
        let hidden = self.hidden_columns.read().await;
        Ok(match hidden.get(table) {
            Some(cols) if !cols.is_empty() => rows
                .iter()
                .map(|r| {
                    r.iter()
                        .filter(|(k, _)| !cols.contains(*k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .collect(),
            _ => rows.clone(),
        })
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            timestamp_watermarks: true,
            soft_delete_columns: true,
        }
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.enter("columns").await?;
        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| ConnectorError::UnknownTable(table.to_string()))?;
        let hidden = self.hidden_columns.read().await;
        let mut columns: BTreeSet<String> = rows.iter().flat_map(|r| r.keys().cloned()).collect();
        if let Some(cols) = hidden.get(table) {
            columns.retain(|c| !cols.contains(c));
        }
        Ok(columns.into_iter().collect())
    }

    async fn scan(
        &self,
        table: &str,
        spec: &ScanSpec,
        cursor: &Cursor,
        batch_size: usize,
    ) -> Result<ScanPage> {
        self.enter("scan").await?;
        let limit = match *self.page_limit.read().await {
            Some(cap) => batch_size.min(cap),
            None => batch_size,
        };
        let mut candidates: Vec<(i64, RecordKey, Row)> = self
            .rows(table)
            .await?
            .into_iter()
            .filter_map(|row| {
                let ts = timestamp_value(row.get(&spec.timestamp_column)?)?;
                let key = RecordKey::from_row(&row, &spec.primary_key)?;
                cursor.admits(ts, &key).then_some((ts, key, row))
            })
            .collect();
        candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        candidates.truncate(limit);

        let next_cursor = candidates
            .last()
            .map(|(ts, key, _)| Cursor::new(*ts, key.clone()));
        Ok(ScanPage {
            rows: candidates.into_iter().map(|(_, _, row)| row).collect(),
            next_cursor,
        })
    }

    async fn fetch_by_keys(
        &self,
        table: &str,
        primary_key: &[String],
        keys: &[RecordKey],
    ) -> Result<Vec<Row>> {
        self.enter("fetch_by_keys").await?;
        let wanted: BTreeSet<&RecordKey> = keys.iter().collect();
        Ok(self
            .rows(table)
            .await?
            .into_iter()
            .filter(|row| {
                RecordKey::from_row(row, primary_key).is_some_and(|k| wanted.contains(&k))
            })
            .collect())
    }

    async fn snapshot(&self, table: &str) -> Result<Vec<Row>> {
        self.enter("snapshot").await?;
        self.rows(table).await
    }
}
