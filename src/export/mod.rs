//! Read-only exports of target tables.
//!
//! An export selects rows of one target table, optionally narrowed by key
//! set, audit time window or bounding box, and renders them through an
//! [`ExportWriter`]. Every format carries the same [`ExportMetadata`]:
//!
//! | Format | Files | Metadata |
//! |--------|-------|----------|
//! | CSV | `<table>.csv` | `<table>.metadata.json` sidecar |
//! | JSON | `<table>.json` | `metadata` envelope member |
//! | GeoJSON | `<table>.geojson` | `metadata` foreign member |
//! | SpreadsheetML | `<table>.xml` | separate `metadata` worksheet |
//! | SQL | `<table>.sql` | `export_metadata` table |
//!
//! Exports never write to the store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SyncError;
use crate::model::{RecordKey, Row};
use crate::schema::{SchemaRegistry, TableDescriptor};
use crate::storage::{AuditFilter, SyncStore, STORE_SCHEMA_VERSION};

mod csv;
mod geojson;
mod json;
mod spreadsheet;
mod sql;

pub use csv::CsvWriter;
pub use geojson::{GeoJsonWriter, Locator};
pub use json::JsonWriter;
pub use spreadsheet::SpreadsheetWriter;
pub use sql::SqlWriter;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown column '{table}.{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("Table '{0}' has neither a geometry column nor latitude/longitude columns")]
    NoGeometry(String),

    #[error("Invalid time window: {since} is after {until}")]
    InvalidWindow {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
}

impl From<ExportError> for SyncError {
    fn from(e: ExportError) -> Self {
        SyncError::Export(e.to_string())
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
    GeoJson,
    Spreadsheet,
    Sql,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::GeoJson => "geo_json",
            ExportFormat::Spreadsheet => "spreadsheet",
            ExportFormat::Sql => "sql",
        }
    }

    /// Writer for this format with default settings.
    pub fn writer(&self) -> Box<dyn ExportWriter> {
        match self {
            ExportFormat::Csv => Box::new(CsvWriter::default()),
            ExportFormat::Json => Box::new(JsonWriter::default()),
            ExportFormat::GeoJson => Box::new(GeoJsonWriter),
            ExportFormat::Spreadsheet => Box::new(SpreadsheetWriter),
            ExportFormat::Sql => Box::new(SqlWriter::default()),
        }
    }
}

/// Axis-aligned bounds in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Whether the two boxes share at least one point.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }
}

/// Row selection. Empty fields select everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<BTreeSet<RecordKey>>,
    /// Rows written at or after this time, per the audit log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

impl ExportFilter {
    fn has_window(&self) -> bool {
        self.since.is_some() || self.until.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportQuery {
    pub table: String,
    pub filter: ExportFilter,
    /// Defaults to every target column in declaration order.
    pub columns: Option<Vec<String>>,
}

impl ExportQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: ExportFilter::default(),
            columns: None,
        }
    }

    pub fn with_keys(mut self, keys: impl IntoIterator<Item = RecordKey>) -> Self {
        self.filter.keys = Some(keys.into_iter().collect());
        self
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.filter.since = since;
        self.filter.until = until;
        self
    }

    pub fn within(mut self, bbox: BoundingBox) -> Self {
        self.filter.bbox = Some(bbox);
        self
    }

    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    fn projection(&self, descriptor: &TableDescriptor) -> Result<Vec<String>, ExportError> {
        let Some(columns) = &self.columns else {
            return Ok(descriptor.column_names());
        };
        for column in columns {
            if descriptor.column(column).is_none() {
                return Err(ExportError::UnknownColumn {
                    table: descriptor.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(columns.clone())
    }
}

/// Facts every export format records alongside the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub exported_at: DateTime<Utc>,
    pub table: String,
    /// Physical PACS table the rows were synced from.
    pub source_table: String,
    pub target_table: String,
    pub record_count: usize,
    pub columns: Vec<String>,
    pub filter: ExportFilter,
    /// Schema registry fingerprint.
    pub schema_version: String,
    pub store_version: i64,
}

/// One rendered file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportFile {
    pub name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl ExportFile {
    pub fn new(name: impl Into<String>, content_type: &'static str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type,
            bytes,
        }
    }

    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub metadata: ExportMetadata,
    /// Data file first, then any sidecars.
    pub files: Vec<ExportFile>,
}

impl ExportArtifact {
    pub fn data(&self) -> Option<&ExportFile> {
        self.files.first()
    }

    /// Write every file into `dir`, returning the paths written.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> std::io::Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let path = dir.join(&file.name);
            std::fs::write(&path, &file.bytes)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// What a writer renders.
pub struct ExportData<'a> {
    pub descriptor: &'a TableDescriptor,
    pub metadata: &'a ExportMetadata,
    /// Full target rows; writers emit `metadata.columns` only.
    pub rows: &'a [(RecordKey, Row)],
}

/// Renders selected rows into one or more files.
pub trait ExportWriter: Send + Sync {
    fn format(&self) -> ExportFormat;

    fn write(&self, data: &ExportData<'_>) -> Result<Vec<ExportFile>, ExportError>;
}

/// Select rows of `query.table` from the store and render them as `format`.
pub async fn export(
    store: &dyn SyncStore,
    registry: &SchemaRegistry,
    query: &ExportQuery,
    format: ExportFormat,
) -> Result<ExportArtifact, SyncError> {
    let descriptor = registry.require(&query.table)?;
    let columns = query.projection(descriptor)?;
    let filter = &query.filter;
    if let (Some(since), Some(until)) = (filter.since, filter.until) {
        if since > until {
            return Err(ExportError::InvalidWindow { since, until }.into());
        }
    }
    let locator = Locator::for_table(descriptor);
    if locator.is_none() && (format == ExportFormat::GeoJson || filter.bbox.is_some()) {
        return Err(ExportError::NoGeometry(descriptor.name.clone()).into());
    }

    let mut rows = store.scan_rows(&descriptor.name).await?;
    if let Some(keys) = &filter.keys {
        rows.retain(|(key, _)| keys.contains(key));
    }
    if filter.has_window() {
        let touched: BTreeSet<RecordKey> = store
            .audit_entries(&AuditFilter {
                table: Some(descriptor.name.clone()),
                since: filter.since,
                until: filter.until,
                ..AuditFilter::default()
            })
            .await?
            .into_iter()
            .filter(|e| e.post_image.is_some())
            .map(|e| e.key)
            .collect();
        rows.retain(|(key, _)| touched.contains(key));
    }
    if let (Some(bbox), Some(locator)) = (&filter.bbox, &locator) {
        rows.retain(|(_, row)| locator.envelope(row).is_some_and(|env| bbox.intersects(&env)));
    }

    let metadata = ExportMetadata {
        exported_at: Utc::now(),
        table: descriptor.name.clone(),
        source_table: descriptor.source_name.clone(),
        target_table: descriptor.target_name.clone(),
        record_count: rows.len(),
        columns,
        filter: filter.clone(),
        schema_version: registry.fingerprint().to_string(),
        store_version: STORE_SCHEMA_VERSION,
    };
    let files = format.writer().write(&ExportData {
        descriptor,
        metadata: &metadata,
        rows: &rows,
    })?;

    info!(
        table = %descriptor.name,
        format = format.as_str(),
        records = metadata.record_count,
        "Export completed"
    );
    Ok(ExportArtifact {
        format,
        metadata,
        files,
    })
}
