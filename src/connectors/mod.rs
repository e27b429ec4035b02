//! Source connectors.
//!
//! The engine reads PACS through [`SourceConnector`]. The target side is the
//! [`SyncStore`](crate::storage::SyncStore), which also owns audit and state
//! so that one transaction covers target rows, audit entries and watermarks.

use async_trait::async_trait;

use crate::model::{Cursor, RecordKey, Row};

pub mod memory;

pub use memory::MemorySource;

/// Connector errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    #[error("Transient source error: {0}")]
    Transient(String),

    #[error("Source call timed out: {0}")]
    Timeout(String),

    #[error("Unknown source table: {0}")]
    UnknownTable(String),

    #[error("Source error: {0}")]
    Fatal(String),
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_) | ConnectorError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// What a connector can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// Supports ordered scans past a `(timestamp, key)` cursor.
    pub timestamp_watermarks: bool,
    /// Exposes soft-delete flag columns.
    pub soft_delete_columns: bool,
}

/// How to order and bound a timestamp scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    pub timestamp_column: String,
    pub primary_key: Vec<String>,
}

/// One page of a timestamp scan, ordered by `(timestamp, key)` ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub rows: Vec<Row>,
    /// Cursor of the last row returned; `None` when the page is empty.
    pub next_cursor: Option<Cursor>,
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn capabilities(&self) -> SourceCapabilities;

    /// Column names currently present in `table`.
    async fn columns(&self, table: &str) -> Result<Vec<String>>;

    /// Rows strictly past `cursor`, at most `batch_size`.
    async fn scan(
        &self,
        table: &str,
        spec: &ScanSpec,
        cursor: &Cursor,
        batch_size: usize,
    ) -> Result<ScanPage>;

    async fn fetch_by_keys(
        &self,
        table: &str,
        primary_key: &[String],
        keys: &[RecordKey],
    ) -> Result<Vec<Row>>;

    /// Every row of `table`.
    async fn snapshot(&self, table: &str) -> Result<Vec<Row>>;
}
