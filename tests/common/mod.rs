//! Shared fixtures for integration tests.
//!
//! Two PACS tables with a foreign key between their CAMA counterparts,
//! an in-memory source and an in-memory store with fault switches.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use assessment_sync::bus::SyncEvent;
use assessment_sync::config::{EngineConfig, JobConfig};
use assessment_sync::connectors::MemorySource;
use assessment_sync::model::{JobMode, JobState, RecordKey, Row};
use assessment_sync::schema::SchemaRegistry;
use assessment_sync::storage::{Constraints, MemoryStore, SyncStore};
use assessment_sync::Engine;

/// Watermark and key-state partition of the default job settings.
pub const PIPELINE: &str = "pacs->cama";

const WAIT: Duration = Duration::from_secs(10);

pub const TABLES: &str = r#"
tables:
  - name: parcels
    target: cama_parcels
    primary_key: [id]
    last_modified: mtime
    source_columns:
      - { name: id, type: int }
      - { name: owner, type: string }
      - { name: total_value, type: float }
      - { name: mtime, type: int }
    columns:
      - { name: id, type: int, nullable: false }
      - { name: owner, type: string }
      - { name: total_value, type: float }
    deletes: { strategy: none }
    rules:
      - id: non_negative_total
        expr: "total_value >= 0"
        severity: critical
  - name: improvements
    primary_key: [id]
    last_modified: mtime
    source_columns:
      - { name: id, type: int }
      - { name: parcel_id, type: int }
      - { name: kind, type: string }
      - { name: mtime, type: int }
    columns:
      - { name: id, type: int, nullable: false }
      - { name: parcel_id, type: int, nullable: false }
      - { name: kind, type: string }
    deletes: { strategy: none }
    foreign_keys:
      - { columns: [parcel_id], references: parcels }
"#;

pub fn registry() -> SchemaRegistry {
    let config = EngineConfig::from_yaml_str(TABLES).expect("fixture config");
    SchemaRegistry::from_config(&config.tables, config.lookups.clone()).expect("fixture registry")
}

pub fn row(v: Value) -> Row {
    serde_json::from_value(v).expect("row")
}

pub fn rows(values: Vec<Value>) -> Vec<Row> {
    values.into_iter().map(row).collect()
}

/// An engine wired to an in-memory source and store.
pub struct Harness {
    pub engine: Engine,
    pub source: Arc<MemorySource>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub async fn new(parcels: Vec<Value>, improvements: Vec<Value>) -> Self {
        let registry = registry();
        let source = Arc::new(MemorySource::new());
        source.insert_table("parcels", rows(parcels)).await;
        source.insert_table("improvements", rows(improvements)).await;
        let store = Arc::new(MemoryStore::with_constraints(Constraints::from_registry(&registry)));
        let engine = Engine::builder()
            .with_registry(Arc::new(registry))
            .with_source(source.clone())
            .with_store(store.clone())
            .build()
            .await
            .expect("engine");
        Self {
            engine,
            source,
            store,
        }
    }

    /// Submit `config` and wait for a terminal state.
    pub async fn run(&self, config: JobConfig) -> JobState {
        let job_id = self.engine.submit(config).await.expect("submit");
        tokio::time::timeout(WAIT, self.engine.wait(job_id))
            .await
            .expect("job timed out")
            .expect("job state")
    }

    /// Current target row of `table` keyed by integer `id`.
    pub async fn target(&self, table: &str, id: i64) -> Option<Row> {
        let key = RecordKey::int(id);
        self.store
            .read_current(table, std::slice::from_ref(&key))
            .await
            .expect("read_current")
            .remove(&key)
    }

    pub async fn target_rows(&self, table: &str) -> Vec<(RecordKey, Row)> {
        self.store.scan_rows(table).await.expect("scan_rows")
    }

    pub async fn source_upsert(&self, table: &str, v: Value) {
        self.source.upsert(table, &["id".to_string()], row(v)).await;
    }
}

pub fn job(mode: JobMode, batch_size: usize) -> JobConfig {
    JobConfig {
        mode,
        batch_size,
        ..JobConfig::default()
    }
}

/// Every event already published to `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Arc<SyncEvent>>) -> Vec<Arc<SyncEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
