//! In-process event bus.
//!
//! Engine progress is published as [`SyncEvent`]s on a tokio broadcast
//! channel. Subscribers either take a raw receiver or register an
//! [`EventHandler`] that runs on its own consumer task, optionally filtered
//! to one table.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::model::{AuditId, Cursor, JobId, JobMode, JobStatus, RecordKey};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// Something observable happened in the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    JobSubmitted {
        job_id: JobId,
        mode: JobMode,
        tables: Vec<String>,
    },
    JobStatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    BatchCommitted {
        job_id: JobId,
        table: String,
        applied: u64,
        cursor: Cursor,
        change_id: u64,
    },
    RecordSkipped {
        job_id: JobId,
        table: String,
        key: RecordKey,
        reason: String,
    },
    ConflictParked {
        job_id: JobId,
        table: String,
        key: RecordKey,
    },
    DeadLettered {
        job_id: JobId,
        table: String,
        key: RecordKey,
        retryable: bool,
        reason: String,
    },
    SchemaDrift {
        job_id: JobId,
        table: String,
        missing: Vec<String>,
    },
    RolledBack {
        compensations: Vec<AuditId>,
    },
    RetentionCompacted {
        keys: usize,
        pruned: usize,
    },
    ExportCompleted {
        table: String,
        format: String,
        records: usize,
    },
}

impl SyncEvent {
    /// Table the event concerns, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncEvent::BatchCommitted { table, .. }
            | SyncEvent::RecordSkipped { table, .. }
            | SyncEvent::ConflictParked { table, .. }
            | SyncEvent::DeadLettered { table, .. }
            | SyncEvent::SchemaDrift { table, .. }
            | SyncEvent::ExportCompleted { table, .. } => Some(table),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::JobSubmitted { .. } => "job_submitted",
            SyncEvent::JobStatusChanged { .. } => "job_status_changed",
            SyncEvent::BatchCommitted { .. } => "batch_committed",
            SyncEvent::RecordSkipped { .. } => "record_skipped",
            SyncEvent::ConflictParked { .. } => "conflict_parked",
            SyncEvent::DeadLettered { .. } => "dead_lettered",
            SyncEvent::SchemaDrift { .. } => "schema_drift",
            SyncEvent::RolledBack { .. } => "rolled_back",
            SyncEvent::RetentionCompacted { .. } => "retention_compacted",
            SyncEvent::ExportCompleted { .. } => "export_completed",
        }
    }
}

/// Handler for events delivered by a consumer task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<SyncEvent>);
}

/// Logs every event at info level.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: Arc<SyncEvent>) {
        match serde_json::to_string(event.as_ref()) {
            Ok(json) => info!(event = event.name(), payload = %json, "Sync event"),
            Err(e) => error!(event = event.name(), error = %e, "Unserializable sync event"),
        }
    }
}

/// Broadcast bus shared by the engine and its observers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<SyncEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to every current subscriber. Having none is fine.
    pub fn publish(&self, event: SyncEvent) {
        let name = event.name();
        match self.sender.send(Arc::new(event)) {
            Ok(receivers) => debug!(event = name, receivers, "Published sync event"),
            Err(_) => debug!(event = name, "Published sync event (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SyncEvent>> {
        self.sender.subscribe()
    }

    /// Run `handler` on a consumer task for events matching `table_filter`
    /// (`None` for all). The task ends when the bus is dropped.
    pub fn spawn_consumer(
        &self,
        handler: Arc<dyn EventHandler>,
        table_filter: Option<String>,
    ) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let matches = match (&table_filter, event.table()) {
                            (None, _) => true,
                            (Some(filter), Some(table)) => filter == table,
                            (Some(_), None) => false,
                        };
                        if matches {
                            handler.handle(event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Event consumer lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed, stopping consumer");
                        break;
                    }
                }
            }
        })
    }
}
