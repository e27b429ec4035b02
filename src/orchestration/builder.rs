//! Builder for assembling an [`Engine`].

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::{Engine, EngineCore};
use crate::bus::EventBus;
use crate::config::{EngineConfig, JobConfig, StorageConfig, StorageType};
use crate::connectors::SourceConnector;
use crate::error::SyncError;
use crate::resolve::{Combiner, ConflictResolver};
use crate::schema::SchemaRegistry;
use crate::storage::{init_storage, Constraints, SyncStore};
use crate::transform::{SecretKey, Transformer};

/// Builder for configuring and creating an [`Engine`].
///
/// # Example
///
/// ```ignore
/// let engine = Engine::builder()
///     .with_config(&config)?
///     .with_source(Arc::new(MemorySource::from_dir("fixtures/pacs")?))
///     .with_combiner("longest", |s: &Value, t: &Value| Some(s.clone()))
///     .build()
///     .await?;
/// ```
pub struct EngineBuilder {
    registry: Option<Arc<SchemaRegistry>>,
    source: Option<Arc<dyn SourceConnector>>,
    /// Used when no store instance is supplied.
    storage: StorageConfig,
    store: Option<Arc<dyn SyncStore>>,
    secret: Option<SecretKey>,
    resolver: ConflictResolver,
    bus: Option<EventBus>,
    defaults: JobConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Defaults: in-memory store, built-in combiners, default job settings.
    pub fn new() -> Self {
        Self {
            registry: None,
            source: None,
            storage: StorageConfig::default(),
            store: None,
            secret: None,
            resolver: ConflictResolver::new(),
            bus: None,
            defaults: JobConfig::default(),
        }
    }

    /// Take registry, storage, secret and job defaults from a configuration
    /// document.
    pub fn with_config(mut self, config: &EngineConfig) -> Result<Self, SyncError> {
        let registry = SchemaRegistry::from_config(&config.tables, config.lookups.clone())?;
        self.registry = Some(Arc::new(registry));
        self.storage = config.storage.clone();
        self.secret = config.sanitization.load_secret();
        self.defaults = config.job.clone();
        Ok(self)
    }

    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn SourceConnector>) -> Self {
        self.source = Some(source);
        self
    }

    // ========================================================================
    // Storage Configuration
    // ========================================================================

    /// Use an in-memory store (default).
    pub fn with_memory_store(mut self) -> Self {
        self.storage.storage_type = StorageType::Memory;
        self.store = None;
        self
    }

    /// Use a SQLite file store.
    pub fn with_sqlite_file(mut self, path: impl Into<String>) -> Self {
        self.storage = StorageConfig {
            storage_type: StorageType::Sqlite,
            path: path.into(),
        };
        self.store = None;
        self
    }

    /// Use an existing store instance, e.g. one with fault injection armed.
    pub fn with_store(mut self, store: Arc<dyn SyncStore>) -> Self {
        self.store = Some(store);
        self
    }

    // ========================================================================
    // Pipeline Configuration
    // ========================================================================

    pub fn with_secret(mut self, secret: SecretKey) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Register a named combiner for `merge` rules.
    pub fn with_combiner(mut self, name: &str, combiner: impl Combiner + 'static) -> Self {
        self.resolver = self.resolver.with_combiner(name, combiner);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_job_defaults(mut self, defaults: JobConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build the engine, opening the configured store when none was given.
    pub async fn build(self) -> Result<Engine, SyncError> {
        let registry = self
            .registry
            .ok_or_else(|| SyncError::Config("engine needs a schema registry".into()))?;
        let source = self
            .source
            .ok_or_else(|| SyncError::Config("engine needs a source connector".into()))?;
        if self.secret.is_none() && Transformer::needs_secret(&registry) {
            return Err(SyncError::Config(
                "sanitization secret required by hashed or pseudonymized columns".into(),
            ));
        }
        self.defaults.validate(&registry)?;

        let store = match self.store {
            Some(store) => store,
            None => init_storage(&self.storage, Constraints::from_registry(&registry)).await?,
        };
        info!(
            tables = registry.dependency_order().len(),
            fingerprint = %registry.fingerprint(),
            "Engine ready"
        );

        Ok(Engine::from_core(EngineCore {
            transformer: Transformer::new(registry.clone(), self.secret),
            registry,
            source,
            store,
            resolver: self.resolver,
            bus: self.bus.unwrap_or_default(),
            defaults: self.defaults,
            commit_lock: Mutex::new(()),
        }))
    }
}
