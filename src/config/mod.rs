//! Engine configuration.
//!
//! Loaded from YAML files and environment variables with the `config`
//! crate, or parsed directly from a YAML document.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::schema::LookupTables;
use crate::transform::sanitize::SecretKey;

mod job;
mod tables;

pub use job::{
    ConflictStrategy, DetectionStrategy, JobConfig, MergeRuleConfig, MergeTake, TableJobConfig,
    ValidationMode, DEFAULT_BATCH_SIZE, DEFAULT_MAX_PARALLEL_TABLES, DEFAULT_RETRY_CEILING,
};
pub use tables::{
    ColumnConfig, DeleteDetection, ForeignKeyConfig, RuleConfig, SourceColumnConfig, TableConfig,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "assessment-sync.yaml";

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ASSESSMENT_SYNC_CONFIG";

/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ASSESSMENT_SYNC";

/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ASSESSMENT_SYNC_LOG";

/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "ASSESSMENT_SYNC_LOG_FORMAT";

/// Default environment variable holding the sanitization secret.
pub const SECRET_ENV_VAR: &str = "ASSESSMENT_SYNC_SANITIZE_SECRET";

/// Environment variable naming the JSON fixture directory used as source.
pub const SOURCE_DIR_ENV_VAR: &str = "ASSESSMENT_SYNC_SOURCE_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Memory,
    Sqlite,
}

/// Target/state store selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Database file for `sqlite`.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            path: "./data/assessment-sync.db".to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizationConfig {
    /// Environment variable the secret is read from.
    pub secret_env: String,
    /// Inline secret. Intended for tests and fixtures only.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            secret_env: SECRET_ENV_VAR.to_string(),
            secret: None,
        }
    }
}

impl std::fmt::Debug for SanitizationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanitizationConfig")
            .field("secret_env", &self.secret_env)
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl SanitizationConfig {
    /// Inline secret first, then the configured environment variable.
    pub fn load_secret(&self) -> Option<SecretKey> {
        self.secret
            .clone()
            .or_else(|| std::env::var(&self.secret_env).ok())
            .filter(|s| !s.is_empty())
            .map(SecretKey::new)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub sanitization: SanitizationConfig,
    pub tables: Vec<TableConfig>,
    /// Static reference tables for `lookup(table, key)`.
    pub lookups: LookupTables,
    /// Job submitted by the headless runner; also the defaults template.
    pub job: JobConfig,
}

impl EngineConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `assessment-sync.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, SyncError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Parse a YAML document without consulting files or the environment.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SyncError> {
        serde_yaml::from_str(yaml).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Table names declared in this document.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests;
