//! Per-job configuration with the documented defaults.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::JobMode;
use crate::schema::SchemaRegistry;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_BATCH_TIME_LIMIT_SECS: u64 = 30;
pub const DEFAULT_MAX_PARALLEL_TABLES: usize = 2;
pub const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_STAT_WINDOW: usize = 1000;
pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;
pub const DEFAULT_RETRY_CEILING: usize = 5;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_REQUEUES: u32 = 3;
pub const DEFAULT_LEASE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    Timestamp,
    ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    SourceWins,
    TargetWins,
    NewestWins,
    Merge,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::SourceWins => "source_wins",
            ConflictStrategy::TargetWins => "target_wins",
            ConflictStrategy::NewestWins => "newest_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Strict,
    #[default]
    Tolerant,
}

/// Which side a merged column takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeTake {
    Source,
    Target,
    Combiner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRuleConfig {
    pub column: String,
    pub take: MergeTake,
    /// Registered combiner name when `take: combiner`.
    #[serde(default)]
    pub combiner: Option<String>,
}

/// Per-table job settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableJobConfig {
    pub name: String,
    /// Defaults to `timestamp` when the table declares `last_modified`,
    /// otherwise `content_hash`.
    #[serde(default)]
    pub detection: Option<DetectionStrategy>,
    #[serde(default)]
    pub conflict: ConflictStrategy,
    #[serde(default)]
    pub merge: Vec<MergeRuleConfig>,
}

impl TableJobConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detection: None,
            conflict: ConflictStrategy::default(),
            merge: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub mode: JobMode,
    /// Empty means every registered table with default settings.
    pub tables: Vec<TableJobConfig>,
    pub batch_size: usize,
    pub batch_time_limit_secs: u64,
    pub max_parallel_tables: usize,
    pub validation_mode: ValidationMode,
    pub audit_retention_days: u32,
    pub stat_window: usize,
    pub z_threshold: f64,
    pub retry_ceiling: usize,
    pub call_timeout_secs: u64,
    /// In-batch requeues of a constraint-violating record before it is
    /// dead-lettered.
    pub max_requeues: u32,
    /// Lifetime of the pipeline lease between heartbeats. A lease left by a
    /// crashed job can be taken over once it lapses.
    pub lease_ttl_secs: u64,
    pub source_id: String,
    pub target_id: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            mode: JobMode::Incremental,
            tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_time_limit_secs: DEFAULT_BATCH_TIME_LIMIT_SECS,
            max_parallel_tables: DEFAULT_MAX_PARALLEL_TABLES,
            validation_mode: ValidationMode::Tolerant,
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
            stat_window: DEFAULT_STAT_WINDOW,
            z_threshold: DEFAULT_Z_THRESHOLD,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            max_requeues: DEFAULT_MAX_REQUEUES,
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            source_id: "pacs".to_string(),
            target_id: "cama".to_string(),
        }
    }
}

impl JobConfig {
    pub fn batch_time_limit(&self) -> Duration {
        Duration::from_secs(self.batch_time_limit_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(u32::try_from(self.lease_ttl_secs).unwrap_or(u32::MAX)))
    }

    /// Renewal period of a held lease: a third of its lifetime.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_secs.saturating_mul(1000) / 3)
    }

    /// Lease and watermark partition for this source/target pair.
    pub fn pipeline(&self) -> String {
        format!("{}->{}", self.source_id, self.target_id)
    }

    /// Settings for `table`, falling back to defaults.
    pub fn table(&self, table: &str) -> TableJobConfig {
        self.tables
            .iter()
            .find(|t| t.name == table)
            .cloned()
            .unwrap_or_else(|| TableJobConfig::named(table))
    }

    /// Table names selected by this job, in declaration order.
    pub fn table_names(&self, registry: &SchemaRegistry) -> Vec<String> {
        if self.tables.is_empty() {
            registry.dependency_order().to_vec()
        } else {
            self.tables.iter().map(|t| t.name.clone()).collect()
        }
    }

    /// Effective detection strategy for `table` under this job's mode.
    /// Full syncs always hash.
    pub fn detection_for(&self, table: &str, registry: &SchemaRegistry) -> DetectionStrategy {
        if self.mode == JobMode::Full {
            return DetectionStrategy::ContentHash;
        }
        match self.table(table).detection {
            Some(strategy) => strategy,
            None => match registry.get(table).and_then(|t| t.last_modified.as_ref()) {
                Some(_) => DetectionStrategy::Timestamp,
                None => DetectionStrategy::ContentHash,
            },
        }
    }

    pub fn validate(&self, registry: &SchemaRegistry) -> Result<(), SyncError> {
        let fail = |msg: String| Err(SyncError::Config(msg));

        if self.batch_size == 0 {
            return fail("batch_size must be at least 1".to_string());
        }
        if self.max_parallel_tables == 0 {
            return fail("max_parallel_tables must be at least 1".to_string());
        }
        if self.stat_window == 0 {
            return fail("stat_window must be at least 1".to_string());
        }
        if self.z_threshold.is_nan() || self.z_threshold <= 0.0 {
            return fail(format!("z_threshold must be positive, got {}", self.z_threshold));
        }
        if self.batch_time_limit_secs == 0 || self.call_timeout_secs == 0 || self.lease_ttl_secs == 0 {
            return fail("time limits must be positive".to_string());
        }
        if self.source_id.is_empty() || self.target_id.is_empty() {
            return fail("source_id and target_id are required".to_string());
        }

        let mut seen = BTreeSet::new();
        for t in &self.tables {
            if !seen.insert(t.name.as_str()) {
                return fail(format!("table '{}' listed twice", t.name));
            }
            let descriptor = match registry.get(&t.name) {
                Some(d) => d,
                None => return fail(format!("unknown table '{}'", t.name)),
            };
            if t.detection == Some(DetectionStrategy::Timestamp)
                && descriptor.last_modified.is_none()
            {
                return fail(format!(
                    "table '{}' uses timestamp detection but declares no last_modified column",
                    t.name
                ));
            }
            if t.conflict == ConflictStrategy::Merge && t.merge.is_empty() {
                return fail(format!("table '{}' uses merge without rules", t.name));
            }
            for rule in &t.merge {
                if descriptor.column(&rule.column).is_none() {
                    return fail(format!(
                        "merge rule on unknown column '{}.{}'",
                        t.name, rule.column
                    ));
                }
                if rule.take == MergeTake::Combiner && rule.combiner.is_none() {
                    return fail(format!(
                        "merge rule '{}.{}' takes a combiner but names none",
                        t.name, rule.column
                    ));
                }
            }
        }
        Ok(())
    }
}
