//! Table declarations as they appear in the configuration document.

use serde::{Deserialize, Serialize};

use crate::model::Severity;
use crate::schema::{ClassificationTier, SanitizeTag, SemanticType};

/// One table of the sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Logical name used throughout the engine.
    pub name: String,
    /// Physical table name in PACS. Defaults to `name`.
    #[serde(default)]
    pub source: Option<String>,
    /// Physical table name in CAMA. Defaults to `name`.
    #[serde(default)]
    pub target: Option<String>,
    pub primary_key: Vec<String>,
    pub source_columns: Vec<SourceColumnConfig>,
    pub columns: Vec<ColumnConfig>,
    /// Source column holding the modification timestamp.
    #[serde(default)]
    pub last_modified: Option<String>,
    /// How deletes are detected. Has no default: operators must choose.
    pub deletes: DeleteDetection,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyConfig>,
    #[serde(default)]
    pub classification: ClassificationTier,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
}

/// A target column and the expression that produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub sanitize: SanitizeTag,
    /// Mapping expression. Defaults to the same-named source column.
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Track this column in the rolling z-score window.
    #[serde(default)]
    pub zscore: bool,
}

fn default_nullable() -> bool {
    true
}

/// Delete detection strategy for incremental mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DeleteDetection {
    /// A truthy value in `column` marks the row deleted.
    SoftDelete { column: String },
    /// Deleted keys appear in a separate tombstone table that carries the
    /// primary key and the `last_modified` column.
    Tombstone { table: String },
    /// Deletes are invisible to incremental mode; a full sync reconciles them.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyConfig {
    /// Child columns on the target side.
    pub columns: Vec<String>,
    /// Logical name of the parent table.
    pub references: String,
    /// Parent columns. Defaults to the parent's primary key.
    #[serde(default)]
    pub ref_columns: Vec<String>,
}

/// Cross-field predicate, e.g. `land_value + improvement_value = total_value ± 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub expr: String,
    #[serde(default = "default_rule_severity")]
    pub severity: Severity,
}

fn default_rule_severity() -> Severity {
    Severity::Error
}
