//! Schema Registry.
//!
//! Holds the table descriptors loaded from configuration, resolves mapping
//! expressions against the source schema, and orders tables by their
//! foreign-key dependencies. Read-only once built.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{DeleteDetection, TableConfig};
use crate::model::Severity;
use crate::validate::rules::Predicate;

pub mod expr;
pub mod types;

pub use expr::Expr;
pub use types::{ClassificationTier, SanitizeTag, SemanticType};

/// Registration failures. All are fatal at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Type mismatch in '{table}.{column}': cannot cast {from} to {to}")]
    TypeMismatch {
        table: String,
        column: String,
        from: SemanticType,
        to: SemanticType,
    },

    #[error("Cycle in foreign-key graph: {0:?}")]
    Cycle(Vec<String>),

    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Unknown lookup '{lookup}' referenced by table '{table}'")]
    UnknownLookup { table: String, lookup: String },

    #[error("Cannot parse {what} in table '{table}': {message}")]
    Parse {
        table: String,
        what: String,
        message: String,
    },

    #[error("Table '{0}' registered twice")]
    DuplicateTable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub sanitize: SanitizeTag,
    #[serde(skip)]
    pub expr: Expr,
    pub expr_source: String,
    pub max_length: Option<usize>,
    pub zscore: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub references: String,
    pub ref_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossFieldRule {
    pub id: String,
    pub source: String,
    #[serde(skip)]
    pub predicate: Predicate,
    pub severity: Severity,
}

/// Registered description of one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub source_name: String,
    pub target_name: String,
    pub primary_key: Vec<String>,
    pub source_columns: Vec<(String, SemanticType)>,
    pub columns: Vec<ColumnDescriptor>,
    pub last_modified: Option<String>,
    pub deletes: DeleteDetection,
    pub foreign_keys: Vec<ForeignKey>,
    pub classification: ClassificationTier,
    pub rules: Vec<CrossFieldRule>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_source_column(&self, name: &str) -> bool {
        self.source_columns.iter().any(|(n, _)| n == name)
    }

    /// Source columns the pipeline needs to be present: those read by any
    /// mapping expression plus the key, timestamp and soft-delete columns.
    pub fn required_source_columns(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.primary_key.iter().cloned().collect();
        for c in &self.columns {
            out.extend(c.expr.columns());
        }
        if let Some(lm) = &self.last_modified {
            out.insert(lm.clone());
        }
        if let DeleteDetection::SoftDelete { column } = &self.deletes {
            out.insert(column.clone());
        }
        out
    }

    pub fn geometry_column(&self) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.semantic_type == SemanticType::Geometry)
    }

    fn parents(&self) -> BTreeSet<String> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.references.clone())
            .collect()
    }
}

/// Static reference data for `lookup(table, key)`.
pub type LookupTables = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableDescriptor>,
    lookups: LookupTables,
    order: Vec<String>,
    levels: BTreeMap<String, usize>,
    fingerprint: String,
}

impl SchemaRegistry {
    /// Register every table, failing fast on the first unresolvable
    /// expression, unknown reference, or foreign-key cycle.
    pub fn from_config(configs: &[TableConfig], lookups: LookupTables) -> Result<Self, SchemaError> {
        let lookup_names: BTreeSet<String> = lookups.keys().cloned().collect();
        let mut tables = BTreeMap::new();

        for config in configs {
            if tables.contains_key(&config.name) {
                return Err(SchemaError::DuplicateTable(config.name.clone()));
            }
            let descriptor = register_table(config, &lookup_names)?;
            debug!(table = %descriptor.name, columns = descriptor.columns.len(), "Registered table");
            tables.insert(config.name.clone(), descriptor);
        }

        // Foreign-key targets must exist and reference real columns.
        for t in tables.values_mut() {
            for fk in &mut t.foreign_keys {
                let parent = configs
                    .iter()
                    .find(|c| c.name == fk.references)
                    .ok_or_else(|| SchemaError::UnknownTable(fk.references.clone()))?;
                if fk.ref_columns.is_empty() {
                    fk.ref_columns = parent.primary_key.clone();
                }
                if fk.ref_columns.len() != fk.columns.len() {
                    return Err(SchemaError::Parse {
                        table: t.name.clone(),
                        what: format!("foreign key to '{}'", fk.references),
                        message: "column count differs from referenced columns".to_string(),
                    });
                }
                for col in &fk.ref_columns {
                    if !parent.columns.iter().any(|c| &c.name == col) {
                        return Err(SchemaError::UnknownColumn {
                            table: parent.name.clone(),
                            column: col.clone(),
                        });
                    }
                }
            }
        }

        let (order, levels) = topological_levels(&tables)?;
        let fingerprint = fingerprint(&tables);

        info!(
            tables = tables.len(),
            order = ?order,
            schema_version = %fingerprint,
            "Schema registry loaded"
        );

        Ok(Self {
            tables,
            lookups,
            order,
            levels,
            fingerprint,
        })
    }

    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&TableDescriptor, SchemaError> {
        self.get(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.order.iter().filter_map(|n| self.tables.get(n))
    }

    /// All table names, parents before children.
    pub fn dependency_order(&self) -> &[String] {
        &self.order
    }

    /// Group `names` into waves. No two tables of a wave share a
    /// foreign-key edge; waves are ordered parents first.
    pub fn dependency_waves(&self, names: &[String]) -> Vec<Vec<String>> {
        let mut waves: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for name in &self.order {
            if names.contains(name) {
                let level = self.levels.get(name).copied().unwrap_or(0);
                waves.entry(level).or_default().push(name.clone());
            }
        }
        waves.into_values().collect()
    }

    pub fn lookups(&self) -> &LookupTables {
        &self.lookups
    }

    /// Schema-version stamp: hash of the registered descriptors.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn register_table(
    config: &TableConfig,
    lookups: &BTreeSet<String>,
) -> Result<TableDescriptor, SchemaError> {
    let table = config.name.as_str();
    let source: HashMap<String, SemanticType> = config
        .source_columns
        .iter()
        .map(|c| (c.name.clone(), c.semantic_type))
        .collect();

    let unknown_source = |column: &str| SchemaError::UnknownColumn {
        table: table.to_string(),
        column: column.to_string(),
    };

    if config.primary_key.is_empty() {
        return Err(SchemaError::Parse {
            table: table.to_string(),
            what: "primary key".to_string(),
            message: "at least one column is required".to_string(),
        });
    }
    for pk in &config.primary_key {
        if !source.contains_key(pk) {
            return Err(unknown_source(pk));
        }
        if !config.columns.iter().any(|c| &c.name == pk) {
            return Err(SchemaError::UnknownColumn {
                table: table.to_string(),
                column: pk.clone(),
            });
        }
    }
    if let Some(lm) = &config.last_modified {
        if !source.contains_key(lm) {
            return Err(unknown_source(lm));
        }
    }
    if let DeleteDetection::SoftDelete { column } = &config.deletes {
        if !source.contains_key(column) {
            return Err(unknown_source(column));
        }
    }

    let mut columns = Vec::with_capacity(config.columns.len());
    for col in &config.columns {
        let expr_source = col.expr.clone().unwrap_or_else(|| col.name.clone());
        let mut expr = Expr::parse(&expr_source).map_err(|message| SchemaError::Parse {
            table: table.to_string(),
            what: format!("expression for column '{}'", col.name),
            message,
        })?;
        if col.sanitize != SanitizeTag::None && !expr.sanitize_tags().contains(&col.sanitize) {
            expr = Expr::Sanitize(Box::new(expr), col.sanitize);
        }
        let inferred = expr.resolve(table, &col.name, &source, lookups)?;
        if let Some(from) = inferred {
            if from != col.semantic_type && !from.can_cast_to(col.semantic_type) {
                return Err(SchemaError::TypeMismatch {
                    table: table.to_string(),
                    column: col.name.clone(),
                    from,
                    to: col.semantic_type,
                });
            }
        }
        columns.push(ColumnDescriptor {
            name: col.name.clone(),
            semantic_type: col.semantic_type,
            nullable: col.nullable,
            sanitize: col.sanitize,
            expr,
            expr_source,
            max_length: col.max_length,
            zscore: col.zscore,
        });
    }

    let mut rules = Vec::with_capacity(config.rules.len());
    for rule in &config.rules {
        let predicate = Predicate::parse(&rule.expr).map_err(|message| SchemaError::Parse {
            table: table.to_string(),
            what: format!("rule '{}'", rule.id),
            message,
        })?;
        for col in predicate.columns() {
            if !columns.iter().any(|c| c.name == col) {
                return Err(SchemaError::UnknownColumn {
                    table: table.to_string(),
                    column: col,
                });
            }
        }
        rules.push(CrossFieldRule {
            id: rule.id.clone(),
            source: rule.expr.clone(),
            predicate,
            severity: rule.severity,
        });
    }

    let foreign_keys = config
        .foreign_keys
        .iter()
        .map(|fk| {
            for c in &fk.columns {
                if !columns.iter().any(|col| &col.name == c) {
                    return Err(SchemaError::UnknownColumn {
                        table: table.to_string(),
                        column: c.clone(),
                    });
                }
            }
            Ok(ForeignKey {
                columns: fk.columns.clone(),
                references: fk.references.clone(),
                ref_columns: fk.ref_columns.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TableDescriptor {
        name: config.name.clone(),
        source_name: config.source.clone().unwrap_or_else(|| config.name.clone()),
        target_name: config.target.clone().unwrap_or_else(|| config.name.clone()),
        primary_key: config.primary_key.clone(),
        source_columns: config
            .source_columns
            .iter()
            .map(|c| (c.name.clone(), c.semantic_type))
            .collect(),
        columns,
        last_modified: config.last_modified.clone(),
        deletes: config.deletes.clone(),
        foreign_keys,
        classification: config.classification,
        rules,
    })
}

/// Kahn's algorithm over the FK graph, ties broken by name. Returns the
/// order and each table's depth (longest parent chain).
fn topological_levels(
    tables: &BTreeMap<String, TableDescriptor>,
) -> Result<(Vec<String>, BTreeMap<String, usize>), SchemaError> {
    let mut indegree: BTreeMap<&str, usize> = tables.keys().map(|k| (k.as_str(), 0)).collect();
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for t in tables.values() {
        for parent in t.parents() {
            if let Some((parent_name, _)) = tables.get_key_value(&parent) {
                *indegree.entry(t.name.as_str()).or_default() += 1;
                children
                    .entry(parent_name.as_str())
                    .or_default()
                    .push(t.name.as_str());
            }
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut order = Vec::with_capacity(tables.len());
    let mut levels: BTreeMap<String, usize> = BTreeMap::new();

    while let Some(name) = ready.pop_first() {
        let level = tables[name]
            .parents()
            .iter()
            .filter_map(|p| levels.get(p).map(|l| l + 1))
            .max()
            .unwrap_or(0);
        levels.insert(name.to_string(), level);
        order.push(name.to_string());
        for child in children.get(name).cloned().unwrap_or_default() {
            if let Some(d) = indegree.get_mut(child) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() != tables.len() {
        let cyclic: Vec<String> = indegree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(k, _)| k.to_string())
            .collect();
        return Err(SchemaError::Cycle(cyclic));
    }
    Ok((order, levels))
}

fn fingerprint(tables: &BTreeMap<String, TableDescriptor>) -> String {
    let mut hasher = Sha256::new();
    for t in tables.values() {
        if let Ok(bytes) = serde_json::to_vec(t) {
            hasher.update(&bytes);
        }
    }
    hex::encode(&hasher.finalize()[..8])
}
