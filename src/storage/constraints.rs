//! Referential constraints enforced by the store on every commit.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{Result, StorageError};
use crate::model::{KeyPart, RecordKey, Row};
use crate::schema::{ForeignKey, SchemaRegistry};

/// Rows of `table` whose `columns` equal `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    /// Set when `columns` is the table's primary key, allowing a direct lookup.
    pub key: Option<RecordKey>,
}

impl Reference {
    pub fn matches(&self, row: &Row) -> bool {
        self.columns
            .iter()
            .zip(&self.values)
            .all(|(column, value)| row.get(column).is_some_and(|v| values_equal(v, value)))
    }
}

/// JSON equality with numbers compared by value, so `1` matches `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[derive(Debug, Clone, Default)]
struct TableConstraints {
    primary_key: Vec<String>,
    parents: Vec<ForeignKey>,
    children: Vec<(String, ForeignKey)>,
}

/// Foreign-key graph of the target schema.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    tables: BTreeMap<String, TableConstraints>,
}

impl Constraints {
    pub fn from_registry(registry: &SchemaRegistry) -> Self {
        let mut tables: BTreeMap<String, TableConstraints> = BTreeMap::new();
        for descriptor in registry.tables() {
            let entry = tables.entry(descriptor.name.clone()).or_default();
            entry.primary_key = descriptor.primary_key.clone();
            entry.parents = descriptor.foreign_keys.clone();
        }
        for descriptor in registry.tables() {
            for fk in &descriptor.foreign_keys {
                tables
                    .entry(fk.references.clone())
                    .or_default()
                    .children
                    .push((descriptor.name.clone(), fk.clone()));
            }
        }
        Self { tables }
    }

    pub fn primary_key(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(|t| t.primary_key.as_slice())
    }

    /// Parent rows that must exist before `row` can be written to `table`.
    /// A foreign key with any null column is not enforced.
    pub fn parent_references(&self, table: &str, row: &Row) -> Vec<Reference> {
        let Some(constraints) = self.tables.get(table) else {
            return Vec::new();
        };
        constraints
            .parents
            .iter()
            .filter_map(|fk| {
                let values = collect_values(row, &fk.columns)?;
                Some(self.reference(&fk.references, &fk.ref_columns, values))
            })
            .collect()
    }

    /// Child rows that would be orphaned by deleting `row` from `table`.
    pub fn child_references(&self, table: &str, row: &Row) -> Vec<Reference> {
        let Some(constraints) = self.tables.get(table) else {
            return Vec::new();
        };
        constraints
            .children
            .iter()
            .filter_map(|(child, fk)| {
                let values = collect_values(row, &fk.ref_columns)?;
                Some(self.reference(child, &fk.columns, values))
            })
            .collect()
    }

    /// The row must carry the key it is written under.
    pub fn check_key(&self, table: &str, key: &RecordKey, row: &Row) -> Result<()> {
        let Some(pk) = self.primary_key(table) else {
            return Ok(());
        };
        match RecordKey::from_row(row, pk) {
            Some(found) if &found == key => Ok(()),
            _ => Err(StorageError::RowRejected {
                table: table.to_string(),
                key: key.clone(),
                reason: format!("primary key {:?} missing or does not match", pk),
            }),
        }
    }

    fn reference(&self, table: &str, columns: &[String], values: Vec<Value>) -> Reference {
        let key = match self.primary_key(table) {
            Some(pk) if pk == columns => values
                .iter()
                .map(KeyPart::from_value)
                .collect::<Option<Vec<_>>>()
                .map(RecordKey),
            _ => None,
        };
        Reference {
            table: table.to_string(),
            columns: columns.to_vec(),
            values,
            key,
        }
    }
}

fn collect_values(row: &Row, columns: &[String]) -> Option<Vec<Value>> {
    columns
        .iter()
        .map(|c| row.get(c).filter(|v| !v.is_null()).cloned())
        .collect()
}

/// Rejection for a missing parent.
pub(crate) fn orphan(table: &str, key: &RecordKey, parent: &Reference) -> StorageError {
    StorageError::RowRejected {
        table: table.to_string(),
        key: key.clone(),
        reason: format!(
            "no {} row with {:?} = {:?}",
            parent.table, parent.columns, parent.values
        ),
    }
}

/// Rejection for a delete that would orphan children.
pub(crate) fn referenced(table: &str, key: &RecordKey, child: &Reference) -> StorageError {
    StorageError::RowRejected {
        table: table.to_string(),
        key: key.clone(),
        reason: format!("still referenced by {} rows", child.table),
    }
}
