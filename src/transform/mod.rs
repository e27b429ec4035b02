//! Transformer.
//!
//! Turns detected source changes into target records by evaluating each
//! column's mapping expression. Never rejects a record: problems become
//! annotations and the Validator decides what they mean.

use std::sync::Arc;

use tracing::debug;

use crate::model::{
    Annotation, AnnotationKind, ChangeKind, DetectedChange, Operation, Provenance,
    TransformedRecord,
};
use crate::schema::{Expr, SchemaRegistry, TableDescriptor};

pub mod eval;
pub mod sanitize;

use eval::{evaluate, EvalContext, Evaluated};
pub use sanitize::SecretKey;

/// Pure with respect to its inputs; cheap to clone into worker tasks.
#[derive(Debug, Clone)]
pub struct Transformer {
    registry: Arc<SchemaRegistry>,
    secret: Option<SecretKey>,
}

impl Transformer {
    pub fn new(registry: Arc<SchemaRegistry>, secret: Option<SecretKey>) -> Self {
        Self { registry, secret }
    }

    /// Transform one change. `None` for no-change entries.
    pub fn transform(
        &self,
        table: &TableDescriptor,
        change: &DetectedChange,
    ) -> Option<TransformedRecord> {
        let operation = match change.kind {
            ChangeKind::NoChange => return None,
            ChangeKind::Delete => {
                return Some(TransformedRecord {
                    table: table.name.clone(),
                    key: change.key.clone(),
                    payload: change.key.to_row(&table.primary_key),
                    operation: Operation::Delete,
                    provenance: Provenance {
                        source_key: Some(change.key.clone()),
                        rules: Vec::new(),
                    },
                    annotations: Vec::new(),
                    source_timestamp: change.source_timestamp,
                    source_hash: change.source_hash.clone(),
                });
            }
            ChangeKind::Insert => Operation::Insert,
            ChangeKind::Update => Operation::Update,
        };

        let empty = Default::default();
        let row = change.new_image.as_ref().unwrap_or(&empty);
        let mut out = Evaluated::default();

        for column in row.keys() {
            if !table.has_source_column(column) {
                out.annotations.push(Annotation {
                    kind: AnnotationKind::UnknownColumn,
                    rule: "coerce".to_string(),
                    column: Some(column.clone()),
                    message: format!("ignored unregistered source column '{}'", column),
                });
            }
        }

        let mut payload = crate::model::Row::new();
        for column in &table.columns {
            let ctx = EvalContext {
                lookups: self.registry.lookups(),
                secret: self.secret.as_ref(),
                column: &column.name,
            };
            if column.expr != Expr::Column(column.name.clone()) {
                out.rules.push(format!("map:{}", column.name));
            }
            let evaluated = evaluate(&column.expr, row, &ctx, &mut out);
            // Coerce to the registered type; keep the raw value on failure so
            // the dead letter shows what arrived.
            let value = match eval::cast(&evaluated, column.semantic_type) {
                Some(v) => v,
                None => {
                    out.annotations.push(Annotation {
                        kind: AnnotationKind::CastFailed,
                        rule: format!("coerce:{}", column.semantic_type),
                        column: Some(column.name.clone()),
                        message: format!(
                            "cannot coerce {} to {}",
                            evaluated, column.semantic_type
                        ),
                    });
                    evaluated
                }
            };
            if value.is_null() && !column.nullable {
                out.annotations.push(Annotation {
                    kind: AnnotationKind::MissingRequired,
                    rule: "not_null".to_string(),
                    column: Some(column.name.clone()),
                    message: format!("required column '{}' is null", column.name),
                });
            }
            payload.insert(column.name.clone(), value);
        }

        if !out.annotations.is_empty() {
            debug!(
                table = %table.name,
                key = %change.key,
                annotations = out.annotations.len(),
                "Transformer annotated record"
            );
        }

        out.rules.dedup();
        Some(TransformedRecord {
            table: table.name.clone(),
            key: change.key.clone(),
            payload,
            operation,
            provenance: Provenance {
                source_key: Some(change.key.clone()),
                rules: out.rules,
            },
            annotations: out.annotations,
            source_timestamp: change.source_timestamp,
            source_hash: change.source_hash.clone(),
        })
    }

    /// Whether any registered column needs the secret.
    pub fn needs_secret(registry: &SchemaRegistry) -> bool {
        registry
            .tables()
            .any(|t| t.columns.iter().any(|c| !c.expr.sanitize_tags().is_empty()))
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }
}
