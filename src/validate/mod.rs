//! Validator.
//!
//! Runs structural, cross-field and statistical rules, in that order, and
//! folds the issues into a [`ValidationVerdict`]. Outcomes are data; the
//! orchestrator decides what a blocking verdict means under the job's
//! validation mode.

use serde_json::Value;

use crate::model::{
    AnnotationKind, Operation, Severity, TransformedRecord, ValidationIssue, ValidationVerdict,
};
use crate::schema::TableDescriptor;

pub mod rules;
pub mod stats;

pub use stats::{RollingWindow, TableStats};

/// Severity a Transformer annotation maps to.
fn annotation_severity(kind: AnnotationKind) -> Severity {
    match kind {
        AnnotationKind::MissingRequired => Severity::Error,
        AnnotationKind::CastFailed => Severity::Error,
        AnnotationKind::SanitizeComplaint => Severity::Error,
        AnnotationKind::LookupMiss => Severity::Warn,
        AnnotationKind::UnknownColumn => Severity::Warn,
    }
}

fn annotation_code(kind: AnnotationKind) -> &'static str {
    match kind {
        AnnotationKind::MissingRequired => "structural:not_null",
        AnnotationKind::CastFailed => "structural:cast",
        AnnotationKind::SanitizeComplaint => "sanitize",
        AnnotationKind::LookupMiss => "lookup_miss",
        AnnotationKind::UnknownColumn => "unknown_column",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    z_threshold: f64,
}

impl Validator {
    pub fn new(z_threshold: f64) -> Self {
        Self { z_threshold }
    }

    pub fn validate(
        &self,
        table: &TableDescriptor,
        record: &TransformedRecord,
        stats: Option<&TableStats>,
    ) -> ValidationVerdict {
        if record.operation == Operation::Delete {
            return ValidationVerdict {
                key: record.key.clone(),
                passed: true,
                issues: Vec::new(),
                anomaly_score: 0.0,
            };
        }

        let mut issues = Vec::new();
        self.structural(table, record, &mut issues);
        self.cross_field(table, record, &mut issues);
        let max_z = self.statistical(table, record, stats, &mut issues);

        let severity_weight = issues
            .iter()
            .map(|i| i.severity.weight())
            .fold(0.0_f64, f64::max);
        let z_weight = max_z / (2.0 * self.z_threshold);
        let anomaly_score = severity_weight.max(z_weight).clamp(0.0, 1.0);
        let passed = issues.iter().all(|i| i.severity < Severity::Error);

        ValidationVerdict {
            key: record.key.clone(),
            passed,
            issues,
            anomaly_score,
        }
    }

    fn structural(
        &self,
        table: &TableDescriptor,
        record: &TransformedRecord,
        issues: &mut Vec<ValidationIssue>,
    ) {
        for a in &record.annotations {
            let code = match a.kind {
                AnnotationKind::SanitizeComplaint => a.rule.clone(),
                kind => annotation_code(kind).to_string(),
            };
            issues.push(ValidationIssue {
                code,
                severity: annotation_severity(a.kind),
                field: a.column.clone(),
                message: a.message.clone(),
            });
        }

        for column in &table.columns {
            let value = record.payload.get(&column.name).unwrap_or(&Value::Null);
            if !column.semantic_type.accepts(value) {
                issues.push(ValidationIssue {
                    code: "structural:type".to_string(),
                    severity: Severity::Error,
                    field: Some(column.name.clone()),
                    message: format!("value {} is not a valid {}", value, column.semantic_type),
                });
            }
            if let (Some(max), Value::String(s)) = (column.max_length, value) {
                let len = s.chars().count();
                if len > max {
                    issues.push(ValidationIssue {
                        code: "structural:length".to_string(),
                        severity: Severity::Error,
                        field: Some(column.name.clone()),
                        message: format!("length {} exceeds {}", len, max),
                    });
                }
            }
        }
    }

    fn cross_field(
        &self,
        table: &TableDescriptor,
        record: &TransformedRecord,
        issues: &mut Vec<ValidationIssue>,
    ) {
        for rule in &table.rules {
            if rule.predicate.evaluate(&record.payload) == Some(false) {
                issues.push(ValidationIssue {
                    code: format!("rule:{}", rule.id),
                    severity: rule.severity,
                    field: rule.predicate.columns().into_iter().next(),
                    message: format!("{} does not hold", rule.source),
                });
            }
        }
    }

    /// Flags outliers and returns the largest |z| seen.
    fn statistical(
        &self,
        table: &TableDescriptor,
        record: &TransformedRecord,
        stats: Option<&TableStats>,
        issues: &mut Vec<ValidationIssue>,
    ) -> f64 {
        let Some(stats) = stats else {
            return 0.0;
        };
        let mut max_z = 0.0_f64;
        for column in table.columns.iter().filter(|c| c.zscore) {
            let Some(value) = record.payload.get(&column.name).and_then(rules::numeric) else {
                continue;
            };
            let Some(z) = stats.zscore(&column.name, value) else {
                continue;
            };
            max_z = max_z.max(z.abs());
            if z.abs() > self.z_threshold {
                issues.push(ValidationIssue {
                    code: "stat:zscore".to_string(),
                    severity: Severity::Warn,
                    field: Some(column.name.clone()),
                    message: format!("|z| = {:.2} exceeds {}", z.abs(), self.z_threshold),
                });
            }
        }
        max_z
    }
}
