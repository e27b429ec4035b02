//! Expression evaluation against a source row.

use chrono::{DateTime, NaiveDate};
use serde_json::{json, Value};

use super::sanitize::{sanitize, SecretKey};
use crate::model::{Annotation, AnnotationKind, Row};
use crate::schema::{Expr, LookupTables, SemanticType};

/// Everything an expression may read besides the row itself.
pub struct EvalContext<'a> {
    pub lookups: &'a LookupTables,
    pub secret: Option<&'a SecretKey>,
    pub column: &'a str,
}

/// Evaluation output: the value plus the rule ids that fired and any
/// complaints raised along the way.
#[derive(Debug, Default)]
pub struct Evaluated {
    pub rules: Vec<String>,
    pub annotations: Vec<Annotation>,
}

pub fn evaluate(expr: &Expr, row: &Row, ctx: &EvalContext<'_>, out: &mut Evaluated) -> Value {
    match expr {
        Expr::Column(c) => row.get(c).cloned().unwrap_or(Value::Null),
        Expr::Literal(v) => v.clone(),
        Expr::Concat(args) => {
            let parts: Vec<Value> = args.iter().map(|a| evaluate(a, row, ctx, out)).collect();
            if parts.iter().all(Value::is_null) {
                return Value::Null;
            }
            let joined: String = parts.iter().map(display).collect();
            Value::String(joined)
        }
        Expr::Coalesce(args) => {
            for a in args {
                let v = evaluate(a, row, ctx, out);
                if !v.is_null() {
                    return v;
                }
            }
            Value::Null
        }
        Expr::Cast(inner, to) => {
            let v = evaluate(inner, row, ctx, out);
            out.rules.push(format!("cast:{}", to));
            match cast(&v, *to) {
                Some(cast) => cast,
                None => {
                    out.annotations.push(Annotation {
                        kind: AnnotationKind::CastFailed,
                        rule: format!("cast:{}", to),
                        column: Some(ctx.column.to_string()),
                        message: format!("cannot cast {} to {}", v, to),
                    });
                    Value::Null
                }
            }
        }
        Expr::Lookup { table, key } => {
            let k = evaluate(key, row, ctx, out);
            out.rules.push(format!("lookup:{}", table));
            if k.is_null() {
                return Value::Null;
            }
            let found = ctx
                .lookups
                .get(table)
                .and_then(|entries| entries.get(&display(&k)));
            match found {
                Some(v) => v.clone(),
                None => {
                    out.annotations.push(Annotation {
                        kind: AnnotationKind::LookupMiss,
                        rule: format!("lookup:{}", table),
                        column: Some(ctx.column.to_string()),
                        message: format!("no entry for '{}' in lookup '{}'", display(&k), table),
                    });
                    Value::Null
                }
            }
        }
        Expr::Sanitize(inner, tag) => {
            let v = evaluate(inner, row, ctx, out);
            let rule = format!("sanitize:{}", tag.as_str());
            out.rules.push(rule.clone());
            let Some(secret) = ctx.secret else {
                out.annotations.push(Annotation {
                    kind: AnnotationKind::SanitizeComplaint,
                    rule,
                    column: Some(ctx.column.to_string()),
                    message: "no sanitization secret configured".to_string(),
                });
                return Value::Null;
            };
            let sanitized = sanitize(*tag, &v, secret);
            if let Some(message) = sanitized.complaint {
                out.annotations.push(Annotation {
                    kind: AnnotationKind::SanitizeComplaint,
                    rule,
                    column: Some(ctx.column.to_string()),
                    message,
                });
            }
            sanitized.value
        }
    }
}

/// Text form used by `concat` and lookup keys.
pub fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Convert `v` to `to`. `None` when the conversion is impossible. Nulls
/// always convert.
pub fn cast(v: &Value, to: SemanticType) -> Option<Value> {
    if v.is_null() {
        return Some(Value::Null);
    }
    match to {
        SemanticType::String => Some(Value::String(display(v))),
        SemanticType::Int => match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from),
            Value::String(s) => {
                let t = s.trim();
                t.parse::<i64>().ok().map(Value::from).or_else(|| {
                    t.parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0 && f.is_finite())
                        .map(|f| Value::from(f as i64))
                })
            }
            Value::Bool(b) => Some(Value::from(i64::from(*b))),
            _ => None,
        },
        SemanticType::Float => match v {
            Value::Number(n) => n.as_f64().map(|f| json!(f)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| json!(f)),
            Value::Bool(b) => Some(json!(if *b { 1.0 } else { 0.0 })),
            _ => None,
        },
        SemanticType::Bool => match v {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f == 0.0 => Some(Value::Bool(false)),
                Some(f) if f == 1.0 => Some(Value::Bool(true)),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        SemanticType::Date => match v {
            Value::String(s) => parse_date(s).map(Value::String),
            _ => None,
        },
        SemanticType::Geometry => match v {
            Value::Object(o) if o.contains_key("type") && o.contains_key("coordinates") => {
                Some(v.clone())
            }
            Value::String(s) => parse_wkt_point(s),
            _ => None,
        },
        SemanticType::Json => match v {
            Value::String(s) => Some(serde_json::from_str(s).unwrap_or_else(|_| v.clone())),
            other => Some(other.clone()),
        },
    }
}

/// Normalize to `YYYY-MM-DD`. Accepts dates and RFC 3339 timestamps.
fn parse_date(s: &str) -> Option<String> {
    let t = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%m/%d/%Y") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    DateTime::parse_from_rfc3339(t)
        .ok()
        .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
}

/// `POINT(x y)` to a GeoJSON point.
fn parse_wkt_point(s: &str) -> Option<Value> {
    let t = s.trim();
    let upper = t.to_ascii_uppercase();
    let body = upper.strip_prefix("POINT")?.trim();
    let inner = body.strip_prefix('(')?.strip_suffix(')')?;
    let mut parts = inner.split_whitespace();
    let x: f64 = parts.next()?.parse().ok()?;
    let y: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(json!({ "type": "Point", "coordinates": [x, y] }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn run(src: &str, row: &Row, lookups: &LookupTables) -> (Value, Evaluated) {
        let expr = Expr::parse(src).unwrap();
        let ctx = EvalContext {
            lookups,
            secret: None,
            column: "out",
        };
        let mut out = Evaluated::default();
        let v = evaluate(&expr, row, &ctx, &mut out);
        (v, out)
    }

    #[test]
    fn test_concat_and_coalesce() {
        let r = row(&[("first", json!("Ada")), ("last", json!("Byron")), ("nick", Value::Null)]);
        let none = BTreeMap::new();
        assert_eq!(run("concat(first, ' ', last)", &r, &none).0, json!("Ada Byron"));
        assert_eq!(run("coalesce(nick, first)", &r, &none).0, json!("Ada"));
        assert_eq!(run("concat(nick)", &r, &none).0, Value::Null);
    }

    #[test]
    fn test_cast_failure_annotates() {
        let r = row(&[("acres", json!("n/a"))]);
        let (v, out) = run("cast(acres, float)", &r, &BTreeMap::new());
        assert_eq!(v, Value::Null);
        assert_eq!(out.annotations[0].kind, AnnotationKind::CastFailed);
        assert_eq!(out.rules, vec!["cast:float".to_string()]);
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let mut lookups = BTreeMap::new();
        let mut land_use = BTreeMap::new();
        land_use.insert("R1".to_string(), json!("Residential"));
        lookups.insert("land_use".to_string(), land_use);

        let hit = run("lookup(land_use, code)", &row(&[("code", json!("R1"))]), &lookups);
        assert_eq!(hit.0, json!("Residential"));

        let miss = run("lookup(land_use, code)", &row(&[("code", json!("X9"))]), &lookups);
        assert_eq!(miss.0, Value::Null);
        assert_eq!(miss.1.annotations[0].kind, AnnotationKind::LookupMiss);
    }

    #[test]
    fn test_sanitize_without_secret_complains() {
        let (v, out) = run("sanitize(owner, pii-name)", &row(&[("owner", json!("x"))]), &BTreeMap::new());
        assert_eq!(v, Value::Null);
        assert_eq!(out.annotations[0].kind, AnnotationKind::SanitizeComplaint);
    }

    #[test]
    fn test_cast_conversions() {
        assert_eq!(cast(&json!("42"), SemanticType::Int), Some(json!(42)));
        assert_eq!(cast(&json!(3.0), SemanticType::Int), Some(json!(3)));
        assert_eq!(cast(&json!(3.5), SemanticType::Int), None);
        assert_eq!(cast(&json!("yes"), SemanticType::Bool), Some(json!(true)));
        assert_eq!(cast(&json!("04/01/2024"), SemanticType::Date), Some(json!("2024-04-01")));
        assert_eq!(
            cast(&json!("POINT(-119.1 46.2)"), SemanticType::Geometry),
            Some(json!({"type": "Point", "coordinates": [-119.1, 46.2]}))
        );
        assert_eq!(cast(&json!("{\"a\":1}"), SemanticType::Json), Some(json!({"a": 1})));
        assert_eq!(cast(&Value::Null, SemanticType::Date), Some(Value::Null));
    }
}
