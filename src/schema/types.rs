//! Column semantic types, sanitization tags and classification tiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic type of a column, independent of either store's physical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    String,
    Int,
    Float,
    Bool,
    Date,
    Geometry,
    Json,
}

impl SemanticType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "text" => Some(SemanticType::String),
            "int" | "integer" => Some(SemanticType::Int),
            "float" | "double" | "numeric" => Some(SemanticType::Float),
            "bool" | "boolean" => Some(SemanticType::Bool),
            "date" => Some(SemanticType::Date),
            "geometry" => Some(SemanticType::Geometry),
            "json" => Some(SemanticType::Json),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SemanticType::Int | SemanticType::Float)
    }

    /// Static cast compatibility, checked at registration.
    ///
    /// Strings may be parsed into anything; dates and geometries only
    /// render to text or JSON.
    pub fn can_cast_to(&self, to: SemanticType) -> bool {
        use SemanticType::*;
        if *self == to || matches!(to, String | Json) {
            return true;
        }
        match self {
            String | Json => true,
            Int | Float => matches!(to, Int | Float | Bool),
            Bool => matches!(to, Int | Float),
            Date | Geometry => false,
        }
    }

    /// Whether a runtime value conforms to this type. Nulls always conform.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (SemanticType::String, Value::String(_)) => true,
            (SemanticType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (SemanticType::Float, Value::Number(_)) => true,
            (SemanticType::Bool, Value::Bool(_)) => true,
            (SemanticType::Date, Value::String(s)) => {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
                    || chrono::DateTime::parse_from_rfc3339(s).is_ok()
            }
            (SemanticType::Geometry, Value::String(_)) | (SemanticType::Geometry, Value::Object(_)) => true,
            (SemanticType::Json, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SemanticType::String => "string",
            SemanticType::Int => "int",
            SemanticType::Float => "float",
            SemanticType::Bool => "bool",
            SemanticType::Date => "date",
            SemanticType::Geometry => "geometry",
            SemanticType::Json => "json",
        };
        f.write_str(s)
    }
}

/// Classification attached to a column that selects its sanitization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SanitizeTag {
    #[default]
    None,
    PiiName,
    PiiEmail,
    PiiPhone,
    Ssn,
    Address,
    DateOfBirth,
    CreditCard,
}

impl SanitizeTag {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SanitizeTag::None),
            "pii-name" => Some(SanitizeTag::PiiName),
            "pii-email" => Some(SanitizeTag::PiiEmail),
            "pii-phone" => Some(SanitizeTag::PiiPhone),
            "ssn" => Some(SanitizeTag::Ssn),
            "address" => Some(SanitizeTag::Address),
            "date-of-birth" => Some(SanitizeTag::DateOfBirth),
            "credit-card" => Some(SanitizeTag::CreditCard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SanitizeTag::None => "none",
            SanitizeTag::PiiName => "pii-name",
            SanitizeTag::PiiEmail => "pii-email",
            SanitizeTag::PiiPhone => "pii-phone",
            SanitizeTag::Ssn => "ssn",
            SanitizeTag::Address => "address",
            SanitizeTag::DateOfBirth => "date-of-birth",
            SanitizeTag::CreditCard => "credit-card",
        }
    }
}

/// Data classification tier of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationTier {
    Public,
    #[default]
    Internal,
    Confidential,
    Restricted,
}
