//! Keyed sanitization.
//!
//! Every transformation is a pure function of the input value and the
//! deployment secret, so sanitized columns stay joinable across runs.
//! Rotating the secret changes every derived pseudonym.

use chrono::{Datelike, Duration, NaiveDate};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::schema::SanitizeTag;

type HmacSha256 = Hmac<Sha256>;

const FIRST_NAMES: &[&str] = &[
    "Alder", "Briar", "Cedar", "Dale", "Ellis", "Fern", "Glen", "Harper", "Iris", "Jude", "Kit",
    "Lane", "Moss", "Noel", "Oak", "Perry", "Quinn", "Reed", "Sage", "Tate", "Vale", "Wren",
    "Yael", "Zeph",
];

const LAST_NAMES: &[&str] = &[
    "Ashford", "Brookes", "Caldwell", "Dunmore", "Everly", "Fairbanks", "Greer", "Hollis",
    "Ingram", "Jessup", "Kendrick", "Lowell", "Merritt", "Northcott", "Oakley", "Pembrook",
    "Quarles", "Radley", "Stanton", "Thorne", "Underwood", "Voss", "Whitcomb", "Yardley",
];

/// Per-deployment sanitization secret. Never printed.
#[derive(Clone)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// HMAC-SHA256 of `input`, domain-separated by `tag`.
    pub fn digest(&self, tag: SanitizeTag, input: &str) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(self.0.as_bytes()) else {
            let mut hasher = Sha256::new();
            hasher.update(self.0.as_bytes());
            hasher.update(tag.as_str().as_bytes());
            hasher.update(input.as_bytes());
            return to_array(&hasher.finalize());
        };
        mac.update(tag.as_str().as_bytes());
        mac.update(&[0]);
        mac.update(input.as_bytes());
        to_array(&mac.finalize().into_bytes())
    }
}

fn to_array(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[..32]);
    out
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([redacted])")
    }
}

/// Result of sanitizing one value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub value: Value,
    /// Set when the input did not have the shape the tag expects. The value
    /// is still masked.
    pub complaint: Option<String>,
}

impl Sanitized {
    fn ok(value: Value) -> Self {
        Self {
            value,
            complaint: None,
        }
    }

    fn complain(value: Value, complaint: impl Into<String>) -> Self {
        Self {
            value,
            complaint: Some(complaint.into()),
        }
    }
}

/// Apply `tag` to `value`. Nulls pass through untouched.
pub fn sanitize(tag: SanitizeTag, value: &Value, secret: &SecretKey) -> Sanitized {
    if value.is_null() || tag == SanitizeTag::None {
        return Sanitized::ok(value.clone());
    }
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            let hashed = hex::encode(&secret.digest(tag, &other.to_string())[..8]);
            return Sanitized::complain(
                Value::String(hashed),
                format!("{} expects text, got {}", tag.as_str(), type_name(other)),
            );
        }
    };
    match tag {
        SanitizeTag::None => Sanitized::ok(value.clone()),
        SanitizeTag::PiiName => pii_name(&text, secret),
        SanitizeTag::PiiEmail => pii_email(&text, secret),
        SanitizeTag::PiiPhone => pii_phone(&text, secret),
        SanitizeTag::Ssn => ssn(&text),
        SanitizeTag::Address => address(&text, secret),
        SanitizeTag::DateOfBirth => date_of_birth(&text, secret),
        SanitizeTag::CreditCard => credit_card(&text),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn pii_name(text: &str, secret: &SecretKey) -> Sanitized {
    let normalized = text.trim().to_lowercase();
    let d = secret.digest(SanitizeTag::PiiName, &normalized);
    let first = FIRST_NAMES[d[0] as usize % FIRST_NAMES.len()];
    let last = LAST_NAMES[d[1] as usize % LAST_NAMES.len()];
    let suffix = u16::from_be_bytes([d[2], d[3]]) % 1000;
    let pseudonym = Value::String(format!("{first} {last} {suffix:03}"));
    if normalized.is_empty() {
        Sanitized::complain(pseudonym, "empty name")
    } else {
        Sanitized::ok(pseudonym)
    }
}

fn pii_email(text: &str, secret: &SecretKey) -> Sanitized {
    let trimmed = text.trim();
    match trimmed.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {
            let hashed = hex::encode(&secret.digest(SanitizeTag::PiiEmail, &local.to_lowercase())[..6]);
            Sanitized::ok(Value::String(format!("{hashed}@{}", domain.to_lowercase())))
        }
        _ => {
            let hashed = hex::encode(&secret.digest(SanitizeTag::PiiEmail, trimmed)[..6]);
            Sanitized::complain(
                Value::String(format!("{hashed}@invalid")),
                "malformed email address",
            )
        }
    }
}

/// Replace the last `count` digits of `text` (keeping separators) with
/// digits derived from `digest`.
fn replace_trailing_digits(text: &str, count: usize, digest: &[u8; 32]) -> String {
    let mut remaining = count;
    let mut out: Vec<char> = text.chars().collect();
    let mut i = 0;
    for c in out.iter_mut().rev() {
        if remaining == 0 {
            break;
        }
        if c.is_ascii_digit() {
            let digit = digest[i % digest.len()] % 10;
            *c = char::from(b'0' + digit);
            remaining -= 1;
            i += 1;
        }
    }
    out.into_iter().collect()
}

fn pii_phone(text: &str, secret: &SecretKey) -> Sanitized {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    let d = secret.digest(SanitizeTag::PiiPhone, &digits);
    let masked = replace_trailing_digits(text, 7, &d);
    if digits.len() < 7 {
        Sanitized::complain(Value::String(masked), "phone number has fewer than seven digits")
    } else {
        Sanitized::ok(Value::String(masked))
    }
}

/// Mask every digit but the last four, preserving separators.
fn mask_keep_last_four(text: &str) -> String {
    let total = text.chars().filter(|c| c.is_ascii_digit()).count();
    let mut seen = 0;
    text.chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen + 4 <= total {
                    '*'
                } else {
                    c
                }
            } else {
                c
            }
        })
        .collect()
}

fn ssn(text: &str) -> Sanitized {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 9 || text.chars().any(|c| !c.is_ascii_digit() && c != '-' && c != ' ') {
        let masked: String = text.chars().map(|_| '*').collect();
        return Sanitized::complain(Value::String(masked), "SSN must have nine digits");
    }
    Sanitized::ok(Value::String(format!("***-**-{}", &digits[5..])))
}

fn address(text: &str, secret: &SecretKey) -> Sanitized {
    let trimmed = text.trim_start();
    let number_len = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if number_len == 0 {
        return Sanitized::complain(Value::String(text.to_string()), "address has no street number");
    }
    let (number, rest) = trimmed.split_at(number_len);
    let d = secret.digest(SanitizeTag::Address, number);
    let mut replacement = String::with_capacity(number_len);
    for i in 0..number_len {
        let digit = if i == 0 {
            1 + d[i % d.len()] % 9
        } else {
            d[i % d.len()] % 10
        };
        replacement.push(char::from(b'0' + digit));
    }
    Sanitized::ok(Value::String(format!("{replacement}{rest}")))
}

fn date_of_birth(text: &str, secret: &SecretKey) -> Sanitized {
    let trimmed = text.trim();
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
        return Sanitized::complain(Value::Null, "date of birth is not YYYY-MM-DD");
    };
    let d = secret.digest(SanitizeTag::DateOfBirth, date_part);
    let offset = i64::from(u16::from_be_bytes([d[0], d[1]]) % 61) - 30;
    let mut shifted = date + Duration::days(offset);
    if shifted.year() != date.year() {
        // Reflect across the boundary so the year is kept.
        shifted = date - Duration::days(offset);
    }
    Sanitized::ok(Value::String(shifted.format("%Y-%m-%d").to_string()))
}

fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0;
    for (i, c) in digits.chars().rev().enumerate() {
        let mut d = c.to_digit(10).unwrap_or(0);
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

fn credit_card(text: &str) -> Sanitized {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    let masked = Value::String(mask_keep_last_four(text));
    if !(13..=19).contains(&digits.len()) {
        return Sanitized::complain(masked, "card number must have 13 to 19 digits");
    }
    if !luhn_valid(&digits) {
        return Sanitized::complain(masked, "card number fails checksum");
    }
    Sanitized::ok(masked)
}
