//! Mapping expression language.
//!
//! Grammar:
//!
//! ```text
//! expr    := call | column | literal
//! call    := "concat" "(" expr ("," expr)* ")"
//!          | "coalesce" "(" expr ("," expr)* ")"
//!          | "cast" "(" expr "," type ")"
//!          | "lookup" "(" name "," expr ")"
//!          | "sanitize" "(" expr "," tag ")"
//! literal := 'text' | "text" | number | true | false | null
//! ```
//!
//! Expressions are parsed and resolved against the source schema at
//! registration; evaluation lives in the transformer.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use super::types::{SanitizeTag, SemanticType};
use super::SchemaError;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Concat(Vec<Expr>),
    Coalesce(Vec<Expr>),
    Cast(Box<Expr>, SemanticType),
    Lookup { table: String, key: Box<Expr> },
    Sanitize(Box<Expr>, SanitizeTag),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, String> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("unexpected trailing input at token {}", parser.pos));
        }
        Ok(expr)
    }

    /// Source columns this expression reads.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Column(c) => {
                out.insert(c.clone());
            }
            Expr::Literal(_) => {}
            Expr::Concat(args) | Expr::Coalesce(args) => {
                for a in args {
                    a.collect_columns(out);
                }
            }
            Expr::Cast(inner, _) | Expr::Sanitize(inner, _) => inner.collect_columns(out),
            Expr::Lookup { key, .. } => key.collect_columns(out),
        }
    }

    /// Sanitization tags applied anywhere in the expression.
    pub fn sanitize_tags(&self) -> Vec<SanitizeTag> {
        match self {
            Expr::Sanitize(inner, tag) => {
                let mut tags = inner.sanitize_tags();
                tags.push(*tag);
                tags
            }
            Expr::Concat(args) | Expr::Coalesce(args) => {
                args.iter().flat_map(|a| a.sanitize_tags()).collect()
            }
            Expr::Cast(inner, _) => inner.sanitize_tags(),
            Expr::Lookup { key, .. } => key.sanitize_tags(),
            Expr::Column(_) | Expr::Literal(_) => Vec::new(),
        }
    }

    /// Resolve against the source schema and infer the result type.
    ///
    /// `None` means the type is unknown (a null literal or a lookup result).
    pub fn resolve(
        &self,
        table: &str,
        target_column: &str,
        source: &HashMap<String, SemanticType>,
        lookups: &BTreeSet<String>,
    ) -> Result<Option<SemanticType>, SchemaError> {
        match self {
            Expr::Column(c) => match source.get(c) {
                Some(t) => Ok(Some(*t)),
                None => Err(SchemaError::UnknownColumn {
                    table: table.to_string(),
                    column: c.clone(),
                }),
            },
            Expr::Literal(v) => Ok(literal_type(v)),
            Expr::Concat(args) => {
                for a in args {
                    a.resolve(table, target_column, source, lookups)?;
                }
                Ok(Some(SemanticType::String))
            }
            Expr::Coalesce(args) => {
                let mut out = None;
                for a in args {
                    let t = a.resolve(table, target_column, source, lookups)?;
                    if out.is_none() {
                        out = t;
                    }
                }
                Ok(out)
            }
            Expr::Cast(inner, to) => {
                let from = inner.resolve(table, target_column, source, lookups)?;
                if let Some(from) = from {
                    if !from.can_cast_to(*to) {
                        return Err(SchemaError::TypeMismatch {
                            table: table.to_string(),
                            column: target_column.to_string(),
                            from,
                            to: *to,
                        });
                    }
                }
                Ok(Some(*to))
            }
            Expr::Lookup { table: name, key } => {
                if !lookups.contains(name) {
                    return Err(SchemaError::UnknownLookup {
                        table: table.to_string(),
                        lookup: name.clone(),
                    });
                }
                key.resolve(table, target_column, source, lookups)?;
                Ok(None)
            }
            Expr::Sanitize(inner, tag) => {
                let t = inner.resolve(table, target_column, source, lookups)?;
                if *tag == SanitizeTag::DateOfBirth {
                    Ok(Some(SemanticType::Date))
                } else if *tag == SanitizeTag::None {
                    Ok(t)
                } else {
                    Ok(Some(SemanticType::String))
                }
            }
        }
    }
}

fn literal_type(v: &Value) -> Option<SemanticType> {
    match v {
        Value::Null => None,
        Value::Bool(_) => Some(SemanticType::Bool),
        Value::Number(n) if n.is_f64() => Some(SemanticType::Float),
        Value::Number(_) => Some(SemanticType::Int),
        Value::String(_) => Some(SemanticType::String),
        Value::Array(_) | Value::Object(_) => Some(SemanticType::Json),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some(&ch) if ch == quote => {
                            // Doubled quote is an escaped quote.
                            if chars.get(i + 1) == Some(&quote) {
                                s.push(quote);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                } else {
                    text.parse::<i64>().ok().map(Value::from)
                };
                match value {
                    Some(v) => tokens.push(Token::Num(v)),
                    None => return Err(format!("invalid number '{}'", text)),
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", want, t)),
            None => Err(format!("expected {:?}, found end of input", want)),
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Ident(s)) | Some(Token::Str(s)) => Ok(s),
            other => Err(format!("expected name, found {:?}", other)),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.call(&name)
                } else {
                    Ok(match name.as_str() {
                        "true" => Expr::Literal(Value::Bool(true)),
                        "false" => Expr::Literal(Value::Bool(false)),
                        "null" => Expr::Literal(Value::Null),
                        _ => Expr::Column(name),
                    })
                }
            }
            other => Err(format!("expected expression, found {:?}", other)),
        }
    }

    fn args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = vec![self.expr()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            args.push(self.expr()?);
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn call(&mut self, name: &str) -> Result<Expr, String> {
        match name {
            "concat" => Ok(Expr::Concat(self.args()?)),
            "coalesce" => Ok(Expr::Coalesce(self.args()?)),
            "cast" => {
                let inner = self.expr()?;
                self.expect(Token::Comma)?;
                let ty = self.ident()?;
                self.expect(Token::RParen)?;
                let ty = SemanticType::parse(&ty).ok_or_else(|| format!("unknown type '{}'", ty))?;
                Ok(Expr::Cast(Box::new(inner), ty))
            }
            "lookup" => {
                let table = self.ident()?;
                self.expect(Token::Comma)?;
                let key = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Lookup {
                    table,
                    key: Box::new(key),
                })
            }
            "sanitize" => {
                let inner = self.expr()?;
                self.expect(Token::Comma)?;
                let tag = self.ident()?;
                self.expect(Token::RParen)?;
                let tag =
                    SanitizeTag::parse(&tag).ok_or_else(|| format!("unknown sanitize tag '{}'", tag))?;
                Ok(Expr::Sanitize(Box::new(inner), tag))
            }
            other => Err(format!("unknown function '{}'", other)),
        }
    }
}
