//! Cross-field predicates.
//!
//! `lhs op rhs [± tolerance]` where both sides are arithmetic over numeric
//! columns and literals, e.g. `sale_price >= 0` or
//! `land_value + improvement_value = total_value ± 1`.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::model::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arith {
    Num(f64),
    Col(String),
    Neg(Box<Arith>),
    Add(Box<Arith>, Box<Arith>),
    Sub(Box<Arith>, Box<Arith>),
    Mul(Box<Arith>, Box<Arith>),
    Div(Box<Arith>, Box<Arith>),
}

impl Arith {
    /// `None` when a referenced column is null or non-numeric, or on division by zero.
    fn eval(&self, row: &Row) -> Option<f64> {
        match self {
            Arith::Num(n) => Some(*n),
            Arith::Col(c) => row.get(c).and_then(numeric),
            Arith::Neg(a) => a.eval(row).map(|v| -v),
            Arith::Add(a, b) => Some(a.eval(row)? + b.eval(row)?),
            Arith::Sub(a, b) => Some(a.eval(row)? - b.eval(row)?),
            Arith::Mul(a, b) => Some(a.eval(row)? * b.eval(row)?),
            Arith::Div(a, b) => {
                let d = b.eval(row)?;
                if d == 0.0 {
                    None
                } else {
                    Some(a.eval(row)? / d)
                }
            }
        }
    }

    fn collect(&self, out: &mut BTreeSet<String>) {
        match self {
            Arith::Num(_) => {}
            Arith::Col(c) => {
                out.insert(c.clone());
            }
            Arith::Neg(a) => a.collect(out),
            Arith::Add(a, b) | Arith::Sub(a, b) | Arith::Mul(a, b) | Arith::Div(a, b) => {
                a.collect(out);
                b.collect(out);
            }
        }
    }
}

/// Numeric view of a JSON value; numeric strings count.
pub fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub lhs: Arith,
    pub op: CmpOp,
    pub rhs: Arith,
    pub tolerance: f64,
}

impl Predicate {
    pub fn parse(input: &str) -> Result<Predicate, String> {
        let tokens = lex(input)?;
        let mut p = ArithParser { tokens, pos: 0 };
        let lhs = p.sum()?;
        let op = match p.next() {
            Some(Tok::Cmp(op)) => op,
            other => return Err(format!("expected comparison operator, found {:?}", other)),
        };
        let rhs = p.sum()?;
        let tolerance = match p.next() {
            None => 0.0,
            Some(Tok::PlusMinus) => match p.next() {
                Some(Tok::Num(n)) if n >= 0.0 => n,
                other => return Err(format!("expected tolerance, found {:?}", other)),
            },
            Some(other) => return Err(format!("unexpected {:?}", other)),
        };
        if p.pos != p.tokens.len() {
            return Err("unexpected trailing input".to_string());
        }
        Ok(Predicate {
            lhs,
            op,
            rhs,
            tolerance,
        })
    }

    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.lhs.collect(&mut out);
        self.rhs.collect(&mut out);
        out
    }

    /// `None` if the predicate does not apply (null operands).
    pub fn evaluate(&self, row: &Row) -> Option<bool> {
        let l = self.lhs.eval(row)?;
        let r = self.rhs.eval(row)?;
        let t = self.tolerance;
        Some(match self.op {
            CmpOp::Eq => (l - r).abs() <= t,
            CmpOp::Ne => (l - r).abs() > t,
            CmpOp::Lt => l < r + t,
            CmpOp::Le => l <= r + t,
            CmpOp::Gt => l > r - t,
            CmpOp::Ge => l >= r - t,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Cmp(CmpOp),
    PlusMinus,
}

fn lex(input: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' => i += 1,
            '±' => {
                out.push(Tok::PlusMinus);
                i += 1;
            }
            '+' if next == Some('-') => {
                out.push(Tok::PlusMinus);
                i += 2;
            }
            '+' => {
                out.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                out.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                out.push(Tok::Star);
                i += 1;
            }
            '/' => {
                out.push(Tok::Slash);
                i += 1;
            }
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            '>' | '<' | '=' | '!' | '≥' | '≤' => {
                let (op, width) = match (c, next) {
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('>', _) => (CmpOp::Gt, 1),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('=', _) => (CmpOp::Eq, 1),
                    ('≥', _) => (CmpOp::Ge, 1),
                    ('≤', _) => (CmpOp::Le, 1),
                    _ => return Err("expected '=' after '!'".to_string()),
                };
                out.push(Tok::Cmp(op));
                i += width;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                out.push(Tok::Num(
                    text.parse().map_err(|_| format!("invalid number '{}'", text))?,
                ));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(out)
}

struct ArithParser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl ArithParser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn sum(&mut self) -> Result<Arith, String> {
        let mut lhs = self.product()?;
        loop {
            match self.peek() {
                Some(Tok::Plus) => {
                    self.pos += 1;
                    lhs = Arith::Add(Box::new(lhs), Box::new(self.product()?));
                }
                Some(Tok::Minus) => {
                    self.pos += 1;
                    lhs = Arith::Sub(Box::new(lhs), Box::new(self.product()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn product(&mut self) -> Result<Arith, String> {
        let mut lhs = self.factor()?;
        loop {
            match self.peek() {
                Some(Tok::Star) => {
                    self.pos += 1;
                    lhs = Arith::Mul(Box::new(lhs), Box::new(self.factor()?));
                }
                Some(Tok::Slash) => {
                    self.pos += 1;
                    lhs = Arith::Div(Box::new(lhs), Box::new(self.factor()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn factor(&mut self) -> Result<Arith, String> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Arith::Num(n)),
            Some(Tok::Ident(c)) => Ok(Arith::Col(c)),
            Some(Tok::Minus) => Ok(Arith::Neg(Box::new(self.factor()?))),
            Some(Tok::LParen) => {
                let inner = self.sum()?;
                match self.next() {
                    Some(Tok::RParen) => Ok(inner),
                    other => Err(format!("expected ')', found {:?}", other)),
                }
            }
            other => Err(format!("expected operand, found {:?}", other)),
        }
    }
}
