//! Stage condition expressions
//!
//! A condition is a small boolean expression over the outputs of earlier
//! stages:
//!
//! ```text
//! test.passed == false || review.approved == false
//! !(lint.warnings > 10) && plan.kind != "docs"
//! ```
//!
//! References are `stage.key`, optionally followed by more `.field`
//! segments that index into JSON objects. Literals are numbers, quoted
//! strings, `true`, `false` and `null`. Operators, loosest first: `||`,
//! `&&`, `!`, and the comparisons `== != < <= > >=`. A bare reference is
//! tested for truthiness. Missing outputs evaluate as `null`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Outputs of finished stages, keyed by stage name then output key
pub type StageOutputs = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} at offset {offset}")]
pub struct ConditionError {
    pub message: String,
    pub offset: usize,
}

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
pub enum Expr {
    Literal(Value),
    Ref { stage: String, path: Vec<String> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition, kept alongside its source text
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if let Some((tok, offset)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError {
                message: format!("unexpected {}", tok),
                offset: *offset,
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Stage names this condition reads from, deduplicated
    pub fn referenced_stages(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_refs(&self.expr, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn evaluate(&self, outputs: &StageOutputs) -> bool {
        truthy(&eval(&self.expr, outputs))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn collect_refs<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Ref { stage, .. } => out.push(stage),
        Expr::Not(inner) => collect_refs(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Cmp(_, a, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
    }
}

fn eval(expr: &Expr, outputs: &StageOutputs) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Ref { stage, path } => lookup(outputs, stage, path),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, outputs))),
        Expr::And(a, b) => {
            Value::Bool(truthy(&eval(a, outputs)) && truthy(&eval(b, outputs)))
        }
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, outputs)) || truthy(&eval(b, outputs))),
        Expr::Cmp(op, a, b) => Value::Bool(compare(*op, &eval(a, outputs), &eval(b, outputs))),
    }
}

fn lookup(outputs: &StageOutputs, stage: &str, path: &[String]) -> Value {
    let Some((key, rest)) = path.split_first() else {
        return Value::Null;
    };
    let mut current = match outputs.get(stage).and_then(|o| o.get(key)) {
        Some(v) => v,
        None => return Value::Null,
    };
    for field in rest {
        match current.get(field.as_str()) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        };
    }
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => match op {
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            },
            _ => false,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Dot,
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Not,
    And,
    Or,
    Op(CmpOp),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier '{}'", s),
            Token::Dot => f.write_str("'.'"),
            Token::Str(s) => write!(f, "string \"{}\"", s),
            Token::Num(n) => write!(f, "number {}", n),
            Token::True => f.write_str("'true'"),
            Token::False => f.write_str("'false'"),
            Token::Null => f.write_str("'null'"),
            Token::Not => f.write_str("'!'"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Op(_) => f.write_str("comparison operator"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |message: String, offset: usize| ConditionError { message, offset };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            '.' => {
                tokens.push((Token::Dot, offset));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((Token::And, offset));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((Token::Or, offset));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((Token::Op(CmpOp::Eq), offset));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((Token::Op(CmpOp::Ne), offset));
                i += 2;
            }
            '!' => {
                tokens.push((Token::Not, offset));
                i += 1;
            }
            '<' | '>' => {
                let (op, width) = match (c, next) {
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    _ => (CmpOp::Gt, 1),
                };
                tokens.push((Token::Op(op), offset));
                i += width;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let (_, ch) = chars[j];
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.get(j + 1) {
                            value.push(*escaped);
                            j += 2;
                            continue;
                        }
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(err("unterminated string".to_string(), offset));
                }
                tokens.push((Token::Str(value), offset));
                i = j + 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.map(|n| n.is_ascii_digit()).unwrap_or(false)) =>
            {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
                let text = &source[offset..end];
                let num: f64 = text
                    .parse()
                    .map_err(|_| err(format!("invalid number '{}'", text), offset))?;
                tokens.push((Token::Num(num), offset));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].1.is_ascii_alphanumeric() || chars[j].1 == '_' || chars[j].1 == '-')
                {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
                let word = &source[offset..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((token, offset));
                i = j;
            }
            other => return Err(err(format!("unexpected character '{}'", other), offset)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, o)| *o)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        tok
    }

    fn error(&self, message: impl Into<String>) -> ConditionError {
        ConditionError {
            message: message.into(),
            offset: self.offset(),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            let rhs = self.primary()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => serde_json::Number::from_f64(n)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| self.error("number out of range")),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConditionError {
                        message: "missing ')'".to_string(),
                        offset,
                    }),
                }
            }
            Some(Token::Ident(stage)) => {
                let mut path = Vec::new();
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(field)) => path.push(field),
                        // Keywords are fine as output keys
                        Some(Token::True) => path.push("true".to_string()),
                        Some(Token::False) => path.push("false".to_string()),
                        Some(Token::Null) => path.push("null".to_string()),
                        _ => return Err(self.error("expected a field name after '.'")),
                    }
                }
                if path.is_empty() {
                    return Err(ConditionError {
                        message: format!("reference '{}' must have the form stage.key", stage),
                        offset,
                    });
                }
                Ok(Expr::Ref { stage, path })
            }
            Some(tok) => Err(ConditionError {
                message: format!("unexpected {}", tok),
                offset,
            }),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}
