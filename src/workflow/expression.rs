//! Condition Expressions
//!
//! A small boolean expression language used by decision steps and by the
//! `conditions` attached to step successors.
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := operand ( ( "==" | "!=" | ">" | ">=" | "<" | "<=" ) operand )?
//! operand    := literal | path | "(" expr ")"
//! path       := ident ( "." ident | "[" integer "]" )*
//! ```
//!
//! Paths resolve against a JSON context, normally
//! `{"result": <step result>, "variables": {...}, "input": {...}}`.
//! Missing paths evaluate to `null`.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Maximum nesting of parentheses and negations.
pub const MAX_NESTING: usize = 64;

/// Parse failure with the character offset where it was detected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at position {position}")]
pub struct ExpressionError {
    /// Offset in characters from the start of the source; the source length
    /// when the expression ended early.
    pub position: usize,
    pub message: String,
}

impl ExpressionError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ident(String),
    Index(usize),
    Dot,
    Not,
    And,
    Or,
    Op(CompareOp),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// A parsed, reusable expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parses `source` into an expression.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::new(0, "Empty expression"));
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: source.chars().count(),
        };
        let ast = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ExpressionError::new(
                parser.offset(),
                format!("Unexpected token {:?}", token),
            ));
        }

        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression and applies truthiness to the result.
    pub fn evaluate(&self, context: &Value) -> bool {
        truthy(&eval(&self.ast, context))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parses and evaluates in one call.
pub fn evaluate(source: &str, context: &Value) -> Result<bool, ExpressionError> {
    Ok(Expression::parse(source)?.evaluate(context))
}

/// JSON truthiness: `false`, `null`, `0`, `""`, `[]` and `{}` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '(' => {
                tokens.push((Token::LParen, start));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                i += 1;
            }
            '.' => {
                tokens.push((Token::Dot, start));
                i += 1;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&ch| ch == ']')
                    .ok_or_else(|| ExpressionError::new(start, "Unclosed '['"))?;
                let digits: String = chars[i + 1..i + close].iter().collect();
                let index = digits
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ExpressionError::new(start, "Array index must be an integer"))?;
                tokens.push((Token::Index(index), start));
                i += close + 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ExpressionError::new(start, format!("Expected '{}{}'", c, c)));
                }
                tokens.push((if c == '&' { Token::And } else { Token::Or }, start));
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let followed_by_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, followed_by_eq) {
                    ('=', true) => Token::Op(CompareOp::Eq),
                    ('=', false) => return Err(ExpressionError::new(start, "Expected '=='")),
                    ('!', true) => Token::Op(CompareOp::Ne),
                    ('!', false) => Token::Not,
                    ('<', true) => Token::Op(CompareOp::Le),
                    ('<', false) => Token::Op(CompareOp::Lt),
                    ('>', true) => Token::Op(CompareOp::Ge),
                    (_, _) => Token::Op(CompareOp::Gt),
                };
                tokens.push((token, start));
                i += if followed_by_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::new(start, "Unterminated string")),
                        Some(&ch) if ch == quote => break,
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                text.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                i += 1;
                tokens.push((Token::Literal(Value::String(text)), start));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit())) => {
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number: Value = serde_json::from_str(&text)
                    .map_err(|_| ExpressionError::new(start, format!("Invalid number '{}'", text)))?;
                tokens.push((Token::Literal(number), start));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push((token, start));
            }
            other => {
                return Err(ExpressionError::new(
                    start,
                    format!("Unexpected character '{}'", other),
                ))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.end, |(_, p)| *p)
    }

    fn nest(&mut self, offset: usize) -> Result<(), ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(ExpressionError::new(
                offset,
                format!("Expression nests deeper than {} levels", MAX_NESTING),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::Any(terms) })
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::All(terms) })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.nest(self.offset())?;
            self.advance();
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                self.nest(offset)?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExpressionError::new(offset, "Unclosed '('")),
                }
            }
            Some(Token::Ident(name)) => {
                let mut segments = vec![Segment::Field(name)];
                loop {
                    match self.peek() {
                        Some(Token::Dot) => {
                            self.advance();
                            let field_offset = self.offset();
                            match self.advance() {
                                Some(Token::Ident(field)) => segments.push(Segment::Field(field)),
                                Some(Token::Literal(Value::Number(n))) if n.is_u64() => {
                                    segments.push(Segment::Field(n.to_string()))
                                }
                                _ => {
                                    return Err(ExpressionError::new(
                                        field_offset,
                                        "Expected field name after '.'",
                                    ))
                                }
                            }
                        }
                        Some(Token::Index(index)) => {
                            let index = *index;
                            self.advance();
                            segments.push(Segment::Index(index));
                        }
                        _ => break,
                    }
                }
                Ok(Expr::Path(segments))
            }
            Some(token) => Err(ExpressionError::new(
                offset,
                format!("Unexpected token {:?}", token),
            )),
            None => Err(ExpressionError::new(offset, "Unexpected end of expression")),
        }
    }
}

fn eval(expr: &Expr, context: &Value) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(segments) => resolve_path(context, segments),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, context))),
        Expr::All(terms) => Value::Bool(terms.iter().all(|t| truthy(&eval(t, context)))),
        Expr::Any(terms) => Value::Bool(terms.iter().any(|t| truthy(&eval(t, context)))),
        Expr::Compare(op, left, right) => {
            let left = eval(left, context);
            let right = eval(right, context);
            Value::Bool(compare(*op, &left, &right))
        }
    }
}

fn resolve_path(context: &Value, segments: &[Segment]) -> Value {
    let mut current = context;
    for segment in segments {
        let next = match segment {
            Segment::Field(name) => current.get(name.as_str()),
            Segment::Index(index) => current.get(*index),
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match op {
        CompareOp::Eq => ordering.map_or_else(|| left == right, |o| o == Ordering::Equal),
        CompareOp::Ne => ordering.map_or_else(|| left != right, |o| o != Ordering::Equal),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}
