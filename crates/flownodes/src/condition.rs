//! Small expression language for condition rules and post-filters.
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | operand (cmp operand)?
//! cmp     := "==" | "!=" | ">" | ">=" | "<" | "<="
//! operand := number | 'text' | "text" | true | false | null | path
//! ```
//!
//! Paths resolve against the business payload (`order.total`, `items.0.sku`);
//! a `passData.` prefix reads pass-through data instead. Missing paths are
//! `null`. The whole expression must produce a boolean.

use flowcore::{lookup, ConditionEvaluationError, ConditionEvaluator, FlowData};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Default, Clone, Copy)]
pub struct RuleConditionEvaluator;

impl RuleConditionEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ConditionEvaluator for RuleConditionEvaluator {
    fn evaluate(&self, expression: &str, data: &FlowData) -> Result<bool, ConditionEvaluationError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
        };
        let ast = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error(format!("unexpected {:?}", parser.tokens[parser.pos])));
        }
        match ast.eval(data) {
            Value::Bool(result) => Ok(result),
            other => Err(ConditionEvaluationError::NotBoolean {
                expression: expression.to_string(),
                actual: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

fn parse_error(expression: &str, message: impl Into<String>) -> ConditionEvaluationError {
    ConditionEvaluationError::Parse {
        expression: expression.to_string(),
        message: message.into(),
    }
}

fn tokenize(expression: &str) -> Result<Vec<Token>, ConditionEvaluationError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    _ => CmpOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|offset| start + offset)
                    .ok_or_else(|| parse_error(expression, "unterminated string"))?;
                tokens.push(Token::Text(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| parse_error(expression, format!("bad number '{}'", literal)))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(parse_error(expression, format!("unexpected character '{}'", other)));
            }
        }
    }

    if tokens.is_empty() {
        return Err(parse_error(expression, "empty expression"));
    }
    Ok(tokens)
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(String),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> ConditionEvaluationError {
        parse_error(self.expression, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionEvaluationError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionEvaluationError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionEvaluationError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionEvaluationError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.bump() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(self.error("missing ')'")),
            };
        }

        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionEvaluationError> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Text(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(ident)) => Ok(match ident.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Path(ident),
            }),
            Some(token) => Err(self.error(format!("expected a value, found {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

impl Expr {
    fn eval(&self, data: &FlowData) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Path(path) => resolve(data, path),
            Expr::Compare(left, op, right) => {
                Value::Bool(compare(&left.eval(data), *op, &right.eval(data)))
            }
            Expr::Not(inner) => match inner.eval(data) {
                Value::Bool(b) => Value::Bool(!b),
                other => other,
            },
            Expr::And(left, right) => match left.eval(data) {
                Value::Bool(false) => Value::Bool(false),
                Value::Bool(true) => right.eval(data),
                other => other,
            },
            Expr::Or(left, right) => match left.eval(data) {
                Value::Bool(true) => Value::Bool(true),
                Value::Bool(false) => right.eval(data),
                other => other,
            },
        }
    }
}

fn resolve(data: &FlowData, path: &str) -> Value {
    let found = match path.strip_prefix("passData.") {
        Some(rest) => {
            let (key, rest) = rest.split_once('.').unwrap_or((rest, ""));
            data.pass_data.get(key).and_then(|v| lookup(v, rest))
        }
        None => data.get(path.strip_prefix("business.").unwrap_or(path)),
    };
    found.cloned().unwrap_or(Value::Null)
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match op {
        CmpOp::Eq => ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right),
        CmpOp::Ne => !(ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}
