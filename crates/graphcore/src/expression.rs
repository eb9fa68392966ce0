//! Minimal evaluator for literal parameter expressions.
//!
//! Supports numbers, booleans, `null`, quoted strings, identifiers looked up
//! in a caller-supplied scope, unary `-`/`!`, arithmetic, comparisons,
//! `&&`/`||` with short-circuiting, parentheses and a handful of numeric
//! functions (`min`, `max`, `abs`, `floor`, `ceil`, `clamp`).

use crate::{ExpressionError, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// A parsed expression, ready to be evaluated against a scope.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

const OPERATORS: [&str; 15] = [
    "&&", "||", "<=", ">=", "==", "!=", "<", ">", "+", "-", "*", "/", "%", "!", "=",
];

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(parse_error(source, 0, "empty expression"));
        }

        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let root = parser.expression()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(parse_error(source, *offset, &format!("unexpected {:?}", token)));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates against `scope`. `node` only appears in diagnostics.
    pub fn evaluate<S>(&self, scope: S, node: &str) -> Result<Value, ExpressionError>
    where
        S: Fn(&str) -> Option<Value>,
    {
        Evaluator {
            source: &self.source,
            node,
            scope: &scope,
        }
        .eval(&self.root)
    }
}

fn parse_error(source: &str, position: usize, message: &str) -> ExpressionError {
    ExpressionError::Parse {
        expression: source.to_string(),
        position,
        message: message.to_string(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            if i < chars.len() && chars[i].1 == '.' {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                is_float = true;
                i += 1;
                if i < chars.len() && matches!(chars[i].1, '+' | '-') {
                    i += 1;
                }
                let digits = i;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
                if digits == i {
                    return Err(parse_error(source, offset, "malformed exponent"));
                }
            }

            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let token = if is_float {
                text.parse::<f64>().map(Token::Float).ok()
            } else {
                text.parse::<i64>().map(Token::Int).ok()
            };
            let token = token.ok_or_else(|| parse_error(source, offset, "number out of range"))?;
            tokens.push((offset, token));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            tokens.push((offset, Token::Ident(ident)));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&(_, next)) = chars.get(i) else {
                    return Err(parse_error(source, offset, "unterminated string"));
                };
                i += 1;
                match next {
                    '\\' => {
                        let Some(&(_, escaped)) = chars.get(i) else {
                            return Err(parse_error(source, offset, "unterminated string"));
                        };
                        i += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    c if c == quote => break,
                    c => text.push(c),
                }
            }
            tokens.push((offset, Token::Str(text)));
            continue;
        }

        match c {
            '(' => tokens.push((offset, Token::LParen)),
            ')' => tokens.push((offset, Token::RParen)),
            ',' => tokens.push((offset, Token::Comma)),
            _ => {
                let rest = &source[offset..];
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| parse_error(source, offset, &format!("unexpected character '{}'", c)))?;
                if *op == "=" {
                    return Err(parse_error(source, offset, "assignment is not supported, use '=='"));
                }
                tokens.push((offset, Token::Op(op)));
                i += op.len();
                continue;
            }
        }
        i += 1;
    }

    Ok(tokens)
}

struct Parser<'s> {
    source: &'s str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.source.len())
    }

    fn eat_op(&mut self, candidates: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if candidates.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expression(&mut self) -> Result<Expr, ExpressionError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.equality()?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.comparison()?;
        while let Some(op) = self.eat_op(&["==", "!="]) {
            let rhs = self.comparison()?;
            let op = if op == "==" { BinaryOp::Eq } else { BinaryOp::Ne };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.additive()?;
        while let Some(op) = self.eat_op(&["<", "<=", ">", ">="]) {
            let rhs = self.additive()?;
            let op = match op {
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                _ => BinaryOp::Ge,
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.multiplicative()?;
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let rhs = self.unary()?;
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if let Some(op) = self.eat_op(&["-", "!"]) {
            let operand = self.unary()?;
            let op = if op == "-" { UnaryOp::Neg } else { UnaryOp::Not };
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        let Some(token) = self.peek().cloned() else {
            return Err(parse_error(self.source, offset, "unexpected end of expression"));
        };
        self.pos += 1;

        match token {
            Token::Int(n) => Ok(Expr::Literal(Value::Int(n))),
            Token::Float(n) => Ok(Expr::Literal(Value::Float(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let args = self.arguments()?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Ident(name)),
            },
            Token::LParen => {
                let inner = self.expression()?;
                self.expect_rparen()?;
                Ok(inner)
            }
            other => Err(parse_error(self.source, offset, &format!("unexpected {:?}", other))),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                continue;
            }
            self.expect_rparen()?;
            return Ok(args);
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ExpressionError> {
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            Ok(())
        } else {
            Err(parse_error(self.source, self.offset(), "expected ')'"))
        }
    }
}

struct Evaluator<'a> {
    source: &'a str,
    node: &'a str,
    scope: &'a dyn Fn(&str) -> Option<Value>,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => (self.scope)(name).ok_or_else(|| ExpressionError::UnknownIdentifier {
                identifier: name.clone(),
                node: self.node.to_string(),
            }),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match (op, value) {
                    (UnaryOp::Neg, Value::Int(n)) => n
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| self.arithmetic("integer overflow")),
                    (UnaryOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, other) => Err(self.type_error("number", &other)),
                    (UnaryOp::Not, other) => Err(self.type_error("bool", &other)),
                }
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                if !self.eval_bool(lhs)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval_bool(rhs)?))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                if self.eval_bool(lhs)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval_bool(rhs)?))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                self.binary(*op, lhs, rhs)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, args)
            }
        }
    }

    fn eval_bool(&self, expr: &Expr) -> Result<bool, ExpressionError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(self.type_error("bool", &other)),
        }
    }

    fn binary(&self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExpressionError> {
        use BinaryOp::*;

        match op {
            Add if matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)) => {
                Ok(Value::Str(format!("{}{}", lhs, rhs)))
            }
            Add | Sub | Mul | Rem => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => {
                    let result = match op {
                        Add => a.checked_add(*b),
                        Sub => a.checked_sub(*b),
                        Mul => a.checked_mul(*b),
                        _ if *b == 0 => return Err(self.arithmetic("division by zero")),
                        _ => a.checked_rem(*b),
                    };
                    result
                        .map(Value::Int)
                        .ok_or_else(|| self.arithmetic("integer overflow"))
                }
                _ => {
                    let (a, b) = self.numbers(&lhs, &rhs)?;
                    if op == Rem && b == 0.0 {
                        return Err(self.arithmetic("division by zero"));
                    }
                    Ok(Value::Float(match op {
                        Add => a + b,
                        Sub => a - b,
                        Mul => a * b,
                        _ => a % b,
                    }))
                }
            },
            Div => {
                let (a, b) = self.numbers(&lhs, &rhs)?;
                if b == 0.0 {
                    return Err(self.arithmetic("division by zero"));
                }
                Ok(Value::Float(a / b))
            }
            Eq => Ok(Value::Bool(loosely_equal(&lhs, &rhs))),
            Ne => Ok(Value::Bool(!loosely_equal(&lhs, &rhs))),
            Lt | Le | Gt | Ge => {
                let ordering = match (&lhs, &rhs) {
                    (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                    _ => {
                        let (a, b) = self.numbers(&lhs, &rhs)?;
                        a.partial_cmp(&b)
                    }
                };
                let result = match ordering {
                    None => false,
                    Some(ordering) => match op {
                        Lt => ordering == Ordering::Less,
                        Le => ordering != Ordering::Greater,
                        Gt => ordering == Ordering::Greater,
                        _ => ordering != Ordering::Less,
                    },
                };
                Ok(Value::Bool(result))
            }
            And | Or => unreachable!("logical operators short-circuit in eval"),
        }
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
        let numbers = args
            .iter()
            .map(|arg| arg.as_f64().ok_or_else(|| self.type_error("number", arg)))
            .collect::<Result<Vec<_>, _>>()?;
        let ints: Option<Vec<i64>> = args.iter().map(Value::as_i64).collect();

        let arity = |expected: usize| -> Result<(), ExpressionError> {
            if numbers.len() == expected {
                Ok(())
            } else {
                Err(self.arithmetic(&format!(
                    "{}() takes {} argument(s), got {}",
                    name,
                    expected,
                    numbers.len()
                )))
            }
        };

        match name {
            "min" | "max" if !numbers.is_empty() => {
                let is_min = name == "min";
                if let Some(ints) = ints {
                    let pick = if is_min { ints.iter().min() } else { ints.iter().max() };
                    return pick
                        .map(|n| Value::Int(*n))
                        .ok_or_else(|| self.arithmetic("empty argument list"));
                }
                let pick = |a: f64, b: f64| if is_min { a.min(b) } else { a.max(b) };
                let result = numbers.iter().copied().reduce(pick).unwrap_or(f64::NAN);
                Ok(Value::Float(result))
            }
            "abs" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(n) => n
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| self.arithmetic("integer overflow")),
                    _ => Ok(Value::Float(numbers[0].abs())),
                }
            }
            "floor" => {
                arity(1)?;
                Ok(Value::Float(numbers[0].floor()))
            }
            "ceil" => {
                arity(1)?;
                Ok(Value::Float(numbers[0].ceil()))
            }
            "clamp" => {
                arity(3)?;
                if let Some(ints) = ints {
                    return Ok(Value::Int(ints[0].max(ints[1]).min(ints[2])));
                }
                Ok(Value::Float(numbers[0].max(numbers[1]).min(numbers[2])))
            }
            "min" | "max" => Err(self.arithmetic(&format!("{}() needs at least one argument", name))),
            _ => Err(ExpressionError::UnknownIdentifier {
                identifier: format!("{}()", name),
                node: self.node.to_string(),
            }),
        }
    }

    fn numbers(&self, lhs: &Value, rhs: &Value) -> Result<(f64, f64), ExpressionError> {
        let a = lhs.as_f64().ok_or_else(|| self.type_error("number", lhs))?;
        let b = rhs.as_f64().ok_or_else(|| self.type_error("number", rhs))?;
        Ok((a, b))
    }

    fn type_error(&self, expected: &str, actual: &Value) -> ExpressionError {
        ExpressionError::Type {
            expression: self.source.to_string(),
            expected: expected.to_string(),
            actual: actual.type_name().to_string(),
        }
    }

    fn arithmetic(&self, message: &str) -> ExpressionError {
        ExpressionError::Arithmetic {
            expression: self.source.to_string(),
            message: message.to_string(),
        }
    }
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    if lhs.is_numeric() && rhs.is_numeric() {
        return lhs.as_f64() == rhs.as_f64();
    }
    lhs == rhs
}
