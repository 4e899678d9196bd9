//! Restricted expression language
//!
//! Formulas and conditional predicates are tokenized and parsed once, when a
//! job configuration is compiled, into an [`Expr`] tree. Evaluation walks the
//! tree against a [`Record`]; there is no dynamic code execution.
//!
//! ```text
//! expr     := or ( "?" expr ":" expr )?
//! or       := and ( "||" and )*
//! and      := cmp ( "&&" cmp )*
//! cmp      := concat ( ("=="|"!="|"<"|"<="|">"|">=") concat )?
//! concat   := additive ( "&" additive )*
//! additive := term ( ("+"|"-") term )*
//! term     := unary ( ("*"|"/"|"%") unary )*
//! unary    := ("-"|"!") unary | primary
//! primary  := NUMBER | STRING | true | false | null | IDENT | IDENT "(" args ")" | "(" expr ")"
//! ```

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::domain::Record;

const MAX_DEPTH: usize = 64;

/// Expression parse or evaluation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("{0}")]
    Eval(String),
}

impl ExprError {
    fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    fn eval(message: impl Into<String>) -> Self {
        Self::Eval(message.into())
    }
}

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(Decimal),
    Str(String),
}

impl Value {
    /// Numeric view; strings that parse as decimals count as numbers
    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => Decimal::from_str(s.trim()).ok(),
            Self::Null | Self::Bool(_) => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Num(n) => !n.is_zero(),
            Self::Str(s) => !s.is_empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text rendering used for output and concatenation
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Num(n) => n.normalize().to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenType {
    Number(Decimal),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LeftParen,
    RightParen,
    Comma,
    Question,
    Colon,
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Amp,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    token_type: TokenType,
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let position = i;
        let next = chars.get(i + 1).copied();

        let simple = match (ch, next) {
            (c, _) if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ('|', Some('|')) => Some((TokenType::OrOr, 2)),
            ('&', Some('&')) => Some((TokenType::AndAnd, 2)),
            ('=', Some('=')) => Some((TokenType::EqEq, 2)),
            ('!', Some('=')) => Some((TokenType::NotEq, 2)),
            ('<', Some('=')) => Some((TokenType::Le, 2)),
            ('>', Some('=')) => Some((TokenType::Ge, 2)),
            ('<', _) => Some((TokenType::Lt, 1)),
            ('>', _) => Some((TokenType::Gt, 1)),
            ('&', _) => Some((TokenType::Amp, 1)),
            ('!', _) => Some((TokenType::Bang, 1)),
            ('(', _) => Some((TokenType::LeftParen, 1)),
            (')', _) => Some((TokenType::RightParen, 1)),
            (',', _) => Some((TokenType::Comma, 1)),
            ('?', _) => Some((TokenType::Question, 1)),
            (':', _) => Some((TokenType::Colon, 1)),
            ('+', _) => Some((TokenType::Plus, 1)),
            ('-', _) => Some((TokenType::Minus, 1)),
            ('*', _) => Some((TokenType::Star, 1)),
            ('/', _) => Some((TokenType::Slash, 1)),
            ('%', _) => Some((TokenType::Percent, 1)),
            _ => None,
        };
        if let Some((token_type, width)) = simple {
            tokens.push(Token { token_type, position });
            i += width;
            continue;
        }

        if ch == '\'' || ch == '"' {
            let quote = ch;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(ExprError::parse(position, "unterminated string")),
                    Some('\\') => {
                        let escaped = match chars.get(i + 1) {
                            Some('n') => '\n',
                            Some('t') => '\t',
                            Some(c) => *c,
                            None => return Err(ExprError::parse(position, "unterminated string")),
                        };
                        value.push(escaped);
                        i += 2;
                    }
                    Some(c) if *c == quote => {
                        i += 1;
                        break;
                    }
                    Some(c) => {
                        value.push(*c);
                        i += 1;
                    }
                }
            }
            tokens.push(Token {
                token_type: TokenType::Str(value),
                position,
            });
            continue;
        }

        if ch.is_ascii_digit() || (ch == '.' && next.is_some_and(|c| c.is_ascii_digit())) {
            let start = i;
            let mut seen_dot = false;
            while let Some(&c) = chars.get(i) {
                if c.is_ascii_digit() {
                    i += 1;
                } else if c == '.' && !seen_dot {
                    seen_dot = true;
                    i += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number = Decimal::from_str(&text)
                .map_err(|e| ExprError::parse(position, format!("invalid number {}: {}", text, e)))?;
            tokens.push(Token {
                token_type: TokenType::Number(number),
                position,
            });
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_alphanumeric() || *c == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let token_type = match word.as_str() {
                "true" => TokenType::True,
                "false" => TokenType::False,
                "null" => TokenType::Null,
                _ => TokenType::Ident(word),
            };
            tokens.push(Token { token_type, position });
            continue;
        }

        return Err(ExprError::parse(position, format!("unexpected character '{}'", ch)));
    }

    tokens.push(Token {
        token_type: TokenType::Eof,
        position: chars.len(),
    });
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Short-circuiting operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    Or,
    And,
}

/// Operators that evaluate both operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Upper,
    Lower,
    Trim,
    Len,
    Substr,
    Coalesce,
    Round,
    Abs,
    Concat,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "upper" => Some(Self::Upper),
            "lower" => Some(Self::Lower),
            "trim" => Some(Self::Trim),
            "len" => Some(Self::Len),
            "substr" => Some(Self::Substr),
            "coalesce" => Some(Self::Coalesce),
            "round" => Some(Self::Round),
            "abs" => Some(Self::Abs),
            "concat" => Some(Self::Concat),
            _ => None,
        }
    }

    /// Accepted argument counts (min, max)
    fn arity(&self) -> (usize, usize) {
        match self {
            Self::Upper | Self::Lower | Self::Trim | Self::Len | Self::Abs => (1, 1),
            Self::Substr => (2, 3),
            Self::Round => (1, 2),
            Self::Coalesce | Self::Concat => (1, usize::MAX),
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Unary(UnaryOp, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    current: usize,
    depth: usize,
}

impl Parser {
    fn current_token(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current_token().clone();
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        token
    }

    fn check(&self, token_type: &TokenType) -> bool {
        &self.current_token().token_type == token_type
    }

    fn expect(&mut self, token_type: TokenType) -> Result<Token, ExprError> {
        if self.check(&token_type) {
            Ok(self.advance())
        } else {
            let token = self.current_token();
            Err(ExprError::parse(
                token.position,
                format!("expected {:?}, found {:?}", token_type, token.token_type),
            ))
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::parse(self.current_token().position, "expression nested too deeply"));
        }
        Ok(())
    }

    fn parse_expression(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let condition = self.parse_or()?;
        let expr = if self.check(&TokenType::Question) {
            self.advance();
            let then = self.parse_expression()?;
            self.expect(TokenType::Colon)?;
            let otherwise = self.parse_expression()?;
            Expr::Ternary(Box::new(condition), Box::new(then), Box::new(otherwise))
        } else {
            condition
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.check(&TokenType::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Logical(LogicalOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        while self.check(&TokenType::AndAnd) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Logical(LogicalOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_concat()?;
        let op = match self.current_token().token_type {
            TokenType::EqEq => BinaryOp::Eq,
            TokenType::NotEq => BinaryOp::Ne,
            TokenType::Lt => BinaryOp::Lt,
            TokenType::Le => BinaryOp::Le,
            TokenType::Gt => BinaryOp::Gt,
            TokenType::Ge => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_concat()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_concat(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_additive()?;
        while self.check(&TokenType::Amp) {
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(BinaryOp::Concat, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.current_token().token_type {
                TokenType::Plus => BinaryOp::Add,
                TokenType::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current_token().token_type {
                TokenType::Star => BinaryOp::Mul,
                TokenType::Slash => BinaryOp::Div,
                TokenType::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.current_token().token_type {
            TokenType::Minus => UnaryOp::Neg,
            TokenType::Bang => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let token = self.advance();
        match token.token_type {
            TokenType::Number(n) => Ok(Expr::Literal(Value::Num(n))),
            TokenType::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            TokenType::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenType::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenType::Null => Ok(Expr::Literal(Value::Null)),
            TokenType::LeftParen => {
                let inner = self.parse_expression()?;
                self.expect(TokenType::RightParen)?;
                Ok(inner)
            }
            TokenType::Ident(name) => {
                if !self.check(&TokenType::LeftParen) {
                    return Ok(Expr::Field(name));
                }
                let function = Function::lookup(&name)
                    .ok_or_else(|| ExprError::parse(token.position, format!("unknown function {}", name)))?;
                self.advance();
                let mut args = Vec::new();
                if !self.check(&TokenType::RightParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if self.check(&TokenType::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(TokenType::RightParen)?;
                let (min, max) = function.arity();
                if args.len() < min || args.len() > max {
                    return Err(ExprError::parse(
                        token.position,
                        format!("{} takes {} arguments, got {}", name, arity_text(min, max), args.len()),
                    ));
                }
                Ok(Expr::Call(function, args))
            }
            other => Err(ExprError::parse(token.position, format!("unexpected token {:?}", other))),
        }
    }
}

fn arity_text(min: usize, max: usize) -> String {
    if min == max {
        min.to_string()
    } else if max == usize::MAX {
        format!("at least {}", min)
    } else {
        format!("{} to {}", min, max)
    }
}

/// A parsed, reusable expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse an expression
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            current: 0,
            depth: 0,
        };
        let root = parser.parse_expression()?;
        let trailing = parser.current_token();
        if trailing.token_type != TokenType::Eof {
            return Err(ExprError::parse(
                trailing.position,
                format!("unexpected trailing {:?}", trailing.token_type),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Field names referenced by the expression
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_fields(&self.root, &mut out);
        out
    }

    /// Evaluate against a record
    pub fn evaluate(&self, record: &Record) -> Result<Value, ExprError> {
        eval(&self.root, record)
    }

    /// Evaluate as a predicate
    pub fn test(&self, record: &Record) -> Result<bool, ExprError> {
        Ok(self.evaluate(record)?.is_truthy())
    }
}

fn collect_fields(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Field(name) => {
            out.insert(name.clone());
        }
        Expr::Unary(_, inner) => collect_fields(inner, out),
        Expr::Logical(_, left, right) | Expr::Binary(_, left, right) => {
            collect_fields(left, out);
            collect_fields(right, out);
        }
        Expr::Ternary(cond, then, otherwise) => {
            collect_fields(cond, out);
            collect_fields(then, out);
            collect_fields(otherwise, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|arg| collect_fields(arg, out)),
    }
}

fn eval(expr: &Expr, record: &Record) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(name) => Ok(record.get(name).map_or(Value::Null, |v| Value::Str(v.to_string()))),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!eval(inner, record)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, inner) => {
            let value = eval(inner, record)?;
            Ok(Value::Num(-number(&value, "-")?))
        }
        Expr::Logical(op, left, right) => {
            let left = eval(left, record)?.is_truthy();
            match (op, left) {
                (LogicalOp::Or, true) => Ok(Value::Bool(true)),
                (LogicalOp::And, false) => Ok(Value::Bool(false)),
                _ => Ok(Value::Bool(eval(right, record)?.is_truthy())),
            }
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, record)?;
            let right = eval(right, record)?;
            binary(*op, &left, &right)
        }
        Expr::Ternary(cond, then, otherwise) => {
            if eval(cond, record)?.is_truthy() {
                eval(then, record)
            } else {
                eval(otherwise, record)
            }
        }
        Expr::Call(function, args) => {
            let values = args.iter().map(|arg| eval(arg, record)).collect::<Result<Vec<_>, _>>()?;
            call(*function, &values)
        }
    }
}

fn number(value: &Value, op: &str) -> Result<Decimal, ExprError> {
    value.as_number().ok_or_else(|| match value {
        Value::Null => ExprError::eval(format!("null operand for {}", op)),
        other => ExprError::eval(format!("non-numeric operand '{}' for {}", other.render(), op)),
    })
}

/// Numeric when both sides parse as numbers, textual otherwise
fn compare(left: &Value, right: &Value) -> Ordering {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => left.render().cmp(&right.render()),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    let overflow = || ExprError::eval("arithmetic overflow");
    let value = match op {
        BinaryOp::Eq => Value::Bool(compare(left, right) == Ordering::Equal),
        BinaryOp::Ne => Value::Bool(compare(left, right) != Ordering::Equal),
        BinaryOp::Lt => Value::Bool(compare(left, right) == Ordering::Less),
        BinaryOp::Le => Value::Bool(compare(left, right) != Ordering::Greater),
        BinaryOp::Gt => Value::Bool(compare(left, right) == Ordering::Greater),
        BinaryOp::Ge => Value::Bool(compare(left, right) != Ordering::Less),
        BinaryOp::Concat => Value::Str(format!("{}{}", left.render(), right.render())),
        BinaryOp::Add => Value::Num(
            number(left, "+")?
                .checked_add(number(right, "+")?)
                .ok_or_else(overflow)?,
        ),
        BinaryOp::Sub => Value::Num(
            number(left, "-")?
                .checked_sub(number(right, "-")?)
                .ok_or_else(overflow)?,
        ),
        BinaryOp::Mul => Value::Num(
            number(left, "*")?
                .checked_mul(number(right, "*")?)
                .ok_or_else(overflow)?,
        ),
        BinaryOp::Div | BinaryOp::Rem => {
            let symbol = if op == BinaryOp::Div { "/" } else { "%" };
            let divisor = number(right, symbol)?;
            if divisor.is_zero() {
                return Err(ExprError::eval("division by zero"));
            }
            let dividend = number(left, symbol)?;
            let result = if op == BinaryOp::Div {
                dividend.checked_div(divisor)
            } else {
                dividend.checked_rem(divisor)
            };
            Value::Num(result.ok_or_else(overflow)?)
        }
    };
    Ok(value)
}

fn integer_arg(value: &Value, function: &str) -> Result<i64, ExprError> {
    number(value, function)?
        .trunc()
        .to_i64()
        .ok_or_else(|| ExprError::eval(format!("{} argument out of range", function)))
}

fn call(function: Function, args: &[Value]) -> Result<Value, ExprError> {
    let first = args.first().unwrap_or(&Value::Null);
    let value = match function {
        Function::Upper => Value::Str(first.render().to_uppercase()),
        Function::Lower => Value::Str(first.render().to_lowercase()),
        Function::Trim => Value::Str(first.render().trim().to_string()),
        Function::Len => Value::Num(Decimal::from(first.render().chars().count() as u64)),
        Function::Substr => {
            let text = first.render();
            let start = integer_arg(&args[1], "substr")?.max(1) as usize - 1;
            let chars = text.chars().skip(start);
            let out: String = match args.get(2) {
                Some(len) => chars.take(integer_arg(len, "substr")?.max(0) as usize).collect(),
                None => chars.collect(),
            };
            Value::Str(out)
        }
        Function::Coalesce => args
            .iter()
            .find(|v| !v.is_null() && !v.render().is_empty())
            .cloned()
            .unwrap_or(Value::Null),
        Function::Round => {
            let places = match args.get(1) {
                Some(p) => integer_arg(p, "round")?.clamp(0, 28) as u32,
                None => 0,
            };
            Value::Num(number(first, "round")?.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero))
        }
        Function::Abs => Value::Num(number(first, "abs")?.abs()),
        Function::Concat => Value::Str(args.iter().map(Value::render).collect()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::from_pairs(
            1,
            [
                ("first", "Jane"),
                ("last", "Doe"),
                ("status", "A"),
                ("base", "50000"),
                ("qty", "3"),
                ("price", "2.50"),
                ("code", "007"),
            ],
        )
    }

    fn eval_str(source: &str) -> Value {
        Expression::parse(source).unwrap().evaluate(&record()).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval_str("1 + 2 * 3").render(), "7");
        assert_eq!(eval_str("(1 + 2) * 3").render(), "9");
        assert_eq!(eval_str("qty * price").render(), "7.5");
        assert_eq!(eval_str("base * 1.1").render(), "55000");
        assert_eq!(eval_str("10 % 4").render(), "2");
        assert_eq!(eval_str("-qty + 1").render(), "-2");
    }

    #[test]
    fn test_concat_and_functions() {
        assert_eq!(eval_str("first & ' ' & last").render(), "Jane Doe");
        assert_eq!(eval_str("upper(first)").render(), "JANE");
        assert_eq!(eval_str("len(last)").render(), "3");
        assert_eq!(eval_str("substr(first, 2, 2)").render(), "an");
        assert_eq!(eval_str("coalesce(missing, '', last)").render(), "Doe");
        assert_eq!(eval_str("round(2.345, 2)").render(), "2.35");
        assert_eq!(eval_str("abs(0 - 4)").render(), "4");
        assert_eq!(eval_str("concat(first, '-', qty)").render(), "Jane-3");
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval_str("status == \"A\""), Value::Bool(true));
        assert_eq!(eval_str("code == 7"), Value::Bool(true));
        assert_eq!(eval_str("code == '7'"), Value::Bool(true));
        assert_eq!(eval_str("first < 'Karl'"), Value::Bool(true));
        assert_eq!(eval_str("qty >= 3 && price < 3"), Value::Bool(true));
        assert_eq!(eval_str("missing == null"), Value::Bool(true));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(eval_str("status == 'A' ? 'ACTIVE' : 'INACTIVE'").render(), "ACTIVE");
        assert_eq!(eval_str("qty > 5 ? 'big' : qty > 1 ? 'mid' : 'small'").render(), "mid");
    }

    #[test]
    fn test_logical_operators() {
        for (left, right) in [("true", "true"), ("true", "false"), ("false", "true"), ("false", "false")] {
            let (l, r) = (left == "true", right == "true");
            assert_eq!(eval_str(&format!("{} || {}", left, right)), Value::Bool(l || r), "{} || {}", left, right);
            assert_eq!(eval_str(&format!("{} && {}", left, right)), Value::Bool(l && r), "{} && {}", left, right);
        }
        assert_eq!(eval_str("status == 'X' || qty > 2"), Value::Bool(true));
        assert_eq!(eval_str("false || true && false"), Value::Bool(false));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval_str("true || 1 / 0"), Value::Bool(true));
        assert_eq!(eval_str("false && 1 / 0"), Value::Bool(false));
    }

    #[test]
    fn test_eval_errors() {
        let expr = Expression::parse("qty / 0").unwrap();
        assert_eq!(expr.evaluate(&record()), Err(ExprError::Eval("division by zero".to_string())));
        let expr = Expression::parse("first + 1").unwrap();
        assert!(matches!(expr.evaluate(&record()), Err(ExprError::Eval(_))));
        let expr = Expression::parse("missing * 2").unwrap();
        assert!(matches!(expr.evaluate(&record()), Err(ExprError::Eval(msg)) if msg.contains("null")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Expression::parse("1 +"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expression::parse("(1 + 2"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expression::parse("a = b"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expression::parse("system('rm')"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expression::parse("upper(a, b)"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expression::parse("'open"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expression::parse("1 2"), Err(ExprError::Parse { .. })));
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(Expression::parse(&deep), Err(ExprError::Parse { .. })));
    }

    #[test]
    fn test_fields() {
        let expr = Expression::parse("status == 'A' && upper(first) != last").unwrap();
        let fields: Vec<_> = expr.fields().into_iter().collect();
        assert_eq!(fields, vec!["first", "last", "status"]);
    }
}
