//! Evaluation of parsed expressions against a single resource record.
//!
//! Existing unit files assume Python value semantics. Numbers compare
//! across int/float/bool and `and`/`or` return one of their operands. `in`
//! is a substring or membership test. Mixing incompatible types is a
//! runtime error.

use std::cmp::Ordering;

use super::Resource;
use super::parser::{BinOp, BoolOp, Builtin, CmpOp, Expr, UnaryOp};

/// Runtime failures while evaluating one record.
///
/// These never escape [`super::ResourceExpression::evaluate`]; a record that
/// fails to evaluate simply does not satisfy the expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("type error: {0}")]
    Type(String),

    #[error("value error: {0}")]
    Value(String),

    #[error("division by zero")]
    ZeroDivision,

    #[error("integer overflow")]
    Overflow,
}

pub type EvalResult<T> = Result<T, EvalError>;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
}

impl Value {
    /// Python truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
        }
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    fn equals(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.promote(b).map_or_else(|(x, y)| x == y, |(x, y)| x == y);
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            _ => false,
        }
    }

    fn compare(&self, other: &Value) -> EvalResult<Ordering> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            let ordering = match a.promote(b) {
                Ok((x, y)) => x.cmp(&y),
                Err((x, y)) => x
                    .partial_cmp(&y)
                    .ok_or_else(|| EvalError::Value("comparison with NaN".into()))?,
            };
            return Ok(ordering);
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.iter().zip(b) {
                    if !x.equals(y) {
                        return x.compare(y);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(EvalError::Type(format!(
                "'<' not supported between '{}' and '{}'",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    fn contains(&self, needle: &Value) -> EvalResult<bool> {
        match (self, needle) {
            (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(needle.as_str())),
            (Value::Str(_), other) => Err(EvalError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
            (Value::List(items) | Value::Tuple(items), needle) => {
                Ok(items.iter().any(|item| item.equals(needle)))
            }
            (other, _) => Err(EvalError::Type(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Returns both operands as ints when both are ints, otherwise as floats.
    fn promote(self, other: Number) -> Result<(i64, i64), (f64, f64)> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Ok((a, b)),
            (a, b) => Err((a.as_f64(), b.as_f64())),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

/// Evaluates `expr` with every attribute read served from `record`.
///
/// Attributes missing from the record read as the empty string.
pub fn evaluate(expr: &Expr, record: &Resource) -> EvalResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => Ok(Value::List(evaluate_all(items, record)?)),
        Expr::Tuple(items) => Ok(Value::Tuple(evaluate_all(items, record)?)),
        Expr::Attribute { attribute, .. } => Ok(Value::Str(record.get(attribute).to_string())),
        Expr::Call { func, arg } => {
            let arg = arg
                .as_deref()
                .map(|a| evaluate(a, record))
                .transpose()?;
            call(*func, arg)
        }
        Expr::Unary { op, operand } => unary(*op, evaluate(operand, record)?),
        Expr::Binary { op, left, right } => {
            binary(*op, evaluate(left, record)?, evaluate(right, record)?)
        }
        Expr::Bool { op, values } => {
            let mut last = Value::None;
            for value in values {
                last = evaluate(value, record)?;
                let stop = match op {
                    BoolOp::And => !last.truthy(),
                    BoolOp::Or => last.truthy(),
                };
                if stop {
                    break;
                }
            }
            Ok(last)
        }
        Expr::Compare { left, comparisons } => {
            let mut current = evaluate(left, record)?;
            for (op, right) in comparisons {
                let right = evaluate(right, record)?;
                let holds = match op {
                    CmpOp::Eq => current.equals(&right),
                    CmpOp::NotEq => !current.equals(&right),
                    CmpOp::Lt => current.compare(&right)? == Ordering::Less,
                    CmpOp::LtE => current.compare(&right)? != Ordering::Greater,
                    CmpOp::Gt => current.compare(&right)? == Ordering::Greater,
                    CmpOp::GtE => current.compare(&right)? != Ordering::Less,
                    CmpOp::In => right.contains(&current)?,
                };
                if !holds {
                    return Ok(Value::Bool(false));
                }
                current = right;
            }
            Ok(Value::Bool(true))
        }
    }
}

fn evaluate_all(items: &[Expr], record: &Resource) -> EvalResult<Vec<Value>> {
    items.iter().map(|item| evaluate(item, record)).collect()
}

fn call(func: Builtin, arg: Option<Value>) -> EvalResult<Value> {
    match (func, arg) {
        (Builtin::Int, None) => Ok(Value::Int(0)),
        (Builtin::Float, None) => Ok(Value::Float(0.0)),
        (Builtin::Bool, None) => Ok(Value::Bool(false)),
        (Builtin::Bool, Some(value)) => Ok(Value::Bool(value.truthy())),
        (Builtin::Int, Some(value)) => match value {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            Value::Float(f) if f.is_finite() => {
                let truncated = f.trunc();
                if truncated.abs() >= i64::MAX as f64 {
                    return Err(EvalError::Overflow);
                }
                Ok(Value::Int(truncated as i64))
            }
            Value::Float(f) => Err(EvalError::Value(format!(
                "cannot convert float {} to integer",
                f
            ))),
            Value::Str(s) => parse_int(&s).map(Value::Int),
            other => Err(EvalError::Type(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        },
        (Builtin::Float, Some(value)) => match value {
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Bool(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
            Value::Float(f) => Ok(Value::Float(f)),
            Value::Str(s) => s
                .trim()
                .replace('_', "")
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| EvalError::Value(format!("could not convert string to float: {:?}", s))),
            other => Err(EvalError::Type(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        },
    }
}

fn parse_int(text: &str) -> EvalResult<i64> {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let valid = !digits.is_empty()
        && !digits.starts_with('_')
        && !digits.ends_with('_')
        && !digits.contains("__");
    if valid && let Ok(value) = digits.replace('_', "").parse::<i64>() {
        return Ok(value);
    }
    Err(EvalError::Value(format!(
        "invalid literal for int() with base 10: {:?}",
        text
    )))
}

fn unary(op: UnaryOp, value: Value) -> EvalResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
        UnaryOp::Pos => match value.as_number() {
            Some(Number::Int(i)) => Ok(Value::Int(i)),
            Some(Number::Float(f)) => Ok(Value::Float(f)),
            None => Err(EvalError::Type(format!(
                "bad operand type for unary +: '{}'",
                value.type_name()
            ))),
        },
        UnaryOp::Neg => match value.as_number() {
            Some(Number::Int(i)) => i.checked_neg().map(Value::Int).ok_or(EvalError::Overflow),
            Some(Number::Float(f)) => Ok(Value::Float(-f)),
            None => Err(EvalError::Type(format!(
                "bad operand type for unary -: '{}'",
                value.type_name()
            ))),
        },
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> EvalResult<Value> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return numeric(op, a, b);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (BinOp::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (BinOp::Add, Value::Tuple(mut a), Value::Tuple(b)) => {
            a.extend(b);
            Ok(Value::Tuple(a))
        }
        (BinOp::Mul, Value::Str(s), count) | (BinOp::Mul, count, Value::Str(s))
            if count.as_number().is_some_and(|n| matches!(n, Number::Int(_))) =>
        {
            let times = repeat_count(&count, s.len())?;
            Ok(Value::Str(s.repeat(times)))
        }
        (BinOp::Mul, Value::List(items), count) | (BinOp::Mul, count, Value::List(items))
            if count.as_number().is_some_and(|n| matches!(n, Number::Int(_))) =>
        {
            let times = repeat_count(&count, sequence_size(&items))?;
            Ok(Value::List(
                std::iter::repeat_n(items, times).flatten().collect(),
            ))
        }
        (op, left, right) => Err(EvalError::Type(format!(
            "unsupported operand types for {:?}: '{}' and '{}'",
            op,
            left.type_name(),
            right.type_name()
        ))),
    }
}

/// Largest sequence, in characters plus nested elements, that repetition
/// may produce.
const MAX_SEQUENCE_SIZE: usize = 1 << 16;

/// Repetition count for a sequence of `size`; results larger than
/// [`MAX_SEQUENCE_SIZE`] are refused rather than allocated.
fn repeat_count(count: &Value, size: usize) -> EvalResult<usize> {
    match count.as_number() {
        Some(Number::Int(n)) if n <= 0 => Ok(0),
        Some(Number::Int(n)) => {
            let times = usize::try_from(n).map_err(|_| EvalError::Overflow)?;
            if size.saturating_mul(times) > MAX_SEQUENCE_SIZE {
                return Err(EvalError::Overflow);
            }
            Ok(times)
        }
        _ => Err(EvalError::Type("can't multiply sequence by non-int".into())),
    }
}

/// Size of a list or tuple counting nested elements and string lengths.
fn sequence_size(items: &[Value]) -> usize {
    items.iter().fold(items.len(), |size, item| {
        size.saturating_add(match item {
            Value::Str(s) => s.len(),
            Value::List(inner) | Value::Tuple(inner) => sequence_size(inner),
            _ => 0,
        })
    })
}

fn numeric(op: BinOp, a: Number, b: Number) -> EvalResult<Value> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => int_op(op, x, y),
        (x, y) => float_op(op, x.as_f64(), y.as_f64()),
    }
}

fn int_op(op: BinOp, x: i64, y: i64) -> EvalResult<Value> {
    let overflow = || EvalError::Overflow;
    match op {
        BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
        BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
        BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
        BinOp::Div => {
            if y == 0 {
                return Err(EvalError::ZeroDivision);
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(EvalError::ZeroDivision);
            }
            let mut q = x.checked_div(y).ok_or_else(overflow)?;
            if x % y != 0 && ((x < 0) != (y < 0)) {
                q -= 1;
            }
            Ok(Value::Int(q))
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(EvalError::ZeroDivision);
            }
            let mut r = x.checked_rem(y).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (y < 0)) {
                r += y;
            }
            Ok(Value::Int(r))
        }
        BinOp::Pow => {
            if y < 0 {
                return float_op(op, x as f64, y as f64);
            }
            let exp = u32::try_from(y).map_err(|_| EvalError::Overflow)?;
            x.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
        }
    }
}

fn float_op(op: BinOp, x: f64, y: f64) -> EvalResult<Value> {
    let value = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(EvalError::ZeroDivision);
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(EvalError::ZeroDivision);
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(EvalError::ZeroDivision);
            }
            x - y * (x / y).floor()
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(EvalError::ZeroDivision);
            }
            x.powf(y)
        }
    };
    Ok(Value::Float(value))
}
