use std::cmp::Ordering;

use crate::{Error, Result, Value};

use super::parser::{BinaryOp, CompareOp, Expr, UnaryOp};
use super::Symbols;

/// Evaluate `expr`. `Ok(None)` is the language's `None`, produced by guarded fields, by
/// division by zero, and by any arithmetic that touches `None`.
pub(crate) fn eval(expr: &Expr, symbols: &dyn Symbols) -> Result<Option<Value>> {
    match expr {
        Expr::Literal(v) => Ok(Some(v.clone())),
        Expr::None => Ok(None),
        Expr::Name(name) => lookup_name(name, symbols),
        Expr::Attr { base, name } => match base.as_str() {
            "raw" => symbols.lookup_raw(name),
            "history" => symbols.lookup_history(name),
            "math" => symbols
                .functions()
                .constant(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| Error::Expression(format!("math has no constant '{name}'"))),
            _ => Err(Error::Expression(format!(
                "unsupported attribute access '{base}.{name}'"
            ))),
        },
        Expr::Unary { op, expr } => {
            let value = eval(expr, symbols)?;
            if *op == UnaryOp::Not {
                return Ok(Some(Value::Bool(!truthy(value.as_ref()))));
            }
            value.map(|v| unary(*op, &v)).transpose()
        }
        Expr::Binary { op, left, right } => {
            let (Some(a), Some(b)) = (eval(left, symbols)?, eval(right, symbols)?) else {
                return Ok(None);
            };
            binary(*op, &a, &b)
        }
        Expr::Compare { first, rest } => {
            let mut left = eval(first, symbols)?;
            for (op, expr) in rest {
                let right = eval(expr, symbols)?;
                match compare(*op, left.as_ref(), right.as_ref())? {
                    Some(true) => left = right,
                    Some(false) => return Ok(Some(Value::Bool(false))),
                    None => return Ok(None),
                }
            }
            Ok(Some(Value::Bool(true)))
        }
        Expr::And(a, b) => {
            let left = eval(a, symbols)?;
            if truthy(left.as_ref()) {
                eval(b, symbols)
            } else {
                Ok(left)
            }
        }
        Expr::Or(a, b) => {
            let left = eval(a, symbols)?;
            if truthy(left.as_ref()) {
                Ok(left)
            } else {
                eval(b, symbols)
            }
        }
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => {
            if truthy(eval(cond, symbols)?.as_ref()) {
                eval(then, symbols)
            } else {
                eval(otherwise, symbols)
            }
        }
        Expr::Call { name, args } => {
            let args = args
                .iter()
                .map(|a| eval(a, symbols))
                .collect::<Result<Vec<_>>>()?;
            if let Some(result) = symbols.call(name, &args) {
                return result;
            }
            let short = name.strip_prefix("math.").unwrap_or(name);
            let Some(f) = symbols.functions().function(short) else {
                return Err(Error::Expression(format!("unknown function '{name}'")));
            };
            let Some(args) = args.into_iter().collect::<Option<Vec<_>>>() else {
                return Ok(None);
            };
            f(&args)
        }
    }
}

pub(crate) fn truthy(value: Option<&Value>) -> bool {
    value.is_some_and(Value::is_truthy)
}

fn lookup_name(name: &str, symbols: &dyn Symbols) -> Result<Option<Value>> {
    match symbols.lookup(name) {
        Err(Error::UnknownField { .. }) => symbols
            .functions()
            .constant(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::Expression(format!("name '{name}' is not defined"))),
        other => other,
    }
}

fn unsupported(op: &str, a: &Value, b: &Value) -> Error {
    Error::Expression(format!(
        "unsupported operand types for {op}: {} and {}",
        a.kind(),
        b.kind()
    ))
}

fn int_of(v: &Value) -> Option<i128> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i128::from(*b)),
        _ => None,
    }
}

fn unary(op: UnaryOp, v: &Value) -> Result<Value> {
    match (op, v) {
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Plus, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Neg, _) => match int_of(v) {
            Some(i) => Ok(i
                .checked_neg()
                .map_or(Value::Float(-(i as f64)), Value::Int)),
            None => Err(Error::Expression(format!("bad operand for unary -: {}", v.kind()))),
        },
        (UnaryOp::Plus, _) => int_of(v)
            .map(Value::Int)
            .ok_or_else(|| Error::Expression(format!("bad operand for unary +: {}", v.kind()))),
        (UnaryOp::BitNot, _) => int_of(v)
            .map(|i| Value::Int(!i))
            .ok_or_else(|| Error::Expression(format!("bad operand for unary ~: {}", v.kind()))),
        (UnaryOp::Not, _) => Ok(Value::Bool(!v.is_truthy())),
    }
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Option<Value>> {
    if let (BinaryOp::Add, Value::Str(x), Value::Str(y)) = (op, a, b) {
        return Ok(Some(Value::Str(format!("{x}{y}"))));
    }

    match (int_of(a), int_of(b)) {
        (Some(x), Some(y)) => int_binary(op, x, y, a, b),
        _ => match (a.as_f64().filter(|_| a.is_numeric()), b.as_f64().filter(|_| b.is_numeric())) {
            (Some(x), Some(y)) => float_binary(op, x, y, a, b),
            _ => Err(unsupported(symbol(op), a, b)),
        },
    }
}

fn int_binary(op: BinaryOp, x: i128, y: i128, a: &Value, b: &Value) -> Result<Option<Value>> {
    let checked = match op {
        BinaryOp::Add => x.checked_add(y),
        BinaryOp::Sub => x.checked_sub(y),
        BinaryOp::Mul => x.checked_mul(y),
        BinaryOp::Div => {
            if y == 0 {
                return Ok(None);
            }
            return Ok(Some(Value::Float(x as f64 / y as f64)));
        }
        BinaryOp::FloorDiv => {
            if y == 0 {
                return Ok(None);
            }
            x.checked_div(y).map(|q| {
                if x % y != 0 && ((x < 0) != (y < 0)) {
                    q - 1
                } else {
                    q
                }
            })
        }
        BinaryOp::Mod => {
            if y == 0 {
                return Ok(None);
            }
            x.checked_rem(y).map(|r| {
                if r != 0 && ((r < 0) != (y < 0)) {
                    r + y
                } else {
                    r
                }
            })
        }
        BinaryOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Ok(None);
                }
                return Ok(Some(Value::Float((x as f64).powf(y as f64))));
            }
            u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
        }
        BinaryOp::Shl | BinaryOp::Shr if y < 0 => {
            return Err(Error::Expression("negative shift count".to_string()));
        }
        BinaryOp::Shl => {
            let shifted = u32::try_from(y)
                .ok()
                .filter(|s| *s < 127)
                .map(|s| (x << s, s))
                .filter(|(r, s)| r >> s == x)
                .map(|(r, _)| r);
            return shifted
                .map(|r| Some(Value::Int(r)))
                .ok_or_else(|| Error::Expression("shift result overflows".to_string()));
        }
        BinaryOp::Shr => {
            let r = if y >= 127 {
                if x < 0 {
                    -1
                } else {
                    0
                }
            } else {
                x >> y
            };
            return Ok(Some(Value::Int(r)));
        }
        BinaryOp::BitAnd => Some(x & y),
        BinaryOp::BitOr => Some(x | y),
        BinaryOp::BitXor => Some(x ^ y),
    };

    match checked {
        Some(r) => Ok(Some(Value::Int(r))),
        None => float_binary(op, x as f64, y as f64, a, b),
    }
}

fn float_binary(op: BinaryOp, x: f64, y: f64, a: &Value, b: &Value) -> Result<Option<Value>> {
    let r = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod if y == 0.0 => return Ok(None),
        BinaryOp::Div => x / y,
        BinaryOp::FloorDiv => (x / y).floor(),
        BinaryOp::Mod => x - y * (x / y).floor(),
        BinaryOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Ok(None);
            }
            x.powf(y)
        }
        _ => return Err(unsupported(symbol(op), a, b)),
    };
    Ok(Some(Value::Float(r)))
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::FloorDiv => "//",
        BinaryOp::Mod => "%",
        BinaryOp::Pow => "**",
        BinaryOp::Shl => "<<",
        BinaryOp::Shr => ">>",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
    }
}

/// Ordering between two values, `None` if they are not comparable.
pub(crate) fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        _ if a.is_numeric() && b.is_numeric() => match (int_of(a), int_of(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        _ => None,
    }
}

// Ordering against None is itself None, which ends a comparison chain.
fn compare(op: CompareOp, a: Option<&Value>, b: Option<&Value>) -> Result<Option<bool>> {
    let (a, b) = match (op, a, b) {
        (CompareOp::Eq, a, b) => return Ok(Some(a == b)),
        (CompareOp::Ne, a, b) => return Ok(Some(a != b)),
        (_, Some(a), Some(b)) => (a, b),
        _ => return Ok(None),
    };
    let Some(ord) = ordering(a, b) else {
        return Err(Error::Expression(format!(
            "cannot order {} and {}",
            a.kind(),
            b.kind()
        )));
    };
    Ok(Some(match op {
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
    }))
}
