//! Binary, unary, and comparison operators.
//!
//! The interpreter delegates every operator opcode here. Integer arithmetic
//! is performed on machine words and promotes to big integers on overflow;
//! the `BigInt` variant of [`Value`] never holds a value that fits `i64`,
//! so the fast paths stay hot.

use std::cmp::Ordering;
use std::rc::Rc;

use num_bigint::BigInt;

use crate::error::{Error, Result};
use crate::opcode::Opcode;
use crate::value::{big_to_f64, Value};

/// The operator's source-level symbol, for error messages.
fn sym(op: Opcode) -> &'static str {
    match op {
        Opcode::Plus => "+",
        Opcode::Minus => "-",
        Opcode::Star => "*",
        Opcode::Slash => "/",
        Opcode::SlashSlash => "//",
        Opcode::Percent => "%",
        Opcode::Amp => "&",
        Opcode::Pipe => "|",
        Opcode::Circumflex => "^",
        Opcode::LtLt => "<<",
        Opcode::GtGt => ">>",
        Opcode::In => "in",
        Opcode::UPlus => "+",
        Opcode::UMinus => "-",
        Opcode::Tilde => "~",
        _ => "?",
    }
}

fn unknown_binary(op: Opcode, x: &Value, y: &Value) -> Error {
    Error::Type(format!(
        "unknown binary op: {} {} {}",
        x.type_name(),
        sym(op),
        y.type_name()
    ))
}

/// Apply a binary operator. `x OP y` with `y` popped first by the caller.
pub(crate) fn binary(op: Opcode, x: Value, y: Value) -> Result<Value> {
    use Opcode::*;
    if let Some(r) = num_binary(op, &x, &y) {
        return r;
    }
    match op {
        Plus => match (&x, &y) {
            (Value::Str(a), Value::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Value::from(s))
            }
            (Value::Bytes(a), Value::Bytes(b)) => {
                let mut v = a.to_vec();
                v.extend_from_slice(b);
                Ok(Value::bytes(v))
            }
            (Value::List(a), Value::List(b)) => {
                let mut items = a.items.borrow().clone();
                items.extend(b.items.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                let mut items = a.to_vec();
                items.extend(b.iter().cloned());
                Ok(Value::tuple(items))
            }
            _ => Err(unknown_binary(op, &x, &y)),
        },
        Minus => match (&x, &y) {
            (Value::Set(a), Value::Set(b)) => {
                let items: Vec<Value> = a
                    .items
                    .borrow()
                    .iter()
                    .filter(|v| !b.contains(v))
                    .cloned()
                    .collect();
                Value::set_from(items)
            }
            _ => Err(unknown_binary(op, &x, &y)),
        },
        Star => match (&x, &y) {
            (Value::Str(s), n) | (n, Value::Str(s)) if n.as_int().is_some() => {
                Ok(Value::from(s.repeat(repeat_count(n))))
            }
            (Value::Bytes(b), n) | (n, Value::Bytes(b)) if n.as_int().is_some() => {
                Ok(Value::bytes(b.repeat(repeat_count(n))))
            }
            (Value::List(l), n) | (n, Value::List(l)) if n.as_int().is_some() => {
                Ok(Value::list(repeat_items(&l.items.borrow(), repeat_count(n))))
            }
            (Value::Tuple(t), n) | (n, Value::Tuple(t)) if n.as_int().is_some() => {
                Ok(Value::tuple(repeat_items(t, repeat_count(n))))
            }
            _ => Err(unknown_binary(op, &x, &y)),
        },
        Amp => match (&x, &y) {
            (Value::Set(a), Value::Set(b)) => {
                let items: Vec<Value> = a
                    .items
                    .borrow()
                    .iter()
                    .filter(|v| b.contains(v))
                    .cloned()
                    .collect();
                Value::set_from(items)
            }
            _ => Err(unknown_binary(op, &x, &y)),
        },
        Pipe => match (&x, &y) {
            (Value::Set(a), Value::Set(b)) => {
                let mut items = a.items.borrow().clone();
                for v in b.items.borrow().iter() {
                    if !items.contains(v) {
                        items.push(v.clone());
                    }
                }
                Value::set_from(items)
            }
            (Value::Dict(a), Value::Dict(b)) => {
                let mut pairs = a.entries.borrow().clone();
                pairs.extend(b.entries.borrow().iter().cloned());
                Value::dict_from(pairs)
            }
            _ => Err(unknown_binary(op, &x, &y)),
        },
        Circumflex => match (&x, &y) {
            (Value::Set(a), Value::Set(b)) => {
                let mut items: Vec<Value> = a
                    .items
                    .borrow()
                    .iter()
                    .filter(|v| !b.contains(v))
                    .cloned()
                    .collect();
                for v in b.items.borrow().iter() {
                    if !a.contains(v) {
                        items.push(v.clone());
                    }
                }
                Value::set_from(items)
            }
            _ => Err(unknown_binary(op, &x, &y)),
        },
        In => membership(&x, &y),
        _ => Err(unknown_binary(op, &x, &y)),
    }
}

/// `x in y`: `x` is the needle, `y` the container.
fn membership(x: &Value, y: &Value) -> Result<Value> {
    let found = match y {
        Value::List(l) => l.items.borrow().iter().any(|v| v == x),
        Value::Tuple(t) => t.iter().any(|v| v == x),
        Value::Set(s) => {
            x.hash()?;
            s.contains(x)
        }
        Value::Dict(d) => {
            x.hash()?;
            d.get(x).is_some()
        }
        Value::Str(s) => match x {
            Value::Str(needle) => s.contains(needle.as_ref()),
            _ => {
                return Err(Error::Type(format!(
                    "'in <string>' requires string as left operand, not {}",
                    x.type_name()
                )));
            }
        },
        Value::Bytes(b) => match x {
            Value::Bytes(needle) => {
                needle.is_empty() || b.windows(needle.len()).any(|w| w == needle.as_ref())
            }
            _ => {
                return Err(Error::Type(format!(
                    "'in <bytes>' requires bytes as left operand, not {}",
                    x.type_name()
                )));
            }
        },
        _ => return Err(unknown_binary(Opcode::In, x, y)),
    };
    Ok(Value::Bool(found))
}

/// Apply a unary operator.
pub(crate) fn unary(op: Opcode, x: Value) -> Result<Value> {
    use Opcode::*;
    match op {
        Not => Ok(Value::Bool(!x.truth())),
        UPlus => match x {
            Value::Int(_) | Value::BigInt(_) | Value::Float(_) => Ok(x),
            _ => Err(Error::Type(format!(
                "unknown unary op: +{}",
                x.type_name()
            ))),
        },
        UMinus => match &x {
            Value::Int(i) => Ok(i
                .checked_neg()
                .map(Value::Int)
                .unwrap_or_else(|| Value::int_from_big(-BigInt::from(*i)))),
            Value::BigInt(b) => Ok(Value::int_from_big(-(**b).clone())),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(Error::Type(format!(
                "unknown unary op: -{}",
                x.type_name()
            ))),
        },
        Tilde => match &x {
            Value::Int(i) => Ok(Value::Int(!i)),
            Value::BigInt(b) => Ok(Value::int_from_big(-((**b).clone() + BigInt::from(1)))),
            _ => Err(Error::Type(format!(
                "unknown unary op: ~{}",
                x.type_name()
            ))),
        },
        _ => Err(Error::Internal(format!("unary: unexpected opcode {:?}", op))),
    }
}

/// Apply a comparison opcode, yielding a bool.
pub(crate) fn compare(op: Opcode, x: &Value, y: &Value) -> Result<bool> {
    use Opcode::*;
    match op {
        Eql => Ok(x == y),
        Neq => Ok(x != y),
        Lt => Ok(cmp_values(x, y)? == Ordering::Less),
        Le => Ok(cmp_values(x, y)? != Ordering::Greater),
        Gt => Ok(cmp_values(x, y)? == Ordering::Greater),
        Ge => Ok(cmp_values(x, y)? != Ordering::Less),
        _ => Err(Error::Internal(format!(
            "compare: unexpected opcode {:?}",
            op
        ))),
    }
}

/// Total order within comparable classes; error across them.
pub(crate) fn cmp_values(x: &Value, y: &Value) -> Result<Ordering> {
    use Value::*;
    if let Some(ord) = num_cmp(x, y) {
        return ord;
    }
    match (x, y) {
        (Str(a), Str(b)) => Ok(a.cmp(b)),
        (Bytes(a), Bytes(b)) => Ok(a.cmp(b)),
        (Tuple(a), Tuple(b)) => cmp_sequences(a, b),
        (List(a), List(b)) => {
            if Rc::ptr_eq(a, b) {
                return Ok(Ordering::Equal);
            }
            let ai = a.items.borrow();
            let bi = b.items.borrow();
            cmp_sequences(&ai, &bi)
        }
        _ => Err(Error::Type(format!(
            "{} and {} are not comparable",
            x.type_name(),
            y.type_name()
        ))),
    }
}

fn cmp_sequences(a: &[Value], b: &[Value]) -> Result<Ordering> {
    for (av, bv) in a.iter().zip(b.iter()) {
        match cmp_values(av, bv)? {
            Ordering::Equal => {}
            other => return Ok(other),
        }
    }
    Ok(a.len().cmp(&b.len()))
}

fn num_cmp(x: &Value, y: &Value) -> Option<Result<Ordering>> {
    use Value::{Float, Int};
    let ord = match (x, y) {
        (Int(a), Int(b)) => a.cmp(b),
        (Value::BigInt(a), Value::BigInt(b)) => a.cmp(b),
        (Int(a), Value::BigInt(b)) => BigInt::from(*a).cmp(b),
        (Value::BigInt(a), Int(b)) => (**a).cmp(&BigInt::from(*b)),
        (Float(a), Float(b)) => return Some(float_cmp(*a, *b)),
        (Int(a), Float(b)) => return Some(float_cmp(*a as f64, *b)),
        (Float(a), Int(b)) => return Some(float_cmp(*a, *b as f64)),
        (Value::BigInt(a), Float(b)) => return Some(float_cmp(big_to_f64(a), *b)),
        (Float(a), Value::BigInt(b)) => return Some(float_cmp(*a, big_to_f64(b))),
        _ => return None,
    };
    Some(Ok(ord))
}

fn float_cmp(a: f64, b: f64) -> Result<Ordering> {
    a.partial_cmp(&b)
        .ok_or_else(|| Error::Value("floating-point NaN is not ordered".to_string()))
}

// ---------------------------------------------------------------------------
// Fused in-place operators
// ---------------------------------------------------------------------------

/// `x += y`: extend a list in place when the right side is iterable,
/// otherwise plain addition.
pub(crate) fn inplace_add(x: Value, y: Value) -> Result<Value> {
    if let Value::List(l) = &x {
        if let Some(extra) = y.collect_iterable() {
            l.check_mutable("extend")?;
            l.items.borrow_mut().extend(extra);
            return Ok(x);
        }
    }
    binary(Opcode::Plus, x, y)
}

/// `x |= y`: merge into a dict in place when both sides are dicts,
/// otherwise plain `|`.
pub(crate) fn inplace_pipe(x: Value, y: Value) -> Result<Value> {
    if let (Value::Dict(a), Value::Dict(b)) = (&x, &y) {
        a.check_mutable("update")?;
        let pairs = b.entries.borrow().clone();
        for (k, v) in pairs {
            a.insert(k, v)?;
        }
        return Ok(x);
    }
    binary(Opcode::Pipe, x, y)
}

// ---------------------------------------------------------------------------
// Numeric tower
// ---------------------------------------------------------------------------

fn repeat_count(n: &Value) -> usize {
    n.as_int().map(|i| i.max(0) as usize).unwrap_or(0)
}

fn repeat_items(items: &[Value], n: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * n);
    for _ in 0..n {
        out.extend_from_slice(items);
    }
    out
}

enum Num {
    I(i64),
    B(BigInt),
    F(f64),
}

fn num(v: &Value) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::I(*i)),
        Value::BigInt(b) => Some(Num::B((**b).clone())),
        Value::Float(f) => Some(Num::F(*f)),
        _ => None,
    }
}

/// Numeric binary operators; `None` when the opcode or either operand is
/// outside the numeric tower, letting the caller report the real types.
fn num_binary(op: Opcode, x: &Value, y: &Value) -> Option<Result<Value>> {
    use Opcode::*;
    if !matches!(
        op,
        Plus | Minus | Star | Slash | SlashSlash | Percent | Amp | Pipe | Circumflex | LtLt | GtGt
    ) {
        return Option::None;
    }
    let (a, b) = (num(x)?, num(y)?);
    // Shifts take an int count on the right regardless of promotion.
    if matches!(op, LtLt | GtGt) {
        return Some(shift(op, a, b));
    }
    if matches!(a, Num::F(_)) || matches!(b, Num::F(_)) {
        // Bitwise operators have no float form.
        if matches!(op, Amp | Pipe | Circumflex) {
            return Option::None;
        }
        return Some(float_binary(op, as_f64(a), as_f64(b)));
    }
    Some(match (a, b) {
        (Num::I(a), Num::I(b)) => int_binary(op, a, b),
        (a, b) => big_binary(op, to_big(a), to_big(b)),
    })
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::I(i) => i as f64,
        Num::B(ref b) => big_to_f64(b),
        Num::F(f) => f,
    }
}

fn to_big(n: Num) -> BigInt {
    match n {
        Num::I(i) => BigInt::from(i),
        Num::B(b) => b,
        Num::F(_) => unreachable!("float handled before promotion"),
    }
}

fn int_binary(op: Opcode, a: i64, b: i64) -> Result<Value> {
    use Opcode::*;
    match op {
        Plus => Ok(a
            .checked_add(b)
            .map(Value::Int)
            .unwrap_or_else(|| Value::int_from_big(BigInt::from(a) + b))),
        Minus => Ok(a
            .checked_sub(b)
            .map(Value::Int)
            .unwrap_or_else(|| Value::int_from_big(BigInt::from(a) - b))),
        Star => Ok(a
            .checked_mul(b)
            .map(Value::Int)
            .unwrap_or_else(|| Value::int_from_big(BigInt::from(a) * b))),
        Slash => {
            if b == 0 {
                Err(Error::Value("real division by zero".to_string()))
            } else {
                Ok(Value::Float(a as f64 / b as f64))
            }
        }
        SlashSlash => {
            if b == 0 {
                Err(Error::Value("floored division by zero".to_string()))
            } else {
                Ok(floordiv_int(a, b))
            }
        }
        Percent => {
            if b == 0 {
                Err(Error::Value("integer modulo by zero".to_string()))
            } else {
                Ok(floormod_int(a, b))
            }
        }
        Amp => Ok(Value::Int(a & b)),
        Pipe => Ok(Value::Int(a | b)),
        Circumflex => Ok(Value::Int(a ^ b)),
        _ => Err(Error::Internal(format!(
            "int_binary: unexpected opcode {:?}",
            op
        ))),
    }
}

fn big_binary(op: Opcode, a: BigInt, b: BigInt) -> Result<Value> {
    use Opcode::*;
    let zero = BigInt::from(0);
    match op {
        Plus => Ok(Value::int_from_big(a + b)),
        Minus => Ok(Value::int_from_big(a - b)),
        Star => Ok(Value::int_from_big(a * b)),
        Slash => {
            if b == zero {
                Err(Error::Value("real division by zero".to_string()))
            } else {
                Ok(Value::Float(big_to_f64(&a) / big_to_f64(&b)))
            }
        }
        SlashSlash => {
            if b == zero {
                Err(Error::Value("floored division by zero".to_string()))
            } else {
                Ok(Value::int_from_big(floordiv_big(&a, &b)))
            }
        }
        Percent => {
            if b == zero {
                Err(Error::Value("integer modulo by zero".to_string()))
            } else {
                let q = floordiv_big(&a, &b);
                Ok(Value::int_from_big(a - q * b))
            }
        }
        Amp => Ok(Value::int_from_big(a & b)),
        Pipe => Ok(Value::int_from_big(a | b)),
        Circumflex => Ok(Value::int_from_big(a ^ b)),
        _ => Err(Error::Internal(format!(
            "big_binary: unexpected opcode {:?}",
            op
        ))),
    }
}

fn float_binary(op: Opcode, a: f64, b: f64) -> Result<Value> {
    use Opcode::*;
    match op {
        Plus => Ok(Value::Float(a + b)),
        Minus => Ok(Value::Float(a - b)),
        Star => Ok(Value::Float(a * b)),
        Slash => {
            if b == 0.0 {
                Err(Error::Value("real division by zero".to_string()))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        SlashSlash => {
            if b == 0.0 {
                Err(Error::Value("floored division by zero".to_string()))
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
        Percent => {
            if b == 0.0 {
                Err(Error::Value("float modulo by zero".to_string()))
            } else {
                Ok(Value::Float(a - b * (a / b).floor()))
            }
        }
        _ => Err(Error::Internal(format!(
            "float_binary: unexpected opcode {:?}",
            op
        ))),
    }
}

fn shift(op: Opcode, a: Num, b: Num) -> Result<Value> {
    let count = match b {
        Num::I(i) => i,
        Num::B(_) => return Err(Error::Value("shift count too large".to_string())),
        Num::F(_) => return Err(Error::Type("shift count must be int, not float".to_string())),
    };
    if count < 0 {
        return Err(Error::Value("negative shift count".to_string()));
    }
    if count > 511 {
        return Err(Error::Value("shift count too large".to_string()));
    }
    let count = count as usize;
    let a = match a {
        Num::I(i) => BigInt::from(i),
        Num::B(b) => b,
        Num::F(_) => {
            return Err(Error::Type(format!(
                "unknown binary op: float {} int",
                sym(op)
            )));
        }
    };
    match op {
        Opcode::LtLt => Ok(Value::int_from_big(a << count)),
        Opcode::GtGt => Ok(Value::int_from_big(a >> count)),
        _ => Err(Error::Internal(format!("shift: unexpected opcode {:?}", op))),
    }
}

/// Floored integer division, promoting on the single overflow case.
fn floordiv_int(a: i64, b: i64) -> Value {
    match a.checked_div(b) {
        Some(q) => {
            if a % b != 0 && (a < 0) != (b < 0) {
                Value::Int(q - 1)
            } else {
                Value::Int(q)
            }
        }
        None => Value::int_from_big(floordiv_big(&BigInt::from(a), &BigInt::from(b))),
    }
}

fn floormod_int(a: i64, b: i64) -> Value {
    match a.checked_rem(b) {
        Some(r) => {
            if r != 0 && (a < 0) != (b < 0) {
                Value::Int(r + b)
            } else {
                Value::Int(r)
            }
        }
        None => Value::Int(0), // i64::MIN % -1
    }
}

fn floordiv_big(a: &BigInt, b: &BigInt) -> BigInt {
    let q = a / b;
    let r = a % b;
    let zero = BigInt::from(0);
    if r != zero && ((a < &zero) != (b < &zero)) {
        q - 1
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn int_overflow_promotes() {
        let v = binary(Opcode::Plus, int(i64::MAX), int(1)).unwrap();
        assert_eq!(v.repr(), "9223372036854775808");
        assert!(matches!(v, Value::BigInt(_)));
    }

    #[test]
    fn floored_division_matches_python() {
        assert_eq!(binary(Opcode::SlashSlash, int(7), int(2)).unwrap(), int(3));
        assert_eq!(binary(Opcode::SlashSlash, int(-7), int(2)).unwrap(), int(-4));
        assert_eq!(binary(Opcode::SlashSlash, int(7), int(-2)).unwrap(), int(-4));
        assert_eq!(binary(Opcode::Percent, int(-7), int(2)).unwrap(), int(1));
        assert_eq!(binary(Opcode::Percent, int(7), int(-2)).unwrap(), int(-1));
    }

    #[test]
    fn real_division_yields_float() {
        assert_eq!(
            binary(Opcode::Slash, int(7), int(2)).unwrap(),
            Value::Float(3.5)
        );
        let err = binary(Opcode::Slash, int(1), int(0)).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn unknown_binary_message() {
        let err = binary(Opcode::Plus, int(1), Value::from("a")).unwrap_err();
        assert_eq!(err.to_string(), "unknown binary op: int + string");
    }

    #[test]
    fn string_and_list_concat() {
        assert_eq!(
            binary(Opcode::Plus, Value::from("ab"), Value::from("cd")).unwrap(),
            Value::from("abcd")
        );
        let l = binary(
            Opcode::Plus,
            Value::list(vec![int(1)]),
            Value::list(vec![int(2)]),
        )
        .unwrap();
        assert_eq!(l.repr(), "[1, 2]");
    }

    #[test]
    fn membership() {
        let l = Value::list(vec![int(1), int(2)]);
        assert_eq!(
            binary(Opcode::In, int(2), l.clone()).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(binary(Opcode::In, int(5), l).unwrap(), Value::Bool(false));
        assert_eq!(
            binary(Opcode::In, Value::from("el"), Value::from("hello")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn comparisons() {
        assert!(compare(Opcode::Lt, &int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(Opcode::Ge, &Value::from("b"), &Value::from("a")).unwrap());
        assert!(cmp_values(&int(1), &Value::from("a")).is_err());
        let a = Value::list(vec![int(1), int(2)]);
        let b = Value::list(vec![int(1), int(3)]);
        assert!(compare(Opcode::Lt, &a, &b).unwrap());
    }

    #[test]
    fn shifts() {
        assert_eq!(binary(Opcode::LtLt, int(1), int(8)).unwrap(), int(256));
        assert_eq!(binary(Opcode::GtGt, int(-8), int(1)).unwrap(), int(-4));
        assert!(binary(Opcode::LtLt, int(1), int(-1)).is_err());
        assert!(binary(Opcode::LtLt, int(1), int(512)).is_err());
    }

    #[test]
    fn inplace_pipe_merges_dicts() {
        let a = Value::dict_from(vec![(Value::from("k"), int(1))]).unwrap();
        let b = Value::dict_from(vec![(Value::from("k"), int(2)), (Value::from("m"), int(3))])
            .unwrap();
        let r = inplace_pipe(a.clone(), b).unwrap();
        assert_eq!(r, a);
        assert_eq!(a.repr(), "{\"k\": 2, \"m\": 3}");
        // Ints fall back to bitwise or.
        assert_eq!(inplace_pipe(int(5), int(3)).unwrap(), int(7));
    }

    #[test]
    fn inplace_add_mutates_list() {
        let l = Value::list(vec![int(1)]);
        let r = inplace_add(l.clone(), Value::list(vec![int(2)])).unwrap();
        assert_eq!(l.repr(), "[1, 2]");
        assert_eq!(r, l);
        // Non-iterable right side falls back to Plus and fails for a list.
        assert!(inplace_add(l, int(1)).is_err());
    }
}
