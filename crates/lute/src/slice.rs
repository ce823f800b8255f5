//! Slicing for the SLICE opcode.
//!
//! Handles `x[lo:hi:step]` over lists, tuples, strings, and bytes with the
//! usual negative-index and negative-step semantics. Bound normalization is
//! done once, on indices; the per-type code only materializes the selected
//! elements.

use crate::error::{Error, Result};
use crate::value::Value;

/// Apply `x[lo:hi:step]`. Any bound may be `None` for "unspecified".
pub(crate) fn apply(x: &Value, lo: &Value, hi: &Value, step: &Value) -> Result<Value> {
    let lo = bound(lo)?;
    let hi = bound(hi)?;
    let step = match step {
        Value::None => 1,
        v => v.as_index("slice")?,
    };
    if step == 0 {
        return Err(Error::Value("zero is not a valid slice step".to_string()));
    }

    match x {
        Value::List(l) => {
            let items = l.items.borrow();
            let picked = indices(items.len(), lo, hi, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(Value::list(picked))
        }
        Value::Tuple(t) => {
            let picked = indices(t.len(), lo, hi, step)
                .into_iter()
                .map(|i| t[i].clone())
                .collect();
            Ok(Value::tuple(picked))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked: String = indices(chars.len(), lo, hi, step)
                .into_iter()
                .map(|i| chars[i])
                .collect();
            Ok(Value::from(picked))
        }
        Value::Bytes(b) => {
            let picked: Vec<u8> = indices(b.len(), lo, hi, step)
                .into_iter()
                .map(|i| b[i])
                .collect();
            Ok(Value::bytes(picked))
        }
        _ => Err(Error::Type(format!(
            "invalid slice operand: {}",
            x.type_name()
        ))),
    }
}

fn bound(v: &Value) -> Result<Option<i64>> {
    match v {
        Value::None => Ok(None),
        v => v.as_index("slice").map(Some),
    }
}

/// The element indices a slice selects, in selection order.
fn indices(len: usize, lo: Option<i64>, hi: Option<i64>, step: i64) -> Vec<usize> {
    let n = len as i64;
    let mut out = Vec::new();
    if step > 0 {
        let norm = |i: i64| (if i < 0 { i + n } else { i }).clamp(0, n);
        let start = lo.map(norm).unwrap_or(0);
        let end = hi.map(norm).unwrap_or(n);
        let mut i = start;
        while i < end {
            out.push(i as usize);
            i += step;
        }
    } else {
        let norm = |i: i64| (if i < 0 { i + n } else { i }).clamp(-1, n - 1);
        let start = lo.map(norm).unwrap_or(n - 1);
        let end = hi.map(norm).unwrap_or(-1);
        let mut i = start;
        while i > end {
            out.push(i as usize);
            i += step;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> Value {
        Value::list((0..5).map(Value::Int).collect())
    }

    fn none() -> Value {
        Value::None
    }

    #[test]
    fn forward_slices() {
        let l = list();
        assert_eq!(
            apply(&l, &Value::Int(1), &Value::Int(4), &none()).unwrap().repr(),
            "[1, 2, 3]"
        );
        assert_eq!(
            apply(&l, &none(), &none(), &Value::Int(2)).unwrap().repr(),
            "[0, 2, 4]"
        );
        assert_eq!(
            apply(&l, &Value::Int(-2), &none(), &none()).unwrap().repr(),
            "[3, 4]"
        );
        assert_eq!(
            apply(&l, &Value::Int(10), &none(), &none()).unwrap().repr(),
            "[]"
        );
    }

    #[test]
    fn reverse_slices() {
        let l = list();
        assert_eq!(
            apply(&l, &none(), &none(), &Value::Int(-1)).unwrap().repr(),
            "[4, 3, 2, 1, 0]"
        );
        assert_eq!(
            apply(&l, &Value::Int(3), &Value::Int(0), &Value::Int(-2))
                .unwrap()
                .repr(),
            "[3, 1]"
        );
    }

    #[test]
    fn string_slices_are_char_based() {
        let s = Value::from("héllo");
        assert_eq!(
            apply(&s, &Value::Int(1), &Value::Int(3), &none()).unwrap(),
            Value::from("él")
        );
        assert_eq!(
            apply(&s, &none(), &none(), &Value::Int(-1)).unwrap(),
            Value::from("olléh")
        );
    }

    #[test]
    fn zero_step_rejected() {
        let err = apply(&list(), &none(), &none(), &Value::Int(0)).unwrap_err();
        assert!(err.to_string().contains("slice step"));
    }
}
