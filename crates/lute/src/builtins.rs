//! The universe: builtins every module can reach via the UNIVERSAL opcode.
//!
//! Only the minimum contract the VM relies on lives here; the rich library
//! belongs to the host. Each entry is an ordinary [`Value::Builtin`], so
//! hosts can shadow or extend the set through a module's predeclared
//! environment.

use crate::error::{Error, Result};
use crate::thread::Thread;
use crate::value::Value;

/// Resolve a universal name, or `None` if it is not part of the universe.
pub fn universal(name: &str) -> Option<Value> {
    let v = match name {
        "len" => Value::builtin("len", builtin_len),
        "str" => Value::builtin("str", builtin_str),
        "type" => Value::builtin("type", builtin_type),
        "bool" => Value::builtin("bool", builtin_bool),
        "fail" => Value::builtin("fail", builtin_fail),
        _ => return None,
    };
    Some(v)
}

/// Reject keyword arguments and enforce an exact positional count.
fn check_args(name: &str, args: &[Value], kwargs: &[(Value, Value)], n: usize) -> Result<()> {
    if !kwargs.is_empty() {
        return Err(Error::Type(format!(
            "{}() got an unexpected keyword argument",
            name
        )));
    }
    if args.len() != n {
        return Err(Error::Type(format!(
            "{}() takes exactly {} argument(s) ({} given)",
            name,
            n,
            args.len()
        )));
    }
    Ok(())
}

fn builtin_len(_: &mut Thread, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Result<Value> {
    check_args("len", &args, &kwargs, 1)?;
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Tuple(t) => t.len(),
        Value::List(l) => l.len(),
        Value::Dict(d) => d.len(),
        Value::Set(s) => s.len(),
        other => {
            return Err(Error::Type(format!(
                "len: value of type {} has no len",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(n as i64))
}

fn builtin_str(_: &mut Thread, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Result<Value> {
    check_args("str", &args, &kwargs, 1)?;
    Ok(Value::from(args[0].to_string()))
}

fn builtin_type(_: &mut Thread, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Result<Value> {
    check_args("type", &args, &kwargs, 1)?;
    Ok(Value::from(args[0].type_name()))
}

fn builtin_bool(_: &mut Thread, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Result<Value> {
    check_args("bool", &args, &kwargs, 1)?;
    Ok(Value::Bool(args[0].truth()))
}

fn builtin_fail(_: &mut Thread, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Result<Value> {
    if !kwargs.is_empty() {
        return Err(Error::Type(
            "fail() got an unexpected keyword argument".to_string(),
        ));
    }
    let msg = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    Err(Error::Value(format!("fail: {}", msg)))
}
