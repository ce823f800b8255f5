//! Scenarios for the defer/catch subsystem: ordering of deferred blocks on
//! return, error recovery through catch blocks, and the interaction of the
//! two during unwinding.

use std::collections::HashMap;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use lute::{assemble, exec_program, Module, Thread, Value};

fn run(text: &str) -> (Value, Module) {
    try_run(text).unwrap()
}

fn try_run(text: &str) -> lute::Result<(Value, Module)> {
    let program = assemble(text).expect("test program must assemble");
    exec_program(&mut Thread::new(), Rc::new(program), HashMap::new())
}

// --- S2: three defers run innermost-first on return ------------------------

#[test]
fn defers_run_in_reverse_registration_order() {
    // Three defer blocks cover the whole main body. Each increments the
    // local i and records it in its global, so the observed values give the
    // execution order: x (greatest start pc) first, then y, then z.
    let (v, module) = run(r#"
program:
  globals:
    x
    y
    z
  constants:
    int 0
    int 1
  function: top 4 0 0
    locals:
      i
    defers:
      0 6 7
      0 6 18
      0 6 29
    code:
      constant 0      # 0
      setlocal 0      # 2: i = 0
      none            # 4
      rundefer        # 5
      return          # 6
      local 0         # 7: z block
      constant 1      # 9
      plus            # 11
      dup             # 12
      setlocal 0      # 13
      setglobal 2     # 15
      deferexit       # 17
      local 0         # 18: y block
      constant 1      # 20
      plus            # 22
      dup             # 23
      setlocal 0      # 24
      setglobal 1     # 26
      deferexit       # 28
      local 0         # 29: x block
      constant 1      # 31
      plus            # 33
      dup             # 34
      setlocal 0      # 35
      setglobal 0     # 37
      deferexit       # 39
"#);
    assert_eq!(v, Value::None);
    assert_eq!(module.global("x"), Some(Value::Int(1)));
    assert_eq!(module.global("y"), Some(Value::Int(2)));
    assert_eq!(module.global("z"), Some(Value::Int(3)));
}

// --- S3: a catch recovers an error from a callee ----------------------------

#[test]
fn catch_recovers_error_from_call() {
    let (v, module) = run(r#"
program:
  globals:
    result
  constants:
    int 1
    int 2
    string "a"
  function: top 4 0 0
    catches:
      0 8 9
    code:
      maketuple 0     # 0
      makefunc 1      # 2
      call 0          # 4: throws "unknown binary op: int + string"
      pop             # 6
      none            # 7
      return          # 8
      constant 1      # 9: catch body
      setglobal 0     # 11: result = 2
      catchjmp 0      # 13: return None from the toplevel
  function: fn 2 0 0
    code:
      constant 0
      constant 2
      plus
      return
"#);
    assert_eq!(v, Value::None);
    assert_eq!(module.global("result"), Some(Value::Int(2)));
}

// --- S4: the catch handles only its range; later errors escape --------------

#[test]
fn error_after_catch_region_is_not_caught() {
    let err = try_run(r#"
program:
  globals:
    result
    x
  constants:
    int 1
    int 2
    string "a"
  function: top 4 0 0
    catches:
      4 11 12
    code:
      constant 0      # 0
      setglobal 1     # 2: x = 1
      constant 0      # 4
      constant 2      # 6
      plus            # 8: caught
      pop             # 9
      none            # 10
      return          # 11
      constant 1      # 12: catch body
      setglobal 0     # 14: result = 2
      catchjmp 18     # 16: resume after the protected region
      global 1        # 18
      constant 2      # 20
      plus            # 22: uncaught
      pop             # 23
      none            # 24
      return          # 25
"#)
    .unwrap_err();
    assert!(err.to_string().contains("unknown binary op: int + string"));
}

// --- Defers on jumps --------------------------------------------------------

#[test]
fn defer_runs_when_jump_leaves_its_range() {
    let (_, module) = run(r#"
program:
  globals:
    g
    h
  constants:
    int 1
    int 2
  function: top 4 0 0
    defers:
      0 4 5
    code:
      rundefer        # 0
      jmp 10          # 1: leaves [0, 4]
      none            # 3: skipped
      return          # 4
      constant 0      # 5: defer body
      setglobal 0     # 7: g = 1
      deferexit       # 9
      constant 1      # 10: jump target
      setglobal 1     # 12: h = 2
      none            # 14
      return          # 15
"#);
    assert_eq!(module.global("g"), Some(Value::Int(1)));
    assert_eq!(module.global("h"), Some(Value::Int(2)));
}

#[test]
fn defer_skipped_when_jump_stays_inside_range() {
    let (v, module) = run(r#"
program:
  globals:
    g
  constants:
    int 1
  function: top 4 0 0
    defers:
      0 5 6
    code:
      rundefer        # 0
      jmp 4           # 1: stays inside [0, 5]
      nop             # 3
      none            # 4
      return          # 5: plain return, defer not armed
      constant 0      # 6: defer body
      setglobal 0     # 8
      deferexit       # 10
"#);
    assert_eq!(v, Value::None);
    // Neither the in-range jump nor the unarmed return ran the defer.
    assert_eq!(module.global("g"), None);
}

// --- Defers and catches together --------------------------------------------

#[test]
fn defer_inside_catch_range_runs_before_handler() {
    let (v, module) = run(r#"
program:
  globals:
    d
    r
  constants:
    int 1
    int 2
    string "a"
  function: top 4 0 0
    catches:
      0 7 13
    defers:
      0 4 8
    code:
      constant 0      # 0
      constant 2      # 2
      plus            # 4: throws; defer covers it, handler does not
      pop             # 5
      none            # 6
      return          # 7
      constant 0      # 8: defer body
      setglobal 0     # 10: d = 1
      deferexit       # 12
      constant 1      # 13: catch body
      setglobal 1     # 15: r = 2
      catchjmp 0      # 17
"#);
    assert_eq!(v, Value::None);
    assert_eq!(module.global("d"), Some(Value::Int(1)));
    assert_eq!(module.global("r"), Some(Value::Int(2)));
}

#[test]
fn outer_defer_suppressed_for_inner_catch_then_runs_on_return() {
    // The defer's range covers the catch body, so recovering inside the
    // function does not trigger it; the armed return afterwards does,
    // exactly once.
    let (v, module) = run(r#"
program:
  globals:
    d
    r
  constants:
    int 1
    int 2
    string "a"
  function: top 4 0 0
    catches:
      0 5 9
    defers:
      0 13 15
    code:
      constant 0      # 0
      constant 2      # 2
      plus            # 4: throws
      pop             # 5
      none            # 6
      rundefer        # 7
      return          # 8
      constant 1      # 9: catch body (covered by the defer's range)
      setglobal 1     # 11: r = 2
      catchjmp 6      # 13: resume at none
      constant 0      # 15: defer body
      setglobal 0     # 17: d = 1
      deferexit       # 19
"#);
    assert_eq!(v, Value::None);
    assert_eq!(module.global("r"), Some(Value::Int(2)));
    assert_eq!(module.global("d"), Some(Value::Int(1)));
}

#[test]
fn defer_runs_while_uncaught_error_unwinds() {
    // The module is lost on the error path, so the defer reports through a
    // shared predeclared list instead of a global.
    let trace = Value::list(vec![]);
    let mut predeclared = HashMap::new();
    predeclared.insert("L".to_string(), trace.clone());

    let program = assemble(r#"
program:
  names:
    L
  constants:
    int 1
    string "a"
  function: top 4 0 0
    defers:
      0 4 8
    code:
      constant 0      # 0
      constant 1      # 2
      plus            # 4: throws, no catch anywhere
      pop             # 5
      none            # 6
      return          # 7
      predeclared 0   # 8: defer body still runs
      constant 0      # 10
      append          # 12
      deferexit       # 13
"#)
    .unwrap();
    let err = exec_program(&mut Thread::new(), Rc::new(program), predeclared).unwrap_err();
    assert!(err.to_string().contains("unknown binary op: int + string"));
    assert_eq!(trace.repr(), "[1]");
}

#[test]
fn deferred_return_value_is_preserved() {
    // The defer overwrites the global after the return value was captured.
    let (v, module) = run(r#"
program:
  globals:
    g
  constants:
    int 1
    int 2
  function: top 4 0 0
    defers:
      0 7 8
    code:
      constant 0      # 0: g = 1
      setglobal 0     # 2
      constant 1      # 4: return 2
      rundefer        # 6
      return          # 7
      constant 1      # 8: defer body: g = 2
      setglobal 0     # 10
      deferexit       # 12
"#);
    assert_eq!(v, Value::Int(2));
    assert_eq!(module.global("g"), Some(Value::Int(2)));
}
