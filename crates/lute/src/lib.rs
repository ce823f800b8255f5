//! Lute — a bytecode virtual machine for a small dynamically-typed
//! scripting language in the Starlark family.
//!
//! The crate is the runtime core only: it executes compiled [`Program`]s
//! and round-trips them through a textual assembly format. Parsing and
//! compiling source code, the module-loading cache, and the rich builtin
//! library are the host's business.
//!
//! # Quick start
//!
//! Programs enter the VM through the assembler:
//!
//! ```
//! use std::rc::Rc;
//! use lute::{assemble, exec_program, Thread, Value};
//!
//! let program = assemble(
//!     r#"
//! program:
//!   globals:
//!     answer
//!   constants:
//!     int 42
//!   function: top 1 0 0
//!     code:
//!       constant 0
//!       setglobal 0
//!       none
//!       return
//! "#,
//! )
//! .unwrap();
//!
//! let mut thread = Thread::new();
//! let (value, module) = exec_program(&mut thread, Rc::new(program), Default::default()).unwrap();
//! assert_eq!(value, Value::None);
//! assert_eq!(module.global("answer"), Some(Value::Int(42)));
//! ```
//!
//! # Highlights
//!
//! - **Values** ([`Value`]): shared, reference-counted containers with deep
//!   one-way freezing and iterator pinning (no mutation while iterated).
//! - **Deferred execution**: `defer` and `catch` blocks are interval
//!   descriptors over the code; the interpreter unwinds through them on
//!   jumps, returns, and errors.
//! - **Threads** ([`Thread`]): step budgets, cross-thread cancellation, a
//!   pluggable `load` hook, and evaluation backtraces.
//! - **Assembly** ([`assemble`]/[`disassemble`]): a stable, line-oriented
//!   text format that round-trips programs exactly, minus positions.

mod asm;
mod builtins;
mod error;
mod module;
mod opcode;
mod operators;
mod program;
mod slice;
mod thread;
mod value;
mod vm;

pub use asm::{assemble, disassemble};
pub use builtins::universal;
pub use error::{Error, EvalError, FrameRecord, Result};
pub use module::Module;
pub use opcode::{Opcode, ARG_MIN};
pub use program::{Binding, Constant, DeferDesc, Funcode, Program};
pub use thread::{Canceller, LoadFn, OnMaxStepsFn, Thread};
pub use value::{Builtin, Function, NativeFn, Value, ValueIterator};
pub use vm::{call, exec_program};
