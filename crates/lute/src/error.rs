//! Error types for assembly and evaluation.
//!
//! Errors are plain values: the interpreter surfaces them through `Result`
//! returns, never through unwinding. Each variant corresponds to one error
//! kind of the runtime; `Eval` wraps any of the others with the call-stack
//! backtrace collected when the error escaped a call.

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the assembler and the virtual machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Operator applied to incompatible operands, or a value of the wrong
    /// kind (not iterable, not hashable, not callable, ...).
    #[error("{0}")]
    Type(String),

    /// A local, global, free variable, or load name could not be resolved.
    #[error("{0}")]
    Name(String),

    /// Structural errors: unpack arity mismatch, duplicate dict key,
    /// out-of-range conversion.
    #[error("{0}")]
    Value(String),

    /// Mutation of a frozen container, or of a container with live iterators.
    #[error("{0}")]
    Mutation(String),

    /// Self-recursive call while the program's `recursion` flag is off.
    #[error("function {0} called recursively")]
    Recursion(String),

    /// The step budget was exhausted. Raised by `OnMaxSteps` hooks; the
    /// default behaviour without a hook is thread cancellation instead.
    #[error("too many steps")]
    TooManySteps,

    /// The `load` hook failed or the loaded module lacks a requested name.
    #[error("{0}")]
    Load(String),

    /// The thread was cancelled. Not catchable by `catch`.
    #[error("evaluation cancelled: {0}")]
    Cancelled(String),

    /// Corrupted program or unimplemented opcode. Not catchable.
    #[error("internal error: {0}")]
    Internal(String),

    /// Textual assembly rejected the input.
    #[error("asm: {0}")]
    Asm(String),

    /// An error that escaped a call, with the backtrace at that point.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl Error {
    /// Whether `catch` blocks must not intercept this error.
    pub fn uncatchable(&self) -> bool {
        match self {
            Error::Cancelled(_) | Error::Internal(_) => true,
            Error::Eval(e) => e.cause.uncatchable(),
            _ => false,
        }
    }

    /// The underlying error, unwrapping any `Eval` backtrace layers.
    pub fn cause(&self) -> &Error {
        match self {
            Error::Eval(e) => e.cause.cause(),
            other => other,
        }
    }
}

/// One call-stack entry of an [`EvalError`] backtrace, innermost last.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Function name, or the builtin's name for native frames.
    pub name: String,
    /// Program counter inside the function at the time of the error.
    pub pc: u32,
    /// Source line resolved through the funcode's line table, when known.
    pub line: Option<u32>,
}

impl fmt::Display for FrameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {})", self.name, line),
            None => write!(f, "{} (pc {})", self.name, self.pc),
        }
    }
}

/// An evaluation error together with the frames it unwound through.
///
/// `Display` shows only the cause, so message-matching code keeps working;
/// [`EvalError::backtrace`] renders the full trace.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{cause}")]
pub struct EvalError {
    /// Outermost frame first.
    pub frames: Vec<FrameRecord>,
    /// The error that unwound the stack.
    pub cause: Box<Error>,
}

impl EvalError {
    /// Render a multi-line traceback, outermost call first.
    pub fn backtrace(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for fr in &self.frames {
            out.push_str(&format!("  {}\n", fr));
        }
        out.push_str(&format!("Error: {}", self.cause));
        out
    }
}
