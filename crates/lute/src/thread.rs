//! Execution threads.
//!
//! A [`Thread`] is the per-evaluation context: the call stack used for
//! recursion checks and backtraces, the step budget, the cancellation flag,
//! the `load` hook, and a string-keyed scratch area for the host
//! application. One thread evaluates one call stack at a time; distinct
//! threads are fully independent.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use crate::error::Result;
use crate::program::Program;
use crate::value::Value;

/// The `load` hook: resolve a module name to its exported bindings.
pub type LoadFn = Box<dyn FnMut(&mut Thread, &str) -> Result<HashMap<String, Value>>>;

/// The step-budget hook, invoked when `steps` reaches `max_steps`.
pub type OnMaxStepsFn = Box<dyn FnMut(&mut Thread) -> Result<()>>;

/// One entry of the thread's call stack.
pub(crate) struct Frame {
    pub(crate) name: String,
    /// `None` for builtin frames.
    pub(crate) program: Option<Rc<Program>>,
    pub(crate) fcode: usize,
    /// Program counter, kept current at call sites and on error exits.
    pub(crate) pc: u32,
}

/// An execution context for evaluating programs.
pub struct Thread {
    pub(crate) frames: Vec<Frame>,
    pub(crate) steps: u64,
    pub(crate) max_steps: u64,
    cancelled: Arc<OnceLock<String>>,
    pub(crate) load: Option<LoadFn>,
    pub(crate) on_max_steps: Option<OnMaxStepsFn>,
    locals: HashMap<String, Value>,
}

impl Thread {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            steps: 0,
            max_steps: 0,
            cancelled: Arc::new(OnceLock::new()),
            load: None,
            on_max_steps: None,
            locals: HashMap::new(),
        }
    }

    /// Cap the number of opcodes this thread may execute; 0 means no cap.
    ///
    /// On excess the [`Thread::on_max_steps`] hook runs if installed,
    /// otherwise the thread is cancelled with reason `"too many steps"`.
    pub fn set_max_steps(&mut self, max: u64) {
        self.max_steps = max;
    }

    /// Opcodes executed so far on this thread.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Install the step-budget hook. An error returned by the hook is
    /// raised at the current opcode (and is catchable, unlike cancellation).
    pub fn on_max_steps<F>(&mut self, f: F)
    where
        F: FnMut(&mut Thread) -> Result<()> + 'static,
    {
        self.on_max_steps = Some(Box::new(f));
    }

    /// Install the `load` hook.
    pub fn set_load<F>(&mut self, f: F)
    where
        F: FnMut(&mut Thread, &str) -> Result<HashMap<String, Value>> + 'static,
    {
        self.load = Some(Box::new(f));
    }

    /// Cancel execution. Idempotent; the first reason wins. The interpreter
    /// raises an uncatchable error at the next opcode.
    pub fn cancel(&self, reason: &str) {
        if self.cancelled.set(reason.to_string()).is_ok() {
            log::debug!("thread cancelled: {}", reason);
        }
    }

    /// The cancellation reason, if the thread has been cancelled.
    pub fn cancelled(&self) -> Option<&str> {
        self.cancelled.get().map(String::as_str)
    }

    /// A handle that can cancel this thread from another OS thread.
    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancelled.clone())
    }

    /// Store an application value on the thread.
    pub fn set_local(&mut self, key: impl Into<String>, v: Value) {
        self.locals.insert(key.into(), v);
    }

    /// Fetch an application value stored with [`Thread::set_local`].
    pub fn local(&self, key: &str) -> Option<&Value> {
        self.locals.get(key)
    }

    /// Depth of the call stack, for diagnostics.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels its [`Thread`] from any OS thread. Cloneable and cheap.
#[derive(Clone)]
pub struct Canceller(Arc<OnceLock<String>>);

impl Canceller {
    /// Same contract as [`Thread::cancel`].
    pub fn cancel(&self, reason: &str) {
        let _ = self.0.set(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cancel_reason_wins() {
        let t = Thread::new();
        t.cancel("first");
        t.cancel("second");
        assert_eq!(t.cancelled(), Some("first"));
    }

    #[test]
    fn thread_locals_round_trip() {
        let mut t = Thread::new();
        t.set_local("request_id", Value::Int(7));
        assert_eq!(t.local("request_id"), Some(&Value::Int(7)));
        assert_eq!(t.local("missing"), None);
    }

    #[test]
    fn canceller_reaches_thread() {
        let t = Thread::new();
        let c = t.canceller();
        c.cancel("remote");
        assert_eq!(t.cancelled(), Some("remote"));
    }
}
