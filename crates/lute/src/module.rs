//! Module instances.
//!
//! A module binds a compiled [`Program`] to a predeclared environment and a
//! vector of global slots. Slots start unassigned; reading an unassigned
//! global is a name error, per the resolver's contract.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::program::Program;
use crate::value::Value;

#[derive(Debug)]
pub(crate) struct ModuleData {
    pub(crate) program: Rc<Program>,
    pub(crate) predeclared: HashMap<String, Value>,
    /// One slot per `Program::globals` binding; `None` = unassigned.
    pub(crate) globals: RefCell<Vec<Option<Value>>>,
}

/// A handle to an initialized (or in-flight) module.
///
/// Returned by [`crate::exec_program`]; lets the host read globals after the
/// toplevel has run.
#[derive(Debug, Clone)]
pub struct Module {
    pub(crate) data: Rc<ModuleData>,
}

impl Module {
    pub(crate) fn new(program: Rc<Program>, predeclared: HashMap<String, Value>) -> Self {
        let globals = RefCell::new(vec![None; program.globals.len()]);
        Module {
            data: Rc::new(ModuleData {
                program,
                predeclared,
                globals,
            }),
        }
    }

    /// The value of a global by name, if it has been assigned.
    pub fn global(&self, name: &str) -> Option<Value> {
        let idx = self
            .data
            .program
            .globals
            .iter()
            .position(|b| b.name == name)?;
        self.data.globals.borrow()[idx].clone()
    }

    /// All assigned globals, in binding order.
    pub fn globals(&self) -> Vec<(String, Value)> {
        let slots = self.data.globals.borrow();
        self.data
            .program
            .globals
            .iter()
            .zip(slots.iter())
            .filter_map(|(b, v)| v.clone().map(|v| (b.name.clone(), v)))
            .collect()
    }

    /// Deep-freeze every assigned global. Call after initialization to make
    /// the module safely shareable.
    pub fn freeze(&self) {
        for slot in self.data.globals.borrow().iter().flatten() {
            slot.freeze();
        }
    }
}
