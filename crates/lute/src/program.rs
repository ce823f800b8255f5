//! Compiled program representation.
//!
//! This module defines the read-only data the VM executes: a [`Program`]
//! holding shared pools (loads, names, globals, constants) and one
//! [`Funcode`] per function, the toplevel first. Programs are produced by an
//! external compiler or by the textual assembler and are immutable at run
//! time, so they can be shared freely across threads of execution.

use num_bigint::BigInt;

use crate::error::{Error, Result};
use crate::opcode::{self, Opcode};

/// A named binding in one of the program's binding lists.
///
/// The compiler attaches source positions to bindings; the VM only needs the
/// name, for error messages and for the assembler's symbolic sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
}

impl Binding {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// An entry of the constant pool, referenced by `CONSTANT <idx>`.
///
/// Integers that fit a machine word are stored inline; wider literals use
/// the `BigInt` variant. Strings and bytes are stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// A `defer` or `catch` descriptor.
///
/// The descriptor covers the closed PC range `[pc0, pc1]`; `start_pc` is the
/// first instruction of the deferred (or handler) body. A control transfer
/// out of the covered range enters the body before control reaches its
/// destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferDesc {
    pub pc0: u32,
    pub pc1: u32,
    pub start_pc: u32,
}

impl DeferDesc {
    /// Whether this descriptor covers `pc`.
    pub fn covers(&self, pc: u32) -> bool {
        self.pc0 <= pc && pc <= self.pc1
    }
}

/// The compiled body of one function.
#[derive(Debug, Clone, PartialEq)]
pub struct Funcode {
    /// Function name, used in backtraces and the assembly listing.
    pub name: String,
    /// Maximum operand-stack depth the code may reach.
    pub max_stack: u32,
    /// Number of named parameters, including keyword-only ones.
    pub num_params: u32,
    /// Number of trailing parameters that are keyword-only.
    pub num_kwonly_params: u32,
    /// Whether the function collects excess positional arguments.
    pub has_varargs: bool,
    /// Whether the function collects excess keyword arguments.
    pub has_kwargs: bool,
    /// Named local slots; parameters come first, then `*args`/`**kwargs`
    /// slots when present, then other locals.
    pub locals: Vec<Binding>,
    /// Indices of locals that must be promoted to shared cells on entry.
    pub cells: Vec<u32>,
    /// Names of variables captured from the enclosing function.
    pub freevars: Vec<Binding>,
    /// `catch` descriptors, outermost first.
    pub catches: Vec<DeferDesc>,
    /// `defer` descriptors, outermost first.
    pub defers: Vec<DeferDesc>,
    /// The instruction stream.
    pub code: Vec<u8>,
    /// Sparse pc → source line table, ascending by pc. Empty for assembled
    /// programs, which carry no position info.
    pub line_table: Vec<(u32, u32)>,
}

impl Funcode {
    /// The source line active at `pc`, if the line table knows it.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        let mut line = None;
        for &(entry_pc, entry_line) in &self.line_table {
            if entry_pc > pc {
                break;
            }
            line = Some(entry_line);
        }
        line
    }

    /// The set of valid instruction-start offsets, in ascending order.
    ///
    /// Fails if the code stream does not decode cleanly to its end.
    pub fn boundaries(&self) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut pc = 0usize;
        while pc < self.code.len() {
            out.push(pc as u32);
            let (_, _, next) = opcode::decode(&self.code, pc)?;
            pc = next;
        }
        Ok(out)
    }

    /// Validate the structural invariants the interpreter relies on: the
    /// code decodes cleanly, jump targets land on instruction boundaries,
    /// cell indices refer to locals, and every defer/catch descriptor is
    /// well-formed with its start outside its own covered range.
    pub fn validate(&self) -> Result<()> {
        let boundaries = self.boundaries()?;
        let is_boundary = |pc: u32| boundaries.binary_search(&pc).is_ok();

        let mut pc = 0usize;
        while pc < self.code.len() {
            let (op, arg, next) = opcode::decode(&self.code, pc)?;
            match op {
                Opcode::Jmp | Opcode::Cjmp | Opcode::IterJmp => {
                    if !is_boundary(arg) {
                        return Err(Error::Internal(format!(
                            "function {}: {} target {} is not an instruction boundary",
                            self.name,
                            op.mnemonic(),
                            arg
                        )));
                    }
                }
                // Target 0 is the "return None" sentinel for toplevel
                // catches; it happens to also be a boundary, so only
                // nonzero targets need the check.
                Opcode::CatchJmp => {
                    if arg != 0 && !is_boundary(arg) {
                        return Err(Error::Internal(format!(
                            "function {}: catchjmp target {} is not an instruction boundary",
                            self.name, arg
                        )));
                    }
                }
                _ => {}
            }
            pc = next;
        }

        for &cell in &self.cells {
            if cell as usize >= self.locals.len() {
                return Err(Error::Internal(format!(
                    "function {}: cell index {} out of range ({} locals)",
                    self.name,
                    cell,
                    self.locals.len()
                )));
            }
        }

        for (what, descs) in [("catch", &self.catches), ("defer", &self.defers)] {
            for d in descs.iter() {
                if !(d.pc0 < d.pc1 && (d.pc1 as usize) < self.code.len()) {
                    return Err(Error::Internal(format!(
                        "function {}: {} range [{}, {}] is malformed",
                        self.name, what, d.pc0, d.pc1
                    )));
                }
                if !is_boundary(d.pc0) || !is_boundary(d.pc1) || !is_boundary(d.start_pc) {
                    return Err(Error::Internal(format!(
                        "function {}: {} descriptor ({} {} {}) is not on instruction boundaries",
                        self.name, what, d.pc0, d.pc1, d.start_pc
                    )));
                }
                if d.covers(d.start_pc) {
                    return Err(Error::Internal(format!(
                        "function {}: {} body at {} lies inside its own covered range [{}, {}]",
                        self.name, what, d.start_pc, d.pc0, d.pc1
                    )));
                }
            }
        }

        Ok(())
    }
}

/// A complete compiled program.
///
/// `functions[0]` is the toplevel; `MAKEFUNC <idx>` closes over any entry of
/// the list.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// When false, direct or indirect self-recursion fails at call time.
    pub recursion: bool,
    /// Modules named by `load` statements.
    pub loads: Vec<Binding>,
    /// Attribute and predeclared/universal identifiers, indexed by
    /// ATTR/SETFIELD/PREDECLARED/UNIVERSAL arguments.
    pub names: Vec<String>,
    /// Module-level variables, indexed by GLOBAL/SETGLOBAL arguments.
    pub globals: Vec<Binding>,
    /// The constant pool.
    pub constants: Vec<Constant>,
    /// All funcodes, toplevel first.
    pub functions: Vec<Funcode>,
}

impl Program {
    /// The toplevel funcode.
    pub fn toplevel(&self) -> &Funcode {
        &self.functions[0]
    }

    /// Validate every funcode.
    pub fn validate(&self) -> Result<()> {
        if self.functions.is_empty() {
            return Err(Error::Internal(
                "program has no toplevel function".to_string(),
            ));
        }
        for f in &self.functions {
            f.validate()?;
        }
        Ok(())
    }

    pub(crate) fn constant(&self, idx: u32) -> Result<&Constant> {
        self.constants
            .get(idx as usize)
            .ok_or_else(|| Error::Internal(format!("constant index {} out of range", idx)))
    }

    pub(crate) fn name(&self, idx: u32) -> Result<&str> {
        self.names
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| Error::Internal(format!("name index {} out of range", idx)))
    }

    pub(crate) fn funcode(&self, idx: u32) -> Result<&Funcode> {
        self.functions
            .get(idx as usize)
            .ok_or_else(|| Error::Internal(format!("funcode index {} out of range", idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::encode_varint;

    fn code(ops: &[(Opcode, Option<u32>)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(op, arg) in ops {
            out.push(op as u8);
            if let Some(a) = arg {
                encode_varint(&mut out, a);
            }
        }
        out
    }

    fn funcode(code: Vec<u8>) -> Funcode {
        Funcode {
            name: "f".to_string(),
            max_stack: 4,
            num_params: 0,
            num_kwonly_params: 0,
            has_varargs: false,
            has_kwargs: false,
            locals: Vec::new(),
            cells: Vec::new(),
            freevars: Vec::new(),
            catches: Vec::new(),
            defers: Vec::new(),
            code,
            line_table: Vec::new(),
        }
    }

    #[test]
    fn boundaries_skip_arguments() {
        let f = funcode(code(&[
            (Opcode::None, None),
            (Opcode::Jmp, Some(3)),
            (Opcode::Return, None),
        ]));
        assert_eq!(f.boundaries().unwrap(), vec![0, 1, 3]);
        f.validate().unwrap();
    }

    #[test]
    fn jump_into_argument_rejected() {
        let f = funcode(code(&[
            (Opcode::None, None),
            (Opcode::Jmp, Some(2)), // lands on the jmp's own argument byte
            (Opcode::Return, None),
        ]));
        assert!(f.validate().is_err());
    }

    #[test]
    fn defer_start_inside_own_range_rejected() {
        let mut f = funcode(code(&[
            (Opcode::None, None),
            (Opcode::RunDefer, None),
            (Opcode::Return, None),
        ]));
        f.defers.push(DeferDesc {
            pc0: 0,
            pc1: 2,
            start_pc: 1,
        });
        assert!(f.validate().is_err());
    }

    #[test]
    fn line_lookup_uses_last_entry_not_after_pc() {
        let mut f = funcode(code(&[(Opcode::None, None), (Opcode::Return, None)]));
        f.line_table = vec![(0, 10), (1, 12)];
        assert_eq!(f.line_for_pc(0), Some(10));
        assert_eq!(f.line_for_pc(1), Some(12));
    }
}
