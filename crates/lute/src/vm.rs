//! The bytecode interpreter.
//!
//! This module executes [`Funcode`]s: it owns the per-call state (locals,
//! operand stack, iterator stack, deferred-action stack) and the
//! fetch-decode-execute loop. Everything else — values, operators, slicing,
//! builtins — is a stateless helper it calls into.
//!
//! Error discipline: an error raised by any opcode body becomes the loop's
//! in-flight error. The loop then consults the function's catch table;
//! a matching handler receives the error as the caught error and execution
//! resumes at its body, possibly after running intervening `defer` blocks.
//! An unhandled error is wrapped with the thread's backtrace and returned
//! to the caller.

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::builtins;
use crate::error::{Error, EvalError, FrameRecord, Result};
use crate::module::Module;
use crate::opcode::{self, Opcode};
use crate::operators;
use crate::program::{Constant, DeferDesc, Funcode, Program};
use crate::slice;
use crate::thread::{Frame, Thread};
use crate::value::{CellData, Function, Value, ValueIterator};

/// Run a program's toplevel in a fresh module with the given predeclared
/// environment. Returns the toplevel's value and the initialized module.
pub fn exec_program(
    thread: &mut Thread,
    program: Rc<Program>,
    predeclared: HashMap<String, Value>,
) -> Result<(Value, Module)> {
    program.validate()?;
    log::debug!(
        "executing program: toplevel {}, {} function(s), {} global(s)",
        program.toplevel().name,
        program.functions.len(),
        program.globals.len()
    );
    let module = Module::new(program.clone(), predeclared);
    let toplevel = Value::Function(Rc::new(Function::new(
        program,
        0,
        module.data.clone(),
        Vec::new(),
        Vec::new(),
    )));
    let value = call(thread, &toplevel, Vec::new(), Vec::new())?;
    Ok((value, module))
}

/// Call a callable value with positional and keyword arguments.
///
/// Keyword argument names must be string values.
pub fn call(
    thread: &mut Thread,
    callee: &Value,
    args: Vec<Value>,
    kwargs: Vec<(Value, Value)>,
) -> Result<Value> {
    match callee {
        Value::Function(f) => call_function(thread, f, args, kwargs),
        Value::Builtin(b) => {
            thread.frames.push(Frame {
                name: b.name.clone(),
                program: None,
                fcode: 0,
                pc: 0,
            });
            let result = (b.func)(thread, args, kwargs).map_err(|e| wrap_error(thread, e));
            thread.frames.pop();
            result
        }
        other => Err(Error::Type(format!(
            "{} value is not callable",
            other.type_name()
        ))),
    }
}

fn call_function(
    thread: &mut Thread,
    f: &Rc<Function>,
    args: Vec<Value>,
    kwargs: Vec<(Value, Value)>,
) -> Result<Value> {
    let fc = f.funcode();

    if !f.program.recursion {
        for fr in &thread.frames {
            if let Some(p) = &fr.program {
                if Rc::ptr_eq(p, &f.program) && fr.fcode == f.fcode {
                    return Err(Error::Recursion(fc.name.clone()));
                }
            }
        }
    }

    thread.frames.push(Frame {
        name: fc.name.clone(),
        program: Some(f.program.clone()),
        fcode: f.fcode,
        pc: 0,
    });

    let result = match set_args(f, fc, args, kwargs) {
        Ok(locals) => {
            let mut interp = Interp {
                f,
                fc,
                locals,
                stack: Vec::with_capacity(fc.max_stack as usize),
                iters: SmallVec::new(),
                pending: SmallVec::new(),
                pc: 0,
                run_defer: false,
                caught: None,
            };
            interp.run(thread)
        }
        Err(e) => Err(e),
    };

    let result = result.map_err(|e| wrap_error(thread, e));
    thread.frames.pop();
    result
}

/// Materialize a constant-pool entry as a value.
fn constant_value(c: &Constant) -> Value {
    match c {
        Constant::Int(i) => Value::Int(*i),
        Constant::BigInt(b) => Value::int_from_big(b.clone()),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::from(s.as_str()),
        Constant::Bytes(b) => Value::bytes(b.clone()),
    }
}

/// Wrap an escaping error with the thread's current backtrace, once.
fn wrap_error(thread: &Thread, err: Error) -> Error {
    if matches!(err, Error::Eval(_)) {
        return err;
    }
    let frames = thread
        .frames
        .iter()
        .map(|fr| FrameRecord {
            name: fr.name.clone(),
            pc: fr.pc,
            line: fr
                .program
                .as_ref()
                .and_then(|p| p.functions.get(fr.fcode))
                .and_then(|fc| fc.line_for_pc(fr.pc)),
        })
        .collect();
    Error::Eval(EvalError {
        frames,
        cause: Box::new(err),
    })
}

// ---------------------------------------------------------------------------
// Argument binding
// ---------------------------------------------------------------------------

/// Bind call arguments to the function's local slots, applying defaults and
/// promoting cell locals.
fn set_args(
    f: &Function,
    fc: &Funcode,
    args: Vec<Value>,
    kwargs: Vec<(Value, Value)>,
) -> Result<Vec<Option<Value>>> {
    let fname = &fc.name;
    let nparams = fc.num_params as usize;
    let nkwonly = fc.num_kwonly_params as usize;
    let npos_params = nparams
        .checked_sub(nkwonly)
        .ok_or_else(|| Error::Internal(format!("{}: more kwonly params than params", fname)))?;
    let extra_slots = fc.has_varargs as usize + fc.has_kwargs as usize;
    if fc.locals.len() < nparams + extra_slots || f.defaults.len() > nparams {
        return Err(Error::Internal(format!(
            "{}: malformed parameter layout",
            fname
        )));
    }

    let mut locals: Vec<Option<Value>> = vec![None; fc.locals.len()];

    // Positional arguments; the excess goes to *args or is an error.
    let mut varargs = Vec::new();
    let nargs = args.len();
    for (i, v) in args.into_iter().enumerate() {
        if i < npos_params {
            locals[i] = Some(v);
        } else if fc.has_varargs {
            varargs.push(v);
        } else {
            return Err(Error::Type(format!(
                "{}() accepts at most {} positional argument(s) ({} given)",
                fname, npos_params, nargs
            )));
        }
    }

    // Keyword arguments; the excess goes to **kwargs or is an error.
    let kwdict = crate::value::DictData::new();
    for (k, v) in kwargs {
        let key = match k.as_str() {
            Some(s) => s.to_string(),
            None => return Err(Error::Type("keywords must be strings".to_string())),
        };
        if let Some(i) = fc.locals[..nparams].iter().position(|b| b.name == key) {
            if locals[i].is_some() {
                return Err(Error::Type(format!(
                    "{}() got multiple values for parameter '{}'",
                    fname, key
                )));
            }
            locals[i] = Some(v);
        } else if fc.has_kwargs {
            if kwdict.get(&k).is_some() {
                return Err(Error::Type(format!(
                    "{}() got multiple values for keyword argument '{}'",
                    fname, key
                )));
            }
            kwdict.insert(k, v)?;
        } else {
            return Err(Error::Type(format!(
                "{}() got an unexpected keyword argument '{}'",
                fname, key
            )));
        }
    }

    // Defaults cover the trailing parameters; Mandatory marks a
    // keyword-only parameter the caller must supply.
    let dstart = nparams - f.defaults.len();
    for i in 0..nparams {
        if locals[i].is_some() {
            continue;
        }
        let pname = &fc.locals[i].name;
        if i >= dstart {
            match &f.defaults[i - dstart] {
                Value::Mandatory => {
                    return Err(Error::Type(format!(
                        "{}() missing required keyword-only argument '{}'",
                        fname, pname
                    )));
                }
                d => locals[i] = Some(d.clone()),
            }
        } else if i < npos_params {
            return Err(Error::Type(format!(
                "{}() missing required positional argument '{}'",
                fname, pname
            )));
        } else {
            return Err(Error::Type(format!(
                "{}() missing required keyword-only argument '{}'",
                fname, pname
            )));
        }
    }

    let mut slot = nparams;
    if fc.has_varargs {
        locals[slot] = Some(Value::tuple(varargs));
        slot += 1;
    }
    if fc.has_kwargs {
        locals[slot] = Some(Value::Dict(Rc::new(kwdict)));
    }

    // Promote cell locals so closures can share them.
    for &ci in &fc.cells {
        let inner = locals[ci as usize].take();
        locals[ci as usize] = Some(Value::Cell(Rc::new(CellData::new(inner))));
    }

    Ok(locals)
}

// ---------------------------------------------------------------------------
// The interpreter
// ---------------------------------------------------------------------------

/// A pending control transfer recorded while `defer`/`catch` blocks run.
///
/// `from` is the pc of the instruction that began the unwind; eligibility is
/// always computed against it.
struct Pending {
    from: u32,
    action: Action,
}

enum Action {
    Jump(u32),
    Return(Value),
    Throw(Error),
}

enum Flow {
    Next,
    Return(Value),
}

struct Interp<'a> {
    f: &'a Function,
    fc: &'a Funcode,
    locals: Vec<Option<Value>>,
    stack: Vec<Value>,
    /// Open iterators. Dropped (= released) with the interpreter on every
    /// exit path, including unwinding.
    iters: SmallVec<[ValueIterator; 2]>,
    /// The deferred-action stack.
    pending: SmallVec<[Pending; 2]>,
    pc: u32,
    /// Set by RUNDEFER, consumed by the next control-transfer opcode.
    run_defer: bool,
    /// The error visible inside a `catch` body; cleared at CATCHJMP.
    caught: Option<Error>,
}

impl<'a> Interp<'a> {
    fn run(&mut self, thread: &mut Thread) -> Result<Value> {
        let mut in_flight: Option<Error> = None;
        let mut fault_pc: u32 = 0;

        loop {
            if let Some(err) = in_flight.take() {
                match self.catch_lookup(err, fault_pc) {
                    Ok(()) => continue,
                    Err(err) => {
                        if let Some(fr) = thread.frames.last_mut() {
                            fr.pc = fault_pc;
                        }
                        return Err(err);
                    }
                }
            }

            thread.steps += 1;
            if thread.max_steps != 0 && thread.steps >= thread.max_steps {
                if let Some(mut hook) = thread.on_max_steps.take() {
                    let r = hook(thread);
                    if thread.on_max_steps.is_none() {
                        thread.on_max_steps = Some(hook);
                    }
                    if let Err(e) = r {
                        fault_pc = self.pc;
                        in_flight = Some(e);
                        continue;
                    }
                } else {
                    thread.cancel("too many steps");
                }
            }
            if let Some(reason) = thread.cancelled() {
                fault_pc = self.pc;
                in_flight = Some(Error::Cancelled(reason.to_string()));
                continue;
            }

            // Falling off the end of the code is an implicit `return None`.
            if self.pc as usize >= self.fc.code.len() {
                return Ok(Value::None);
            }

            let frompc = self.pc;
            let (op, arg, next) = match opcode::decode(&self.fc.code, self.pc as usize) {
                Ok(t) => t,
                Err(e) => {
                    fault_pc = frompc;
                    in_flight = Some(e);
                    continue;
                }
            };

            let armed = std::mem::take(&mut self.run_defer);
            if armed
                && !matches!(
                    op,
                    Opcode::Jmp | Opcode::Cjmp | Opcode::IterJmp | Opcode::Return
                )
            {
                fault_pc = frompc;
                in_flight = Some(Error::Internal(format!(
                    "rundefer not followed by a control transfer (found {} at pc {})",
                    op.mnemonic(),
                    frompc
                )));
                continue;
            }

            // Advance before dispatch; jumps overwrite.
            self.pc = next as u32;

            match self.exec_op(thread, op, arg, frompc, armed) {
                Ok(Flow::Next) => {}
                Ok(Flow::Return(v)) => return Ok(v),
                Err(e) => {
                    fault_pc = frompc;
                    in_flight = Some(e);
                }
            }
        }
    }

    fn exec_op(
        &mut self,
        thread: &mut Thread,
        op: Opcode,
        arg: u32,
        frompc: u32,
        armed: bool,
    ) -> Result<Flow> {
        use Opcode::*;
        match op {
            Nop => {}
            Dup => {
                let v = self.peek()?.clone();
                self.push(v)?;
            }
            Dup2 => {
                let n = self.stack.len();
                if n < 2 {
                    return Err(Error::Internal("operand stack underflow".to_string()));
                }
                let x = self.stack[n - 2].clone();
                let y = self.stack[n - 1].clone();
                self.push(x)?;
                self.push(y)?;
            }
            Pop => {
                self.pop()?;
            }
            Exch => {
                let n = self.stack.len();
                if n < 2 {
                    return Err(Error::Internal("operand stack underflow".to_string()));
                }
                self.stack.swap(n - 2, n - 1);
            }

            Eql | Neq | Gt | Lt | Le | Ge => {
                let y = self.pop()?;
                let x = self.pop()?;
                let b = operators::compare(op, &x, &y)?;
                self.push(Value::Bool(b))?;
            }

            Plus | Minus | Star | Slash | SlashSlash | Percent | Amp | Pipe | Circumflex
            | LtLt | GtGt | In => {
                let y = self.pop()?;
                let x = self.pop()?;
                self.push(operators::binary(op, x, y)?)?;
            }

            UPlus | UMinus | Tilde | Not => {
                let x = self.pop()?;
                self.push(operators::unary(op, x)?)?;
            }

            InplaceAdd => {
                let y = self.pop()?;
                let x = self.pop()?;
                self.push(operators::inplace_add(x, y)?)?;
            }
            InplacePipe => {
                let y = self.pop()?;
                let x = self.pop()?;
                self.push(operators::inplace_pipe(x, y)?)?;
            }

            None => self.push(Value::None)?,
            True => self.push(Value::Bool(true))?,
            False => self.push(Value::Bool(false))?,
            Mandatory => self.push(Value::Mandatory)?,
            MakeDict => self.push(Value::dict())?,

            Opcode::Constant => {
                let v = constant_value(self.f.program.constant(arg)?);
                self.push(v)?;
            }

            // --- Control flow ---
            Jmp => {
                if armed {
                    if let Some(d) = self.next_defer(frompc, Some(arg), Option::None) {
                        self.push_pending(frompc, Action::Jump(arg));
                        self.pc = d.start_pc;
                        return Ok(Flow::Next);
                    }
                }
                self.pc = arg;
            }
            Cjmp => {
                let cond = self.pop()?;
                if cond.truth() {
                    if armed {
                        if let Some(d) = self.next_defer(frompc, Some(arg), Option::None) {
                            self.push_pending(frompc, Action::Jump(arg));
                            self.pc = d.start_pc;
                            return Ok(Flow::Next);
                        }
                    }
                    self.pc = arg;
                }
            }
            Return => {
                let v = self.pop()?;
                if armed {
                    if let Some(d) = self.next_defer(frompc, Option::None, Option::None) {
                        self.push_pending(frompc, Action::Return(v));
                        self.pc = d.start_pc;
                        return Ok(Flow::Next);
                    }
                }
                return Ok(Flow::Return(v));
            }

            // --- Iteration ---
            IterPush => {
                let x = self.pop()?;
                let it = x.iterate()?;
                self.iters.push(it);
            }
            IterJmp => {
                let next = match self.iters.last_mut() {
                    Some(it) => it.next(),
                    Option::None => {
                        return Err(Error::Internal("iterjmp with no open iterator".to_string()));
                    }
                };
                match next {
                    Some(v) => self.push(v)?,
                    Option::None => {
                        if armed {
                            if let Some(d) = self.next_defer(frompc, Some(arg), Option::None) {
                                self.push_pending(frompc, Action::Jump(arg));
                                self.pc = d.start_pc;
                                return Ok(Flow::Next);
                            }
                        }
                        self.pc = arg;
                    }
                }
            }
            IterPop => {
                if self.iters.pop().is_none() {
                    return Err(Error::Internal("iterpop with no open iterator".to_string()));
                }
            }

            // --- Deferred execution ---
            RunDefer => {
                self.run_defer = true;
            }
            DeferExit => return self.defer_exit(frompc),
            CatchJmp => {
                self.caught = Option::None;
                let to = if arg == 0 { Option::None } else { Some(arg) };
                if let Some(d) = self.next_defer(frompc, to, Option::None) {
                    let action = if arg == 0 {
                        Action::Return(Value::None)
                    } else {
                        Action::Jump(arg)
                    };
                    self.push_pending(frompc, action);
                    self.pc = d.start_pc;
                } else if arg == 0 {
                    return Ok(Flow::Return(Value::None));
                } else {
                    self.pc = arg;
                }
            }

            // --- Composite builders ---
            MakeTuple => {
                let items = self.pop_n(arg as usize)?;
                self.push(Value::tuple(items))?;
            }
            MakeList => {
                let items = self.pop_n(arg as usize)?;
                self.push(Value::list(items))?;
            }
            SetDict => {
                let v = self.pop()?;
                let k = self.pop()?;
                let d = self.pop()?;
                match &d {
                    Value::Dict(data) => {
                        data.check_mutable("insert into")?;
                        data.insert(k, v)?;
                    }
                    other => {
                        return Err(Error::Type(format!(
                            "{} value does not support item assignment",
                            other.type_name()
                        )));
                    }
                }
            }
            SetDictUniq => {
                let v = self.pop()?;
                let k = self.pop()?;
                let d = self.pop()?;
                match &d {
                    Value::Dict(data) => {
                        data.check_mutable("insert into")?;
                        if data.get(&k).is_some() {
                            return Err(Error::Value(format!(
                                "duplicate key: {} in dict literal",
                                k.repr()
                            )));
                        }
                        data.insert(k, v)?;
                    }
                    other => {
                        return Err(Error::Type(format!(
                            "{} value does not support item assignment",
                            other.type_name()
                        )));
                    }
                }
            }
            Append => {
                let v = self.pop()?;
                let l = self.pop()?;
                match &l {
                    Value::List(data) => {
                        data.check_mutable("append to")?;
                        data.items.borrow_mut().push(v);
                    }
                    other => {
                        return Err(Error::Type(format!(
                            "cannot append to {} value",
                            other.type_name()
                        )));
                    }
                }
            }
            Slice => {
                let step = self.pop()?;
                let hi = self.pop()?;
                let lo = self.pop()?;
                let x = self.pop()?;
                self.push(slice::apply(&x, &lo, &hi, &step)?)?;
            }
            Unpack => {
                let want = arg as usize;
                let x = self.pop()?;
                let mut it = x.iterate()?;
                let mut vals = Vec::with_capacity(want);
                while let Some(v) = it.next() {
                    vals.push(v);
                }
                it.done();
                if vals.len() > want {
                    return Err(Error::Value(format!(
                        "too many values to unpack (got {}, want {})",
                        vals.len(),
                        want
                    )));
                }
                if vals.len() < want {
                    return Err(Error::Value(format!(
                        "not enough values to unpack (got {}, want {})",
                        vals.len(),
                        want
                    )));
                }
                for v in vals.into_iter().rev() {
                    self.push(v)?;
                }
            }

            // --- Attribute / index ---
            Attr => {
                let name = self.f.program.name(arg)?;
                let x = self.pop()?;
                return Err(Error::Type(format!(
                    "{} value has no .{} field or method",
                    x.type_name(),
                    name
                )));
            }
            SetField => {
                let name = self.f.program.name(arg)?;
                let _y = self.pop()?;
                let x = self.pop()?;
                return Err(Error::Type(format!(
                    "can't assign to .{} field of {}",
                    name,
                    x.type_name()
                )));
            }
            Index => {
                let y = self.pop()?;
                let x = self.pop()?;
                self.push(getindex(&x, &y)?)?;
            }
            SetIndex => {
                let z = self.pop()?;
                let y = self.pop()?;
                let x = self.pop()?;
                setindex(&x, y, z)?;
            }

            // --- Name access ---
            Local => {
                let v = self
                    .local_slot(arg)?
                    .clone()
                    .ok_or_else(|| self.unassigned_local(arg))?;
                self.push(v)?;
            }
            SetLocal => {
                let v = self.pop()?;
                *self.local_slot_mut(arg)? = Some(v);
            }
            LocalCell => {
                let v = match self.local_slot(arg)? {
                    Some(Value::Cell(c)) => c.get(),
                    _ => {
                        return Err(Error::Internal(format!(
                            "local {} is not a cell",
                            arg
                        )));
                    }
                };
                let v = v.ok_or_else(|| self.unassigned_local(arg))?;
                self.push(v)?;
            }
            SetLocalCell => {
                let v = self.pop()?;
                match self.local_slot(arg)? {
                    Some(Value::Cell(c)) => c.set(v)?,
                    _ => {
                        return Err(Error::Internal(format!(
                            "local {} is not a cell",
                            arg
                        )));
                    }
                }
            }
            Free => {
                let v = self
                    .f
                    .freevars
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("freevar index {} out of range", arg)))?;
                self.push(v)?;
            }
            FreeCell => {
                let cell = match self.f.freevars.get(arg as usize) {
                    Some(Value::Cell(c)) => c.clone(),
                    Some(_) => {
                        return Err(Error::Internal(format!("freevar {} is not a cell", arg)));
                    }
                    Option::None => {
                        return Err(Error::Internal(format!(
                            "freevar index {} out of range",
                            arg
                        )));
                    }
                };
                let v = cell.get().ok_or_else(|| {
                    let name = self
                        .fc
                        .freevars
                        .get(arg as usize)
                        .map(|b| b.name.as_str())
                        .unwrap_or("?");
                    Error::Name(format!(
                        "free variable {} referenced before assignment",
                        name
                    ))
                })?;
                self.push(v)?;
            }
            Global => {
                let slot = self
                    .f
                    .module
                    .globals
                    .borrow()
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("global index {} out of range", arg)))?;
                let v = slot.ok_or_else(|| {
                    let name = self
                        .f
                        .program
                        .globals
                        .get(arg as usize)
                        .map(|b| b.name.as_str())
                        .unwrap_or("?");
                    Error::Name(format!(
                        "global variable {} referenced before assignment",
                        name
                    ))
                })?;
                self.push(v)?;
            }
            SetGlobal => {
                let v = self.pop()?;
                let mut globals = self.f.module.globals.borrow_mut();
                let slot = globals
                    .get_mut(arg as usize)
                    .ok_or_else(|| Error::Internal(format!("global index {} out of range", arg)))?;
                *slot = Some(v);
            }
            Predeclared => {
                let name = self.f.program.name(arg)?;
                let v = self
                    .f
                    .module
                    .predeclared
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Name(format!("predeclared name {} not defined", name)))?;
                self.push(v)?;
            }
            Universal => {
                let name = self.f.program.name(arg)?;
                let v = builtins::universal(name)
                    .ok_or_else(|| Error::Name(format!("universal name {} not defined", name)))?;
                self.push(v)?;
            }

            Load => self.op_load(thread, arg)?,
            MakeFunc => self.op_makefunc(arg)?,

            Call | CallVar | CallKw | CallVarKw => {
                let kwargs_operand = if matches!(op, CallKw | CallVarKw) {
                    Some(self.pop()?)
                } else {
                    Option::None
                };
                let args_operand = if matches!(op, CallVar | CallVarKw) {
                    Some(self.pop()?)
                } else {
                    Option::None
                };

                let nkv = (arg & 0xff) as usize;
                let npos = (arg >> 8) as usize;
                let mut kwpairs = Vec::with_capacity(nkv);
                for _ in 0..nkv {
                    let v = self.pop()?;
                    let k = self.pop()?;
                    kwpairs.push((k, v));
                }
                kwpairs.reverse();
                let mut pos = self.pop_n(npos)?;
                let callee = self.pop()?;

                if let Some(av) = args_operand {
                    let mut it = av.iterate().map_err(|_| {
                        Error::Type(format!(
                            "argument after * must be iterable, not {}",
                            av.type_name()
                        ))
                    })?;
                    while let Some(v) = it.next() {
                        pos.push(v);
                    }
                    it.done();
                }
                if let Some(kv) = kwargs_operand {
                    match &kv {
                        Value::Dict(d) => {
                            for (k, v) in d.entries.borrow().iter() {
                                if k.as_str().is_none() {
                                    return Err(Error::Type(
                                        "keywords must be strings".to_string(),
                                    ));
                                }
                                kwpairs.push((k.clone(), v.clone()));
                            }
                        }
                        other => {
                            return Err(Error::Type(format!(
                                "argument after ** must be a dict, not {}",
                                other.type_name()
                            )));
                        }
                    }
                }

                if let Some(fr) = thread.frames.last_mut() {
                    fr.pc = frompc;
                }
                let result = call(thread, &callee, pos, kwpairs)?;
                self.push(result)?;
            }
        }
        Ok(Flow::Next)
    }

    // -----------------------------------------------------------------------
    // Defer/catch runtime
    // -----------------------------------------------------------------------

    /// Route an in-flight error: run eligible defers, then enter the
    /// innermost matching catch, or hand the error back to the caller.
    fn catch_lookup(&mut self, err: Error, fault_pc: u32) -> Result<()> {
        if err.uncatchable() {
            return Err(err);
        }
        let handler = self.find_catch(fault_pc);
        let to = handler.map(|c| c.start_pc);
        if let Some(d) = self.next_defer(fault_pc, to, None) {
            self.push_pending(fault_pc, Action::Throw(err));
            self.pc = d.start_pc;
            return Ok(());
        }
        match handler {
            Some(c) => {
                self.caught = Some(err);
                self.pc = c.start_pc;
                Ok(())
            }
            None => Err(err),
        }
    }

    /// Exit a `defer` body: enter the next eligible block, or perform the
    /// pending action.
    fn defer_exit(&mut self, frompc: u32) -> Result<Flow> {
        let below = self.block_start(frompc).ok_or_else(|| {
            Error::Internal(format!("deferexit at pc {} outside a deferred block", frompc))
        })?;
        let (from, to) = match self.pending.last() {
            Some(p) => (
                p.from,
                match &p.action {
                    Action::Jump(a) => Some(*a),
                    Action::Return(_) => None,
                    Action::Throw(_) => self.find_catch(p.from).map(|c| c.start_pc),
                },
            ),
            None => {
                return Err(Error::Internal(
                    "deferexit with no pending action".to_string(),
                ));
            }
        };

        if let Some(d) = self.next_defer(from, to, Some(below)) {
            self.pc = d.start_pc;
            return Ok(Flow::Next);
        }

        let p = match self.pending.pop() {
            Some(p) => p,
            None => {
                return Err(Error::Internal(
                    "deferexit with no pending action".to_string(),
                ));
            }
        };
        match p.action {
            Action::Jump(a) => {
                self.pc = a;
                Ok(Flow::Next)
            }
            Action::Return(v) => Ok(Flow::Return(v)),
            Action::Throw(err) => match self.find_catch(p.from) {
                Some(c) => {
                    self.caught = Some(err);
                    self.pc = c.start_pc;
                    Ok(Flow::Next)
                }
                None => Err(err),
            },
        }
    }

    /// The eligible descriptor with the greatest start pc: it covers `from`,
    /// does not cover `to` (`None` = outside the function, covered by
    /// nothing), and, when `below` is given, starts before that pc. Ties go
    /// to declaration order.
    fn next_defer(&self, from: u32, to: Option<u32>, below: Option<u32>) -> Option<DeferDesc> {
        let mut best: Option<DeferDesc> = None;
        for d in &self.fc.defers {
            if !d.covers(from) {
                continue;
            }
            if let Some(t) = to {
                if d.covers(t) {
                    continue;
                }
            }
            if let Some(b) = below {
                if d.start_pc >= b {
                    continue;
                }
            }
            if best.map_or(true, |bd| d.start_pc > bd.start_pc) {
                best = Some(*d);
            }
        }
        best
    }

    /// The innermost catch descriptor covering `pc`: highest index first.
    fn find_catch(&self, pc: u32) -> Option<DeferDesc> {
        self.fc.catches.iter().rev().find(|c| c.covers(pc)).copied()
    }

    /// The start pc of the deferred block containing `pc`: the greatest
    /// descriptor start at or before it.
    fn block_start(&self, pc: u32) -> Option<u32> {
        self.fc
            .defers
            .iter()
            .chain(self.fc.catches.iter())
            .map(|d| d.start_pc)
            .filter(|&s| s <= pc)
            .max()
    }

    fn push_pending(&mut self, from: u32, action: Action) {
        // Re-entering the subsystem with the same jump target must not grow
        // the stack.
        let dup = matches!(
            (&action, self.pending.last().map(|p| &p.action)),
            (Action::Jump(a), Some(Action::Jump(b))) if a == b
        );
        if !dup {
            self.pending.push(Pending { from, action });
        }
    }

    // -----------------------------------------------------------------------
    // Composite opcode bodies
    // -----------------------------------------------------------------------

    fn op_load(&mut self, thread: &mut Thread, arg: u32) -> Result<()> {
        let module = match self.pop()? {
            Value::Str(s) => s.to_string(),
            other => {
                return Err(Error::Type(format!(
                    "load: module name must be a string, not {}",
                    other.type_name()
                )));
            }
        };
        let n = arg as usize;
        let mut names = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pop()? {
                Value::Str(s) => names.push(s.to_string()),
                other => {
                    return Err(Error::Type(format!(
                        "load: name must be a string, not {}",
                        other.type_name()
                    )));
                }
            }
        }
        names.reverse();

        let mut hook = thread
            .load
            .take()
            .ok_or_else(|| Error::Load("load not implemented by this application".to_string()))?;
        let result = hook(thread, &module);
        if thread.load.is_none() {
            thread.load = Some(hook);
        }
        let exports =
            result.map_err(|e| Error::Load(format!("cannot load {}: {}", module, e)))?;
        log::debug!("loaded module {} ({} names)", module, exports.len());

        for name in &names {
            match exports.get(name) {
                Some(v) => self.push(v.clone())?,
                None => {
                    let suggestion = exports
                        .keys()
                        .map(|k| (strsim::levenshtein(name, k), k))
                        .min()
                        .filter(|(d, _)| *d <= 2)
                        .map(|(_, k)| format!(" (did you mean {}?)", k))
                        .unwrap_or_default();
                    return Err(Error::Load(format!(
                        "load: name {} not found in module {}{}",
                        name, module, suggestion
                    )));
                }
            }
        }
        Ok(())
    }

    fn op_makefunc(&mut self, arg: u32) -> Result<()> {
        let fcode = self.f.program.funcode(arg)?;
        let t = match self.pop()? {
            Value::Tuple(t) => t,
            other => {
                return Err(Error::Internal(format!(
                    "makefunc: expected tuple, got {}",
                    other.type_name()
                )));
            }
        };
        let nfree = fcode.freevars.len();
        if t.len() < nfree {
            return Err(Error::Internal(format!(
                "makefunc: tuple of {} too short for {} freevars",
                t.len(),
                nfree
            )));
        }
        let split = t.len() - nfree;
        let defaults = t[..split].to_vec();
        let freevars = t[split..].to_vec();
        for v in &freevars {
            if !matches!(v, Value::Cell(_)) {
                return Err(Error::Internal(
                    "makefunc: captured freevar is not a cell".to_string(),
                ));
            }
        }
        let func = Function::new(
            self.f.program.clone(),
            arg as usize,
            self.f.module.clone(),
            defaults,
            freevars,
        );
        self.push(Value::Function(Rc::new(func)))
    }

    // -----------------------------------------------------------------------
    // Stack and slot helpers
    // -----------------------------------------------------------------------

    fn push(&mut self, v: Value) -> Result<()> {
        if self.stack.len() >= self.fc.max_stack as usize {
            return Err(Error::Internal(format!(
                "operand stack overflow (max {})",
                self.fc.max_stack
            )));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Internal("operand stack underflow".to_string()))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if self.stack.len() < n {
            return Err(Error::Internal("operand stack underflow".to_string()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn peek(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| Error::Internal("operand stack underflow".to_string()))
    }

    fn local_slot(&self, i: u32) -> Result<&Option<Value>> {
        self.locals
            .get(i as usize)
            .ok_or_else(|| Error::Internal(format!("local index {} out of range", i)))
    }

    fn local_slot_mut(&mut self, i: u32) -> Result<&mut Option<Value>> {
        self.locals
            .get_mut(i as usize)
            .ok_or_else(|| Error::Internal(format!("local index {} out of range", i)))
    }

    fn unassigned_local(&self, i: u32) -> Error {
        let name = self
            .fc
            .locals
            .get(i as usize)
            .map(|b| b.name.as_str())
            .unwrap_or("?");
        Error::Name(format!(
            "local variable {} referenced before assignment",
            name
        ))
    }
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

fn getindex(x: &Value, y: &Value) -> Result<Value> {
    match x {
        Value::List(l) => {
            let items = l.items.borrow();
            let i = norm_index(y.as_index("list")?, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(t) => {
            let i = norm_index(y.as_index("tuple")?, t.len(), "tuple")?;
            Ok(t[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = norm_index(y.as_index("string")?, chars.len(), "string")?;
            Ok(Value::from(chars[i].to_string()))
        }
        Value::Bytes(b) => {
            let i = norm_index(y.as_index("bytes")?, b.len(), "bytes")?;
            Ok(Value::Int(b[i] as i64))
        }
        Value::Dict(d) => {
            y.hash()?;
            d.get(y)
                .ok_or_else(|| Error::Value(format!("key {} not in dict", y.repr())))
        }
        other => Err(Error::Type(format!(
            "{} value is not subscriptable",
            other.type_name()
        ))),
    }
}

fn setindex(x: &Value, y: Value, z: Value) -> Result<()> {
    match x {
        Value::List(l) => {
            l.check_mutable("assign to element of")?;
            let mut items = l.items.borrow_mut();
            let i = norm_index(y.as_index("list")?, items.len(), "list")?;
            items[i] = z;
            Ok(())
        }
        Value::Dict(d) => {
            d.check_mutable("insert into")?;
            d.insert(y, z)
        }
        other => Err(Error::Type(format!(
            "{} value does not support item assignment",
            other.type_name()
        ))),
    }
}

fn norm_index(i: i64, len: usize, what: &str) -> Result<usize> {
    let n = len as i64;
    let j = if i < 0 { i + n } else { i };
    if (0..n).contains(&j) {
        Ok(j as usize)
    } else {
        Err(Error::Value(format!(
            "{} index {} out of range (len {})",
            what, i, len
        )))
    }
}
