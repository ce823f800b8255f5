//! Runtime values.
//!
//! A [`Value`] is a tagged sum over the language's data types. Mutable
//! containers (list, dict, set) are reference-counted and carry two pieces
//! of guard state next to their payload: a `frozen` flag (deep, one-way
//! immutability) and an `itercount` (live iterators pin the container
//! against mutation). Cells are heap boxes shared between a closure and its
//! enclosing scope.
//!
//! The VM is the only module that drives mutation; everything here is the
//! data model plus the small operations every value supports: type name,
//! truthiness, freezing, hashing, stringification, and iteration.

use std::cell::{Cell, Ref, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use num_bigint::BigInt;

use crate::error::{Error, Result};
use crate::module::ModuleData;
use crate::program::{Funcode, Program};
use crate::thread::Thread;

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    /// Machine-sized integer. Arithmetic promotes to [`Value::BigInt`] on
    /// overflow; the `BigInt` variant never holds a value that fits `i64`.
    Int(i64),
    BigInt(Rc<BigInt>),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    /// Immutable ordered sequence.
    Tuple(Rc<[Value]>),
    List(Rc<ListData>),
    Dict(Rc<DictData>),
    Set(Rc<SetData>),
    Function(Rc<Function>),
    Builtin(Rc<Builtin>),
    /// Shared single-slot box implementing lexical capture. Only produced
    /// by the cell opcodes; never observed by user code.
    Cell(Rc<CellData>),
    /// Sentinel marking a keyword-only parameter without a default.
    Mandatory,
}

/// Payload of a list value.
pub struct ListData {
    frozen: Cell<bool>,
    itercount: Cell<u32>,
    pub(crate) items: RefCell<Vec<Value>>,
}

/// Payload of a dict value: insertion-ordered key/value pairs.
///
/// Lookup is by equality scan, which keeps insertion order for free and is
/// fast at the sizes scripts build; keys are checked for hashability on
/// insert so the contract matches a hashed implementation.
pub struct DictData {
    frozen: Cell<bool>,
    itercount: Cell<u32>,
    pub(crate) entries: RefCell<Vec<(Value, Value)>>,
}

/// Payload of a set value: insertion-ordered distinct elements.
pub struct SetData {
    frozen: Cell<bool>,
    itercount: Cell<u32>,
    pub(crate) items: RefCell<Vec<Value>>,
}

/// A shared mutable box holding at most one value.
///
/// `None` means the variable has not been assigned yet; reads through an
/// empty cell fail with a name error at the access site, which knows the
/// variable's name.
pub struct CellData {
    frozen: Cell<bool>,
    inner: RefCell<Option<Value>>,
}

/// A closure: a funcode plus its module, default parameter values, and
/// captured free-variable cells.
pub struct Function {
    pub(crate) program: Rc<Program>,
    pub(crate) fcode: usize,
    pub(crate) module: Rc<ModuleData>,
    pub(crate) defaults: Vec<Value>,
    /// One `Value::Cell` per funcode freevar.
    pub(crate) freevars: Vec<Value>,
    frozen: Cell<bool>,
}

impl Function {
    pub(crate) fn new(
        program: Rc<Program>,
        fcode: usize,
        module: Rc<ModuleData>,
        defaults: Vec<Value>,
        freevars: Vec<Value>,
    ) -> Self {
        Self {
            program,
            fcode,
            module,
            defaults,
            freevars,
            frozen: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.program.functions[self.fcode].name
    }

    pub(crate) fn funcode(&self) -> &Funcode {
        &self.program.functions[self.fcode]
    }
}

/// The signature of a native function.
pub type NativeFn = dyn Fn(&mut Thread, Vec<Value>, Vec<(Value, Value)>) -> Result<Value>;

/// A function implemented by the host.
pub struct Builtin {
    pub name: String,
    pub(crate) func: Box<NativeFn>,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl Value {
    /// A new mutable list.
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(ListData::new(items)))
    }

    /// A new tuple.
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(items.into())
    }

    /// A new empty dict.
    pub fn dict() -> Value {
        Value::Dict(Rc::new(DictData::new()))
    }

    /// A new dict from pairs; fails if a key is unhashable. Later pairs
    /// overwrite earlier ones with an equal key.
    pub fn dict_from(pairs: Vec<(Value, Value)>) -> Result<Value> {
        let d = DictData::new();
        for (k, v) in pairs {
            d.insert(k, v)?;
        }
        Ok(Value::Dict(Rc::new(d)))
    }

    /// A new set from elements; fails if an element is unhashable.
    pub fn set_from(items: Vec<Value>) -> Result<Value> {
        let s = SetData::new();
        for v in items {
            s.insert(v)?;
        }
        Ok(Value::Set(Rc::new(s)))
    }

    /// A new bytes value.
    pub fn bytes(b: Vec<u8>) -> Value {
        Value::Bytes(b.into())
    }

    /// A new builtin function value.
    pub fn builtin<F>(name: impl Into<String>, f: F) -> Value
    where
        F: Fn(&mut Thread, Vec<Value>, Vec<(Value, Value)>) -> Result<Value> + 'static,
    {
        Value::Builtin(Rc::new(Builtin {
            name: name.into(),
            func: Box::new(f),
        }))
    }

    /// An int, normalized to the machine-sized variant when it fits.
    pub fn int_from_big(b: BigInt) -> Value {
        match i64::try_from(&b) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::BigInt(Rc::new(b)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Core operations
// ---------------------------------------------------------------------------

impl Value {
    /// The language-level type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Cell(_) => "cell",
            Value::Mandatory => "mandatory",
        }
    }

    /// Truthiness.
    pub fn truth(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::BigInt(_) => true, // never holds zero: it would fit i64
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::List(l) => !l.items.borrow().is_empty(),
            Value::Dict(d) => !d.entries.borrow().is_empty(),
            Value::Set(s) => !s.items.borrow().is_empty(),
            Value::Function(_) | Value::Builtin(_) | Value::Cell(_) | Value::Mandatory => true,
        }
    }

    /// Deep-freeze this value and everything reachable from it.
    ///
    /// Idempotent; the frozen flag is set before descending, so cyclic
    /// structures terminate.
    pub fn freeze(&self) {
        match self {
            Value::Tuple(t) => {
                for v in t.iter() {
                    v.freeze();
                }
            }
            Value::List(l) => {
                if !l.frozen.replace(true) {
                    for v in l.items.borrow().iter() {
                        v.freeze();
                    }
                }
            }
            Value::Dict(d) => {
                if !d.frozen.replace(true) {
                    for (k, v) in d.entries.borrow().iter() {
                        k.freeze();
                        v.freeze();
                    }
                }
            }
            Value::Set(s) => {
                if !s.frozen.replace(true) {
                    for v in s.items.borrow().iter() {
                        v.freeze();
                    }
                }
            }
            Value::Cell(c) => {
                if !c.frozen.replace(true) {
                    if let Some(v) = &*c.inner.borrow() {
                        v.freeze();
                    }
                }
            }
            Value::Function(f) => {
                if !f.frozen.replace(true) {
                    for v in &f.defaults {
                        v.freeze();
                    }
                    for v in &f.freevars {
                        v.freeze();
                    }
                }
            }
            _ => {}
        }
    }

    /// A stable hash, or a type error for unhashable values.
    pub fn hash(&self) -> Result<u64> {
        let mut h = DefaultHasher::new();
        self.write_hash(&mut h)?;
        Ok(h.finish())
    }

    fn write_hash(&self, h: &mut DefaultHasher) -> Result<()> {
        match self {
            Value::None => 0u8.hash(h),
            Value::Bool(b) => {
                1u8.hash(h);
                b.hash(h);
            }
            Value::Int(i) => {
                2u8.hash(h);
                i.hash(h);
            }
            Value::BigInt(b) => {
                3u8.hash(h);
                b.to_signed_bytes_le().hash(h);
            }
            Value::Float(f) => {
                // Integral floats hash like the equal int, so 1 and 1.0
                // agree with equality.
                if f.is_finite() && f.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(f) {
                    2u8.hash(h);
                    (*f as i64).hash(h);
                } else {
                    4u8.hash(h);
                    f.to_bits().hash(h);
                }
            }
            Value::Str(s) => {
                5u8.hash(h);
                s.hash(h);
            }
            Value::Bytes(b) => {
                6u8.hash(h);
                b.hash(h);
            }
            Value::Tuple(t) => {
                7u8.hash(h);
                for v in t.iter() {
                    v.write_hash(h)?;
                }
            }
            Value::List(_) | Value::Dict(_) | Value::Set(_) => {
                return Err(Error::Type(format!(
                    "unhashable type: {}",
                    self.type_name()
                )));
            }
            Value::Function(_) | Value::Builtin(_) | Value::Cell(_) | Value::Mandatory => {
                return Err(Error::Type(format!(
                    "unhashable type: {}",
                    self.type_name()
                )));
            }
        }
        Ok(())
    }

    /// Whether [`Value::hash`] would succeed.
    pub fn is_hashable(&self) -> bool {
        self.hash().is_ok()
    }

    /// The machine integer this value holds, if it is an in-range int.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::BigInt(_) => None, // never in i64 range by construction
            _ => None,
        }
    }

    /// Convert to `i32`, rejecting non-ints and out-of-range ints.
    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Value::Int(i) => i32::try_from(*i)
                .map_err(|_| Error::Value(format!("{} out of range for int32", i))),
            Value::BigInt(b) => Err(Error::Value(format!("{} out of range for int32", b))),
            _ => Err(Error::Type(format!("got {}, want int", self.type_name()))),
        }
    }

    /// An index-sized integer, for subscripts and slice bounds.
    pub(crate) fn as_index(&self, what: &str) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::BigInt(b) => Err(Error::Value(format!("{} index {} out of range", what, b))),
            _ => Err(Error::Type(format!(
                "{} index must be int, got {}",
                what,
                self.type_name()
            ))),
        }
    }

    /// The borrowed string payload, for values that are strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// The quoted, source-like form.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, &mut Vec::new());
        out
    }

    fn write_repr(&self, out: &mut String, seen: &mut Vec<*const ()>) {
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::BigInt(b) => out.push_str(&b.to_string()),
            Value::Float(f) => out.push_str(&format!("{:?}", f)),
            Value::Str(s) => out.push_str(&quote_string(s)),
            Value::Bytes(b) => {
                out.push('b');
                out.push_str(&quote_bytes(b));
            }
            Value::Tuple(t) => {
                out.push('(');
                for (i, v) in t.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    v.write_repr(out, seen);
                }
                if t.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::List(l) => {
                let ptr = Rc::as_ptr(l) as *const ();
                if seen.contains(&ptr) {
                    out.push_str("[...]");
                    return;
                }
                seen.push(ptr);
                out.push('[');
                for (i, v) in l.items.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    v.write_repr(out, seen);
                }
                out.push(']');
                seen.pop();
            }
            Value::Dict(d) => {
                let ptr = Rc::as_ptr(d) as *const ();
                if seen.contains(&ptr) {
                    out.push_str("{...}");
                    return;
                }
                seen.push(ptr);
                out.push('{');
                for (i, (k, v)) in d.entries.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.write_repr(out, seen);
                    out.push_str(": ");
                    v.write_repr(out, seen);
                }
                out.push('}');
                seen.pop();
            }
            Value::Set(s) => {
                let ptr = Rc::as_ptr(s) as *const ();
                if seen.contains(&ptr) {
                    out.push_str("set([...])");
                    return;
                }
                seen.push(ptr);
                out.push_str("set([");
                for (i, v) in s.items.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    v.write_repr(out, seen);
                }
                out.push_str("])");
                seen.pop();
            }
            Value::Function(f) => out.push_str(&format!("<function {}>", f.name())),
            Value::Builtin(b) => out.push_str(&format!("<built-in function {}>", b.name)),
            Value::Cell(_) => out.push_str("<cell>"),
            Value::Mandatory => out.push_str("<mandatory>"),
        }
    }

    /// Open an iterator, or fail with a type error for non-iterables.
    ///
    /// The iterator pins the container: mutating operations fail until it is
    /// dropped (the `done` release).
    pub fn iterate(&self) -> Result<ValueIterator> {
        let source = match self {
            Value::List(l) => {
                l.itercount.set(l.itercount.get() + 1);
                IterSource::List(l.clone())
            }
            Value::Tuple(t) => IterSource::Tuple(t.clone()),
            Value::Dict(d) => {
                d.itercount.set(d.itercount.get() + 1);
                IterSource::Dict(d.clone())
            }
            Value::Set(s) => {
                s.itercount.set(s.itercount.get() + 1);
                IterSource::Set(s.clone())
            }
            _ => {
                return Err(Error::Type(format!(
                    "{} value is not iterable",
                    self.type_name()
                )));
            }
        };
        Ok(ValueIterator { source, index: 0 })
    }

    /// Snapshot the elements of an iterable without pinning it. Dicts yield
    /// their keys.
    pub(crate) fn collect_iterable(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(l) => Some(l.items.borrow().clone()),
            Value::Tuple(t) => Some(t.to_vec()),
            Value::Dict(d) => Some(d.entries.borrow().iter().map(|(k, _)| k.clone()).collect()),
            Value::Set(s) => Some(s.items.borrow().clone()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Equality
// ---------------------------------------------------------------------------

/// Numeric equality across the int/bigint/float classes; `None` when either
/// side is not numeric.
pub(crate) fn num_eq(a: &Value, b: &Value) -> Option<bool> {
    use Value::{Float, Int};
    Some(match (a, b) {
        (Int(x), Int(y)) => x == y,
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        // A normalized BigInt is out of i64 range, so it never equals an Int.
        (Int(_), Value::BigInt(_)) | (Value::BigInt(_), Int(_)) => false,
        (Float(x), Float(y)) => x == y,
        (Int(x), Float(y)) | (Float(y), Int(x)) => (*x as f64) == *y,
        (Value::BigInt(x), Float(y)) | (Float(y), Value::BigInt(x)) => big_to_f64(x) == *y,
        _ => return None,
    })
}

/// Approximate a big integer as a float (saturating to ±inf).
pub(crate) fn big_to_f64(b: &BigInt) -> f64 {
    b.to_string().parse().unwrap_or(0.0)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::{Bool, Bytes, Dict, List, Set, Str, Tuple};
        if let Some(eq) = num_eq(self, other) {
            return eq;
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Bool(a), Bool(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Tuple(a), Tuple(b)) => a == b,
            (List(a), List(b)) => {
                Rc::ptr_eq(a, b) || *a.items.borrow() == *b.items.borrow()
            }
            (Dict(a), Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let ae = a.entries.borrow();
                let be = b.entries.borrow();
                ae.len() == be.len()
                    && ae
                        .iter()
                        .all(|(k, v)| be.iter().any(|(k2, v2)| k == k2 && v == v2))
            }
            (Set(a), Set(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let ai = a.items.borrow();
                let bi = b.items.borrow();
                ai.len() == bi.len() && ai.iter().all(|v| bi.contains(v))
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => Rc::ptr_eq(a, b),
            (Value::Mandatory, Value::Mandatory) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    /// The `str()` form: like `repr` but strings print unquoted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            other => f.write_str(&other.repr()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

impl ListData {
    pub(crate) fn new(items: Vec<Value>) -> Self {
        Self {
            frozen: Cell::new(false),
            itercount: Cell::new(0),
            items: RefCell::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn items(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    /// Fail unless the list may be mutated right now.
    pub(crate) fn check_mutable(&self, verb: &str) -> Result<()> {
        check_mutable(self.frozen.get(), self.itercount.get(), verb, "list")
    }
}

impl DictData {
    pub(crate) fn new() -> Self {
        Self {
            frozen: Cell::new(false),
            itercount: Cell::new(0),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or overwrite, without the mutability check (used while the
    /// dict is still private to its builder).
    pub(crate) fn insert(&self, key: Value, value: Value) -> Result<()> {
        key.hash()?;
        let mut entries = self.entries.borrow_mut();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            entries.push((key, value));
        }
        Ok(())
    }

    pub(crate) fn check_mutable(&self, verb: &str) -> Result<()> {
        check_mutable(self.frozen.get(), self.itercount.get(), verb, "dict")
    }
}

impl SetData {
    pub(crate) fn new() -> Self {
        Self {
            frozen: Cell::new(false),
            itercount: Cell::new(0),
            items: RefCell::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, v: &Value) -> bool {
        self.items.borrow().contains(v)
    }

    pub(crate) fn insert(&self, v: Value) -> Result<()> {
        v.hash()?;
        let mut items = self.items.borrow_mut();
        if !items.contains(&v) {
            items.push(v);
        }
        Ok(())
    }

    pub(crate) fn check_mutable(&self, verb: &str) -> Result<()> {
        check_mutable(self.frozen.get(), self.itercount.get(), verb, "set")
    }
}

fn check_mutable(frozen: bool, itercount: u32, verb: &str, kind: &str) -> Result<()> {
    if frozen {
        return Err(Error::Mutation(format!("cannot {} frozen {}", verb, kind)));
    }
    if itercount > 0 {
        return Err(Error::Mutation(format!(
            "cannot {} {} during iteration",
            verb, kind
        )));
    }
    Ok(())
}

impl CellData {
    pub(crate) fn new(v: Option<Value>) -> Self {
        Self {
            frozen: Cell::new(false),
            inner: RefCell::new(v),
        }
    }

    pub(crate) fn get(&self) -> Option<Value> {
        self.inner.borrow().clone()
    }

    pub(crate) fn set(&self, v: Value) -> Result<()> {
        if self.frozen.get() {
            return Err(Error::Mutation(
                "cannot assign to frozen variable".to_string(),
            ));
        }
        *self.inner.borrow_mut() = Some(v);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

enum IterSource {
    List(Rc<ListData>),
    Tuple(Rc<[Value]>),
    Dict(Rc<DictData>),
    Set(Rc<SetData>),
}

/// A live iterator over a container.
///
/// Single-pass and not restartable. Dropping the iterator is its `done`
/// release: it unpins the container. The interpreter keeps its iterators in
/// a frame-owned stack, so every exit path — return, error, unwinding —
/// releases them.
pub struct ValueIterator {
    source: IterSource,
    index: usize,
}

impl ValueIterator {
    /// The next element, or `None` when exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Value> {
        let v = match &self.source {
            IterSource::List(l) => l.items.borrow().get(self.index).cloned(),
            IterSource::Tuple(t) => t.get(self.index).cloned(),
            IterSource::Dict(d) => d.entries.borrow().get(self.index).map(|(k, _)| k.clone()),
            IterSource::Set(s) => s.items.borrow().get(self.index).cloned(),
        };
        if v.is_some() {
            self.index += 1;
        }
        v
    }

    /// Release the iterator. Equivalent to dropping it.
    pub fn done(self) {}
}

impl Drop for ValueIterator {
    fn drop(&mut self) {
        match &self.source {
            IterSource::List(l) => l.itercount.set(l.itercount.get() - 1),
            IterSource::Dict(d) => d.itercount.set(d.itercount.get() - 1),
            IterSource::Set(s) => s.itercount.set(s.itercount.get() - 1),
            IterSource::Tuple(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Quoting
// ---------------------------------------------------------------------------

/// Double-quote a string with standard escapes. The assembler's string
/// syntax parses exactly this form.
pub(crate) fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\x7f' => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Double-quote a byte string; non-printable and non-ASCII bytes use `\xNN`.
pub(crate) fn quote_bytes(b: &[u8]) -> String {
    let mut out = String::with_capacity(b.len() + 2);
    out.push('"');
    for &c in b {
        match c {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(c as char),
            c => out.push_str(&format!("\\x{:02x}", c)),
        }
    }
    out.push('"');
    out
}
