use foldhash::{HashMap, HashMapExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::arith;

/// Scalar storage layout of a variable, an input or a native argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueLayout {
    Int32,
    Float,
    Double,
    Int32Ptr,
    FloatPtr,
    DoublePtr,
}

impl ValueLayout {
    pub fn is_pointer(self) -> bool {
        matches!(
            self,
            ValueLayout::Int32Ptr | ValueLayout::FloatPtr | ValueLayout::DoublePtr
        )
    }

    /// Layout of the pointee for pointer layouts, `self` otherwise.
    pub fn base(self) -> ValueLayout {
        match self {
            ValueLayout::Int32Ptr => ValueLayout::Int32,
            ValueLayout::FloatPtr => ValueLayout::Float,
            ValueLayout::DoublePtr => ValueLayout::Double,
            other => other,
        }
    }

    /// True when values of this layout travel in floating-point registers.
    pub(crate) fn is_float_class(self) -> bool {
        matches!(self, ValueLayout::Float | ValueLayout::Double)
    }
}

pub type Fn0 = extern "C" fn() -> f64;
pub type Fn1 = extern "C" fn(f64) -> f64;
pub type Fn2 = extern "C" fn(f64, f64) -> f64;
pub type Fn3 = extern "C" fn(f64, f64, f64) -> f64;
pub type Fn4 = extern "C" fn(f64, f64, f64, f64) -> f64;
pub type Fn5 = extern "C" fn(f64, f64, f64, f64, f64) -> f64;

/// A native callback. The arity is carried by the variant.
#[derive(Clone, Copy, Debug)]
pub enum NativeFn {
    F0(Fn0),
    F1(Fn1),
    F2(Fn2),
    F3(Fn3),
    F4(Fn4),
    F5(Fn5),
}

impl NativeFn {
    pub fn arity(&self) -> usize {
        match self {
            NativeFn::F0(_) => 0,
            NativeFn::F1(_) => 1,
            NativeFn::F2(_) => 2,
            NativeFn::F3(_) => 3,
            NativeFn::F4(_) => 4,
            NativeFn::F5(_) => 5,
        }
    }

    pub(crate) fn addr(&self) -> usize {
        match *self {
            NativeFn::F0(f) => f as usize,
            NativeFn::F1(f) => f as usize,
            NativeFn::F2(f) => f as usize,
            NativeFn::F3(f) => f as usize,
            NativeFn::F4(f) => f as usize,
            NativeFn::F5(f) => f as usize,
        }
    }

    /// Calls the function with `args`, which must hold exactly `arity()` values.
    pub(crate) fn call(&self, args: &[f64]) -> f64 {
        match (*self, args) {
            (NativeFn::F0(f), []) => f(),
            (NativeFn::F1(f), [a]) => f(*a),
            (NativeFn::F2(f), [a, b]) => f(*a, *b),
            (NativeFn::F3(f), [a, b, c]) => f(*a, *b, *c),
            (NativeFn::F4(f), [a, b, c, d]) => f(*a, *b, *c, *d),
            (NativeFn::F5(f), [a, b, c, d, e]) => f(*a, *b, *c, *d, *e),
            _ => f64::NAN,
        }
    }
}

impl PartialEq for NativeFn {
    fn eq(&self, other: &Self) -> bool {
        self.arity() == other.arity() && self.addr() == other.addr()
    }
}

/// Built-in functions known to the optimizer and the differentiator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FuncSymbol {
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Cot,
    Sec,
    Csc,
    Sqrt,
}

impl FuncSymbol {
    pub const ALL: [FuncSymbol; 9] = [
        FuncSymbol::Exp,
        FuncSymbol::Ln,
        FuncSymbol::Sin,
        FuncSymbol::Cos,
        FuncSymbol::Tan,
        FuncSymbol::Cot,
        FuncSymbol::Sec,
        FuncSymbol::Csc,
        FuncSymbol::Sqrt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FuncSymbol::Exp => "exp",
            FuncSymbol::Ln => "ln",
            FuncSymbol::Sin => "sin",
            FuncSymbol::Cos => "cos",
            FuncSymbol::Tan => "tan",
            FuncSymbol::Cot => "cot",
            FuncSymbol::Sec => "sec",
            FuncSymbol::Csc => "csc",
            FuncSymbol::Sqrt => "sqrt",
        }
    }

    pub(crate) fn id(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_id(id: u8) -> Option<FuncSymbol> {
        FuncSymbol::ALL.get(id as usize).copied()
    }
}

#[derive(Debug)]
enum VarCell {
    Int32(AtomicI32),
    Float(AtomicU32),
    Double(AtomicU64),
}

/// A shared scalar cell with a stable address that compiled code reads and
/// assigns through.
///
/// Clones share the same storage. The address stays valid for as long as any
/// clone is alive; compiled artifacts keep a clone of every variable they
/// reference.
#[derive(Clone, Debug)]
pub struct Variable {
    cell: Arc<VarCell>,
}

impl Variable {
    pub fn int32(v: i32) -> Self {
        Self {
            cell: Arc::new(VarCell::Int32(AtomicI32::new(v))),
        }
    }

    pub fn float(v: f32) -> Self {
        Self {
            cell: Arc::new(VarCell::Float(AtomicU32::new(v.to_bits()))),
        }
    }

    pub fn double(v: f64) -> Self {
        Self {
            cell: Arc::new(VarCell::Double(AtomicU64::new(v.to_bits()))),
        }
    }

    pub fn layout(&self) -> ValueLayout {
        match &*self.cell {
            VarCell::Int32(_) => ValueLayout::Int32,
            VarCell::Float(_) => ValueLayout::Float,
            VarCell::Double(_) => ValueLayout::Double,
        }
    }

    pub fn get(&self) -> f64 {
        match &*self.cell {
            VarCell::Int32(a) => a.load(Ordering::Relaxed) as f64,
            VarCell::Float(a) => f32::from_bits(a.load(Ordering::Relaxed)) as f64,
            VarCell::Double(a) => f64::from_bits(a.load(Ordering::Relaxed)),
        }
    }

    /// Stores `v` converted to the variable's layout.
    pub fn set(&self, v: f64) {
        match &*self.cell {
            VarCell::Int32(a) => a.store(arith::to_int32(v), Ordering::Relaxed),
            VarCell::Float(a) => a.store((v as f32).to_bits(), Ordering::Relaxed),
            VarCell::Double(a) => a.store(v.to_bits(), Ordering::Relaxed),
        }
    }

    pub fn ptr_eq(&self, other: &Variable) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn addr(&self) -> usize {
        match &*self.cell {
            VarCell::Int32(a) => a.as_ptr() as usize,
            VarCell::Float(a) => a.as_ptr() as usize,
            VarCell::Double(a) => a.as_ptr() as usize,
        }
    }
}

/// One name binding.
#[derive(Clone, Debug)]
pub enum SymbolEntry {
    Constant(f64),
    Variable(Variable),
    /// Positional input slot.
    Input(u16),
    Function(NativeFn),
    FuncSymbol(FuncSymbol),
}

/// Name to binding dictionary consulted by the lexer.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    entries: HashMap<String, SymbolEntry>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// A table holding only the built-in functions.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        for sym in FuncSymbol::ALL {
            entries.insert(sym.name().to_string(), SymbolEntry::FuncSymbol(sym));
        }
        Self { entries }
    }

    pub fn define_const(&mut self, name: &str, value: f64) -> &mut Self {
        self.entries
            .insert(name.to_string(), SymbolEntry::Constant(value));
        self
    }

    pub fn define_var(&mut self, name: &str, var: &Variable) -> &mut Self {
        self.entries
            .insert(name.to_string(), SymbolEntry::Variable(var.clone()));
        self
    }

    pub fn define_input(&mut self, name: &str, index: u16) -> &mut Self {
        self.entries
            .insert(name.to_string(), SymbolEntry::Input(index));
        self
    }

    pub fn define_func(&mut self, name: &str, f: NativeFn) -> &mut Self {
        self.entries
            .insert(name.to_string(), SymbolEntry::Function(f));
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<SymbolEntry> {
        self.entries.remove(name)
    }

    pub fn find(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.get(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn input_name(&self, index: u16) -> Option<&str> {
        self.entries.iter().find_map(|(k, e)| match e {
            SymbolEntry::Input(i) if *i == index => Some(k.as_str()),
            _ => None,
        })
    }

    pub(crate) fn var_name(&self, var: &Variable) -> Option<&str> {
        self.entries.iter().find_map(|(k, e)| match e {
            SymbolEntry::Variable(v) if v.ptr_eq(var) => Some(k.as_str()),
            _ => None,
        })
    }

    pub(crate) fn func_name(&self, f: &NativeFn) -> Option<&str> {
        self.entries.iter().find_map(|(k, e)| match e {
            SymbolEntry::Function(g) if g == f => Some(k.as_str()),
            _ => None,
        })
    }
}
