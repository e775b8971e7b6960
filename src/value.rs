//! Runtime value model: a tagged union over immediate values and
//! reference-counted heap cells.
//!
//! Heap-shared data (pairs, closures, continuations, capture cells) uses
//! `Rc`; mutation is confined to capture cells (`ValueCell`) and closure
//! capture arrays, both reached through `RefCell`. A captured variable is
//! represented on the value stack by a [`Value::Ref`] pointing at a cell
//! shared with every closure that captured the binding, so writes through
//! any holder are observed by all of them.
//!
//! Symbols are interner keys; resolving them back to text requires the
//! interner owned by the compiled program, which is why the external
//! representation functions take one as an argument.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;
use string_interner::{DefaultBackend, DefaultSymbol, StringInterner};

use crate::Error;
use crate::builtins::BuiltinOp;

/// Interner mapping symbol text to compact keys, owned by the program.
pub type Interner = StringInterner<DefaultBackend>;

/// Interned symbol key.
pub type SymbolId = DefaultSymbol;

/// Shared, interior-mutable cell backing a captured variable: the classic
/// Scheme "box". The originating stack slot and every capturing closure hold
/// the same cell.
pub type ValueCell = Rc<RefCell<Value>>;

/// One slot of a closure's capture array.
#[derive(Debug, Clone)]
pub enum Capture {
    /// Jointly owned capture cell
    Shared(ValueCell),
    /// Non-owning back-reference, used when a closure captures its own
    /// binding (`(define f (lambda () ... f ...))`). An owning slot would
    /// form an unreclaimable reference cycle through the capture array.
    SelfRef(Weak<RefCell<Value>>),
}

impl Capture {
    /// Get the underlying cell, failing if a self-referential capture has
    /// outlived its defining frame.
    pub fn cell(&self) -> Result<ValueCell, Error> {
        match self {
            Capture::Shared(cell) => Ok(cell.clone()),
            Capture::SelfRef(weak) => weak.upgrade().ok_or_else(|| {
                Error::EvalError("self-captured binding is no longer live".to_owned())
            }),
        }
    }
}

/// A closure: captured cells plus the bytecode offset of its body.
///
/// The capture array starts empty when the closure is materialized from a
/// lambda constant; `capture_*` instructions executed immediately afterwards
/// append the cells.
#[derive(Debug)]
pub struct Lambda {
    pub captures: SmallVec<[Capture; 4]>,
    pub code_offset: usize,
}

pub type LambdaRef = Rc<RefCell<Lambda>>;

/// An immutable cons cell.
#[derive(Debug)]
pub struct Pair {
    pub car: Value,
    pub cdr: Value,
}

/// Continuation arity: the number of values an expression is expected to
/// deliver to its continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coarity {
    /// Any number of values may result; all will be discarded
    Any,
    /// Exactly one value is required
    One,
}

/// Bookkeeping for one call on the VM's call-frame stack.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// The lambda executing in this frame; empty for builtin calls and for
    /// frames pushed by `push_frame_index` that have not been called yet
    pub executing_lambda: Option<LambdaRef>,
    /// Value-stack offset of the callee slot; arguments and locals sit at
    /// `frame_index + 1 + i`
    pub frame_index: usize,
    /// Formals plus locals added by `define`
    pub stack_var_count: u8,
    /// Bytecode offset to resume at after `ret`
    pub return_ip: usize,
    /// Caller's coarity, restored by `ret`
    pub return_coarity: Coarity,
}

/// Deep snapshot of the VM taken by `push_continuation`.
#[derive(Debug)]
pub struct Continuation {
    pub frozen_call_frames: Vec<CallFrame>,
    pub frozen_stack: Vec<Value>,
    pub frozen_coarity: Coarity,
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    EmptyList,
    Symbol(SymbolId),
    Builtin(&'static BuiltinOp),
    Lambda(LambdaRef),
    Continuation(Rc<Continuation>),
    Pair(Rc<Pair>),
    /// Indirect cell standing in a stack slot whose binding has been
    /// captured by a closure. Never stored inside heap values.
    Ref(ValueCell),
}

impl Value {
    /// Resolve a `Ref` slot to the value it currently holds; other values
    /// are returned as-is.
    pub fn dereferenced(&self) -> Value {
        match self {
            Value::Ref(cell) => cell.borrow().clone(),
            other => other.clone(),
        }
    }

    /// Only boolean false is falsy; every other value is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false))
    }

    /// Type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "boolean",
            Value::EmptyList => "empty-list",
            Value::Symbol(_) => "symbol",
            Value::Builtin(_) => "procedure",
            Value::Lambda(_) => "procedure",
            Value::Continuation(_) => "continuation",
            Value::Pair(_) => "pair",
            Value::Ref(_) => "reference",
        }
    }

    /// `eqv?` semantics: same variant and same value. Heap values compare by
    /// identity, interned symbols by key; values of different variants are
    /// never equivalent (so `(eqv? 1 1.0)` is false).
    pub fn eqv(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::EmptyList, Value::EmptyList) => true,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            (Value::Lambda(a), Value::Lambda(b)) => Rc::ptr_eq(a, b),
            (Value::Continuation(a), Value::Continuation(b)) => Rc::ptr_eq(a, b),
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Render the external representation: the textual form produced by
    /// `display`. Pairs print in list notation when the cdr chain terminates
    /// in the empty list, dotted notation otherwise.
    pub fn external_repr(&self, interner: &Interner) -> String {
        let mut out = String::new();
        self.write_external(interner, &mut out);
        out
    }

    fn write_external(&self, interner: &Interner, out: &mut String) {
        use fmt::Write;

        match self {
            Value::Int(n) => {
                let _ = write!(out, "{n}");
            }
            Value::Float(x) => {
                let _ = write!(out, "{x}");
            }
            Value::Bool(true) => out.push_str("#t"),
            Value::Bool(false) => out.push_str("#f"),
            Value::EmptyList => out.push_str("()"),
            Value::Symbol(id) => out.push_str(interner.resolve(*id).unwrap_or("#<symbol>")),
            Value::Builtin(op) => {
                let _ = write!(out, "#<builtin:{}>", op.name);
            }
            Value::Lambda(_) => out.push_str("#<lambda>"),
            Value::Continuation(_) => out.push_str("#<continuation>"),
            Value::Ref(cell) => cell.borrow().write_external(interner, out),
            Value::Pair(pair) => {
                out.push('(');
                pair.car.write_external(interner, out);

                let mut rest = pair.cdr.clone();
                loop {
                    match rest {
                        Value::EmptyList => break,
                        Value::Pair(next) => {
                            out.push(' ');
                            next.car.write_external(interner, out);
                            rest = next.cdr.clone();
                        }
                        other => {
                            out.push_str(" . ");
                            other.write_external(interner, out);
                            break;
                        }
                    }
                }
                out.push(')');
            }
        }
    }
}
