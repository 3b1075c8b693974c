//! Association-list environments.
//!
//! An environment is an ordinary Lisp list of `(symbol . value)` conses.
//! Lookup walks the spine comparing symbol identity; extension conses a new
//! binding onto the front, so closures that captured the old head are
//! unaffected.  The global environment additionally supports front
//! insertion that preserves the identity of the header cons, so closures
//! that captured the global environment observe later `define`s.

use std::sync::{Arc, Mutex};

use crate::error::{LispError, LispResult};
use crate::symbol::Symbol;
use crate::value::{ConsCell, Value};

/// A binding cell: the `(symbol . value)` cons.
pub type BindingCell = Arc<Mutex<ConsCell>>;

/// Find the binding cell for `sym`, innermost first.
pub fn lookup(env: &Value, sym: &Symbol) -> Option<BindingCell> {
    let mut cursor = env.clone();
    while let Value::Cons(cell) = cursor {
        let next = {
            let pair = cell.lock().expect("poisoned");
            if let Value::Cons(binding) = &pair.car {
                let entry = binding.lock().expect("poisoned");
                if let Value::Symbol(bound) = &entry.car {
                    if bound == sym {
                        drop(entry);
                        return Some(binding.clone());
                    }
                }
            }
            pair.cdr.clone()
        };
        cursor = next;
    }
    None
}

/// Look up and return the bound value, rejecting the unassigned sentinel.
pub fn lookup_value(env: &Value, sym: &Symbol) -> LispResult {
    match lookup(env, sym) {
        Some(cell) => {
            let value = cell.lock().expect("poisoned").cdr.clone();
            if matches!(value, Value::Unassigned) {
                Err(LispError::unassigned(sym.name()))
            } else {
                Ok(value)
            }
        }
        None => Err(LispError::unbound(sym.name())),
    }
}

/// Extend `env` with a new binding, returning the new head.  The binding
/// cell is also returned so callers can patch it (letrec, named let).
pub fn extend(env: Value, sym: Symbol, value: Value) -> (Value, BindingCell) {
    let binding = Value::cons(Value::Symbol(sym), value);
    let cell = binding.as_cons().expect("fresh cons").clone();
    (Value::cons(binding, env), cell)
}

/// The value stored in a binding cell.
pub fn cell_value(cell: &BindingCell) -> Value {
    cell.lock().expect("poisoned").cdr.clone()
}

/// Mutate a binding cell in place (`setq`, dynamic rebinding).
pub fn set_cell(cell: &BindingCell, value: Value) {
    cell.lock().expect("poisoned").cdr = value;
}

/// The global environment.  Never empty: construction installs a first
/// binding so the header cons exists for the lifetime of the machine.
pub struct GlobalEnv {
    head: Value,
}

impl GlobalEnv {
    /// Create the global environment with an initial binding.
    pub fn new(sym: Symbol, value: Value) -> GlobalEnv {
        let binding = Value::cons(Value::Symbol(sym), value);
        GlobalEnv {
            head: Value::cons(binding, Value::Nil),
        }
    }

    /// The environment as a value (what closures capture).
    pub fn as_value(&self) -> Value {
        self.head.clone()
    }

    pub fn lookup(&self, sym: &Symbol) -> Option<BindingCell> {
        lookup(&self.head, sym)
    }

    /// Insert a new binding at the front while keeping the header cons
    /// identity: the old first element is pushed down one position and the
    /// new binding takes its place, so every captured reference to the
    /// environment sees the new binding.
    pub fn insert(&mut self, sym: Symbol, value: Value) -> BindingCell {
        let binding = Value::cons(Value::Symbol(sym), value);
        let cell = binding.as_cons().expect("fresh cons").clone();
        let header = self.head.as_cons().expect("global env header").clone();
        let mut pair = header.lock().expect("poisoned");
        let old_first = std::mem::replace(&mut pair.car, binding);
        let old_rest = std::mem::replace(&mut pair.cdr, Value::Nil);
        pair.cdr = Value::cons(old_first, old_rest);
        cell
    }

    /// `define` semantics: mutate an existing binding or front-insert.
    pub fn define(&mut self, sym: Symbol, value: Value) {
        match self.lookup(&sym) {
            Some(cell) => set_cell(&cell, value),
            None => {
                self.insert(sym, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    #[test]
    fn lookup_finds_innermost_binding() {
        let mut st = SymbolTable::new();
        let x = st.intern("x");
        let (env, _) = extend(Value::Nil, x.clone(), Value::Long(1));
        let (env, _) = extend(env, x.clone(), Value::Long(2));
        let cell = lookup(&env, &x).unwrap();
        assert_eq!(cell_value(&cell).as_long(), Some(2));
    }

    #[test]
    fn lookup_misses_unbound() {
        let mut st = SymbolTable::new();
        let x = st.intern("x");
        let y = st.intern("y");
        let (env, _) = extend(Value::Nil, x, Value::Long(1));
        assert!(lookup(&env, &y).is_none());
        assert!(matches!(
            lookup_value(&env, &y),
            Err(e) if e.kind == crate::error::ErrorKind::Unbound
        ));
    }

    #[test]
    fn unassigned_sentinel_is_an_error() {
        let mut st = SymbolTable::new();
        let x = st.intern("x");
        let (env, _) = extend(Value::Nil, x.clone(), Value::Unassigned);
        assert!(lookup_value(&env, &x).is_err());
    }

    #[test]
    fn set_cell_mutates_in_place() {
        let mut st = SymbolTable::new();
        let x = st.intern("x");
        let (env, cell) = extend(Value::Nil, x.clone(), Value::Long(1));
        set_cell(&cell, Value::Long(5));
        assert_eq!(lookup_value(&env, &x).unwrap().as_long(), Some(5));
    }

    #[test]
    fn global_insert_preserves_header_identity() {
        let mut st = SymbolTable::new();
        let mut genv = GlobalEnv::new(st.intern("a"), Value::Long(1));
        // Capture the environment before the insert, as a closure would.
        let captured = genv.as_value();
        genv.define(st.intern("b"), Value::Long(2));
        let b = st.intern("b");
        let cell = lookup(&captured, &b).expect("captured env sees later define");
        assert_eq!(cell_value(&cell).as_long(), Some(2));
    }

    #[test]
    fn global_define_mutates_existing() {
        let mut st = SymbolTable::new();
        let a = st.intern("a");
        let mut genv = GlobalEnv::new(a.clone(), Value::Long(1));
        genv.define(a.clone(), Value::Long(9));
        let cell = genv.lookup(&a).unwrap();
        assert_eq!(cell_value(&cell).as_long(), Some(9));
        // Still exactly one binding for `a` (no duplicate shadow).
        let rest = crate::value::list_cdr(&genv.as_value());
        assert!(lookup(&rest, &a).is_none());
    }
}
