//! Runtime support for generated programs.
//!
//! Compiled compilation units emit `use pika_core::rt::*;` and nothing
//! else: everything a generated program touches is re-exported or defined
//! here.  Compiled functions return `Step` — either a finished value or a
//! pending tail call — and `drive` loops pending calls so tail recursion
//! runs in constant stack, mirroring the interpreter's tail-call loop.

use std::sync::{Arc, Mutex};

pub use crate::error::{ErrorKind, LispError, LispResult};
pub use crate::eval::{FunctionRef, Machine};
pub use crate::value::{NativeFn, Value};

pub type RtResult = Result<Value, LispError>;
pub type StepResult = Result<Step, LispError>;

/// The trampoline step: a computed value, or a pending tail call holding
/// the target and its arguments.
pub enum Step {
    Done(Value),
    Tail(Value, Vec<Value>),
}

/// The runtime handle generated programs embed: an interpreter machine
/// (globals, primitives, macros, dynamic bindings) plus nothing else.
pub struct Rt {
    pub m: Machine,
}

impl Default for Rt {
    fn default() -> Self {
        Self::new()
    }
}

impl Rt {
    pub fn new() -> Rt {
        Rt { m: Machine::new() }
    }

    pub fn with_output(out: Box<dyn std::io::Write>) -> Rt {
        Rt {
            m: Machine::with_output(out),
        }
    }
}

/// Finish a trampoline: apply pending calls until a plain value appears.
pub fn drive(m: &mut Machine, mut step: Step) -> RtResult {
    loop {
        match step {
            Step::Done(v) => return Ok(v),
            Step::Tail(target, args) => match target {
                Value::Native(native) => step = (native.f)(m, args)?,
                other => return m.apply_values(other, args),
            },
        }
    }
}

/// Invoke a function value from a non-tail call site.
pub fn funcall(m: &mut Machine, f: Value, args: Vec<Value>) -> RtResult {
    match f {
        Value::Native(ref native) => {
            let step = (native.f)(m, args)?;
            drive(m, step)
        }
        other => m.apply_values(other, args),
    }
}

/// Call a primitive through the registry, bypassing the environment
/// (the open-coded shape; `speed >= 1`).
pub fn call_prim(m: &mut Machine, name: &str, args: Vec<Value>) -> RtResult {
    let p = crate::builtins::lookup_prim(name)
        .ok_or_else(|| LispError::internal(format!("unknown primitive '{}'", name)))?;
    crate::builtins::check_arity(p, args.len())?;
    (p.f)(m, args)
}

pub fn done(v: Value) -> StepResult {
    Ok(Step::Done(v))
}

pub fn tail(f: Value, args: Vec<Value>) -> StepResult {
    Ok(Step::Tail(f, args))
}

/// Wrap a Rust closure as a Lisp function value.
pub fn native(
    name: impl Into<String>,
    f: impl Fn(&mut Machine, Vec<Value>) -> StepResult + 'static,
) -> Value {
    Value::Native(Arc::new(NativeFn {
        name: name.into(),
        f: Box::new(f),
    }))
}

// ---------------------------------------------------------------------------
// Local binding cells
// ---------------------------------------------------------------------------

/// Compiled local bindings live in shared cells so inner lambdas observe
/// `setq` on captured locals, exactly like interpreted closures sharing
/// environment conses.
pub type LocalCell = Arc<Mutex<Value>>;

pub fn new_cell(v: Value) -> LocalCell {
    Arc::new(Mutex::new(v))
}

pub fn cell_get(cell: &LocalCell, name: &str) -> RtResult {
    let v = cell.lock().expect("poisoned").clone();
    if matches!(v, Value::Unassigned) {
        Err(LispError::unassigned(name))
    } else {
        Ok(v)
    }
}

pub fn cell_set(cell: &LocalCell, v: Value) -> Value {
    *cell.lock().expect("poisoned") = v.clone();
    v
}

pub fn unassigned() -> Value {
    Value::Unassigned
}

// ---------------------------------------------------------------------------
// Value construction and access helpers
// ---------------------------------------------------------------------------

pub fn truthy(v: &Value) -> bool {
    v.is_truthy()
}

pub fn long(n: i64) -> Value {
    Value::Long(n)
}

pub fn dbl(d: f64) -> Value {
    Value::Double(d)
}

pub fn chr(c: char) -> Value {
    Value::Char(c)
}

pub fn strv(s: &str) -> Value {
    Value::string(s)
}

pub fn sym(m: &mut Machine, name: &str) -> Value {
    Value::Symbol(m.st.intern(name))
}

pub fn list_v(items: Vec<Value>) -> Value {
    Value::list(items)
}

pub fn cons_v(car: Value, cdr: Value) -> Value {
    Value::cons(car, cdr)
}

/// Argument-count check for compiled lambdas.  `max` of `None` means a
/// rest parameter absorbs the overflow.
pub fn expect_args(
    name: &str,
    args: &[Value],
    min: usize,
    max: Option<usize>,
) -> Result<(), LispError> {
    if args.len() < min || max.is_some_and(|max| args.len() > max) {
        Err(LispError::arity(name, args.len()))
    } else {
        Ok(())
    }
}

pub fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Nil)
}

/// The rest of the argument vector as a list view.
pub fn rest_args(args: &[Value], from: usize) -> Value {
    Value::slice(Arc::new(args[from.min(args.len())..].to_vec()), 0)
}

/// The whole argument vector as a list (symbol-parameter lambdas).
pub fn all_args(args: &[Value]) -> Value {
    Value::list(args.to_vec())
}

/// Spread an argument list value into a vector (`apply` call sites).
pub fn spread(v: &Value) -> Result<Vec<Value>, LispError> {
    crate::value::list_to_vec(v).ok_or_else(|| LispError::type_error("proper list", v))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_drives_pending_calls() {
        let mut rt = Rt::with_output(Box::new(Vec::new()));
        rt.m.define_global(
            "countdown",
            native("countdown", |m, args| {
                let n = args[0].as_long().expect("long");
                if n <= 0 {
                    done(Value::Long(0))
                } else {
                    let target = m.global_value("countdown")?;
                    tail(target, vec![Value::Long(n - 1)])
                }
            }),
        );
        let f = rt.m.global_value("countdown").unwrap();
        // Deep enough to smash the stack if the trampoline recursed.
        let v = funcall(&mut rt.m, f, vec![Value::Long(200_000)]).unwrap();
        assert_eq!(v.as_long(), Some(0));
    }

    #[test]
    fn interpreter_drives_native_functions() {
        let mut rt = Rt::with_output(Box::new(Vec::new()));
        rt.m.define_global(
            "plus-one",
            native("plus-one", |_m, args| {
                let n = args[0].as_long().expect("long");
                done(Value::Long(n + 1))
            }),
        );
        let v = rt.m.interpret_expression("(plus-one 41)").unwrap();
        assert_eq!(v.as_long(), Some(42));
    }

    #[test]
    fn cells_share_mutation() {
        let cell = new_cell(Value::Long(1));
        let alias = cell.clone();
        cell_set(&cell, Value::Long(2));
        assert_eq!(cell_get(&alias, "x").unwrap().as_long(), Some(2));
        let empty = new_cell(unassigned());
        assert!(cell_get(&empty, "y").is_err());
    }

    #[test]
    fn call_prim_matches_general_path() {
        let mut rt = Rt::with_output(Box::new(Vec::new()));
        let direct = call_prim(&mut rt.m, "+", vec![Value::Long(1), Value::Long(2)]).unwrap();
        let general = rt.m.interpret_expression("(+ 1 2)").unwrap();
        assert_eq!(direct.as_f64(), general.as_f64());
        assert!(call_prim(&mut rt.m, "car", vec![]).is_err());
    }

    #[test]
    fn arg_helpers() {
        let args = vec![Value::Long(1), Value::Long(2), Value::Long(3)];
        assert_eq!(arg(&args, 0).as_long(), Some(1));
        assert!(arg(&args, 9).is_nil());
        let rest = rest_args(&args, 1);
        assert_eq!(crate::value::list_length(&rest), Some(2));
        assert!(rest_args(&args, 3).is_nil());
        assert_eq!(crate::value::list_length(&all_args(&args)), Some(3));
    }
}
