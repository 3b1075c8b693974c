//! The evaluator.
//!
//! `Machine` owns all interpreter state: the symbol table, the global
//! environment, the macro table, the module set, the trace set, and the
//! dynamic-binding unwind list.  `eval` is a single loop that rebinds
//! form/environment for every tail step (body tails, `if`/`cond` branches,
//! macro expansions, `apply`/`eval` rewrites, closure application), so tail
//! recursion runs in constant Rust stack.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use crate::builtins;
use crate::env::{self, BindingCell, GlobalEnv};
use crate::error::{LispError, LispResult};
use crate::print::print_value;
use crate::reader::{self, CharSource};
use crate::rt::Step;
use crate::symbol::{SpecialForm, Symbol, SymbolTable};
use crate::value::{list_car, list_cdr, list_to_vec, ConsCell, Value};

/// Nested (non-tail) evaluation depth guard.  Tail calls do not consume
/// depth; this only bounds argument-position recursion.
const MAX_DEPTH: usize = 1000;

pub struct Machine {
    pub st: SymbolTable,
    global: GlobalEnv,
    macros: HashMap<String, Value>,
    modules: HashSet<String>,
    traced: HashSet<String>,
    /// Dynamic-binding restore list: `(cell, previous value)`, restored in
    /// reverse order on every exit from the `eval` call that pushed them.
    unwind: Vec<(BindingCell, Value)>,
    gensym_counter: u64,
    /// Optimization level set by `declaim`; ≥ 1 enables open-coding.
    speed: u8,
    out: Box<dyn Write>,
    input: Option<Box<dyn CharSource>>,
    pending_char: Option<char>,
    start: Instant,
    /// Library directory consulted by `load`/`require` after the sibling
    /// directory.
    pub lib_dir: Option<PathBuf>,
    /// Directory of the file currently being loaded.
    pub current_dir: Option<PathBuf>,
    /// Constant pool installed by generated programs.
    pool: Vec<Value>,
    trace_depth: usize,
    depth: usize,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Machine {
        Machine::with_output(Box::new(std::io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Machine {
        let mut st = SymbolTable::new();
        let t = st.wk.t.clone();
        let global = GlobalEnv::new(t.clone(), Value::Symbol(t));
        let mut m = Machine {
            st,
            global,
            macros: HashMap::new(),
            modules: HashSet::new(),
            traced: HashSet::new(),
            unwind: Vec::new(),
            gensym_counter: 0,
            speed: 1,
            out,
            input: None,
            pending_char: None,
            start: Instant::now(),
            lib_dir: None,
            current_dir: None,
            pool: Vec::new(),
            trace_depth: 0,
            depth: 0,
        };
        builtins::install(&mut m);
        let itups = m.st.intern("internal-time-units-per-second");
        m.global.define(itups, Value::Double(1e9));
        let argv = m.st.intern("*command-line-argument-list*");
        m.global.define(argv, Value::Nil);
        m
    }

    // -----------------------------------------------------------------------
    // Embedding surface
    // -----------------------------------------------------------------------

    /// Read and evaluate every form in `source`; the last value wins.
    pub fn interpret_expression(&mut self, source: &str) -> LispResult {
        let forms = reader::read_all(source, &mut self.st)?;
        let mut last = Value::Nil;
        for form in &forms {
            last = self.eval_top(form)?;
        }
        Ok(last)
    }

    pub fn eval_top(&mut self, form: &Value) -> LispResult {
        let env = self.global.as_value();
        self.eval(form, &env)
    }

    /// Current value of a global binding (`getValue`).
    pub fn global_value(&self, name: &str) -> LispResult {
        let sym = self
            .st
            .intern_soft(name)
            .ok_or_else(|| LispError::unbound(name))?;
        match self.global.lookup(&sym) {
            Some(cell) => {
                let v = env::cell_value(&cell);
                if matches!(v, Value::Unassigned) {
                    Err(LispError::unassigned(name))
                } else {
                    Ok(v)
                }
            }
            None => Err(LispError::unbound(name)),
        }
    }

    /// A callable handle over a global function binding (`getFunction`).
    pub fn function_ref(&mut self, name: &str) -> Result<FunctionRef, LispError> {
        let target = self.global_value(name)?;
        if !target.is_function() {
            return Err(LispError::type_error("function", &target));
        }
        Ok(FunctionRef { target })
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        let sym = self.st.intern(name);
        self.global.define(sym, value);
    }

    /// `setq` semantics by name: the binding must already exist.
    pub fn set_global(&mut self, name: &str, value: Value) -> LispResult {
        let sym = self.st.intern(name);
        match self.global.lookup(&sym) {
            Some(cell) => {
                env::set_cell(&cell, value.clone());
                Ok(value)
            }
            None => Err(LispError::unbound(name)),
        }
    }

    pub fn set_command_line(&mut self, args: Vec<String>) {
        let list = Value::list(args.into_iter().map(Value::string).collect());
        self.define_global("*command-line-argument-list*", list);
    }

    pub fn global_env(&self) -> Value {
        self.global.as_value()
    }

    /// The canonical true value.
    pub fn t(&self) -> Value {
        Value::Symbol(self.st.wk.t.clone())
    }

    /// Encode a Rust boolean as `t`/`nil`.
    pub fn truth(&self, b: bool) -> Value {
        if b {
            self.t()
        } else {
            Value::Nil
        }
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: u8) {
        self.speed = speed;
    }

    /// Replace the input source used by the `read` primitive.
    pub fn set_input(&mut self, input: Box<dyn CharSource>) {
        self.input = Some(input);
        self.pending_char = None;
    }

    pub fn gensym(&mut self) -> Symbol {
        self.gensym_counter += 1;
        Symbol::uninterned(format!("g{}", self.gensym_counter))
    }

    pub fn macro_named(&self, name: &str) -> Option<Value> {
        self.macros.get(&name.to_lowercase()).cloned()
    }

    pub fn provide(&mut self, name: &str) {
        self.modules.insert(name.to_lowercase());
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains(&name.to_lowercase())
    }

    pub fn trace_symbols(&mut self, names: &[String], enable: bool) -> Value {
        for name in names {
            if enable {
                self.traced.insert(name.to_lowercase());
            } else {
                self.traced.remove(&name.to_lowercase());
            }
        }
        let mut traced: Vec<&String> = self.traced.iter().collect();
        traced.sort();
        Value::list(
            traced
                .into_iter()
                .map(|n| Value::Symbol(self.st.intern_soft(n).unwrap_or_else(|| Symbol::uninterned(n.clone()))))
                .collect(),
        )
    }

    pub fn write_out(&mut self, text: &str) -> Result<(), LispError> {
        self.out
            .write_all(text.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(|e| LispError::io(format!("cannot write output: {}", e)))
    }

    /// Read one form from the machine's input source (the `read` primitive).
    pub fn read_from_input(&mut self) -> LispResult {
        let Some(input) = self.input.as_mut() else {
            return Err(LispError::io("no input source"));
        };
        let mut reader = reader::Reader::new(input.as_mut(), &mut self.st);
        reader.set_pending(self.pending_char.take());
        let result = reader.read();
        self.pending_char = reader.take_pending();
        match result? {
            Some(form) => Ok(form),
            None => Err(LispError::io("end of input")),
        }
    }

    /// Monotonic nanoseconds since machine start (run/cpu time base).
    pub fn elapsed_nanos(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    // -- Constant pool (generated programs) ---------------------------------

    pub fn set_pool(&mut self, pool: Vec<Value>) {
        self.pool = pool;
    }

    pub fn pool(&self, index: usize) -> Value {
        self.pool.get(index).cloned().unwrap_or(Value::Nil)
    }

    // -- Dynamic binding plumbing (shared with generated code) --------------

    pub fn dynamic_base(&self) -> usize {
        self.unwind.len()
    }

    /// Rebind the global `name` in place, recording the previous value on
    /// the unwind list.
    pub fn dynamic_bind(&mut self, name: &str, value: Value) -> Result<(), LispError> {
        let sym = self.st.intern(name);
        self.dynamic_bind_sym(sym, value)
    }

    fn dynamic_bind_sym(&mut self, sym: Symbol, value: Value) -> Result<(), LispError> {
        if sym.is_reserved() {
            return Err(LispError::malformed(
                "let dynamic",
                format!("cannot bind reserved word '{}'", sym.name()),
            ));
        }
        let cell = match self.global.lookup(&sym) {
            Some(cell) => cell,
            None => self.global.insert(sym.clone(), Value::Unassigned),
        };
        let old = env::cell_value(&cell);
        self.unwind.push((cell.clone(), old));
        env::set_cell(&cell, value);
        Ok(())
    }

    /// Restore dynamic bindings down to `base`, newest first.
    pub fn dynamic_unwind(&mut self, base: usize) {
        while self.unwind.len() > base {
            let (cell, old) = self.unwind.pop().expect("unwind entry");
            env::set_cell(&cell, old);
        }
    }

    // -----------------------------------------------------------------------
    // Core evaluation
    // -----------------------------------------------------------------------

    pub fn eval(&mut self, form: &Value, env: &Value) -> LispResult {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(LispError::internal("evaluation too deeply nested"));
        }
        let unwind_base = self.unwind.len();
        let result = self.eval_loop(form.clone(), env.clone());
        self.dynamic_unwind(unwind_base);
        self.depth -= 1;
        result.map_err(|e| e.in_form(form))
    }

    fn eval_loop(&mut self, mut form: Value, mut env: Value) -> LispResult {
        // Operators entered by tail steps while tracing; unwound as a batch
        // of exit reports when the loop finally produces a value.
        let mut tail_trace: Vec<String> = Vec::new();

        let result = 'eval: loop {
            match form.clone() {
                Value::Nil => break Ok(Value::Nil),
                Value::Symbol(sym) => break env::lookup_value(&env, &sym),
                Value::Cons(_) => {
                    let op = list_car(&form);
                    let args_form = list_cdr(&form);

                    if let Value::Symbol(opsym) = &op {
                        if let Some(sf) = opsym.special_form() {
                            match self.special_form(sf, &args_form, &mut env)? {
                                Flow::Value(v) => break Ok(v),
                                Flow::Tail(next) => {
                                    form = next;
                                    continue 'eval;
                                }
                            }
                        }
                        if let Some(mac) = self.macro_named(opsym.name()) {
                            form = self.expand_macro(&mac, &args_form)?;
                            continue 'eval;
                        }
                    }

                    // Function application: evaluate operator and arguments.
                    let mut f = self.eval(&op, &env)?;
                    let mut argv = Vec::new();
                    let mut cursor = args_form;
                    while cursor.is_cons() {
                        argv.push(self.eval(&list_car(&cursor), &env)?);
                        cursor = list_cdr(&cursor);
                    }
                    if !cursor.is_nil() {
                        break Err(LispError::malformed(
                            "application",
                            "dotted argument list",
                        ));
                    }

                    let traced_name = op
                        .as_symbol()
                        .map(|s| s.name().to_lowercase())
                        .filter(|n| self.traced.contains(n));

                    'apply: loop {
                        match f.clone() {
                            Value::Prim(p) if p.name == "apply" => {
                                builtins::check_arity(p, argv.len())?;
                                let target = argv[0].clone();
                                let spread = list_to_vec(&argv[1]).ok_or_else(|| {
                                    LispError::type_error("proper list", &argv[1])
                                })?;
                                f = target;
                                argv = spread;
                                continue 'apply;
                            }
                            Value::Prim(p) if p.name == "eval" => {
                                builtins::check_arity(p, argv.len())?;
                                form = argv.remove(0);
                                env = self.global.as_value();
                                continue 'eval;
                            }
                            Value::Prim(p) => {
                                builtins::check_arity(p, argv.len())?;
                                if let Some(name) = &traced_name {
                                    self.trace_enter(name, &argv, tail_trace.len())?;
                                }
                                let result = if self.speed >= 1 {
                                    match builtins::open_code(self, p, &argv) {
                                        Some(r) => r,
                                        None => (p.f)(self, argv),
                                    }
                                } else {
                                    (p.f)(self, argv)
                                };
                                let value = result?;
                                if let Some(name) = &traced_name {
                                    self.trace_exit(name, &value, tail_trace.len())?;
                                }
                                break 'eval Ok(value);
                            }
                            Value::Native(native) => {
                                let mut step = (native.f)(self, argv)?;
                                let value = loop {
                                    match step {
                                        Step::Done(v) => break v,
                                        Step::Tail(target, args) => {
                                            step = self.native_step(target, args)?;
                                        }
                                    }
                                };
                                break 'eval Ok(value);
                            }
                            Value::Cons(cell) => {
                                let (captured, params_and_body, is_lambda) = {
                                    let pair = cell.lock().expect("poisoned");
                                    (
                                        pair.env.clone(),
                                        pair.cdr.clone(),
                                        matches!(&pair.car, Value::Symbol(s) if s == &self.st.wk.lambda),
                                    )
                                };
                                if captured.is_none() && !is_lambda {
                                    break 'eval Err(LispError::type_error("function", &f));
                                }
                                // Dynamic lambdas look up free variables in
                                // the caller's environment.
                                let base = captured.unwrap_or_else(|| env.clone());
                                let params = list_car(&params_and_body);
                                let body = list_cdr(&params_and_body);
                                let fname = op
                                    .as_symbol()
                                    .map(|s| s.name().to_string())
                                    .unwrap_or_else(|| "lambda".to_string());
                                if let Some(name) = &traced_name {
                                    self.trace_enter(name, &argv, tail_trace.len())?;
                                    tail_trace.push(name.clone());
                                }
                                env = self.bind_params(&params, argv, base, &fname)?;
                                match self.body_tail(&body, &env)? {
                                    Flow::Value(v) => break 'eval Ok(v),
                                    Flow::Tail(next) => {
                                        form = next;
                                        continue 'eval;
                                    }
                                }
                            }
                            other => {
                                break 'eval Err(LispError::type_error("function", &other))
                            }
                        }
                    }
                }
                other => break Ok(other),
            }
        };

        // Report deferred exits for traced operators entered via tail steps.
        if let Ok(value) = &result {
            let value = value.clone();
            while let Some(name) = tail_trace.pop() {
                self.trace_exit(&name, &value, tail_trace.len())?;
            }
        }
        result
    }

    /// Drive one pending tail call from generated code.
    fn native_step(&mut self, f: Value, args: Vec<Value>) -> Result<Step, LispError> {
        match f {
            Value::Native(native) => (native.f)(self, args),
            other => self.apply_values(other, args).map(Step::Done),
        }
    }

    /// Apply a function value to already-evaluated arguments, running to
    /// completion.  Used by `rt`, trace helpers, and embedding adapters.
    pub fn apply_values(&mut self, f: Value, args: Vec<Value>) -> LispResult {
        match f {
            Value::Prim(p) if p.name == "apply" => {
                builtins::check_arity(p, args.len())?;
                let mut args = args;
                let spread = list_to_vec(&args[1])
                    .ok_or_else(|| LispError::type_error("proper list", &args[1]))?;
                let target = args.remove(0);
                self.apply_values(target, spread)
            }
            Value::Prim(p) if p.name == "eval" => {
                builtins::check_arity(p, args.len())?;
                let env = self.global.as_value();
                self.eval(&args[0], &env)
            }
            Value::Prim(p) => {
                builtins::check_arity(p, args.len())?;
                (p.f)(self, args)
            }
            Value::Native(native) => {
                let mut step = (native.f)(self, args)?;
                loop {
                    match step {
                        Step::Done(v) => return Ok(v),
                        Step::Tail(target, targs) => step = self.native_step(target, targs)?,
                    }
                }
            }
            Value::Cons(ref cell) => {
                let (captured, params_and_body, is_lambda) = {
                    let pair = cell.lock().expect("poisoned");
                    (
                        pair.env.clone(),
                        pair.cdr.clone(),
                        matches!(&pair.car, Value::Symbol(s) if s == &self.st.wk.lambda),
                    )
                };
                if captured.is_none() && !is_lambda {
                    return Err(LispError::type_error("function", &f));
                }
                let base = captured.unwrap_or_else(|| self.global.as_value());
                let params = list_car(&params_and_body);
                let body = list_cdr(&params_and_body);
                let env = self.bind_params(&params, args, base, "lambda")?;
                let mut last = Value::Nil;
                let mut cursor = body;
                while cursor.is_cons() {
                    last = self.eval(&list_car(&cursor), &env)?;
                    cursor = list_cdr(&cursor);
                }
                Ok(last)
            }
            other => Err(LispError::type_error("function", &other)),
        }
    }

    // -----------------------------------------------------------------------
    // Special forms
    // -----------------------------------------------------------------------

    fn special_form(
        &mut self,
        sf: SpecialForm,
        args: &Value,
        env: &mut Value,
    ) -> Result<Flow, LispError> {
        match sf {
            SpecialForm::Quote => {
                let items = proper_args("quote", args)?;
                if items.len() != 1 {
                    return Err(LispError::arity("quote", items.len()));
                }
                Ok(Flow::Value(items.into_iter().next().expect("one arg")))
            }
            SpecialForm::Lambda => Ok(Flow::Value(self.make_lambda(args, env)?)),
            SpecialForm::If => {
                let items = proper_args("if", args)?;
                if items.len() < 2 || items.len() > 3 {
                    return Err(LispError::malformed("if", "expected (if test then [else])"));
                }
                let test = self.eval(&items[0], env)?;
                if test.is_truthy() {
                    Ok(Flow::Tail(items[1].clone()))
                } else if items.len() == 3 {
                    Ok(Flow::Tail(items[2].clone()))
                } else {
                    Ok(Flow::Value(Value::Nil))
                }
            }
            SpecialForm::Progn => self.body_tail(args, env),
            SpecialForm::Cond => {
                let mut cursor = args.clone();
                while cursor.is_cons() {
                    let clause = list_car(&cursor);
                    if !clause.is_cons() {
                        return Err(LispError::malformed("cond", "clause must be a list"));
                    }
                    let test = self.eval(&list_car(&clause), env)?;
                    if test.is_truthy() {
                        let body = list_cdr(&clause);
                        if body.is_nil() {
                            return Ok(Flow::Value(test));
                        }
                        return self.body_tail(&body, env);
                    }
                    cursor = list_cdr(&cursor);
                }
                Ok(Flow::Value(Value::Nil))
            }
            SpecialForm::Setq => {
                let items = proper_args("setq", args)?;
                if items.len() % 2 != 0 {
                    return Err(LispError::malformed("setq", "odd number of arguments"));
                }
                let mut last = Value::Nil;
                for pair in items.chunks(2) {
                    let sym = binding_symbol("setq", &pair[0])?;
                    let value = self.eval(&pair[1], env)?;
                    match env::lookup(env, &sym) {
                        Some(cell) => env::set_cell(&cell, value.clone()),
                        None => return Err(LispError::unbound(sym.name())),
                    }
                    last = value;
                }
                Ok(Flow::Value(last))
            }
            SpecialForm::Define => {
                let items = proper_args("define", args)?;
                if items.len() != 2 {
                    return Err(LispError::malformed("define", "expected (define symbol form)"));
                }
                let sym = binding_symbol("define", &items[0])?;
                let value = self.eval(&items[1], env)?;
                self.global.define(sym.clone(), value);
                Ok(Flow::Value(Value::Symbol(sym)))
            }
            SpecialForm::Defun => {
                // (defun f (params) body…) is (define f (lambda (params) body…)).
                let sym = binding_symbol("defun", &list_car(args))?;
                let rest = list_cdr(args);
                if !rest.is_cons() {
                    return Err(LispError::malformed("defun", "missing parameter list"));
                }
                let closure = self.make_lambda(&rest, env)?;
                self.global.define(sym.clone(), closure);
                Ok(Flow::Value(Value::Symbol(sym)))
            }
            SpecialForm::Defmacro => {
                let items = proper_args("defmacro", args)?;
                if items.is_empty() {
                    return Err(LispError::malformed("defmacro", "missing name"));
                }
                let sym = binding_symbol("defmacro", &items[0])?;
                if items.len() == 1 {
                    self.macros.remove(&sym.name().to_lowercase());
                    return Ok(Flow::Value(Value::Symbol(sym)));
                }
                let rest = list_cdr(args);
                let global = self.global.as_value();
                let mac = self.make_closure(&rest, Some(global))?;
                debug!("defmacro {}", sym.name());
                self.macros.insert(sym.name().to_lowercase(), mac);
                Ok(Flow::Value(Value::Symbol(sym)))
            }
            SpecialForm::Labels => self.sf_labels(args, env),
            SpecialForm::Let => self.sf_let(LetKind::Let, args, env),
            SpecialForm::LetStar => self.sf_let(LetKind::LetStar, args, env),
            SpecialForm::Letrec => self.sf_let(LetKind::Letrec, args, env),
            SpecialForm::Load => {
                let items = proper_args("load", args)?;
                if items.len() != 1 {
                    return Err(LispError::malformed("load", "expected (load filespec)"));
                }
                crate::load::load(self, &items[0]).map(Flow::Value)
            }
            SpecialForm::Require => {
                let items = proper_args("require", args)?;
                if items.is_empty() || items.len() > 2 {
                    return Err(LispError::malformed(
                        "require",
                        "expected (require name [filespec])",
                    ));
                }
                crate::load::require(self, &items[0], items.get(1)).map(Flow::Value)
            }
            SpecialForm::Provide => {
                let items = proper_args("provide", args)?;
                if items.len() != 1 {
                    return Err(LispError::malformed("provide", "expected (provide name)"));
                }
                let name = crate::load::module_name(&items[0])?;
                self.provide(&name);
                Ok(Flow::Value(Value::Nil))
            }
            SpecialForm::Declaim => {
                self.apply_declaim(args);
                Ok(Flow::Value(Value::Nil))
            }
        }
    }

    /// `(declaim (optimize (speed n) …))`; every other declamation is a
    /// no-op.
    pub fn apply_declaim(&mut self, args: &Value) {
        let mut cursor = args.clone();
        while cursor.is_cons() {
            let decl = list_car(&cursor);
            cursor = list_cdr(&cursor);
            let Some(items) = list_to_vec(&decl) else {
                continue;
            };
            let Some((head, rest)) = items.split_first() else {
                continue;
            };
            if head.as_symbol().map(|s| s.name().to_lowercase()) != Some("optimize".to_string()) {
                continue;
            }
            for quality in rest {
                let Some(q) = list_to_vec(quality) else {
                    continue;
                };
                if q.len() == 2
                    && q[0].as_symbol().map(|s| s.name().to_lowercase())
                        == Some("speed".to_string())
                {
                    if let Some(n) = q[1].as_long() {
                        self.speed = n.clamp(0, 3) as u8;
                        debug!("declaim speed {}", self.speed);
                    }
                }
            }
        }
    }

    /// Evaluate all but the last body form; the last is the tail.
    fn body_tail(&mut self, body: &Value, env: &Value) -> Result<Flow, LispError> {
        if body.is_nil() {
            return Ok(Flow::Value(Value::Nil));
        }
        let mut cursor = body.clone();
        loop {
            let head = list_car(&cursor);
            let rest = list_cdr(&cursor);
            if rest.is_nil() {
                return Ok(Flow::Tail(head));
            }
            if !rest.is_cons() {
                return Err(LispError::malformed("body", "dotted body list"));
            }
            self.eval(&head, env)?;
            cursor = rest;
        }
    }

    // -- lambda / closures --------------------------------------------------

    /// Build a closure from `(params body…)` or `(dynamic (params) body…)`.
    fn make_lambda(&mut self, params_and_body: &Value, env: &Value) -> LispResult {
        let head = list_car(params_and_body);
        if let Value::Symbol(s) = &head {
            if s == &self.st.wk.dynamic {
                let rest = list_cdr(params_and_body);
                return self.make_closure(&rest, None);
            }
        }
        self.make_closure(params_and_body, Some(env.clone()))
    }

    /// The closure representation: a cons whose car is `lambda`, whose cdr
    /// is `(params . body)`, carrying the captured environment (absent for
    /// dynamic lambdas).
    fn make_closure(&mut self, params_and_body: &Value, env: Option<Value>) -> LispResult {
        if !params_and_body.is_cons() {
            return Err(LispError::malformed("lambda", "missing parameter list"));
        }
        self.check_params(&list_car(params_and_body))?;
        let mut cell = ConsCell::new(
            Value::Symbol(self.st.wk.lambda.clone()),
            params_and_body.clone(),
        );
        cell.env = env;
        Ok(Value::Cons(Arc::new(Mutex::new(cell))))
    }

    /// Validate a parameter list: a symbol, or a proper/dotted list of
    /// distinct non-reserved symbols, acyclic.
    fn check_params(&self, params: &Value) -> Result<(), LispError> {
        match params {
            Value::Nil => Ok(()),
            Value::Symbol(sym) => {
                if sym.is_reserved() {
                    Err(LispError::malformed(
                        "lambda",
                        format!("cannot bind reserved word '{}'", sym.name()),
                    ))
                } else {
                    Ok(())
                }
            }
            Value::Cons(_) => {
                let mut seen_cells: HashSet<usize> = HashSet::new();
                let mut seen_names: HashSet<String> = HashSet::new();
                let mut cursor = params.clone();
                loop {
                    match cursor {
                        Value::Nil => return Ok(()),
                        Value::Symbol(sym) => {
                            // Dotted rest parameter.
                            return self.check_param_symbol(&sym, &mut seen_names);
                        }
                        Value::Cons(ref cell) => {
                            if !seen_cells.insert(Arc::as_ptr(cell) as usize) {
                                return Err(LispError::malformed(
                                    "lambda",
                                    "circular parameter list",
                                ));
                            }
                            let (car, cdr) = {
                                let pair = cell.lock().expect("poisoned");
                                (pair.car.clone(), pair.cdr.clone())
                            };
                            match car {
                                Value::Symbol(sym) => {
                                    self.check_param_symbol(&sym, &mut seen_names)?
                                }
                                other => {
                                    return Err(LispError::malformed(
                                        "lambda",
                                        format!(
                                            "parameter must be a symbol, got {}",
                                            other.type_name()
                                        ),
                                    ))
                                }
                            }
                            cursor = cdr;
                        }
                        other => {
                            return Err(LispError::malformed(
                                "lambda",
                                format!("bad parameter list tail: {}", other.type_name()),
                            ))
                        }
                    }
                }
            }
            other => Err(LispError::malformed(
                "lambda",
                format!("bad parameter list: {}", other.type_name()),
            )),
        }
    }

    fn check_param_symbol(
        &self,
        sym: &Symbol,
        seen: &mut HashSet<String>,
    ) -> Result<(), LispError> {
        if sym.is_reserved() {
            return Err(LispError::malformed(
                "lambda",
                format!("cannot bind reserved word '{}'", sym.name()),
            ));
        }
        if !seen.insert(sym.name().to_lowercase()) {
            return Err(LispError::malformed(
                "lambda",
                format!("duplicate parameter '{}'", sym.name()),
            ));
        }
        Ok(())
    }

    /// Zip a parameter list against evaluated arguments, extending `base`.
    /// A symbol parameter takes the whole argument list; a dotted tail
    /// takes the remaining arguments as a slice view.
    fn bind_params(
        &mut self,
        params: &Value,
        argv: Vec<Value>,
        base: Value,
        fname: &str,
    ) -> Result<Value, LispError> {
        self.check_params(params)?;
        match params {
            Value::Nil => {
                if argv.is_empty() {
                    Ok(base)
                } else {
                    Err(LispError::arity(fname, argv.len()))
                }
            }
            Value::Symbol(sym) => {
                let (env, _) = env::extend(base, sym.clone(), Value::list(argv));
                Ok(env)
            }
            Value::Cons(_) => {
                let shared = Arc::new(argv);
                let mut env = base;
                let mut index = 0usize;
                let mut cursor = params.clone();
                loop {
                    match cursor {
                        Value::Nil => {
                            if index < shared.len() {
                                return Err(LispError::arity(fname, shared.len()));
                            }
                            return Ok(env);
                        }
                        Value::Symbol(rest_sym) => {
                            let rest = Value::slice(shared.clone(), index);
                            let (next, _) = env::extend(env, rest_sym, rest);
                            return Ok(next);
                        }
                        Value::Cons(ref cell) => {
                            let (car, cdr) = {
                                let pair = cell.lock().expect("poisoned");
                                (pair.car.clone(), pair.cdr.clone())
                            };
                            let sym = car.as_symbol().expect("validated param").clone();
                            let Some(value) = shared.get(index) else {
                                return Err(LispError::arity(fname, shared.len()));
                            };
                            let (next, _) = env::extend(env, sym, value.clone());
                            env = next;
                            index += 1;
                            cursor = cdr;
                        }
                        _ => unreachable!("validated param list"),
                    }
                }
            }
            _ => unreachable!("validated param list"),
        }
    }

    // -- macros -------------------------------------------------------------

    /// Apply a macro closure to the unevaluated argument list.
    fn expand_macro(&mut self, mac: &Value, args_form: &Value) -> LispResult {
        let cell = mac.as_cons().expect("macro closure").clone();
        let (captured, params_and_body) = {
            let pair = cell.lock().expect("poisoned");
            (pair.env.clone(), pair.cdr.clone())
        };
        let base = captured.unwrap_or_else(|| self.global.as_value());
        let params = list_car(&params_and_body);
        let body = list_cdr(&params_and_body);
        let argv = list_to_vec(args_form)
            .ok_or_else(|| LispError::malformed("macro call", "dotted argument list"))?;
        let env = self.bind_params(&params, argv, base, "macro")?;
        let mut last = Value::Nil;
        let mut cursor = body;
        while cursor.is_cons() {
            last = self.eval(&list_car(&cursor), &env)?;
            cursor = list_cdr(&cursor);
        }
        Ok(last)
    }

    /// One-step macro expansion for `macroexpand-1`.
    pub fn macroexpand_1(&mut self, form: &Value) -> LispResult {
        if !form.is_cons() {
            return Ok(form.clone());
        }
        let Some(opsym) = list_car(form).as_symbol().cloned() else {
            return Ok(form.clone());
        };
        match self.macro_named(opsym.name()) {
            Some(mac) => self.expand_macro(&mac, &list_cdr(form)),
            None => Ok(form.clone()),
        }
    }

    // -- let family ---------------------------------------------------------

    fn sf_labels(&mut self, args: &Value, env: &mut Value) -> Result<Flow, LispError> {
        let defs = list_car(args);
        let body = list_cdr(args);
        let mut cells: Vec<(BindingCell, Value)> = Vec::new();
        let mut new_env = env.clone();
        let mut cursor = defs.clone();
        // First pass: bind every name so definitions see each other.
        while cursor.is_cons() {
            let def = list_car(&cursor);
            if !def.is_cons() {
                return Err(LispError::malformed(
                    "labels",
                    "definition must be (name (params…) body…)",
                ));
            }
            let sym = binding_symbol("labels", &list_car(&def))?;
            let (next, cell) = env::extend(new_env, sym, Value::Unassigned);
            new_env = next;
            cells.push((cell, list_cdr(&def)));
            cursor = list_cdr(&cursor);
        }
        if !cursor.is_nil() {
            return Err(LispError::malformed("labels", "dotted definition list"));
        }
        // Second pass: build the closures in the extended environment.
        for (cell, params_and_body) in cells {
            let closure = self.make_closure(&params_and_body, Some(new_env.clone()))?;
            env::set_cell(&cell, closure);
        }
        let flow = self.body_tail(&body, &new_env)?;
        *env = new_env;
        Ok(flow)
    }

    fn sf_let(&mut self, kind: LetKind, args: &Value, env: &mut Value) -> Result<Flow, LispError> {
        let mut cursor = args.clone();
        let mut name: Option<Symbol> = None;
        let mut dynamic = false;

        let first = list_car(&cursor);
        if let Value::Symbol(sym) = &first {
            if sym == &self.st.wk.dynamic {
                dynamic = true;
                cursor = list_cdr(&cursor);
            } else {
                name = Some(sym.clone());
                cursor = list_cdr(&cursor);
            }
        }

        let bindings = list_car(&cursor);
        let body = list_cdr(&cursor);
        let entries = parse_let_bindings(&bindings)?;

        if dynamic {
            // Mutate globals in place, recording restores on the machine
            // unwind list.  Sequential RHS evaluation gives let* semantics
            // for free; plain `let` evaluates everything first.
            match kind {
                LetKind::Let => {
                    let mut values = Vec::with_capacity(entries.len());
                    for (_, init) in &entries {
                        values.push(self.eval(init, env)?);
                    }
                    for ((sym, _), value) in entries.iter().zip(values) {
                        self.dynamic_bind_sym(sym.clone(), value)?;
                    }
                }
                LetKind::LetStar | LetKind::Letrec => {
                    for (sym, init) in &entries {
                        let value = self.eval(init, env)?;
                        self.dynamic_bind_sym(sym.clone(), value)?;
                    }
                }
            }
            let flow = self.body_tail(&body, env)?;
            return Ok(flow);
        }

        if let Some(loop_name) = name {
            if loop_name.is_reserved() {
                return Err(LispError::malformed(
                    "let",
                    format!("cannot bind reserved word '{}'", loop_name.name()),
                ));
            }
            // Named let: a self-recursive local function applied to the
            // initial values.
            let params = Value::list(
                entries
                    .iter()
                    .map(|(sym, _)| Value::Symbol(sym.clone()))
                    .collect(),
            );
            let (rec_env, name_cell) = env::extend(env.clone(), loop_name, Value::Unassigned);
            let closure = self.make_closure(
                &Value::cons(params.clone(), body.clone()),
                Some(rec_env.clone()),
            )?;
            env::set_cell(&name_cell, closure);

            // Initial values: sequential for let*/letrec, parallel for let.
            let mut argv = Vec::with_capacity(entries.len());
            let mut init_env = env.clone();
            for (sym, init) in &entries {
                let value = match kind {
                    LetKind::Let => self.eval(init, env)?,
                    LetKind::LetStar | LetKind::Letrec => self.eval(init, &init_env)?,
                };
                if !matches!(kind, LetKind::Let) {
                    let (next, _) = env::extend(init_env.clone(), sym.clone(), value.clone());
                    init_env = next;
                }
                argv.push(value);
            }
            let body_env = self.bind_params(&params, argv, rec_env, "named let")?;
            let flow = self.body_tail(&body, &body_env)?;
            *env = body_env;
            return Ok(flow);
        }

        let mut new_env = env.clone();
        match kind {
            LetKind::Let => {
                let mut values = Vec::with_capacity(entries.len());
                for (_, init) in &entries {
                    values.push(self.eval(init, env)?);
                }
                for ((sym, _), value) in entries.iter().zip(values) {
                    let (next, _) = env::extend(new_env, sym.clone(), value);
                    new_env = next;
                }
            }
            LetKind::LetStar => {
                for (sym, init) in &entries {
                    let value = self.eval(init, &new_env)?;
                    let (next, _) = env::extend(new_env, sym.clone(), value);
                    new_env = next;
                }
            }
            LetKind::Letrec => {
                let mut cells = Vec::with_capacity(entries.len());
                for (sym, _) in &entries {
                    let (next, cell) = env::extend(new_env, sym.clone(), Value::Unassigned);
                    new_env = next;
                    cells.push(cell);
                }
                for ((_, init), cell) in entries.iter().zip(cells) {
                    let value = self.eval(init, &new_env)?;
                    env::set_cell(&cell, value);
                }
            }
        }
        let flow = self.body_tail(&body, &new_env)?;
        *env = new_env;
        Ok(flow)
    }

    // -- trace --------------------------------------------------------------

    fn trace_enter(&mut self, name: &str, args: &[Value], depth: usize) -> Result<(), LispError> {
        self.trace_depth = depth;
        let rendered: Vec<String> = args.iter().map(|a| print_value(a, true)).collect();
        let line = format!(
            "({}) enter ({}{}{})\n",
            depth + 1,
            name,
            if rendered.is_empty() { "" } else { " " },
            rendered.join(" ")
        );
        self.write_out(&line)
    }

    fn trace_exit(&mut self, name: &str, value: &Value, depth: usize) -> Result<(), LispError> {
        let line = format!(
            "({}) exit  {} => {}\n",
            depth + 1,
            name,
            print_value(value, true)
        );
        self.write_out(&line)
    }
}

/// Control flow out of a special form: a final value, or a tail form to
/// continue with (possibly in an updated environment).
enum Flow {
    Value(Value),
    Tail(Value),
}

#[derive(Clone, Copy)]
enum LetKind {
    Let,
    LetStar,
    Letrec,
}

/// A callable adapter over a primitive or closure, valid until the global
/// environment is rebuilt.
pub struct FunctionRef {
    target: Value,
}

impl FunctionRef {
    pub fn call(&self, m: &mut Machine, args: Vec<Value>) -> LispResult {
        m.apply_values(self.target.clone(), args)
    }

    pub fn target(&self) -> &Value {
        &self.target
    }
}

fn proper_args(what: &str, args: &Value) -> Result<Vec<Value>, LispError> {
    list_to_vec(args).ok_or_else(|| LispError::malformed(what, "dotted argument list"))
}

fn binding_symbol(what: &str, v: &Value) -> Result<Symbol, LispError> {
    let sym = v
        .as_symbol()
        .ok_or_else(|| LispError::malformed(what, format!("expected a symbol, got {}", v.type_name())))?;
    if sym.is_reserved() {
        return Err(LispError::malformed(
            what,
            format!("cannot bind reserved word '{}'", sym.name()),
        ));
    }
    Ok(sym.clone())
}

/// Parse a let binding list: entries are `(sym form)`, `(sym)`, or `sym`.
fn parse_let_bindings(bindings: &Value) -> Result<Vec<(Symbol, Value)>, LispError> {
    let mut entries = Vec::new();
    if bindings.is_nil() {
        return Ok(entries);
    }
    let items = list_to_vec(bindings)
        .ok_or_else(|| LispError::malformed("let", "binding list must be a proper list"))?;
    for item in items {
        match item {
            Value::Symbol(_) => {
                let sym = binding_symbol("let", &item)?;
                entries.push((sym, Value::Nil));
            }
            Value::Cons(_) => {
                let parts = list_to_vec(&item)
                    .ok_or_else(|| LispError::malformed("let", "binding must be a proper list"))?;
                if parts.is_empty() || parts.len() > 2 {
                    return Err(LispError::malformed(
                        "let",
                        "binding must be (symbol [form])",
                    ));
                }
                let sym = binding_symbol("let", &parts[0])?;
                let init = parts.get(1).cloned().unwrap_or(Value::Nil);
                entries.push((sym, init));
            }
            other => {
                return Err(LispError::malformed(
                    "let",
                    format!("binding must be a symbol or list, got {}", other.type_name()),
                ))
            }
        }
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn machine() -> Machine {
        Machine::with_output(Box::new(Vec::new()))
    }

    fn ok(src: &str) -> String {
        let mut m = machine();
        match m.interpret_expression(src) {
            Ok(v) => print_value(&v, true),
            Err(e) => panic!("{} failed: {}", src, e),
        }
    }

    fn err(src: &str) -> LispError {
        let mut m = machine();
        match m.interpret_expression(src) {
            Ok(v) => panic!("{} unexpectedly gave {}", src, print_value(&v, true)),
            Err(e) => e,
        }
    }

    #[derive(Clone)]
    struct Sink(std::sync::Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capturing_machine() -> (Machine, std::sync::Arc<Mutex<Vec<u8>>>) {
        let buffer = std::sync::Arc::new(Mutex::new(Vec::new()));
        let m = Machine::with_output(Box::new(Sink(buffer.clone())));
        (m, buffer)
    }

    // -- Atoms and symbols --------------------------------------------------

    #[test]
    fn self_evaluating_atoms() {
        assert_eq!(ok("42"), "42");
        assert_eq!(ok("2.5"), "2.5");
        assert_eq!(ok("\"s\""), "\"s\"");
        assert_eq!(ok("#\\a"), "#\\a");
        assert_eq!(ok("nil"), "nil");
        assert_eq!(ok("t"), "t");
        assert_eq!(ok("()"), "nil");
    }

    #[test]
    fn unbound_symbol_errors() {
        let e = err("no-such-thing");
        assert_eq!(e.kind, ErrorKind::Unbound);
    }

    // -- quote / if / cond / progn -----------------------------------------

    #[test]
    fn quote_returns_argument() {
        assert_eq!(ok("'x"), "x");
        assert_eq!(ok("'(1 2)"), "(1 2)");
        assert_eq!(err("(quote)").kind, ErrorKind::Arity);
        assert_eq!(err("(quote a b)").kind, ErrorKind::Arity);
    }

    #[test]
    fn if_branches() {
        assert_eq!(ok("(if t 1 2)"), "1");
        assert_eq!(ok("(if nil 1 2)"), "2");
        assert_eq!(ok("(if nil 1)"), "nil");
        assert_eq!(ok("(if 0 'zero-is-true 'no)"), "zero-is-true");
        assert_eq!(err("(if t)").kind, ErrorKind::Malformed);
    }

    #[test]
    fn cond_selects_first_truthy() {
        assert_eq!(ok("(cond (nil 1) (t 2) (t 3))"), "2");
        assert_eq!(ok("(cond (nil 1))"), "nil");
        assert_eq!(ok("(cond ('x))"), "x");
        assert_eq!(ok("(cond (t 1 2 3))"), "3");
    }

    #[test]
    fn progn_sequences() {
        assert_eq!(ok("(progn 1 2 3)"), "3");
        assert_eq!(ok("(progn)"), "nil");
    }

    // -- define / setq / defun ---------------------------------------------

    #[test]
    fn define_binds_and_returns_symbol() {
        assert_eq!(ok("(define a 5)"), "a");
        assert_eq!(ok("(define a 5) a"), "5");
        assert_eq!(ok("(define a 5) (define a 6) a"), "6");
        assert_eq!(err("(define t 1)").kind, ErrorKind::Malformed);
        assert_eq!(err("(define if 1)").kind, ErrorKind::Malformed);
    }

    #[test]
    fn setq_mutates_existing() {
        assert_eq!(ok("(define a 1) (setq a 2) a"), "2");
        assert_eq!(ok("(define a 1) (define b 1) (setq a 2 b 3)"), "3");
        assert_eq!(ok("(let ((x 1)) (setq x 9) x)"), "9");
        assert_eq!(err("(setq zz 1)").kind, ErrorKind::Unbound);
        assert_eq!(err("(setq lambda 1)").kind, ErrorKind::Malformed);
        assert_eq!(err("(define a 1) (setq a)").kind, ErrorKind::Malformed);
    }

    #[test]
    fn closures_see_later_defines_through_captured_global_env() {
        assert_eq!(
            ok("(defun probe () later) (define later 42) (probe)"),
            "42"
        );
    }

    // -- lambda / application ----------------------------------------------

    #[test]
    fn lambda_application() {
        assert_eq!(ok("((lambda (x) x) 5)"), "5");
        assert_eq!(ok("((lambda (x y) (cons x y)) 1 2)"), "(1 . 2)");
        assert_eq!(ok("((lambda () 'hi))"), "hi");
        assert_eq!(ok("((lambda (x) (car x)) '(9))"), "9");
    }

    #[test]
    fn lambda_vararg_forms() {
        assert_eq!(ok("((lambda args args) 1 2 3)"), "(1 2 3)");
        assert_eq!(ok("((lambda (a . rest) rest) 1 2 3)"), "(2 3)");
        assert_eq!(ok("((lambda (a . rest) a) 1)"), "1");
        assert_eq!(ok("((lambda (a . rest) rest) 1)"), "nil");
        assert_eq!(ok("((lambda (a . rest) (car rest)) 1 2 3)"), "2");
    }

    #[test]
    fn arity_mismatches() {
        assert_eq!(err("((lambda (x) x))").kind, ErrorKind::Arity);
        assert_eq!(err("((lambda (x) x) 1 2)").kind, ErrorKind::Arity);
    }

    #[test]
    fn closures_capture_lexically() {
        assert_eq!(
            ok("(define make-adder (lambda (n) (lambda (x) (+ x n)))) ((make-adder 3) 4)"),
            "7.0"
        );
        assert_eq!(
            ok("(let ((x 1)) (define f (lambda () x)) (let ((x 2)) (f)))"),
            "1"
        );
    }

    #[test]
    fn dynamic_lambda_uses_caller_env() {
        assert_eq!(
            ok("(define f (lambda dynamic () x)) (let ((x 7)) (f))"),
            "7"
        );
    }

    #[test]
    fn reserved_words_rejected_as_params() {
        assert_eq!(err("((lambda (t) t) 1)").kind, ErrorKind::Malformed);
        assert_eq!(err("((lambda (x x) x) 1 2)").kind, ErrorKind::Malformed);
    }

    #[test]
    fn circular_parameter_list_is_detected() {
        let mut m = machine();
        // Build (lambda (a . <cycle>) 1) by hand.
        let a = m.st.intern("a");
        let params = Value::cons(Value::Symbol(a), Value::Nil);
        if let Value::Cons(cell) = &params {
            cell.lock().unwrap().cdr = params.clone();
        }
        let lam = m.st.intern("lambda");
        let form = Value::cons(
            Value::Symbol(lam),
            Value::cons(params, Value::cons(Value::Long(1), Value::Nil)),
        );
        let e = m.eval_top(&form).unwrap_err();
        assert!(e.message.contains("circular"), "{}", e);
    }

    #[test]
    fn not_a_function_application() {
        assert_eq!(err("(1 2 3)").kind, ErrorKind::Type);
        assert_eq!(err("('(1 2))").kind, ErrorKind::Type);
    }

    // -- let family ----------------------------------------------------------

    #[test]
    fn let_parallel_let_star_sequential() {
        assert_eq!(ok("(let ((a 1) (b 2)) (+ a b))"), "3.0");
        assert_eq!(ok("(define a 10) (let ((a 1) (b a)) b)"), "10");
        assert_eq!(ok("(let* ((a 1) (b a)) b)"), "1");
        assert_eq!(ok("(let ((a)) a)"), "nil");
        assert_eq!(ok("(let (a) a)"), "nil");
        assert_eq!(ok("(let () 5)"), "5");
    }

    #[test]
    fn letrec_sees_its_own_bindings() {
        assert_eq!(
            ok("(letrec ((even? (lambda (n) (if (= n 0) t (odd? (1- n))))) \
                         (odd? (lambda (n) (if (= n 0) nil (even? (1- n)))))) \
                  (even? 10))"),
            "t"
        );
        assert_eq!(err("(letrec ((a b) (b 1)) a)").kind, ErrorKind::Unbound);
    }

    #[test]
    fn named_let_loops() {
        assert_eq!(
            ok("(let loop ((i 0) (acc nil)) (if (= i 3) acc (loop (1+ i) (cons i acc))))"),
            "(2 1 0)"
        );
        // Deep enough to require the tail-call loop.
        assert_eq!(
            ok("(let loop ((i 0)) (if (< i 100000) (loop (1+ i)) i))"),
            "100000"
        );
    }

    #[test]
    fn labels_mutual_recursion() {
        assert_eq!(
            ok("(labels ((w1 (x) (cons 1 x)) (w2 (x) (w1 (cons 2 x)))) (w2 nil))"),
            "(1 2)"
        );
        assert_eq!(ok("(labels () 1 2)"), "2");
    }

    #[test]
    fn let_bindings_reject_reserved_words() {
        assert_eq!(err("(let ((t 1)) t)").kind, ErrorKind::Malformed);
        assert_eq!(err("(let ((quote 1)) 1)").kind, ErrorKind::Malformed);
    }

    // -- dynamic binding ------------------------------------------------------

    #[test]
    fn dynamic_let_mutates_and_restores() {
        assert_eq!(
            ok("(define *g* 1) (defun probe () *g*) \
                (let dynamic ((*g* 2)) (probe))"),
            "2"
        );
        assert_eq!(
            ok("(define *g* 1) (let dynamic ((*g* 2)) *g*) *g*"),
            "1"
        );
    }

    #[test]
    fn dynamic_let_restores_on_error() {
        let mut m = machine();
        m.interpret_expression("(define *g* 1)").unwrap();
        let e = m
            .interpret_expression("(let dynamic ((*g* 2)) (car 1))")
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::Type);
        let v = m.interpret_expression("*g*").unwrap();
        assert_eq!(v.as_long(), Some(1));
    }

    #[test]
    fn dynamic_let_over_unbound_global_restores_unboundness() {
        let mut m = machine();
        m.interpret_expression("(let dynamic ((fresh 5)) fresh)")
            .unwrap();
        let e = m.interpret_expression("fresh").unwrap_err();
        assert_eq!(e.kind, ErrorKind::Unbound);
    }

    #[test]
    fn spec_scenario_dynamic_vs_lexical_probe() {
        assert_eq!(
            ok("(let* dynamic ((x 1)) (defun probe () x) (let* dynamic ((x 2)) (probe)))"),
            "2"
        );
        assert_eq!(
            ok("(let* ((x 1)) (defun probe () x) (let* ((x 2)) (probe)))"),
            "1"
        );
    }

    // -- macros ---------------------------------------------------------------

    #[test]
    fn defmacro_and_expansion() {
        assert_eq!(ok("(progn (defmacro m (a b) `(+ ,a ,b)) (m 1 2))"), "3.0");
        assert_eq!(
            ok("(defmacro twice (x) (list '+ x x)) (twice 21)"),
            "42.0"
        );
    }

    #[test]
    fn macro_arguments_are_unevaluated() {
        assert_eq!(
            ok("(defmacro q (x) (list 'quote x)) (q (undefined-fn 1))"),
            "(undefined-fn 1)"
        );
    }

    #[test]
    fn defmacro_uninstalls() {
        assert_eq!(
            err("(defmacro m (x) x) (defmacro m) (m 1)").kind,
            ErrorKind::Unbound
        );
    }

    #[test]
    fn macroexpand_1_expands_once() {
        assert_eq!(
            ok("(defmacro m (a) `(list ,a)) (macroexpand-1 '(m 1))"),
            "(list 1)"
        );
        assert_eq!(ok("(macroexpand-1 '(car x))"), "(car x)");
        assert_eq!(ok("(macroexpand-1 '5)"), "5");
    }

    // -- tail calls -----------------------------------------------------------

    #[test]
    fn deep_tail_recursion_via_defun() {
        assert_eq!(
            ok("(defun countdown (n) (if (= n 0) 'done (countdown (1- n)))) \
                (countdown 200000)"),
            "done"
        );
    }

    #[test]
    fn tail_positions_cover_cond_and_progn() {
        assert_eq!(
            ok("(defun f (n) (cond ((= n 0) 'done) (t (progn 'ignored (f (1- n)))))) (f 50000)"),
            "done"
        );
    }

    #[test]
    fn spec_scenario_stak() {
        assert_eq!(
            ok("(defun stak (x y z) \
                  (if (not (< y x)) \
                      z \
                    (stak (stak (1- x) y z) \
                          (stak (1- y) z x) \
                          (stak (1- z) x y)))) \
                (stak 18 12 6)"),
            "7"
        );
    }

    #[test]
    fn apply_is_tail_rewritten() {
        assert_eq!(
            ok("(defun f (n) (if (= n 0) 'ok (apply f (list (1- n))))) (f 100000)"),
            "ok"
        );
    }

    #[test]
    fn eval_is_tail_rewritten() {
        assert_eq!(ok("(eval '(+ 1 2))"), "3.0");
        assert_eq!(ok("(define form '(+ 1 2)) (eval form)"), "3.0");
        assert_eq!(
            ok("(define form '(+ 1 2)) (eval (eval ''form))"),
            "(+ 1 2)"
        );
    }

    // -- backquote scenarios --------------------------------------------------

    #[test]
    fn spec_scenario_splice() {
        assert_eq!(ok("`(a ,@'(1 2) b)"), "(a 1 2 b)");
    }

    #[test]
    fn spec_scenario_clhs() {
        assert_eq!(
            ok("(define a \"A\") (define c \"C\") (define d '(\"D\" \"DD\")) \
                `((,a b) ,c ,@d)"),
            "((\"A\" b) \"C\" \"D\" \"DD\")"
        );
    }

    #[test]
    fn backquote_eval_samples() {
        assert_eq!(ok("(let ((a 11.0)) `(1.0 2.0 3.0 ,a))"), "(1.0 2.0 3.0 11.0)");
        assert_eq!(ok("(define l '(1.0 2.0)) `(a ,@l b)"), "(a 1.0 2.0 b)");
        assert_eq!(
            ok("(let ((q '(r s))) ``(foo ,@,@q))"),
            "(cons (quote foo) (append r s))"
        );
        assert_eq!(
            ok("(define x 'a) (define a 1) (define y 'b) (define b 2.0) (eval ``(w ,x ,,y))"),
            "(w a 2.0)"
        );
    }

    // -- declaim / speed ------------------------------------------------------

    #[test]
    fn declaim_sets_speed() {
        let mut m = machine();
        assert_eq!(m.speed(), 1);
        m.interpret_expression("(declaim (optimize (speed 0)))").unwrap();
        assert_eq!(m.speed(), 0);
        m.interpret_expression("(declaim (optimize (speed 3) (debug 2)) (inline foo))")
            .unwrap();
        assert_eq!(m.speed(), 3);
        // Results match at every speed.
        let v0 = m.interpret_expression("(+ 1 2 (car '(3)))").unwrap();
        m.set_speed(0);
        let v1 = m.interpret_expression("(+ 1 2 (car '(3)))").unwrap();
        assert!(crate::value::equal_value(&v0, &v1));
    }

    // -- trace ----------------------------------------------------------------

    #[test]
    fn trace_reports_enter_and_exit() {
        let (mut m, buffer) = capturing_machine();
        m.interpret_expression(
            "(defun fact (n) (if (= n 0) 1 (* n (fact (1- n))))) (trace fact) (fact 2)",
        )
        .unwrap();
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(text.contains("enter (fact 2)"), "{}", text);
        assert!(text.contains("enter (fact 0)"), "{}", text);
        assert!(text.contains("exit"), "{}", text);
        assert!(text.contains("=> 2.0"), "{}", text);
    }

    #[test]
    fn untrace_removes() {
        let (mut m, buffer) = capturing_machine();
        m.interpret_expression("(defun f (n) n) (trace f) (untrace f) (f 1)")
            .unwrap();
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(!text.contains("enter"), "{}", text);
    }

    #[test]
    fn trace_unwinds_tail_steps_as_exits() {
        let (mut m, buffer) = capturing_machine();
        m.interpret_expression(
            "(defun g (n) (if (= n 0) 'done (g (1- n)))) (trace g) (g 2)",
        )
        .unwrap();
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(text.matches("enter").count(), 3, "{}", text);
        assert_eq!(text.matches("exit").count(), 3, "{}", text);
    }

    // -- error reporting ------------------------------------------------------

    #[test]
    fn errors_carry_the_offending_form() {
        let e = err("(car (cons 1))");
        assert!(
            e.to_string().contains("error occurred in (cons 1)"),
            "{}",
            e
        );
    }

    #[test]
    fn eval_of_eval_is_stable_for_pure_values() {
        let mut m = machine();
        for src in ["42", "'sym", "'(1 2 (3))", "\"s\""] {
            let once = m.interpret_expression(&format!("(eval '{})", src)).unwrap();
            let twice = m
                .interpret_expression(&format!("(eval (eval '{}))", src))
                .unwrap();
            // Double evaluation of a quoted self-evaluating result.
            let _ = twice;
            let direct = m.interpret_expression(src).unwrap();
            assert!(crate::value::equal_value(&once, &direct), "{}", src);
        }
    }

    // -- embedding surface ----------------------------------------------------

    #[test]
    fn global_value_and_function_ref() {
        let mut m = machine();
        m.interpret_expression("(define x 5) (defun add1 (n) (1+ n))")
            .unwrap();
        assert_eq!(m.global_value("x").unwrap().as_long(), Some(5));
        assert_eq!(m.global_value("X").unwrap().as_long(), Some(5));
        assert!(m.global_value("missing").is_err());

        let f = m.function_ref("add1").unwrap();
        let v = f.call(&mut m, vec![Value::Long(41)]).unwrap();
        assert_eq!(v.as_long(), Some(42));

        assert!(m.function_ref("x").is_err());
    }

    #[test]
    fn command_line_argument_list() {
        let mut m = machine();
        m.set_command_line(vec!["a".into(), "b".into()]);
        let v = m.interpret_expression("*command-line-argument-list*").unwrap();
        assert_eq!(print_value(&v, true), "(\"a\" \"b\")");
    }
}
