//! The code generator: two-pass lowering of a compilation unit to the
//! source text of a standalone Rust program over `pika_core::rt`.
//!
//! Pass 1 walks top-level forms: `define`/`defun` register global slots,
//! `defmacro` is evaluated against the generator's embedded machine so
//! later passes can expand, `load`/`require` inline the referenced file's
//! forms, `declaim` adjusts the open-coding level, `progn` flattens;
//! everything else is buffered for the body.  Pass 2 emits one statement
//! per buffered form with a source-location comment.
//!
//! Expressions lower to a flat statement form: every operation that
//! touches the runtime machine lands in its own `let` temporary, so the
//! emitted Rust never nests two machine borrows in one call.  Compiled
//! lambdas return trampoline steps; call sites in tail position emit the
//! pending-call shape, every other call drives synchronously.  Quoted
//! literals are deduplicated into a constant pool.

pub mod mangle;
pub mod pool;
pub mod rustc;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use log::{debug, warn};

use crate::error::LispError;
use crate::eval::Machine;
use crate::load;
use crate::print::print_value;
use crate::reader;
use crate::symbol::{SpecialForm, Symbol};
use crate::value::{list_car, list_cdr, list_to_vec, SourcePos, Value};

use self::mangle::mangle;
use self::pool::ConstPool;

/// Generate host source for `source`, a whole compilation unit.
pub fn generate_source(source: &str, unit: &str) -> Result<String, LispError> {
    let mut generator = Generator::new(unit);
    let forms = reader::read_all(source, &mut generator.m.st)?;
    generator.pass1(forms)?;
    generator.emit_program()
}

/// Generate host source for the unit in `path`; `load`/`require` resolve
/// relative to the file's directory.
pub fn generate_file(path: &Path, lib_dir: Option<&Path>) -> Result<String, LispError> {
    let unit = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unit".to_string());
    let mut generator = Generator::new(&unit);
    generator.m.current_dir = path.parent().map(Path::to_path_buf);
    generator.m.lib_dir = lib_dir.map(Path::to_path_buf);
    let forms = load::read_file_forms(&mut generator.m, path)?;
    generator.pass1(forms)?;
    generator.emit_program()
}

enum TopForm {
    Define {
        name: String,
        form: Value,
        seq: usize,
        pos: Option<SourcePos>,
    },
    Defun {
        name: String,
        params_and_body: Value,
        seq: usize,
        pos: Option<SourcePos>,
    },
    Expr {
        form: Value,
        seq: usize,
        pos: Option<SourcePos>,
    },
}

impl TopForm {
    fn seq(&self) -> usize {
        match self {
            TopForm::Define { seq, .. } | TopForm::Defun { seq, .. } | TopForm::Expr { seq, .. } => {
                *seq
            }
        }
    }

    fn pos(&self) -> Option<&SourcePos> {
        match self {
            TopForm::Define { pos, .. } | TopForm::Defun { pos, .. } | TopForm::Expr { pos, .. } => {
                pos.as_ref()
            }
        }
    }
}

/// Lexical scope during emission: symbol name (lowercased) to the Rust
/// variable holding its binding cell.
type Scope = Vec<(String, String)>;

struct Params {
    whole: Option<Symbol>,
    fixed: Vec<Symbol>,
    rest: Option<Symbol>,
}

struct LetShape {
    name: Option<Symbol>,
    dynamic: bool,
    entries: Vec<(Symbol, Value)>,
    body: Value,
}

#[derive(Clone, Copy)]
enum LetKind {
    Let,
    LetStar,
    Letrec,
}

pub struct Generator {
    /// Compile-time machine: macro registration, module set, symbols.
    m: Machine,
    unit: String,
    pool: ConstPool,
    /// Global name (lowercased) to the sequence number of its definition.
    defined: BTreeMap<String, usize>,
    /// Referenced but never defined (checked when generation completes).
    implicit: BTreeSet<String>,
    macro_seq: HashMap<String, usize>,
    body: Vec<TopForm>,
    seq: usize,
    current_seq: usize,
    temp: usize,
}

impl Generator {
    pub fn new(unit: &str) -> Generator {
        Generator {
            m: Machine::with_output(Box::new(std::io::sink())),
            unit: unit.to_string(),
            pool: ConstPool::new(),
            defined: BTreeMap::new(),
            implicit: BTreeSet::new(),
            macro_seq: HashMap::new(),
            body: Vec::new(),
            seq: 0,
            current_seq: 0,
            temp: 0,
        }
    }

    fn fresh(&mut self, base: &str) -> String {
        self.temp += 1;
        format!("{}_{}", base, self.temp)
    }

    fn fresh_var(&mut self, name: &str) -> String {
        let base = mangle(name);
        self.fresh(&base)
    }

    /// Bind `rhs` to a fresh temporary statement in `out`.
    fn stmt(&mut self, out: &mut String, rhs: &str) -> String {
        let var = self.fresh("__t");
        let _ = write!(out, "let {} = {}; ", var, rhs);
        var
    }

    // -----------------------------------------------------------------------
    // Pass 1
    // -----------------------------------------------------------------------

    fn pass1(&mut self, forms: Vec<Value>) -> Result<(), LispError> {
        for form in forms {
            self.pass1_form(form)?;
        }
        Ok(())
    }

    fn pass1_form(&mut self, form: Value) -> Result<(), LispError> {
        self.seq += 1;
        let seq = self.seq;
        let pos = form.pos();
        let op = list_car(&form);
        let args = list_cdr(&form);
        let sf = op.as_symbol().and_then(|s| s.special_form());
        match sf {
            Some(SpecialForm::Define) => {
                let name = self.top_name("define", &args)?;
                self.register_define(&name, seq)?;
                let init = list_car(&list_cdr(&args));
                self.body.push(TopForm::Define {
                    name,
                    form: init,
                    seq,
                    pos,
                });
            }
            Some(SpecialForm::Defun) => {
                let name = self.top_name("defun", &args)?;
                self.register_define(&name, seq)?;
                self.body.push(TopForm::Defun {
                    name,
                    params_and_body: list_cdr(&args),
                    seq,
                    pos,
                });
            }
            Some(SpecialForm::Defmacro) => {
                let name = self.top_name("defmacro", &args)?;
                // Register with the shared evaluator so pass 2 expands.
                self.m.eval_top(&form)?;
                self.macro_seq.insert(name.to_lowercase(), seq);
            }
            Some(SpecialForm::Load) => {
                let spec = list_car(&args);
                let forms = self.read_unit(&spec)?;
                self.pass1(forms)?;
            }
            Some(SpecialForm::Require) => {
                let name = load::module_name(&list_car(&args))?;
                if !self.m.has_module(&name) {
                    let spec = match list_car(&list_cdr(&args)) {
                        Value::Nil => list_car(&args),
                        other => other,
                    };
                    let forms = self.read_unit(&spec)?;
                    self.pass1(forms)?;
                    if !self.m.has_module(&name) {
                        return Err(LispError::malformed(
                            "require",
                            format!("loaded unit did not provide '{}'", name),
                        ));
                    }
                }
            }
            Some(SpecialForm::Provide) => {
                let name = load::module_name(&list_car(&args))?;
                self.m.provide(&name);
            }
            Some(SpecialForm::Declaim) => {
                self.m.apply_declaim(&args);
            }
            Some(SpecialForm::Progn) => {
                let items = list_to_vec(&args)
                    .ok_or_else(|| LispError::malformed("progn", "dotted body"))?;
                for item in items {
                    self.pass1_form(item)?;
                }
            }
            _ => self.body.push(TopForm::Expr { form, seq, pos }),
        }
        Ok(())
    }

    fn top_name(&self, what: &str, args: &Value) -> Result<String, LispError> {
        let sym = list_car(args);
        let sym = sym
            .as_symbol()
            .ok_or_else(|| LispError::malformed(what, "expected a symbol name"))?;
        if sym.is_reserved() {
            return Err(LispError::malformed(
                what,
                format!("cannot bind reserved word '{}'", sym.name()),
            ));
        }
        Ok(sym.name().to_string())
    }

    fn register_define(&mut self, name: &str, seq: usize) -> Result<(), LispError> {
        let key = name.to_lowercase();
        if self.defined.insert(key, seq).is_some() {
            return Err(LispError::malformed(
                "define",
                format!("duplicate definition of '{}'", name),
            ));
        }
        Ok(())
    }

    fn read_unit(&mut self, spec: &Value) -> Result<Vec<Value>, LispError> {
        let name = load::module_name(spec)?;
        let path = load::resolve(&self.m, &name)?;
        debug!("inlining {}", path.display());
        let saved = self.m.current_dir.take();
        self.m.current_dir = path.parent().map(Path::to_path_buf);
        let result = load::read_file_forms(&mut self.m, &path);
        self.m.current_dir = saved;
        result
    }

    // -----------------------------------------------------------------------
    // Pass 2: program assembly
    // -----------------------------------------------------------------------

    fn emit_program(&mut self) -> Result<String, LispError> {
        let tops = std::mem::take(&mut self.body);
        let mut body_src = String::new();
        for top in &tops {
            self.current_seq = top.seq();
            let note = match top.pos() {
                Some(pos) => format!("{}", pos),
                None => self.unit.clone(),
            };
            let _ = writeln!(body_src, "        // {}", note);
            let mut scope: Scope = Vec::new();
            let mut stmts = String::new();
            match top {
                TopForm::Define { name, form, .. } => {
                    let value = self.emit_val(form, &mut scope, &mut stmts)?;
                    let _ = write!(stmts, "m.define_global({:?}, {}); ", name, value);
                    let result = self.stmt(&mut stmts, &format!("sym(m, {:?})", name));
                    let _ = writeln!(body_src, "        {{ {}__last = {}; }}", stmts, result);
                }
                TopForm::Defun {
                    name,
                    params_and_body,
                    ..
                } => {
                    let lambda = self.emit_lambda(name, params_and_body, &mut scope, &mut stmts)?;
                    let _ = write!(stmts, "m.define_global({:?}, {}); ", name, lambda);
                    let result = self.stmt(&mut stmts, &format!("sym(m, {:?})", name));
                    let _ = writeln!(body_src, "        {{ {}__last = {}; }}", stmts, result);
                }
                TopForm::Expr { form, .. } => {
                    let value = self.emit_val(form, &mut scope, &mut stmts)?;
                    let _ = writeln!(body_src, "        {{ {}__last = {}; }}", stmts, value);
                }
            }
        }

        if !self.implicit.is_empty() {
            let names: Vec<&str> = self.implicit.iter().map(String::as_str).collect();
            return Err(LispError::malformed(
                "compile",
                format!("undefined symbol(s): {}", names.join(", ")),
            ));
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "//! Compiled from {unit}.lisp by the Pika compiler; do not edit.",
            unit = self.unit
        );
        out.push_str(
            "#![allow(unused_variables, unused_mut, unused_parens, unreachable_code, \
             non_snake_case, dead_code, clippy::all)]\n\nuse pika_core::rt::*;\n\n\
             pub struct Program {\n    pub rt: Rt,\n}\n\n",
        );
        out.push_str(
            "impl Program {\n    pub fn new() -> Program {\n        let mut rt = Rt::new();\n",
        );
        if !self.pool.is_empty() {
            out.push_str(
                "        {\n            let m = &mut rt.m;\n            let pool = vec![\n",
            );
            for (slot, init) in self.pool.entries().iter().enumerate() {
                let _ = writeln!(out, "                /* q{} */ {},", slot, init);
            }
            out.push_str("            ];\n            m.set_pool(pool);\n        }\n");
        }
        out.push_str("        Program { rt }\n    }\n\n");
        out.push_str("    pub fn body(&mut self) -> RtResult {\n        let m = &mut self.rt.m;\n        let mut __last = Value::Nil;\n");
        out.push_str(&body_src);
        out.push_str("        Ok(__last)\n    }\n\n");
        out.push_str(
            "    pub fn get_value(&mut self, name: &str) -> RtResult {\n        \
             self.rt.m.global_value(name)\n    }\n\n    \
             pub fn get_function(&mut self, name: &str) -> Result<FunctionRef, LispError> {\n        \
             self.rt.m.function_ref(name)\n    }\n}\n\n",
        );
        out.push_str(
            "fn main() {\n    let mut program = Program::new();\n    \
             program.rt.m.set_command_line(std::env::args().skip(1).collect());\n    \
             if let Err(e) = program.body() {\n        eprintln!(\"{}\", e);\n        \
             std::process::exit(1);\n    }\n}\n",
        );
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Expression emission (value position)
    // -----------------------------------------------------------------------

    /// Lower `form`, appending statements to `out`; the returned string is
    /// a temporary name or a machine-free expression, safe to embed
    /// anywhere.
    fn emit_val(
        &mut self,
        form: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        match form {
            Value::Nil => Ok("Value::Nil".to_string()),
            Value::Long(n) => Ok(fmt_long(*n)),
            Value::Double(d) => Ok(format!("dbl({:?}f64)", d)),
            Value::Char(c) => Ok(format!("chr({:?})", c)),
            Value::Str(s) => Ok(format!("strv({:?})", s.as_str())),
            Value::Symbol(sym) => Ok(self.emit_symbol_ref(sym, scope, out)),
            Value::Cons(_) => self.emit_call_or_form(form, scope, out),
            other => Err(LispError::internal(format!(
                "cannot compile a {} literal",
                other.type_name()
            ))),
        }
    }

    fn emit_symbol_ref(&mut self, sym: &Symbol, scope: &mut Scope, out: &mut String) -> String {
        let lower = sym.name().to_lowercase();
        if let Some(var) = lookup_scope(scope, &lower) {
            return format!("cell_get(&{}, {:?})?", var, sym.name());
        }
        if sym == &self.m.st.wk.t {
            return self.stmt(out, "m.t()");
        }
        self.note_global(&lower);
        let rhs = format!("m.global_value({:?})?", lower);
        self.stmt(out, &rhs)
    }

    fn note_global(&mut self, lower: &str) {
        if self.defined.contains_key(lower)
            || crate::builtins::lookup_prim(lower).is_some()
            || self.m.global_value(lower).is_ok()
        {
            return;
        }
        self.implicit.insert(lower.to_string());
    }

    fn emit_call_or_form(
        &mut self,
        form: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        let op = list_car(form);
        let args = list_cdr(form);

        if let Some(opsym) = op.as_symbol() {
            if let Some(sf) = opsym.special_form() {
                return self.emit_special_val(sf, &args, scope, out);
            }
        }
        if let Some(expanded) = self.try_macro(form)? {
            return self.emit_val(&expanded, scope, out);
        }

        let argv = list_to_vec(&args)
            .ok_or_else(|| LispError::malformed("application", "dotted argument list"))?;
        let mut rendered = Vec::with_capacity(argv.len());
        for arg in &argv {
            rendered.push(self.emit_val(arg, scope, out)?);
        }
        let arg_list = rendered.join(", ");

        if let Some(opsym) = op.as_symbol() {
            let lower = opsym.name().to_lowercase();
            let shadowed =
                lookup_scope(scope, &lower).is_some() || self.defined.contains_key(&lower);
            if !shadowed {
                if let Some(p) = crate::builtins::lookup_prim(&lower) {
                    crate::builtins::check_arity(p, argv.len())?;
                    if self.m.speed() >= 1 {
                        // Open-coded: straight through the registry.
                        let rhs = format!("call_prim(m, {:?}, vec![{}])?", lower, arg_list);
                        return Ok(self.stmt(out, &rhs));
                    }
                    let f = self.stmt(out, &format!("m.global_value({:?})?", lower));
                    let rhs = format!("funcall(m, {}, vec![{}])?", f, arg_list);
                    return Ok(self.stmt(out, &rhs));
                }
            }
        }

        let f = self.emit_val(&op, scope, out)?;
        let rhs = format!("funcall(m, {}, vec![{}])?", f, arg_list);
        Ok(self.stmt(out, &rhs))
    }

    fn try_macro(&mut self, form: &Value) -> Result<Option<Value>, LispError> {
        let Some(opsym) = list_car(form).as_symbol().cloned() else {
            return Ok(None);
        };
        let lower = opsym.name().to_lowercase();
        if self.m.macro_named(&lower).is_none() {
            return Ok(None);
        }
        if let Some(&def_seq) = self.macro_seq.get(&lower) {
            if def_seq > self.current_seq {
                return Err(LispError::malformed(
                    "compile",
                    format!("macro '{}' used before its definition", opsym.name()),
                ));
            }
        }
        self.m.macroexpand_1(form).map(Some)
    }

    fn emit_special_val(
        &mut self,
        sf: SpecialForm,
        args: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        match sf {
            SpecialForm::Quote => {
                if !args.is_cons() || !list_cdr(args).is_nil() {
                    return Err(LispError::malformed("quote", "expected (quote form)"));
                }
                self.emit_quote(&list_car(args), out)
            }
            SpecialForm::If => {
                let items = list_to_vec(args)
                    .ok_or_else(|| LispError::malformed("if", "dotted argument list"))?;
                if items.len() < 2 || items.len() > 3 {
                    return Err(LispError::malformed("if", "expected (if test then [else])"));
                }
                let (test, negated) = self.unfold_null(&items[0]);
                let test_var = self.emit_val(&test, scope, out)?;
                let result = self.fresh("__r");
                let mut then_stmts = String::new();
                let then_var = self.emit_val(&items[1], scope, &mut then_stmts)?;
                let mut else_stmts = String::new();
                let else_var = match items.get(2) {
                    Some(e) => self.emit_val(e, scope, &mut else_stmts)?,
                    None => "Value::Nil".to_string(),
                };
                let (first, first_var, second, second_var) = if negated {
                    (else_stmts, else_var, then_stmts, then_var)
                } else {
                    (then_stmts, then_var, else_stmts, else_var)
                };
                let _ = write!(
                    out,
                    "let {r}; if truthy(&{c}) {{ {a}{r} = {av}; }} else {{ {b}{r} = {bv}; }} ",
                    r = result,
                    c = test_var,
                    a = first,
                    av = first_var,
                    b = second,
                    bv = second_var
                );
                Ok(result)
            }
            SpecialForm::Cond => self.emit_cond_val(args, scope, out),
            SpecialForm::Progn => self.emit_progn_val(args, scope, out),
            SpecialForm::Lambda => self.emit_lambda("lambda", args, scope, out),
            SpecialForm::Setq => self.emit_setq(args, scope, out),
            SpecialForm::Let => self.emit_let_val(LetKind::Let, args, scope, out),
            SpecialForm::LetStar => self.emit_let_val(LetKind::LetStar, args, scope, out),
            SpecialForm::Letrec => self.emit_let_val(LetKind::Letrec, args, scope, out),
            SpecialForm::Labels => {
                let saved = scope.len();
                self.emit_labels_prelude(args, scope, out)?;
                let result = self.emit_progn_val(&list_cdr(args), scope, out);
                scope.truncate(saved);
                result
            }
            SpecialForm::Load => {
                let forms = self.read_unit(&list_car(args))?;
                let mut last = "Value::Nil".to_string();
                for form in &forms {
                    last = self.emit_val(form, scope, out)?;
                }
                Ok(last)
            }
            SpecialForm::Require | SpecialForm::Provide => Err(LispError::malformed(
                "compile",
                "require/provide are only allowed as top-level forms",
            )),
            SpecialForm::Declaim => Err(LispError::malformed(
                "compile",
                "declaim is only allowed as a top-level form",
            )),
            SpecialForm::Define | SpecialForm::Defun | SpecialForm::Defmacro => {
                Err(LispError::malformed(
                    "compile",
                    "definitions are only allowed as top-level forms",
                ))
            }
        }
    }

    /// `(if (null x) a b)` avoids the double negation.
    fn unfold_null(&self, test: &Value) -> (Value, bool) {
        if !test.is_cons() {
            return (test.clone(), false);
        }
        let op = list_car(test);
        let is_null = op.as_symbol().is_some_and(|s| {
            s.name().eq_ignore_ascii_case("null") || s.name().eq_ignore_ascii_case("not")
        });
        if !is_null {
            return (test.clone(), false);
        }
        let rest = list_cdr(test);
        if !rest.is_cons() || !list_cdr(&rest).is_nil() {
            return (test.clone(), false);
        }
        (list_car(&rest), true)
    }

    fn emit_quote(&mut self, arg: &Value, out: &mut String) -> Result<String, LispError> {
        match arg {
            Value::Nil => Ok("Value::Nil".to_string()),
            Value::Long(n) => Ok(fmt_long(*n)),
            Value::Double(d) => Ok(format!("dbl({:?}f64)", d)),
            Value::Char(c) => Ok(format!("chr({:?})", c)),
            Value::Str(s) => Ok(format!("strv({:?})", s.as_str())),
            _ => {
                let key = print_value(arg, true);
                let init = self.emit_literal(arg)?;
                let slot = self.pool.intern(key, init);
                Ok(self.stmt(out, &format!("m.pool({})", slot)))
            }
        }
    }

    fn emit_literal(&mut self, v: &Value) -> Result<String, LispError> {
        match v {
            Value::Nil => Ok("Value::Nil".to_string()),
            Value::Long(n) => Ok(fmt_long(*n)),
            Value::Double(d) => Ok(format!("dbl({:?}f64)", d)),
            Value::Char(c) => Ok(format!("chr({:?})", c)),
            Value::Str(s) => Ok(format!("strv({:?})", s.as_str())),
            Value::Symbol(sym) => Ok(format!("sym(m, {:?})", sym.name())),
            Value::Cons(_) | Value::Slice(..) => {
                let mut items = Vec::new();
                let mut cursor = v.clone();
                let mut tail = Value::Nil;
                while cursor.is_cons() {
                    items.push(self.emit_literal(&list_car(&cursor))?);
                    let next = list_cdr(&cursor);
                    if !next.is_cons() && !next.is_nil() {
                        tail = next.clone();
                    }
                    cursor = next;
                }
                if tail.is_nil() {
                    Ok(format!("list_v(vec![{}])", items.join(", ")))
                } else {
                    let mut out = self.emit_literal(&tail)?;
                    for item in items.into_iter().rev() {
                        out = format!("cons_v({}, {})", item, out);
                    }
                    Ok(out)
                }
            }
            other => Err(LispError::internal(format!(
                "cannot emit a {} literal",
                other.type_name()
            ))),
        }
    }

    fn emit_progn_val(
        &mut self,
        body: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        let items =
            list_to_vec(body).ok_or_else(|| LispError::malformed("progn", "dotted body list"))?;
        let mut last = "Value::Nil".to_string();
        for item in &items {
            last = self.emit_val(item, scope, out)?;
        }
        Ok(last)
    }

    fn emit_cond_val(
        &mut self,
        clauses: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        if clauses.is_nil() {
            return Ok("Value::Nil".to_string());
        }
        let clause = list_car(clauses);
        let rest = list_cdr(clauses);
        if !clause.is_cons() {
            return Err(LispError::malformed("cond", "clause must be a list"));
        }
        let pred = list_car(&clause);
        let body = list_cdr(&clause);

        // A `t` predicate short-circuits to its body.
        if pred.as_symbol().is_some_and(|s| s == &self.m.st.wk.t) {
            if !rest.is_nil() {
                warn!(
                    "{}: cond clauses follow a default clause and are unreachable",
                    self.unit
                );
            }
            if body.is_nil() {
                return Ok(self.stmt(out, "m.t()"));
            }
            return self.emit_progn_val(&body, scope, out);
        }

        let pred_var = self.emit_val(&pred, scope, out)?;
        let result = self.fresh("__r");
        let mut taken_stmts = String::new();
        let taken_var = if body.is_nil() {
            pred_var.clone()
        } else {
            self.emit_progn_val(&body, scope, &mut taken_stmts)?
        };
        let mut rest_stmts = String::new();
        let rest_var = self.emit_cond_val(&rest, scope, &mut rest_stmts)?;
        let _ = write!(
            out,
            "let {r}; if truthy(&{c}) {{ {a}{r} = {av}; }} else {{ {b}{r} = {bv}; }} ",
            r = result,
            c = pred_var,
            a = taken_stmts,
            av = taken_var,
            b = rest_stmts,
            bv = rest_var
        );
        Ok(result)
    }

    fn emit_setq(
        &mut self,
        args: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        let items = list_to_vec(args)
            .ok_or_else(|| LispError::malformed("setq", "dotted argument list"))?;
        if items.is_empty() || items.len() % 2 != 0 {
            return Err(LispError::malformed("setq", "expected symbol/form pairs"));
        }
        let mut last = "Value::Nil".to_string();
        for pair in items.chunks(2) {
            let sym = pair[0]
                .as_symbol()
                .ok_or_else(|| LispError::malformed("setq", "target must be a symbol"))?;
            if sym.is_reserved() {
                return Err(LispError::malformed(
                    "setq",
                    format!("cannot bind reserved word '{}'", sym.name()),
                ));
            }
            let value = self.emit_val(&pair[1], scope, out)?;
            let lower = sym.name().to_lowercase();
            last = match lookup_scope(scope, &lower) {
                Some(var) => {
                    let rhs = format!("cell_set(&{}, {})", var, value);
                    self.stmt(out, &rhs)
                }
                None => {
                    self.note_global(&lower);
                    let rhs = format!("m.set_global({:?}, {})?", lower, value);
                    self.stmt(out, &rhs)
                }
            };
        }
        Ok(last)
    }

    // -----------------------------------------------------------------------
    // Lambdas and the trampoline
    // -----------------------------------------------------------------------

    fn parse_params(&self, v: &Value) -> Result<Params, LispError> {
        let mut params = Params {
            whole: None,
            fixed: Vec::new(),
            rest: None,
        };
        let check = |sym: &Symbol, seen: &mut BTreeSet<String>| -> Result<(), LispError> {
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
        };
        let mut seen = BTreeSet::new();
        match v {
            Value::Nil => Ok(params),
            Value::Symbol(sym) => {
                check(sym, &mut seen)?;
                params.whole = Some(sym.clone());
                Ok(params)
            }
            Value::Cons(_) => {
                let mut cursor = v.clone();
                let mut hops = 0usize;
                loop {
                    hops += 1;
                    if hops > 10_000 {
                        return Err(LispError::malformed("lambda", "circular parameter list"));
                    }
                    match cursor {
                        Value::Nil => return Ok(params),
                        Value::Symbol(sym) => {
                            check(&sym, &mut seen)?;
                            params.rest = Some(sym);
                            return Ok(params);
                        }
                        Value::Cons(_) => {
                            let head = list_car(&cursor);
                            let sym = head.as_symbol().ok_or_else(|| {
                                LispError::malformed("lambda", "parameter must be a symbol")
                            })?;
                            check(sym, &mut seen)?;
                            params.fixed.push(sym.clone());
                            cursor = list_cdr(&cursor);
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

    fn emit_lambda(
        &mut self,
        name: &str,
        params_and_body: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        if list_car(params_and_body)
            .as_symbol()
            .is_some_and(|s| s == &self.m.st.wk.dynamic)
        {
            return Err(LispError::malformed(
                "compile",
                "dynamic lambdas cannot be compiled; they need the caller's environment",
            ));
        }
        let params = self.parse_params(&list_car(params_and_body))?;
        let body = list_cdr(params_and_body);

        // Clone the captured cells this closure actually uses.
        let mut used = BTreeSet::new();
        collect_locals(&body, scope, &mut used);
        let mut clones = String::new();
        for (_, var) in &used {
            let _ = write!(clones, "let {} = {}.clone(); ", var, var);
        }

        let saved = scope.len();
        let mut binds = String::new();
        if let Some(whole) = &params.whole {
            let var = self.fresh_var(whole.name());
            let _ = write!(binds, "let {} = new_cell(all_args(&args)); ", var);
            scope.push((whole.name().to_lowercase(), var));
        } else {
            let fixed = params.fixed.len();
            let max = if params.rest.is_some() {
                "None".to_string()
            } else {
                format!("Some({})", fixed)
            };
            let _ = write!(binds, "expect_args({:?}, &args, {}, {})?; ", name, fixed, max);
            for (i, p) in params.fixed.iter().enumerate() {
                let var = self.fresh_var(p.name());
                let _ = write!(binds, "let {} = new_cell(arg(&args, {})); ", var, i);
                scope.push((p.name().to_lowercase(), var));
            }
            if let Some(rest) = &params.rest {
                let var = self.fresh_var(rest.name());
                let _ = write!(binds, "let {} = new_cell(rest_args(&args, {})); ", var, fixed);
                scope.push((rest.name().to_lowercase(), var));
            }
        }

        let mut stmts = String::new();
        self.emit_body_stmts(&body, scope, &mut stmts)?;
        scope.truncate(saved);

        // The body statements return on every path; the trailing expression
        // only satisfies the type checker.
        let rhs = format!(
            "{{ {}native({:?}, move |m: &mut Machine, args: Vec<Value>| -> StepResult {{ {}{} Ok(Step::Done(Value::Nil)) }}) }}",
            clones, name, binds, stmts
        );
        Ok(self.stmt(out, &rhs))
    }

    /// Lambda body: every form but the last for effect, the last in tail
    /// position.
    fn emit_body_stmts(
        &mut self,
        body: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<(), LispError> {
        let items =
            list_to_vec(body).ok_or_else(|| LispError::malformed("body", "dotted body list"))?;
        match items.split_last() {
            None => {
                out.push_str("return Ok(Step::Done(Value::Nil)); ");
                Ok(())
            }
            Some((last, init)) => {
                for form in init {
                    let value = self.emit_val(form, scope, out)?;
                    let _ = write!(out, "let _ = {}; ", value);
                }
                self.emit_tail(last, scope, out)
            }
        }
    }

    /// Emit `form` in tail position: statements ending in `return` on
    /// every path.
    fn emit_tail(
        &mut self,
        form: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<(), LispError> {
        if !form.is_cons() {
            let value = self.emit_val(form, scope, out)?;
            let _ = write!(out, "return Ok(Step::Done({})); ", value);
            return Ok(());
        }
        let op = list_car(form);
        let args = list_cdr(form);

        if let Some(opsym) = op.as_symbol() {
            match opsym.special_form() {
                Some(SpecialForm::If) => {
                    let items = list_to_vec(&args)
                        .ok_or_else(|| LispError::malformed("if", "dotted argument list"))?;
                    if items.len() < 2 || items.len() > 3 {
                        return Err(LispError::malformed("if", "expected (if test then [else])"));
                    }
                    let (test, negated) = self.unfold_null(&items[0]);
                    let test_var = self.emit_val(&test, scope, out)?;
                    let mut then_stmts = String::new();
                    self.emit_tail(&items[1], scope, &mut then_stmts)?;
                    let mut else_stmts = String::new();
                    match items.get(2) {
                        Some(e) => self.emit_tail(e, scope, &mut else_stmts)?,
                        None => else_stmts.push_str("return Ok(Step::Done(Value::Nil)); "),
                    }
                    let (a, b) = if negated {
                        (else_stmts, then_stmts)
                    } else {
                        (then_stmts, else_stmts)
                    };
                    let _ = write!(
                        out,
                        "if truthy(&{}) {{ {} }} else {{ {} }} ",
                        test_var, a, b
                    );
                    return Ok(());
                }
                Some(SpecialForm::Cond) => {
                    let mut cursor = args.clone();
                    while cursor.is_cons() {
                        let clause = list_car(&cursor);
                        cursor = list_cdr(&cursor);
                        if !clause.is_cons() {
                            return Err(LispError::malformed("cond", "clause must be a list"));
                        }
                        let pred = list_car(&clause);
                        let body = list_cdr(&clause);
                        if pred.as_symbol().is_some_and(|s| s == &self.m.st.wk.t) {
                            if !cursor.is_nil() {
                                warn!(
                                    "{}: cond clauses follow a default clause and are unreachable",
                                    self.unit
                                );
                            }
                            if body.is_nil() {
                                let tv = self.stmt(out, "m.t()");
                                let _ = write!(out, "return Ok(Step::Done({})); ", tv);
                            } else {
                                self.emit_body_stmts(&body, scope, out)?;
                            }
                            return Ok(());
                        }
                        let pred_var = self.emit_val(&pred, scope, out)?;
                        let _ = write!(out, "if truthy(&{}) {{ ", pred_var);
                        if body.is_nil() {
                            let _ = write!(out, "return Ok(Step::Done({})); ", pred_var);
                        } else {
                            self.emit_body_stmts(&body, scope, out)?;
                        }
                        out.push_str("} ");
                    }
                    out.push_str("return Ok(Step::Done(Value::Nil)); ");
                    return Ok(());
                }
                Some(SpecialForm::Progn) => {
                    return self.emit_body_stmts(&args, scope, out);
                }
                Some(SpecialForm::Let) | Some(SpecialForm::LetStar)
                | Some(SpecialForm::Letrec) => {
                    let kind = match opsym.special_form() {
                        Some(SpecialForm::Let) => LetKind::Let,
                        Some(SpecialForm::LetStar) => LetKind::LetStar,
                        _ => LetKind::Letrec,
                    };
                    return self.emit_let_tail(kind, &args, scope, out);
                }
                Some(SpecialForm::Labels) => {
                    let saved = scope.len();
                    out.push_str("{ ");
                    self.emit_labels_prelude(&args, scope, out)?;
                    self.emit_body_stmts(&list_cdr(&args), scope, out)?;
                    out.push_str("} ");
                    scope.truncate(saved);
                    return Ok(());
                }
                Some(_) => {
                    // quote, lambda, setq, load, …: plain values in tail
                    // position.
                    let value = self.emit_val(form, scope, out)?;
                    let _ = write!(out, "return Ok(Step::Done({})); ", value);
                    return Ok(());
                }
                None => {}
            }
        }

        if let Some(expanded) = self.try_macro(form)? {
            return self.emit_tail(&expanded, scope, out);
        }

        // Application in tail position.
        let argv = list_to_vec(&args)
            .ok_or_else(|| LispError::malformed("application", "dotted argument list"))?;
        if let Some(opsym) = op.as_symbol() {
            let lower = opsym.name().to_lowercase();
            let shadowed =
                lookup_scope(scope, &lower).is_some() || self.defined.contains_key(&lower);
            if !shadowed && crate::builtins::lookup_prim(&lower).is_some() {
                if lower == "apply" && argv.len() == 2 {
                    // The tail-call shape for apply: spread and retarget.
                    let f = self.emit_val(&argv[0], scope, out)?;
                    let spread_var = self.emit_val(&argv[1], scope, out)?;
                    let _ = write!(out, "return tail({}, spread(&{})?); ", f, spread_var);
                    return Ok(());
                }
                // Primitives are leaf calls.
                let value = self.emit_val(form, scope, out)?;
                let _ = write!(out, "return Ok(Step::Done({})); ", value);
                return Ok(());
            }
        }

        let f = self.emit_val(&op, scope, out)?;
        let mut rendered = Vec::with_capacity(argv.len());
        for arg in &argv {
            rendered.push(self.emit_val(arg, scope, out)?);
        }
        let _ = write!(out, "return tail({}, vec![{}]); ", f, rendered.join(", "));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // let family
    // -----------------------------------------------------------------------

    fn parse_let(&mut self, args: &Value) -> Result<LetShape, LispError> {
        let mut cursor = args.clone();
        let mut name = None;
        let mut dynamic = false;
        if let Value::Symbol(sym) = list_car(&cursor) {
            if sym == self.m.st.wk.dynamic {
                dynamic = true;
                cursor = list_cdr(&cursor);
            } else {
                if sym.is_reserved() {
                    return Err(LispError::malformed(
                        "let",
                        format!("cannot bind reserved word '{}'", sym.name()),
                    ));
                }
                name = Some(sym);
                cursor = list_cdr(&cursor);
            }
        }
        let entries = parse_binding_entries(&list_car(&cursor))?;
        Ok(LetShape {
            name,
            dynamic,
            entries,
            body: list_cdr(&cursor),
        })
    }

    fn emit_let_val(
        &mut self,
        kind: LetKind,
        args: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        let shape = self.parse_let(args)?;
        if shape.dynamic {
            return self.emit_dynamic_let(kind, &shape, scope, out);
        }
        if shape.name.is_some() {
            let (target, inits) = self.emit_named_let_prelude(kind, &shape, scope, out)?;
            let rhs = format!("funcall(m, {}, vec![{}])?", target, inits.join(", "));
            return Ok(self.stmt(out, &rhs));
        }
        let saved = scope.len();
        self.emit_let_prelude(kind, &shape.entries, scope, out)?;
        let result = self.emit_progn_val(&shape.body, scope, out);
        scope.truncate(saved);
        result
    }

    fn emit_let_tail(
        &mut self,
        kind: LetKind,
        args: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<(), LispError> {
        let shape = self.parse_let(args)?;
        if shape.dynamic {
            // The restore must run after the body, so the body is not a
            // tail position.
            let value = self.emit_dynamic_let(kind, &shape, scope, out)?;
            let _ = write!(out, "return Ok(Step::Done({})); ", value);
            return Ok(());
        }
        if shape.name.is_some() {
            let (target, inits) = self.emit_named_let_prelude(kind, &shape, scope, out)?;
            let _ = write!(out, "return tail({}, vec![{}]); ", target, inits.join(", "));
            return Ok(());
        }
        let saved = scope.len();
        out.push_str("{ ");
        self.emit_let_prelude(kind, &shape.entries, scope, out)?;
        self.emit_body_stmts(&shape.body, scope, out)?;
        out.push_str("} ");
        scope.truncate(saved);
        Ok(())
    }

    fn emit_let_prelude(
        &mut self,
        kind: LetKind,
        entries: &[(Symbol, Value)],
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<(), LispError> {
        match kind {
            LetKind::Let => {
                let mut temps = Vec::new();
                for (_, init) in entries {
                    temps.push(self.emit_val(init, scope, out)?);
                }
                for ((sym, _), tmp) in entries.iter().zip(temps) {
                    let var = self.fresh_var(sym.name());
                    let _ = write!(out, "let {} = new_cell({}); ", var, tmp);
                    scope.push((sym.name().to_lowercase(), var));
                }
            }
            LetKind::LetStar => {
                for (sym, init) in entries {
                    let value = self.emit_val(init, scope, out)?;
                    let var = self.fresh_var(sym.name());
                    let _ = write!(out, "let {} = new_cell({}); ", var, value);
                    scope.push((sym.name().to_lowercase(), var));
                }
            }
            LetKind::Letrec => {
                let mut vars = Vec::new();
                for (sym, _) in entries {
                    let var = self.fresh_var(sym.name());
                    let _ = write!(out, "let {} = new_cell(unassigned()); ", var);
                    scope.push((sym.name().to_lowercase(), var.clone()));
                    vars.push(var);
                }
                for ((_, init), var) in entries.iter().zip(vars) {
                    let value = self.emit_val(init, scope, out)?;
                    let _ = write!(out, "cell_set(&{}, {}); ", var, value);
                }
            }
        }
        Ok(())
    }

    /// Named let: emits the loop-closure prelude and returns the call
    /// target temporary plus the initial-value temporaries.
    fn emit_named_let_prelude(
        &mut self,
        kind: LetKind,
        shape: &LetShape,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<(String, Vec<String>), LispError> {
        let loop_sym = shape.name.clone().expect("named let");
        let saved = scope.len();

        // Initial values; sequential kinds bind as they go so later inits
        // see earlier ones.
        let mut init_vars = Vec::new();
        for (sym, init) in &shape.entries {
            let value = self.emit_val(init, scope, out)?;
            let tmp = self.stmt(out, &format!("{}.clone()", value));
            if !matches!(kind, LetKind::Let) {
                let var = self.fresh_var(sym.name());
                let _ = write!(out, "let {} = new_cell({}.clone()); ", var, tmp);
                scope.push((sym.name().to_lowercase(), var));
            }
            init_vars.push(tmp);
        }

        let loop_var = self.fresh_var(loop_sym.name());
        let _ = write!(out, "let {} = new_cell(unassigned()); ", loop_var);
        scope.push((loop_sym.name().to_lowercase(), loop_var.clone()));

        let params = Value::list(
            shape
                .entries
                .iter()
                .map(|(sym, _)| Value::Symbol(sym.clone()))
                .collect(),
        );
        let lambda = self.emit_lambda(
            loop_sym.name(),
            &Value::cons(params, shape.body.clone()),
            scope,
            out,
        )?;
        let _ = write!(out, "cell_set(&{}, {}); ", loop_var, lambda);
        scope.truncate(saved);

        let target = self.stmt(
            out,
            &format!("cell_get(&{}, {:?})?", loop_var, loop_sym.name()),
        );
        Ok((target, init_vars))
    }

    fn emit_labels_prelude(
        &mut self,
        args: &Value,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<(), LispError> {
        let defs = list_to_vec(&list_car(args))
            .ok_or_else(|| LispError::malformed("labels", "dotted definition list"))?;
        let mut cells = Vec::new();
        for def in &defs {
            if !def.is_cons() {
                return Err(LispError::malformed(
                    "labels",
                    "definition must be (name (params…) body…)",
                ));
            }
            let sym = list_car(def);
            let sym = sym
                .as_symbol()
                .ok_or_else(|| LispError::malformed("labels", "name must be a symbol"))?;
            if sym.is_reserved() {
                return Err(LispError::malformed(
                    "labels",
                    format!("cannot bind reserved word '{}'", sym.name()),
                ));
            }
            let var = self.fresh_var(sym.name());
            let _ = write!(out, "let {} = new_cell(unassigned()); ", var);
            scope.push((sym.name().to_lowercase(), var.clone()));
            cells.push((var, sym.clone(), list_cdr(def)));
        }
        for (var, sym, params_and_body) in cells {
            let lambda = self.emit_lambda(sym.name(), &params_and_body, scope, out)?;
            let _ = write!(out, "cell_set(&{}, {}); ", var, lambda);
        }
        Ok(())
    }

    /// Dynamic let: save-and-restore global slots around the body.
    fn emit_dynamic_let(
        &mut self,
        kind: LetKind,
        shape: &LetShape,
        scope: &mut Scope,
        out: &mut String,
    ) -> Result<String, LispError> {
        let base = self.stmt(out, "m.dynamic_base()");
        let mut inner = String::new();
        match kind {
            LetKind::Let => {
                let mut temps = Vec::new();
                for (_, init) in &shape.entries {
                    temps.push(self.emit_val(init, scope, &mut inner)?);
                }
                for ((sym, _), tmp) in shape.entries.iter().zip(temps) {
                    let _ = write!(
                        inner,
                        "m.dynamic_bind({:?}, {})?; ",
                        sym.name().to_lowercase(),
                        tmp
                    );
                }
            }
            LetKind::LetStar | LetKind::Letrec => {
                for (sym, init) in &shape.entries {
                    let value = self.emit_val(init, scope, &mut inner)?;
                    let _ = write!(
                        inner,
                        "m.dynamic_bind({:?}, {})?; ",
                        sym.name().to_lowercase(),
                        value
                    );
                }
            }
        }
        let mut body_stmts = String::new();
        let body_var = self.emit_progn_val(&shape.body, scope, &mut body_stmts)?;
        let result = self.fresh("__r");
        let _ = write!(
            out,
            "let {r} = (|| -> RtResult {{ {binds}{body}Ok({bv}) }})(); m.dynamic_unwind({base}); let {r} = {r}?; ",
            r = result,
            binds = inner,
            body = body_stmts,
            bv = body_var,
            base = base
        );
        Ok(result)
    }
}

fn lookup_scope(scope: &Scope, lower: &str) -> Option<String> {
    scope
        .iter()
        .rev()
        .find(|(name, _)| name == lower)
        .map(|(_, var)| var.clone())
}

fn parse_binding_entries(bindings: &Value) -> Result<Vec<(Symbol, Value)>, LispError> {
    let mut entries = Vec::new();
    if bindings.is_nil() {
        return Ok(entries);
    }
    let items = list_to_vec(bindings)
        .ok_or_else(|| LispError::malformed("let", "binding list must be a proper list"))?;
    for item in items {
        match &item {
            Value::Symbol(sym) => {
                if sym.is_reserved() {
                    return Err(LispError::malformed(
                        "let",
                        format!("cannot bind reserved word '{}'", sym.name()),
                    ));
                }
                entries.push((sym.clone(), Value::Nil));
            }
            Value::Cons(_) => {
                let parts = list_to_vec(&item)
                    .ok_or_else(|| LispError::malformed("let", "binding must be a proper list"))?;
                if parts.is_empty() || parts.len() > 2 {
                    return Err(LispError::malformed("let", "binding must be (symbol [form])"));
                }
                let sym = parts[0]
                    .as_symbol()
                    .ok_or_else(|| LispError::malformed("let", "binding name must be a symbol"))?;
                if sym.is_reserved() {
                    return Err(LispError::malformed(
                        "let",
                        format!("cannot bind reserved word '{}'", sym.name()),
                    ));
                }
                entries.push((sym.clone(), parts.get(1).cloned().unwrap_or(Value::Nil)));
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

/// Free locals referenced by `form` under `scope` (symbols inside `quote`
/// are data, not references).
fn collect_locals(form: &Value, scope: &Scope, out: &mut BTreeSet<(String, String)>) {
    match form {
        Value::Symbol(sym) => {
            let lower = sym.name().to_lowercase();
            if let Some(var) = lookup_scope(scope, &lower) {
                out.insert((lower, var));
            }
        }
        Value::Cons(_) => {
            let head = list_car(form);
            if head
                .as_symbol()
                .is_some_and(|s| s.special_form() == Some(SpecialForm::Quote))
            {
                return;
            }
            collect_locals(&head, scope, out);
            let mut cursor = list_cdr(form);
            while cursor.is_cons() {
                collect_locals(&list_car(&cursor), scope, out);
                cursor = list_cdr(&cursor);
            }
            if !cursor.is_nil() {
                collect_locals(&cursor, scope, out);
            }
        }
        _ => {}
    }
}

fn fmt_long(n: i64) -> String {
    if n == i64::MIN {
        "long(i64::MIN)".to_string()
    } else {
        format!("long({}i64)", n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn gen(src: &str) -> String {
        generate_source(src, "unit").unwrap_or_else(|e| panic!("{} failed: {}", src, e))
    }

    fn gen_err(src: &str) -> LispError {
        match generate_source(src, "unit") {
            Ok(out) => panic!("expected error, got:\n{}", out),
            Err(e) => e,
        }
    }

    #[test]
    fn program_shape() {
        let out = gen("(+ 1 2)");
        assert!(out.contains("pub struct Program"));
        assert!(out.contains("pub fn body(&mut self) -> RtResult"));
        assert!(out.contains("fn main()"));
        assert!(out.contains("use pika_core::rt::*;"));
    }

    #[test]
    fn literals_lower_directly() {
        let out = gen("42 2.5 #\\a \"s\"");
        assert!(out.contains("long(42i64)"));
        assert!(out.contains("dbl(2.5f64)"));
        assert!(out.contains("chr('a')"));
        assert!(out.contains("strv(\"s\")"));
    }

    #[test]
    fn quoted_literals_share_pool_slots() {
        let out = gen("'(1 2 3) '(1 2 3) '(4)");
        assert!(out.contains("m.pool(0)"));
        assert!(out.contains("m.pool(1)"));
        assert!(!out.contains("m.pool(2)"));
        // Exactly one initializer for the repeated literal.
        assert_eq!(out.matches("/* q0 */").count(), 1);
    }

    #[test]
    fn self_evaluating_quotes_skip_the_pool() {
        let out = gen("'1 '\"s\"");
        assert!(!out.contains("m.pool("));
    }

    #[test]
    fn defun_produces_trampolined_function() {
        let out = gen("(defun f (x) (f (1- x)))");
        assert!(out.contains("m.define_global(\"f\""));
        assert!(out.contains("native(\"f\""));
        // Self tail call uses the pending-call shape.
        assert!(out.contains("return tail("));
        // The decrement is an open-coded leaf call.
        assert!(out.contains("call_prim(m, \"1-\""));
    }

    #[test]
    fn non_tail_calls_drive_synchronously() {
        let out = gen("(defun g () 1) (defun f () (+ (g) 2))");
        assert!(out.contains("funcall(m"));
    }

    #[test]
    fn speed_zero_goes_through_the_environment() {
        let out = gen("(declaim (optimize (speed 0))) (+ 1 2)");
        assert!(out.contains("m.global_value(\"+\")?"));
        assert!(out.contains("funcall(m"));
        assert!(!out.contains("call_prim"));
    }

    #[test]
    fn if_null_unfolds() {
        let out = gen("(defun f (x) (if (null x) 'empty 'full))");
        // The null test disappears into a swapped branch pair.
        assert!(!out.contains("call_prim(m, \"null\""));
    }

    #[test]
    fn globals_are_lazy_slots() {
        let out = gen("(define a 1) (defun f () a)");
        assert!(out.contains("m.global_value(\"a\")?"));
    }

    #[test]
    fn locals_are_mangled_cells() {
        let out = gen("(defun f (first-arg) first-arg)");
        assert!(out.contains("_first_45_arg"));
        assert!(out.contains("new_cell(arg(&args, 0))"));
    }

    #[test]
    fn setq_distinguishes_local_and_global() {
        let out = gen("(define g 1) (defun f (x) (setq x 2 g 3))");
        assert!(out.contains("cell_set("));
        assert!(out.contains("m.set_global(\"g\""));
    }

    #[test]
    fn dynamic_let_saves_and_restores() {
        let out = gen(
            "(define *g* 1) (defun probe () *g*) (defun f () (let dynamic ((*g* 2)) (probe)))",
        );
        assert!(out.contains("m.dynamic_base()"));
        assert!(out.contains("m.dynamic_bind(\"*g*\""));
        assert!(out.contains("m.dynamic_unwind("));
    }

    #[test]
    fn macros_expand_at_generation_time() {
        let out = gen("(defmacro twice (x) `(+ ,x ,x)) (twice 21)");
        assert!(!out.contains("twice"));
        assert!(out.contains("call_prim(m, \"+\""));
    }

    #[test]
    fn macro_before_definition_fails() {
        let err = gen_err("(twice 21) (defmacro twice (x) `(+ ,x ,x))");
        assert!(err.message.contains("before its definition"), "{}", err);
    }

    #[test]
    fn duplicate_define_fails() {
        let err = gen_err("(define a 1) (define a 2)");
        assert!(err.message.contains("duplicate"), "{}", err);
    }

    #[test]
    fn undefined_symbols_fail_after_emission() {
        let err = gen_err("(defun f () (no-such-function 1))");
        assert_eq!(err.kind, ErrorKind::Malformed);
        assert!(err.message.contains("no-such-function"), "{}", err);
    }

    #[test]
    fn forward_references_between_defuns_are_fine() {
        let out = gen("(defun f () (g)) (defun g () 1)");
        assert!(out.contains("m.global_value(\"g\")?"));
    }

    #[test]
    fn require_in_expression_position_fails() {
        let err = gen_err("(defun f () (require x))");
        assert!(err.message.contains("top-level"), "{}", err);
    }

    #[test]
    fn dynamic_lambda_is_rejected() {
        let err = gen_err("(define f (lambda dynamic (x) x))");
        assert!(err.message.contains("dynamic"), "{}", err);
    }

    #[test]
    fn source_positions_appear_as_comments() {
        let out = gen("(+ 1\n 2)\n(+ 3 4)");
        assert!(out.contains("// 1:1"), "{}", out);
        assert!(out.contains("// 3:1"), "{}", out);
    }

    #[test]
    fn named_let_compiles_to_a_loop_closure() {
        let out = gen("(defun f (n) (let loop ((i 0)) (if (< i n) (loop (1+ i)) i)))");
        assert!(out.contains("new_cell(unassigned())"));
        assert!(out.contains("return tail("));
    }

    #[test]
    fn labels_compile_to_shared_cells() {
        let out = gen(
            "(labels ((even? (n) (if (= n 0) t (odd? (1- n)))) \
                      (odd? (n) (if (= n 0) nil (even? (1- n))))) \
               (even? 10))",
        );
        assert!(out.contains("new_cell(unassigned())"));
        assert!(out.contains("cell_set("));
    }

    #[test]
    fn progn_flattens_at_top_level() {
        let out = gen("(progn (define a 1) (+ a 1))");
        assert!(out.contains("m.define_global(\"a\""));
    }

    #[test]
    fn apply_in_tail_position_spreads() {
        let out = gen("(defun g (x) x) (defun f (l) (apply g l))");
        assert!(out.contains("spread(&"), "{}", out);
    }

    #[test]
    fn arity_mismatch_on_known_primitive_fails_at_generation() {
        let err = gen_err("(car 1 2)");
        assert_eq!(err.kind, ErrorKind::Arity);
    }

    #[test]
    fn generated_code_has_no_unbalanced_braces() {
        for src in [
            "(defun fib (n) (if (< n 2) n (+ (fib (1- n)) (fib (- n 2)))))",
            "(define x '(a b c)) (car x)",
            "(defun f (a . rest) (cons a rest))",
            "(defun g (x) (let* ((a x) (b (cons a a))) (cond ((null b) 'none) (t b))))",
            "(define *s* 1) (defun h () (let* dynamic ((*s* 2)) (cons *s* nil)))",
            "(labels ((even? (n) (if (= n 0) t (odd? (1- n)))) (odd? (n) (if (= n 0) nil (even? (1- n))))) (even? 10))",
        ] {
            let out = gen(src);
            let opens = out.matches('{').count();
            let closes = out.matches('}').count();
            assert_eq!(opens, closes, "unbalanced braces for {}:\n{}", src, out);
        }
    }
}
