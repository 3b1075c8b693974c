//! The primitive registry and the list/predicate/equality/I-O/meta
//! primitives.
//!
//! Primitives receive already-evaluated arguments.  The registry is a
//! static table installed into the global environment at machine startup;
//! `eq` on primitives is pointer identity over the table entries.
//! Arithmetic lives in `numfns`, time in `timefns`, `format` in `format`.

use crate::error::{ErrorKind, LispError, LispResult};
use crate::eval::Machine;
use crate::numfns;
use crate::print::print_value;
use crate::timefns;
use crate::value::{
    self, eq_value, eql_value, equal_value, list_car, list_cdr, list_to_vec, ListBuilder, Value,
};

pub static PRIMS: &[crate::value::Prim] = &[
    // Lists
    prim("car", 1, Some(1), builtin_car),
    prim("cdr", 1, Some(1), builtin_cdr),
    prim("cons", 2, Some(2), builtin_cons),
    prim("rplaca", 2, Some(2), builtin_rplaca),
    prim("rplacd", 2, Some(2), builtin_rplacd),
    prim("list", 0, None, builtin_list),
    prim("list*", 1, None, builtin_list_star),
    prim("append", 0, None, builtin_append),
    prim("assoc", 2, Some(2), builtin_assoc),
    prim("assq", 2, Some(2), builtin_assq),
    prim("null", 1, Some(1), builtin_null),
    prim("not", 1, Some(1), builtin_null),
    prim("consp", 1, Some(1), builtin_consp),
    prim("listp", 1, Some(1), builtin_listp),
    prim("atom", 1, Some(1), builtin_atom),
    // Type predicates
    prim("symbolp", 1, Some(1), builtin_symbolp),
    prim("numberp", 1, Some(1), builtin_numberp),
    prim("integerp", 1, Some(1), builtin_integerp),
    prim("floatp", 1, Some(1), builtin_floatp),
    prim("stringp", 1, Some(1), builtin_stringp),
    prim("characterp", 1, Some(1), builtin_characterp),
    // Equality
    prim("eq", 2, Some(2), builtin_eq),
    prim("eql", 2, Some(2), builtin_eql),
    prim("equal", 2, Some(2), builtin_equal),
    // Arithmetic
    prim("+", 0, None, numfns::builtin_add),
    prim("-", 1, None, numfns::builtin_sub),
    prim("*", 0, None, numfns::builtin_mul),
    prim("/", 1, None, numfns::builtin_div),
    prim("=", 1, None, numfns::builtin_num_eq),
    prim("/=", 1, None, numfns::builtin_num_ne),
    prim("<", 1, None, numfns::builtin_lt),
    prim("<=", 1, None, numfns::builtin_le),
    prim(">", 1, None, numfns::builtin_gt),
    prim(">=", 1, None, numfns::builtin_ge),
    prim("1+", 1, Some(1), numfns::builtin_inc),
    prim("1-", 1, Some(1), numfns::builtin_dec),
    prim("mod", 2, Some(2), numfns::builtin_mod),
    prim("rem", 2, Some(2), numfns::builtin_rem),
    prim("signum", 1, Some(1), numfns::builtin_signum),
    prim("sqrt", 1, Some(1), numfns::builtin_sqrt),
    prim("log", 1, Some(1), numfns::builtin_log),
    prim("log10", 1, Some(1), numfns::builtin_log10),
    prim("exp", 1, Some(1), numfns::builtin_exp),
    prim("expt", 2, Some(2), numfns::builtin_expt),
    prim("round", 1, Some(2), numfns::builtin_round),
    prim("floor", 1, Some(2), numfns::builtin_floor),
    prim("ceiling", 1, Some(2), numfns::builtin_ceiling),
    prim("truncate", 1, Some(2), numfns::builtin_truncate),
    prim("fround", 1, Some(2), numfns::builtin_fround),
    prim("ffloor", 1, Some(2), numfns::builtin_ffloor),
    prim("fceiling", 1, Some(2), numfns::builtin_fceiling),
    prim("ftruncate", 1, Some(2), numfns::builtin_ftruncate),
    // I/O
    prim("read", 0, Some(0), builtin_read),
    prim("write", 1, Some(2), builtin_write),
    prim("writeln", 1, Some(2), builtin_writeln),
    prim("lnwrite", 1, Some(2), builtin_lnwrite),
    // Strings and characters
    prim("string=", 2, Some(2), builtin_string_eq),
    prim("string->list", 1, Some(1), builtin_string_to_list),
    prim("list->string", 1, Some(1), builtin_list_to_string),
    prim("char-code", 1, Some(1), builtin_char_code),
    prim("code-char", 1, Some(1), builtin_code_char),
    prim("format", 2, None, crate::format::builtin_format),
    prim("format-locale", 3, None, crate::format::builtin_format_locale),
    // Control / meta
    prim("apply", 2, Some(2), builtin_apply),
    prim("eval", 1, Some(1), builtin_eval),
    prim("trace", 0, None, builtin_trace),
    prim("untrace", 0, None, builtin_untrace),
    prim("macroexpand-1", 1, Some(1), builtin_macroexpand_1),
    prim("gensym", 0, Some(0), builtin_gensym),
    prim("fatal", 1, Some(1), builtin_fatal),
    // Time
    prim("get-internal-real-time", 0, Some(0), timefns::builtin_real_time),
    prim("get-internal-run-time", 0, Some(0), timefns::builtin_run_time),
    prim("get-internal-cpu-time", 0, Some(0), timefns::builtin_cpu_time),
    prim("sleep", 1, Some(1), timefns::builtin_sleep),
    prim("get-universal-time", 0, Some(0), timefns::builtin_universal_time),
    prim("get-decoded-time", 0, Some(0), timefns::builtin_decoded_time),
];

const fn prim(
    name: &'static str,
    min_args: usize,
    max_args: Option<usize>,
    f: crate::value::PrimFn,
) -> crate::value::Prim {
    crate::value::Prim {
        name,
        min_args,
        max_args,
        f,
    }
}

/// Bind every primitive into the machine's global environment.
pub fn install(m: &mut Machine) {
    for p in PRIMS {
        m.define_global(p.name, Value::Prim(p));
    }
}

/// Registry lookup by name (used by the code generator).
pub fn lookup_prim(name: &str) -> Option<&'static crate::value::Prim> {
    PRIMS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

pub fn check_arity(p: &crate::value::Prim, got: usize) -> Result<(), LispError> {
    if got < p.min_args || p.max_args.is_some_and(|max| got > max) {
        Err(LispError::arity(p.name, got))
    } else {
        Ok(())
    }
}

/// Open-coded fast paths for `speed >= 1`.  Returns `None` (the
/// fall-through sentinel) for every case the fast path does not handle;
/// results must be indistinguishable from the general registry path.
pub fn open_code(m: &mut Machine, p: &crate::value::Prim, args: &[Value]) -> Option<LispResult> {
    match p.name {
        "car" => Some(value::car(&args[0])),
        "cdr" => Some(value::cdr(&args[0])),
        "cons" => Some(Ok(Value::cons(args[0].clone(), args[1].clone()))),
        "eq" => Some(Ok(m.truth(eq_value(&args[0], &args[1])))),
        "eql" => Some(Ok(m.truth(eql_value(&args[0], &args[1])))),
        "null" | "not" => Some(Ok(m.truth(args[0].is_nil()))),
        "atom" => Some(Ok(m.truth(args[0].is_atom()))),
        "1+" => Some(numfns::inc_value(&args[0], 1)),
        "1-" => Some(numfns::inc_value(&args[0], -1)),
        "+" => Some(numfns::fold_add(args)),
        "-" => Some(numfns::fold_sub(args)),
        "*" => Some(numfns::fold_mul(args)),
        "/" => Some(numfns::fold_div(args)),
        "=" | "/=" | "<" | "<=" | ">" | ">=" => Some(numfns::compare(m, p.name, args)),
        "append" => Some(append_values(args)),
        "list" => Some(Ok(Value::list(args.to_vec()))),
        "list*" => Some(list_star_values(args)),
        "mod" => Some(numfns::mod_values(&args[0], &args[1])),
        "rem" => Some(numfns::rem_values(&args[0], &args[1])),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

fn builtin_car(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    value::car(&args[0])
}

fn builtin_cdr(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    value::cdr(&args[0])
}

fn builtin_cons(_m: &mut Machine, mut args: Vec<Value>) -> LispResult {
    let cdr = args.pop().expect("two args");
    let car = args.pop().expect("two args");
    Ok(Value::cons(car, cdr))
}

fn builtin_rplaca(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    let cell = args[0]
        .as_cons()
        .ok_or_else(|| LispError::type_error("cons", &args[0]))?;
    cell.lock().expect("poisoned").car = args[1].clone();
    Ok(args[0].clone())
}

fn builtin_rplacd(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    let cell = args[0]
        .as_cons()
        .ok_or_else(|| LispError::type_error("cons", &args[0]))?;
    cell.lock().expect("poisoned").cdr = args[1].clone();
    Ok(args[0].clone())
}

fn builtin_list(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(Value::list(args))
}

pub fn list_star_values(args: &[Value]) -> LispResult {
    let (last, init) = args.split_last().expect("at least one arg");
    let mut builder = ListBuilder::new();
    for v in init {
        builder.push(v.clone());
    }
    builder.set_tail(last.clone());
    Ok(builder.build())
}

fn builtin_list_star(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    list_star_values(&args)
}

pub fn append_values(args: &[Value]) -> LispResult {
    let Some((last, init)) = args.split_last() else {
        return Ok(Value::Nil);
    };
    let mut builder = ListBuilder::new();
    for v in init {
        if v.is_nil() {
            continue;
        }
        let items =
            list_to_vec(v).ok_or_else(|| LispError::type_error("proper list", v))?;
        for item in items {
            builder.push(item);
        }
    }
    builder.set_tail(last.clone());
    Ok(builder.build())
}

fn builtin_append(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    append_values(&args)
}

fn assoc_by(key: &Value, alist: &Value, pred: impl Fn(&Value, &Value) -> bool) -> LispResult {
    let mut cursor = alist.clone();
    while cursor.is_cons() {
        let entry = list_car(&cursor);
        if entry.is_cons() && pred(key, &list_car(&entry)) {
            return Ok(entry);
        }
        cursor = list_cdr(&cursor);
    }
    Ok(Value::Nil)
}

fn builtin_assoc(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    // eql plus string content equality.
    assoc_by(&args[0], &args[1], |a, b| {
        eql_value(a, b)
            || matches!((a, b), (Value::Str(x), Value::Str(y)) if **x == **y)
    })
}

fn builtin_assq(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    assoc_by(&args[0], &args[1], eq_value)
}

fn builtin_null(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(args[0].is_nil()))
}

fn builtin_consp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(args[0].is_cons()))
}

fn builtin_listp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(args[0].is_list()))
}

fn builtin_atom(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(args[0].is_atom()))
}

// ---------------------------------------------------------------------------
// Type predicates
// ---------------------------------------------------------------------------

fn builtin_symbolp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(args[0].is_symbol()))
}

fn builtin_numberp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(args[0].is_number()))
}

fn builtin_integerp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(matches!(args[0], Value::Long(_))))
}

fn builtin_floatp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(matches!(args[0], Value::Double(_))))
}

fn builtin_stringp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(matches!(args[0], Value::Str(_))))
}

fn builtin_characterp(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(matches!(args[0], Value::Char(_))))
}

// ---------------------------------------------------------------------------
// Equality
// ---------------------------------------------------------------------------

fn builtin_eq(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(eq_value(&args[0], &args[1])))
}

fn builtin_eql(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(eql_value(&args[0], &args[1])))
}

fn builtin_equal(m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(m.truth(equal_value(&args[0], &args[1])))
}

// ---------------------------------------------------------------------------
// I/O
// ---------------------------------------------------------------------------

fn escape_flag(args: &[Value]) -> bool {
    match args.get(1) {
        None => true,
        Some(v) => v.is_truthy(),
    }
}

fn builtin_read(m: &mut Machine, _args: Vec<Value>) -> LispResult {
    m.read_from_input()
}

fn builtin_write(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let text = print_value(&args[0], escape_flag(&args));
    m.write_out(&text)?;
    Ok(m.t())
}

fn builtin_writeln(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let mut text = print_value(&args[0], escape_flag(&args));
    text.push('\n');
    m.write_out(&text)?;
    Ok(m.t())
}

fn builtin_lnwrite(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let text = format!("\n{} ", print_value(&args[0], escape_flag(&args)));
    m.write_out(&text)?;
    Ok(m.t())
}

// ---------------------------------------------------------------------------
// Strings and characters
// ---------------------------------------------------------------------------

fn string_content(v: &Value) -> Result<String, LispError> {
    match v {
        Value::Str(s) => Ok((**s).clone()),
        Value::Symbol(sym) => Ok(sym.name().to_string()),
        Value::Char(c) => Ok(c.to_string()),
        other => Err(LispError::type_error("string", other)),
    }
}

fn builtin_string_eq(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let a = string_content(&args[0])?;
    let b = string_content(&args[1])?;
    Ok(m.truth(a == b))
}

fn builtin_string_to_list(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    let s = args[0]
        .as_str()
        .ok_or_else(|| LispError::type_error("string", &args[0]))?;
    Ok(Value::list(s.chars().map(Value::Char).collect()))
}

fn builtin_list_to_string(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    let items = list_to_vec(&args[0])
        .ok_or_else(|| LispError::type_error("proper list", &args[0]))?;
    let mut s = String::with_capacity(items.len());
    for item in items {
        match item {
            Value::Char(c) => s.push(c),
            other => return Err(LispError::type_error("character", &other)),
        }
    }
    Ok(Value::string(s))
}

fn builtin_char_code(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    match &args[0] {
        Value::Char(c) => Ok(Value::Long(*c as i64)),
        other => Err(LispError::type_error("character", other)),
    }
}

fn builtin_code_char(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    let code = args[0]
        .as_long()
        .ok_or_else(|| LispError::type_error("integer", &args[0]))?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(Value::Char)
        .ok_or_else(|| LispError::arithmetic(format!("invalid character code {}", code)))
}

// ---------------------------------------------------------------------------
// Control / meta
// ---------------------------------------------------------------------------

fn builtin_apply(m: &mut Machine, mut args: Vec<Value>) -> LispResult {
    let spread = list_to_vec(&args[1])
        .ok_or_else(|| LispError::type_error("proper list", &args[1]))?;
    let target = args.remove(0);
    m.apply_values(target, spread)
}

fn builtin_eval(m: &mut Machine, args: Vec<Value>) -> LispResult {
    m.eval_top(&args[0])
}

fn symbol_names(args: &[Value]) -> Result<Vec<String>, LispError> {
    args.iter()
        .map(|v| {
            v.as_symbol()
                .map(|s| s.name().to_string())
                .ok_or_else(|| LispError::type_error("symbol", v))
        })
        .collect()
}

fn builtin_trace(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let names = symbol_names(&args)?;
    Ok(m.trace_symbols(&names, true))
}

fn builtin_untrace(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let names = symbol_names(&args)?;
    Ok(m.trace_symbols(&names, false))
}

fn builtin_macroexpand_1(m: &mut Machine, args: Vec<Value>) -> LispResult {
    m.macroexpand_1(&args[0])
}

fn builtin_gensym(m: &mut Machine, _args: Vec<Value>) -> LispResult {
    Ok(Value::Symbol(m.gensym()))
}

fn builtin_fatal(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    Err(LispError::new(
        ErrorKind::Internal,
        format!("fatal: {}", print_value(&args[0], false)),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
