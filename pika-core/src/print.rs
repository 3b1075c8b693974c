//! Value printing.
//!
//! `print_value(v, true)` prints with escapes (read-back syntax: quoted
//! strings, `#\` characters, `|…|` symbols where needed); `false` prints
//! raw atom content ("princ style").  Self-referential cons graphs are
//! detected and rendered with a circular marker instead of looping.

use std::collections::HashSet;
use std::sync::Arc;

use crate::reader::char_name;
use crate::value::Value;

const CIRCULAR: &str = "#<circular>";

pub fn print_value(value: &Value, escape: bool) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();
    print_rec(value, escape, &mut out, &mut seen);
    out
}

fn print_rec(value: &Value, escape: bool, out: &mut String, seen: &mut HashSet<usize>) {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Unassigned => out.push_str("#<unassigned>"),
        Value::Symbol(sym) => {
            if escape {
                out.push_str(&format_symbol_name(sym.name()));
            } else {
                out.push_str(sym.name());
            }
        }
        Value::Long(n) => out.push_str(&n.to_string()),
        Value::Double(d) => out.push_str(&format_double(*d)),
        Value::Char(c) => {
            if escape {
                out.push_str(&format_char(*c));
            } else {
                out.push(*c);
            }
        }
        Value::Str(s) => {
            if escape {
                out.push_str(&format_string(s));
            } else {
                out.push_str(s);
            }
        }
        Value::Prim(p) => {
            out.push_str("#<primitive ");
            out.push_str(p.name);
            out.push('>');
        }
        Value::Native(n) => {
            out.push_str("#<function ");
            out.push_str(&n.name);
            out.push('>');
        }
        Value::Cons(_) | Value::Slice(..) => print_list(value, escape, out, seen),
    }
}

fn print_list(value: &Value, escape: bool, out: &mut String, seen: &mut HashSet<usize>) {
    out.push('(');
    let mut cursor = value.clone();
    let mut opened: Vec<usize> = Vec::new();
    let mut first = true;
    loop {
        match cursor {
            Value::Cons(cell) => {
                let key = Arc::as_ptr(&cell) as usize;
                if !seen.insert(key) {
                    if !first {
                        out.push(' ');
                    }
                    out.push_str(CIRCULAR);
                    break;
                }
                opened.push(key);
                if !first {
                    out.push(' ');
                }
                let (car, cdr) = {
                    let pair = cell.lock().expect("poisoned");
                    (pair.car.clone(), pair.cdr.clone())
                };
                print_rec(&car, escape, out, seen);
                cursor = cdr;
                first = false;
            }
            Value::Slice(vec, i) if i < vec.len() => {
                if !first {
                    out.push(' ');
                }
                print_rec(&vec[i], escape, out, seen);
                cursor = Value::slice(vec, i + 1);
                first = false;
            }
            Value::Nil | Value::Slice(..) => break,
            other => {
                out.push_str(" . ");
                print_rec(&other, escape, out, seen);
                break;
            }
        }
    }
    for key in opened {
        seen.remove(&key);
    }
    out.push(')');
}

// ---------------------------------------------------------------------------
// Atom formatting
// ---------------------------------------------------------------------------

fn format_double(d: f64) -> String {
    if d.is_nan() {
        return "NaN".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if d.fract() == 0.0 && d.abs() < 1e17 {
        format!("{:.1}", d)
    } else {
        format!("{}", d)
    }
}

fn format_char(c: char) -> String {
    match char_name(c) {
        Some(name) => format!("#\\{}", name),
        None => format!("#\\{}", c),
    }
}

fn format_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Symbols whose names would not read back as one token are printed inside
/// vertical bars, with embedded bars and backslashes escaped.
fn format_symbol_name(name: &str) -> String {
    if !needs_bars(name) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len() + 2);
    out.push('|');
    for c in name.chars() {
        if c == '|' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('|');
    out
}

fn needs_bars(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || "()'`,;\"|\\#".contains(c))
    {
        return true;
    }
    // A name that reads as a number or as the dot token must be escaped.
    name == "." || crate::reader::looks_numeric(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;
    use crate::value::ConsCell;
    use std::sync::Mutex;

    fn sym(st: &mut SymbolTable, name: &str) -> Value {
        Value::Symbol(st.intern(name))
    }

    #[test]
    fn print_atoms() {
        assert_eq!(print_value(&Value::Nil, true), "nil");
        assert_eq!(print_value(&Value::Long(42), true), "42");
        assert_eq!(print_value(&Value::Double(126.0), true), "126.0");
        assert_eq!(print_value(&Value::Double(3.25), true), "3.25");
        assert_eq!(print_value(&Value::string("hi"), true), "\"hi\"");
        assert_eq!(print_value(&Value::string("hi"), false), "hi");
    }

    #[test]
    fn print_chars() {
        assert_eq!(print_value(&Value::Char('a'), true), "#\\a");
        assert_eq!(print_value(&Value::Char(' '), true), "#\\Space");
        assert_eq!(print_value(&Value::Char('\n'), true), "#\\Newline");
        assert_eq!(print_value(&Value::Char('x'), false), "x");
    }

    #[test]
    fn print_lists() {
        let mut st = SymbolTable::new();
        let l = Value::list(vec![sym(&mut st, "a"), Value::Long(1), Value::Long(2)]);
        assert_eq!(print_value(&l, true), "(a 1 2)");

        let dotted = Value::cons(Value::Long(1), Value::Long(2));
        assert_eq!(print_value(&dotted, true), "(1 . 2)");
    }

    #[test]
    fn print_symbol_escapes() {
        let mut st = SymbolTable::new();
        assert_eq!(print_value(&sym(&mut st, "foo"), true), "foo");
        assert_eq!(print_value(&sym(&mut st, "a b"), true), "|a b|");
        assert_eq!(print_value(&sym(&mut st, "12x"), true), "12x");
        assert_eq!(print_value(&sym(&mut st, "123"), true), "|123|");
        assert_eq!(print_value(&sym(&mut st, "has|bar"), true), "|has\\|bar|");
        assert_eq!(print_value(&sym(&mut st, "a b"), false), "a b");
    }

    #[test]
    fn circular_cdr_chain_is_marked() {
        let cell = Arc::new(Mutex::new(ConsCell::new(Value::Long(1), Value::Nil)));
        let list = Value::Cons(cell.clone());
        cell.lock().unwrap().cdr = list.clone();
        let printed = print_value(&list, true);
        assert!(printed.contains(CIRCULAR), "got {}", printed);
    }

    #[test]
    fn circular_car_is_marked() {
        let cell = Arc::new(Mutex::new(ConsCell::new(Value::Nil, Value::Nil)));
        let list = Value::Cons(cell.clone());
        cell.lock().unwrap().car = list.clone();
        let printed = print_value(&list, true);
        assert!(printed.contains(CIRCULAR), "got {}", printed);
    }

    #[test]
    fn shared_but_acyclic_structure_prints_fully() {
        let shared = Value::list(vec![Value::Long(1)]);
        let both = Value::list(vec![shared.clone(), shared]);
        assert_eq!(print_value(&both, true), "((1) (1))");
    }

    #[test]
    fn slices_print_as_lists() {
        let backing = Arc::new(vec![Value::Long(1), Value::Long(2)]);
        assert_eq!(print_value(&Value::slice(backing, 0), true), "(1 2)");
    }
}
