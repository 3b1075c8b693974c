//! Read-time quasiquote expansion.
//!
//! Backquoted forms are rewritten into `quote`/`list`/`list*`/`cons`/
//! `append` construction forms as the reader produces them.  The expansion
//! is pattern-optimized: fully constant segments collapse into a single
//! `quote`, singleton builds merge into their neighbors, and a two-element
//! `list*` is emitted as `cons`.  Nested backquotes expand by expanding the
//! inner expansion.

use crate::error::{LispError, LispResult};
use crate::symbol::{Symbol, SymbolTable};
use crate::value::{list_car, list_cdr, list_to_vec, Value};

/// Expand one level of quasiquotation over `form`.
pub fn qq_expand(form: &Value, st: &SymbolTable) -> LispResult {
    match form {
        Value::Nil => Ok(Value::Nil),
        Value::Cons(_) => {
            let head = list_car(form);
            if is(&head, &st.wk.unquote) {
                return Ok(cadr(form));
            }
            if is(&head, &st.wk.unquote_splice) {
                return Err(LispError::reader("can't splice here", form.pos()));
            }
            if is(&head, &st.wk.quasiquote) {
                let inner = qq_expand(&cadr(form), st)?;
                return qq_expand(&inner, st);
            }
            let d = list_cdr(form);
            if d.is_nil() {
                qq_expand_list(&head, st)
            } else {
                let lhs = qq_expand_list(&head, st)?;
                let rhs = qq_expand(&d, st)?;
                Ok(optimized_append(lhs, rhs, st))
            }
        }
        atom => Ok(quote_atom(atom, st)),
    }
}

/// Expand one list element: the result is a form producing a *list* to be
/// appended (a singleton build for plain elements, the spliced expression
/// itself for `,@`).
fn qq_expand_list(form: &Value, st: &SymbolTable) -> LispResult {
    match form {
        Value::Cons(_) => {
            let head = list_car(form);
            if is(&head, &st.wk.unquote) {
                return Ok(list_of(&st.wk.list, vec![cadr(form)]));
            }
            if is(&head, &st.wk.unquote_splice) {
                let spliced = cadr(form);
                // A splice whose expression is itself an unquote marker
                // belongs to an outer backquote; keep its append semantics
                // alive for the next expansion round.
                if is_marker(&spliced, st) {
                    return Ok(list_of(&st.wk.append, vec![spliced]));
                }
                return Ok(spliced);
            }
            if is(&head, &st.wk.quasiquote) {
                let inner = qq_expand(&cadr(form), st)?;
                return qq_expand_list(&inner, st);
            }
            let expanded = qq_expand(form, st)?;
            Ok(list_of(&st.wk.list, vec![expanded]))
        }
        atom => Ok(quote_list1(atom, st)),
    }
}

/// `(append lhs rhs)` with pattern-driven simplification.
fn optimized_append(lhs: Value, rhs: Value, st: &SymbolTable) -> Value {
    if lhs.is_nil() {
        return rhs;
    }
    if rhs.is_nil() {
        return lhs;
    }

    // Raw unquote markers on the right must survive verbatim for the next
    // expansion round; only the plain append shape preserves them.
    if !is_marker(&rhs, st) {
        // Singleton on the left: (quote (x)) or (list x).
        let elem = match quote_singleton(&lhs, st) {
            Some(payload) => {
                if let Some(qp) = quote_payload(&rhs, st) {
                    // Both constant: fold into one quote.
                    return list_of(&st.wk.quote, vec![Value::cons(payload, qp)]);
                }
                Some(quote_atom(&payload, st))
            }
            None => list_singleton(&lhs, st),
        };
        if let Some(elem) = elem {
            if let Some(mut args) = tagged_args(&rhs, &st.wk.list) {
                args.insert(0, elem);
                return list_of(&st.wk.list, args);
            }
            if let Some(mut args) = tagged_args(&rhs, &st.wk.list_star) {
                args.insert(0, elem);
                return list_of(&st.wk.list_star, args);
            }
            if let Some(args) = tagged_args(&rhs, &st.wk.cons) {
                if args.len() == 2 {
                    let mut starred = vec![elem];
                    starred.extend(args);
                    return list_of(&st.wk.list_star, starred);
                }
            }
            return list_of(&st.wk.cons, vec![elem, rhs]);
        }
        if let Some(rhs_args) = tagged_args(&rhs, &st.wk.append) {
            let mut args = match tagged_args(&lhs, &st.wk.append) {
                Some(lhs_args) => lhs_args,
                None => vec![lhs],
            };
            args.extend(rhs_args);
            return list_of(&st.wk.append, args);
        }
        if let Some(args) = tagged_args(&rhs, &st.wk.list) {
            if args.len() == 1 {
                let single = list_of(
                    &st.wk.cons,
                    vec![args.into_iter().next().expect("one arg"), Value::Nil],
                );
                return list_of(&st.wk.append, vec![lhs, single]);
            }
        }
    }
    list_of(&st.wk.append, vec![lhs, rhs])
}

// ---------------------------------------------------------------------------
// Shape helpers
// ---------------------------------------------------------------------------

fn is(v: &Value, sym: &Symbol) -> bool {
    matches!(v, Value::Symbol(s) if s == sym)
}

fn cadr(form: &Value) -> Value {
    list_car(&list_cdr(form))
}

fn is_marker(v: &Value, st: &SymbolTable) -> bool {
    if !v.is_cons() {
        return false;
    }
    let head = list_car(v);
    is(&head, &st.wk.unquote) || is(&head, &st.wk.unquote_splice)
}

/// Quote wrapper for atoms: self-evaluating values stay bare.
fn quote_atom(v: &Value, st: &SymbolTable) -> Value {
    match v {
        Value::Nil | Value::Long(_) | Value::Double(_) | Value::Char(_) | Value::Str(_) => {
            v.clone()
        }
        _ => list_of(&st.wk.quote, vec![v.clone()]),
    }
}

/// `(quote (x))` — quoted singleton list of `x`.
fn quote_list1(v: &Value, st: &SymbolTable) -> Value {
    list_of(&st.wk.quote, vec![Value::cons(v.clone(), Value::Nil)])
}

/// Payload of `(quote p)`.
fn quote_payload(form: &Value, st: &SymbolTable) -> Option<Value> {
    if !form.is_cons() || !is(&list_car(form), &st.wk.quote) {
        return None;
    }
    Some(cadr(form))
}

/// The element of `(quote (x))` when the payload is a one-element list.
fn quote_singleton(form: &Value, st: &SymbolTable) -> Option<Value> {
    let payload = quote_payload(form, st)?;
    if payload.is_cons() && list_cdr(&payload).is_nil() {
        Some(list_car(&payload))
    } else {
        None
    }
}

/// The element of `(list x)`.
fn list_singleton(form: &Value, st: &SymbolTable) -> Option<Value> {
    let args = tagged_args(form, &st.wk.list)?;
    if args.len() == 1 {
        args.into_iter().next()
    } else {
        None
    }
}

/// Arguments of `(tag …)` when `form` is a proper list headed by `tag`.
fn tagged_args(form: &Value, tag: &Symbol) -> Option<Vec<Value>> {
    if !form.is_cons() || !is(&list_car(form), tag) {
        return None;
    }
    list_to_vec(&list_cdr(form))
}

fn list_of(head: &Symbol, args: Vec<Value>) -> Value {
    let mut items = vec![Value::Symbol(head.clone())];
    items.extend(args);
    Value::list(items)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::print::print_value;
    use crate::reader::read_one;
    use crate::symbol::SymbolTable;
    use crate::value::equal_value;

    fn expansion(text: &str) -> String {
        let mut st = SymbolTable::new();
        let form = read_one(text, &mut st).unwrap_or_else(|e| panic!("{}: {}", text, e));
        print_value(&form, true)
    }

    #[test]
    fn plain_backquote_is_quote() {
        assert_eq!(expansion("`aaa"), "(quote aaa)");
        assert_eq!(expansion("`'aaa"), "(quote (quote aaa))");
        assert_eq!(expansion("`(aaa bbb ccc)"), "(quote (aaa bbb ccc))");
        assert_eq!(expansion("`(aaa bbb . ccc)"), "(quote (aaa bbb . ccc))");
    }

    #[test]
    fn unquote_at_top() {
        assert_eq!(expansion("`,aaa"), "aaa");
    }

    #[test]
    fn unquoted_elements_build_lists() {
        assert_eq!(expansion("`(a ,nil)"), "(list (quote a) nil)");
        assert_eq!(expansion("`(1.0 2.0 3.0 ,a)"), "(list 1.0 2.0 3.0 a)");
    }

    #[test]
    fn spliced_nil_folds_away() {
        assert_eq!(expansion("`(a ,@nil)"), "(quote (a))");
    }

    #[test]
    fn splices_use_cons_and_append() {
        assert_eq!(expansion("`(a ,@l)"), "(cons (quote a) l)");
        assert_eq!(
            expansion("`(a ,@l b)"),
            "(cons (quote a) (append l (quote (b))))"
        );
        assert_eq!(expansion("`(a ,@(l))"), "(cons (quote a) (l))");
        assert_eq!(
            expansion("`(a ,@'(1 2) b)"),
            "(cons (quote a) (append (quote (1 2)) (quote (b))))"
        );
    }

    #[test]
    fn clhs_samples() {
        assert_eq!(
            expansion("`((,a b) ,c ,@d)"),
            "(list* (cons a (quote (b))) c d)"
        );
        assert_eq!(
            expansion("`((,a b) ,@d ,c)"),
            "(cons (cons a (quote (b))) (append d (cons c nil)))"
        );
        assert_eq!(
            expansion("`((1 2) ,a ,4 ,'five 6)"),
            "(list* (quote (1 2)) a 4 (quote five) (quote (6)))"
        );
    }

    #[test]
    fn multi_splice_appends() {
        assert_eq!(expansion("`(,@a ,@b ,@c ,@d)"), "(append a b c d)");
    }

    #[test]
    fn nested_backquotes() {
        assert_eq!(expansion("``a"), "(quote (quote a))");
        assert_eq!(
            expansion("``(foo ,@,@q)"),
            "(list (quote cons) (quote (quote foo)) (cons (quote append) q))"
        );
        assert_eq!(
            expansion("``(foo . ,,@q)"),
            "(list* (quote append) (list (quote quote) (quote (foo))) q)"
        );
        assert_eq!(
            expansion("``(foo ,,@q)"),
            "(list* (quote list) (quote (quote foo)) q)"
        );
        assert_eq!(expansion("``(,@,@q)"), "(cons (quote append) q)");
        assert_eq!(
            expansion("``(,@,@q ,@,@q)"),
            "(cons (quote append) (append q q))"
        );
        assert_eq!(
            expansion("``(,@,@q ,@,@q ,@,@q)"),
            "(cons (quote append) (append q q q))"
        );
        assert_eq!(
            expansion("``(,,@a ,,@b ,,@c ,,@d)"),
            "(cons (quote list) (append a b c d))"
        );
        assert_eq!(
            expansion("``(aaa ,bbb ,,ccc)"),
            "(list (quote list) (quote (quote aaa)) (quote bbb) ccc)"
        );
    }

    #[test]
    fn splice_outside_list_is_an_error() {
        let mut st = SymbolTable::new();
        let err = read_one("`,@b", &mut st).unwrap_err();
        assert!(err.message.contains("can't splice here"), "{}", err);
    }

    #[test]
    fn expansion_survives_reprint_and_reread() {
        // The expander output contains no backquote tokens, so printing it
        // and reading it back reproduces the same structure: expansion is a
        // fixpoint of the read step.
        let mut st = SymbolTable::new();
        for text in ["`(a ,@l b)", "`((,a b) ,c ,@d)", "`(1.0 2.0 ,x)", "``(foo ,@,@q)"] {
            let expanded = read_one(text, &mut st).unwrap();
            let printed = print_value(&expanded, true);
            let reread = read_one(&printed, &mut st).unwrap();
            assert!(
                equal_value(&expanded, &reread),
                "{} -> {} changed across reprint",
                text,
                printed
            );
        }
    }
}
