//! Symbol interning and the reserved-word registry.
//!
//! Symbols are interned case-insensitively: two spellings that differ only
//! in case intern to the same object, and `eq` on symbols is pointer
//! identity.  The spelling of the first intern wins.  Reserved words carry
//! their `SpecialForm` tag on the symbol itself so the evaluator dispatches
//! on the tag, never on the name string.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Special forms recognized by the evaluator and the code generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialForm {
    Quote,
    Lambda,
    Cond,
    Labels,
    If,
    Define,
    Defun,
    Defmacro,
    Let,
    LetStar,
    Letrec,
    Progn,
    Setq,
    Load,
    Require,
    Provide,
    Declaim,
}

#[derive(Debug)]
pub struct SymbolData {
    name: String,
    special: Option<SpecialForm>,
    reserved: bool,
}

/// An interned symbol.  Cheap to clone; equality is pointer identity.
#[derive(Clone)]
pub struct Symbol(Arc<SymbolData>);

impl Symbol {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn special_form(&self) -> Option<SpecialForm> {
        self.0.special
    }

    /// Reserved words are forbidden as binding targets.
    pub fn is_reserved(&self) -> bool {
        self.0.reserved
    }

    /// An uninterned symbol, never `eq` to anything else (gensym).
    pub fn uninterned(name: impl Into<String>) -> Symbol {
        Symbol(Arc::new(SymbolData {
            name: name.into(),
            special: None,
            reserved: false,
        }))
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0.name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// Symbols the reader and evaluator need at hand without a table lookup.
pub struct WellKnown {
    pub t: Symbol,
    pub dynamic: Symbol,
    pub quote: Symbol,
    pub lambda: Symbol,
    pub quasiquote: Symbol,
    pub unquote: Symbol,
    pub unquote_splice: Symbol,
    pub list: Symbol,
    pub list_star: Symbol,
    pub append: Symbol,
    pub cons: Symbol,
}

/// The interning table.  Owns every symbol for the process lifetime.
/// Reader string literals intern here too, so two occurrences of the same
/// literal are one allocation.
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
    strings: HashMap<String, Arc<String>>,
    pub wk: WellKnown,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

const SPECIAL_FORMS: &[(&str, SpecialForm)] = &[
    ("quote", SpecialForm::Quote),
    ("lambda", SpecialForm::Lambda),
    ("cond", SpecialForm::Cond),
    ("labels", SpecialForm::Labels),
    ("if", SpecialForm::If),
    ("define", SpecialForm::Define),
    ("defun", SpecialForm::Defun),
    ("defmacro", SpecialForm::Defmacro),
    ("let", SpecialForm::Let),
    ("let*", SpecialForm::LetStar),
    ("letrec", SpecialForm::Letrec),
    ("progn", SpecialForm::Progn),
    ("setq", SpecialForm::Setq),
    ("load", SpecialForm::Load),
    ("require", SpecialForm::Require),
    ("provide", SpecialForm::Provide),
    ("declaim", SpecialForm::Declaim),
];

impl SymbolTable {
    pub fn new() -> Self {
        let mut symbols = HashMap::new();

        for (name, form) in SPECIAL_FORMS {
            let sym = Symbol(Arc::new(SymbolData {
                name: (*name).to_string(),
                special: Some(*form),
                reserved: true,
            }));
            symbols.insert((*name).to_string(), sym);
        }
        // Reserved, but not special-form heads.
        for name in ["nil", "t", "dynamic"] {
            let sym = Symbol(Arc::new(SymbolData {
                name: name.to_string(),
                special: None,
                reserved: true,
            }));
            symbols.insert(name.to_string(), sym);
        }

        let mut table = SymbolTable {
            wk: WellKnown {
                t: symbols["t"].clone(),
                dynamic: symbols["dynamic"].clone(),
                quote: symbols["quote"].clone(),
                lambda: symbols["lambda"].clone(),
                // placeholders, re-interned below
                quasiquote: Symbol::uninterned(""),
                unquote: Symbol::uninterned(""),
                unquote_splice: Symbol::uninterned(""),
                list: Symbol::uninterned(""),
                list_star: Symbol::uninterned(""),
                append: Symbol::uninterned(""),
                cons: Symbol::uninterned(""),
            },
            symbols,
            strings: HashMap::new(),
        };

        table.wk.quasiquote = table.intern("quasiquote");
        table.wk.unquote = table.intern("unquote");
        table.wk.unquote_splice = table.intern("unquote-splice");
        table.wk.list = table.intern("list");
        table.wk.list_star = table.intern("list*");
        table.wk.append = table.intern("append");
        table.wk.cons = table.intern("cons");
        table
    }

    /// Look up or create the symbol named `name`, case-insensitively.
    pub fn intern(&mut self, name: &str) -> Symbol {
        let key = name.to_lowercase();
        if let Some(sym) = self.symbols.get(&key) {
            return sym.clone();
        }
        let sym = Symbol(Arc::new(SymbolData {
            name: name.to_string(),
            special: None,
            reserved: false,
        }));
        self.symbols.insert(key, sym.clone());
        sym
    }

    /// Look up without creating.
    pub fn intern_soft(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(&name.to_lowercase()).cloned()
    }

    /// Intern a reader string literal (case-sensitive, content-keyed).
    pub fn intern_string(&mut self, content: String) -> Arc<String> {
        if let Some(existing) = self.strings.get(&content) {
            return existing.clone();
        }
        let shared = Arc::new(content.clone());
        self.strings.insert(content, shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_case_insensitive_identity() {
        let mut st = SymbolTable::new();
        let a = st.intern("Foo-Bar");
        let b = st.intern("foo-bar");
        let c = st.intern("FOO-BAR");
        assert_eq!(a, b);
        assert_eq!(b, c);
        // First spelling wins.
        assert_eq!(a.name(), "Foo-Bar");
    }

    #[test]
    fn distinct_names_are_distinct_symbols() {
        let mut st = SymbolTable::new();
        let a = st.intern("foo");
        let b = st.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn reserved_words_carry_special_form_tags() {
        let mut st = SymbolTable::new();
        assert_eq!(st.intern("QUOTE").special_form(), Some(SpecialForm::Quote));
        assert_eq!(st.intern("let*").special_form(), Some(SpecialForm::LetStar));
        assert!(st.intern("lambda").is_reserved());
        assert!(st.intern("t").is_reserved());
        assert!(st.intern("dynamic").is_reserved());
        assert!(st.intern("t").special_form().is_none());
        assert!(!st.intern("frobnicate").is_reserved());
    }

    #[test]
    fn uninterned_symbols_are_never_eq() {
        let mut st = SymbolTable::new();
        let interned = st.intern("g1");
        let fresh = Symbol::uninterned("g1");
        let fresh2 = Symbol::uninterned("g1");
        assert_ne!(interned, fresh);
        assert_ne!(fresh, fresh2);
    }

    #[test]
    fn string_literals_intern_by_content() {
        let mut st = SymbolTable::new();
        let a = st.intern_string("hello".to_string());
        let b = st.intern_string("hello".to_string());
        let c = st.intern_string("Hello".to_string());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn well_known_symbols_match_interned() {
        let mut st = SymbolTable::new();
        let q = st.intern("quasiquote");
        assert_eq!(q, st.wk.quasiquote.clone());
        let ls = st.intern("list*");
        assert_eq!(ls, st.wk.list_star.clone());
    }
}
