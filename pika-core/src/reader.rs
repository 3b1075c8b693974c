//! S-expression reader.
//!
//! Tokenizes a character source and parses forms, applying quote and
//! quasiquote rewriting, reader macros (`#\`, `#|…|#`, `#'`, `#+`/`#-`,
//! `#b`/`#o`/`#x`), and feature-expression filtering.  Number recognition
//! is regex-driven; symbols intern through the machine's symbol table.

use std::io::Read;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::backquote::qq_expand;
use crate::error::{LispError, LispResult};
use crate::symbol::SymbolTable;
use crate::value::{ListBuilder, SourcePos, Value};

/// Features visible to `#+` / `#-`.
pub const FEATURES: &[&str] = &["pika", "pika-0.4", "rust", "ieee-floating-point"];

static LONG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?[0-9]+$").expect("long regex"));
static DOUBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?([0-9]+\.[0-9]*|\.[0-9]+|[0-9]+)([eE][+-]?[0-9]+)?$")
        .expect("double regex")
});

/// Would `text` be read as a number (and so needs escaping as a symbol)?
pub fn looks_numeric(text: &str) -> bool {
    LONG_RE.is_match(text)
        || (DOUBLE_RE.is_match(text) && text.contains(['.', 'e', 'E']))
}

// ---------------------------------------------------------------------------
// Character names
// ---------------------------------------------------------------------------

const CONTROL_NAMES: &[&str] = &[
    "Nul", "Soh", "Stx", "Etx", "Eot", "Enq", "Ack", "Bel", "Backspace", "Tab", "Newline", "Vt",
    "Page", "Return", "So", "Si", "Dle", "Dc1", "Dc2", "Dc3", "Dc4", "Nak", "Syn", "Etb", "Can",
    "Em", "Sub", "Esc", "Fs", "Gs", "Rs", "Us",
];

/// The printable name of a character that has one (`#\Space`, `#\Newline`, …).
pub fn char_name(c: char) -> Option<&'static str> {
    match c {
        ' ' => Some("Space"),
        '\u{7f}' => Some("Rubout"),
        _ => CONTROL_NAMES.get(c as usize).copied(),
    }
}

/// Resolve a character name, ASCII-case-insensitively.
pub fn name_char(name: &str) -> Option<char> {
    if name.eq_ignore_ascii_case("Space") {
        return Some(' ');
    }
    if name.eq_ignore_ascii_case("Rubout") {
        return Some('\u{7f}');
    }
    CONTROL_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name))
        .and_then(|i| char::from_u32(i as u32))
}

// ---------------------------------------------------------------------------
// Character sources
// ---------------------------------------------------------------------------

/// One code point per call; `None` at end of input.
pub trait CharSource {
    fn next_char(&mut self) -> Option<char>;
}

pub struct StrSource<'a> {
    chars: std::str::Chars<'a>,
}

impl<'a> StrSource<'a> {
    pub fn new(text: &'a str) -> Self {
        StrSource {
            chars: text.chars(),
        }
    }
}

impl CharSource for StrSource<'_> {
    fn next_char(&mut self) -> Option<char> {
        self.chars.next()
    }
}

/// An owned character source (used when the text must outlive a borrow).
pub struct VecSource {
    chars: Vec<char>,
    pos: usize,
}

impl VecSource {
    pub fn from_string(text: String) -> Self {
        VecSource {
            chars: text.chars().collect(),
            pos: 0,
        }
    }
}

impl CharSource for VecSource {
    fn next_char(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }
}

/// Incremental UTF-8 decoding over a byte stream (used for stdin).
pub struct IoSource<R: Read> {
    inner: R,
}

impl<R: Read> IoSource<R> {
    pub fn new(inner: R) -> Self {
        IoSource { inner }
    }
}

impl<R: Read> CharSource for IoSource<R> {
    fn next_char(&mut self) -> Option<char> {
        let mut buf = [0u8; 4];
        if self.inner.read_exact(&mut buf[..1]).is_err() {
            return None;
        }
        let len = match buf[0] {
            b if b < 0x80 => 1,
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        if len > 1 && self.inner.read_exact(&mut buf[1..len]).is_err() {
            return None;
        }
        std::str::from_utf8(&buf[..len])
            .ok()
            .and_then(|s| s.chars().next())
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Token {
    LParen,
    RParen,
    Dot,
    Quote,
    Backquote,
    Comma,
    CommaAt,
    HashQuote,
    /// `#+` (true) or `#-` (false) awaiting its feature expression.
    Feature(bool),
    Atom(Value),
    Eof,
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct Reader<'a> {
    src: &'a mut dyn CharSource,
    st: &'a mut SymbolTable,
    peeked: Option<char>,
    file: Option<Arc<str>>,
    line: u32,
    col: u32,
    bq_depth: u32,
}

impl<'a> Reader<'a> {
    pub fn new(src: &'a mut dyn CharSource, st: &'a mut SymbolTable) -> Reader<'a> {
        Reader {
            src,
            st,
            peeked: None,
            file: None,
            line: 1,
            col: 0,
            bq_depth: 0,
        }
    }

    pub fn with_file(mut self, file: impl Into<Arc<str>>) -> Reader<'a> {
        self.file = Some(file.into());
        self
    }

    /// Hand over a pending lookahead character (kept across `read` calls on
    /// interactive input).
    pub fn set_pending(&mut self, c: Option<char>) {
        self.peeked = c;
    }

    pub fn take_pending(&mut self) -> Option<char> {
        self.peeked.take()
    }

    /// Read the next form; `None` at end of input.
    pub fn read(&mut self) -> Result<Option<Value>, LispError> {
        loop {
            let token = self.next_token()?;
            match token {
                Token::Eof => return Ok(None),
                other => {
                    if let Some(form) = self.parse_form(other)? {
                        return Ok(Some(form));
                    }
                    // A feature-filtered form; keep reading.
                }
            }
        }
    }

    fn pos(&self) -> SourcePos {
        SourcePos {
            file: self.file.clone(),
            start_line: self.line,
            start_col: self.col,
            end_line: self.line,
            end_col: self.col,
        }
    }

    fn err(&self, message: impl Into<String>) -> LispError {
        LispError::reader(message, Some(self.pos()))
    }

    // -- Form parsing -------------------------------------------------------

    /// Parse one form starting from `token`.  Returns `None` when a feature
    /// expression excluded the following form.
    fn parse_form(&mut self, token: Token) -> Result<Option<Value>, LispError> {
        match token {
            Token::Eof => Err(self.err("unexpected end of input")),
            Token::LParen => self.parse_list().map(Some),
            Token::RParen => Err(self.err("unexpected ')'")),
            Token::Dot => Err(self.err("unexpected '.'")),
            Token::Atom(v) => Ok(Some(v)),
            Token::HashQuote => {
                // CL compatibility: #'form reads as form.
                let form = self.read_required()?;
                Ok(Some(form))
            }
            Token::Quote => {
                let form = self.read_required()?;
                Ok(Some(self.list2(self.st.wk.quote.clone(), form)))
            }
            Token::Backquote => {
                self.bq_depth += 1;
                let form = self.read_required();
                self.bq_depth -= 1;
                let form = form?;
                if self.bq_depth == 0 {
                    qq_expand(&form, self.st).map(Some)
                } else {
                    Ok(Some(self.list2(self.st.wk.quasiquote.clone(), form)))
                }
            }
            Token::Comma | Token::CommaAt => {
                if self.bq_depth == 0 {
                    return Err(self.err("comma is not inside a backquote"));
                }
                self.bq_depth -= 1;
                let form = self.read_required();
                self.bq_depth += 1;
                let form = form?;
                let marker = if matches!(token, Token::CommaAt) {
                    self.st.wk.unquote_splice.clone()
                } else {
                    self.st.wk.unquote.clone()
                };
                Ok(Some(self.list2(marker, form)))
            }
            Token::Feature(positive) => {
                let expr = self.read_required()?;
                let enabled = eval_feature_expr(&expr)
                    .ok_or_else(|| self.err("invalid feature expression"))?;
                let form = self.read_required()?;
                if enabled == positive {
                    Ok(Some(form))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn read_required(&mut self) -> LispResult {
        match self.read()? {
            Some(v) => Ok(v),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn list2(&self, head: crate::symbol::Symbol, tail: Value) -> Value {
        Value::cons(
            Value::Symbol(head),
            Value::cons(tail, Value::Nil),
        )
    }

    fn parse_list(&mut self) -> LispResult {
        let open = self.pos();
        let mut builder = ListBuilder::new();
        loop {
            let elem_pos = SourcePos {
                file: self.file.clone(),
                start_line: open.start_line,
                start_col: open.start_col,
                end_line: self.line,
                end_col: self.col,
            };
            let token = self.next_token()?;
            match token {
                Token::Eof => return Err(self.err("unterminated list")),
                Token::RParen => return Ok(builder.build()),
                Token::Dot => {
                    let tail = self.read_required()?;
                    match self.next_token()? {
                        Token::RParen => {
                            builder.set_tail(tail);
                            return Ok(builder.build());
                        }
                        _ => return Err(self.err("expected ')' after dotted tail")),
                    }
                }
                other => {
                    if let Some(form) = self.parse_form(other)? {
                        builder.push_at(form, Some(elem_pos));
                    }
                }
            }
        }
    }

    // -- Tokenizer ----------------------------------------------------------

    fn next_char(&mut self) -> Option<char> {
        let c = self.peeked.take().or_else(|| self.src.next_char());
        if let Some(c) = c {
            if c == '\n' {
                self.line += 1;
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
        c
    }

    fn peek_char(&mut self) -> Option<char> {
        if self.peeked.is_none() {
            self.peeked = self.src.next_char();
        }
        self.peeked
    }

    fn next_token(&mut self) -> Result<Token, LispError> {
        loop {
            let Some(c) = self.next_char() else {
                return Ok(Token::Eof);
            };
            match c {
                ' ' | '\t' | '\r' | '\n' => continue,
                ';' => {
                    while let Some(c) = self.next_char() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                '(' => return Ok(Token::LParen),
                ')' => return Ok(Token::RParen),
                '\'' => return Ok(Token::Quote),
                '`' => return Ok(Token::Backquote),
                ',' => {
                    if self.peek_char() == Some('@') {
                        self.next_char();
                        return Ok(Token::CommaAt);
                    }
                    return Ok(Token::Comma);
                }
                '"' => return self.read_string().map(Token::Atom),
                '|' => return self.read_bar_symbol().map(Token::Atom),
                '#' => {
                    if let Some(token) = self.read_dispatch()? {
                        return Ok(token);
                    }
                    // #|…|# comment consumed; keep scanning.
                }
                _ => return self.read_atom(c),
            }
        }
    }

    fn read_string(&mut self) -> LispResult {
        let mut s = String::new();
        loop {
            let Some(c) = self.next_char() else {
                return Err(self.err("unterminated string literal"));
            };
            match c {
                '"' => return Ok(Value::Str(self.st.intern_string(s))),
                '\\' => {
                    let Some(esc) = self.next_char() else {
                        return Err(self.err("unterminated string literal"));
                    };
                    match esc {
                        'n' => s.push('\n'),
                        'r' => s.push('\r'),
                        't' => s.push('\t'),
                        other => s.push(other),
                    }
                }
                other => s.push(other),
            }
        }
    }

    fn read_bar_symbol(&mut self) -> LispResult {
        let mut s = String::new();
        loop {
            let Some(c) = self.next_char() else {
                return Err(self.err("unterminated |-quoted symbol"));
            };
            match c {
                '|' => return Ok(Value::Symbol(self.st.intern(&s))),
                '\\' => {
                    let Some(esc) = self.next_char() else {
                        return Err(self.err("unterminated |-quoted symbol"));
                    };
                    s.push(esc);
                }
                other => s.push(other),
            }
        }
    }

    /// Handle the character after `#`.  Returns `None` when a block comment
    /// was consumed.
    fn read_dispatch(&mut self) -> Result<Option<Token>, LispError> {
        let Some(c) = self.next_char() else {
            return Err(self.err("unexpected end of input after '#'"));
        };
        match c {
            '|' => {
                // Multiline comment, closed at the first |#.
                let mut prev = '\0';
                loop {
                    let Some(c) = self.next_char() else {
                        return Err(self.err("unterminated multiline comment"));
                    };
                    if prev == '|' && c == '#' {
                        return Ok(None);
                    }
                    prev = c;
                }
            }
            '\'' => Ok(Some(Token::HashQuote)),
            '+' => Ok(Some(Token::Feature(true))),
            '-' => Ok(Some(Token::Feature(false))),
            '\\' => self.read_char_literal().map(|v| Some(Token::Atom(v))),
            'b' | 'B' => self.read_radix(2).map(|v| Some(Token::Atom(v))),
            'o' | 'O' => self.read_radix(8).map(|v| Some(Token::Atom(v))),
            'x' | 'X' => self.read_radix(16).map(|v| Some(Token::Atom(v))),
            other => Err(self.err(format!("unknown dispatch character '#{}'", other))),
        }
    }

    fn read_char_literal(&mut self) -> LispResult {
        let Some(first) = self.next_char() else {
            return Err(self.err("unexpected end of input in character literal"));
        };
        let mut name = String::new();
        name.push(first);
        if first.is_ascii_alphanumeric() {
            while let Some(c) = self.peek_char() {
                if c.is_ascii_alphanumeric() {
                    name.push(c);
                    self.next_char();
                } else {
                    break;
                }
            }
        }
        if name.chars().count() == 1 {
            return Ok(Value::Char(first));
        }
        if name.chars().all(|c| c.is_ascii_digit()) {
            let code: u32 = name
                .parse()
                .map_err(|_| self.err(format!("invalid character code '{}'", name)))?;
            return char::from_u32(code)
                .map(Value::Char)
                .ok_or_else(|| self.err(format!("invalid character code '{}'", name)));
        }
        name_char(&name)
            .map(Value::Char)
            .ok_or_else(|| self.err(format!("unknown character name '{}'", name)))
    }

    fn read_radix(&mut self, radix: u32) -> LispResult {
        let mut text = String::new();
        if matches!(self.peek_char(), Some('+') | Some('-')) {
            text.push(self.next_char().expect("sign peeked"));
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() {
                text.push(c);
                self.next_char();
            } else {
                break;
            }
        }
        i64::from_str_radix(&text, radix)
            .map(Value::Long)
            .map_err(|_| self.err(format!("invalid number '{}' in base {}", text, radix)))
    }

    fn read_atom(&mut self, first: char) -> Result<Token, LispError> {
        let mut text = String::new();
        let mut escaped = false;
        if first == '\\' {
            let Some(c) = self.next_char() else {
                return Err(self.err("unexpected end of input after '\\'"));
            };
            text.push(c);
            escaped = true;
        } else {
            text.push(first);
        }
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() || "()'`,;\"|".contains(c) {
                break;
            }
            self.next_char();
            if c == '\\' {
                let Some(esc) = self.next_char() else {
                    return Err(self.err("unexpected end of input after '\\'"));
                };
                text.push(esc);
                escaped = true;
            } else {
                text.push(c);
            }
        }
        if !escaped {
            if text == "." {
                return Ok(Token::Dot);
            }
            if text.eq_ignore_ascii_case("nil") {
                return Ok(Token::Atom(Value::Nil));
            }
            if LONG_RE.is_match(&text) {
                return match text.parse::<i64>() {
                    Ok(n) => Ok(Token::Atom(Value::Long(n))),
                    Err(_) => Err(self.err(format!("integer '{}' out of range", text))),
                };
            }
            if DOUBLE_RE.is_match(&text) && text.contains(['.', 'e', 'E']) {
                return match text.parse::<f64>() {
                    Ok(d) => Ok(Token::Atom(Value::Double(d))),
                    Err(_) => Err(self.err(format!("invalid number '{}'", text))),
                };
            }
        }
        Ok(Token::Atom(Value::Symbol(self.st.intern(&text))))
    }
}

// ---------------------------------------------------------------------------
// Feature expressions
// ---------------------------------------------------------------------------

fn has_feature(name: &str) -> bool {
    FEATURES.iter().any(|f| f.eq_ignore_ascii_case(name))
}

/// Evaluate `expr` against the fixed feature set.  `None` = malformed.
fn eval_feature_expr(expr: &Value) -> Option<bool> {
    match expr {
        Value::Symbol(sym) => Some(has_feature(sym.name())),
        Value::Cons(_) => {
            let items = crate::value::list_to_vec(expr)?;
            let (head, rest) = items.split_first()?;
            let op = head.as_symbol()?.name().to_lowercase();
            match op.as_str() {
                "and" => {
                    for e in rest {
                        if !eval_feature_expr(e)? {
                            return Some(false);
                        }
                    }
                    Some(true)
                }
                "or" => {
                    for e in rest {
                        if eval_feature_expr(e)? {
                            return Some(true);
                        }
                    }
                    Some(false)
                }
                "not" => {
                    if rest.len() != 1 {
                        return None;
                    }
                    eval_feature_expr(&rest[0]).map(|b| !b)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Convenience entry points
// ---------------------------------------------------------------------------

/// Read every form in `text`.
pub fn read_all(text: &str, st: &mut SymbolTable) -> Result<Vec<Value>, LispError> {
    let mut src = StrSource::new(text);
    let mut reader = Reader::new(&mut src, st);
    let mut forms = Vec::new();
    while let Some(form) = reader.read()? {
        forms.push(form);
    }
    Ok(forms)
}

/// Read exactly one form from `text`.
pub fn read_one(text: &str, st: &mut SymbolTable) -> LispResult {
    let mut src = StrSource::new(text);
    let mut reader = Reader::new(&mut src, st);
    reader
        .read()?
        .ok_or_else(|| LispError::reader("empty input", None))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::print::print_value;

    fn read_print(text: &str) -> String {
        let mut st = SymbolTable::new();
        let form = read_one(text, &mut st).unwrap_or_else(|e| panic!("{}: {}", text, e));
        print_value(&form, true)
    }

    fn read_err(text: &str) -> LispError {
        let mut st = SymbolTable::new();
        match read_all(text, &mut st) {
            Ok(forms) => panic!("expected error for {}, got {:?}", text, forms),
            Err(e) => e,
        }
    }

    #[test]
    fn read_atoms() {
        assert_eq!(read_print("foo"), "foo");
        assert_eq!(read_print("42"), "42");
        assert_eq!(read_print("-7"), "-7");
        assert_eq!(read_print("3.5"), "3.5");
        assert_eq!(read_print("1e3"), "1000.0");
        assert_eq!(read_print("\"hi\\n\""), "\"hi\\n\"");
        assert_eq!(read_print("nil"), "nil");
        assert_eq!(read_print("NIL"), "nil");
    }

    #[test]
    fn read_lists() {
        assert_eq!(read_print("(1 2 3)"), "(1 2 3)");
        assert_eq!(read_print("(a . b)"), "(a . b)");
        assert_eq!(read_print("(a b . c)"), "(a b . c)");
        assert_eq!(read_print("()"), "nil");
        assert_eq!(read_print("(1 (2 3) 4)"), "(1 (2 3) 4)");
    }

    #[test]
    fn read_comments() {
        assert_eq!(read_print("; hello\n42"), "42");
        assert_eq!(read_print("#| multi\nline |# 42"), "42");
        assert_eq!(read_print("(1 #|x|# 2)"), "(1 2)");
    }

    #[test]
    fn read_quote_rewrites() {
        assert_eq!(read_print("'x"), "(quote x)");
        assert_eq!(read_print("'(1 2)"), "(quote (1 2))");
        assert_eq!(read_print("#'car"), "car");
    }

    #[test]
    fn read_characters() {
        assert_eq!(read_print("#\\a"), "#\\a");
        assert_eq!(read_print("#\\Space"), "#\\Space");
        assert_eq!(read_print("#\\newline"), "#\\Newline");
        assert_eq!(read_print("#\\65"), "#\\A");
        assert_eq!(read_print("#\\("), "#\\(");
    }

    #[test]
    fn read_radix_integers() {
        assert_eq!(read_print("#b101"), "5");
        assert_eq!(read_print("#o17"), "15");
        assert_eq!(read_print("#x-ff"), "-255");
        assert_eq!(read_print("#xCAFE"), "51966");
    }

    #[test]
    fn read_escaped_symbols() {
        assert_eq!(read_print("|hello world|"), "|hello world|");
        assert_eq!(read_print("\\1x"), "1x");
        // An escaped digit token is a symbol, not a number.
        let mut st = SymbolTable::new();
        let v = read_one("\\123", &mut st).unwrap();
        assert!(v.as_symbol().is_some());
    }

    #[test]
    fn symbols_intern_case_insensitively() {
        let mut st = SymbolTable::new();
        let a = read_one("Foo", &mut st).unwrap();
        let b = read_one("FOO", &mut st).unwrap();
        assert!(crate::value::eq_value(&a, &b));
    }

    #[test]
    fn feature_expressions_filter_forms() {
        assert_eq!(read_print("#+pika 1"), "1");
        assert_eq!(read_print("(list #+rust 1 #-rust 2)"), "(list 1)");
        assert_eq!(read_print("#-no-such-feature 3"), "3");
        assert_eq!(read_print("#+(and pika rust) 4"), "4");
        assert_eq!(read_print("#+(or nope rust) 5"), "5");
        assert_eq!(read_print("#+(not nope) 6"), "6");
        // Excluded at top level: the next form is 7.
        assert_eq!(read_print("#+nope 6 7"), "7");
    }

    #[test]
    fn reader_errors() {
        assert_eq!(read_err(")").kind, ErrorKind::Reader);
        assert_eq!(read_err("(1 2").kind, ErrorKind::Reader);
        assert_eq!(read_err("\"abc").kind, ErrorKind::Reader);
        assert_eq!(read_err("|abc").kind, ErrorKind::Reader);
        assert_eq!(read_err("#| abc").kind, ErrorKind::Reader);
        assert_eq!(read_err("#z").kind, ErrorKind::Reader);
        assert_eq!(read_err("(1 . 2 3)").kind, ErrorKind::Reader);
        assert_eq!(read_err("99999999999999999999").kind, ErrorKind::Reader);
        assert_eq!(read_err("#+(nope x) 1").kind, ErrorKind::Reader);
        let e = read_err(",b");
        assert!(e.message.contains("comma is not inside a backquote"));
    }

    #[test]
    fn reader_positions_attach_to_conses() {
        let mut st = SymbolTable::new();
        let forms = read_all("\n  (a b)", &mut st).unwrap();
        let pos = forms[0].pos().expect("position");
        assert_eq!(pos.start_line, 2);
        assert_eq!(pos.start_col, 3);
    }

    #[test]
    fn round_trip_reparse_is_equal() {
        let mut st = SymbolTable::new();
        for text in [
            "(a (b . c) 1 2.5 \"s\" #\\x |odd sym|)",
            "'(quote (1 2))",
            "(((deep)))",
        ] {
            let v1 = read_one(text, &mut st).unwrap();
            let printed = print_value(&v1, true);
            let v2 = read_one(&printed, &mut st).unwrap();
            assert!(
                crate::value::equal_value(&v1, &v2),
                "{} -> {} not equal",
                text,
                printed
            );
        }
    }
}
