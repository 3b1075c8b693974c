//! `format` and `format-locale`.
//!
//! `(format dest fmt args…)` — `dest` of `t` writes to the machine's
//! output and returns `t`; `nil` returns the formatted string.  Directives
//! follow the host `%`-style: `%s %d %f %e %g %x %o %c %% %n`, with
//! optional `-`/`0` flags, width, and precision (`%-8.3f`).
//! `format-locale` takes a locale tag between the destination and the
//! format string; the tag is validated and otherwise ignored.

use crate::error::{LispError, LispResult};
use crate::eval::Machine;
use crate::print::print_value;
use crate::value::Value;

pub fn builtin_format(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let dest = args[0].clone();
    let fmt = format_string_arg(&args[1])?;
    run_format(m, dest, &fmt, &args[2..])
}

pub fn builtin_format_locale(m: &mut Machine, args: Vec<Value>) -> LispResult {
    let dest = args[0].clone();
    match &args[1] {
        Value::Nil | Value::Str(_) => {}
        other => return Err(LispError::type_error("string", other)),
    }
    let fmt = format_string_arg(&args[2])?;
    run_format(m, dest, &fmt, &args[3..])
}

fn format_string_arg(v: &Value) -> Result<String, LispError> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| LispError::type_error("string", v))
}

fn run_format(m: &mut Machine, dest: Value, fmt: &str, args: &[Value]) -> LispResult {
    let text = format_text(fmt, args)?;
    if dest.is_nil() {
        Ok(Value::string(text))
    } else {
        m.write_out(&text)?;
        Ok(m.t())
    }
}

#[derive(Default)]
struct Spec {
    left_align: bool,
    zero_pad: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

/// Interpret the directive string over `args`.
pub fn format_text(fmt: &str, args: &[Value]) -> Result<String, LispError> {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let mut next_arg = 0usize;

    let take = |next_arg: &mut usize| -> Result<Value, LispError> {
        let v = args
            .get(*next_arg)
            .cloned()
            .ok_or_else(|| LispError::arity("format", args.len()))?;
        *next_arg += 1;
        Ok(v)
    };

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = Spec::default();
        loop {
            match chars.peek() {
                Some('-') => {
                    spec.left_align = true;
                    chars.next();
                }
                Some('0') if spec.width.is_none() => {
                    spec.zero_pad = true;
                    chars.next();
                }
                _ => break,
            }
        }
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            spec.width = Some(spec.width.unwrap_or(0) * 10 + d as usize);
            chars.next();
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                precision = precision * 10 + d as usize;
                chars.next();
            }
            spec.precision = Some(precision);
        }
        let Some(conv) = chars.next() else {
            return Err(LispError::malformed("format", "trailing '%'"));
        };
        match conv {
            '%' => out.push('%'),
            'n' => out.push('\n'),
            's' => {
                let v = take(&mut next_arg)?;
                pad_into(&mut out, &print_value(&v, false), &spec);
            }
            'd' => {
                let v = take(&mut next_arg)?;
                let n = v
                    .as_long()
                    .ok_or_else(|| LispError::type_error("integer", &v))?;
                pad_into(&mut out, &n.to_string(), &spec);
            }
            'x' => {
                let v = take(&mut next_arg)?;
                let n = v
                    .as_long()
                    .ok_or_else(|| LispError::type_error("integer", &v))?;
                pad_into(&mut out, &format!("{:x}", n), &spec);
            }
            'o' => {
                let v = take(&mut next_arg)?;
                let n = v
                    .as_long()
                    .ok_or_else(|| LispError::type_error("integer", &v))?;
                pad_into(&mut out, &format!("{:o}", n), &spec);
            }
            'c' => {
                let v = take(&mut next_arg)?;
                match v {
                    Value::Char(c) => pad_into(&mut out, &c.to_string(), &spec),
                    other => return Err(LispError::type_error("character", &other)),
                }
            }
            'f' => {
                let v = take(&mut next_arg)?;
                let d = v
                    .as_f64()
                    .ok_or_else(|| LispError::type_error("number", &v))?;
                let text = format!("{:.*}", spec.precision.unwrap_or(6), d);
                pad_into(&mut out, &text, &spec);
            }
            'e' => {
                let v = take(&mut next_arg)?;
                let d = v
                    .as_f64()
                    .ok_or_else(|| LispError::type_error("number", &v))?;
                let text = exponential(d, spec.precision.unwrap_or(6));
                pad_into(&mut out, &text, &spec);
            }
            'g' => {
                let v = take(&mut next_arg)?;
                let d = v
                    .as_f64()
                    .ok_or_else(|| LispError::type_error("number", &v))?;
                pad_into(&mut out, &format!("{}", d), &spec);
            }
            other => {
                return Err(LispError::malformed(
                    "format",
                    format!("unknown directive '%{}'", other),
                ))
            }
        }
    }
    Ok(out)
}

/// `%e` with a fixed-precision mantissa and a signed two-digit exponent.
fn exponential(d: f64, precision: usize) -> String {
    if d == 0.0 {
        return format!("{:.*}e+00", precision, 0.0);
    }
    if !d.is_finite() {
        return format!("{}", d);
    }
    let exp = d.abs().log10().floor() as i32;
    let mantissa = d / 10f64.powi(exp);
    format!(
        "{:.*}e{}{:02}",
        precision,
        mantissa,
        if exp < 0 { '-' } else { '+' },
        exp.abs()
    )
}

fn pad_into(out: &mut String, text: &str, spec: &Spec) {
    let Some(width) = spec.width else {
        out.push_str(text);
        return;
    };
    let len = text.chars().count();
    if len >= width {
        out.push_str(text);
        return;
    }
    let fill = width - len;
    if spec.left_align {
        out.push_str(text);
        out.extend(std::iter::repeat(' ').take(fill));
    } else if spec.zero_pad && text.starts_with('-') {
        out.push('-');
        out.extend(std::iter::repeat('0').take(fill));
        out.push_str(&text[1..]);
    } else if spec.zero_pad {
        out.extend(std::iter::repeat('0').take(fill));
        out.push_str(text);
    } else {
        out.extend(std::iter::repeat(' ').take(fill));
        out.push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ok(src: &str) -> String {
        let mut m = Machine::with_output(Box::new(Vec::new()));
        match m.interpret_expression(src) {
            Ok(v) => print_value(&v, true),
            Err(e) => panic!("{} failed: {}", src, e),
        }
    }

    fn err(src: &str) -> LispError {
        let mut m = Machine::with_output(Box::new(Vec::new()));
        m.interpret_expression(src).unwrap_err()
    }

    #[test]
    fn string_and_literal_directives() {
        assert_eq!(ok("(format nil \"hello %s!\" \"world\")"), "\"hello world!\"");
        assert_eq!(ok("(format nil \"a%%b%nc\")"), "\"a%b\\nc\"");
        assert_eq!(ok("(format nil \"%s\" '(1 2))"), "\"(1 2)\"");
    }

    #[test]
    fn numeric_directives() {
        assert_eq!(ok("(format nil \"%d\" 42)"), "\"42\"");
        assert_eq!(ok("(format nil \"%5d\" 42)"), "\"   42\"");
        assert_eq!(ok("(format nil \"%-5d|\" 42)"), "\"42   |\"");
        assert_eq!(ok("(format nil \"%05d\" -42)"), "\"-0042\"");
        assert_eq!(ok("(format nil \"%x\" 255)"), "\"ff\"");
        assert_eq!(ok("(format nil \"%o\" 8)"), "\"10\"");
        assert_eq!(ok("(format nil \"%.2f\" 3.14159)"), "\"3.14\"");
        assert_eq!(ok("(format nil \"%f\" 1.5)"), "\"1.500000\"");
        assert_eq!(ok("(format nil \"%.1e\" 1234.0)"), "\"1.2e+03\"");
        assert_eq!(ok("(format nil \"%g\" 0.5)"), "\"0.5\"");
        assert_eq!(ok("(format nil \"%c\" #\\x)"), "\"x\"");
    }

    #[test]
    fn format_to_output() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for Sink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut m = Machine::with_output(Box::new(Sink(buffer.clone())));
        let result = m
            .interpret_expression("(format t \"%d-%d\" 1 2)")
            .unwrap();
        assert_eq!(print_value(&result, true), "t");
        assert_eq!(
            String::from_utf8(buffer.lock().unwrap().clone()).unwrap(),
            "1-2"
        );
    }

    #[test]
    fn format_locale_validates_tag() {
        assert_eq!(
            ok("(format-locale nil \"de-DE\" \"%d\" 7)"),
            "\"7\""
        );
        assert_eq!(ok("(format-locale nil nil \"%d\" 7)"), "\"7\"");
        assert_eq!(err("(format-locale nil 5 \"%d\" 7)").kind, ErrorKind::Type);
    }

    #[test]
    fn format_errors() {
        assert_eq!(err("(format nil \"%d\")").kind, ErrorKind::Arity);
        assert_eq!(err("(format nil \"%d\" \"x\")").kind, ErrorKind::Type);
        assert_eq!(err("(format nil \"%q\" 1)").kind, ErrorKind::Malformed);
        assert_eq!(err("(format nil \"abc%\")").kind, ErrorKind::Malformed);
    }
}
