//! Arithmetic, comparison, and rounding primitives.
//!
//! `+ - * /` compute in `f64` and always return a double; `1+`/`1-` and
//! `signum` preserve the operand's type; comparisons compare adjacent
//! argument pairs as `f64`; the integer-returning rounding family checks
//! for NaN/infinity/overflow and fails with an arithmetic error.

use crate::error::{LispError, LispResult};
use crate::eval::Machine;
use crate::value::Value;

fn expect_num(v: &Value) -> Result<f64, LispError> {
    v.as_f64().ok_or_else(|| LispError::type_error("number", v))
}

/// Convert a double to a long, rejecting NaN, infinities, and values
/// outside the `i64` range.
fn long_checked(d: f64) -> Result<i64, LispError> {
    if d.is_nan() {
        return Err(LispError::arithmetic("NaN does not fit in an integer"));
    }
    if !d.is_finite() || d < i64::MIN as f64 || d > i64::MAX as f64 {
        return Err(LispError::arithmetic(format!(
            "{} does not fit in an integer",
            d
        )));
    }
    Ok(d as i64)
}

// ---------------------------------------------------------------------------
// + - * /
// ---------------------------------------------------------------------------

pub fn fold_add(args: &[Value]) -> LispResult {
    let mut acc = 0.0f64;
    for v in args {
        acc += expect_num(v)?;
    }
    Ok(Value::Double(acc))
}

pub fn fold_mul(args: &[Value]) -> LispResult {
    let mut acc = 1.0f64;
    for v in args {
        acc *= expect_num(v)?;
    }
    Ok(Value::Double(acc))
}

/// Unary `-` negates.
pub fn fold_sub(args: &[Value]) -> LispResult {
    let first = expect_num(&args[0])?;
    if args.len() == 1 {
        return Ok(Value::Double(-first));
    }
    let mut acc = first;
    for v in &args[1..] {
        acc -= expect_num(v)?;
    }
    Ok(Value::Double(acc))
}

/// Unary `/` reciprocates.
pub fn fold_div(args: &[Value]) -> LispResult {
    let first = expect_num(&args[0])?;
    if args.len() == 1 {
        return Ok(Value::Double(1.0 / first));
    }
    let mut acc = first;
    for v in &args[1..] {
        acc /= expect_num(v)?;
    }
    Ok(Value::Double(acc))
}

pub fn builtin_add(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    fold_add(&args)
}

pub fn builtin_sub(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    fold_sub(&args)
}

pub fn builtin_mul(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    fold_mul(&args)
}

pub fn builtin_div(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    fold_div(&args)
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

/// Chained comparison over adjacent pairs, in double.
pub fn compare(m: &mut Machine, op: &str, args: &[Value]) -> LispResult {
    let mut prev = expect_num(&args[0])?;
    for v in &args[1..] {
        let next = expect_num(v)?;
        let holds = match op {
            "=" => prev == next,
            "/=" => prev != next,
            "<" => prev < next,
            "<=" => prev <= next,
            ">" => prev > next,
            ">=" => prev >= next,
            _ => return Err(LispError::internal(format!("unknown comparison {}", op))),
        };
        if !holds {
            return Ok(Value::Nil);
        }
        prev = next;
    }
    Ok(m.t())
}

pub fn builtin_num_eq(m: &mut Machine, args: Vec<Value>) -> LispResult {
    compare(m, "=", &args)
}

pub fn builtin_num_ne(m: &mut Machine, args: Vec<Value>) -> LispResult {
    compare(m, "/=", &args)
}

pub fn builtin_lt(m: &mut Machine, args: Vec<Value>) -> LispResult {
    compare(m, "<", &args)
}

pub fn builtin_le(m: &mut Machine, args: Vec<Value>) -> LispResult {
    compare(m, "<=", &args)
}

pub fn builtin_gt(m: &mut Machine, args: Vec<Value>) -> LispResult {
    compare(m, ">", &args)
}

pub fn builtin_ge(m: &mut Machine, args: Vec<Value>) -> LispResult {
    compare(m, ">=", &args)
}

// ---------------------------------------------------------------------------
// Increment / decrement, signum
// ---------------------------------------------------------------------------

/// `1+` / `1-`: type-preserving increment with overflow detection.
pub fn inc_value(v: &Value, delta: i64) -> LispResult {
    match v {
        Value::Long(n) => n
            .checked_add(delta)
            .map(Value::Long)
            .ok_or_else(|| LispError::arithmetic("integer overflow")),
        Value::Double(d) => Ok(Value::Double(d + delta as f64)),
        other => Err(LispError::type_error("number", other)),
    }
}

pub fn builtin_inc(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    inc_value(&args[0], 1)
}

pub fn builtin_dec(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    inc_value(&args[0], -1)
}

pub fn builtin_signum(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    match &args[0] {
        Value::Long(n) => Ok(Value::Long(n.signum())),
        Value::Double(d) => {
            if *d == 0.0 || d.is_nan() {
                Ok(Value::Double(*d))
            } else {
                Ok(Value::Double(d.signum()))
            }
        }
        other => Err(LispError::type_error("number", other)),
    }
}

// ---------------------------------------------------------------------------
// mod / rem
// ---------------------------------------------------------------------------

/// Floored modulus: `x − floor(x/y)·y`; type-preserving for two longs.
pub fn mod_values(x: &Value, y: &Value) -> LispResult {
    match (x, y) {
        (Value::Long(a), Value::Long(b)) => {
            if *b == 0 {
                return Err(LispError::arithmetic("mod: division by zero"));
            }
            // Floored modulus: result takes the divisor's sign.
            Ok(Value::Long(((a % b) + b) % b))
        }
        _ => {
            let a = expect_num(x)?;
            let b = expect_num(y)?;
            Ok(Value::Double(a - (a / b).floor() * b))
        }
    }
}

/// Host remainder (truncated).
pub fn rem_values(x: &Value, y: &Value) -> LispResult {
    match (x, y) {
        (Value::Long(a), Value::Long(b)) => {
            if *b == 0 {
                return Err(LispError::arithmetic("rem: division by zero"));
            }
            Ok(Value::Long(a % b))
        }
        _ => {
            let a = expect_num(x)?;
            let b = expect_num(y)?;
            Ok(Value::Double(a % b))
        }
    }
}

pub fn builtin_mod(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    mod_values(&args[0], &args[1])
}

pub fn builtin_rem(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    rem_values(&args[0], &args[1])
}

// ---------------------------------------------------------------------------
// Exponential / logarithmic
// ---------------------------------------------------------------------------

pub fn builtin_sqrt(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(Value::Double(expect_num(&args[0])?.sqrt()))
}

pub fn builtin_log(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(Value::Double(expect_num(&args[0])?.ln()))
}

pub fn builtin_log10(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(Value::Double(expect_num(&args[0])?.log10()))
}

pub fn builtin_exp(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    Ok(Value::Double(expect_num(&args[0])?.exp()))
}

pub fn builtin_expt(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    let base = expect_num(&args[0])?;
    let power = expect_num(&args[1])?;
    Ok(Value::Double(base.powf(power)))
}

// ---------------------------------------------------------------------------
// Rounding family
// ---------------------------------------------------------------------------

/// The single- or two-argument (dividing) operand of a rounding op.
fn rounding_operand(args: &[Value]) -> Result<f64, LispError> {
    let x = expect_num(&args[0])?;
    match args.get(1) {
        None => Ok(x),
        Some(y) => Ok(x / expect_num(y)?),
    }
}

fn round_long(args: &[Value], f: impl Fn(f64) -> f64) -> LispResult {
    let x = rounding_operand(args)?;
    Ok(Value::Long(long_checked(f(x))?))
}

fn round_double(args: &[Value], f: impl Fn(f64) -> f64) -> LispResult {
    let x = rounding_operand(args)?;
    Ok(Value::Double(f(x)))
}

pub fn builtin_round(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_long(&args, f64::round_ties_even)
}

pub fn builtin_floor(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_long(&args, f64::floor)
}

pub fn builtin_ceiling(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_long(&args, f64::ceil)
}

pub fn builtin_truncate(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_long(&args, f64::trunc)
}

pub fn builtin_fround(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_double(&args, f64::round_ties_even)
}

pub fn builtin_ffloor(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_double(&args, f64::floor)
}

pub fn builtin_fceiling(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_double(&args, f64::ceil)
}

pub fn builtin_ftruncate(_m: &mut Machine, args: Vec<Value>) -> LispResult {
    round_double(&args, f64::trunc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
