//! Primitive literal values and the language-level conversions the
//! constant folder relies on

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Type;

/// A primitive literal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum LiteralValue {
    Undefined,
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Number(f64),
    String(String),
}

impl LiteralValue {
    /// Static type of the literal
    pub fn ty(&self) -> Type {
        match self {
            LiteralValue::Boolean(_) => Type::Boolean,
            LiteralValue::Int(_) => Type::Int,
            LiteralValue::Long(_) => Type::Long,
            LiteralValue::Number(_) => Type::Number,
            LiteralValue::Undefined | LiteralValue::Null | LiteralValue::String(_) => Type::Object,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, LiteralValue::String(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            LiteralValue::Int(_) | LiteralValue::Long(_) | LiteralValue::Number(_)
        )
    }

    /// Convert to boolean (truthiness)
    pub fn to_boolean(&self) -> bool {
        match self {
            LiteralValue::Undefined | LiteralValue::Null => false,
            LiteralValue::Boolean(b) => *b,
            LiteralValue::Int(n) => *n != 0,
            LiteralValue::Long(n) => *n != 0,
            LiteralValue::Number(n) => *n != 0.0 && !n.is_nan(),
            LiteralValue::String(s) => !s.is_empty(),
        }
    }

    /// Convert to number
    pub fn to_number(&self) -> f64 {
        match self {
            LiteralValue::Undefined => f64::NAN,
            LiteralValue::Null => 0.0,
            LiteralValue::Boolean(true) => 1.0,
            LiteralValue::Boolean(false) => 0.0,
            LiteralValue::Int(n) => *n as f64,
            LiteralValue::Long(n) => *n as f64,
            LiteralValue::Number(n) => *n,
            LiteralValue::String(s) => string_to_number(s),
        }
    }

    /// Convert to a 32-bit signed integer with modular truncation
    pub fn to_int32(&self) -> i32 {
        match self {
            LiteralValue::Int(n) => *n,
            other => to_int32(other.to_number()),
        }
    }

    /// Convert to a 64-bit integer, truncating toward zero
    pub fn to_long(&self) -> i64 {
        match self {
            LiteralValue::Int(n) => *n as i64,
            LiteralValue::Long(n) => *n,
            other => {
                let n = other.to_number();
                if n.is_finite() {
                    n.trunc() as i64
                } else {
                    0
                }
            }
        }
    }

    /// Convert to JavaScript string representation
    pub fn to_js_string(&self) -> String {
        match self {
            LiteralValue::Undefined => "undefined".to_string(),
            LiteralValue::Null => "null".to_string(),
            LiteralValue::Boolean(true) => "true".to_string(),
            LiteralValue::Boolean(false) => "false".to_string(),
            LiteralValue::Int(n) => n.to_string(),
            LiteralValue::Long(n) => n.to_string(),
            LiteralValue::Number(n) => number_to_string(*n),
            LiteralValue::String(s) => s.clone(),
        }
    }

    /// Get the typeof string
    pub fn type_of(&self) -> &'static str {
        match self {
            LiteralValue::Undefined => "undefined",
            LiteralValue::Null => "object",
            LiteralValue::Boolean(_) => "boolean",
            LiteralValue::Int(_) | LiteralValue::Long(_) | LiteralValue::Number(_) => "number",
            LiteralValue::String(_) => "string",
        }
    }

    /// Strict equality (===)
    pub fn strict_equals(&self, other: &LiteralValue) -> bool {
        match (self, other) {
            (LiteralValue::Undefined, LiteralValue::Undefined) => true,
            (LiteralValue::Null, LiteralValue::Null) => true,
            (LiteralValue::Boolean(a), LiteralValue::Boolean(b)) => a == b,
            (LiteralValue::String(a), LiteralValue::String(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => a.to_number() == b.to_number(),
            _ => false,
        }
    }

    /// Abstract equality (==)
    pub fn equals(&self, other: &LiteralValue) -> bool {
        match (self, other) {
            (LiteralValue::Null | LiteralValue::Undefined, LiteralValue::Null | LiteralValue::Undefined) => {
                true
            }
            (LiteralValue::Null | LiteralValue::Undefined, _)
            | (_, LiteralValue::Null | LiteralValue::Undefined) => false,
            (LiteralValue::String(a), LiteralValue::String(b)) => a == b,
            (LiteralValue::Boolean(a), LiteralValue::Boolean(b)) => a == b,
            // Remaining pairs mix numbers, strings and booleans; all of them
            // compare numerically
            (a, b) => a.to_number() == b.to_number(),
        }
    }

    /// Abstract relational comparison `self < other`; `None` stands for the
    /// undefined result produced when either side is NaN
    pub fn less_than(&self, other: &LiteralValue) -> Option<bool> {
        if let (LiteralValue::String(a), LiteralValue::String(b)) = (self, other) {
            return Some(a.encode_utf16().lt(b.encode_utf16()));
        }
        let x = self.to_number();
        let y = other.to_number();
        if x.is_nan() || y.is_nan() {
            None
        } else {
            Some(x < y)
        }
    }

    /// The `+` operator on two primitives
    pub fn add(&self, other: &LiteralValue) -> LiteralValue {
        if self.is_string() || other.is_string() {
            let mut s = self.to_js_string();
            s.push_str(&other.to_js_string());
            LiteralValue::String(s)
        } else {
            LiteralValue::Number(self.to_number() + other.to_number())
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::String(s) => write!(f, "{:?}", s),
            LiteralValue::Long(n) => write!(f, "{}L", n),
            LiteralValue::Number(n) if n.is_finite() && n.fract() == 0.0 && *n != 0.0 => {
                write!(f, "{}.0", number_to_string(*n))
            }
            LiteralValue::Number(n) if *n == 0.0 && n.is_sign_negative() => f.write_str("-0.0"),
            LiteralValue::Number(n) if *n == 0.0 => f.write_str("0.0"),
            other => f.write_str(&other.to_js_string()),
        }
    }
}

/// ToInt32: modular truncation into the signed 32-bit range
pub fn to_int32(n: f64) -> i32 {
    to_uint32(n) as i32
}

/// ToUint32: modular truncation into the unsigned 32-bit range
pub fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32
}

/// Whether `n` is an exact int32 value other than negative zero
pub fn is_strictly_representable_as_int(n: f64) -> bool {
    n == (n as i32) as f64 && !is_negative_zero(n)
}

/// Whether `n` is an exact int64 value other than negative zero
pub fn is_strictly_representable_as_long(n: f64) -> bool {
    n.is_finite()
        && n >= i64::MIN as f64
        && n < i64::MAX as f64
        && n == (n as i64) as f64
        && !is_negative_zero(n)
}

pub fn is_negative_zero(n: f64) -> bool {
    n == 0.0 && n.is_sign_negative()
}

fn is_js_whitespace(c: char) -> bool {
    matches!(
        c,
        '\u{9}' | '\u{a}' | '\u{b}' | '\u{c}' | '\u{d}' | ' ' | '\u{a0}' | '\u{1680}'
            | '\u{2000}'..='\u{200a}'
            | '\u{2028}' | '\u{2029}' | '\u{202f}' | '\u{205f}' | '\u{3000}' | '\u{feff}'
    )
}

/// ToNumber applied to a string
pub fn string_to_number(s: &str) -> f64 {
    let t = s.trim_matches(is_js_whitespace);
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    for (prefix, radix) in [("0x", 16), ("0X", 16), ("0o", 8), ("0O", 8), ("0b", 2), ("0B", 2)] {
        if let Some(digits) = t.strip_prefix(prefix) {
            return parse_radix(digits, radix);
        }
    }
    let valid = t
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        && t.chars().any(|c| c.is_ascii_digit());
    if !valid {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

fn parse_radix(digits: &str, radix: u32) -> f64 {
    if digits.is_empty() {
        return f64::NAN;
    }
    let mut value = 0.0f64;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => value = value * radix as f64 + d as f64,
            None => return f64::NAN,
        }
    }
    value
}

/// Number::toString(10)
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n < 0.0 {
        return format!("-{}", number_to_string(-n));
    }

    // Shortest round-trip digits, as d.ddddde<exp>
    let sci = format!("{:e}", n);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let point = exponent.parse::<i32>().unwrap_or(0) + 1;

    if k <= point && point <= 21 {
        let mut s = digits;
        s.extend(std::iter::repeat('0').take((point - k) as usize));
        s
    } else if 0 < point && point <= 21 {
        let (int, frac) = digits.split_at(point as usize);
        format!("{}.{}", int, frac)
    } else if -6 < point && point <= 0 {
        format!("0.{}{}", "0".repeat((-point) as usize), digits)
    } else {
        let e = point - 1;
        let sign = if e < 0 { '-' } else { '+' };
        let (first, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{}e{}{}", first, sign, e.abs())
        } else {
            format!("{}.{}e{}{}", first, rest, sign, e.abs())
        }
    }
}
