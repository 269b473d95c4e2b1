//! # Type System for Path Parameters
//!
//! The closed set of parameter kinds a route pattern may declare with
//! `{name:type}`. Each kind owns two things:
//!
//! - a regex fragment spliced into the route matcher at compile time
//! - a conversion from the captured raw segment into a [`ParamValue`]
//!
//! A conversion failure means "this route does not match", never "this
//! request is invalid"; the router moves on to the next candidate.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Supported path parameter types
///
/// Default is `String` when a pattern omits the `:type` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    /// One segment, any characters except `/` (`str`)
    #[default]
    String,
    /// Decimal digits, parsed to `i64` (`int`)
    Int,
    /// Signed decimal number, parsed to `f64` (`float`)
    Float,
    /// Canonical 8-4-4-4-12 hex identifier (`uuid`)
    Uuid,
    /// Zero or more trailing segments joined by `/` (`multipath`)
    Multipath,
}

impl ParamType {
    /// Parse type specifier from route pattern (e.g., "int" from "{id:int}")
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` for unsupported specifiers.
    pub fn from_specifier(s: &str) -> Result<Self> {
        match s {
            "str" => Ok(Self::String),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "uuid" => Ok(Self::Uuid),
            "multipath" => Ok(Self::Multipath),
            other => Err(Error::InvalidRoutePattern {
                pattern: s.to_string(),
                reason: format!("unsupported parameter type '{other}'"),
            }),
        }
    }

    /// Get the type name as written in patterns
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Uuid => "uuid",
            Self::Multipath => "multipath",
        }
    }

    /// Regex fragment (without capture group) accepted for this type
    #[must_use]
    pub const fn regex_fragment(&self) -> &'static str {
        match self {
            Self::String => "[^/]+",
            Self::Int => "[0-9]+",
            Self::Float => r"[-+]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)",
            Self::Uuid => {
                "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}"
            }
            Self::Multipath => ".*",
        }
    }

    /// Whether this type may span several segments
    #[must_use]
    pub const fn is_multipath(&self) -> bool {
        matches!(self, Self::Multipath)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Converted parameter value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Single segment string
    String(String),
    /// Integer value (i64)
    Int(i64),
    /// Float value (f64)
    Float(f64),
    /// UUID value
    Uuid(Uuid),
    /// Trailing path remainder, possibly empty
    Path(String),
}

impl ParamValue {
    /// Render the value back to its textual form
    #[must_use]
    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) | Self::Path(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Uuid(u) => u.to_string(),
        }
    }

    /// Borrow as `&str` for `String` and `Path` variants
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Path(s) => Some(s),
            _ => None,
        }
    }

    /// Get as i64 if Int variant
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if Float variant
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as UUID if Uuid variant
    #[must_use]
    pub const fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

fn conversion_error(raw: &str, expected: ParamType) -> Error {
    Error::Conversion {
        value: raw.to_string(),
        expected,
    }
}

fn is_decimal_digits(raw: &str) -> bool {
    !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit())
}

fn is_float_literal(raw: &str) -> bool {
    let unsigned = raw.strip_prefix(&['-', '+'][..]).unwrap_or(raw);
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits_only = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    digits_only(int_part)
        && digits_only(frac_part)
        && !(int_part.is_empty() && frac_part.is_empty())
}

fn is_canonical_uuid(raw: &str) -> bool {
    raw.len() == 36
        && raw.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Convert raw string to typed value based on `ParamType`
///
/// The grammar is re-checked here so the function stands on its own outside
/// the route matcher.
///
/// # Errors
///
/// Returns `Error::Conversion` if `raw` does not satisfy the type.
pub fn convert_param(raw: &str, param_type: ParamType) -> Result<ParamValue> {
    match param_type {
        ParamType::String => {
            if raw.is_empty() || raw.contains('/') {
                return Err(conversion_error(raw, param_type));
            }
            Ok(ParamValue::String(raw.to_string()))
        }
        ParamType::Int => {
            if !is_decimal_digits(raw) {
                return Err(conversion_error(raw, param_type));
            }
            // Overflow past i64 surfaces as a parse error
            raw.parse::<i64>()
                .map(ParamValue::Int)
                .map_err(|_| conversion_error(raw, param_type))
        }
        ParamType::Float => {
            if !is_float_literal(raw) {
                return Err(conversion_error(raw, param_type));
            }
            raw.parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|_| conversion_error(raw, param_type))
        }
        ParamType::Uuid => {
            if !is_canonical_uuid(raw) {
                return Err(conversion_error(raw, param_type));
            }
            Uuid::parse_str(raw)
                .map(ParamValue::Uuid)
                .map_err(|_| conversion_error(raw, param_type))
        }
        ParamType::Multipath => Ok(ParamValue::Path(raw.to_string())),
    }
}

/// Parse a path segment pattern to extract name and type
///
/// Examples:
/// - `{id}` -> ("id", ParamType::String)
/// - `{id:int}` -> ("id", ParamType::Int)
/// - `users` -> `None`
///
/// # Errors
///
/// Returns `Error::InvalidRoutePattern` for malformed tokens such as `{id`,
/// `{}`, `user{id}` or `{id:bool}`.
pub fn parse_param_pattern(segment: &str) -> Result<Option<(String, ParamType)>> {
    let invalid = |reason: String| Error::InvalidRoutePattern {
        pattern: segment.to_string(),
        reason,
    };

    if !segment.contains(&['{', '}'][..]) {
        return Ok(None);
    }

    let inner = segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| invalid("parameter must span the whole segment".to_string()))?;

    if inner.contains(&['{', '}'][..]) {
        return Err(invalid("nested braces".to_string()));
    }

    let (name, param_type) = match inner.split_once(':') {
        Some((name, type_spec)) => (name, ParamType::from_specifier(type_spec)?),
        None => (inner, ParamType::String),
    };

    if name.is_empty() {
        return Err(invalid("empty parameter name".to_string()));
    }

    Ok(Some((name.to_string(), param_type)))
}
