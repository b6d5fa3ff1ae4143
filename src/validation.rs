//! Validator algebra for parameter values and configuration input.
//!
//! A [`Validator`] is a pure converter `Option<&Value> -> Value`. Called with no
//! input it produces a type-appropriate default (zero, empty list, first choice);
//! called with input it either returns a fully normalized value or fails. Every
//! validator is idempotent: feeding a normalized value back in returns it unchanged.
//!
//! Validators compose: ranges, enumerations, tuples, homogeneous lists and maps,
//! `NonZero`/`NoneOr` wrappers and fixed-key records can be nested freely.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_runtime::validation::Validator;
//! use serde_json::json;
//!
//! let v = Validator::list_of(Validator::float_range(0.0, Some(10.0))?);
//! assert_eq!(v.validate("offsets", Some(&json!([1, 2.5])))?, json!([1.0, 2.5]));
//! assert_eq!(v.default_value()?, json!([]));
//! ```

use regex::Regex;
use serde_json::{Map, Number, Value};
use std::path::{Component, Path};
use std::sync::{Arc, LazyLock};

use crate::error::{DaqError, DaqResult};

/// Dynamically typed parameter value.
pub type ParamValue = Value;

/// Signature of a user-supplied converter.
pub type CustomFn = Arc<dyn Fn(Option<&Value>) -> Result<Value, String> + Send + Sync>;

#[allow(clippy::expect_used)]
static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z_][a-z_0-9]*$").expect("Invalid identifier regex"));

// =============================================================================
// Info categories
// =============================================================================

/// Fixed vocabulary used to group parameters in info snapshots.
///
/// Declaration order is the order in which categories appear in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InfoCategory {
    Experiment,
    Sample,
    Instrument,
    Offsets,
    Limits,
    Precisions,
    Status,
    General,
    Result,
}

impl InfoCategory {
    pub const ALL: [InfoCategory; 9] = [
        InfoCategory::Experiment,
        InfoCategory::Sample,
        InfoCategory::Instrument,
        InfoCategory::Offsets,
        InfoCategory::Limits,
        InfoCategory::Precisions,
        InfoCategory::Status,
        InfoCategory::General,
        InfoCategory::Result,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InfoCategory::Experiment => "experiment",
            InfoCategory::Sample => "sample",
            InfoCategory::Instrument => "instrument",
            InfoCategory::Offsets => "offsets",
            InfoCategory::Limits => "limits",
            InfoCategory::Precisions => "precisions",
            InfoCategory::Status => "status",
            InfoCategory::General => "general",
            InfoCategory::Result => "result",
        }
    }
}

impl std::fmt::Display for InfoCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InfoCategory {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InfoCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DaqError::Programming(format!("unknown info category '{s}'")))
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Composable value converter.
///
/// Construct parametrized variants through the checked constructors
/// (`int_range`, `one_of`, ...) so that malformed definitions surface as
/// `Programming` errors at type registration instead of at first use.
#[derive(Clone)]
pub enum Validator {
    /// Accepts anything, default `null`.
    Any,
    Bool,
    /// Integer; booleans are rejected.
    Int,
    /// Finite float; booleans are rejected.
    Float,
    Str,
    /// Non-empty string, default is an error.
    NonEmptyStr,
    /// Inclusive integer range, default `min`.
    IntRange { min: i64, max: i64 },
    /// Inclusive float range with optional upper bound, default `min`.
    FloatRange { min: f64, max: Option<f64> },
    /// One of a fixed set of values, default is the first.
    OneOf(Vec<Value>),
    /// Maps aliases to canonical values; canonical values are accepted as-is.
    OneOfMap(Vec<(Value, Value)>),
    /// A list whose elements are drawn from a fixed set, default empty.
    SubsetOf(Vec<Value>),
    /// Fixed-arity heterogeneous tuple.
    TupleOf(Vec<Validator>),
    ListOf(Box<Validator>),
    NonEmptyListOf(Box<Validator>),
    /// String-keyed map with converted keys and values.
    MapOf(Box<Validator>, Box<Validator>),
    NonZero(Box<Validator>),
    NoneOr(Box<Validator>),
    /// Map with exactly this key set.
    Record(Vec<(String, Validator)>),
    /// `[lower, upper]` float pair with `lower <= upper`.
    Limits,
    /// 3-element float vector.
    Vec3,
    /// Device-name style identifier; empty string allowed.
    Identifier,
    /// `host[:port]`.
    Host,
    Ipv4,
    AbsolutePath,
    /// Relative path that does not escape upwards.
    RelativePath,
    /// A single path component.
    Subdir,
    Custom { doc: String, func: CustomFn },
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validator({})", self.describe())
    }
}

impl Validator {
    // ----- checked constructors -----

    pub fn int_range(min: i64, max: i64) -> DaqResult<Self> {
        if min > max {
            return Err(DaqError::Programming(format!(
                "int range must fulfill from <= to, given was [{min}, {max}]"
            )));
        }
        Ok(Validator::IntRange { min, max })
    }

    pub fn float_range(min: f64, max: Option<f64>) -> DaqResult<Self> {
        if !min.is_finite() || max.is_some_and(|m| !m.is_finite()) {
            return Err(DaqError::Programming("float range bounds must be finite".into()));
        }
        if let Some(max) = max {
            if min > max {
                return Err(DaqError::Programming(format!(
                    "float range must fulfill from <= to, given was [{min}, {max}]"
                )));
            }
        }
        Ok(Validator::FloatRange { min, max })
    }

    pub fn one_of<I, V>(choices: I) -> DaqResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let choices: Vec<Value> = choices.into_iter().map(Into::into).collect();
        if choices.is_empty() {
            return Err(DaqError::Programming("one_of needs at least one choice".into()));
        }
        Ok(Validator::OneOf(choices))
    }

    pub fn one_of_map<I, K, V>(pairs: I) -> DaqResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Value>,
        V: Into<Value>,
    {
        let pairs: Vec<(Value, Value)> =
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        if pairs.is_empty() {
            return Err(DaqError::Programming("one_of_map needs at least one entry".into()));
        }
        Ok(Validator::OneOfMap(pairs))
    }

    pub fn subset_of<I, V>(choices: I) -> DaqResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let choices: Vec<Value> = choices.into_iter().map(Into::into).collect();
        if choices.is_empty() {
            return Err(DaqError::Programming("subset_of needs at least one choice".into()));
        }
        Ok(Validator::SubsetOf(choices))
    }

    pub fn tuple_of(types: Vec<Validator>) -> DaqResult<Self> {
        if types.is_empty() {
            return Err(DaqError::Programming("tuple_of needs some element types".into()));
        }
        Ok(Validator::TupleOf(types))
    }

    pub fn record<I, K>(fields: I) -> DaqResult<Self>
    where
        I: IntoIterator<Item = (K, Validator)>,
        K: Into<String>,
    {
        let fields: Vec<(String, Validator)> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let mut seen = std::collections::HashSet::new();
        for (key, _) in &fields {
            if !seen.insert(key.as_str()) {
                return Err(DaqError::Programming(format!("record key '{key}' given twice")));
            }
        }
        Ok(Validator::Record(fields))
    }

    pub fn list_of(inner: Validator) -> Self {
        Validator::ListOf(Box::new(inner))
    }

    pub fn non_empty_list_of(inner: Validator) -> Self {
        Validator::NonEmptyListOf(Box::new(inner))
    }

    pub fn map_of(keys: Validator, values: Validator) -> Self {
        Validator::MapOf(Box::new(keys), Box::new(values))
    }

    pub fn non_zero(inner: Validator) -> Self {
        Validator::NonZero(Box::new(inner))
    }

    pub fn none_or(inner: Validator) -> Self {
        Validator::NoneOr(Box::new(inner))
    }

    pub fn custom(
        doc: impl Into<String>,
        func: impl Fn(Option<&Value>) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Validator::Custom {
            doc: doc.into(),
            func: Arc::new(func),
        }
    }

    // ----- conversion -----

    /// Validate `raw` for parameter `param`, mapping failures to `InvalidValue`.
    pub fn validate(&self, param: &str, raw: Option<&Value>) -> DaqResult<Value> {
        self.convert(raw).map_err(|reason| {
            DaqError::invalid(param, raw.cloned().unwrap_or(Value::Null), reason)
        })
    }

    /// The value produced when no input is given.
    pub fn default_value(&self) -> DaqResult<Value> {
        self.validate("<default>", None)
    }

    /// Raw conversion. `None` means "no input" and yields the default.
    pub fn convert(&self, raw: Option<&Value>) -> Result<Value, String> {
        // JSON null is treated as absence everywhere except in NoneOr/Any
        let raw = match (self, raw) {
            (Validator::NoneOr(_) | Validator::Any, r) => r,
            (_, Some(Value::Null)) => None,
            (_, r) => r,
        };

        match self {
            Validator::Any => Ok(raw.cloned().unwrap_or(Value::Null)),
            Validator::Bool => match raw {
                None => Ok(Value::Bool(false)),
                Some(v) => to_bool(v).map(Value::Bool),
            },
            Validator::Int => match raw {
                None => Ok(Value::from(0)),
                Some(v) => to_int(v).map(Value::from),
            },
            Validator::Float => match raw {
                None => Ok(float_value(0.0)),
                Some(v) => to_float(v).map(float_value),
            },
            Validator::Str => match raw {
                None => Ok(Value::String(String::new())),
                Some(v) => Ok(Value::String(to_string(v))),
            },
            Validator::NonEmptyStr => match raw {
                Some(Value::String(s)) if !s.is_empty() => Ok(Value::String(s.clone())),
                _ => Err("must be a non-empty string".into()),
            },
            Validator::IntRange { min, max } => {
                let val = match raw {
                    None => return Ok(Value::from(*min)),
                    Some(v) => to_int(v)?,
                };
                if val < *min || val > *max {
                    return Err(format!("value needs to fulfill {min} <= x <= {max}"));
                }
                Ok(Value::from(val))
            }
            Validator::FloatRange { min, max } => {
                let val = match raw {
                    None => return Ok(float_value(*min)),
                    Some(v) => to_float(v)?,
                };
                match max {
                    Some(max) if val < *min || val > *max => {
                        Err(format!("value needs to fulfill {min} <= x <= {max}"))
                    }
                    None if val < *min => Err(format!("value needs to fulfill {min} <= x")),
                    _ => Ok(float_value(val)),
                }
            }
            Validator::OneOf(choices) => match raw {
                None => Ok(choices[0].clone()),
                Some(v) => choices
                    .iter()
                    .find(|c| values_equal(c, v))
                    .cloned()
                    .ok_or_else(|| {
                        format!("invalid value: {v}, must be one of {}", join_values(choices))
                    }),
            },
            Validator::OneOfMap(pairs) => {
                let canonical: Vec<Value> = pairs.iter().map(|(_, v)| v.clone()).collect();
                match raw {
                    None => Ok(pairs[0].1.clone()),
                    Some(v) => {
                        if let Some((_, mapped)) = pairs.iter().find(|(k, _)| values_equal(k, v)) {
                            return Ok(mapped.clone());
                        }
                        canonical.iter().find(|c| values_equal(c, v)).cloned().ok_or_else(
                            || {
                                format!(
                                    "invalid value: {v}, must be one of {}",
                                    join_values(&canonical)
                                )
                            },
                        )
                    }
                }
            }
            Validator::SubsetOf(choices) => {
                let items = match raw {
                    None => return Ok(Value::Array(Vec::new())),
                    Some(v) => as_list(v)?,
                };
                let mut out: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    let choice = choices
                        .iter()
                        .find(|c| values_equal(c, item))
                        .ok_or_else(|| {
                            format!("invalid element: {item}, must be one of {}", join_values(choices))
                        })?;
                    if !out.iter().any(|o| values_equal(o, choice)) {
                        out.push(choice.clone());
                    }
                }
                Ok(Value::Array(out))
            }
            Validator::TupleOf(types) => match raw {
                None => types
                    .iter()
                    .map(|t| t.convert(None))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                Some(v) => {
                    let items = as_list(v)?;
                    if items.len() != types.len() {
                        return Err(format!("value needs to be a {}-tuple", types.len()));
                    }
                    types
                        .iter()
                        .zip(items)
                        .enumerate()
                        .map(|(i, (t, item))| {
                            t.convert(Some(item)).map_err(|e| format!("element {i}: {e}"))
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array)
                }
            },
            Validator::ListOf(inner) => match raw {
                None => Ok(Value::Array(Vec::new())),
                Some(v) => convert_elements(inner, as_list(v)?),
            },
            Validator::NonEmptyListOf(inner) => match raw {
                None => Ok(Value::Array(vec![inner.convert(None)?])),
                Some(v) => {
                    let items = as_list(v)?;
                    if items.is_empty() {
                        return Err("value needs to be a non-empty list".into());
                    }
                    convert_elements(inner, items)
                }
            },
            Validator::MapOf(keys, values) => {
                let map = match raw {
                    None => return Ok(Value::Object(Map::new())),
                    Some(Value::Object(map)) => map,
                    Some(_) => return Err("value needs to be a map".into()),
                };
                let mut out = Map::new();
                for (k, v) in map {
                    let key = keys.convert(Some(&Value::String(k.clone())))?;
                    let value = values.convert(Some(v)).map_err(|e| format!("key {k}: {e}"))?;
                    out.insert(to_string(&key), value);
                }
                Ok(Value::Object(out))
            }
            Validator::NonZero(inner) => match raw {
                None => {
                    let def = inner.convert(None)?;
                    if is_zero(&def) {
                        inner.convert(Some(&Value::from(1)))
                    } else {
                        Ok(def)
                    }
                }
                Some(v) => {
                    let val = inner.convert(Some(v))?;
                    if is_zero(&val) {
                        return Err("value must be non-zero".into());
                    }
                    Ok(val)
                }
            },
            Validator::NoneOr(inner) => match raw {
                None | Some(Value::Null) => Ok(Value::Null),
                Some(v) => inner.convert(Some(v)),
            },
            Validator::Record(fields) => {
                let map = match raw {
                    None => {
                        let mut out = Map::new();
                        for (key, conv) in fields {
                            out.insert(key.clone(), conv.convert(None)?);
                        }
                        return Ok(Value::Object(out));
                    }
                    Some(Value::Object(map)) => map,
                    Some(_) => return Err("value needs to be a map".into()),
                };
                if let Some(unknown) = map.keys().find(|k| !fields.iter().any(|(f, _)| f == *k)) {
                    return Err(format!("unknown key '{unknown}'"));
                }
                let mut out = Map::new();
                for (key, conv) in fields {
                    let item = map.get(key).ok_or_else(|| format!("missing key '{key}'"))?;
                    let value = conv.convert(Some(item)).map_err(|e| format!("key {key}: {e}"))?;
                    out.insert(key.clone(), value);
                }
                Ok(Value::Object(out))
            }
            Validator::Limits => {
                let (ll, ul) = match raw {
                    None => (0.0, 0.0),
                    Some(v) => {
                        let items = as_list(v)?;
                        if items.len() != 2 {
                            return Err("value must be a list and have 2 elements".into());
                        }
                        (to_float(&items[0])?, to_float(&items[1])?)
                    }
                };
                if ll > ul {
                    return Err("upper limit must be greater than lower limit".into());
                }
                Ok(Value::Array(vec![float_value(ll), float_value(ul)]))
            }
            Validator::Vec3 => match raw {
                None => Ok(Value::Array(vec![float_value(0.0); 3])),
                Some(v) => {
                    let items = as_list(v)?;
                    if items.len() != 3 {
                        return Err("value needs to be a 3-element vector".into());
                    }
                    items
                        .iter()
                        .map(|i| to_float(i).map(float_value))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array)
                }
            },
            Validator::Identifier => {
                let s = raw.map(to_string).unwrap_or_default();
                if s.is_empty() || IDENTIFIER_RE.is_match(&s) {
                    Ok(Value::String(s))
                } else {
                    Err(format!("'{s}' is not a valid device name"))
                }
            }
            Validator::Host => {
                let s = match raw {
                    None => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(_) => return Err("must be a string".into()),
                };
                check_host(&s)?;
                Ok(Value::String(s))
            }
            Validator::Ipv4 => {
                let s = raw.map(to_string).unwrap_or_default();
                if s.is_empty() || s.parse::<std::net::Ipv4Addr>().is_ok() {
                    Ok(Value::String(s))
                } else {
                    Err(format!("'{s}' is not a valid IPv4 address"))
                }
            }
            Validator::AbsolutePath => {
                let s = raw.map(to_string).unwrap_or_else(|| "/".to_string());
                if s.starts_with('/') {
                    Ok(Value::String(s))
                } else {
                    Err(format!("'{s}' is not a valid absolute path (should start with '/')"))
                }
            }
            Validator::RelativePath => {
                let s = raw.map(to_string).unwrap_or_default();
                normalize_relative(&s).map(Value::String)
            }
            Validator::Subdir => {
                let s = raw.map(to_string).unwrap_or_default();
                if s.contains('/') || s.contains('\\') {
                    Err(format!("'{s}' is not a valid subdirectory (contains a separator)"))
                } else {
                    Ok(Value::String(s))
                }
            }
            Validator::Custom { func, .. } => func(raw),
        }
    }

    /// Short human readable description, e.g. for parameter help.
    pub fn describe(&self) -> String {
        match self {
            Validator::Any => "any value".into(),
            Validator::Bool => "a boolean".into(),
            Validator::Int => "an integer".into(),
            Validator::Float => "a float".into(),
            Validator::Str => "a string".into(),
            Validator::NonEmptyStr => "a non-empty string".into(),
            Validator::IntRange { min, max } => format!("an integer in the range [{min}, {max}]"),
            Validator::FloatRange { min, max: Some(max) } => {
                format!("a float in the range [{min}, {max}]")
            }
            Validator::FloatRange { min, max: None } => format!("a float >= {min}"),
            Validator::OneOf(c) => format!("one of {}", join_values(c)),
            Validator::OneOfMap(p) => {
                let canonical: Vec<Value> = p.iter().map(|(_, v)| v.clone()).collect();
                format!("one of {}", join_values(&canonical))
            }
            Validator::SubsetOf(c) => format!("a subset of {}", join_values(c)),
            Validator::TupleOf(t) => format!(
                "a tuple of ({})",
                t.iter().map(Validator::describe).collect::<Vec<_>>().join(", ")
            ),
            Validator::ListOf(i) => format!("a list of {}", i.describe()),
            Validator::NonEmptyListOf(i) => format!("a non-empty list of {}", i.describe()),
            Validator::MapOf(k, v) => {
                format!("a dict of {} keys and {} values", k.describe(), v.describe())
            }
            Validator::NonZero(i) => format!("a non-zero {}", i.describe()),
            Validator::NoneOr(i) => format!("None or {}", i.describe()),
            Validator::Record(f) => format!(
                "a record with keys {}",
                f.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(", ")
            ),
            Validator::Limits => "a tuple of lower and upper limit".into(),
            Validator::Vec3 => "a 3-vector".into(),
            Validator::Identifier => "a valid device name".into(),
            Validator::Host => "a host[:port] value".into(),
            Validator::Ipv4 => "an IPv4 address".into(),
            Validator::AbsolutePath => "an absolute file path".into(),
            Validator::RelativePath => "a relative path".into(),
            Validator::Subdir => "a relative subdir".into(),
            Validator::Custom { doc, .. } => doc.clone(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn float_value(f: f64) -> Value {
    // Callers only pass finite floats
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn to_bool(v: &Value) -> Result<bool, String> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" | "" => Ok(false),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        other => Err(format!("{other} is not a boolean")),
    }
}

fn to_int(v: &Value) -> Result<i64, String> {
    match v {
        Value::Bool(_) => Err("value is not an integer!".into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                _ => Err(format!("{n} is not an integer")),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{s}' is not an integer")),
        other => Err(format!("{other} is not an integer")),
    }
}

fn to_float(v: &Value) -> Result<f64, String> {
    let f = match v {
        Value::Bool(_) => return Err("value is not a number!".into()),
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not a float"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a float"))?,
        other => return Err(format!("{other} is not a float")),
    };
    if !f.is_finite() {
        return Err("value must be a finite number".into());
    }
    Ok(f)
}

fn to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_list(v: &Value) -> Result<&Vec<Value>, String> {
    match v {
        Value::Array(items) => Ok(items),
        _ => Err("value needs to be a list".into()),
    }
}

fn convert_elements(inner: &Validator, items: &[Value]) -> Result<Value, String> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| inner.convert(Some(item)).map_err(|e| format!("element {i}: {e}")))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn is_zero(v: &Value) -> bool {
    match v {
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// Value equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn join_values(values: &[Value]) -> String {
    values.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
}

fn check_host(s: &str) -> Result<(), String> {
    if s.matches(':').count() > 1 {
        return Err(format!("'{s}' is not in the form host_name[:port]"));
    }
    if let Some((_, port)) = s.split_once(':') {
        match port.parse::<u32>() {
            Ok(p) if (1..65536).contains(&p) => {}
            _ => return Err(format!("'{s}' does not contain a valid port number")),
        }
    }
    Ok(())
}

fn normalize_relative(s: &str) -> Result<String, String> {
    if s.starts_with('/') {
        return Err(format!("'{s}' is not a valid relative path (should NOT start with '/')"));
    }
    let mut parts: Vec<&str> = Vec::new();
    for comp in Path::new(s).components() {
        match comp {
            Component::Normal(p) => parts.push(p.to_str().unwrap_or_default()),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(format!("'{s}' is not a valid relative path (traverses outside)"));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{s}' is not a valid relative path"));
            }
        }
    }
    if parts.is_empty() {
        Ok(".".to_string())
    } else {
        Ok(parts.join("/"))
    }
}
