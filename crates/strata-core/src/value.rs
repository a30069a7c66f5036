//! Runtime values and coercion rules.
//!
//! Every row that crosses the driver boundary is made of [`Value`]s. The
//! variants cover the scalar types of the schema layer plus nested lists and
//! objects for json-typed columns, so a whole row is itself a `Value::Object`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::eval::Eval;

/// An object value: field name to value, in stable order.
pub type Object = BTreeMap<String, Value>;

/// A dynamically typed database value.
///
/// `Value` is the row currency of the whole layer: models format and parse
/// them, the portable evaluator computes over them, and drivers convert them
/// to and from their physical representations.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent or SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Unsigned integer value.
    Uint(u64),
    /// Floating point value.
    Float(f64),
    /// Text value.
    String(String),
    /// Binary blob value.
    Bytes(Vec<u8>),
    /// Calendar date without time of day.
    Date(NaiveDate),
    /// Time of day; the date component is normalized to the epoch.
    Time(NaiveTime),
    /// Date and time without timezone.
    DateTime(NaiveDateTime),
    /// Homogeneous list value.
    List(Vec<Value>),
    /// Nested object value.
    Object(Object),
    /// An unevaluated expression term, passed through formatting verbatim.
    Expr(Box<Eval>),
}

impl Value {
    /// Returns whether the value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as an `i64` when it is integral.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Uint(n) => i64::try_from(*n).ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Returns the value as an `f64` when it is numeric.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Uint(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    /// Returns the value as a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a list slice.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the value as an object map.
    #[must_use]
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns a mutable reference to the object map.
    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns whether the value is truthy under query semantics.
    ///
    /// `Null`, `false`, zero, the empty string and the empty list are falsy;
    /// everything else is truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Uint(n) => *n != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            _ => true,
        }
    }

    /// Milliseconds since the Unix epoch for temporal values.
    #[must_use]
    pub fn epoch_millis(&self) -> Option<i64> {
        match self {
            Self::Date(d) => Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis()),
            Self::Time(t) => Some(epoch_date().and_time(*t).and_utc().timestamp_millis()),
            Self::DateTime(dt) => Some(dt.and_utc().timestamp_millis()),
            _ => None,
        }
    }

    /// Numeric coercion used by `$number`: temporal values become seconds
    /// since the epoch, booleans become 0/1, `Null` becomes 0.
    #[must_use]
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Null => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Int(n) => *n as f64,
            Self::Uint(n) => *n as f64,
            Self::Float(f) => *f,
            Self::String(s) => s.parse().unwrap_or(0.0),
            Self::Date(_) | Self::Time(_) | Self::DateTime(_) => {
                self.epoch_millis().map_or(0.0, |ms| ms as f64 / 1000.0)
            }
            _ => 0.0,
        }
    }

    /// Compares two values by value-of coercion.
    ///
    /// Numbers compare across integer and float variants, temporal values by
    /// epoch milliseconds, strings lexically. Values of unrelated shapes are
    /// incomparable and return `None`.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::{Bool, Bytes, DateTime, Int, List, Null, String, Time, Uint};
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Uint(a), Uint(b)) => Some(a.cmp(b)),
            (List(a), List(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            }
            (Value::Date(_) | Time(_) | DateTime(_), Value::Date(_) | Time(_) | DateTime(_)) => {
                Some(self.epoch_millis()?.cmp(&other.epoch_millis()?))
            }
            _ => {
                let (a, b) = (self.as_float()?, other.as_float()?);
                a.partial_cmp(&b)
            }
        }
    }

    /// Whether two values are equal under value-of coercion.
    #[must_use]
    pub fn loose_eq(&self, other: &Value) -> bool {
        self == other || self.compare(other) == Some(Ordering::Equal)
    }

    /// Reads a nested value at a dotted path.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Writes a nested value at a dotted path, creating intermediate objects.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let Some((head, rest)) = path.split_once('.') else {
            if let Some(map) = self.as_object_mut() {
                map.insert(path.to_string(), value);
            }
            return;
        };
        if let Some(map) = self.as_object_mut() {
            map.entry(head.to_string())
                .or_insert_with(|| Value::Object(Object::new()))
                .set_path(rest, value);
        }
    }

    /// Converts from a `serde_json` value. Numbers become `Int`, `Uint` or
    /// `Float` depending on representability.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Uint(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts into a `serde_json` value. Temporal values render in ISO 8601
    /// form; expression terms are not representable and become `Null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Expr(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Uint(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex_encode(b)),
            Value::Date(d) => serde_json::Value::String(d.to_string()),
            Value::Time(t) => serde_json::Value::String(t.to_string()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_string()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// The date all time-of-day values are anchored to.
#[must_use]
pub fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Uint(u64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Self::Time(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<Eval> for Value {
    fn from(v: Eval) -> Self {
        Self::Expr(Box::new(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Builds a `Value::Object` from key/value pairs.
#[macro_export]
macro_rules! object {
    () => { $crate::value::Value::Object($crate::value::Object::new()) };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::value::Object::new();
        $(map.insert(::std::string::String::from($key), $crate::value::Value::from($value));)+
        $crate::value::Value::Object(map)
    }};
}
