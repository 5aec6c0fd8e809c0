// used for decimal numbers of arbitrary size
use bigdecimal::BigDecimal;
use bigdecimal::Zero;

// used for timestamps and dates
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

// complex values from the form runtime are carried through as JSON
use serde_json::Value as JsonValue;

// a fast hashing algo for the field name keyed maps
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{FormcalcError, Result};

pub type FieldHasher = BuildHasherDefault<SeaHasher>;

// Field names compare case-insensitively everywhere.
pub(crate) fn fold(name: &str) -> String {
    name.to_lowercase()
}

// ------------- ValueKind -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    Text,
    DateTime,
    Json,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::DateTime => "datetime",
            ValueKind::Json => "json",
        };
        write!(f, "{}", name)
    }
}

// ------------- Value -------------
/// A single field value as seen by formulas. Numbers are arbitrary
/// precision decimals, never floats, so that money arithmetic is exact.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(BigDecimal),
    Text(String),
    DateTime(NaiveDateTime),
    Json(JsonValue),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::Text(_) => ValueKind::Text,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Json(_) => ValueKind::Json,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness as the boolean operators and `IF` see it: null is false,
    /// numbers are true when nonzero, text must spell a boolean.
    pub fn truthy(&self) -> Result<bool> {
        match self {
            Value::Null => Ok(false),
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(!n.is_zero()),
            Value::Text(s) => {
                let t = s.trim();
                if t.eq_ignore_ascii_case("true") {
                    Ok(true)
                } else if t.eq_ignore_ascii_case("false") {
                    Ok(false)
                } else {
                    Err(FormcalcError::Evaluation(format!(
                        "cannot interpret '{}' as a boolean",
                        s
                    )))
                }
            }
            other => Err(FormcalcError::Evaluation(format!(
                "cannot interpret a {} value as a boolean",
                other.kind()
            ))),
        }
    }

    /// Decimal coercion for arithmetic: null counts as zero, text is parsed.
    pub fn to_decimal(&self) -> Result<BigDecimal> {
        match self {
            Value::Null => Ok(BigDecimal::zero()),
            Value::Number(n) => Ok(n.clone()),
            Value::Text(s) => BigDecimal::from_str(s.trim()).map_err(|_| {
                FormcalcError::Evaluation(format!("cannot convert '{}' to a number", s))
            }),
            other => Err(FormcalcError::Evaluation(format!(
                "cannot convert a {} value to a number",
                other.kind()
            ))),
        }
    }

    /// Text rendering for the string functions: null becomes the empty
    /// string, everything else uses its display form.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Datetime coercion for the date functions; text accepts ISO datetimes
    /// or a bare date taken at midnight.
    pub fn to_datetime(&self) -> Result<NaiveDateTime> {
        match self {
            Value::DateTime(t) => Ok(*t),
            Value::Text(s) => parse_datetime(s.trim()).ok_or_else(|| {
                FormcalcError::Evaluation(format!("cannot convert '{}' to a datetime", s))
            }),
            other => Err(FormcalcError::Evaluation(format!(
                "cannot convert a {} value to a datetime",
                other.kind()
            ))),
        }
    }

    /// Ordering for the comparison operators: null sorts first, same kinds
    /// compare natively, mixed kinds fall back to their text forms.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            _ => self.to_text().cmp(&other.to_text()),
        }
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|d| NaiveDateTime::new(d, NaiveTime::MIN))
        })
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::DateTime(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(BigDecimal::from(n))
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(BigDecimal::from(n))
    }
}
impl From<BigDecimal> for Value {
    fn from(n: BigDecimal) -> Self {
        Value::Number(n)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<NaiveDateTime> for Value {
    fn from(t: NaiveDateTime) -> Self {
        Value::DateTime(t)
    }
}
impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Boolean(b),
            JsonValue::Number(n) => match BigDecimal::from_str(&n.to_string()) {
                Ok(d) => Value::Number(d),
                Err(_) => Value::Json(JsonValue::Number(n)),
            },
            JsonValue::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }
}

// ------------- Snapshot -------------
/// The live field-name to value bindings a recalculation pass reads and
/// progressively updates. Lookups are case-insensitive; iteration yields the
/// first-seen spelling of each name.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    slots: HashMap<String, Slot, FieldHasher>,
}

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    value: Value,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            slots: HashMap::default(),
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        match self.slots.entry(fold(name)) {
            Entry::Occupied(mut e) => e.get_mut().value = value,
            Entry::Vacant(e) => {
                e.insert(Slot {
                    name: name.to_owned(),
                    value,
                });
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots.get(&fold(name)).map(|slot| &slot.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(&fold(name))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.slots.values().map(|slot| (slot.name.as_str(), &slot.value))
    }
}
