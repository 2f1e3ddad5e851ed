use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::StressError;

/// A single field value of a measurement point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// Convert the value to a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Integer(v) => serde_json::Value::from(*v),
            FieldValue::Float(v) => serde_json::Value::from(*v),
            FieldValue::Bool(v) => serde_json::Value::from(*v),
            FieldValue::Text(v) => serde_json::Value::from(v.as_str()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// A named, tagged measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: DateTime<Utc>,
}

impl Point {
    /// Create a point stamped with the current time
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Reassemble a point read back from a store
    pub fn from_parts(
        name: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            fields,
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Nanoseconds since the epoch, if representable
    pub fn timestamp_nanos(&self) -> Option<i64> {
        self.timestamp.timestamp_nanos_opt()
    }

    /// Return a copy of this point with `extra` merged over its tags.
    /// The source point is left untouched.
    pub fn with_tags(&self, extra: &BTreeMap<String, String>) -> Point {
        let mut point = self.clone();
        for (key, value) in extra {
            point.tags.insert(key.clone(), value.clone());
        }
        point
    }

    /// Look a key up as a tag, falling back to a field rendered as text
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.tags
            .get(key)
            .cloned()
            .or_else(|| self.fields.get(key).map(|v| v.to_string()))
    }
}

/// Timestamp precision for generated and written points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "u",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
            Precision::Minutes => "m",
            Precision::Hours => "h",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = StressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ns" | "n" => Ok(Precision::Nanoseconds),
            "u" | "us" => Ok(Precision::Microseconds),
            "ms" => Ok(Precision::Milliseconds),
            "s" => Ok(Precision::Seconds),
            "m" => Ok(Precision::Minutes),
            "h" => Ok(Precision::Hours),
            other => Err(StressError::invalid(
                "precision",
                other,
                "expected one of ns, u, ms, s, m, h",
            )),
        }
    }
}
