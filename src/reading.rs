//! Reading and description types.
//!
//! `read()` returns a [`DataMap<Reading>`] and `describe()` a
//! [`DataMap<DataKey>`]; the two always carry the same keys in the same
//! order. By convention the first key is the primary one.
//!
//! Timestamps are UNIX epoch seconds (UTC) as `f64`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current UNIX timestamp in seconds.
#[allow(clippy::cast_precision_loss)]
pub fn now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
}

/// A single value together with the time it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// The value.
    pub value: Value,
    /// UNIX timestamp of the value.
    pub timestamp: f64,
}

impl Reading {
    /// Create a reading.
    pub fn new(value: Value, timestamp: f64) -> Self {
        Self { value, timestamp }
    }
}

/// Data type of a value, following the event-model naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// Floating point number.
    Number,
    /// Integer number.
    Integer,
    /// Text.
    String,
    /// Boolean flag.
    Boolean,
    /// Array of values.
    Array,
}

impl Dtype {
    /// Infer the data type of a value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Dtype::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Dtype::Integer,
            Value::Number(_) => Dtype::Number,
            Value::Array(_) => Dtype::Array,
            Value::String(_) | Value::Null | Value::Object(_) => Dtype::String,
        }
    }

    /// Infer the shape of a value: `[]` for scalars, one entry per
    /// dimension for (nested) arrays.
    pub fn shape_of(value: &Value) -> Vec<usize> {
        let mut shape = Vec::new();
        let mut current = value;
        while let Value::Array(items) = current {
            shape.push(items.len());
            match items.first() {
                Some(first) => current = first,
                None => break,
            }
        }
        shape
    }
}

/// Schema and metadata for one entry of `read()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type.
    pub dtype: Dtype,
    /// Shape; empty for scalars.
    pub shape: Vec<usize>,
    /// Where the value comes from (channel name or `SIM:` address).
    pub source: String,
    /// Engineering units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Display precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Lower control limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_ctrl_limit: Option<f64>,
    /// Upper control limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_ctrl_limit: Option<f64>,
}

/// Insertion-ordered map keyed by data-key name.
///
/// Inserting an existing key replaces its value in place, so the first
/// occurrence fixes the position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for DataMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> DataMap<T> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, key: impl Into<String>, value: T) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Merge every entry of `other` into `self`.
    pub fn extend(&mut self, other: DataMap<T>) {
        for (key, value) in other.entries {
            self.insert(key, value);
        }
    }

    /// Look up an entry.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> IntoIterator for DataMap<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, T> FromIterator<(K, T)> for DataMap<T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

/// Fields an orchestrator should show by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hints {
    /// Data-key names, in tree traversal order.
    pub fields: Vec<String>,
}
