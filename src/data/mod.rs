//! Core data model for synchronized datasets
//!
//! This module contains the tabular types that flow between the fetcher, the
//! normalizer, the store and the coordinator: scalar values, rows, the closed
//! set of configured data keys and the per-key dataset built from it.

pub mod fetch;
pub mod normalize;

pub use fetch::{render_url, FetchError, Fetcher, HttpFetcher};
pub use normalize::{
    Comparison, Condition, DatasetConverter, NormalizeError, Normalizer, RecordsConverter,
    Restriction,
};

use std::borrow::Borrow;
use std::cmp::Ordering;

use chrono::{NaiveDateTime, Timelike};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Column holding the latitude of every stored row
pub const LATITUDE_COLUMN: &str = "latitude";

/// Column holding the longitude of every stored row
pub const LONGITUDE_COLUMN: &str = "longitude";

/// Column tagging each row with its data key when keys share one table
///
/// Reserved: payload rows may not carry a column of this name.
pub const KEY_COLUMN: &str = "data_key";

/// Text format of stored ingestion timestamps
///
/// Fixed width and most significant field first, so stored timestamps order
/// correctly as plain text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats an ingestion timestamp for storage
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a stored ingestion timestamp
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
}

/// Drops the sub-second part of a timestamp
pub fn truncate_to_seconds(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// A single cell value
///
/// Mirrors the SQLite storage classes so that rows survive a store round trip
/// unchanged. Serializes to plain JSON (`null`, numbers, strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Scalar {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(i) => Some(*i as f64),
            Scalar::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Orders two values of compatible type
    ///
    /// Numbers compare numerically (integers exactly when both sides are
    /// integers), text compares lexically, and `Null` only equals `Null`.
    /// Any other pairing is incomparable.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => Some(Ordering::Equal),
            (Scalar::Integer(a), Scalar::Integer(b)) => Some(a.cmp(b)),
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl From<&serde_json::Value> for Scalar {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Integer(i),
                None => n.as_f64().map(Scalar::Real).unwrap_or(Scalar::Null),
            },
            Value::String(s) => Scalar::Text(s.clone()),
            // Nested structures are kept as their JSON text
            Value::Array(_) | Value::Object(_) => Scalar::Text(value.to_string()),
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Real(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

/// One row: column name to value, in column order
pub type Row = IndexMap<String, Scalar>;

/// Errors raised while building keys, key sets or datasets
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    /// The key is empty or contains characters not allowed in a table name
    #[error("Invalid data key '{0}': use ASCII letters, digits and '_'")]
    InvalidKey(String),

    /// The same key was configured twice
    #[error("Duplicate data key '{0}'")]
    DuplicateKey(String),

    /// No keys were configured
    #[error("At least one data key must be configured")]
    EmptyKeySet,

    /// A dataset was asked to hold a key outside its key set
    #[error("Unknown data key '{0}'")]
    UnknownKey(String),
}

/// Returns true if `name` can be used verbatim as part of a table name
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A validated data key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DataKey(String);

impl DataKey {
    pub fn new(name: impl Into<String>) -> Result<Self, KeyError> {
        let name = name.into();
        if is_identifier(&name) {
            Ok(Self(name))
        } else {
            Err(KeyError::InvalidKey(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DataKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed, ordered set of configured data keys
///
/// Built once from configuration and never mutated. The first key is the
/// canonical key used for the staleness check.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySet(Vec<DataKey>);

impl KeySet {
    pub fn new<I, S>(names: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<DataKey> = Vec::new();
        for name in names {
            let key = DataKey::new(name)?;
            if keys.contains(&key) {
                return Err(KeyError::DuplicateKey(key.0));
            }
            keys.push(key);
        }
        if keys.is_empty() {
            return Err(KeyError::EmptyKeySet);
        }
        Ok(Self(keys))
    }

    /// The key whose table drives the staleness decision
    pub fn canonical(&self) -> &DataKey {
        // Construction guarantees at least one key
        &self.0[0]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|k| k.as_str() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-key row-sets for one synchronization cycle
///
/// A dataset always holds exactly one (possibly empty) row-set for every key
/// of the key set it was built from, in key-set order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Dataset {
    tables: IndexMap<DataKey, Vec<Row>>,
}

impl Dataset {
    /// Creates a dataset with an empty row-set for each key
    pub fn empty(keys: &KeySet) -> Self {
        Self {
            tables: keys.iter().map(|k| (k.clone(), Vec::new())).collect(),
        }
    }

    /// Replaces the rows stored under `key`
    pub fn insert(&mut self, key: &str, rows: Vec<Row>) -> Result<(), KeyError> {
        match self.tables.get_mut(key) {
            Some(slot) => {
                *slot = rows;
                Ok(())
            }
            None => Err(KeyError::UnknownKey(key.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[Row]> {
        self.tables.get(key).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Vec<Row>> {
        self.tables.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DataKey, &Vec<Row>)> {
        self.tables.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&DataKey, &mut Vec<Row>)> {
        self.tables.iter_mut()
    }

    /// Total number of rows across all keys
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// True when no key holds any row
    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}
