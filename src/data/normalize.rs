//! Payload normalization
//!
//! Turns a raw API payload into a per-key `Dataset`: lossy UTF-8 decoding,
//! JSON parsing, source-specific conversion through a `DatasetConverter`,
//! location and ingestion-time annotation, then the configured row filter and
//! column projection (in that order).

use std::collections::HashSet;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::{
    format_timestamp, Dataset, KeyError, KeySet, Row, Scalar, KEY_COLUMN, LATITUDE_COLUMN,
    LONGITUDE_COLUMN,
};
use crate::location::Location;

/// Errors that can occur while turning a payload into a dataset
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The body is not valid JSON
    #[error("Failed to parse payload: {0}")]
    Parse(#[from] serde_json::Error),

    /// A configured key is absent from the document
    #[error("Missing data key in payload: {0}")]
    MissingKey(String),

    /// The value under a key cannot be read as rows
    #[error("Unexpected shape for '{key}': {reason}")]
    UnexpectedShape { key: String, reason: String },

    /// A projected column does not exist in a row
    #[error("Column '{column}' missing from '{key}' rows")]
    MissingColumn { key: String, column: String },

    /// A projection drops a column every stored row needs
    #[error("Projection for '{key}' must keep column '{column}'")]
    ProjectionDropsColumn { key: String, column: String },

    /// Two columns of one row differ only in ASCII case
    #[error("Columns '{first}' and '{second}' collide in '{key}' rows")]
    ColumnCollision {
        key: String,
        first: String,
        second: String,
    },

    /// A row uses a column name the store keeps for itself
    #[error("Column '{column}' in '{key}' rows is reserved")]
    ReservedColumn { key: String, column: String },

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Source-specific conversion from a parsed document to per-key rows
pub trait DatasetConverter: Send + Sync {
    fn convert(&self, document: &Value, keys: &KeySet) -> Result<Dataset, NormalizeError>;
}

/// General-purpose converter for JSON documents keyed by data key
///
/// Each configured key is looked up in the top-level object. Its value may be
/// an array of objects (one row each), an object of equal-length arrays
/// (columnar series, transposed into rows) or an object of scalars (one row).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordsConverter;

impl RecordsConverter {
    fn rows_for(key: &str, value: &Value) -> Result<Vec<Row>, NormalizeError> {
        let shape_error = |reason: &str| NormalizeError::UnexpectedShape {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        match value {
            Value::Array(records) => records
                .iter()
                .map(|record| match record {
                    Value::Object(fields) => Ok(fields
                        .iter()
                        .map(|(column, v)| (column.clone(), Scalar::from(v)))
                        .collect::<Row>()),
                    _ => Err(shape_error("array elements must be objects")),
                })
                .collect(),
            Value::Object(fields) if fields.is_empty() => Ok(Vec::new()),
            Value::Object(fields) if fields.values().all(Value::is_array) => {
                let columns: Vec<(&String, &Vec<Value>)> = fields
                    .iter()
                    .filter_map(|(column, v)| v.as_array().map(|series| (column, series)))
                    .collect();
                let len = columns[0].1.len();
                if columns.iter().any(|(_, series)| series.len() != len) {
                    return Err(shape_error("series have inconsistent lengths"));
                }
                Ok((0..len)
                    .map(|i| {
                        columns
                            .iter()
                            .map(|(column, series)| ((*column).clone(), Scalar::from(&series[i])))
                            .collect()
                    })
                    .collect())
            }
            Value::Object(fields) if fields.values().any(Value::is_array) => {
                Err(shape_error("mixes series and single values"))
            }
            Value::Object(fields) => Ok(vec![fields
                .iter()
                .map(|(column, v)| (column.clone(), Scalar::from(v)))
                .collect()]),
            _ => Err(shape_error("expected an array or an object")),
        }
    }
}

impl DatasetConverter for RecordsConverter {
    fn convert(&self, document: &Value, keys: &KeySet) -> Result<Dataset, NormalizeError> {
        let mut dataset = Dataset::empty(keys);
        for key in keys.iter() {
            let value = document
                .get(key.as_str())
                .ok_or_else(|| NormalizeError::MissingKey(key.to_string()))?;
            dataset.insert(key.as_str(), Self::rows_for(key.as_str(), value)?)?;
        }
        Ok(dataset)
    }
}

/// Comparison operator of a filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

/// One `column <op> value` test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub op: Comparison,
    pub value: Scalar,
}

impl Condition {
    pub fn new(column: impl Into<String>, op: Comparison, value: impl Into<Scalar>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluates the condition; a missing column or incomparable value is false
    pub fn matches(&self, row: &Row) -> bool {
        let Some(ordering) = row.get(&self.column).and_then(|v| v.compare(&self.value)) else {
            return false;
        };
        match self.op {
            Comparison::Eq => ordering.is_eq(),
            Comparison::Ne => ordering.is_ne(),
            Comparison::Gt => ordering.is_gt(),
            Comparison::Ge => ordering.is_ge(),
            Comparison::Lt => ordering.is_lt(),
            Comparison::Le => ordering.is_le(),
        }
    }
}

/// Row filter and column projection for one data key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Restriction {
    /// Conditions a row must all satisfy to be kept
    #[serde(default)]
    pub filter: Vec<Condition>,
    /// Columns to keep, in output order
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

impl Restriction {
    /// Checks that the projection keeps the location and date columns
    pub fn check_projection(&self, key: &str, date_column: &str) -> Result<(), NormalizeError> {
        let Some(columns) = &self.columns else {
            return Ok(());
        };
        let mandatory = [LATITUDE_COLUMN, LONGITUDE_COLUMN, date_column];
        match mandatory.iter().find(|m| !columns.iter().any(|c| c == *m)) {
            Some(missing) => Err(NormalizeError::ProjectionDropsColumn {
                key: key.to_string(),
                column: missing.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Filters `rows`, then projects the survivors
    pub fn apply(&self, key: &str, rows: Vec<Row>) -> Result<Vec<Row>, NormalizeError> {
        let kept = rows
            .into_iter()
            .filter(|row| self.filter.iter().all(|c| c.matches(row)));

        let Some(columns) = &self.columns else {
            return Ok(kept.collect());
        };

        kept.map(|row| {
            columns
                .iter()
                .map(|column| {
                    row.get(column)
                        .map(|v| (column.clone(), v.clone()))
                        .ok_or_else(|| NormalizeError::MissingColumn {
                            key: key.to_string(),
                            column: column.clone(),
                        })
                })
                .collect::<Result<Row, _>>()
        })
        .collect()
    }
}

/// Builds datasets from raw payloads
pub struct Normalizer {
    keys: KeySet,
    date_column: String,
    restrictions: IndexMap<String, Restriction>,
    converter: Box<dyn DatasetConverter>,
}

impl Normalizer {
    /// Creates a normalizer
    ///
    /// # Returns
    /// * `Err(NormalizeError::Key)` if a restriction names a key outside `keys`
    /// * `Err(NormalizeError::ProjectionDropsColumn)` if a projection would
    ///   drop the location or date column
    pub fn new(
        keys: KeySet,
        date_column: impl Into<String>,
        restrictions: IndexMap<String, Restriction>,
        converter: Box<dyn DatasetConverter>,
    ) -> Result<Self, NormalizeError> {
        let date_column = date_column.into();
        for (key, restriction) in &restrictions {
            if !keys.contains(key) {
                return Err(KeyError::UnknownKey(key.clone()).into());
            }
            restriction.check_projection(key, &date_column)?;
        }
        Ok(Self {
            keys,
            date_column,
            restrictions,
            converter,
        })
    }

    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    pub fn date_column(&self) -> &str {
        &self.date_column
    }

    /// Decodes a body as UTF-8 (invalid sequences become U+FFFD) and parses it
    pub fn decode(raw: &[u8]) -> Result<Value, NormalizeError> {
        let text = String::from_utf8_lossy(raw);
        Ok(serde_json::from_str(&text)?)
    }

    /// Runs the full pipeline for one payload
    ///
    /// # Arguments
    /// * `raw` - The fetched body
    /// * `location` - Location written into every row
    /// * `ingested_at` - Ingestion timestamp written into every row
    pub fn normalize(
        &self,
        raw: &[u8],
        location: Location,
        ingested_at: NaiveDateTime,
    ) -> Result<Dataset, NormalizeError> {
        let document = Self::decode(raw)?;
        let mut dataset = self.converter.convert(&document, &self.keys)?;
        self.annotate(&mut dataset, location, ingested_at);
        let dataset = self.restrict(dataset)?;
        check_columns(&dataset)?;
        Ok(dataset)
    }

    /// Adds the location and ingestion timestamp columns to every row
    pub fn annotate(&self, dataset: &mut Dataset, location: Location, ingested_at: NaiveDateTime) {
        let stamp = format_timestamp(ingested_at);
        for (_, rows) in dataset.iter_mut() {
            for row in rows.iter_mut() {
                row.insert(LATITUDE_COLUMN.to_string(), Scalar::Real(location.latitude));
                row.insert(LONGITUDE_COLUMN.to_string(), Scalar::Real(location.longitude));
                row.insert(self.date_column.clone(), Scalar::Text(stamp.clone()));
            }
        }
    }

    /// Applies each key's restriction; unrestricted keys pass through
    pub fn restrict(&self, mut dataset: Dataset) -> Result<Dataset, NormalizeError> {
        for (key, restriction) in &self.restrictions {
            if let Some(rows) = dataset.get_mut(key) {
                let before = rows.len();
                *rows = restriction.apply(key, std::mem::take(rows))?;
                debug!(key = %key, before, after = rows.len(), "Applied restriction");
            }
        }
        Ok(dataset)
    }
}

/// Rejects rows SQLite could not store column for column
///
/// SQLite column names ignore ASCII case, so `Temp` and `temp` in one row
/// would land in the same column. The key tag column is reserved.
fn check_columns(dataset: &Dataset) -> Result<(), NormalizeError> {
    for (key, rows) in dataset.iter() {
        for row in rows {
            let mut seen: HashSet<String> = HashSet::with_capacity(row.len());
            for column in row.keys() {
                if column.eq_ignore_ascii_case(KEY_COLUMN) {
                    return Err(NormalizeError::ReservedColumn {
                        key: key.to_string(),
                        column: column.clone(),
                    });
                }
                if !seen.insert(column.to_ascii_lowercase()) {
                    let first = row
                        .keys()
                        .find(|c| c.eq_ignore_ascii_case(column))
                        .cloned()
                        .unwrap_or_default();
                    return Err(NormalizeError::ColumnCollision {
                        key: key.to_string(),
                        first,
                        second: column.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
