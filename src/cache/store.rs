//! SQLite store adapter for synchronized rows
//!
//! Rows are only ever inserted. Lookups match latitude and longitude exactly
//! and every value reaches SQLite as a bound parameter; identifiers, which
//! cannot be bound, are validated and quoted.

use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::data::{
    format_timestamp, is_identifier, parse_timestamp, DataKey, Row, Scalar, KEY_COLUMN,
    LATITUDE_COLUMN, LONGITUDE_COLUMN,
};
use crate::location::Location;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A table name that cannot be used safely
    #[error("Invalid table name '{0}'")]
    InvalidTable(String),

    /// A stored ingestion timestamp that does not parse
    #[error("Invalid timestamp '{value}' in table '{table}'")]
    InvalidTimestamp { table: String, value: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl ToSql for Scalar {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Scalar::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Scalar::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Scalar::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            Scalar::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for Scalar {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Scalar::Null,
            ValueRef::Integer(i) => Scalar::Integer(i),
            ValueRef::Real(r) => Scalar::Real(r),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                Scalar::Text(String::from_utf8_lossy(t).into_owned())
            }
        })
    }
}

/// Resolves the physical table for a data key
///
/// Returns `base` when keys share one table, `<base>_<key>` otherwise.
pub fn resolve_table_name(base: &str, key: &str, key_as_table: bool) -> String {
    if key_as_table {
        format!("{}_{}", base, key)
    } else {
        base.to_string()
    }
}

/// Quotes an identifier for SQLite, doubling embedded quotes
fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Where one data key's rows live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    /// Physical table name
    pub table: String,
    /// Ingestion timestamp column
    pub date_column: String,
    /// Key tag when the table is shared between keys
    pub key: Option<String>,
}

/// Maps data keys to physical tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    base_table: String,
    key_as_table: bool,
}

impl TableLayout {
    pub fn new(base_table: impl Into<String>, key_as_table: bool) -> Result<Self> {
        let base_table = base_table.into();
        if !is_identifier(&base_table) {
            return Err(StoreError::InvalidTable(base_table));
        }
        Ok(Self {
            base_table,
            key_as_table,
        })
    }

    pub fn base_table(&self) -> &str {
        &self.base_table
    }

    pub fn key_as_table(&self) -> bool {
        self.key_as_table
    }

    /// The ingestion timestamp column, named after the base table
    pub fn date_column(&self) -> String {
        format!("{}_date", self.base_table)
    }

    pub fn target(&self, key: &DataKey) -> TableTarget {
        TableTarget {
            table: resolve_table_name(&self.base_table, key.as_str(), self.key_as_table),
            date_column: self.date_column(),
            key: (!self.key_as_table).then(|| key.to_string()),
        }
    }
}

/// SQLite-backed append-only row store
pub struct SqliteStore {
    conn: Connection,
    auto_provision: bool,
}

impl SqliteStore {
    /// Opens (or creates) the database at the given path
    ///
    /// Creates the parent directory if needed and sets WAL journal mode.
    pub fn open(path: &Path, auto_provision: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn,
            auto_provision,
        })
    }

    /// Opens a private in-memory database
    pub fn in_memory(auto_provision: bool) -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            auto_provision,
        })
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        columns
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    /// Creates the table if missing and adds columns the rows introduce
    fn provision(conn: &Connection, target: &TableTarget, rows: &[Row]) -> Result<()> {
        let date = quote(&target.date_column);
        let key_column = match target.key {
            Some(_) => format!(", {} TEXT NOT NULL", quote(KEY_COLUMN)),
            None => String::new(),
        };
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {lat} REAL NOT NULL,
                {lon} REAL NOT NULL,
                {date} TEXT NOT NULL{key_column}
            );
            CREATE INDEX IF NOT EXISTS {index} ON {table}({lat}, {lon}, {date});",
            table = quote(&target.table),
            lat = quote(LATITUDE_COLUMN),
            lon = quote(LONGITUDE_COLUMN),
            index = quote(&format!("idx_{}_location_date", target.table)),
        ))?;

        // SQLite matches column names without regard to ASCII case
        let mut existing = Self::column_names(conn, &target.table)?;
        for row in rows {
            for column in row.keys() {
                if !existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                    debug!(table = %target.table, column = %column, "Adding column");
                    conn.execute(
                        &format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            quote(&target.table),
                            quote(column)
                        ),
                        [],
                    )?;
                    existing.push(column.clone());
                }
            }
        }
        Ok(())
    }

    fn insert_rows(conn: &Connection, target: &TableTarget, rows: &[Row]) -> Result<()> {
        for row in rows {
            let mut columns = Vec::with_capacity(row.len() + 1);
            let mut values: Vec<&dyn ToSql> = Vec::with_capacity(row.len() + 1);
            for (column, value) in row {
                // The tag below is the only source of the key column
                if target.key.is_some() && column.eq_ignore_ascii_case(KEY_COLUMN) {
                    continue;
                }
                columns.push(quote(column));
                values.push(value);
            }
            if let Some(key) = &target.key {
                columns.push(quote(KEY_COLUMN));
                values.push(key);
            }
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(&target.table),
                columns.join(", "),
                placeholders.join(", ")
            );
            conn.execute(&sql, params_from_iter(values))?;
        }
        Ok(())
    }

    /// Appends rows to one table
    pub fn append(&mut self, target: &TableTarget, rows: &[Row]) -> Result<()> {
        self.append_all(&[(target.clone(), rows)])
    }

    /// Appends several tables' rows in one transaction
    ///
    /// Either every batch is stored or none is. Existing rows are never
    /// touched.
    pub fn append_all(&mut self, batches: &[(TableTarget, &[Row])]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (target, rows) in batches {
            if self.auto_provision {
                Self::provision(&tx, target, rows)?;
            }
            Self::insert_rows(&tx, target, rows)?;
            debug!(table = %target.table, rows = rows.len(), "Appended rows");
        }
        tx.commit()?;
        info!(tables = batches.len(), "Persisted dataset");
        Ok(())
    }

    /// Most recent ingestion timestamp for the exact location
    ///
    /// Returns `None` when the table has no matching rows or does not exist.
    pub fn last_timestamp(
        &self,
        target: &TableTarget,
        location: Location,
    ) -> Result<Option<NaiveDateTime>> {
        if !self.table_exists(&target.table)? {
            return Ok(None);
        }
        let date = quote(&target.date_column);
        let mut sql = format!(
            "SELECT MAX({date}) FROM {table} WHERE {lat} = ?1 AND {lon} = ?2",
            table = quote(&target.table),
            lat = quote(LATITUDE_COLUMN),
            lon = quote(LONGITUDE_COLUMN),
        );
        let mut values: Vec<&dyn ToSql> = vec![&location.latitude, &location.longitude];
        if let Some(key) = &target.key {
            sql.push_str(&format!(" AND {} = ?3", quote(KEY_COLUMN)));
            values.push(key);
        }

        let latest: Option<String> =
            self.conn
                .query_row(&sql, params_from_iter(values), |row| row.get(0))?;

        latest
            .map(|value| {
                parse_timestamp(&value).map_err(|_| StoreError::InvalidTimestamp {
                    table: target.table.clone(),
                    value,
                })
            })
            .transpose()
    }

    /// All rows for the exact location ingested at or after `since`
    ///
    /// Rows come back in insertion order. The shared-table key tag is not
    /// part of the returned rows.
    pub fn read_since(
        &self,
        target: &TableTarget,
        location: Location,
        since: NaiveDateTime,
    ) -> Result<Vec<Row>> {
        if !self.table_exists(&target.table)? {
            return Ok(Vec::new());
        }
        let since = format_timestamp(since);
        let mut sql = format!(
            "SELECT * FROM {table} WHERE {lat} = ?1 AND {lon} = ?2 AND {date} >= ?3",
            table = quote(&target.table),
            lat = quote(LATITUDE_COLUMN),
            lon = quote(LONGITUDE_COLUMN),
            date = quote(&target.date_column),
        );
        let mut values: Vec<&dyn ToSql> = vec![&location.latitude, &location.longitude, &since];
        if let Some(key) = &target.key {
            sql.push_str(&format!(" AND {} = ?4", quote(KEY_COLUMN)));
            values.push(key);
        }
        sql.push_str(" ORDER BY rowid");

        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let skip_key = target.key.is_some();
        let rows = stmt.query_map(params_from_iter(values), |row| {
            let mut out = Row::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                if skip_key && name == KEY_COLUMN {
                    continue;
                }
                // Columns added after a row was written read back as NULL
                out.insert(name.clone(), row.get::<_, Scalar>(i)?);
            }
            Ok(out)
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    /// Number of rows stored in a table (all locations)
    pub fn row_count(&self, table: &str) -> Result<usize> {
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }

    /// Column names of a table, in schema order
    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        Self::column_names(&self.conn, table)
    }
}
