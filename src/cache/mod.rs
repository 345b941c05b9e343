//! Persistent store for synchronized rows
//!
//! This module provides the SQLite store adapter. Rows are appended and never
//! rewritten; freshness is derived from the newest ingestion timestamp stored
//! for a location, and the full history stays available as a fallback when
//! the remote API is unavailable.

mod store;

pub use store::{resolve_table_name, SqliteStore, StoreError, TableLayout, TableTarget};

pub use crate::data::KEY_COLUMN;
