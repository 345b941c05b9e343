//! stalesync library
//!
//! TTL-gated synchronization of location-keyed API data into a local SQLite
//! store. The binary and the integration tests both build on these modules.

pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod location;
pub mod refresh;
pub mod sync;
