//! Command-line interface parsing for stalesync
//!
//! Location overrides are kept as raw text so they go through the same
//! validation as any other location update: a bad value is reported and the
//! configured one stays in effect.

use std::path::PathBuf;

use clap::Parser;

use crate::location::{LocationContext, ValidationError};

/// stalesync - TTL-gated sync of location-keyed API data into SQLite
#[derive(Parser, Debug)]
#[command(name = "stalesync")]
#[command(about = "Serve location data from a local store, refreshing it from the API when stale")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configured one
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Latitude override
    #[arg(long, value_name = "X", allow_hyphen_values = true)]
    pub latitude: Option<String>,

    /// Longitude override
    #[arg(long, value_name = "Y", allow_hyphen_values = true)]
    pub longitude: Option<String>,

    /// Staleness threshold override, in minutes
    #[arg(long, value_name = "MIN", allow_hyphen_values = true)]
    pub ttl: Option<String>,

    /// Keep running, syncing on the configured interval until Ctrl-C
    #[arg(long)]
    pub watch: bool,
}

impl Cli {
    /// Applies the location overrides to `ctx`
    ///
    /// # Returns
    /// The rejected overrides; each one leaves its field unchanged
    pub fn apply_overrides(&self, ctx: &mut LocationContext) -> Vec<ValidationError> {
        ctx.apply_overrides(
            self.latitude.as_deref(),
            self.longitude.as_deref(),
            self.ttl.as_deref(),
        )
    }
}
