//! Staleness coordinator
//!
//! One `check_and_update` cycle decides between serving stored rows and
//! refreshing from the remote API:
//!
//! 1. Look up the newest ingestion timestamp of the first configured key.
//! 2. Fresh (age within TTL): read every key's latest rows from the store.
//! 3. Stale: fetch, normalize and append every key in one transaction.
//! 4. Fetch or decode failure: serve the latest stored rows regardless of
//!    age, failing only when nothing was ever stored for the location.

use chrono::{Duration, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{SqliteStore, StoreError, TableLayout, TableTarget};
use crate::config::{ConfigError, SyncConfig};
use crate::data::{
    render_url, truncate_to_seconds, Dataset, DatasetConverter, Fetcher, NormalizeError,
    Normalizer, Row,
};
use crate::location::{Location, LocationContext};

/// Errors surfaced by a sync cycle
#[derive(Debug, Error)]
pub enum SyncError {
    /// The refresh failed and no rows were ever stored for the location
    #[error("No stored data for location ({latitude}, {longitude}) and refresh failed")]
    EmptyStore { latitude: f64, longitude: f64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The normalizer stamps rows with a different column than the layout reads
    #[error("Normalizer writes '{found}' but the store layout expects '{expected}'")]
    DateColumnMismatch { expected: String, found: String },
}

/// How a cycle produced its dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Stored rows were within the TTL
    Fresh,
    /// New rows were fetched and stored
    Refreshed,
    /// The refresh failed; stored rows were served regardless of age
    FallbackStale,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SyncStatus::Fresh => "fresh",
            SyncStatus::Refreshed => "refreshed",
            SyncStatus::FallbackStale => "fallback-stale",
        };
        f.write_str(label)
    }
}

/// Result of a successful cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Synced {
    pub dataset: Dataset,
    pub status: SyncStatus,
}

impl Synced {
    pub fn into_dataset(self) -> Dataset {
        self.dataset
    }
}

/// Whether data stamped `last` is still usable at `now`
///
/// The boundary is inclusive: data exactly `ttl` old is fresh. No timestamp
/// means stale.
pub fn is_fresh(last: Option<NaiveDateTime>, now: NaiveDateTime, ttl: Duration) -> bool {
    match last {
        Some(last) => now - last <= ttl,
        None => false,
    }
}

/// Why a refresh attempt produced no dataset
#[derive(Debug, Error)]
enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] crate::data::FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

/// Fetches one payload and turns it into a dataset stamped `now`
///
/// The store connection is not `Sync`, so it must stay out of any borrow held
/// across the fetch.
async fn fetch_and_normalize(
    fetcher: &dyn Fetcher,
    normalizer: &Normalizer,
    url: &str,
    location: Location,
    now: NaiveDateTime,
) -> Result<Dataset, RefreshError> {
    let raw = fetcher.fetch(url).await?;
    Ok(normalizer.normalize(&raw, location, now)?)
}

/// Runs TTL-gated sync cycles against one store
pub struct SyncCoordinator {
    url_template: String,
    layout: TableLayout,
    normalizer: Normalizer,
    fetcher: Box<dyn Fetcher>,
    store: SqliteStore,
}

impl SyncCoordinator {
    /// Creates a coordinator
    ///
    /// # Returns
    /// * `Err(SyncError::DateColumnMismatch)` if the normalizer's date column
    ///   is not the layout's
    pub fn new(
        url_template: impl Into<String>,
        layout: TableLayout,
        normalizer: Normalizer,
        fetcher: Box<dyn Fetcher>,
        store: SqliteStore,
    ) -> Result<Self, SyncError> {
        let expected = layout.date_column();
        if normalizer.date_column() != expected {
            return Err(SyncError::DateColumnMismatch {
                expected,
                found: normalizer.date_column().to_string(),
            });
        }
        Ok(Self {
            url_template: url_template.into(),
            layout,
            normalizer,
            fetcher,
            store,
        })
    }

    /// Builds a coordinator from a validated configuration
    pub fn from_config(
        config: &SyncConfig,
        converter: Box<dyn DatasetConverter>,
        fetcher: Box<dyn Fetcher>,
        store: SqliteStore,
    ) -> Result<Self, ConfigError> {
        let layout = config.layout()?;
        let normalizer = Normalizer::new(
            config.key_set()?,
            layout.date_column(),
            config.restrictions.clone(),
            converter,
        )?;
        Self::new(config.source.url_template.clone(), layout, normalizer, fetcher, store)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// Runs one cycle using the current UTC time
    pub async fn check_and_update(&mut self, ctx: &LocationContext) -> Result<Synced, SyncError> {
        let now = truncate_to_seconds(Utc::now().naive_utc());
        self.check_and_update_at(ctx, now).await
    }

    /// Runs one cycle with an explicit clock reading
    pub async fn check_and_update_at(
        &mut self,
        ctx: &LocationContext,
        now: NaiveDateTime,
    ) -> Result<Synced, SyncError> {
        let location = ctx.location();
        let canonical = self.layout.target(self.normalizer.keys().canonical());
        let last = self.store.last_timestamp(&canonical, location)?;

        if is_fresh(last, now, ctx.ttl()) {
            info!(%location, ?last, "Stored data is fresh");
            let dataset = self.read_latest(location)?;
            return Ok(Synced {
                dataset,
                status: SyncStatus::Fresh,
            });
        }

        info!(%location, ?last, ttl_minutes = ctx.ttl_minutes(), "Stored data is stale, refreshing");
        let url = render_url(&self.url_template, location);
        let refreshed =
            fetch_and_normalize(self.fetcher.as_ref(), &self.normalizer, &url, location, now)
                .await;
        match refreshed {
            Ok(dataset) => {
                self.persist(&dataset)?;
                info!(%location, rows = dataset.row_count(), "Refreshed data");
                Ok(Synced {
                    dataset,
                    status: SyncStatus::Refreshed,
                })
            }
            Err(e) => {
                warn!(%location, error = %e, "Refresh failed, falling back to stored data");
                let dataset = self.read_latest(location)?;
                if dataset.is_empty() {
                    warn!(%location, "No stored data to fall back on");
                    return Err(SyncError::EmptyStore {
                        latitude: location.latitude,
                        longitude: location.longitude,
                    });
                }
                Ok(Synced {
                    dataset,
                    status: SyncStatus::FallbackStale,
                })
            }
        }
    }

    fn persist(&mut self, dataset: &Dataset) -> Result<(), StoreError> {
        let batches: Vec<(TableTarget, &[Row])> = dataset
            .iter()
            .map(|(key, rows)| (self.layout.target(key), rows.as_slice()))
            .collect();
        self.store.append_all(&batches)
    }

    /// Reads each key's rows from its own newest ingestion onwards
    ///
    /// Keys with nothing stored yield an empty row-set.
    fn read_latest(&self, location: Location) -> Result<Dataset, StoreError> {
        let keys = self.normalizer.keys();
        let mut dataset = Dataset::empty(keys);
        for key in keys.iter() {
            let target = self.layout.target(key);
            let rows = match self.store.last_timestamp(&target, location)? {
                Some(last) => self.store.read_since(&target, location, last)?,
                None => Vec::new(),
            };
            debug!(key = %key, rows = rows.len(), "Read stored rows");
            if let Some(slot) = dataset.get_mut(key.as_str()) {
                *slot = rows;
            }
        }
        Ok(dataset)
    }
}
