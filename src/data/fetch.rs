//! Remote API fetcher
//!
//! Retrieves the raw payload for a location from the configured URL template.
//! Every transport or protocol failure is returned as a `FetchError`; nothing
//! escapes this boundary as a panic, and no retry happens here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::location::Location;

/// Placeholder substituted with the latitude in URL templates
pub const LATITUDE_PLACEHOLDER: &str = "{latitude}";

/// Placeholder substituted with the longitude in URL templates
pub const LONGITUDE_PLACEHOLDER: &str = "{longitude}";

/// Default request timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors that can occur when fetching from the remote API
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed (connection, timeout, TLS, body read)
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The fetcher itself could not be set up
    #[error("Fetcher unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    /// Builds a status error, truncating the body to keep logs readable
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        };
        FetchError::Status {
            status: status.as_u16(),
            body,
        }
    }
}

/// Source of raw payloads
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches the raw body behind `url`
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Substitutes the location into a URL template
///
/// Replacement is literal and textual: every `{latitude}` and `{longitude}`
/// occurrence is replaced with the coordinate's default formatting.
pub fn render_url(template: &str, location: Location) -> String {
    template
        .replace(LATITUDE_PLACEHOLDER, &location.latitude.to_string())
        .replace(LONGITUDE_PLACEHOLDER, &location.longitude.to_string())
}

/// Fetcher backed by a reqwest HTTP client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    /// Creates a fetcher with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, &body));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url, "Fetching remote data");

        let result = self.get(url).await;
        match &result {
            Ok(body) => debug!(url, bytes = body.len(), "Fetched remote data"),
            Err(e) => warn!(url, error = %e, "Remote fetch failed"),
        }
        result
    }
}
