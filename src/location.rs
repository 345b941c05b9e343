//! Location context for one monitored point
//!
//! A `LocationContext` pairs the (latitude, longitude) identity used by every
//! storage query with the staleness threshold (TTL) for that point. Updates
//! arriving as raw text are validated field by field: a rejected field keeps
//! its previous value and never blocks the other fields of the same update.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Largest accepted TTL, in minutes (about 19,000 years)
pub const MAX_TTL_MINUTES: f64 = 1e10;

/// Errors raised when a location field receives an invalid value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// The input could not be read as a finite number
    #[error("{field}: '{input}' is not a number")]
    NotNumeric { field: &'static str, input: String },

    /// The value is numeric but outside the accepted range
    #[error("{field}: {value} is out of range")]
    OutOfRange { field: &'static str, value: f64 },
}

/// A (latitude, longitude) pair identifying a monitored point
///
/// Storage lookups compare both coordinates with exact equality, so a
/// location must be reproduced bit-for-bit to find its history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

/// Location identity plus the staleness threshold for that location
#[derive(Debug, Clone, PartialEq)]
pub struct LocationContext {
    location: Location,
    /// Staleness threshold in minutes
    ttl_minutes: f64,
}

impl LocationContext {
    /// Creates a context from typed values
    ///
    /// # Returns
    /// * `Ok(LocationContext)` if all values are finite and the TTL is not negative
    /// * `Err(ValidationError)` naming the first offending field
    pub fn new(latitude: f64, longitude: f64, ttl_minutes: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            location: Location::new(
                check_finite("latitude", latitude)?,
                check_finite("longitude", longitude)?,
            ),
            ttl_minutes: check_ttl(check_finite("ttl", ttl_minutes)?)?,
        })
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn ttl_minutes(&self) -> f64 {
        self.ttl_minutes
    }

    /// The TTL as a chrono duration, rounded down to whole seconds
    pub fn ttl(&self) -> Duration {
        Duration::try_seconds((self.ttl_minutes * 60.0) as i64).unwrap_or(Duration::MAX)
    }

    /// Sets the latitude from raw input, keeping the previous value on rejection
    pub fn set_latitude(&mut self, raw: &str) -> Result<(), ValidationError> {
        let value = parse_field("latitude", raw)?;
        self.location.latitude = value;
        Ok(())
    }

    /// Sets the longitude from raw input, keeping the previous value on rejection
    pub fn set_longitude(&mut self, raw: &str) -> Result<(), ValidationError> {
        let value = parse_field("longitude", raw)?;
        self.location.longitude = value;
        Ok(())
    }

    /// Sets the TTL (minutes) from raw input, keeping the previous value on rejection
    pub fn set_ttl(&mut self, raw: &str) -> Result<(), ValidationError> {
        let value = parse_field("ttl", raw).and_then(|v| logged(check_ttl(v)))?;
        self.ttl_minutes = value;
        Ok(())
    }

    /// Applies any subset of raw overrides
    ///
    /// Each field is applied independently. Valid fields are always applied,
    /// even when another field of the same call is rejected.
    ///
    /// # Returns
    /// The rejections, in field order (empty when everything was applied)
    pub fn apply_overrides(
        &mut self,
        latitude: Option<&str>,
        longitude: Option<&str>,
        ttl: Option<&str>,
    ) -> Vec<ValidationError> {
        let results = [
            latitude.map(|raw| self.set_latitude(raw)),
            longitude.map(|raw| self.set_longitude(raw)),
            ttl.map(|raw| self.set_ttl(raw)),
        ];
        results
            .into_iter()
            .flatten()
            .filter_map(Result::err)
            .collect()
    }
}

/// Parses a raw field value, logging the rejection if it is not a finite number
fn parse_field(field: &'static str, raw: &str) -> Result<f64, ValidationError> {
    let parsed = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| ValidationError::NotNumeric {
            field,
            input: raw.to_string(),
        })
        .and_then(|v| {
            if v.is_finite() {
                Ok(v)
            } else {
                Err(ValidationError::NotNumeric {
                    field,
                    input: raw.to_string(),
                })
            }
        });
    logged(parsed)
}

fn logged<T>(result: Result<T, ValidationError>) -> Result<T, ValidationError> {
    if let Err(ref e) = result {
        warn!(error = %e, "Rejected location update, keeping previous value");
    }
    result
}

fn check_finite(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

fn check_ttl(value: f64) -> Result<f64, ValidationError> {
    if !(0.0..=MAX_TTL_MINUTES).contains(&value) {
        Err(ValidationError::OutOfRange {
            field: "ttl",
            value,
        })
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> LocationContext {
        LocationContext::new(49.28, -123.12, 10.0).unwrap()
    }

    #[test]
    fn test_new_rejects_non_finite_values() {
        assert!(LocationContext::new(f64::NAN, 0.0, 10.0).is_err());
        assert!(LocationContext::new(0.0, f64::INFINITY, 10.0).is_err());
        assert!(LocationContext::new(0.0, 0.0, -1.0).is_err());
    }

    #[test]
    fn test_set_latitude_accepts_numeric_text() {
        let mut ctx = context();
        ctx.set_latitude(" 10.5 ").unwrap();
        assert_eq!(ctx.location().latitude, 10.5);
    }

    #[test]
    fn test_set_latitude_rejects_text_and_keeps_previous() {
        let mut ctx = context();
        let err = ctx.set_latitude("north").unwrap_err();
        assert!(matches!(err, ValidationError::NotNumeric { field: "latitude", .. }));
        assert_eq!(ctx.location().latitude, 49.28);
    }

    #[test]
    fn test_set_longitude_rejects_nan() {
        let mut ctx = context();
        assert!(ctx.set_longitude("NaN").is_err());
        assert_eq!(ctx.location().longitude, -123.12);
    }

    #[test]
    fn test_set_ttl_rejects_negative() {
        let mut ctx = context();
        let err = ctx.set_ttl("-5").unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { field: "ttl", .. }));
        assert_eq!(ctx.ttl_minutes(), 10.0);
    }

    #[test]
    fn test_apply_overrides_is_partial() {
        let mut ctx = context();
        let rejected = ctx.apply_overrides(Some("1.5"), Some("east"), Some("30"));

        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].to_string().contains("longitude"));
        assert_eq!(ctx.location(), Location::new(1.5, -123.12));
        assert_eq!(ctx.ttl_minutes(), 30.0);
    }

    #[test]
    fn test_apply_overrides_with_nothing_changes_nothing() {
        let mut ctx = context();
        assert!(ctx.apply_overrides(None, None, None).is_empty());
        assert_eq!(ctx, context());
    }

    #[test]
    fn test_set_ttl_rejects_values_beyond_duration_range() {
        let mut ctx = context();
        for raw in ["1e20", "1e15"] {
            let err = ctx.set_ttl(raw).unwrap_err();
            assert!(matches!(err, ValidationError::OutOfRange { field: "ttl", .. }));
        }
        assert_eq!(ctx.ttl_minutes(), 10.0);
        assert!(LocationContext::new(0.0, 0.0, 1e20).is_err());
    }

    #[test]
    fn test_largest_ttl_converts_without_overflow() {
        let ctx = LocationContext::new(0.0, 0.0, MAX_TTL_MINUTES).unwrap();
        assert_eq!(ctx.ttl(), Duration::seconds(600_000_000_000));
    }

    #[test]
    fn test_ttl_duration() {
        let ctx = LocationContext::new(0.0, 0.0, 1.5).unwrap();
        assert_eq!(ctx.ttl(), Duration::seconds(90));
    }
}
