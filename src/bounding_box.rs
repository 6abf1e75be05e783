//! Spatial admission filter for downstream subscribers.
//!
//! A bounding box carries six bounds (latitude, longitude, altitude) and
//! admits positions on closed intervals. Subscribers replace their box by
//! sending a JSON update; the update schema is strict so a typoed key fails
//! loudly instead of silently widening the feed.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

const MIN_LATITUDE: &str = "min_latitude";
const MAX_LATITUDE: &str = "max_latitude";
const MIN_LONGITUDE: &str = "min_longitude";
const MAX_LONGITUDE: &str = "max_longitude";
const MIN_ALTITUDE: &str = "min_altitude";
const MAX_ALTITUDE: &str = "max_altitude";

const VALID_KEYS: [&str; 6] = [
    MIN_LATITUDE,
    MAX_LATITUDE,
    MIN_LONGITUDE,
    MAX_LONGITUDE,
    MIN_ALTITUDE,
    MAX_ALTITUDE,
];

const REQUIRED_KEYS: [&str; 4] = [MIN_LATITUDE, MAX_LATITUDE, MIN_LONGITUDE, MAX_LONGITUDE];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
    pub min_altitude: f64,
    pub max_altitude: f64,
}

impl Default for BoundingBox {
    /// The match-all box: whole globe, any plausible altitude
    fn default() -> Self {
        Self {
            min_latitude: -90.0,
            max_latitude: 90.0,
            min_longitude: -180.0,
            max_longitude: 180.0,
            min_altitude: -100.0,
            max_altitude: 10_000_000.0,
        }
    }
}

impl BoundingBox {
    /// Conjunctive admission on all six bounds, closed intervals.
    pub fn within(&self, lat: f64, lon: f64, alt: f64) -> bool {
        lat >= self.min_latitude
            && lat <= self.max_latitude
            && lon >= self.min_longitude
            && lon <= self.max_longitude
            && alt >= self.min_altitude
            && alt <= self.max_altitude
    }

    /// Overlay bounds from URL query parameters. Each key is parsed
    /// independently; an absent or unparseable value keeps the existing
    /// bound.
    pub fn apply_params(&mut self, params: &HashMap<String, String>) {
        for key in VALID_KEYS {
            let Some(raw) = params.get(key) else { continue };
            match raw.parse::<f64>() {
                Ok(value) => {
                    self.set(key, value);
                    debug!(key, value, "bound set from query parameter");
                }
                Err(e) => {
                    debug!(key, raw = %raw, error = %e, "ignoring unparseable query parameter");
                }
            }
        }
    }

    fn set(&mut self, key: &str, value: f64) {
        match key {
            MIN_LATITUDE => self.min_latitude = value,
            MAX_LATITUDE => self.max_latitude = value,
            MIN_LONGITUDE => self.min_longitude = value,
            MAX_LONGITUDE => self.max_longitude = value,
            MIN_ALTITUDE => self.min_altitude = value,
            MAX_ALTITUDE => self.max_altitude = value,
            _ => {}
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BoundingBox({}, {}, {}, {}, {}, {})",
            self.min_latitude,
            self.max_latitude,
            self.min_longitude,
            self.max_longitude,
            self.min_altitude,
            self.max_altitude
        )
    }
}

/// Structured rejection sent back to a subscriber whose update failed.
/// Serializes as `{"result": -1, "errors": ...}`.
#[derive(Debug, Serialize)]
pub struct BboxRejection {
    pub result: i32,
    pub errors: BboxErrors,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BboxErrors {
    Message(String),
    Messages(Vec<String>),
}

impl BboxRejection {
    fn parse_error(e: serde_json::Error) -> Self {
        Self {
            result: -1,
            errors: BboxErrors::Message(format!("JSON parse error: {e}")),
        }
    }

    fn schema_errors(errors: Vec<String>) -> Self {
        Self {
            result: -1,
            errors: BboxErrors::Messages(errors),
        }
    }

    /// Newline-terminated JSON bytes for the reply frame
    pub fn to_json_bytes(&self) -> Vec<u8> {
        let mut buf = serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"result":-1,"errors":"internal error"}"#.to_vec());
        buf.push(b'\n');
        buf
    }
}

/// Validate a subscriber's bounding box update.
///
/// Accepted: a JSON object whose keys are drawn from the six bound names,
/// with the four lat/lon bounds present and every value numeric. Altitude
/// bounds are optional and default to the match-all values.
pub fn validate_update(payload: &[u8]) -> Result<BoundingBox, BboxRejection> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(BboxRejection::parse_error)?;

    let Some(object) = value.as_object() else {
        return Err(BboxRejection::schema_errors(vec![
            "bounding box must be a JSON object".to_string(),
        ]));
    };

    let mut errors = Vec::new();
    for key in object.keys() {
        if !VALID_KEYS.contains(&key.as_str()) {
            errors.push(format!("'{key}' is not a bounding box property"));
        }
    }
    for key in REQUIRED_KEYS {
        if !object.contains_key(key) {
            errors.push(format!("'{key}' is a required property"));
        }
    }
    for (key, value) in object {
        if VALID_KEYS.contains(&key.as_str()) && value.as_f64().is_none() {
            errors.push(format!("'{key}' is not a number"));
        }
    }
    if !errors.is_empty() {
        errors.sort();
        return Err(BboxRejection::schema_errors(errors));
    }

    let mut bbox = BoundingBox::default();
    for (key, value) in object {
        if let Some(number) = value.as_f64() {
            bbox.set(key, number);
        }
    }
    Ok(bbox)
}
