//! GPS payload classification and parsing
//!
//! Position feeds are recognised by their topic (anything containing the
//! configured marker, `gps` by default) and decoded through a field-mapping
//! table instead of ad-hoc shape guessing. The default table accepts the
//! payload layouts emitted by the boat's ESP32 trackers:
//!
//! | # | latitude   | longitude          |
//! |---|------------|--------------------|
//! | 1 | `lat`      | `lng`              |
//! | 2 | `lat`      | `long`, then `lon` |
//! | 3 | `latitude` | `longitude`        |
//!
//! Rows are tried in order and the first row whose fields are present wins.
//! Speed, device id and GPS date/time are optional.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("No position mapping matches fields {0:?}")]
    UnrecognizedShape(Vec<String>),

    #[error("Field '{0}' is not a number")]
    NonNumeric(String),

    #[error("Coordinates out of range: lat={lat}, lon={lon}")]
    OutOfRange { lat: f64, lon: f64 },
}

/// One row of the field-mapping table.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PositionShape {
    pub latitude: String,
    /// Candidate longitude fields, first present one is used
    pub longitude: Vec<String>,
}

impl PositionShape {
    fn new(latitude: &str, longitude: &[&str]) -> Self {
        Self {
            latitude: latitude.to_string(),
            longitude: longitude.iter().map(|field| field.to_string()).collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PayloadSchema {
    /// Topics containing this substring carry position payloads
    pub topic_marker: String,
    pub speed_field: String,
    /// Candidate device id fields, first present one is used
    pub device_fields: Vec<String>,
    /// Device id used when neither the payload nor earlier samples named one
    pub fallback_device_id: Option<String>,
    pub date_field: String,
    pub time_field: String,
    pub shapes: Vec<PositionShape>,
}

impl Default for PayloadSchema {
    fn default() -> Self {
        Self {
            topic_marker: "gps".to_string(),
            speed_field: "speed".to_string(),
            device_fields: vec!["device_id".to_string(), "name".to_string()],
            fallback_device_id: Some("ESP32-NetBox".to_string()),
            date_field: "date".to_string(),
            time_field: "time".to_string(),
            shapes: vec![
                PositionShape::new("lat", &["lng"]),
                PositionShape::new("lat", &["long", "lon"]),
                PositionShape::new("latitude", &["longitude"]),
            ],
        }
    }
}

/// Fields extracted from a single position payload.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub device_id: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
}

impl PayloadSchema {
    pub fn is_position_topic(&self, topic: &str) -> bool {
        topic.contains(&self.topic_marker)
    }

    pub fn parse(&self, payload: &[u8]) -> Result<PositionFix, PayloadError> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

        let (lat_field, lon_field) = self
            .match_shape(object)
            .ok_or_else(|| PayloadError::UnrecognizedShape(object.keys().cloned().collect()))?;

        let latitude = number(&object[lat_field])
            .ok_or_else(|| PayloadError::NonNumeric(lat_field.to_string()))?;
        let longitude = number(&object[lon_field])
            .ok_or_else(|| PayloadError::NonNumeric(lon_field.to_string()))?;

        if !latitude.is_finite()
            || !longitude.is_finite()
            || latitude.abs() > 90.0
            || longitude.abs() > 180.0
        {
            return Err(PayloadError::OutOfRange {
                lat: latitude,
                lon: longitude,
            });
        }

        Ok(PositionFix {
            latitude,
            longitude,
            speed: present(object, &self.speed_field).and_then(number),
            device_id: self
                .device_fields
                .iter()
                .find_map(|field| present(object, field).and_then(text)),
            date: present(object, &self.date_field).and_then(text),
            time: present(object, &self.time_field).and_then(text),
        })
    }

    fn match_shape<'a>(&'a self, object: &Map<String, Value>) -> Option<(&'a str, &'a str)> {
        self.shapes.iter().find_map(|shape| {
            present(object, &shape.latitude)?;
            let lon = shape
                .longitude
                .iter()
                .find(|field| present(object, field).is_some())?;
            Some((shape.latitude.as_str(), lon.as_str()))
        })
    }
}

fn present<'v>(object: &'v Map<String, Value>, field: &str) -> Option<&'v Value> {
    object.get(field).filter(|value| !value.is_null())
}

// Trackers sometimes send numbers as strings
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
