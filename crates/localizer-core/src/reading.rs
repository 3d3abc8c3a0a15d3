//! Inbound rtl_433 readings and sensor family classification

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Model prefix rtl_433 uses for every Oregon Scientific decoder
pub const OREGON_FAMILY_PREFIX: &str = "Oregon";

/// `battery_ok` value meaning the decoder did not report a battery state
pub const BATTERY_UNSEEN: f64 = -1.0;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid rtl_433 JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed timestamp {0:?}, expected \"<date> <time>\"")]
    MalformedTimestamp(String),
}

/// One decoded message as published by rtl_433
///
/// Humidity and pressure use `0` for "not reported". Battery uses
/// [`BATTERY_UNSEEN`] when the field is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub channel: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default, rename = "temperature_C")]
    pub temperature: f64,
    #[serde(default)]
    pub humidity: f64,
    #[serde(default, rename = "pressure_hPa")]
    pub pressure: f64,
    #[serde(default = "battery_unseen", rename = "battery_ok")]
    pub battery: f64,
}

fn battery_unseen() -> f64 {
    BATTERY_UNSEEN
}

impl Reading {
    /// Decode a raw MQTT payload, ignoring unknown fields
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Time component of the `"<date> <time>"` timestamp
    pub fn time_of_day(&self) -> Result<&str, DecodeError> {
        self.time
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| DecodeError::MalformedTimestamp(self.time.clone()))
    }

    pub fn has_humidity(&self) -> bool {
        self.humidity != 0.0
    }

    pub fn has_pressure(&self) -> bool {
        self.pressure != 0.0
    }

    pub fn has_battery(&self) -> bool {
        self.battery != BATTERY_UNSEEN
    }
}

/// Decides whether a reading comes from the supported sensor family
#[derive(Debug, Clone)]
pub struct FamilyClassifier {
    prefix: String,
}

impl FamilyClassifier {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Case-sensitive prefix match on the model name
    pub fn is_supported(&self, reading: &Reading) -> bool {
        reading.model.starts_with(&self.prefix)
    }
}

impl Default for FamilyClassifier {
    fn default() -> Self {
        Self::new(OREGON_FAMILY_PREFIX)
    }
}
