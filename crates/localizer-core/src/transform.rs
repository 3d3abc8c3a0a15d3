//! Reading transformation - Shapes matched readings into outbound documents
//!
//! A matched reading produces:
//! - one [`MetricDocument`] per reported metric, each published on its own
//!   `<base>/<floor>/<location>/<metric>` topic
//! - one [`StorageDocument`] carrying every reported metric for the time-series sink

use serde::Serialize;
use std::fmt;

use crate::reading::{DecodeError, Reading};
use crate::registry::SensorIdentity;

/// Identity block shared by every outbound document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseBlock {
    /// Time of day reported by the receiver ("HH:MM:SS")
    pub time: String,
    pub id: i64,
    pub floor: String,
    pub location: String,
}

/// Pair a reading with the identity it matched
pub fn build_base(reading: &Reading, identity: &SensorIdentity) -> Result<BaseBlock, DecodeError> {
    Ok(BaseBlock {
        time: reading.time_of_day()?.to_string(),
        id: identity.display_id(),
        floor: identity.floor.clone(),
        location: identity.location.clone(),
    })
}

/// Battery state as published on the battery topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatteryState {
    High,
    Low,
    Unknown,
}

impl BatteryState {
    /// Map the raw rtl_433 `battery_ok` value
    pub fn from_raw(raw: f64) -> Self {
        if raw == 1.0 {
            Self::High
        } else if raw == 0.0 {
            Self::Low
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Low => "LOW",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metric value; the variant name is the JSON key and topic segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricValue {
    Temperature(f64),
    Humidity(f64),
    Pressure(f64),
    Battery(BatteryState),
}

impl MetricValue {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Temperature(_) => "temperature",
            Self::Humidity(_) => "humidity",
            Self::Pressure(_) => "pressure",
            Self::Battery(_) => "battery",
        }
    }
}

/// Per-metric document: `{"time", "id", "floor", "location", <metric>: <value>}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDocument {
    #[serde(flatten)]
    pub base: BaseBlock,
    #[serde(flatten)]
    pub value: MetricValue,
}

impl MetricDocument {
    /// Topic this document is published on
    pub fn topic(&self, topic_base: &str) -> String {
        topic_path(topic_base, &self.base.floor, &self.base.location, self.value.name())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Documents to republish, in temperature, humidity, pressure, battery order
///
/// Temperature is always present. Humidity and pressure are skipped when zero,
/// battery when the decoder did not report it.
pub fn build_topic_documents(base: &BaseBlock, reading: &Reading) -> Vec<MetricDocument> {
    let mut values = vec![MetricValue::Temperature(reading.temperature)];
    if reading.has_humidity() {
        values.push(MetricValue::Humidity(reading.humidity));
    }
    if reading.has_pressure() {
        values.push(MetricValue::Pressure(reading.pressure));
    }
    if reading.has_battery() {
        values.push(MetricValue::Battery(BatteryState::from_raw(reading.battery)));
    }

    values
        .into_iter()
        .map(|value| MetricDocument {
            base: base.clone(),
            value,
        })
        .collect()
}

/// Combined document for the time-series sink
///
/// Battery is kept as the raw `battery_ok` number, including the `-1`
/// "not reported" value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageDocument {
    #[serde(flatten)]
    pub base: BaseBlock,
    pub temperature: f64,
    pub battery: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
}

pub fn build_storage_document(base: &BaseBlock, reading: &Reading) -> StorageDocument {
    StorageDocument {
        base: base.clone(),
        temperature: reading.temperature,
        battery: reading.battery,
        humidity: reading.has_humidity().then_some(reading.humidity),
        pressure: reading.has_pressure().then_some(reading.pressure),
    }
}

/// Join `<base>/<floor>/<location>/<metric>` with exactly one separator between segments
pub fn topic_path(base: &str, floor: &str, location: &str, metric: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = String::with_capacity(base.len() + floor.len() + location.len() + metric.len() + 3);
    if !base.is_empty() {
        path.push_str(base);
        path.push('/');
    }
    path.push_str(floor);
    path.push('/');
    path.push_str(location);
    path.push('/');
    path.push_str(metric);
    path
}
