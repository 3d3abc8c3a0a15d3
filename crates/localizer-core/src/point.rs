//! Time-series write records and InfluxDB line protocol encoding

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::transform::StorageDocument;

/// One row for the time-series sink
#[derive(Debug, Clone, PartialEq)]
pub struct WritePoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    /// Processing time, not the time reported by the sensor
    pub timestamp: DateTime<Utc>,
}

impl WritePoint {
    /// Tag by floor and location, one field per reported metric
    pub fn from_document(measurement: &str, doc: &StorageDocument, timestamp: DateTime<Utc>) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("floor".to_string(), doc.base.floor.clone());
        tags.insert("location".to_string(), doc.base.location.clone());

        let mut fields = BTreeMap::new();
        fields.insert("temperature".to_string(), doc.temperature);
        fields.insert("battery".to_string(), doc.battery);
        if let Some(humidity) = doc.humidity {
            fields.insert("humidity".to_string(), humidity);
        }
        if let Some(pressure) = doc.pressure {
            fields.insert("pressure".to_string(), pressure);
        }

        Self {
            measurement: measurement.to_string(),
            tags,
            fields,
            timestamp,
        }
    }

    /// Encode as a single line of InfluxDB line protocol with a nanosecond timestamp
    ///
    /// Empty tag values and non-finite fields cannot be represented and are dropped.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| format!("{}={}", escape(k, &[',', '=', ' ']), v))
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));

        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }

        line
    }
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
