//! Sensor registry - Maps radio (id, channel) pairs to physical sensor identities
//!
//! The registry is built once at startup from configuration and is never
//! mutated afterwards, so concurrent message handlers share it without locking.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// A known physical sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorIdentity {
    /// Radio channel selected with the switch on the sensor
    pub channel: i64,
    /// Radio ID reported by rtl_433 (re-rolled by the sensor on battery change)
    pub id: i64,
    /// Floor label, used as a tag and as a topic segment
    pub floor: String,
    /// Location label, used as a tag and as a topic segment
    pub location: String,
    /// Stable ID published downstream; defaults to the radio ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_display: Option<i64>,
}

impl SensorIdentity {
    /// ID to publish in outbound documents
    pub fn display_id(&self) -> i64 {
        self.id_display.unwrap_or(self.id)
    }

    fn matches(&self, id: i64, channel: i64) -> bool {
        self.id == id && self.channel == channel
    }
}

/// Read-only table of known sensors
#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    sensor: Vec<SensorIdentity>,
}

impl SensorRegistry {
    /// Build a registry from a list of identities
    ///
    /// Duplicate (id, channel) pairs are kept but only the first one can ever
    /// be returned by [`lookup`](Self::lookup).
    pub fn new(sensors: Vec<SensorIdentity>) -> Self {
        let registry = Self { sensor: sensors };
        for (id, channel) in registry.duplicates() {
            warn!(id, channel, "Duplicate sensor entry, only the first one is used");
        }
        registry
    }

    /// Find the first sensor registered with this radio id and channel
    pub fn lookup(&self, id: i64, channel: i64) -> Option<&SensorIdentity> {
        self.sensor.iter().find(|s| s.matches(id, channel))
    }

    pub fn is_empty(&self) -> bool {
        self.sensor.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sensor.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorIdentity> {
        self.sensor.iter()
    }

    /// (id, channel) pairs that appear more than once
    pub fn duplicates(&self) -> Vec<(i64, i64)> {
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for s in &self.sensor {
            let key = (s.id, s.channel);
            if !seen.insert(key) && !dups.contains(&key) {
                dups.push(key);
            }
        }
        dups
    }
}
