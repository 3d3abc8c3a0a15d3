//! Publication dispatcher - filter, lookup, transform and deliver one message
//!
//! The dispatcher holds no mutable state. Sinks are injected as trait objects
//! and may be called concurrently from several in-flight messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::point::WritePoint;
use crate::reading::{FamilyClassifier, Reading};
use crate::registry::SensorRegistry;
use crate::transform::{build_base, build_storage_document, build_topic_documents};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Storage write failed: {0}")]
    Write(String),
    #[error("Failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Topic-based message sink (MQTT)
///
/// Implementations publish with at-most-once delivery.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SinkError>;
}

/// Time-series write sink (InfluxDB)
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn write(&self, point: &WritePoint) -> Result<(), SinkError>;
}

/// Where a message ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Registry is empty, nothing can match
    NoSensors,
    /// Payload or timestamp could not be decoded
    Undecodable,
    /// Model does not belong to the supported family
    UnsupportedFamily,
    /// Supported model but not one of ours
    Unregistered { id: i64, channel: i64 },
    /// Matched and handed to the sinks
    Delivered(DeliveryReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub published: usize,
    pub publish_failures: usize,
    /// `None` when no storage sink is configured
    pub stored: Option<bool>,
}

/// Static settings for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Prefix of every republished topic
    pub topic_base: String,
    /// Measurement name for storage writes
    pub measurement: String,
    /// Retain flag for republished documents
    pub retain: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            topic_base: "home".to_string(),
            measurement: "oregon".to_string(),
            retain: true,
        }
    }
}

/// Stateless message handler shared by every delivery task
pub struct Dispatcher {
    registry: Arc<SensorRegistry>,
    classifier: FamilyClassifier,
    config: DispatcherConfig,
    messages: Option<Arc<dyn MessageSink>>,
    storage: Option<Arc<dyn StorageSink>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SensorRegistry>, classifier: FamilyClassifier, config: DispatcherConfig) -> Self {
        Self {
            registry,
            classifier,
            config,
            messages: None,
            storage: None,
        }
    }

    /// Republish per-metric documents to this sink
    pub fn with_message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.messages = Some(sink);
        self
    }

    /// Write combined records to this sink
    pub fn with_storage_sink(mut self, sink: Arc<dyn StorageSink>) -> Self {
        self.storage = Some(sink);
        self
    }

    /// Handle one inbound payload, stamping storage writes with the current time
    pub async fn handle(&self, payload: &[u8]) -> DispatchOutcome {
        self.handle_at(payload, Utc::now()).await
    }

    /// Handle one inbound payload with an explicit processing time
    pub async fn handle_at(&self, payload: &[u8], now: DateTime<Utc>) -> DispatchOutcome {
        if self.registry.is_empty() {
            return DispatchOutcome::NoSensors;
        }

        let reading = match Reading::parse(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable rtl_433 message");
                return DispatchOutcome::Undecodable;
            }
        };

        if !self.classifier.is_supported(&reading) {
            trace!(model = %reading.model, "Ignoring unsupported model");
            return DispatchOutcome::UnsupportedFamily;
        }

        let Some(identity) = self.registry.lookup(reading.id, reading.channel) else {
            debug!(
                id = reading.id,
                channel = reading.channel,
                model = %reading.model,
                "Ignoring unregistered sensor"
            );
            return DispatchOutcome::Unregistered {
                id: reading.id,
                channel: reading.channel,
            };
        };

        let base = match build_base(&reading, identity) {
            Ok(b) => b,
            Err(e) => {
                warn!(id = reading.id, channel = reading.channel, error = %e, "Dropping reading");
                return DispatchOutcome::Undecodable;
            }
        };

        debug!(
            floor = %base.floor,
            location = %base.location,
            temperature = reading.temperature,
            "Dispatching reading"
        );

        let mut report = DeliveryReport::default();

        if let Some(sink) = &self.messages {
            for doc in build_topic_documents(&base, &reading) {
                let topic = doc.topic(&self.config.topic_base);
                let result = match doc.to_json() {
                    Ok(payload) => sink.publish(&topic, payload, self.config.retain).await,
                    Err(e) => Err(SinkError::from(e)),
                };
                match result {
                    Ok(()) => {
                        trace!(topic = %topic, "Published");
                        report.published += 1;
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Publish failed");
                        report.publish_failures += 1;
                    }
                }
            }
        }

        if let Some(sink) = &self.storage {
            let doc = build_storage_document(&base, &reading);
            let point = WritePoint::from_document(&self.config.measurement, &doc, now);
            match sink.write(&point).await {
                Ok(()) => report.stored = Some(true),
                Err(e) => {
                    warn!(measurement = %point.measurement, error = %e, "Storage write failed");
                    report.stored = Some(false);
                }
            }
        }

        DispatchOutcome::Delivered(report)
    }
}
