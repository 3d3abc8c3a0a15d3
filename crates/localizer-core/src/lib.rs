//! Localizer Core - Sensor registry and reading republishing pipeline
//!
//! This crate provides the transport-independent parts of the localizer:
//! - Sensor registry mapping rtl_433 radio (id, channel) pairs to physical sensors
//! - Reading decoding and Oregon Scientific family classification
//! - Transformation into per-metric topic documents and time-series records
//! - Dispatching to injected message and storage sinks

pub mod dispatch;
pub mod point;
pub mod reading;
pub mod registry;
pub mod transform;

pub use dispatch::{
    DeliveryReport, DispatchOutcome, Dispatcher, DispatcherConfig, MessageSink, SinkError,
    StorageSink,
};
pub use point::WritePoint;
pub use reading::{DecodeError, FamilyClassifier, Reading, BATTERY_UNSEEN, OREGON_FAMILY_PREFIX};
pub use registry::{SensorIdentity, SensorRegistry};
pub use transform::{
    build_base, build_storage_document, build_topic_documents, topic_path, BaseBlock,
    BatteryState, MetricDocument, MetricValue, StorageDocument,
};
