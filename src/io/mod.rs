//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT client feeding device messages into the pipeline
//! - `mqtt_egress` - MQTT publisher for the live alert/status feed
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `channels` - Notification channel backends (webhook, log)
//! - `persistence` - JSONL sink for alert and reading records
//! - `prometheus` - Prometheus metrics and health HTTP endpoint

pub mod channels;
pub mod egress_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod persistence;
pub mod prometheus;

pub use channels::{build_channels, LogChannel, WebhookChannel};
pub use egress_channel::{create_egress_channel, EgressSender};
pub use mqtt_egress::MqttPublisher;
pub use persistence::{create_persistence_channel, JsonlSink, PersistenceSender};
