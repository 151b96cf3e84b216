//! Services - business logic and per-device state
//!
//! - `router` - Topic/payload to typed inbound message
//! - `state_store` - Per-device state between readings
//! - `detector` - Rule-based anomaly detection
//! - `alert_filter` - Rate limiting and quiet hours
//! - `registry` - Notification recipients
//! - `render` - Channel-specific alert payloads
//! - `dispatcher` - Multi-channel fan-out
//! - `escalation` - Post-dispatch escalation policy
//! - `dispatch_worker` - Async alert delivery off the lane hot path
//! - `pipeline` - Per-device lanes tying the above together
//! - `digest` - Periodic status broadcast

pub mod alert_filter;
pub mod detector;
pub mod digest;
pub mod dispatch_worker;
pub mod dispatcher;
pub mod escalation;
pub mod pipeline;
pub mod registry;
pub mod render;
pub mod router;
pub mod state_store;

pub use detector::AnomalyDetector;
pub use dispatcher::{channel_table, Dispatcher, NotificationChannel};
pub use pipeline::{Pipeline, PipelineDeps, PipelineHandle, PipelineTasks};
pub use registry::{RecipientDirectory, RecipientRegistry};
