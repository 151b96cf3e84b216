//! Domain models - core pipeline types
//!
//! This module contains the canonical data types used throughout the system:
//! - `SensorReading` / `DeviceStatusUpdate` / `LocationUpdate` / `RawAlert` - normalized inbound messages
//! - `DeviceState` - per-device state kept between readings
//! - `CandidateAlert` / `Alert` - detection results before and after filtering
//! - `wire` - device firmware JSON shapes
//! - `error` - failure taxonomy

pub mod error;
pub mod types;
pub mod wire;

pub use error::{ChannelDeliveryFailure, PipelineError, RegistryUnavailable, StateUnavailable};
pub use types::{
    Alert, AlertKind, AlertLevel, CandidateAlert, ChannelKind, DeviceId, DeviceState, FacilityId,
    GeoPoint, InboundMessage, RecipientId, SensorReading,
};
