//! Event routing: classify a transport message by topic and parse its body
//!
//! Topic layouts accepted (last path segment decides):
//! - `care/sensor/data`, `care/<device>/data` -> sensor reading
//! - `care/status`, `care/<device>/status` -> device status update
//! - `care/location`, `care/<device>/location` -> location update
//! - `care/alert`, `care/<device>/alert` -> device-classified alert
//! - `care/recipients/register` -> recipient registration
//!
//! Routing is pure. The caller logs, counts and drops anything rejected here.

use crate::domain::types::{
    DeviceStatusUpdate, GeoPoint, LocationUpdate, Measurements, RawAlert, RecipientRegistration,
};
use crate::domain::wire::{
    AlertPayload, LocationPayload, RegistrationPayload, SensorPayload, StatusPayload,
};
use crate::domain::{
    AlertKind, AlertLevel, ChannelKind, DeviceId, FacilityId, InboundMessage, PipelineError,
    RecipientId, SensorReading,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

/// Message class derived from the topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Data,
    Status,
    Location,
    Alert,
    Register,
}

impl TopicKind {
    pub fn classify(topic: &str) -> Option<Self> {
        match topic.rsplit('/').next()? {
            "data" => Some(TopicKind::Data),
            "status" => Some(TopicKind::Status),
            "location" => Some(TopicKind::Location),
            "alert" => Some(TopicKind::Alert),
            "register" => Some(TopicKind::Register),
            _ => None,
        }
    }
}

/// Parse one transport message into a typed inbound message.
///
/// `received_at` stands in for the timestamp when the payload carries none.
pub fn route(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<InboundMessage, PipelineError> {
    let kind = TopicKind::classify(topic)
        .ok_or_else(|| PipelineError::malformed(topic, "unrecognised topic"))?;

    let body =
        std::str::from_utf8(payload).map_err(|e| PipelineError::malformed(topic, e.to_string()))?;

    match kind {
        TopicKind::Data => {
            let payload: SensorPayload = parse(topic, body)?;
            Ok(InboundMessage::Reading(reading_from(topic, payload, received_at)?))
        }
        TopicKind::Status => {
            let payload: StatusPayload = parse(topic, body)?;
            Ok(InboundMessage::Status(DeviceStatusUpdate {
                device_id: device_id(topic, payload.device_id)?,
                facility_id: payload.facility_id.map(FacilityId),
                status: payload.status,
                battery: payload.battery,
                timestamp: payload.timestamp.resolve(received_at),
            }))
        }
        TopicKind::Location => {
            let payload: LocationPayload = parse(topic, body)?;
            Ok(InboundMessage::Location(LocationUpdate {
                device_id: device_id(topic, payload.device_id)?,
                facility_id: payload.facility_id.map(FacilityId),
                location: GeoPoint { latitude: payload.latitude, longitude: payload.longitude },
                satellites: payload.satellites,
                timestamp: payload.timestamp.resolve(received_at),
            }))
        }
        TopicKind::Alert => {
            let payload: AlertPayload = parse(topic, body)?;
            let kind = payload
                .alert_type
                .as_deref()
                .and_then(|t| t.parse::<AlertKind>().ok())
                .unwrap_or(AlertKind::DeviceReported);
            let location = match (payload.latitude, payload.longitude) {
                (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
                _ => None,
            };
            Ok(InboundMessage::Alert(RawAlert {
                device_id: device_id(topic, payload.device_id)?,
                facility_id: payload.facility_id.map(FacilityId),
                level: AlertLevel::saturating_from(payload.level),
                message: payload.message.unwrap_or_else(|| kind.as_str().to_string()),
                kind,
                location,
                timestamp: payload.timestamp.resolve(received_at),
            }))
        }
        TopicKind::Register => {
            let payload: RegistrationPayload = parse(topic, body)?;
            if payload.recipient_id.is_empty() || payload.address.is_empty() {
                return Err(PipelineError::malformed(topic, "empty recipient_id or address"));
            }
            let channel = payload
                .channel
                .parse::<ChannelKind>()
                .map_err(|e| PipelineError::malformed(topic, e))?;
            Ok(InboundMessage::Registration(RecipientRegistration {
                recipient_id: RecipientId(payload.recipient_id),
                channel,
                address: payload.address,
                facility_id: payload.facility_id.map(FacilityId),
            }))
        }
    }
}

fn parse<T: DeserializeOwned>(topic: &str, body: &str) -> Result<T, PipelineError> {
    serde_json::from_str(body).map_err(|e| PipelineError::malformed(topic, e.to_string()))
}

fn device_id(topic: &str, raw: String) -> Result<DeviceId, PipelineError> {
    if raw.is_empty() {
        return Err(PipelineError::malformed(topic, "empty device_id"));
    }
    Ok(DeviceId(raw))
}

/// Merge the nested firmware blocks with the flat `data` shape
fn reading_from(
    topic: &str,
    payload: SensorPayload,
    received_at: DateTime<Utc>,
) -> Result<SensorReading, PipelineError> {
    let flat = payload.data.unwrap_or_default();
    let tof = payload.tof;
    let env = payload.environment;

    let (tof_distance, tof_zone) = match tof {
        Some(t) => (t.distance, t.zone),
        None => (None, None),
    };
    let (env_temp, env_humidity) = match env {
        Some(e) => (e.temperature, e.humidity),
        None => (None, None),
    };

    let measurements = Measurements {
        temperature: env_temp.or(flat.temperature),
        humidity: env_humidity.or(flat.humidity),
        distance: tof_distance.or(flat.distance),
        zone: tof_zone.or(flat.zone),
        motion: payload.motion.or(flat.motion),
        fall_detected: payload.imu.map(|imu| imu.fall_detected).unwrap_or(false)
            || flat.fall_detected.unwrap_or(false),
        battery: payload.battery,
    };

    let location =
        payload.gps.map(|gps| GeoPoint { latitude: gps.latitude, longitude: gps.longitude });

    Ok(SensorReading {
        device_id: device_id(topic, payload.device_id)?,
        facility_id: payload.facility_id.map(FacilityId),
        timestamp: payload.timestamp.resolve(received_at),
        measurements,
        location,
    })
}
