//! Shared types for the care gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Newtype wrapper for device identities to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grouping key for devices and recipients (care facility, household, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FacilityId(pub String);

impl FacilityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for FacilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(pub String);

impl RecipientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RecipientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordinal alert severity. Serialized as its number (0..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AlertLevel {
    Info = 0,
    Notice = 1,
    Warning = 2,
    Emergency = 3,
}

impl AlertLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Clamp an arbitrary device-reported level into the known range
    pub fn saturating_from(level: i64) -> Self {
        match level {
            i64::MIN..=0 => AlertLevel::Info,
            1 => AlertLevel::Notice,
            2 => AlertLevel::Warning,
            _ => AlertLevel::Emergency,
        }
    }

    pub fn is_emergency(self) -> bool {
        self >= AlertLevel::Emergency
    }
}

impl From<AlertLevel> for u8 {
    fn from(level: AlertLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for AlertLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AlertLevel::Info),
            1 => Ok(AlertLevel::Notice),
            2 => Ok(AlertLevel::Warning),
            3 => Ok(AlertLevel::Emergency),
            other => Err(format!("alert level out of range: {other}")),
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// What condition an alert reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    Fall,
    BedExit,
    HighTemp,
    LowTemp,
    HighHumidity,
    NoMotion,
    AnomalyComposite,
    ManualTest,
    /// Pre-classified alert from a device with no recognised type
    DeviceReported,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Fall => "fall",
            AlertKind::BedExit => "bed-exit",
            AlertKind::HighTemp => "high-temp",
            AlertKind::LowTemp => "low-temp",
            AlertKind::HighHumidity => "high-humidity",
            AlertKind::NoMotion => "no-motion",
            AlertKind::AnomalyComposite => "anomaly-composite",
            AlertKind::ManualTest => "manual-test",
            AlertKind::DeviceReported => "device-reported",
        }
    }
}

impl std::str::FromStr for AlertKind {
    type Err = std::convert::Infallible;

    /// Accepts both kebab-case and the firmware's snake_case spellings.
    /// Unknown types map to `DeviceReported`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "fall" => AlertKind::Fall,
            "bed-exit" => AlertKind::BedExit,
            "high-temp" => AlertKind::HighTemp,
            "low-temp" => AlertKind::LowTemp,
            "high-humidity" => AlertKind::HighHumidity,
            "no-motion" => AlertKind::NoMotion,
            "anomaly-composite" | "anomaly" => AlertKind::AnomalyComposite,
            "manual-test" | "test" => AlertKind::ManualTest,
            _ => AlertKind::DeviceReported,
        })
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery channel capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    PushMessage,
    RichCard,
    EmergencyEscalation,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::PushMessage => "push-message",
            ChannelKind::RichCard => "rich-card",
            ChannelKind::EmergencyEscalation => "emergency-escalation",
        }
    }

    /// Primary channels are attempted on every dispatch; escalation only on demand
    pub fn is_primary(&self) -> bool {
        !matches!(self, ChannelKind::EmergencyEscalation)
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "push-message" | "push" => Ok(ChannelKind::PushMessage),
            "rich-card" | "card" => Ok(ChannelKind::RichCard),
            "emergency-escalation" | "emergency" => Ok(ChannelKind::EmergencyEscalation),
            other => Err(format!("unknown channel kind: {other}")),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Named metrics carried by a sensor reading
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurements {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    /// ToF distance in millimetres
    pub distance: Option<f64>,
    /// ToF zone classification (NEAR / MID / FAR)
    pub zone: Option<String>,
    pub motion: Option<bool>,
    pub fall_detected: bool,
    pub battery: Option<f64>,
}

impl Measurements {
    pub fn motion_observed(&self) -> bool {
        self.motion.unwrap_or(false)
    }
}

/// Normalized telemetry sample from one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub device_id: DeviceId,
    pub facility_id: Option<FacilityId>,
    pub timestamp: DateTime<Utc>,
    pub measurements: Measurements,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusUpdate {
    pub device_id: DeviceId,
    pub facility_id: Option<FacilityId>,
    pub status: String,
    pub battery: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationUpdate {
    pub device_id: DeviceId,
    pub facility_id: Option<FacilityId>,
    pub location: GeoPoint,
    pub satellites: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Alert already classified by the device firmware
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawAlert {
    pub device_id: DeviceId,
    pub facility_id: Option<FacilityId>,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub location: Option<GeoPoint>,
    pub timestamp: DateTime<Utc>,
}

/// A recipient announcing a channel address (e.g. first chat contact)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientRegistration {
    pub recipient_id: RecipientId,
    pub channel: ChannelKind,
    pub address: String,
    pub facility_id: Option<FacilityId>,
}

/// Typed result of routing one transport message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Reading(SensorReading),
    Status(DeviceStatusUpdate),
    Location(LocationUpdate),
    Alert(RawAlert),
    Registration(RecipientRegistration),
}

impl InboundMessage {
    /// Device the message belongs to; registrations are not device-scoped
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            InboundMessage::Reading(r) => Some(&r.device_id),
            InboundMessage::Status(s) => Some(&s.device_id),
            InboundMessage::Location(l) => Some(&l.device_id),
            InboundMessage::Alert(a) => Some(&a.device_id),
            InboundMessage::Registration(_) => None,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            InboundMessage::Reading(_) => "reading",
            InboundMessage::Status(_) => "status",
            InboundMessage::Location(_) => "location",
            InboundMessage::Alert(_) => "alert",
            InboundMessage::Registration(_) => "registration",
        }
    }
}

/// Per-device state kept between readings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    pub last_motion_at: Option<DateTime<Utc>>,
    pub last_distance: Option<f64>,
    pub last_status: Option<String>,
    pub last_location: Option<GeoPoint>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Detection result that has not been through the filter yet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateAlert {
    pub device_id: DeviceId,
    pub facility_id: Option<FacilityId>,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

/// Emitted alert with its identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub device_id: DeviceId,
    pub facility_id: Option<FacilityId>,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn from_candidate(id: Uuid, candidate: CandidateAlert) -> Self {
        Self {
            id,
            device_id: candidate.device_id,
            facility_id: candidate.facility_id,
            level: candidate.level,
            kind: candidate.kind,
            message: candidate.message,
            detail: candidate.detail,
            created_at: candidate.created_at,
        }
    }

    /// Coordinates attached under `detail.location`, if any
    pub fn location(&self) -> Option<GeoPoint> {
        self.detail
            .get("location")
            .and_then(|loc| serde_json::from_value::<GeoPoint>(loc.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_alert_kind_from_str() {
        assert_eq!("fall".parse::<AlertKind>().unwrap(), AlertKind::Fall);
        assert_eq!("bed_exit".parse::<AlertKind>().unwrap(), AlertKind::BedExit);
        assert_eq!("HIGH_TEMP".parse::<AlertKind>().unwrap(), AlertKind::HighTemp);
        assert_eq!("something".parse::<AlertKind>().unwrap(), AlertKind::DeviceReported);
    }

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Emergency > AlertLevel::Warning);
        assert!(AlertLevel::Emergency.is_emergency());
        assert!(!AlertLevel::Warning.is_emergency());
        assert_eq!(AlertLevel::saturating_from(7), AlertLevel::Emergency);
        assert_eq!(AlertLevel::saturating_from(-1), AlertLevel::Info);
    }

    #[test]
    fn test_alert_level_serializes_as_number() {
        assert_eq!(serde_json::to_value(AlertLevel::Warning).unwrap(), json!(2));
        assert!(serde_json::from_value::<AlertLevel>(json!(9)).is_err());
    }

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!("push".parse::<ChannelKind>().unwrap(), ChannelKind::PushMessage);
        assert_eq!("rich_card".parse::<ChannelKind>().unwrap(), ChannelKind::RichCard);
        assert!("carrier-pigeon".parse::<ChannelKind>().is_err());
        assert!(!ChannelKind::EmergencyEscalation.is_primary());
    }

    #[test]
    fn test_alert_location_from_detail() {
        let alert = Alert {
            id: Uuid::now_v7(),
            device_id: DeviceId::new("d1"),
            facility_id: None,
            level: AlertLevel::Emergency,
            kind: AlertKind::Fall,
            message: "fall".to_string(),
            detail: json!({"location": {"latitude": 35.0, "longitude": 139.0}}),
            created_at: Utc::now(),
        };
        assert_eq!(alert.location(), Some(GeoPoint { latitude: 35.0, longitude: 139.0 }));
    }
}
