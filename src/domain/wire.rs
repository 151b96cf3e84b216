//! Device firmware JSON shapes as they arrive on the broker

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

/// Timestamp that can be either RFC 3339 string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

impl TimestampValue {
    /// Resolve to a UTC instant, falling back to `received_at` when absent or unparsable
    pub fn resolve(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimestampValue::None => received_at,
            TimestampValue::EpochMs(ms) => i64::try_from(*ms)
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or(received_at),
            TimestampValue::IsoString(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(received_at),
        }
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            // Negative epochs predate any real clock; treat as absent
            Ok(u64::try_from(value).map_or(TimestampValue::None, TimestampValue::EpochMs))
        }

        fn visit_f64<E>(self, value: f64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            if value.is_finite() && value >= 0.0 {
                Ok(TimestampValue::EpochMs(value as u64))
            } else {
                Ok(TimestampValue::None)
            }
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// `care/.../data` body
#[derive(Debug, Deserialize)]
pub struct SensorPayload {
    pub device_id: String,
    #[serde(default)]
    pub facility_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: TimestampValue,
    #[serde(default)]
    pub imu: Option<ImuBlock>,
    #[serde(default)]
    pub tof: Option<TofBlock>,
    #[serde(default)]
    pub environment: Option<EnvironmentBlock>,
    #[serde(default)]
    pub gps: Option<GpsBlock>,
    #[serde(default)]
    pub motion: Option<bool>,
    #[serde(default)]
    pub battery: Option<f64>,
    /// Flat metric object used by the older backend shape
    #[serde(default)]
    pub data: Option<FlatMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct ImuBlock {
    #[serde(default)]
    pub fall_detected: bool,
}

#[derive(Debug, Deserialize)]
pub struct TofBlock {
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnvironmentBlock {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct GpsBlock {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub satellites: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlatMetrics {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub motion: Option<bool>,
    #[serde(default)]
    pub fall_detected: Option<bool>,
}

/// `care/.../status` body
#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    pub device_id: String,
    #[serde(default)]
    pub facility_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: TimestampValue,
}

/// `care/.../location` body
#[derive(Debug, Deserialize)]
pub struct LocationPayload {
    pub device_id: String,
    #[serde(default)]
    pub facility_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub satellites: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: TimestampValue,
}

/// `care/.../alert` body
#[derive(Debug, Deserialize)]
pub struct AlertPayload {
    pub device_id: String,
    #[serde(default)]
    pub facility_id: Option<String>,
    pub level: i64,
    #[serde(default, rename = "type")]
    pub alert_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: TimestampValue,
}

/// `care/recipients/register` body
#[derive(Debug, Deserialize)]
pub struct RegistrationPayload {
    pub recipient_id: String,
    pub channel: String,
    pub address: String,
    #[serde(default)]
    pub facility_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_epoch_ms() {
        let payload: StatusPayload = serde_json::from_str(
            r#"{"device_id":"d1","status":"online","timestamp":1767630090048}"#,
        )
        .unwrap();
        assert_eq!(payload.timestamp, TimestampValue::EpochMs(1767630090048));
        let resolved = payload.timestamp.resolve(Utc::now());
        assert_eq!(resolved.timestamp_millis(), 1767630090048);
    }

    #[test]
    fn test_timestamp_rfc3339() {
        let ts = TimestampValue::IsoString("2026-01-05T16:41:30.048+09:00".to_string());
        let resolved = ts.resolve(Utc::now());
        assert_eq!(resolved.to_rfc3339(), "2026-01-05T07:41:30.048+00:00");
    }

    #[test]
    fn test_timestamp_fallback() {
        let fallback = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(TimestampValue::None.resolve(fallback), fallback);
        assert_eq!(TimestampValue::IsoString("garbage".into()).resolve(fallback), fallback);
    }

    #[test]
    fn test_negative_epoch_is_absent() {
        let payload: StatusPayload =
            serde_json::from_str(r#"{"device_id":"d1","status":"online","timestamp":-1}"#).unwrap();
        assert_eq!(payload.timestamp, TimestampValue::None);
    }
}
