//! Rule-based anomaly detection over one reading and the device's prior state
//!
//! Evaluation is pure: the caller supplies "now" (the gateway receive time,
//! never the device clock) and owns persisting the returned state. Every
//! applicable rule fires, so a single reading may yield several candidates.

use crate::domain::{
    AlertKind, AlertLevel, CandidateAlert, DeviceState, GeoPoint, SensorReading,
};
use crate::infra::config::DetectionConfig;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use smallvec::SmallVec;

/// Candidates produced by one reading (rarely more than two)
pub type Candidates = SmallVec<[CandidateAlert; 4]>;

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub candidates: Candidates,
    pub new_state: DeviceState,
}

pub struct AnomalyDetector {
    rules: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(rules: DetectionConfig) -> Self {
        Self { rules }
    }

    /// Evaluate a reading at `now`. `state` is `None` when the store was
    /// unavailable; rules comparing against prior readings are then skipped.
    pub fn evaluate(
        &self,
        reading: &SensorReading,
        state: Option<&DeviceState>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let m = &reading.measurements;
        let location = reading.location.or_else(|| state.and_then(|s| s.last_location));
        let mut candidates = Candidates::new();

        let mut emit = |level: AlertLevel, kind: AlertKind, message: String, detail: Value| {
            candidates.push(CandidateAlert {
                device_id: reading.device_id.clone(),
                facility_id: reading.facility_id.clone(),
                level,
                kind,
                message,
                detail: with_location(detail, location),
                created_at: now,
            });
        };

        if m.fall_detected {
            emit(
                AlertLevel::Emergency,
                AlertKind::Fall,
                "Fall detected".to_string(),
                json!({ "fall_detected": true }),
            );
        }

        if let Some(zone) = m.zone.as_deref() {
            if zone.eq_ignore_ascii_case(&self.rules.bed_exit_zone) {
                emit(
                    AlertLevel::Warning,
                    AlertKind::BedExit,
                    "Left the bed".to_string(),
                    json!({ "zone": zone, "distance": m.distance }),
                );
            }
        }

        if let Some(t) = m.temperature {
            if t > self.rules.high_temp {
                emit(
                    AlertLevel::Warning,
                    AlertKind::HighTemp,
                    format!("High temperature: {t:.1}°C"),
                    json!({ "temperature": t, "threshold": self.rules.high_temp }),
                );
            } else if t > 0.0 && t < self.rules.low_temp {
                emit(
                    AlertLevel::Notice,
                    AlertKind::LowTemp,
                    format!("Low temperature: {t:.1}°C"),
                    json!({ "temperature": t, "threshold": self.rules.low_temp }),
                );
            }
        }

        if let Some(h) = m.humidity {
            if h > self.rules.high_humidity {
                emit(
                    AlertLevel::Notice,
                    AlertKind::HighHumidity,
                    format!("High humidity: {h:.1}%"),
                    json!({ "humidity": h, "threshold": self.rules.high_humidity }),
                );
            }
        }

        if let Some(prev) = state {
            if let Some(last_motion) = prev.last_motion_at {
                let idle = now - last_motion;
                if idle > self.rules.no_motion_limit() && !m.motion_observed() {
                    emit(
                        AlertLevel::Emergency,
                        AlertKind::NoMotion,
                        format!("No motion for {} minutes", idle.num_minutes()),
                        json!({
                            "last_motion_at": last_motion.to_rfc3339(),
                            "idle_secs": idle.num_seconds(),
                        }),
                    );
                }
            }

            if let (Some(previous), Some(current)) = (prev.last_distance, m.distance) {
                if (current - previous).abs() > self.rules.distance_drop
                    && current < self.rules.proximity_distance
                {
                    emit(
                        AlertLevel::Emergency,
                        AlertKind::AnomalyComposite,
                        "Possible fall: sudden distance change".to_string(),
                        json!({
                            "previous_distance": previous,
                            "current_distance": current,
                            "fall_detected": m.fall_detected,
                        }),
                    );
                }
            }
        }

        let mut new_state = state.cloned().unwrap_or_default();
        if m.motion_observed() {
            new_state.last_motion_at = Some(now);
        }
        if let Some(distance) = m.distance {
            new_state.last_distance = Some(distance);
        }
        if let Some(loc) = reading.location {
            new_state.last_location = Some(loc);
        }
        new_state.last_seen_at = Some(now);

        Evaluation { candidates, new_state }
    }
}

fn with_location(detail: Value, location: Option<GeoPoint>) -> Value {
    let Some(loc) = location else { return detail };
    let mut map = match detail {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert(
        "location".to_string(),
        json!({ "latitude": loc.latitude, "longitude": loc.longitude }),
    );
    Value::Object(map)
}
