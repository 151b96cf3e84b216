//! Channel-specific rendering of an alert
//!
//! Produces a provider-neutral payload; wire-level formatting for a given
//! chat platform happens behind the channel implementation.

use crate::domain::{Alert, AlertLevel, ChannelKind, GeoPoint};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Card colors indexed by alert level
const LEVEL_COLORS: [&str; 4] = ["#00AA00", "#00AAAA", "#FFAA00", "#FF0000"];

pub const EMERGENCY_CALL_URI: &str = "tel:119";
const EMERGENCY_MARKER: &str = "[EMERGENCY]";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuickAction {
    /// Posted back to the front door when tapped
    Postback { label: String, data: String },
    Uri { label: String, uri: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RichCard {
    pub title: String,
    pub color: &'static str,
    pub body: Vec<String>,
    pub actions: Vec<QuickAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationAttachment {
    pub title: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedPayload {
    pub channel: ChannelKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<RichCard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationAttachment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub quick_actions: Vec<QuickAction>,
}

impl RenderedPayload {
    /// Plain text message with no attachments (digests, broadcasts)
    pub fn plain(channel: ChannelKind, text: impl Into<String>) -> Self {
        Self { channel, text: text.into(), card: None, location: None, quick_actions: Vec::new() }
    }
}

pub fn level_color(level: AlertLevel) -> &'static str {
    LEVEL_COLORS[level.as_u8() as usize]
}

fn summary_text(alert: &Alert) -> String {
    format!(
        "[Level {}] {}\nDevice: {}\nTime: {}",
        alert.level,
        alert.message,
        alert.device_id,
        alert.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

fn acknowledge_action(alert: &Alert) -> QuickAction {
    QuickAction::Postback {
        label: "Acknowledge".to_string(),
        data: format!("acknowledge:{}", alert.id),
    }
}

fn emergency_actions(alert: &Alert) -> Vec<QuickAction> {
    vec![
        acknowledge_action(alert),
        QuickAction::Postback { label: "Check location".to_string(), data: "locate".to_string() },
        QuickAction::Uri {
            label: "Emergency call".to_string(),
            uri: EMERGENCY_CALL_URI.to_string(),
        },
    ]
}

fn location_attachment(loc: GeoPoint) -> LocationAttachment {
    LocationAttachment {
        title: "Last known location".to_string(),
        latitude: loc.latitude,
        longitude: loc.longitude,
    }
}

/// Render an alert for one channel
pub fn render(alert: &Alert, channel: ChannelKind, generated_at: DateTime<Utc>) -> RenderedPayload {
    let text = summary_text(alert);
    let urgent = alert.level.is_emergency();

    let mut payload = match channel {
        ChannelKind::PushMessage => RenderedPayload::plain(channel, text),
        ChannelKind::RichCard => {
            let mut body = vec![
                alert.message.clone(),
                format!("Device: {}", alert.device_id),
                format!("Type: {}", alert.kind),
            ];
            if let Some(facility) = &alert.facility_id {
                body.push(format!("Facility: {facility}"));
            }
            body.push(format!("Sent: {}", generated_at.format("%Y-%m-%d %H:%M:%S UTC")));

            let card = RichCard {
                title: format!("Alert Level {}", alert.level),
                color: level_color(alert.level),
                body,
                actions: vec![acknowledge_action(alert)],
            };
            RenderedPayload { card: Some(card), ..RenderedPayload::plain(channel, text) }
        }
        ChannelKind::EmergencyEscalation => {
            RenderedPayload::plain(channel, format!("{EMERGENCY_MARKER} {text}"))
        }
    };

    if urgent {
        payload.location = alert.location().map(location_attachment);
        payload.quick_actions = emergency_actions(alert);
    }

    payload
}
