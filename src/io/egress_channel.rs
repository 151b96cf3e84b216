//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send events to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::types::DeviceStatusUpdate;
use crate::domain::Alert;
use crate::infra::metrics::{Metrics, MetricsSummary};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Emitted alert for live dashboards
    Alert(AlertFeedPayload),
    /// Device status change
    Status(StatusFeedPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertFeedPayload {
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: i64,
    #[serde(flatten)]
    pub alert: Alert,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusFeedPayload {
    pub site: String,
    pub ts: i64,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    pub site: String,
    pub ts: i64,
    #[serde(flatten)]
    pub summary: MetricsSummary,
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Option<Arc<Metrics>>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn offer(&self, msg: EgressMessage) {
        if self.tx.try_send(msg).is_err() {
            if let Some(ref m) = self.metrics {
                m.record_egress_dropped();
            }
        }
    }

    pub fn send_alert(&self, alert: &Alert) {
        self.offer(EgressMessage::Alert(AlertFeedPayload {
            site: self.site_id.clone(),
            ts: Utc::now().timestamp_millis(),
            alert: alert.clone(),
        }));
    }

    pub fn send_status(&self, update: &DeviceStatusUpdate) {
        self.offer(EgressMessage::Status(StatusFeedPayload {
            site: self.site_id.clone(),
            ts: update.timestamp.timestamp_millis(),
            device_id: update.device_id.to_string(),
            facility_id: update.facility_id.as_ref().map(|f| f.to_string()),
            status: update.status.clone(),
            battery: update.battery,
        }));
    }

    pub fn send_metrics(&self, summary: MetricsSummary) {
        self.offer(EgressMessage::Metrics(MetricsPayload {
            site: self.site_id.clone(),
            ts: Utc::now().timestamp_millis(),
            summary,
        }));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertKind, AlertLevel, DeviceId};
    use serde_json::json;
    use uuid::Uuid;

    fn alert() -> Alert {
        Alert {
            id: Uuid::now_v7(),
            device_id: DeviceId::new("d1"),
            facility_id: None,
            level: AlertLevel::Emergency,
            kind: AlertKind::Fall,
            message: "Fall detected".to_string(),
            detail: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_alert_payload_flattened() {
        let (sender, mut rx) = create_egress_channel(4, "home".to_string());
        let a = alert();
        sender.send_alert(&a);

        let Ok(EgressMessage::Alert(payload)) = rx.try_recv() else { panic!("expected alert") };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["site"], "home");
        assert_eq!(value["kind"], "fall");
        assert_eq!(value["level"], 3);
        assert_eq!(value["id"], a.id.to_string());
    }

    #[test]
    fn test_full_channel_counts_drop() {
        let metrics = Arc::new(Metrics::new());
        let (sender, _rx) = create_egress_channel(1, "home".to_string());
        let sender = sender.with_metrics(metrics.clone());

        sender.send_alert(&alert());
        sender.send_alert(&alert());

        assert_eq!(metrics.report(0).egress_dropped, 1);
    }
}
