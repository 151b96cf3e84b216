//! End-to-end tests: broker payloads in, notification deliveries and JSONL records out

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use care_gateway::domain::{ChannelDeliveryFailure, ChannelKind, RecipientId};
use care_gateway::infra::config::FilterConfig;
use care_gateway::infra::{Config, Metrics};
use care_gateway::io::persistence::run_persistence_writer;
use care_gateway::io::{create_persistence_channel, JsonlSink};
use care_gateway::services::render::RenderedPayload;
use care_gateway::services::{
    channel_table, Dispatcher, NotificationChannel, Pipeline, PipelineDeps, RecipientDirectory,
    RecipientRegistry,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

struct Recorder {
    kind: ChannelKind,
    fail: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self { kind, fail: false, sent: Mutex::new(Vec::new()) })
    }

    fn failing(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self { kind, fail: true, sent: Mutex::new(Vec::new()) })
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for Recorder {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(
        &self,
        address: &str,
        payload: &RenderedPayload,
    ) -> Result<(), ChannelDeliveryFailure> {
        if self.fail {
            return Err(ChannelDeliveryFailure::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.sent.lock().push((address.to_string(), payload.text.clone()));
        Ok(())
    }
}

fn config() -> Config {
    // Quiet hours stay at their 22-6 default, judged in UTC
    Config::default()
        .with_lane_count(4)
        .with_filter(FilterConfig { utc_offset_minutes: Some(0), ..FilterConfig::default() })
}

fn registry() -> Arc<RecipientRegistry> {
    let registry = RecipientRegistry::new();
    let nurse = RecipientId::new("nurse-1");
    registry
        .register_recipient(nurse.clone(), ChannelKind::PushMessage, "U100".into(), None)
        .unwrap();
    registry.register_recipient(nurse, ChannelKind::RichCard, "U100".into(), None).unwrap();
    registry
        .register_recipient(
            RecipientId::new("family-1"),
            ChannelKind::PushMessage,
            "U200".into(),
            None,
        )
        .unwrap();
    registry
        .register_recipient(
            RecipientId::new("family-1"),
            ChannelKind::EmergencyEscalation,
            "+81-90-0000-0000".into(),
            None,
        )
        .unwrap();
    Arc::new(registry)
}

fn dispatcher(channels: Vec<Arc<dyn NotificationChannel>>, metrics: &Arc<Metrics>) -> Arc<Dispatcher> {
    Arc::new(
        Dispatcher::new(registry(), channel_table(channels), 8, 1000).with_metrics(metrics.clone()),
    )
}


/// Gateway receive time on 2026-01-05
fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, 0).unwrap()
}

#[tokio::test]
async fn test_high_temperature_reaches_every_recipient() {
    let metrics = Arc::new(Metrics::new());
    let push = Recorder::new(ChannelKind::PushMessage);
    let card = Recorder::new(ChannelKind::RichCard);
    let dispatcher = dispatcher(vec![push.clone() as Arc<dyn NotificationChannel>, card.clone()], &metrics);

    let (pipeline, tasks) =
        Pipeline::start(&config(), PipelineDeps::new(dispatcher, metrics.clone()));
    pipeline
        .submit_at(
            "care/sensor/data",
            br#"{"device_id":"d1","timestamp":"2026-01-05T14:00:00Z",
                "environment":{"temperature":36.2,"humidity":40.0},"motion":true}"#,
            at(14, 0),
        )
        .await
        .unwrap();
    pipeline.close().await;
    tasks.join().await;

    let mut push_sent = push.sent();
    push_sent.sort();
    assert_eq!(push_sent.len(), 2);
    assert_eq!(push_sent[0].0, "U100");
    assert_eq!(push_sent[1].0, "U200");
    assert!(push_sent[0].1.starts_with("[Level 2] High temperature: 36.2°C"));
    assert_eq!(card.sent().len(), 1);

    assert_eq!(metrics.alerts_emitted_total(), 1);
    assert_eq!(metrics.deliveries_ok_total(), 3);
    assert_eq!(metrics.deliveries_failed_total(), 0);
}

#[tokio::test]
async fn test_fall_escalates_when_primary_channels_fail() {
    let metrics = Arc::new(Metrics::new());
    let push = Recorder::failing(ChannelKind::PushMessage);
    let card = Recorder::failing(ChannelKind::RichCard);
    let emergency = Recorder::new(ChannelKind::EmergencyEscalation);
    let dispatcher = dispatcher(vec![push as Arc<dyn NotificationChannel>, card, emergency.clone()], &metrics);

    let (pipeline, tasks) =
        Pipeline::start(&config(), PipelineDeps::new(dispatcher, metrics.clone()));
    // 23:30 UTC is inside quiet hours; level 3 still goes out
    pipeline
        .submit_at(
            "care/d1/data",
            br#"{"device_id":"d1","timestamp":"2026-01-05T23:30:00Z",
                "imu":{"fall_detected":true},"motion":true}"#,
            at(23, 30),
        )
        .await
        .unwrap();
    pipeline.close().await;
    tasks.join().await;

    let escalated = emergency.sent();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].0, "+81-90-0000-0000");
    assert!(escalated[0].1.contains("Fall detected"));
    assert_eq!(metrics.alerts_emitted_total(), 1);
}

#[tokio::test]
async fn test_quiet_hours_hold_back_notices_only() {
    let metrics = Arc::new(Metrics::new());
    let push = Recorder::new(ChannelKind::PushMessage);
    let dispatcher = dispatcher(vec![push.clone() as Arc<dyn NotificationChannel>], &metrics);

    let (pipeline, tasks) =
        Pipeline::start(&config(), PipelineDeps::new(dispatcher, metrics.clone()));
    pipeline
        .submit_at(
            "care/sensor/data",
            br#"{"device_id":"d1","timestamp":"2026-01-05T02:00:00Z",
                "environment":{"temperature":36.2,"humidity":90.0},"motion":true}"#,
            at(2, 0),
        )
        .await
        .unwrap();
    pipeline.close().await;
    tasks.join().await;

    let sent = push.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(_, text)| text.contains("High temperature")));
    assert_eq!(metrics.alerts_emitted_total(), 1);
}

#[tokio::test]
async fn test_records_written_in_per_device_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records").join("alerts.jsonl");

    let metrics = Arc::new(Metrics::new());
    let push = Recorder::new(ChannelKind::PushMessage);
    let dispatcher = dispatcher(vec![push.clone() as Arc<dyn NotificationChannel>], &metrics);

    let (persistence, rx) = create_persistence_channel(1024);
    let (sink_tx, sink_rx) = watch::channel(false);
    let writer = tokio::spawn(run_persistence_writer(
        JsonlSink::new(path.to_str().unwrap()),
        rx,
        sink_rx,
    ));

    let deps = PipelineDeps::new(dispatcher, metrics.clone()).with_persistence(persistence);
    let (pipeline, tasks) = Pipeline::start(&config(), deps);

    for i in 0..20u32 {
        for device in ["d1", "d2", "d3"] {
            let payload = format!(
                r#"{{"device_id":"{device}","timestamp":"2026-01-05T10:{i:02}:00Z","motion":true}}"#
            );
            pipeline.submit_at("care/sensor/data", payload.as_bytes(), at(10, i)).await.unwrap();
        }
    }
    pipeline
        .submit_at(
            "care/d2/data",
            br#"{"device_id":"d2","timestamp":"2026-01-05T10:30:00Z",
                "environment":{"temperature":36.8},"motion":true}"#,
            at(10, 30),
        )
        .await
        .unwrap();

    pipeline.close().await;
    tasks.join().await;
    let _ = sink_tx.send(true);
    writer.await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> =
        content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();

    for device in ["d1", "d2", "d3"] {
        let stamps: Vec<&str> = records
            .iter()
            .filter(|r| r["record"] == "reading_processed" && r["device_id"] == device)
            .map(|r| r["timestamp"].as_str().unwrap())
            .collect();
        let expected = if device == "d2" { 21 } else { 20 };
        assert_eq!(stamps.len(), expected, "{device}");
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted, "{device} readings out of order");
    }

    let created: Vec<_> = records.iter().filter(|r| r["record"] == "alert_created").collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["alert"]["device_id"], "d2");
    assert_eq!(created[0]["alert"]["kind"], "high-temp");

    let dispatched: Vec<_> = records.iter().filter(|r| r["record"] == "alert_dispatched").collect();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0]["alert_id"], created[0]["alert"]["id"]);
    assert_eq!(push.sent().len(), 2);
}
