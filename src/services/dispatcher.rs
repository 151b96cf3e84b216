//! Multi-channel notification fan-out
//!
//! One alert fans out to every resolved recipient on each of their primary
//! channels. Attempts run concurrently up to `max_fanout`, each bounded by a
//! timeout; a failure on one channel never affects another. The report
//! always carries one outcome per resolved recipient.

use crate::domain::{
    Alert, ChannelDeliveryFailure, ChannelKind, FacilityId, RecipientId, RegistryUnavailable,
};
use crate::infra::metrics::Metrics;
use crate::services::registry::{Recipient, RecipientDirectory};
use crate::services::render::{render, RenderedPayload};
use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A delivery backend for one channel kind
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver a rendered payload to one address
    async fn send(&self, address: &str, payload: &RenderedPayload)
        -> Result<(), ChannelDeliveryFailure>;
}

pub type ChannelTable = FxHashMap<ChannelKind, Arc<dyn NotificationChannel>>;

/// Build a channel table keyed by each channel's kind
pub fn channel_table(channels: Vec<Arc<dyn NotificationChannel>>) -> ChannelTable {
    channels.into_iter().map(|c| (c.kind(), c)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub channel: ChannelKind,
    pub address: String,
    #[serde(serialize_with = "serialize_result")]
    pub result: Result<(), ChannelDeliveryFailure>,
    pub latency_us: u64,
}

fn serialize_result<S: serde::Serializer>(
    result: &Result<(), ChannelDeliveryFailure>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match result {
        Ok(()) => serializer.serialize_str("ok"),
        Err(e) => serializer.serialize_str(&e.to_string()),
    }
}

impl DeliveryOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientOutcome {
    pub recipient_id: RecipientId,
    pub deliveries: Vec<DeliveryOutcome>,
}

impl RecipientOutcome {
    /// At least one channel reached the recipient
    pub fn delivered(&self) -> bool {
        self.deliveries.iter().any(DeliveryOutcome::is_ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// `None` for broadcasts not tied to an alert
    pub alert_id: Option<Uuid>,
    pub outcomes: Vec<RecipientOutcome>,
    #[serde(serialize_with = "serialize_registry_error")]
    pub registry_error: Option<RegistryUnavailable>,
}

fn serialize_registry_error<S: serde::Serializer>(
    err: &Option<RegistryUnavailable>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match err {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl DispatchReport {
    fn empty(alert_id: Option<Uuid>) -> Self {
        Self { alert_id, outcomes: Vec::new(), registry_error: None }
    }

    /// Successful deliveries across all recipients
    pub fn successes(&self) -> usize {
        self.outcomes.iter().flat_map(|o| &o.deliveries).filter(|d| d.is_ok()).count()
    }

    /// Failed deliveries across all recipients
    pub fn failures(&self) -> usize {
        self.outcomes.iter().flat_map(|o| &o.deliveries).filter(|d| !d.is_ok()).count()
    }

    /// Every attempt succeeded and the registry answered
    pub fn all_delivered(&self) -> bool {
        self.registry_error.is_none() && self.failures() == 0
    }
}

/// Explicit (recipient, channel, address) delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub recipient_id: RecipientId,
    pub channel: ChannelKind,
    pub address: String,
}

struct Attempt {
    recipient_idx: usize,
    seq: usize,
    channel: ChannelKind,
    address: String,
    payload: Arc<RenderedPayload>,
}

pub struct Dispatcher {
    directory: Arc<dyn RecipientDirectory>,
    channels: ChannelTable,
    max_fanout: usize,
    attempt_timeout_ms: u64,
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn RecipientDirectory>,
        channels: ChannelTable,
        max_fanout: usize,
        attempt_timeout_ms: u64,
    ) -> Self {
        Self {
            directory,
            channels,
            max_fanout: max_fanout.max(1),
            attempt_timeout_ms,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn directory(&self) -> &Arc<dyn RecipientDirectory> {
        &self.directory
    }

    /// Deliver an alert to every in-scope recipient on their primary channels
    pub async fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let recipients = match self.resolve(alert.facility_id.as_ref(), Some(alert.id)) {
            Ok(recipients) => recipients,
            Err(report) => return report,
        };

        let generated_at = Utc::now();
        let mut rendered: FxHashMap<ChannelKind, Arc<RenderedPayload>> = FxHashMap::default();
        let mut order = Vec::with_capacity(recipients.len());
        let mut attempts = Vec::new();

        for (idx, recipient) in recipients.into_iter().enumerate() {
            for (channel, address) in &recipient.channel_addresses {
                if !channel.is_primary() {
                    continue;
                }
                let payload = rendered
                    .entry(*channel)
                    .or_insert_with(|| Arc::new(render(alert, *channel, generated_at)))
                    .clone();
                attempts.push(Attempt {
                    recipient_idx: idx,
                    seq: attempts.len(),
                    channel: *channel,
                    address: address.clone(),
                    payload,
                });
            }
            order.push(recipient.id);
        }

        let outcomes = self.fan_out(Some(alert.id), order, attempts).await;
        DispatchReport { alert_id: Some(alert.id), outcomes, registry_error: None }
    }

    /// Deliver an alert to explicit targets (escalation path)
    pub async fn deliver(&self, alert: &Alert, targets: Vec<DeliveryTarget>) -> DispatchReport {
        if targets.is_empty() {
            return DispatchReport::empty(Some(alert.id));
        }

        let generated_at = Utc::now();
        let mut rendered: FxHashMap<ChannelKind, Arc<RenderedPayload>> = FxHashMap::default();
        let mut order: Vec<RecipientId> = Vec::new();
        let mut attempts = Vec::with_capacity(targets.len());

        for target in targets {
            let idx = match order.iter().position(|id| *id == target.recipient_id) {
                Some(idx) => idx,
                None => {
                    order.push(target.recipient_id.clone());
                    order.len() - 1
                }
            };
            let payload = rendered
                .entry(target.channel)
                .or_insert_with(|| Arc::new(render(alert, target.channel, generated_at)))
                .clone();
            attempts.push(Attempt {
                recipient_idx: idx,
                seq: attempts.len(),
                channel: target.channel,
                address: target.address,
                payload,
            });
        }

        let outcomes = self.fan_out(Some(alert.id), order, attempts).await;
        DispatchReport { alert_id: Some(alert.id), outcomes, registry_error: None }
    }

    /// Send a plain text message to every recipient's push channel
    pub async fn broadcast_text(&self, text: &str) -> DispatchReport {
        let recipients = match self.resolve(None, None) {
            Ok(recipients) => recipients,
            Err(report) => return report,
        };

        let payload = Arc::new(RenderedPayload::plain(ChannelKind::PushMessage, text));
        let mut order = Vec::new();
        let mut attempts = Vec::new();
        for recipient in recipients {
            let Some(address) = recipient.address(ChannelKind::PushMessage) else { continue };
            attempts.push(Attempt {
                recipient_idx: order.len(),
                seq: attempts.len(),
                channel: ChannelKind::PushMessage,
                address: address.to_string(),
                payload: payload.clone(),
            });
            order.push(recipient.id);
        }

        let outcomes = self.fan_out(None, order, attempts).await;
        DispatchReport { alert_id: None, outcomes, registry_error: None }
    }

    fn resolve(
        &self,
        facility: Option<&FacilityId>,
        alert_id: Option<Uuid>,
    ) -> Result<Vec<Recipient>, DispatchReport> {
        self.directory.resolve(facility).map_err(|e| {
            error!(alert_id = ?alert_id, error = %e, "recipient_resolution_failed");
            if let Some(ref m) = self.metrics {
                m.record_registry_error();
            }
            DispatchReport { alert_id, outcomes: Vec::new(), registry_error: Some(e) }
        })
    }

    async fn fan_out(
        &self,
        alert_id: Option<Uuid>,
        recipients: Vec<RecipientId>,
        attempts: Vec<Attempt>,
    ) -> Vec<RecipientOutcome> {
        let mut outcomes: Vec<RecipientOutcome> = recipients
            .into_iter()
            .map(|recipient_id| RecipientOutcome { recipient_id, deliveries: Vec::new() })
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_fanout));
        let mut set = JoinSet::new();
        let timeout_ms = self.attempt_timeout_ms;

        for attempt in attempts {
            let permit = semaphore.clone().acquire_owned().await.ok();
            let channel = self.channels.get(&attempt.channel).cloned();

            set.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let result = match channel {
                    None => Err(ChannelDeliveryFailure::NotConfigured(
                        attempt.channel.as_str().to_string(),
                    )),
                    Some(channel) => {
                        let send = channel.send(&attempt.address, &attempt.payload);
                        match tokio::time::timeout(Duration::from_millis(timeout_ms), send).await {
                            Ok(result) => result,
                            Err(_) => Err(ChannelDeliveryFailure::Timeout(timeout_ms)),
                        }
                    }
                };
                let outcome = DeliveryOutcome {
                    channel: attempt.channel,
                    address: attempt.address,
                    result,
                    latency_us: started.elapsed().as_micros() as u64,
                };
                (attempt.recipient_idx, attempt.seq, outcome)
            });
        }

        let mut finished = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => finished.push(done),
                Err(e) => error!(alert_id = ?alert_id, error = %e, "delivery_task_failed"),
            }
        }
        finished.sort_by_key(|(_, seq, _)| *seq);

        for (idx, _, outcome) in finished {
            if let Some(ref m) = self.metrics {
                m.record_delivery(
                    outcome.is_ok(),
                    matches!(outcome.result, Err(ChannelDeliveryFailure::Timeout(_))),
                    outcome.latency_us / 1000,
                );
            }
            let Some(recipient) = outcomes.get_mut(idx) else { continue };
            match &outcome.result {
                Ok(()) => debug!(
                    alert_id = ?alert_id,
                    recipient_id = %recipient.recipient_id,
                    channel = %outcome.channel,
                    latency_us = %outcome.latency_us,
                    "delivery_ok"
                ),
                Err(e) => warn!(
                    alert_id = ?alert_id,
                    recipient_id = %recipient.recipient_id,
                    channel = %outcome.channel,
                    error = %e,
                    "delivery_failed"
                ),
            }
            recipient.deliveries.push(outcome);
        }

        outcomes
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{DownDirectory, MockChannel};
    use super::*;
    use crate::domain::{AlertKind, AlertLevel, DeviceId};
    use crate::services::registry::RecipientRegistry;
    use serde_json::json;

    fn alert(level: AlertLevel) -> Alert {
        Alert {
            id: Uuid::now_v7(),
            device_id: DeviceId::new("d1"),
            facility_id: None,
            level,
            kind: AlertKind::HighTemp,
            message: "High temperature: 36.2°C".to_string(),
            detail: json!({"temperature": 36.2}),
            created_at: Utc::now(),
        }
    }

    fn registry_with(n: usize) -> Arc<RecipientRegistry> {
        let registry = RecipientRegistry::new();
        for i in 1..=n {
            registry
                .register_recipient(
                    RecipientId::new(format!("r{i}")),
                    ChannelKind::PushMessage,
                    format!("addr-{i}"),
                    None,
                )
                .unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_all_outcomes() {
        let push = Arc::new(MockChannel::new(ChannelKind::PushMessage).failing_for("addr-2"));
        let dispatcher = Dispatcher::new(
            registry_with(3),
            channel_table(vec![push.clone() as Arc<dyn NotificationChannel>]),
            8,
            1000,
        );

        let report = dispatcher.dispatch(&alert(AlertLevel::Warning)).await;

        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes[0].delivered());
        assert!(!report.outcomes[1].delivered());
        assert!(report.outcomes[2].delivered());
        assert_eq!(report.successes(), 2);
        assert_eq!(report.failures(), 1);
        assert!(!report.all_delivered());
        assert_eq!(push.sent_to().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_failed_attempt() {
        let slow = Arc::new(
            MockChannel::new(ChannelKind::PushMessage).with_delay(Duration::from_secs(10)),
        );
        let dispatcher =
            Dispatcher::new(registry_with(1), channel_table(vec![slow as Arc<dyn NotificationChannel>]), 8, 50);

        let started = Instant::now();
        let report = dispatcher.dispatch(&alert(AlertLevel::Warning)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(
            report.outcomes[0].deliveries[0].result,
            Err(ChannelDeliveryFailure::Timeout(50))
        );
    }

    #[tokio::test]
    async fn test_missing_channel_not_configured() {
        let registry = RecipientRegistry::new();
        registry
            .register_recipient(RecipientId::new("r1"), ChannelKind::RichCard, "card-1".into(), None)
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry), ChannelTable::default(), 8, 1000);

        let report = dispatcher.dispatch(&alert(AlertLevel::Notice)).await;
        assert_eq!(
            report.outcomes[0].deliveries[0].result,
            Err(ChannelDeliveryFailure::NotConfigured("rich-card".to_string()))
        );
    }

    #[tokio::test]
    async fn test_registry_unavailable_reported() {
        let dispatcher = Dispatcher::new(Arc::new(DownDirectory), ChannelTable::default(), 8, 1000);
        let report = dispatcher.dispatch(&alert(AlertLevel::Emergency)).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.registry_error, Some(RegistryUnavailable("down".to_string())));
        assert!(!report.all_delivered());
    }

    #[tokio::test]
    async fn test_escalation_channel_not_primary() {
        let registry = RecipientRegistry::new();
        let id = RecipientId::new("r1");
        registry.register_recipient(id.clone(), ChannelKind::PushMessage, "p".into(), None).unwrap();
        registry
            .register_recipient(id, ChannelKind::EmergencyEscalation, "+81".into(), None)
            .unwrap();
        let push = Arc::new(MockChannel::new(ChannelKind::PushMessage));
        let emergency = Arc::new(MockChannel::new(ChannelKind::EmergencyEscalation));
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            channel_table(vec![
                push.clone() as Arc<dyn NotificationChannel>,
                emergency.clone() as Arc<dyn NotificationChannel>,
            ]),
            8,
            1000,
        );

        let report = dispatcher.dispatch(&alert(AlertLevel::Emergency)).await;
        assert_eq!(report.outcomes[0].deliveries.len(), 1);
        assert!(emergency.sent_to().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_explicit_targets() {
        let emergency = Arc::new(MockChannel::new(ChannelKind::EmergencyEscalation));
        let dispatcher = Dispatcher::new(
            registry_with(0),
            channel_table(vec![emergency.clone() as Arc<dyn NotificationChannel>]),
            8,
            1000,
        );

        let targets = vec![DeliveryTarget {
            recipient_id: RecipientId::new("r9"),
            channel: ChannelKind::EmergencyEscalation,
            address: "+81-90".to_string(),
        }];
        let report = dispatcher.deliver(&alert(AlertLevel::Emergency), targets).await;
        assert!(report.all_delivered());
        let sent = emergency.sent.lock();
        assert!(sent[0].1.text.starts_with("[EMERGENCY]"));
    }

    #[tokio::test]
    async fn test_fanout_bounded() {
        let slow = Arc::new(
            MockChannel::new(ChannelKind::PushMessage).with_delay(Duration::from_millis(50)),
        );
        let dispatcher = Dispatcher::new(
            registry_with(4),
            channel_table(vec![slow as Arc<dyn NotificationChannel>]),
            2,
            5000,
        );

        let started = Instant::now();
        let report = dispatcher.dispatch(&alert(AlertLevel::Warning)).await;
        // Two waves of two concurrent attempts
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(report.successes(), 4);
    }

    #[tokio::test]
    async fn test_broadcast_text_push_only() {
        let registry = RecipientRegistry::new();
        registry
            .register_recipient(RecipientId::new("a"), ChannelKind::PushMessage, "pa".into(), None)
            .unwrap();
        registry
            .register_recipient(RecipientId::new("b"), ChannelKind::RichCard, "cb".into(), None)
            .unwrap();
        let push = Arc::new(MockChannel::new(ChannelKind::PushMessage));
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            channel_table(vec![push.clone() as Arc<dyn NotificationChannel>]),
            8,
            1000,
        );

        let report = dispatcher.broadcast_text("status ok").await;
        assert_eq!(report.alert_id, None);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(push.sent_to(), vec!["pa".to_string()]);
    }
}
