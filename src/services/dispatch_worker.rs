//! Dispatch worker - delivers emitted alerts off the lane hot path
//!
//! Lanes enqueue alerts via an mpsc channel; the worker spawns one dispatch
//! per alert so a slow channel never stalls device processing. Concurrent
//! dispatches are capped by `max_concurrent_alerts`.

use crate::domain::Alert;
use crate::infra::metrics::Metrics;
use crate::io::persistence::{PersistenceRecord, PersistenceSender};
use crate::services::dispatcher::{DispatchReport, Dispatcher};
use crate::services::escalation::EscalationPolicy;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// An emitted alert waiting for delivery
#[derive(Debug)]
pub struct DispatchJob {
    pub alert: Alert,
    /// When the lane enqueued it (for queue delay measurement)
    pub enqueued_at: Instant,
}

impl DispatchJob {
    pub fn new(alert: Alert) -> Self {
        Self { alert, enqueued_at: Instant::now() }
    }
}

#[derive(Clone)]
struct DispatchContext {
    dispatcher: Arc<Dispatcher>,
    escalation: Arc<dyn EscalationPolicy>,
    metrics: Arc<Metrics>,
    persistence: Option<PersistenceSender>,
}

pub struct DispatchWorker {
    ctx: DispatchContext,
    rx: mpsc::Receiver<DispatchJob>,
    max_concurrent: usize,
}

impl DispatchWorker {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        escalation: Arc<dyn EscalationPolicy>,
        rx: mpsc::Receiver<DispatchJob>,
        max_concurrent: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ctx: DispatchContext { dispatcher, escalation, metrics, persistence: None },
            rx,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn with_persistence(mut self, persistence: PersistenceSender) -> Self {
        self.ctx.persistence = Some(persistence);
        self
    }

    /// Run until every producer is gone, then wait for in-flight dispatches
    pub async fn run(mut self) {
        info!(max_concurrent = %self.max_concurrent, "dispatch_worker_started");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut in_flight = JoinSet::new();

        while let Some(job) = self.rx.recv().await {
            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "dispatch_task_failed");
                }
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
            let ctx = self.ctx.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                process(ctx, job).await;
            });
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(pending = %pending, "dispatch_worker_draining");
        }
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "dispatch_task_failed");
            }
        }

        info!("dispatch_worker_stopped");
    }
}

async fn process(ctx: DispatchContext, job: DispatchJob) {
    let alert = job.alert;
    let queue_delay_us = job.enqueued_at.elapsed().as_micros() as u64;
    ctx.metrics.dispatch_started();

    let started = Instant::now();
    let report = ctx.dispatcher.dispatch(&alert).await;
    let escalated = escalate(&ctx, &alert, &report).await;

    info!(
        alert_id = %alert.id,
        device_id = %alert.device_id,
        level = %alert.level,
        kind = %alert.kind,
        recipients = %report.outcomes.len(),
        successes = %report.successes(),
        failures = %report.failures(),
        escalated = %escalated,
        queue_delay_us = %queue_delay_us,
        dispatch_ms = %started.elapsed().as_millis(),
        "alert_dispatched"
    );
    if report.outcomes.is_empty() && report.registry_error.is_none() {
        warn!(alert_id = %alert.id, facility_id = ?alert.facility_id, "alert_has_no_recipients");
    }

    if let Some(ref persistence) = ctx.persistence {
        persistence.send(PersistenceRecord::AlertDispatched { alert_id: alert.id, escalated, report });
    }
    ctx.metrics.dispatch_finished();
}

/// Apply the escalation policy, returning how many targets were escalated
async fn escalate(ctx: &DispatchContext, alert: &Alert, report: &DispatchReport) -> usize {
    if report.all_delivered() || report.registry_error.is_some() {
        return 0;
    }

    let recipients = match ctx.dispatcher.directory().resolve(alert.facility_id.as_ref()) {
        Ok(recipients) => recipients,
        Err(e) => {
            ctx.metrics.record_registry_error();
            error!(alert_id = %alert.id, error = %e, "escalation_resolution_failed");
            return 0;
        }
    };

    let targets = ctx.escalation.escalations(alert, report, &recipients);
    if targets.is_empty() {
        return 0;
    }

    let count = targets.len();
    ctx.metrics.record_escalations(count);
    let escalation_report = ctx.dispatcher.deliver(alert, targets).await;
    warn!(
        alert_id = %alert.id,
        targets = %count,
        successes = %escalation_report.successes(),
        failures = %escalation_report.failures(),
        "alert_escalated"
    );
    count
}

/// Create the alert channel and its worker
///
/// Returns the sender (for lanes) and the worker (to be spawned)
pub fn create_dispatch_worker(
    dispatcher: Arc<Dispatcher>,
    escalation: Arc<dyn EscalationPolicy>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
    max_concurrent: usize,
) -> (mpsc::Sender<DispatchJob>, DispatchWorker) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let worker = DispatchWorker::new(dispatcher, escalation, rx, max_concurrent, metrics);
    (tx, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertKind, AlertLevel, ChannelKind, DeviceId, RecipientId};
    use crate::io::persistence::create_persistence_channel;
    use crate::services::dispatcher::test_support::MockChannel;
    use crate::services::dispatcher::{channel_table, NotificationChannel};
    use crate::services::escalation::{EmergencyFallback, NoEscalation};
    use crate::services::registry::{RecipientDirectory, RecipientRegistry};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn alert(level: AlertLevel) -> Alert {
        Alert {
            id: Uuid::now_v7(),
            device_id: DeviceId::new("d1"),
            facility_id: None,
            level,
            kind: AlertKind::Fall,
            message: "Fall detected".to_string(),
            detail: json!({}),
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        push: Arc<MockChannel>,
        emergency: Arc<MockChannel>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
    }

    /// Two recipients; r2's push address always fails
    fn fixture(push_delay: Option<Duration>) -> Fixture {
        let registry = RecipientRegistry::new();
        for (id, push, phone) in [("r1", "p1", "+81-1"), ("r2", "p2", "+81-2")] {
            let rid = RecipientId::new(id);
            registry.register_recipient(rid.clone(), ChannelKind::PushMessage, push.into(), None).unwrap();
            registry
                .register_recipient(rid, ChannelKind::EmergencyEscalation, phone.into(), None)
                .unwrap();
        }

        let mut push = MockChannel::new(ChannelKind::PushMessage).failing_for("p2");
        if let Some(delay) = push_delay {
            push = push.with_delay(delay);
        }
        let push = Arc::new(push);
        let emergency = Arc::new(MockChannel::new(ChannelKind::EmergencyEscalation));
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::new(registry),
                channel_table(vec![
                    push.clone() as Arc<dyn NotificationChannel>,
                    emergency.clone() as Arc<dyn NotificationChannel>,
                ]),
                8,
                2000,
            )
            .with_metrics(metrics.clone()),
        );
        Fixture { push, emergency, dispatcher, metrics }
    }

    #[tokio::test]
    async fn test_emergency_escalates_unreached_recipient() {
        let f = fixture(None);
        let (persist_tx, mut persist_rx) = create_persistence_channel(8);
        let (tx, worker) =
            create_dispatch_worker(f.dispatcher, Arc::new(EmergencyFallback), f.metrics.clone(), 8, 4);
        let worker = worker.with_persistence(persist_tx);
        let handle = tokio::spawn(worker.run());

        tx.send(DispatchJob::new(alert(AlertLevel::Emergency))).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(f.push.sent_to(), vec!["p1".to_string()]);
        assert_eq!(f.emergency.sent_to(), vec!["+81-2".to_string()]);
        assert_eq!(f.metrics.report(0).escalations_total, 1);

        let Ok(PersistenceRecord::AlertDispatched { escalated, report, .. }) = persist_rx.try_recv()
        else {
            panic!("expected alert_dispatched record");
        };
        assert_eq!(escalated, 1);
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_warning_is_not_escalated() {
        let f = fixture(None);
        let (tx, worker) =
            create_dispatch_worker(f.dispatcher, Arc::new(EmergencyFallback), f.metrics, 8, 4);
        let handle = tokio::spawn(worker.run());

        tx.send(DispatchJob::new(alert(AlertLevel::Warning))).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(f.emergency.sent_to().is_empty());
    }

    #[tokio::test]
    async fn test_no_escalation_policy() {
        let f = fixture(None);
        let (tx, worker) = create_dispatch_worker(f.dispatcher, Arc::new(NoEscalation), f.metrics, 8, 4);
        let handle = tokio::spawn(worker.run());

        tx.send(DispatchJob::new(alert(AlertLevel::Emergency))).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(f.emergency.sent_to().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_dispatches_finish_after_close() {
        let f = fixture(Some(Duration::from_millis(50)));
        let (tx, worker) =
            create_dispatch_worker(f.dispatcher, Arc::new(NoEscalation), f.metrics.clone(), 8, 4);
        let handle = tokio::spawn(worker.run());

        for _ in 0..3 {
            tx.send(DispatchJob::new(alert(AlertLevel::Warning))).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(f.push.sent_to().len(), 3);
        assert_eq!(f.metrics.report(0).dispatch_in_flight, 0);
    }
}
