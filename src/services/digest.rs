//! Periodic status digest broadcast to every recipient's push channel

use crate::infra::metrics::Metrics;
use crate::services::dispatcher::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Counters shown in one digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestSnapshot {
    pub recipients: usize,
    pub devices_tracked: u64,
    pub alerts_emitted: u64,
}

impl DigestSnapshot {
    pub fn capture(dispatcher: &Dispatcher, metrics: &Metrics) -> Self {
        Self {
            recipients: dispatcher.directory().len(),
            devices_tracked: metrics.devices_tracked(),
            alerts_emitted: metrics.alerts_emitted_total(),
        }
    }
}

pub fn digest_text(current: DigestSnapshot, previous: Option<DigestSnapshot>) -> String {
    let since_last = previous.map(|p| current.alerts_emitted.saturating_sub(p.alerts_emitted));
    let mut text = format!(
        "Care status report\nRecipients: {}\nDevices seen: {}\nAlerts emitted: {}",
        current.recipients, current.devices_tracked, current.alerts_emitted,
    );
    if let Some(n) = since_last {
        text.push_str(&format!(" ({n} since last report)"));
    }
    text
}

/// Broadcast a digest every `interval` until shutdown
pub async fn run_digest(
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = %interval.as_secs(), "digest_started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut previous = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("digest_shutdown");
                    return;
                }
            }
            _ = ticker.tick() => {
                let snapshot = DigestSnapshot::capture(&dispatcher, &metrics);
                if snapshot.recipients == 0 {
                    previous = Some(snapshot);
                    continue;
                }
                let report = dispatcher.broadcast_text(&digest_text(snapshot, previous)).await;
                if report.failures() > 0 || report.registry_error.is_some() {
                    warn!(
                        successes = %report.successes(),
                        failures = %report.failures(),
                        "digest_partially_delivered"
                    );
                } else {
                    info!(recipients = %report.outcomes.len(), "digest_sent");
                }
                previous = Some(snapshot);
            }
        }
    }
}
