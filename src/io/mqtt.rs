//! MQTT client feeding device messages into the pipeline

use crate::domain::PipelineError;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::pipeline::PipelineHandle;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Allows one warning per interval, counting the ones it swallowed
struct WarnLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl WarnLimiter {
    fn new(interval: Duration) -> Self {
        Self { interval, last: None, suppressed: 0 }
    }

    /// Returns the number of swallowed warnings when one may be logged now
    fn check(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let client_id = format!("{}-{}", config.mqtt_client_id(), std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_max_packet_size(256 * 1024, 256 * 1024);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }
    mqttoptions
}

/// Run the MQTT client until shutdown, submitting each publish to the pipeline
///
/// Subscriptions are (re)issued on every ConnAck so a broker restart does
/// not leave the gateway deaf.
pub async fn start_mqtt_client(
    config: &Config,
    pipeline: PipelineHandle,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), 100);
    let topics = config.mqtt_topics().to_vec();

    info!(
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        topics = ?topics,
        "mqtt_client_starting"
    );

    let mut malformed_warn = WarnLimiter::new(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    metrics.set_mqtt_connected(false);
                    let _ = client.try_disconnect();
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match pipeline.submit(&publish.topic, &publish.payload).await {
                            Ok(()) => {
                                debug!(topic = %publish.topic, bytes = %publish.payload.len(), "mqtt_message_submitted");
                            }
                            Err(PipelineError::ShuttingDown) => {
                                info!("mqtt_pipeline_closed");
                                metrics.set_mqtt_connected(false);
                                return Ok(());
                            }
                            Err(e) => {
                                if let Some(suppressed) = malformed_warn.check(Instant::now()) {
                                    warn!(error = %e, suppressed = %suppressed, "mqtt_message_malformed");
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        metrics.set_mqtt_connected(true);
                        for topic in &topics {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                                error!(topic = %topic, error = %e, "mqtt_subscribe_failed");
                            }
                        }
                        info!(topics = %topics.len(), "mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if metrics.mqtt_connected() {
                            metrics.set_mqtt_connected(false);
                        }
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_limiter() {
        let mut limiter = WarnLimiter::new(Duration::from_secs(1));
        let t0 = Instant::now();

        assert_eq!(limiter.check(t0), Some(0));
        assert_eq!(limiter.check(t0 + Duration::from_millis(10)), None);
        assert_eq!(limiter.check(t0 + Duration::from_millis(500)), None);
        assert_eq!(limiter.check(t0 + Duration::from_millis(1100)), Some(2));
        assert_eq!(limiter.check(t0 + Duration::from_millis(1200)), None);
    }

    #[test]
    fn test_mqtt_options_from_config() {
        let config = Config::default();
        let options = mqtt_options(&config);
        assert_eq!(options.broker_address(), (config.mqtt_host().to_string(), config.mqtt_port()));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.client_id().starts_with(config.mqtt_client_id()));
    }
}
