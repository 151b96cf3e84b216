//! Embedded MQTT broker using rumqttd
//!
//! Only for local development and the simulator: devices and the gateway
//! connect to it on the configured port. Production deployments point
//! `[mqtt]` at an external broker and leave `[broker] enabled = false`.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use tracing::{info, warn};

/// Sensor payloads are small JSON objects
const MAX_PAYLOAD_SIZE: usize = 65536;

fn broker_settings(listen_addr: SocketAddr) -> Config {
    let router_config = RouterConfig {
        max_segment_size: 10 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 1024,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen: listen_addr,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_inflight_count: 100,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router: router_config,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own thread when enabled.
/// Returns whether a broker was started.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        return false;
    }

    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen_addr: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr_str, "broker_invalid_bind_address");
            return false;
        }
    };

    let config = broker_settings(listen_addr);
    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the lifetime of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Give broker time to bind before the client connects
    thread::sleep(std::time::Duration::from_millis(100));
    info!(addr = %listen_addr, "broker_started");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_broker_not_started() {
        let config = AppConfig::default();
        assert!(!start_embedded_broker(&config));
    }

    #[test]
    fn test_broker_settings_v4_only() {
        let addr: SocketAddr = "127.0.0.1:1883".parse().unwrap();
        let settings = broker_settings(addr);
        let v4 = settings.v4.unwrap();
        assert_eq!(v4["v4"].listen, addr);
        assert!(settings.v5.is_none());
    }
}
