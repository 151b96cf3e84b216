//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Whole seconds as a `chrono::Duration`, saturating at chrono's range
pub fn secs(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic filters to subscribe to
    #[serde(default = "default_mqtt_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topics() -> Vec<String> {
    [
        "care/+/data",
        "care/+/alert",
        "care/+/status",
        "care/+/location",
        "care/sensor/data",
        "care/alert",
        "care/status",
        "care/location",
        "care/recipients/register",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_mqtt_client_id() -> String {
    "care-gateway".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topics: default_mqtt_topics(),
            client_id: default_mqtt_client_id(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded broker (local development only)
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_mqtt_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of per-device execution lanes
    #[serde(default = "default_lane_count")]
    pub lane_count: usize,
    /// Bounded queue size of each lane
    #[serde(default = "default_lane_queue_size")]
    pub lane_queue_size: usize,
    /// Bounded queue between lanes and the dispatch worker
    #[serde(default = "default_alert_queue_size")]
    pub alert_queue_size: usize,
}

fn default_lane_count() -> usize {
    8
}

fn default_lane_queue_size() -> usize {
    1024
}

fn default_alert_queue_size() -> usize {
    1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lane_count: default_lane_count(),
            lane_queue_size: default_lane_queue_size(),
            alert_queue_size: default_alert_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Idle time after which a device's state is evicted
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// How often each lane sweeps idle state and stale history
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_idle_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Detector rule thresholds
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_high_temp")]
    pub high_temp: f64,
    #[serde(default = "default_low_temp")]
    pub low_temp: f64,
    #[serde(default = "default_high_humidity")]
    pub high_humidity: f64,
    #[serde(default = "default_no_motion_secs")]
    pub no_motion_secs: u64,
    /// Minimum distance change (mm) for the sudden-drop rule
    #[serde(default = "default_distance_drop")]
    pub distance_drop: f64,
    /// Distance (mm) under which a sudden drop counts as a proximity signature
    #[serde(default = "default_proximity_distance")]
    pub proximity_distance: f64,
    #[serde(default = "default_bed_exit_zone")]
    pub bed_exit_zone: String,
}

fn default_high_temp() -> f64 {
    35.0
}

fn default_low_temp() -> f64 {
    15.0
}

fn default_high_humidity() -> f64 {
    80.0
}

fn default_no_motion_secs() -> u64 {
    300
}

fn default_distance_drop() -> f64 {
    100.0
}

fn default_proximity_distance() -> f64 {
    50.0
}

fn default_bed_exit_zone() -> String {
    "FAR".to_string()
}

impl DetectionConfig {
    pub fn no_motion_limit(&self) -> Duration {
        secs(self.no_motion_secs)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            high_temp: default_high_temp(),
            low_temp: default_low_temp(),
            high_humidity: default_high_humidity(),
            no_motion_secs: default_no_motion_secs(),
            distance_drop: default_distance_drop(),
            proximity_distance: default_proximity_distance(),
            bed_exit_zone: default_bed_exit_zone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FilterConfig {
    /// Trailing window for rate limiting
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Emitted alerts of one (device, kind) allowed per window
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: u32,
    #[serde(default = "default_quiet_start_hour")]
    pub quiet_start_hour: u32,
    #[serde(default = "default_quiet_end_hour")]
    pub quiet_end_hour: u32,
    /// Offset used to compute the local hour; host local time when unset
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

fn default_window_secs() -> u64 {
    300
}

fn default_rate_limit_threshold() -> u32 {
    3
}

fn default_quiet_start_hour() -> u32 {
    22
}

fn default_quiet_end_hour() -> u32 {
    6
}

impl FilterConfig {
    pub fn window(&self) -> Duration {
        secs(self.window_secs)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            rate_limit_threshold: default_rate_limit_threshold(),
            quiet_start_hour: default_quiet_start_hour(),
            quiet_end_hour: default_quiet_end_hour(),
            utc_offset_minutes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationMode {
    EmergencyFallback,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent outbound calls per alert
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Alerts being dispatched at the same time
    #[serde(default = "default_max_concurrent_alerts")]
    pub max_concurrent_alerts: usize,
    #[serde(default = "default_escalation")]
    pub escalation: EscalationMode,
}

fn default_max_fanout() -> usize {
    8
}

fn default_attempt_timeout_ms() -> u64 {
    5000
}

fn default_max_concurrent_alerts() -> usize {
    64
}

fn default_escalation() -> EscalationMode {
    EscalationMode::EmergencyFallback
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_fanout: default_max_fanout(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_concurrent_alerts: default_max_concurrent_alerts(),
            escalation: default_escalation(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelBackend {
    /// Write the rendered payload to the log
    Log,
    /// POST the rendered payload to a delivery relay
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_backend")]
    pub backend: ChannelBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_channel_backend() -> ChannelBackend {
    ChannelBackend::Log
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { backend: default_channel_backend(), url: None, bearer_token: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_channel_section")]
    pub push: Option<ChannelConfig>,
    #[serde(default = "default_channel_section")]
    pub card: Option<ChannelConfig>,
    #[serde(default = "default_channel_section")]
    pub emergency: Option<ChannelConfig>,
}

fn default_channel_section() -> Option<ChannelConfig> {
    Some(ChannelConfig::default())
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            push: default_channel_section(),
            card: default_channel_section(),
            emergency: default_channel_section(),
        }
    }
}

/// Recipient seeded at startup
#[derive(Debug, Clone, Deserialize)]
pub struct RecipientConfig {
    pub id: String,
    #[serde(default)]
    pub facility_id: Option<String>,
    /// Channel kind (e.g. "push-message") to address
    #[serde(default)]
    pub channels: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
    /// JSONL file receiving alert and reading records
    #[serde(default = "default_persistence_file")]
    pub file: String,
}

fn default_persistence_enabled() -> bool {
    true
}

fn default_persistence_file() -> String {
    "alerts.jsonl".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { enabled: default_persistence_enabled(), file: default_persistence_file() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Topic for emitted alerts (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
    /// Topic for device status changes (QoS 0)
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

fn default_alerts_topic() -> String {
    "care/out/alerts".to_string()
}

fn default_status_topic() -> String {
    "care/out/status".to_string()
}

fn default_metrics_topic() -> String {
    "care/out/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    30
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            alerts_topic: default_alerts_topic(),
            status_topic: default_status_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus/health HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_prometheus_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestConfig {
    /// Status digest broadcast interval (0 to disable)
    #[serde(default = "default_digest_interval")]
    pub interval_secs: u64,
}

fn default_digest_interval() -> u64 {
    3600
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self { interval_secs: default_digest_interval() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique deployment identifier used as metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "care".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub recipients: Vec<RecipientConfig>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub digest: DigestConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt: MqttConfig,
    broker: BrokerConfig,
    pipeline: PipelineConfig,
    state: StateConfig,
    detection: DetectionConfig,
    filter: FilterConfig,
    dispatch: DispatchConfig,
    channels: ChannelsConfig,
    recipients: Vec<RecipientConfig>,
    persistence: PersistenceConfig,
    mqtt_egress: MqttEgressConfig,
    metrics: MetricsConfig,
    digest: DigestConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            mqtt: toml_config.mqtt,
            broker: toml_config.broker,
            pipeline: toml_config.pipeline,
            state: toml_config.state,
            detection: toml_config.detection,
            filter: toml_config.filter,
            dispatch: toml_config.dispatch,
            channels: toml_config.channels,
            recipients: toml_config.recipients,
            persistence: toml_config.persistence,
            mqtt_egress: toml_config.mqtt_egress,
            metrics: toml_config.metrics,
            digest: toml_config.digest,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_topics(&self) -> &[String] {
        &self.mqtt.topics
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt.client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker.enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker.bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker.port
    }

    pub fn lane_count(&self) -> usize {
        self.pipeline.lane_count.max(1)
    }

    pub fn lane_queue_size(&self) -> usize {
        self.pipeline.lane_queue_size.max(1)
    }

    pub fn alert_queue_size(&self) -> usize {
        self.pipeline.alert_queue_size.max(1)
    }

    pub fn state_idle_ttl_secs(&self) -> u64 {
        self.state.idle_ttl_secs
    }

    pub fn state_sweep_interval_secs(&self) -> u64 {
        self.state.sweep_interval_secs.max(1)
    }

    pub fn detection(&self) -> &DetectionConfig {
        &self.detection
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    pub fn dispatch_max_fanout(&self) -> usize {
        self.dispatch.max_fanout.max(1)
    }

    pub fn dispatch_attempt_timeout_ms(&self) -> u64 {
        self.dispatch.attempt_timeout_ms
    }

    pub fn dispatch_max_concurrent_alerts(&self) -> usize {
        self.dispatch.max_concurrent_alerts.max(1)
    }

    pub fn escalation_mode(&self) -> EscalationMode {
        self.dispatch.escalation
    }

    pub fn channels(&self) -> &ChannelsConfig {
        &self.channels
    }

    pub fn recipients(&self) -> &[RecipientConfig] {
        &self.recipients
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence.enabled
    }

    pub fn persistence_file(&self) -> &str {
        &self.persistence.file
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress.enabled
    }

    pub fn mqtt_egress_alerts_topic(&self) -> &str {
        &self.mqtt_egress.alerts_topic
    }

    pub fn mqtt_egress_status_topic(&self) -> &str {
        &self.mqtt_egress.status_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress.metrics_topic
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress.metrics_publish_interval_secs.max(1)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs.max(1)
    }

    pub fn prometheus_port(&self) -> u16 {
        self.metrics.prometheus_port
    }

    pub fn digest_interval_secs(&self) -> u64 {
        self.digest.interval_secs
    }

    /// Builder method for tests to replace the filter section
    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = filter;
        self
    }

    /// Builder method for tests to set the lane count
    pub fn with_lane_count(mut self, lanes: usize) -> Self {
        self.pipeline.lane_count = lanes;
        self
    }

    /// Builder method for tests to set the lane maintenance interval
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.state.sweep_interval_secs = secs;
        self
    }

    /// Builder method for tests to bound the dispatch queue and concurrency
    pub fn with_dispatch_limits(mut self, queue: usize, max_concurrent: usize) -> Self {
        self.pipeline.alert_queue_size = queue;
        self.dispatch.max_concurrent_alerts = max_concurrent;
        self
    }

    /// Builder method for tests to set the per-attempt delivery timeout
    pub fn with_attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.dispatch.attempt_timeout_ms = ms;
        self
    }

    /// Builder method for tests to disable the persistence sink
    pub fn without_persistence(mut self) -> Self {
        self.persistence.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert!(config.mqtt_topics().iter().any(|t| t == "care/+/data"));
        assert_eq!(config.lane_count(), 8);
        assert_eq!(config.filter().window_secs, 300);
        assert_eq!(config.filter().rate_limit_threshold, 3);
        assert_eq!(config.filter().quiet_start_hour, 22);
        assert_eq!(config.filter().quiet_end_hour, 6);
        assert_eq!(config.detection().high_temp, 35.0);
        assert_eq!(config.dispatch_attempt_timeout_ms(), 5000);
        assert_eq!(config.escalation_mode(), EscalationMode::EmergencyFallback);
        assert!(!config.broker_enabled());
    }

    #[test]
    fn test_default_channels_log() {
        let config = Config::default();
        let push = config.channels().push.as_ref().unwrap();
        assert_eq!(push.backend, ChannelBackend::Log);
        assert!(config.channels().emergency.is_some());
    }

    #[test]
    fn test_secs_saturates() {
        assert_eq!(secs(300), Duration::seconds(300));
        assert_eq!(secs(u64::MAX), Duration::seconds(i64::MAX / 1000));
        assert_eq!(secs(i64::MAX as u64), Duration::seconds(i64::MAX / 1000));
        let filter = FilterConfig { window_secs: u64::MAX, ..FilterConfig::default() };
        assert_eq!(filter.window(), Duration::seconds(i64::MAX / 1000));
        assert_eq!(DetectionConfig::default().no_motion_limit(), Duration::seconds(300));
    }

    #[test]
    fn test_zero_lanes_clamped() {
        let config = Config::default().with_lane_count(0);
        assert_eq!(config.lane_count(), 1);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["care-gateway".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "care-gateway".to_string(),
            "--config".to_string(),
            "config/facility-a.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/facility-a.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["care-gateway".to_string(), "--config=config/home.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/home.toml");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[filter]
rate_limit_threshold = 5
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.filter().rate_limit_threshold, 5);
        assert_eq!(config.filter().window_secs, 300);
        assert_eq!(config.mqtt_port(), 1883);
    }
}
