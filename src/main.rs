//! Care gateway - sensor alert pipeline for elderly care monitoring
//!
//! Module structure:
//! - `domain/` - Readings, alerts, identifiers and errors
//! - `io/` - External interfaces (MQTT, notification channels, JSONL, HTTP)
//! - `services/` - Detection, filtering, dispatch and the lane pipeline
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use care_gateway::infra::{Config, Metrics};
use care_gateway::io::{
    build_channels, create_egress_channel, create_persistence_channel, JsonlSink, MqttPublisher,
};
use care_gateway::services::digest::run_digest;
use care_gateway::services::{Dispatcher, Pipeline, PipelineDeps, RecipientDirectory, RecipientRegistry};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Care gateway - device alerts to caregivers
#[derive(Parser, Debug)]
#[command(name = "care-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides; default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "care_gateway_starting");

    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    care_gateway::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        topics = ?config.mqtt_topics(),
        lanes = %config.lane_count(),
        escalation = ?config.escalation_mode(),
        persistence = %config.persistence_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // The sink outlives the pipeline so drained lanes can still write
    let (sink_shutdown_tx, sink_shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let registry = Arc::new(RecipientRegistry::from_config(config.recipients()));
    info!(recipients = %registry.len(), "recipients_loaded");
    let directory: Arc<dyn RecipientDirectory> = registry;

    let dispatcher = Arc::new(
        Dispatcher::new(
            directory.clone(),
            build_channels(&config),
            config.dispatch_max_fanout(),
            config.dispatch_attempt_timeout_ms(),
        )
        .with_metrics(metrics.clone()),
    );

    let mut deps = PipelineDeps::new(dispatcher.clone(), metrics.clone());

    let persistence_task = if config.persistence_enabled() {
        let (sender, rx) = create_persistence_channel(config.alert_queue_size());
        deps = deps.with_persistence(sender.with_metrics(metrics.clone()));
        let sink = JsonlSink::new(config.persistence_file());
        Some(tokio::spawn(care_gateway::io::persistence::run_persistence_writer(
            sink,
            rx,
            sink_shutdown_rx,
        )))
    } else {
        None
    };

    if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());
        let egress_sender = egress_sender.with_metrics(metrics.clone());

        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });

        let metrics_egress = egress_sender.clone();
        let metrics_for_egress = metrics.clone();
        let directory_for_egress = directory.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs().max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                interval.tick().await;
                metrics_egress.send_metrics(metrics_for_egress.report(directory_for_egress.len()));
            }
        });

        deps = deps.with_egress(egress_sender);
    }

    let (pipeline, tasks) = Pipeline::start(&config, deps);

    let mqtt_config = config.clone();
    let mqtt_pipeline = pipeline.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    let mqtt_task = tokio::spawn(async move {
        if let Err(e) = care_gateway::io::mqtt::start_mqtt_client(
            &mqtt_config,
            mqtt_pipeline,
            mqtt_metrics,
            mqtt_shutdown,
        )
        .await
        {
            error!(error = %e, "mqtt_client_failed");
        }
    });

    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_directory = directory.clone();
        let site_id = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = care_gateway::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_directory,
                site_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_failed");
            }
        });
    }

    let metrics_clone = metrics.clone();
    let directory_for_report = directory.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report(directory_for_report.len()).log();
        }
    });

    let digest_interval = config.digest_interval_secs();
    if digest_interval > 0 {
        tokio::spawn(run_digest(
            dispatcher.clone(),
            metrics.clone(),
            Duration::from_secs(digest_interval),
            shutdown_rx.clone(),
        ));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");

    // Ingress first so nothing new arrives, then drain lanes and dispatches
    let _ = shutdown_tx.send(true);
    if let Err(e) = mqtt_task.await {
        error!(error = %e, "mqtt_task_failed");
    }
    pipeline.close().await;
    tasks.join().await;

    let _ = sink_shutdown_tx.send(true);
    if let Some(task) = persistence_task {
        if let Err(e) = task.await {
            error!(error = %e, "persistence_task_failed");
        }
    }

    metrics.report(directory.len()).log();
    info!("care_gateway_shutdown_complete");
    Ok(())
}
