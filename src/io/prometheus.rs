//! Prometheus metrics and health HTTP endpoint
//!
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /health` - JSON `{status, recipients, mqtt_connected}`

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_DELIVERY_BOUNDS_MS, METRICS_NUM_BUCKETS,
};
use crate::services::registry::RecipientDirectory;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

fn format_prometheus_metrics(metrics: &Metrics, recipients: usize, site_id: &str) -> String {
    let summary = metrics.report(recipients);
    let mut output = String::with_capacity(8192);

    write_ingress_metrics(&mut output, site_id, &summary);
    write_alert_metrics(&mut output, site_id, &summary);
    write_delivery_metrics(&mut output, site_id, &summary);
    write_gauges(&mut output, site_id, &summary);

    output
}

fn write_ingress_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    use MetricType::Counter;
    write_metric(output, "care_messages_total", "Messages submitted", Counter, site, summary.messages_total);
    write_metric(output, "care_malformed_total", "Messages rejected by the router", Counter, site, summary.malformed_total);
    write_metric(output, "care_readings_total", "Sensor readings evaluated", Counter, site, summary.readings_total);
    write_metric(
        output,
        "care_state_unavailable_total",
        "State store failures",
        Counter,
        site,
        summary.state_unavailable_total,
    );
    write_histogram(
        output,
        "care_lane_latency_us",
        "Submit to processed latency in microseconds",
        site,
        &summary.lane_lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.lane_lat_avg_us,
    );
}

fn write_alert_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    use MetricType::Counter;
    write_metric(output, "care_candidates_total", "Candidate alerts detected", Counter, site, summary.candidates_total);
    write_metric(output, "care_alerts_emitted_total", "Alerts emitted", Counter, site, summary.alerts_emitted_total);

    let _ = writeln!(output, "# HELP care_alerts_suppressed_total Alerts suppressed by the filter");
    let _ = writeln!(output, "# TYPE care_alerts_suppressed_total counter");
    let _ = writeln!(
        output,
        "care_alerts_suppressed_total{{site=\"{site}\",reason=\"rate-limited\"}} {}",
        summary.suppressed_rate_limited_total
    );
    let _ = writeln!(
        output,
        "care_alerts_suppressed_total{{site=\"{site}\",reason=\"quiet-hours\"}} {}",
        summary.suppressed_quiet_hours_total
    );
}

fn write_delivery_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    use MetricType::Counter;
    let _ = writeln!(output, "# HELP care_deliveries_total Delivery attempts by result");
    let _ = writeln!(output, "# TYPE care_deliveries_total counter");
    let _ = writeln!(
        output,
        "care_deliveries_total{{site=\"{site}\",result=\"ok\"}} {}",
        summary.deliveries_ok_total
    );
    let _ = writeln!(
        output,
        "care_deliveries_total{{site=\"{site}\",result=\"failed\"}} {}",
        summary.deliveries_failed_total
    );
    write_metric(output, "care_delivery_timeouts_total", "Delivery attempts that timed out", Counter, site, summary.delivery_timeouts_total);
    write_metric(output, "care_escalations_total", "Escalation targets contacted", Counter, site, summary.escalations_total);
    write_metric(output, "care_registry_errors_total", "Recipient registry failures", Counter, site, summary.registry_errors_total);
    write_metric(output, "care_persistence_dropped_total", "Persistence records dropped", Counter, site, summary.persistence_dropped);
    write_metric(output, "care_egress_dropped_total", "MQTT egress messages dropped", Counter, site, summary.egress_dropped);
    write_metric(output, "care_dispatch_backpressure_total", "Lane waits on a full dispatch queue", Counter, site, summary.dispatch_backpressure_total);
    write_histogram(
        output,
        "care_delivery_latency_ms",
        "Delivery attempt latency in milliseconds",
        site,
        &summary.delivery_lat_buckets,
        &METRICS_DELIVERY_BOUNDS_MS,
        summary.delivery_lat_avg_ms,
    );
}

fn write_gauges(output: &mut String, site: &str, summary: &MetricsSummary) {
    use MetricType::Gauge;
    write_metric(output, "care_devices_tracked", "Devices with live state", Gauge, site, summary.devices_tracked);
    write_metric(output, "care_dispatch_in_flight", "Alerts being dispatched", Gauge, site, summary.dispatch_in_flight);
    write_metric(output, "care_recipients", "Registered recipients", Gauge, site, summary.recipients as u64);
    write_metric(output, "care_mqtt_connected", "MQTT ingress connected", Gauge, site, u64::from(summary.mqtt_connected));
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    recipients: usize,
    mqtt_connected: bool,
}

fn health(metrics: &Metrics, directory: &dyn RecipientDirectory) -> Health {
    Health { status: "ok", recipients: directory.len(), mqtt_connected: metrics.mqtt_connected() }
}

fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    resp
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    directory: Arc<dyn RecipientDirectory>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route_request(req.method(), req.uri().path(), &metrics, directory.as_ref(), &site_id))
}

fn route_request(
    method: &Method,
    path: &str,
    metrics: &Metrics,
    directory: &dyn RecipientDirectory,
    site_id: &str,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(metrics, directory.len(), site_id);
            response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        }
        (&Method::GET, "/health") => match serde_json::to_string(&health(metrics, directory)) {
            Ok(body) => response(StatusCode::OK, "application/json", body),
            Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

/// Start the metrics and health HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    directory: Arc<dyn RecipientDirectory>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let directory = directory.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), directory.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
