//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering for statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::services::alert_filter::SuppressReason;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Delivery latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
const DELIVERY_BOUNDS_MS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn delivery_bucket_index(latency_ms: u64) -> usize {
    DELIVERY_BOUNDS_MS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], bounds: &[u64; 10], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports twice the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Transport messages handed to the pipeline (monotonic)
    messages_total: AtomicU64,
    /// Messages processed by lanes since last report (reset on report)
    processed_since_report: AtomicU64,
    /// Sum of lane latencies in microseconds (reset on report)
    lane_latency_sum_us: AtomicU64,
    /// Max lane latency in microseconds (reset on report)
    lane_latency_max_us: AtomicU64,
    /// Submit-to-processed latency histogram (reset on report)
    lane_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Payloads rejected by the router (monotonic)
    malformed_total: AtomicU64,
    readings_total: AtomicU64,
    candidates_total: AtomicU64,
    alerts_emitted_total: AtomicU64,
    suppressed_rate_limited_total: AtomicU64,
    suppressed_quiet_hours_total: AtomicU64,
    /// Readings evaluated without device state
    state_unavailable_total: AtomicU64,
    deliveries_ok_total: AtomicU64,
    deliveries_failed_total: AtomicU64,
    delivery_timeouts_total: AtomicU64,
    escalations_total: AtomicU64,
    registry_errors_total: AtomicU64,
    /// Delivery attempt latency histogram in ms (reset on report)
    delivery_latency_buckets: [AtomicU64; NUM_BUCKETS],
    delivery_latency_sum_ms: AtomicU64,
    delivery_latency_max_ms: AtomicU64,
    /// Records dropped because the persistence channel was full
    persistence_dropped: AtomicU64,
    /// Messages dropped because the MQTT egress channel was full
    egress_dropped: AtomicU64,
    /// Times a lane waited on a full dispatch queue
    dispatch_backpressure_total: AtomicU64,
    /// Devices with live state across all lanes (gauge)
    devices_tracked: AtomicU64,
    /// Alert dispatches currently in flight (gauge)
    dispatch_in_flight: AtomicU64,
    mqtt_connected: AtomicBool,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_total: AtomicU64::new(0),
            processed_since_report: AtomicU64::new(0),
            lane_latency_sum_us: AtomicU64::new(0),
            lane_latency_max_us: AtomicU64::new(0),
            lane_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            malformed_total: AtomicU64::new(0),
            readings_total: AtomicU64::new(0),
            candidates_total: AtomicU64::new(0),
            alerts_emitted_total: AtomicU64::new(0),
            suppressed_rate_limited_total: AtomicU64::new(0),
            suppressed_quiet_hours_total: AtomicU64::new(0),
            state_unavailable_total: AtomicU64::new(0),
            deliveries_ok_total: AtomicU64::new(0),
            deliveries_failed_total: AtomicU64::new(0),
            delivery_timeouts_total: AtomicU64::new(0),
            escalations_total: AtomicU64::new(0),
            registry_errors_total: AtomicU64::new(0),
            delivery_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            delivery_latency_sum_ms: AtomicU64::new(0),
            delivery_latency_max_ms: AtomicU64::new(0),
            persistence_dropped: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            dispatch_backpressure_total: AtomicU64::new(0),
            devices_tracked: AtomicU64::new(0),
            dispatch_in_flight: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_message_received(&self) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lane finished one message, `latency_us` measured from submit
    #[inline]
    pub fn record_message_processed(&self, latency_us: u64) {
        self.processed_since_report.fetch_add(1, Ordering::Relaxed);
        self.lane_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.lane_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.lane_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reading(&self, candidates: usize) {
        self.readings_total.fetch_add(1, Ordering::Relaxed);
        self.candidates_total.fetch_add(candidates as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_state_unavailable(&self) {
        self.state_unavailable_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_emitted(&self) {
        self.alerts_emitted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_suppressed(&self, reason: SuppressReason) {
        match reason {
            SuppressReason::RateLimited => {
                self.suppressed_rate_limited_total.fetch_add(1, Ordering::Relaxed)
            }
            SuppressReason::QuietHours => {
                self.suppressed_quiet_hours_total.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    /// Record one delivery attempt outcome with its latency in ms
    #[inline]
    pub fn record_delivery(&self, ok: bool, timed_out: bool, latency_ms: u64) {
        if ok {
            self.deliveries_ok_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deliveries_failed_total.fetch_add(1, Ordering::Relaxed);
            if timed_out {
                self.delivery_timeouts_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        let bucket = delivery_bucket_index(latency_ms);
        self.delivery_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.delivery_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.delivery_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_escalations(&self, count: usize) {
        self.escalations_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_registry_error(&self) {
        self.registry_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persistence_dropped(&self) {
        self.persistence_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch_backpressure(&self) {
        self.dispatch_backpressure_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn device_tracked(&self) {
        self.devices_tracked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record devices evicted from a lane store
    #[inline]
    pub fn devices_evicted(&self, count: usize) {
        let count = count as u64;
        let _ = self.devices_tracked.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(count))
        });
    }

    #[inline]
    pub fn dispatch_started(&self) {
        self.dispatch_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dispatch_finished(&self) {
        let _ = self.dispatch_in_flight.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    #[inline]
    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    #[inline]
    pub fn mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn messages_total(&self) -> u64 {
        self.messages_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn malformed_total(&self) -> u64 {
        self.malformed_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alerts_emitted_total(&self) -> u64 {
        self.alerts_emitted_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn devices_tracked(&self) -> u64 {
        self.devices_tracked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deliveries_ok_total(&self) -> u64 {
        self.deliveries_ok_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deliveries_failed_total(&self) -> u64 {
        self.deliveries_failed_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dispatch_backpressure_total(&self) -> u64 {
        self.dispatch_backpressure_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, recipients: usize) -> MetricsSummary {
        let processed = self.processed_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.lane_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.lane_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.lane_latency_buckets);

        let delivery_buckets = swap_buckets(&self.delivery_latency_buckets);
        let delivery_sum = self.delivery_latency_sum_ms.swap(0, Ordering::Relaxed);
        let delivery_max = self.delivery_latency_max_ms.swap(0, Ordering::Relaxed);
        let delivery_count: u64 = delivery_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let messages_per_sec = if elapsed.as_secs_f64() > 0.0 {
            processed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if processed > 0 { latency_sum / processed } else { 0 };
        let delivery_avg = if delivery_count > 0 { delivery_sum / delivery_count } else { 0 };

        MetricsSummary {
            messages_total: self.messages_total.load(Ordering::Relaxed),
            messages_per_sec,
            lane_lat_buckets: lat_buckets,
            lane_lat_avg_us: avg_latency,
            lane_lat_max_us: max_latency,
            lane_lat_p50_us: percentile_from_buckets(&lat_buckets, &BUCKET_BOUNDS, 0.50),
            lane_lat_p99_us: percentile_from_buckets(&lat_buckets, &BUCKET_BOUNDS, 0.99),
            malformed_total: self.malformed_total.load(Ordering::Relaxed),
            readings_total: self.readings_total.load(Ordering::Relaxed),
            candidates_total: self.candidates_total.load(Ordering::Relaxed),
            alerts_emitted_total: self.alerts_emitted_total.load(Ordering::Relaxed),
            suppressed_rate_limited_total: self
                .suppressed_rate_limited_total
                .load(Ordering::Relaxed),
            suppressed_quiet_hours_total: self.suppressed_quiet_hours_total.load(Ordering::Relaxed),
            state_unavailable_total: self.state_unavailable_total.load(Ordering::Relaxed),
            deliveries_ok_total: self.deliveries_ok_total.load(Ordering::Relaxed),
            deliveries_failed_total: self.deliveries_failed_total.load(Ordering::Relaxed),
            delivery_timeouts_total: self.delivery_timeouts_total.load(Ordering::Relaxed),
            escalations_total: self.escalations_total.load(Ordering::Relaxed),
            registry_errors_total: self.registry_errors_total.load(Ordering::Relaxed),
            delivery_lat_buckets: delivery_buckets,
            delivery_lat_avg_ms: delivery_avg,
            delivery_lat_max_ms: delivery_max,
            delivery_lat_p99_ms: percentile_from_buckets(
                &delivery_buckets,
                &DELIVERY_BOUNDS_MS,
                0.99,
            ),
            persistence_dropped: self.persistence_dropped.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            dispatch_backpressure_total: self.dispatch_backpressure_total.load(Ordering::Relaxed),
            devices_tracked: self.devices_tracked.load(Ordering::Relaxed),
            dispatch_in_flight: self.dispatch_in_flight.load(Ordering::Relaxed),
            recipients,
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_DELIVERY_BOUNDS_MS: [u64; 10] = DELIVERY_BOUNDS_MS;

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub messages_total: u64,
    pub messages_per_sec: f64,
    /// Submit-to-processed histogram
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lane_lat_buckets: [u64; NUM_BUCKETS],
    pub lane_lat_avg_us: u64,
    pub lane_lat_max_us: u64,
    pub lane_lat_p50_us: u64,
    pub lane_lat_p99_us: u64,
    pub malformed_total: u64,
    pub readings_total: u64,
    pub candidates_total: u64,
    pub alerts_emitted_total: u64,
    pub suppressed_rate_limited_total: u64,
    pub suppressed_quiet_hours_total: u64,
    pub state_unavailable_total: u64,
    pub deliveries_ok_total: u64,
    pub deliveries_failed_total: u64,
    pub delivery_timeouts_total: u64,
    pub escalations_total: u64,
    pub registry_errors_total: u64,
    /// Delivery attempt histogram
    /// Bounds: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
    pub delivery_lat_buckets: [u64; NUM_BUCKETS],
    pub delivery_lat_avg_ms: u64,
    pub delivery_lat_max_ms: u64,
    pub delivery_lat_p99_ms: u64,
    pub persistence_dropped: u64,
    pub egress_dropped: u64,
    pub dispatch_backpressure_total: u64,
    pub devices_tracked: u64,
    pub dispatch_in_flight: u64,
    pub recipients: usize,
    pub mqtt_connected: bool,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            messages_total = %self.messages_total,
            messages_per_sec = format!("{:.1}", self.messages_per_sec),
            lane_avg_us = %self.lane_lat_avg_us,
            lane_p99_us = %self.lane_lat_p99_us,
            malformed = %self.malformed_total,
            alerts_emitted = %self.alerts_emitted_total,
            suppressed_rate = %self.suppressed_rate_limited_total,
            suppressed_quiet = %self.suppressed_quiet_hours_total,
            deliveries_ok = %self.deliveries_ok_total,
            deliveries_failed = %self.deliveries_failed_total,
            delivery_p99_ms = %self.delivery_lat_p99_ms,
            dispatch_backpressure = %self.dispatch_backpressure_total,
            devices = %self.devices_tracked,
            recipients = %self.recipients,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.messages_total(), 0);
        assert_eq!(metrics.alerts_emitted_total(), 0);
        assert!(!metrics.mqtt_connected());
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_message_processed(100);
        metrics.record_message_processed(200);
        metrics.record_message_processed(300);
        metrics.record_alert_emitted();

        let summary = metrics.report(4);

        assert_eq!(summary.messages_total, 3);
        assert_eq!(summary.lane_lat_avg_us, 200);
        assert_eq!(summary.lane_lat_max_us, 300);
        assert_eq!(summary.alerts_emitted_total, 1);
        assert_eq!(summary.recipients, 4);

        // Periodic counters should be reset
        assert_eq!(metrics.processed_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.lane_latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.lane_latency_max_us.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_report_empty() {
        let metrics = Metrics::new();
        let summary = metrics.report(0);

        assert_eq!(summary.messages_total, 0);
        assert_eq!(summary.lane_lat_avg_us, 0);
        assert_eq!(summary.delivery_lat_p99_ms, 0);
    }

    #[test]
    fn test_suppression_counters() {
        let metrics = Metrics::new();
        metrics.record_suppressed(SuppressReason::RateLimited);
        metrics.record_suppressed(SuppressReason::RateLimited);
        metrics.record_suppressed(SuppressReason::QuietHours);

        let summary = metrics.report(0);
        assert_eq!(summary.suppressed_rate_limited_total, 2);
        assert_eq!(summary.suppressed_quiet_hours_total, 1);
    }

    #[test]
    fn test_delivery_tracking() {
        let metrics = Metrics::new();
        metrics.record_delivery(true, false, 15);
        metrics.record_delivery(false, true, 5000);
        metrics.record_delivery(false, false, 30);

        let summary = metrics.report(0);
        assert_eq!(summary.deliveries_ok_total, 1);
        assert_eq!(summary.deliveries_failed_total, 2);
        assert_eq!(summary.delivery_timeouts_total, 1);
        assert_eq!(summary.delivery_lat_max_ms, 5000);
        assert_eq!(summary.delivery_lat_buckets[1], 1); // 15ms ≤20
        assert_eq!(summary.delivery_lat_buckets[9], 1); // 5000ms ≤5120
    }

    #[test]
    fn test_device_gauge_never_underflows() {
        let metrics = Metrics::new();
        metrics.device_tracked();
        metrics.devices_evicted(5);
        assert_eq!(metrics.devices_tracked(), 0);

        metrics.dispatch_finished();
        assert_eq!(metrics.report(0).dispatch_in_flight, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_message_received();
                    m.record_message_processed(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.messages_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10); // overflow
        assert_eq!(delivery_bucket_index(10), 0);
        assert_eq!(delivery_bucket_index(6000), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();

        // All at 150µs (bucket 1, ≤200)
        for _ in 0..100 {
            metrics.record_message_processed(150);
        }

        let summary = metrics.report(0);
        assert_eq!(summary.lane_lat_p50_us, 200);
        assert_eq!(summary.lane_lat_p99_us, 200);
    }

    #[test]
    fn test_percentile_overflow_bucket() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[10] = 4;
        assert_eq!(percentile_from_buckets(&buckets, &BUCKET_BOUNDS, 0.99), 102400);
    }
}
