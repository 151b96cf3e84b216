//! Per-device lane pipeline
//!
//! Devices are hashed onto a fixed set of lanes. Each lane is a single task
//! owning its state store and alert history, so all messages from one device
//! are processed in arrival order while different devices proceed in
//! parallel. Emitted alerts leave the lane through the dispatch worker
//! channel.

use crate::domain::types::{
    DeviceStatusUpdate, LocationUpdate, RawAlert, RecipientRegistration,
};
use crate::domain::{
    AlertKind, AlertLevel, CandidateAlert, ChannelKind, DeviceId, DeviceState, FacilityId,
    GeoPoint, InboundMessage, PipelineError, RecipientId, RegistryUnavailable, SensorReading,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use crate::io::persistence::{PersistenceRecord, PersistenceSender};
use crate::services::alert_filter::{AlertFilter, AlertHistoryWindow, FilterDecision};
use crate::services::detector::AnomalyDetector;
use crate::services::dispatch_worker::{create_dispatch_worker, DispatchJob};
use crate::services::dispatcher::Dispatcher;
use crate::services::escalation::policy_for;
use crate::services::registry::RecipientDirectory;
use crate::services::router::route;
use crate::services::state_store::{InMemoryStateStore, StateStore};
use chrono::{DateTime, Utc};
use rustc_hash::FxHasher;
use serde_json::{json, Value};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Synthetic device that carries manual test alerts
pub const TEST_ALERT_DEVICE: &str = "manual-test";
const TEST_ALERT_MESSAGE: &str = "This is a test alert";
const TEST_ALERT_LOCATION: GeoPoint = GeoPoint { latitude: 35.6762, longitude: 139.6503 };

pub type StoreFactory = Arc<dyn Fn() -> Box<dyn StateStore> + Send + Sync>;

/// `received_at` is the gateway clock every stateful rule runs on
enum LaneMessage {
    Inbound { message: InboundMessage, received_at: DateTime<Utc>, queued_at: Instant },
    TestAlert { facility: Option<FacilityId>, received_at: DateTime<Utc>, queued_at: Instant },
    Shutdown,
}

/// Collaborators shared by every lane
pub struct PipelineDeps {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    persistence: Option<PersistenceSender>,
    egress: Option<EgressSender>,
    store_factory: Option<StoreFactory>,
}

impl PipelineDeps {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<Metrics>) -> Self {
        Self { dispatcher, metrics, persistence: None, egress: None, store_factory: None }
    }

    pub fn with_persistence(mut self, persistence: PersistenceSender) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_egress(mut self, egress: EgressSender) -> Self {
        self.egress = Some(egress);
        self
    }

    /// Replace the per-lane in-memory store
    pub fn with_state_store(mut self, factory: StoreFactory) -> Self {
        self.store_factory = Some(factory);
        self
    }
}

/// Cloneable front door to the pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    lanes: Arc<[mpsc::Sender<LaneMessage>]>,
    closed: Arc<AtomicBool>,
    directory: Arc<dyn RecipientDirectory>,
    metrics: Arc<Metrics>,
}

impl PipelineHandle {
    /// Route one transport message into its device lane.
    ///
    /// Waits when the lane queue is full. Registrations are applied directly
    /// to the recipient directory.
    pub async fn submit(&self, topic: &str, payload: &[u8]) -> Result<(), PipelineError> {
        self.submit_at(topic, payload, Utc::now()).await
    }

    /// Same as [`submit`](Self::submit) with an explicit gateway receive time.
    ///
    /// Device state, rate limiting and quiet hours all run on `received_at`;
    /// the device's own timestamp is only reported.
    pub async fn submit_at(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if self.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        self.metrics.record_message_received();
        let queued_at = Instant::now();

        let message = route(topic, payload, received_at).inspect_err(|_| {
            self.metrics.record_malformed();
        })?;

        if let InboundMessage::Registration(reg) = message {
            self.apply_registration(reg);
            self.metrics.record_message_processed(queued_at.elapsed().as_micros() as u64);
            return Ok(());
        }

        let lane = match message.device_id() {
            Some(device) => self.lane_for(device),
            None => 0,
        };
        self.lanes[lane]
            .send(LaneMessage::Inbound { message, received_at, queued_at })
            .await
            .map_err(|_| PipelineError::ShuttingDown)
    }

    /// Register or update a recipient channel address
    pub fn register_recipient(
        &self,
        id: RecipientId,
        channel: ChannelKind,
        address: String,
        facility: Option<FacilityId>,
    ) -> Result<bool, RegistryUnavailable> {
        self.directory.register_recipient(id, channel, address, facility).inspect_err(|_| {
            self.metrics.record_registry_error();
        })
    }

    /// Inject a level 2 test alert through the normal filter and dispatch path
    pub async fn trigger_test_alert(&self, facility: Option<FacilityId>) -> Result<(), PipelineError> {
        if self.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        let lane = self.lane_for(&DeviceId::new(TEST_ALERT_DEVICE));
        self.lanes[lane]
            .send(LaneMessage::TestAlert {
                facility,
                received_at: Utc::now(),
                queued_at: Instant::now(),
            })
            .await
            .map_err(|_| PipelineError::ShuttingDown)
    }

    /// Stop intake; lanes drain what is queued and exit
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(lanes = %self.lanes.len(), "pipeline_closing");
        for lane in self.lanes.iter() {
            let _ = lane.send(LaneMessage::Shutdown).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn recipients(&self) -> usize {
        self.directory.len()
    }

    fn lane_for(&self, device: &DeviceId) -> usize {
        lane_index(device, self.lanes.len())
    }

    fn apply_registration(&self, reg: RecipientRegistration) {
        let RecipientRegistration { recipient_id, channel, address, facility_id } = reg;
        match self.register_recipient(recipient_id.clone(), channel, address, facility_id) {
            Ok(true) => info!(recipient_id = %recipient_id, channel = %channel, "recipient_registered"),
            Ok(false) => debug!(recipient_id = %recipient_id, channel = %channel, "recipient_unchanged"),
            Err(e) => warn!(recipient_id = %recipient_id, error = %e, "recipient_registration_failed"),
        }
    }
}

pub fn lane_index(device: &DeviceId, lanes: usize) -> usize {
    let mut hasher = FxHasher::default();
    device.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Spawned lane and dispatch tasks
pub struct PipelineTasks {
    lanes: Vec<JoinHandle<()>>,
    dispatch: JoinHandle<()>,
}

impl PipelineTasks {
    /// Wait for every lane, then for the dispatch worker to finish in-flight alerts
    pub async fn join(self) {
        for lane in self.lanes {
            if let Err(e) = lane.await {
                error!(error = %e, "lane_task_failed");
            }
        }
        if let Err(e) = self.dispatch.await {
            error!(error = %e, "dispatch_worker_failed");
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    pub fn start(config: &Config, deps: PipelineDeps) -> (PipelineHandle, PipelineTasks) {
        let lane_count = config.lane_count();
        let directory = deps.dispatcher.directory().clone();

        let (alert_tx, worker) = create_dispatch_worker(
            deps.dispatcher,
            policy_for(config.escalation_mode()),
            deps.metrics.clone(),
            config.alert_queue_size(),
            config.dispatch_max_concurrent_alerts(),
        );
        let worker = match deps.persistence.clone() {
            Some(persistence) => worker.with_persistence(persistence),
            None => worker,
        };
        let dispatch = tokio::spawn(worker.run());

        let ttl = config.state_idle_ttl_secs();
        let store_factory = deps
            .store_factory
            .unwrap_or_else(|| Arc::new(move || Box::new(InMemoryStateStore::new(ttl))));
        let sweep = Duration::from_secs(config.state_sweep_interval_secs().max(1));

        let mut senders = Vec::with_capacity(lane_count);
        let mut lanes = Vec::with_capacity(lane_count);
        for index in 0..lane_count {
            let (tx, rx) = mpsc::channel(config.lane_queue_size().max(1));
            let lane = Lane {
                index,
                rx,
                store: store_factory(),
                history: AlertHistoryWindow::new(config.filter().window_secs),
                detector: AnomalyDetector::new(config.detection().clone()),
                filter: AlertFilter::new(config.filter()),
                alert_tx: alert_tx.clone(),
                metrics: deps.metrics.clone(),
                persistence: deps.persistence.clone(),
                egress: deps.egress.clone(),
            };
            senders.push(tx);
            lanes.push(tokio::spawn(lane.run(sweep)));
        }

        info!(
            lanes = %lane_count,
            lane_queue = %config.lane_queue_size(),
            escalation = ?config.escalation_mode(),
            "pipeline_started"
        );

        let handle = PipelineHandle {
            lanes: senders.into(),
            closed: Arc::new(AtomicBool::new(false)),
            directory,
            metrics: deps.metrics,
        };
        (handle, PipelineTasks { lanes, dispatch })
    }
}

struct Lane {
    index: usize,
    rx: mpsc::Receiver<LaneMessage>,
    store: Box<dyn StateStore>,
    history: AlertHistoryWindow,
    detector: AnomalyDetector,
    filter: AlertFilter,
    alert_tx: mpsc::Sender<DispatchJob>,
    metrics: Arc<Metrics>,
    persistence: Option<PersistenceSender>,
    egress: Option<EgressSender>,
}

impl Lane {
    async fn run(mut self, sweep: Duration) {
        debug!(lane = %self.index, "lane_started");
        let mut maintenance = tokio::time::interval(sweep);
        maintenance.tick().await;

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(LaneMessage::Shutdown) | None => break,
                        Some(msg) => self.handle(msg).await,
                    }
                }
                _ = maintenance.tick() => self.maintain(Utc::now()),
            }
        }

        // No new sends are accepted once closed; finish what is queued
        self.rx.close();
        let mut drained = 0usize;
        while let Some(msg) = self.rx.recv().await {
            if !matches!(msg, LaneMessage::Shutdown) {
                self.handle(msg).await;
                drained += 1;
            }
        }
        debug!(lane = %self.index, drained = %drained, "lane_stopped");
    }

    async fn handle(&mut self, msg: LaneMessage) {
        let queued_at = match msg {
            LaneMessage::Inbound { message, received_at, queued_at } => {
                match message {
                    InboundMessage::Reading(reading) => self.on_reading(reading, received_at).await,
                    InboundMessage::Status(update) => self.on_status(update, received_at),
                    InboundMessage::Location(update) => self.on_location(update, received_at),
                    InboundMessage::Alert(raw) => self.on_raw_alert(raw, received_at).await,
                    InboundMessage::Registration(_) => {}
                }
                queued_at
            }
            LaneMessage::TestAlert { facility, received_at, queued_at } => {
                self.on_test_alert(facility, received_at).await;
                queued_at
            }
            LaneMessage::Shutdown => return,
        };
        self.metrics.record_message_processed(queued_at.elapsed().as_micros() as u64);
    }

    fn maintain(&mut self, now: DateTime<Utc>) {
        let evicted = self.store.evict_idle(now);
        let pruned = self.history.prune(now);
        if evicted > 0 {
            self.metrics.devices_evicted(evicted);
        }
        if evicted > 0 || pruned > 0 {
            debug!(lane = %self.index, evicted = %evicted, pruned = %pruned, "lane_maintenance");
        }
    }

    /// Load state, or `None` when the store is unavailable
    fn load(&mut self, device: &DeviceId, now: DateTime<Utc>) -> Option<DeviceState> {
        match self.store.load(device, now) {
            Ok(state) => Some(state.unwrap_or_default()),
            Err(e) => {
                self.metrics.record_state_unavailable();
                warn!(device_id = %device, error = %e, "state_load_failed");
                None
            }
        }
    }

    fn save(&mut self, device: &DeviceId, state: DeviceState, now: DateTime<Utc>) {
        let before = self.store.len();
        match self.store.save(device, state, now) {
            Ok(()) => {
                if self.store.len() > before {
                    self.metrics.device_tracked();
                }
            }
            Err(e) => {
                self.metrics.record_state_unavailable();
                warn!(device_id = %device, error = %e, "state_save_failed");
            }
        }
    }

    async fn on_reading(&mut self, reading: SensorReading, now: DateTime<Utc>) {
        let prior = self.load(&reading.device_id, now);
        let evaluation = self.detector.evaluate(&reading, prior.as_ref(), now);
        self.save(&reading.device_id, evaluation.new_state, now);

        let candidates = evaluation.candidates.len();
        self.metrics.record_reading(candidates);

        let mut emitted = 0;
        for candidate in evaluation.candidates {
            if self.admit(candidate).await {
                emitted += 1;
            }
        }

        if let Some(ref persistence) = self.persistence {
            persistence.send(PersistenceRecord::ReadingProcessed {
                device_id: reading.device_id,
                timestamp: reading.timestamp,
                received_at: now,
                candidates,
                emitted,
            });
        }
    }

    fn on_status(&mut self, update: DeviceStatusUpdate, now: DateTime<Utc>) {
        if let Some(mut state) = self.load(&update.device_id, now) {
            state.last_status = Some(update.status.clone());
            state.last_seen_at = Some(now);
            self.save(&update.device_id, state, now);
        }
        debug!(device_id = %update.device_id, status = %update.status, "device_status_updated");
        if let Some(ref egress) = self.egress {
            egress.send_status(&update);
        }
    }

    fn on_location(&mut self, update: LocationUpdate, now: DateTime<Utc>) {
        if let Some(mut state) = self.load(&update.device_id, now) {
            state.last_location = Some(update.location);
            state.last_seen_at = Some(now);
            self.save(&update.device_id, state, now);
        }
        debug!(
            device_id = %update.device_id,
            latitude = %update.location.latitude,
            longitude = %update.location.longitude,
            satellites = ?update.satellites,
            "device_location_updated"
        );
    }

    async fn on_raw_alert(&mut self, raw: RawAlert, now: DateTime<Utc>) {
        let location = raw
            .location
            .or_else(|| self.load(&raw.device_id, now).and_then(|s| s.last_location));
        let mut detail = json!({ "source": "device" });
        if let Some(loc) = location {
            detail["location"] = location_value(loc);
        }

        self.admit(CandidateAlert {
            device_id: raw.device_id,
            facility_id: raw.facility_id,
            level: raw.level,
            kind: raw.kind,
            message: raw.message,
            detail,
            created_at: now,
        })
        .await;
    }

    async fn on_test_alert(&mut self, facility: Option<FacilityId>, now: DateTime<Utc>) {
        info!(facility_id = ?facility, "test_alert_triggered");
        self.admit(CandidateAlert {
            device_id: DeviceId::new(TEST_ALERT_DEVICE),
            facility_id: facility,
            level: AlertLevel::Warning,
            kind: AlertKind::ManualTest,
            message: TEST_ALERT_MESSAGE.to_string(),
            detail: json!({ "location": location_value(TEST_ALERT_LOCATION) }),
            created_at: now,
        })
        .await;
    }

    /// Run one candidate through the filter; returns whether it was emitted
    async fn admit(&mut self, candidate: CandidateAlert) -> bool {
        let kind = candidate.kind;
        let device_id = candidate.device_id.clone();

        match self.filter.admit(candidate, &mut self.history) {
            FilterDecision::Suppress(reason) => {
                self.metrics.record_suppressed(reason);
                debug!(device_id = %device_id, kind = %kind, reason = %reason, "alert_suppressed");
                false
            }
            FilterDecision::Emit(alert) => {
                self.metrics.record_alert_emitted();
                info!(
                    alert_id = %alert.id,
                    device_id = %alert.device_id,
                    level = %alert.level,
                    kind = %alert.kind,
                    message = %alert.message,
                    "alert_emitted"
                );
                if let Some(ref persistence) = self.persistence {
                    persistence.send(PersistenceRecord::AlertCreated { alert: alert.clone() });
                }
                if let Some(ref egress) = self.egress {
                    egress.send_alert(&alert);
                }
                self.enqueue(DispatchJob::new(alert)).await;
                true
            }
        }
    }

    /// Hand an alert to the dispatch worker. A full queue is counted and
    /// waited on; the lane stalls rather than dropping the alert.
    async fn enqueue(&self, job: DispatchJob) {
        let job = match self.alert_tx.try_send(job) {
            Ok(()) => return,
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Closed(job)) => {
                error!(alert_id = %job.alert.id, "dispatch_queue_closed");
                return;
            }
        };
        self.metrics.record_dispatch_backpressure();
        warn!(lane = %self.index, alert_id = %job.alert.id, "dispatch_queue_full");
        if let Err(e) = self.alert_tx.send(job).await {
            error!(alert_id = %e.0.alert.id, "dispatch_queue_closed");
        }
    }
}

fn location_value(loc: GeoPoint) -> Value {
    json!({ "latitude": loc.latitude, "longitude": loc.longitude })
}
