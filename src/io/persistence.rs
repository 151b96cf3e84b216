//! Persistence sink - appends alert and reading records to a JSONL file
//!
//! Producers never wait on the disk: records go through a bounded channel
//! with `try_send` and are dropped (and counted) when it is full. Write
//! failures are logged and never propagate into the pipeline.

use crate::domain::{Alert, DeviceId};
use crate::infra::metrics::Metrics;
use crate::services::dispatcher::DispatchReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum PersistenceRecord {
    AlertCreated {
        alert: Alert,
    },
    AlertDispatched {
        alert_id: Uuid,
        escalated: usize,
        report: DispatchReport,
    },
    ReadingProcessed {
        device_id: DeviceId,
        /// Device-reported time
        timestamp: DateTime<Utc>,
        /// Gateway clock the rules ran on
        received_at: DateTime<Utc>,
        candidates: usize,
        emitted: usize,
    },
}

impl PersistenceRecord {
    fn kind(&self) -> &'static str {
        match self {
            PersistenceRecord::AlertCreated { .. } => "alert_created",
            PersistenceRecord::AlertDispatched { .. } => "alert_dispatched",
            PersistenceRecord::ReadingProcessed { .. } => "reading_processed",
        }
    }
}

/// Non-blocking producer handle
#[derive(Clone)]
pub struct PersistenceSender {
    tx: mpsc::Sender<PersistenceRecord>,
    metrics: Option<Arc<Metrics>>,
}

impl PersistenceSender {
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn send(&self, record: PersistenceRecord) {
        if self.tx.try_send(record).is_err() {
            if let Some(ref m) = self.metrics {
                m.record_persistence_dropped();
            }
        }
    }
}

pub fn create_persistence_channel(
    buffer_size: usize,
) -> (PersistenceSender, mpsc::Receiver<PersistenceRecord>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (PersistenceSender { tx, metrics: None }, rx)
}

/// JSONL file writer
pub struct JsonlSink {
    file_path: String,
}

impl JsonlSink {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "persistence_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write one record, returning whether it reached the file
    pub fn write(&self, record: &PersistenceRecord) -> bool {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!(record = %record.kind(), error = %e, "persistence_serialize_failed");
                return false;
            }
        };

        match self.append_line(&line) {
            Ok(()) => true,
            Err(e) => {
                error!(record = %record.kind(), error = %e, "persistence_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "persistence_written");

        Ok(())
    }
}

/// Drain records into the sink until shutdown, then flush what is queued
pub async fn run_persistence_writer(
    sink: JsonlSink,
    mut rx: mpsc::Receiver<PersistenceRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    while let Ok(record) = rx.try_recv() {
                        sink.write(&record);
                    }
                    info!("persistence_shutdown");
                    return;
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(record) => {
                        sink.write(&record);
                    }
                    None => {
                        info!("persistence_channel_closed");
                        return;
                    }
                }
            }
        }
    }
}
