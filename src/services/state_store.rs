//! Per-device state kept between readings
//!
//! Each lane owns one store, so a device's entry has a single writer and
//! no locking is needed. Entries not touched within the idle TTL are
//! evicted by the lane's maintenance tick.

use crate::domain::{DeviceId, DeviceState, StateUnavailable};
use crate::infra::config::secs;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Storage seam for device state
pub trait StateStore: Send + Sync {
    /// Current state of a device, `None` if never seen (or evicted)
    fn load(
        &mut self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceState>, StateUnavailable>;

    /// Replace a device's state
    fn save(
        &mut self,
        device: &DeviceId,
        state: DeviceState,
        now: DateTime<Utc>,
    ) -> Result<(), StateUnavailable>;

    /// Drop entries idle past the TTL, returning how many were removed
    fn evict_idle(&mut self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    state: DeviceState,
    touched_at: DateTime<Utc>,
}

/// In-memory store with idle eviction
pub struct InMemoryStateStore {
    entries: FxHashMap<DeviceId, Entry>,
    idle_ttl: Duration,
}

impl InMemoryStateStore {
    pub fn new(idle_ttl_secs: u64) -> Self {
        Self {
            entries: FxHashMap::default(),
            idle_ttl: secs(idle_ttl_secs),
        }
    }
}

impl StateStore for InMemoryStateStore {
    fn load(
        &mut self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceState>, StateUnavailable> {
        Ok(self.entries.get_mut(device).map(|entry| {
            entry.touched_at = entry.touched_at.max(now);
            entry.state.clone()
        }))
    }

    fn save(
        &mut self,
        device: &DeviceId,
        state: DeviceState,
        now: DateTime<Utc>,
    ) -> Result<(), StateUnavailable> {
        match self.entries.get_mut(device) {
            Some(entry) => {
                entry.state = state;
                entry.touched_at = entry.touched_at.max(now);
            }
            None => {
                self.entries.insert(device.clone(), Entry { state, touched_at: now });
            }
        }
        Ok(())
    }

    fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.idle_ttl;
        self.entries.retain(|device, entry| {
            let keep = now - entry.touched_at <= ttl;
            if !keep {
                debug!(device_id = %device, "device_state_evicted");
            }
            keep
        });
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
