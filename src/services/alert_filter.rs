//! Alert admission: decide which candidates reach operators
//!
//! Order of checks:
//! 1. Emergencies (level 3) always emit
//! 2. Rate limit per (device, kind) within the trailing window
//! 3. Quiet hours drop low-priority candidates (level < 2)
//!
//! Only emitted alerts are recorded in the history; suppressed candidates
//! never count toward the rate limit.

use crate::domain::{Alert, AlertKind, AlertLevel, CandidateAlert, DeviceId};
use crate::infra::config::{secs, FilterConfig};
use chrono::{DateTime, Duration, FixedOffset, Local, Timelike, Utc};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    RateLimited,
    QuietHours,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::RateLimited => "rate-limited",
            SuppressReason::QuietHours => "quiet-hours",
        }
    }
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Emit(Alert),
    Suppress(SuppressReason),
}

/// Local-hour range during which low-priority alerts are held back.
/// `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    start: u32,
    end: u32,
    offset: Option<FixedOffset>,
}

impl QuietHours {
    pub fn new(start: u32, end: u32, utc_offset_minutes: Option<i32>) -> Self {
        Self {
            start: start % 24,
            end: end % 24,
            offset: utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.quiet_start_hour, config.quiet_end_hour, config.utc_offset_minutes)
    }

    /// Whether `hour` falls in `[start, end)`
    pub fn contains(&self, hour: u32) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }

    /// Local hour of an instant, using the configured offset or the host zone
    pub fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        match self.offset {
            Some(offset) => at.with_timezone(&offset).hour(),
            None => at.with_timezone(&Local).hour(),
        }
    }

    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.contains(self.local_hour(at))
    }
}

/// Emission timestamps per (device, kind) within the trailing window
pub struct AlertHistoryWindow {
    window: Duration,
    entries: FxHashMap<(DeviceId, AlertKind), VecDeque<DateTime<Utc>>>,
}

impl AlertHistoryWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: secs(window_secs),
            entries: FxHashMap::default(),
        }
    }

    /// Emissions of `(device, kind)` within the window ending at `now`
    pub fn count(&mut self, device: &DeviceId, kind: AlertKind, now: DateTime<Utc>) -> usize {
        let window = self.window;
        match self.entries.get_mut(&(device.clone(), kind)) {
            Some(times) => {
                while times.front().is_some_and(|t| now - *t >= window) {
                    times.pop_front();
                }
                times.len()
            }
            None => 0,
        }
    }

    pub fn record(&mut self, device: &DeviceId, kind: AlertKind, at: DateTime<Utc>) {
        self.entries.entry((device.clone(), kind)).or_default().push_back(at);
    }

    /// Drop expired timestamps and empty keys, returning keys removed
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let window = self.window;
        let before = self.entries.len();
        self.entries.retain(|_, times| {
            times.retain(|t| now - *t < window);
            !times.is_empty()
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct AlertFilter {
    threshold: usize,
    quiet_hours: QuietHours,
}

impl AlertFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            threshold: config.rate_limit_threshold as usize,
            quiet_hours: QuietHours::from_config(config),
        }
    }

    pub fn quiet_hours(&self) -> &QuietHours {
        &self.quiet_hours
    }

    /// Admit a candidate, judging quiet hours by the candidate's own time
    pub fn admit(&self, candidate: CandidateAlert, history: &mut AlertHistoryWindow) -> FilterDecision {
        let night = self.quiet_hours.is_active(candidate.created_at);
        self.admit_at(candidate, history, night)
    }

    pub fn admit_at(
        &self,
        candidate: CandidateAlert,
        history: &mut AlertHistoryWindow,
        is_night_hours: bool,
    ) -> FilterDecision {
        let now = candidate.created_at;

        if !candidate.level.is_emergency() {
            let emitted = history.count(&candidate.device_id, candidate.kind, now);
            if emitted >= self.threshold {
                return FilterDecision::Suppress(SuppressReason::RateLimited);
            }
            if is_night_hours && candidate.level < AlertLevel::Warning {
                return FilterDecision::Suppress(SuppressReason::QuietHours);
            }
        }

        history.record(&candidate.device_id, candidate.kind, now);
        FilterDecision::Emit(Alert::from_candidate(Uuid::now_v7(), candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn candidate(level: AlertLevel, kind: AlertKind, ts: DateTime<Utc>) -> CandidateAlert {
        CandidateAlert {
            device_id: DeviceId::new("d1"),
            facility_id: None,
            level,
            kind,
            message: kind.as_str().to_string(),
            detail: json!({}),
            created_at: ts,
        }
    }

    fn utc_filter() -> AlertFilter {
        AlertFilter::new(&FilterConfig { utc_offset_minutes: Some(0), ..Default::default() })
    }

    #[test]
    fn test_quiet_hours_wraps_midnight() {
        let q = QuietHours::new(22, 6, Some(0));
        assert!(q.contains(22));
        assert!(q.contains(23));
        assert!(q.contains(0));
        assert!(q.contains(5));
        assert!(!q.contains(6));
        assert!(!q.contains(14));
        assert!(!q.contains(21));
    }

    #[test]
    fn test_quiet_hours_same_day_range_and_empty() {
        let q = QuietHours::new(1, 4, Some(0));
        assert!(q.contains(2));
        assert!(!q.contains(4));
        assert!(!QuietHours::new(3, 3, Some(0)).contains(3));
    }

    #[test]
    fn test_quiet_hours_offset() {
        // 14:00 UTC is 23:00 at +09:00
        let q = QuietHours::new(22, 6, Some(9 * 60));
        assert_eq!(q.local_hour(at(14, 0)), 23);
        assert!(q.is_active(at(14, 0)));
    }

    #[test]
    fn test_rate_limit_fourth_suppressed() {
        let filter = utc_filter();
        let mut history = AlertHistoryWindow::new(300);

        for minute in 0..3 {
            let decision = filter.admit(
                candidate(AlertLevel::Warning, AlertKind::HighTemp, at(14, minute)),
                &mut history,
            );
            assert!(matches!(decision, FilterDecision::Emit(_)), "emission {minute}");
        }

        let fourth = filter
            .admit(candidate(AlertLevel::Warning, AlertKind::HighTemp, at(14, 3)), &mut history);
        assert_eq!(fourth, FilterDecision::Suppress(SuppressReason::RateLimited));

        // Window from the first emission has elapsed
        let later = filter
            .admit(candidate(AlertLevel::Warning, AlertKind::HighTemp, at(14, 5)), &mut history);
        assert!(matches!(later, FilterDecision::Emit(_)));
    }

    #[test]
    fn test_rate_limit_is_per_kind() {
        let filter = utc_filter();
        let mut history = AlertHistoryWindow::new(300);
        for _ in 0..3 {
            filter.admit(candidate(AlertLevel::Warning, AlertKind::HighTemp, at(14, 0)), &mut history);
        }
        let other = filter
            .admit(candidate(AlertLevel::Warning, AlertKind::BedExit, at(14, 0)), &mut history);
        assert!(matches!(other, FilterDecision::Emit(_)));
    }

    #[test]
    fn test_emergency_bypasses_rate_limit() {
        let filter = utc_filter();
        let mut history = AlertHistoryWindow::new(300);
        for _ in 0..10 {
            let decision = filter
                .admit(candidate(AlertLevel::Emergency, AlertKind::Fall, at(23, 0)), &mut history);
            assert!(matches!(decision, FilterDecision::Emit(_)));
        }
    }

    #[test]
    fn test_quiet_hours_suppress_low_priority() {
        let filter = utc_filter();
        let mut history = AlertHistoryWindow::new(300);

        let notice = filter
            .admit(candidate(AlertLevel::Notice, AlertKind::HighHumidity, at(23, 0)), &mut history);
        assert_eq!(notice, FilterDecision::Suppress(SuppressReason::QuietHours));

        let warning =
            filter.admit(candidate(AlertLevel::Warning, AlertKind::BedExit, at(23, 0)), &mut history);
        assert!(matches!(warning, FilterDecision::Emit(_)));

        let daytime = filter
            .admit(candidate(AlertLevel::Notice, AlertKind::HighHumidity, at(14, 0)), &mut history);
        assert!(matches!(daytime, FilterDecision::Emit(_)));
    }

    #[test]
    fn test_suppression_does_not_touch_history() {
        let filter = utc_filter();
        let mut history = AlertHistoryWindow::new(300);
        for _ in 0..5 {
            filter.admit_at(
                candidate(AlertLevel::Notice, AlertKind::LowTemp, at(23, 0)),
                &mut history,
                true,
            );
        }
        assert_eq!(history.count(&DeviceId::new("d1"), AlertKind::LowTemp, at(23, 0)), 0);
        assert!(history.is_empty());
    }

    #[test]
    fn test_emitted_alert_gets_id_and_keeps_fields() {
        let filter = utc_filter();
        let mut history = AlertHistoryWindow::new(300);
        let FilterDecision::Emit(alert) = filter
            .admit(candidate(AlertLevel::Warning, AlertKind::HighTemp, at(14, 0)), &mut history)
        else {
            panic!("expected emit")
        };
        assert_eq!(alert.id.get_version_num(), 7);
        assert_eq!(alert.kind, AlertKind::HighTemp);
        assert_eq!(alert.created_at, at(14, 0));
    }

    #[test]
    fn test_prune_drops_expired_keys() {
        let mut history = AlertHistoryWindow::new(300);
        history.record(&DeviceId::new("d1"), AlertKind::Fall, at(14, 0));
        history.record(&DeviceId::new("d2"), AlertKind::Fall, at(14, 4));
        assert_eq!(history.prune(at(14, 6)), 1);
        assert_eq!(history.len(), 1);
    }
}
