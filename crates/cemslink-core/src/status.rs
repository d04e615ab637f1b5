//! Process-wide delivery and acquisition status.
//!
//! Owned by the orchestrator and shared by reference with every loop that
//! updates it; the error reporter reads it to fill in report context.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SourceError;
use crate::source::SourceState;

/// Serializable view of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub healthy: bool,
    pub total_readings: u64,
    pub failures: u64,
    pub last_poll_ms: f64,
    pub last_error: Option<String>,
}

/// Point-in-time copy of the tracker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub last_fetch_success: Option<DateTime<Utc>>,
    pub last_send_success: Option<DateTime<Utc>>,
    pub total_sends: u64,
    pub failed_sends: u64,
    pub last_error: Option<String>,
    pub sources: Vec<SourceSummary>,
}

#[derive(Default)]
struct Inner {
    last_fetch_success: Option<DateTime<Utc>>,
    last_send_success: Option<DateTime<Utc>>,
    total_sends: u64,
    failed_sends: u64,
    last_error: Option<String>,
    sources: BTreeMap<String, SourceState>,
}

#[derive(Default)]
pub struct StatusTracker {
    inner: Mutex<Inner>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_fetch(&self, source: &str, count: usize, elapsed: Duration, at: DateTime<Utc>) {
        let mut inner = self.lock();
        if count > 0 {
            inner.last_fetch_success = Some(at);
        }
        inner
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceState::new(source))
            .record_success(count, elapsed, at);
    }

    /// Returns the source's consecutive failure count.
    pub fn record_fetch_failure(&self, source: &str, error: &SourceError, elapsed: Duration) -> u64 {
        let mut inner = self.lock();
        inner.last_error = Some(error.to_string());
        let state = inner
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceState::new(source));
        state.record_failure(error, elapsed);
        state.consecutive_failures
    }

    pub fn record_send_success(&self, at: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.total_sends += 1;
        inner.last_send_success = Some(at);
        inner.last_error = None;
    }

    pub fn record_send_failure(&self, error: impl Into<String>) {
        let mut inner = self.lock();
        inner.total_sends += 1;
        inner.failed_sends += 1;
        inner.last_error = Some(error.into());
    }

    pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
        self.lock().last_fetch_success
    }

    pub fn last_send(&self) -> Option<DateTime<Utc>> {
        self.lock().last_send_success
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            last_fetch_success: inner.last_fetch_success,
            last_send_success: inner.last_send_success,
            total_sends: inner.total_sends,
            failed_sends: inner.failed_sends,
            last_error: inner.last_error.clone(),
            sources: inner
                .sources
                .values()
                .map(|s| SourceSummary {
                    name: s.name.clone(),
                    healthy: s.healthy,
                    total_readings: s.total_readings,
                    failures: s.failures,
                    last_poll_ms: s.last_poll_time.as_secs_f64() * 1000.0,
                    last_error: s.last_error.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_counters() {
        let tracker = StatusTracker::new();
        tracker.record_send_failure("server error (HTTP 503)");
        let now = Utc::now();
        tracker.record_send_success(now);
        let snap = tracker.snapshot();
        assert_eq!(snap.total_sends, 2);
        assert_eq!(snap.failed_sends, 1);
        assert_eq!(snap.last_send_success, Some(now));
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn test_fetch_tracking_per_source() {
        let tracker = StatusTracker::new();
        let now = Utc::now();
        tracker.record_fetch("analog", 4, Duration::from_millis(12), now);
        tracker.record_fetch_failure(
            "stack",
            &SourceError::Disconnected("stack".into()),
            Duration::from_millis(3),
        );
        let snap = tracker.snapshot();
        assert_eq!(snap.last_fetch_success, Some(now));
        assert_eq!(snap.sources.len(), 2);
        let analog = snap.sources.iter().find(|s| s.name == "analog").unwrap();
        assert!(analog.healthy);
        assert_eq!(analog.total_readings, 4);
        let stack = snap.sources.iter().find(|s| s.name == "stack").unwrap();
        assert!(!stack.healthy);
        assert_eq!(stack.failures, 1);
    }

    #[test]
    fn test_empty_fetch_does_not_count_as_success() {
        let tracker = StatusTracker::new();
        tracker.record_fetch("analog", 0, Duration::ZERO, Utc::now());
        assert!(tracker.last_fetch().is_none());
    }
}
