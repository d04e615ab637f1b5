//! Sensor source capability and per-source runtime state.
//!
//! Every acquisition back-end implements the [`SensorSource`] trait, which
//! provides metadata via [`SourceInfo`] and a single blocking `poll()` that
//! returns a batch of [`Reading`]s. The orchestrator holds a flat list of
//! boxed sources and polls each one on its own loop; a failing source never
//! affects the others.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Acquisition protocol a source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceProtocol {
    /// HTML data page scraped over HTTP.
    Html,
    /// Modbus TCP register reads.
    ModbusTcp,
    /// Modbus RTU over a serial line.
    ModbusRtu,
    /// JSON REST service (e.g. the analog acquisition server).
    Rest,
    /// In-process values (tests, simulators).
    Static,
}

impl std::fmt::Display for SourceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Html => write!(f, "html"),
            Self::ModbusTcp => write!(f, "modbus_tcp"),
            Self::ModbusRtu => write!(f, "modbus_rtu"),
            Self::Rest => write!(f, "rest"),
            Self::Static => write!(f, "static"),
        }
    }
}

/// One measured value of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Parameter name as the receiver knows it (e.g. `"ph"`, `"pm10"`).
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    /// Wall-clock capture instant.
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        parameter: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            parameter: parameter.into(),
            value,
            unit: unit.into(),
            captured_at,
        }
    }
}

/// Metadata about a sensor source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Unique identifier, used in logs and status output.
    pub name: String,
    /// One-line human-readable description.
    pub description: String,
    pub protocol: SourceProtocol,
    /// How often the orchestrator polls this source.
    pub poll_interval: Duration,
}

/// Trait that every sensor back-end must implement.
///
/// `poll()` may block on I/O; the orchestrator runs it on the blocking pool.
pub trait SensorSource: Send + Sync {
    /// Source metadata.
    fn info(&self) -> &SourceInfo;

    /// Read the current values of every parameter this source provides.
    fn poll(&self) -> Result<Vec<Reading>, SourceError>;

    /// Convenience: name from info.
    fn name(&self) -> &str {
        &self.info().name
    }
}

/// Runtime state for a registered source.
#[derive(Debug, Clone)]
pub struct SourceState {
    pub name: String,
    pub total_readings: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_poll_time: Duration,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub healthy: bool,
}

impl SourceState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_readings: 0,
            failures: 0,
            consecutive_failures: 0,
            last_poll_time: Duration::ZERO,
            last_success: None,
            last_error: None,
            healthy: true,
        }
    }

    /// Record a successful poll that produced `count` readings.
    pub fn record_success(&mut self, count: usize, elapsed: Duration, at: DateTime<Utc>) {
        self.total_readings += count as u64;
        self.consecutive_failures = 0;
        self.last_poll_time = elapsed;
        self.last_success = Some(at);
        self.last_error = None;
        self.healthy = count > 0;
    }

    /// Record a failed poll.
    pub fn record_failure(&mut self, error: &SourceError, elapsed: Duration) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_poll_time = elapsed;
        self.last_error = Some(error.to_string());
        self.healthy = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_state_success_resets_consecutive_failures() {
        let mut state = SourceState::new("analog");
        let err = SourceError::Disconnected("analog".into());
        state.record_failure(&err, Duration::from_millis(5));
        state.record_failure(&err, Duration::from_millis(5));
        assert_eq!(state.consecutive_failures, 2);
        assert!(!state.healthy);

        state.record_success(3, Duration::from_millis(2), Utc::now());
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.failures, 2);
        assert_eq!(state.total_readings, 3);
        assert!(state.healthy);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_empty_poll_is_not_healthy() {
        let mut state = SourceState::new("analog");
        state.record_success(0, Duration::ZERO, Utc::now());
        assert!(!state.healthy);
        assert_eq!(state.failures, 0);
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(SourceProtocol::ModbusTcp.to_string(), "modbus_tcp");
        assert_eq!(SourceProtocol::Rest.to_string(), "rest");
    }
}
