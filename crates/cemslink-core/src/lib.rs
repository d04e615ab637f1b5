//! # cemslink-core
//!
//! **Aligned, encrypted stack-emission data delivery.**
//!
//! `cemslink-core` samples sensor sources continuously, averages each
//! parameter over fixed windows aligned to the wall clock of the reporting
//! timezone, and delivers each window to a compliance endpoint as an
//! AES-encrypted, RSA-signed envelope. Deliveries that fail are retried with
//! backoff, then parked in a bounded on-disk queue that drains after the next
//! successful send. A connectivity monitor can restart the device after a
//! prolonged outage.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cemslink_core::{Config, Orchestrator};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_layered("config.json".as_ref())?;
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! Orchestrator::from_config(config)?.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Sources → Aggregator → (boundary) → Envelope → Seal → Transmit
//!                                                         ↓ failure
//!                                                  Failure queue → drain
//!
//! Every source implements the [`SensorSource`] trait. The [`Orchestrator`]
//! polls them on their own intervals and dispatches one envelope per window.

pub mod aggregator;
pub mod codec;
pub mod config;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod queue;
pub mod report;
pub mod schedule;
pub mod source;
pub mod sources;
pub mod status;
pub mod transmit;

pub use aggregator::{AveragedSet, AveragedValue, SampleAggregator};
pub use codec::{DispatchEnvelope, EncryptedPayload, EnvelopeParam, PayloadCodec};
pub use config::{Config, SourceConfig};
pub use error::{CodecError, ConfigError, QueueError, SourceError, TimestampError};
pub use monitor::{
    CommandRemediator, ConnectivityMonitor, HealthState, HttpProbe, MonitorPolicy, Probe,
    Remediator,
};
pub use orchestrator::{CycleResult, Orchestrator, Pipeline};
pub use queue::{DrainReport, EnqueueOutcome, FailureQueue, QueueItem};
pub use report::{ErrorReporter, ReportTag, ReporterSettings};
pub use schedule::{AlignmentScheduler, Cadence};
pub use source::{Reading, SensorSource, SourceInfo, SourceProtocol};
pub use sources::{AnalogRestSource, StaticSource};
pub use status::{StatusSnapshot, StatusTracker};
pub use transmit::{Deliver, Delivery, Outcome, RetryPolicy, Transmitter};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
