//! Wires sources, aggregation, dispatch, the failure queue, heartbeat and
//! connectivity monitoring into one long-running process.
//!
//! Loops (all stop on the shared shutdown signal):
//!
//! - one poll loop per source, feeding the aggregator;
//! - the dispatch loop: wait for the next aligned boundary, flush, build,
//!   validate, send, then queue / report / drain depending on the outcome;
//! - the heartbeat loop;
//! - the connectivity monitor;
//! - at most one drain task, spawned after a successful send.
//!
//! A failure in one loop is logged and reported; it never stops another loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::aggregator::{AveragedSet, SampleAggregator};
use crate::codec::{DispatchEnvelope, PayloadCodec, validate_timestamp};
use crate::config::Config;
use crate::error::{CodecError, ConfigError};
use crate::monitor::{CommandRemediator, ConnectivityMonitor, HttpProbe};
use crate::queue::{EnqueueOutcome, FailureQueue, QueueItem};
use crate::report::{ErrorReporter, ReportTag};
use crate::schedule::{AlignmentScheduler, Cadence, WaitOutcome, sleep_or_shutdown, wait_until};
use crate::source::SensorSource;
use crate::sources::build_sources;
use crate::status::StatusTracker;
use crate::transmit::{Deliver, Outcome, Transmitter};

/// What one dispatch cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleResult {
    /// Nothing was sampled in the window.
    Skipped,
    Delivered { parameters: usize },
    /// The receiver refused the content; dropped.
    Rejected(Outcome),
    /// Delivery failed and the envelope was queued (or expired).
    Queued(Outcome),
    /// The envelope could not be built or failed local validation.
    Invalid(String),
}

impl std::fmt::Display for CycleResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped (no readings)"),
            Self::Delivered { parameters } => write!(f, "delivered {parameters} parameter(s)"),
            Self::Rejected(outcome) => write!(f, "rejected: {outcome}"),
            Self::Queued(outcome) => write!(f, "queued after {outcome}"),
            Self::Invalid(reason) => write!(f, "invalid: {reason}"),
        }
    }
}

/// Queue drain transport that records each delivery in the status tracker.
struct TrackedDelivery {
    transmitter: Arc<Transmitter>,
    status: Arc<StatusTracker>,
}

impl Deliver for TrackedDelivery {
    async fn deliver(&self, envelope: &DispatchEnvelope) -> Outcome {
        let outcome = self.transmitter.deliver(envelope).await;
        if outcome.is_success() {
            self.status.record_send_success(Utc::now());
        }
        outcome
    }
}

/// Shared state of the dispatch path.
pub struct Pipeline {
    codec: Arc<PayloadCodec>,
    transmitter: Arc<Transmitter>,
    queue: Arc<FailureQueue>,
    aggregator: Arc<SampleAggregator>,
    status: Arc<StatusTracker>,
    reporter: Arc<ErrorReporter>,
    cadence: Cadence,
}

impl Pipeline {
    pub fn new(
        transmitter: Arc<Transmitter>,
        queue: Arc<FailureQueue>,
        status: Arc<StatusTracker>,
        reporter: Arc<ErrorReporter>,
        cadence: Cadence,
    ) -> Self {
        Self {
            codec: Arc::clone(transmitter.codec()),
            transmitter,
            queue,
            aggregator: Arc::new(SampleAggregator::new(Utc::now())),
            status,
            reporter,
            cadence,
        }
    }

    pub fn aggregator(&self) -> &Arc<SampleAggregator> {
        &self.aggregator
    }

    pub fn queue(&self) -> &Arc<FailureQueue> {
        &self.queue
    }

    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    fn spawn_report(&self, tag: ReportTag, message: String) {
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            reporter.report(tag, &message).await;
        });
    }

    /// Flush the window ending at `boundary` and dispatch it.
    pub async fn dispatch_window(&self, boundary: DateTime<Utc>) -> CycleResult {
        let averaged = self.aggregator.flush(boundary);
        self.dispatch_set(&averaged, boundary).await
    }

    /// Build, validate and send one averaged set stamped `boundary`.
    pub async fn dispatch_set(&self, averaged: &AveragedSet, boundary: DateTime<Utc>) -> CycleResult {
        let tz = self.codec.timezone();
        let envelope = match self.codec.build(averaged, boundary) {
            Ok(envelope) => envelope,
            Err(CodecError::EmptyEnvelope) => {
                log::info!("no readings for window ending {}, nothing to send", boundary.with_timezone(&tz));
                return CycleResult::Skipped;
            }
            Err(e) => {
                self.spawn_report(ReportTag::DataError, format!("could not build envelope: {e}"));
                return CycleResult::Invalid(e.to_string());
            }
        };

        if let Err(e) = validate_timestamp(envelope.timestamp_ms, Utc::now(), self.cadence.minutes(), &tz) {
            self.spawn_report(
                ReportTag::DataError,
                format!("refusing to send envelope stamped {}: {e}", envelope.timestamp_ms),
            );
            return CycleResult::Invalid(e.to_string());
        }

        log::info!(
            "[{}] sending {} parameter(s) for {}",
            envelope.device_id,
            envelope.params.len(),
            boundary.with_timezone(&tz)
        );
        let delivery = self.transmitter.send_with_retry(&envelope).await;

        match delivery.outcome {
            Outcome::Success => {
                self.status.record_send_success(Utc::now());
                log::info!("[{}] delivered window {}", envelope.device_id, envelope.timestamp_ms);
                let transport = TrackedDelivery {
                    transmitter: Arc::clone(&self.transmitter),
                    status: Arc::clone(&self.status),
                };
                if self.queue.spawn_drain(Arc::new(transport)) {
                    log::info!("failure queue: drain started ({} item(s))", self.queue.len());
                }
                CycleResult::Delivered {
                    parameters: envelope.params.len(),
                }
            }
            outcome @ Outcome::DataError { .. } => {
                self.status.record_send_failure(outcome.to_string());
                self.spawn_report(
                    ReportTag::DataError,
                    format!("receiver rejected window {}: {outcome}", envelope.timestamp_ms),
                );
                CycleResult::Rejected(outcome)
            }
            outcome => {
                self.status.record_send_failure(outcome.to_string());
                self.spawn_report(
                    ReportTag::SendFailed,
                    format!(
                        "window {} failed after {} attempt(s): {outcome}",
                        envelope.timestamp_ms, delivery.attempts
                    ),
                );
                let item = QueueItem::new(envelope, delivery.attempts, Some(outcome.to_string()));
                if let EnqueueOutcome::Evicted(old) = self.queue.enqueue(item) {
                    self.spawn_report(
                        ReportTag::QueueOverflow,
                        format!(
                            "failure queue full ({}), dropped window {}",
                            self.queue.capacity(),
                            old.captured_at_ms
                        ),
                    );
                }
                CycleResult::Queued(outcome)
            }
        }
    }

    /// Wait for each aligned boundary and dispatch its window.
    pub async fn run_dispatch(&self, mut scheduler: AlignmentScheduler, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "dispatch loop started (cadence {}, timezone {})",
            scheduler.cadence(),
            scheduler.timezone()
        );
        loop {
            let boundary = scheduler.next_dispatch(Utc::now());
            log::debug!("next dispatch at {}", boundary.with_timezone(&scheduler.timezone()));
            if wait_until(boundary, &mut shutdown).await == WaitOutcome::Cancelled {
                break;
            }
            let result = self.dispatch_window(boundary).await;
            log::info!("window {}: {result}", boundary.with_timezone(&scheduler.timezone()));
        }
        log::info!("dispatch loop stopped");
    }
}

/// Poll one source until shutdown, feeding readings into the aggregator.
pub async fn run_source(
    source: Arc<dyn SensorSource>,
    aggregator: Arc<SampleAggregator>,
    status: Arc<StatusTracker>,
    reporter: Arc<ErrorReporter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = source.name().to_string();
    let interval = source.info().poll_interval;
    log::info!("source {name} started ({}, every {}s)", source.info().protocol, interval.as_secs());

    loop {
        let started = Instant::now();
        let polled = {
            let source = Arc::clone(&source);
            tokio::task::spawn_blocking(move || source.poll()).await
        };
        let elapsed = started.elapsed();

        match polled {
            Ok(Ok(readings)) => {
                let accepted = aggregator.add_readings(readings);
                status.record_fetch(&name, accepted, elapsed, Utc::now());
                log::debug!("source {name}: {accepted} reading(s) in {elapsed:?}");
            }
            Ok(Err(e)) => {
                let consecutive = status.record_fetch_failure(&name, &e, elapsed);
                log::warn!("source {name}: {e}");
                if consecutive == 1 {
                    let reporter = Arc::clone(&reporter);
                    let message = e.to_string();
                    tokio::spawn(async move {
                        reporter.report(ReportTag::FetchError, &message).await;
                    });
                }
            }
            Err(e) => log::error!("source {name}: poll task failed: {e}"),
        }

        if sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
    log::info!("source {name} stopped");
}

pub struct Orchestrator {
    config: Config,
    pipeline: Arc<Pipeline>,
    sources: Vec<Arc<dyn SensorSource>>,
    /// Feeds the transmitter's backoff waits; raised by `run` on shutdown.
    stop_retries: watch::Sender<bool>,
}

impl Orchestrator {
    /// Build every component from a validated config.
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let codec = Arc::new(config.codec()?);
        let (stop_retries, retry_shutdown) = watch::channel(false);
        let transmitter = Arc::new(
            Transmitter::new(
                config.endpoint.clone(),
                codec,
                config.retry_policy(),
                config.request_timeout(),
            )
            .with_shutdown(retry_shutdown),
        );
        let queue = Arc::new(FailureQueue::open(config.queue_file.clone(), config.queue_capacity));
        let status = Arc::new(StatusTracker::new());
        let reporter = Arc::new(ErrorReporter::new(
            config.reporter_settings(),
            config.device_id.clone(),
            config.station_id.clone(),
            Arc::clone(&status),
        ));
        let pipeline = Arc::new(Pipeline::new(transmitter, queue, status, reporter, config.cadence));
        let sources = build_sources(&config.sources);
        Ok(Self {
            config,
            pipeline,
            sources,
            stop_retries,
        })
    }

    /// Replace the configured sources.
    pub fn with_sources(mut self, sources: Vec<Arc<dyn SensorSource>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Run every loop until `shutdown` flips to `true`.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ConfigError> {
        let tz = self.config.timezone()?;
        let pipeline = self.pipeline;
        if self.sources.is_empty() {
            log::warn!("no sensor sources configured; windows will be empty");
        }

        let mut tasks = JoinSet::new();
        {
            let mut rx = shutdown.clone();
            let stop_retries = self.stop_retries;
            tasks.spawn(async move {
                if rx.wait_for(|stop| *stop).await.is_ok() {
                    stop_retries.send_replace(true);
                }
            });
        }

        for source in self.sources {
            tasks.spawn(run_source(
                source,
                Arc::clone(pipeline.aggregator()),
                Arc::clone(pipeline.status()),
                Arc::clone(&pipeline.reporter),
                shutdown.clone(),
            ));
        }

        {
            let pipeline = Arc::clone(&pipeline);
            let scheduler = AlignmentScheduler::new(self.config.cadence, tz);
            let rx = shutdown.clone();
            tasks.spawn(async move { pipeline.run_dispatch(scheduler, rx).await });
        }

        if self.config.heartbeat.enabled {
            let reporter = Arc::clone(&pipeline.reporter);
            let initial = Duration::from_secs(self.config.heartbeat.initial_delay_minutes * 60);
            let interval = Duration::from_secs(self.config.heartbeat.interval_minutes.max(1) * 60);
            let rx = shutdown.clone();
            tasks.spawn(async move { reporter.run_heartbeat(initial, interval, rx).await });
        }

        if self.config.monitor.enabled {
            let monitor = ConnectivityMonitor::new(
                self.config.monitor_policy(),
                HttpProbe::new(
                    self.config.monitor.probe_endpoints.clone(),
                    Duration::from_secs(self.config.monitor.probe_timeout_secs.max(1)),
                ),
                CommandRemediator::new(&self.config.monitor.restart_command),
                Arc::clone(&pipeline.reporter),
            );
            let rx = shutdown.clone();
            tasks.spawn(async move { monitor.run(rx).await });
        }

        log::info!(
            "cemslink running: device {} station {} -> {}",
            self.config.device_id,
            self.config.station_id,
            self.config.endpoint
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("background task ended abnormally: {e}");
            }
        }

        if let Err(e) = pipeline.queue().persist() {
            log::error!("could not save failure queue on shutdown: {e}");
        }
        log::info!("cemslink stopped");
        Ok(())
    }
}
