//! Bench receiver for cemslink envelopes.
//!
//! Plays the part of the regulator's receiving validator: decrypts each
//! POSTed body with the shared secret, checks headers, shape, station/device
//! mapping and timestamp rules, and answers `{"status": <code>, "msg": ...}`.
//! Status `1` means accepted. Failures can be simulated for testing the
//! sender's retry and queue paths.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};

use cemslink_core::codec::{
    DispatchEnvelope, PARAM_FLAG, SIGNATURE_SEPARATOR, decrypt_text, open_signature,
    validate_timestamp,
};
use cemslink_core::error::{CodecError, TimestampError};
use cemslink_core::transmit::{DEVICE_ID_HEADER, SIGNATURE_HEADER};

/// Path the sender posts to.
pub const DATA_PATH: &str = "/v1.0/industry/data";

/// Accepted envelopes kept for `GET /received`.
const RECEIVED_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Application status codes
// ---------------------------------------------------------------------------

pub const STATUS_SUCCESS: i64 = 1;
pub const STATUS_MISSING_DEVICE_HEADER: i64 = 10;
pub const STATUS_MISSING_SIGNATURE: i64 = 11;
pub const STATUS_UNKNOWN_DEVICE: i64 = 12;
pub const STATUS_DECRYPT_FAILED: i64 = 20;
pub const STATUS_SIGNATURE_INVALID: i64 = 21;
pub const STATUS_MISALIGNED: i64 = 30;
pub const STATUS_BACKDATED: i64 = 31;
pub const STATUS_FUTURE: i64 = 32;
pub const STATUS_INVALID_STRUCTURE: i64 = 40;
pub const STATUS_MULTIPLE_STATIONS: i64 = 41;
pub const STATUS_MAPPING_FAILED: i64 = 50;

/// Range reserved for simulated business errors.
pub const SIMULATED_STATUS_RANGE: std::ops::RangeInclusive<i64> = 90..=99;

/// Validation settings.
#[derive(Clone)]
pub struct ReceiverConfig {
    pub secret: String,
    /// When set, the `signature` header is opened and its prefix checked.
    pub private_key: Option<RsaPrivateKey>,
    pub expected_station: Option<String>,
    pub expected_device: Option<String>,
    /// Alignment required of envelope timestamps.
    pub granularity_minutes: u32,
    pub timezone: Tz,
}

impl ReceiverConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            private_key: None,
            expected_station: None,
            expected_device: None,
            granularity_minutes: 1,
            timezone: chrono_tz::Asia::Kolkata,
        }
    }
}

impl std::fmt::Debug for ReceiverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverConfig")
            .field("verify_signature", &self.private_key.is_some())
            .field("expected_station", &self.expected_station)
            .field("expected_device", &self.expected_device)
            .field("granularity_minutes", &self.granularity_minutes)
            .field("timezone", &self.timezone)
            .finish_non_exhaustive()
    }
}

/// Body of every data response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: i64,
    pub msg: String,
}

impl Verdict {
    pub fn success() -> Self {
        Self::reject(STATUS_SUCCESS, "success")
    }

    pub fn reject(status: i64, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// An accepted envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedEnvelope {
    pub received_at: DateTime<Utc>,
    pub envelope: DispatchEnvelope,
}

/// Failure injection, set through [`Receiver`] or `POST /simulate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    /// Answer the next `http_count` requests with this HTTP status.
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub http_count: u32,
    /// Answer every valid envelope with this application status.
    #[serde(default)]
    pub app_status: Option<i64>,
}

#[derive(Default)]
struct Counters {
    requests: u64,
    accepted: u64,
    rejected: u64,
}

struct AppState {
    config: ReceiverConfig,
    received: Mutex<Vec<ReceivedEnvelope>>,
    simulation: Mutex<Simulation>,
    counters: Mutex<Counters>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    requests: u64,
    accepted: u64,
    rejected: u64,
    verify_signature: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn timestamp_status(err: TimestampError) -> i64 {
    match err {
        TimestampError::Misaligned(_) => STATUS_MISALIGNED,
        TimestampError::Backdated => STATUS_BACKDATED,
        TimestampError::Future => STATUS_FUTURE,
    }
}

fn check_params(envelope: &DispatchEnvelope) -> Result<(), String> {
    for param in &envelope.params {
        if param.parameter.trim().is_empty() {
            return Err("parameter name is empty".into());
        }
        if !param.value.is_finite() {
            return Err(format!("{}: value is not a number", param.parameter));
        }
        if param.timestamp != envelope.timestamp_ms {
            return Err(format!("{}: timestamp differs from envelope", param.parameter));
        }
        if param.flag != PARAM_FLAG {
            return Err(format!("{}: unknown flag '{}'", param.parameter, param.flag));
        }
    }
    Ok(())
}

/// Validate one request against `config`; `Ok` carries the envelope.
pub fn validate_request(
    config: &ReceiverConfig,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> Result<DispatchEnvelope, Verdict> {
    let Some(device_header) = header(headers, DEVICE_ID_HEADER) else {
        return Err(Verdict::reject(
            STATUS_MISSING_DEVICE_HEADER,
            format!("missing {DEVICE_ID_HEADER} header"),
        ));
    };
    let Some(signature) = header(headers, SIGNATURE_HEADER) else {
        return Err(Verdict::reject(
            STATUS_MISSING_SIGNATURE,
            format!("missing {SIGNATURE_HEADER} header"),
        ));
    };
    if let Some(expected) = &config.expected_device {
        if expected != device_header {
            return Err(Verdict::reject(
                STATUS_UNKNOWN_DEVICE,
                format!("no key registered for device {device_header}"),
            ));
        }
    }

    let plaintext = decrypt_text(body, &config.secret)
        .map_err(|e| Verdict::reject(STATUS_DECRYPT_FAILED, format!("decryption failed: {e}")))?;

    if let Some(private_key) = &config.private_key {
        let expected_prefix = format!("{}{SIGNATURE_SEPARATOR}", config.secret);
        match open_signature(signature, private_key) {
            Ok(message) if message.starts_with(&expected_prefix) => {}
            Ok(_) => {
                return Err(Verdict::reject(
                    STATUS_SIGNATURE_INVALID,
                    "signature does not match device secret",
                ));
            }
            Err(e) => {
                return Err(Verdict::reject(
                    STATUS_SIGNATURE_INVALID,
                    format!("signature could not be opened: {e}"),
                ));
            }
        }
    }

    let envelope = match DispatchEnvelope::from_canonical_json(&plaintext) {
        Ok(envelope) => envelope,
        Err(CodecError::StationCount(n)) if n > 1 => {
            return Err(Verdict::reject(
                STATUS_MULTIPLE_STATIONS,
                format!("{n} stations in one request"),
            ));
        }
        Err(e) => return Err(Verdict::reject(STATUS_INVALID_STRUCTURE, e.to_string())),
    };
    check_params(&envelope).map_err(|msg| Verdict::reject(STATUS_INVALID_STRUCTURE, msg))?;

    if envelope.device_id != device_header {
        return Err(Verdict::reject(
            STATUS_MAPPING_FAILED,
            format!(
                "device {} does not match header {device_header}",
                envelope.device_id
            ),
        ));
    }
    if let Some(expected) = &config.expected_station {
        if expected != &envelope.station_id {
            return Err(Verdict::reject(
                STATUS_MAPPING_FAILED,
                format!(
                    "device {} is not mapped to station {}",
                    envelope.device_id, envelope.station_id
                ),
            ));
        }
    }

    validate_timestamp(
        envelope.timestamp_ms,
        now,
        config.granularity_minutes,
        &config.timezone,
    )
    .map_err(|e| Verdict::reject(timestamp_status(e), e.to_string()))?;

    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_data(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    lock(&state.counters).requests += 1;

    let forced = {
        let mut sim = lock(&state.simulation);
        match sim.http_status {
            Some(code) if sim.http_count > 0 => {
                sim.http_count -= 1;
                if sim.http_count == 0 {
                    sim.http_status = None;
                }
                Some(code)
            }
            _ => None,
        }
    };
    if let Some(code) = forced {
        log::info!("simulating HTTP {code}");
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return (status, "simulated failure").into_response();
    }

    let verdict = match validate_request(&state.config, &headers, &body, Utc::now()) {
        Ok(envelope) => {
            let forced_app = lock(&state.simulation).app_status;
            match forced_app {
                Some(code) => Verdict::reject(code, "simulated business error"),
                None => {
                    log::info!(
                        "accepted {} parameter(s) from {}/{} at {}",
                        envelope.params.len(),
                        envelope.station_id,
                        envelope.device_id,
                        envelope.timestamp_ms
                    );
                    let mut received = lock(&state.received);
                    if received.len() >= RECEIVED_LIMIT {
                        received.remove(0);
                    }
                    received.push(ReceivedEnvelope {
                        received_at: Utc::now(),
                        envelope,
                    });
                    Verdict::success()
                }
            }
        }
        Err(verdict) => verdict,
    };

    let mut counters = lock(&state.counters);
    if verdict.is_success() {
        counters.accepted += 1;
    } else {
        counters.rejected += 1;
        log::warn!("rejected: status {} ({})", verdict.status, verdict.msg);
    }
    drop(counters);

    (StatusCode::OK, Json(verdict)).into_response()
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let counters = lock(&state.counters);
    Json(HealthResponse {
        status: "ok",
        version: cemslink_core::VERSION,
        requests: counters.requests,
        accepted: counters.accepted,
        rejected: counters.rejected,
        verify_signature: state.config.private_key.is_some(),
    })
}

async fn handle_received(State(state): State<Arc<AppState>>) -> Json<Vec<ReceivedEnvelope>> {
    Json(lock(&state.received).clone())
}

async fn handle_get_simulation(State(state): State<Arc<AppState>>) -> Json<Simulation> {
    Json(lock(&state.simulation).clone())
}

async fn handle_set_simulation(
    State(state): State<Arc<AppState>>,
    Json(mut sim): Json<Simulation>,
) -> Json<Simulation> {
    if sim.http_status.is_some() && sim.http_count == 0 {
        sim.http_count = 1;
    }
    log::info!("simulation set: {sim:?}");
    *lock(&state.simulation) = sim.clone();
    Json(sim)
}

async fn handle_clear_simulation(State(state): State<Arc<AppState>>) -> StatusCode {
    *lock(&state.simulation) = Simulation::default();
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Shared handle to a receiver's state; clones observe the same server.
#[derive(Clone)]
pub struct Receiver {
    state: Arc<AppState>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            state: Arc::new(AppState {
                config,
                received: Mutex::new(Vec::new()),
                simulation: Mutex::new(Simulation::default()),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route(DATA_PATH, post(handle_data))
            .route("/health", get(handle_health))
            .route("/received", get(handle_received))
            .route(
                "/simulate",
                get(handle_get_simulation)
                    .post(handle_set_simulation)
                    .delete(handle_clear_simulation),
            )
            .with_state(Arc::clone(&self.state))
    }

    /// Accepted envelopes, oldest first.
    pub fn received(&self) -> Vec<ReceivedEnvelope> {
        lock(&self.state.received).clone()
    }

    /// Answer the next `count` data requests with HTTP `status`.
    pub fn fail_next(&self, status: u16, count: u32) {
        let mut sim = lock(&self.state.simulation);
        sim.http_status = (count > 0).then_some(status);
        sim.http_count = count;
    }

    /// Answer valid envelopes with application status `code` until cleared.
    pub fn force_status(&self, code: Option<i64>) {
        lock(&self.state.simulation).app_status = code;
    }
}

/// Run the receiver until the process exits.
pub async fn run_server(config: ReceiverConfig, host: &str, port: u16) -> std::io::Result<()> {
    let receiver = Receiver::new(config);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("receiver listening on http://{addr}{DATA_PATH}");
    axum::serve(listener, receiver.router()).await
}
