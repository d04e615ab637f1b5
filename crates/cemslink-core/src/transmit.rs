//! HTTP delivery of sealed envelopes and outcome classification.
//!
//! | response                              | outcome        | retried | queued |
//! |---------------------------------------|----------------|---------|--------|
//! | 2xx, body `msg=success`, status 0/1   | `Success`      | –       | –      |
//! | 2xx, any other body                   | `DataError`    | no      | no     |
//! | 4xx                                   | `ClientError`  | no      | yes    |
//! | 5xx / other status                    | `ServerError`  | yes     | yes    |
//! | timeout, refused, DNS, broken body    | `NetworkError` | yes     | yes    |
//!
//! Every attempt re-seals the envelope so the signature carries that
//! attempt's wall-clock time; the envelope itself never changes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::watch;

use crate::codec::{DispatchEnvelope, EncryptedPayload, PayloadCodec};
use crate::schedule::sleep_or_shutdown;

/// Header carrying the device identifier.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
/// Header carrying the base64 RSA signature.
pub const SIGNATURE_HEADER: &str = "signature";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Classified result of one send (or of a whole retry sequence).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The receiver understood the request and rejected its content.
    DataError { code: Option<i64>, message: String },
    ClientError(u16),
    ServerError(u16),
    NetworkError(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError(_) | Self::NetworkError(_))
    }

    /// Belongs in the failure queue once retries are exhausted.
    pub fn should_enqueue(&self) -> bool {
        matches!(
            self,
            Self::ClientError(_) | Self::ServerError(_) | Self::NetworkError(_)
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::DataError {
                code: Some(code),
                message,
            } => write!(f, "data error {code}: {message}"),
            Self::DataError {
                code: None,
                message,
            } => write!(f, "data error: {message}"),
            Self::ClientError(status) => write!(f, "client error (HTTP {status})"),
            Self::ServerError(status) => write!(f, "server error (HTTP {status})"),
            Self::NetworkError(msg) => write!(f, "network error: {msg}"),
        }
    }
}

fn status_code(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Classify an HTTP response.
pub fn classify(status: u16, body: &str) -> Outcome {
    match status {
        200..=299 => {
            let Ok(json) = serde_json::from_str::<serde_json::Value>(body.trim()) else {
                return Outcome::DataError {
                    code: None,
                    message: format!("unparsable response body: {}", truncate(body, 200)),
                };
            };
            let message = json
                .get("msg")
                .or_else(|| json.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            let code = json.get("status").and_then(status_code);
            let ok = message.eq_ignore_ascii_case("success") && matches!(code, Some(0 | 1));
            if ok {
                Outcome::Success
            } else {
                Outcome::DataError { code, message }
            }
        }
        400..=499 => Outcome::ClientError(status),
        _ => Outcome::ServerError(status),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Backoff delays between attempts; one retry per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    /// Initial attempt plus retries.
    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }

    /// Call `attempt` until it succeeds, fails for good, or the backoff list
    /// runs out. A shutdown signal ends the sequence at the next wait.
    pub async fn run<F, Fut>(
        &self,
        label: &str,
        shutdown: Option<&watch::Receiver<bool>>,
        mut attempt: F,
    ) -> Delivery
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let outcome = attempt().await;
            let retries_used = attempts as usize - 1;

            if !outcome.is_retryable() || retries_used >= self.backoff.len() {
                if !outcome.is_success() {
                    log::warn!("[{label}] giving up after {attempts} attempt(s): {outcome}");
                }
                return Delivery { outcome, attempts };
            }

            let delay = self.backoff[retries_used];
            log::warn!(
                "[{label}] attempt {attempts}/{} failed: {outcome}; retrying in {delay:?}",
                self.max_attempts()
            );

            let stopped = match shutdown {
                Some(rx) => sleep_or_shutdown(delay, &mut rx.clone()).await,
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            if stopped {
                return Delivery { outcome, attempts };
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ])
    }
}

/// Final outcome of a retry sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub outcome: Outcome,
    pub attempts: u32,
}

/// One delivery attempt for an envelope.
///
/// The failure queue drains through this seam, so tests can substitute a
/// scripted transport.
pub trait Deliver: Send + Sync {
    fn deliver(&self, envelope: &DispatchEnvelope) -> impl Future<Output = Outcome> + Send;
}

/// Sends sealed envelopes to the reporting endpoint.
pub struct Transmitter {
    client: HttpClient,
    endpoint: String,
    codec: Arc<PayloadCodec>,
    policy: RetryPolicy,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Transmitter {
    pub fn new(
        endpoint: impl Into<String>,
        codec: Arc<PayloadCodec>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            codec,
            policy,
            shutdown: None,
        }
    }

    /// Cut backoff waits short when shutdown is signalled.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn codec(&self) -> &Arc<PayloadCodec> {
        &self.codec
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// POST an already sealed payload.
    pub async fn post(&self, payload: &EncryptedPayload) -> Outcome {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "text/plain")
            .header(DEVICE_ID_HEADER, payload.device_id())
            .header(SIGNATURE_HEADER, payload.signature())
            .body(payload.body().to_string())
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = match resp.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        return Outcome::NetworkError(format!(
                            "HTTP {status}, response body unreadable: {e}"
                        ));
                    }
                };
                log::debug!("POST {} -> {status}: {}", self.endpoint, truncate(&body, 200));
                classify(status, &body)
            }
            Err(e) => Outcome::NetworkError(e.to_string()),
        }
    }

    /// Seal with a fresh signature and send once.
    pub async fn send_once(&self, envelope: &DispatchEnvelope) -> Outcome {
        match self.codec.seal(envelope, Utc::now()) {
            Ok(payload) => self.post(&payload).await,
            Err(e) => Outcome::DataError {
                code: None,
                message: format!("could not seal envelope: {e}"),
            },
        }
    }

    /// Send with the retry policy; 5xx and network failures are retried.
    pub async fn send_with_retry(&self, envelope: &DispatchEnvelope) -> Delivery {
        self.policy
            .run(&envelope.device_id, self.shutdown.as_ref(), move || self.send_once(envelope))
            .await
    }
}

impl Deliver for Transmitter {
    async fn deliver(&self, envelope: &DispatchEnvelope) -> Outcome {
        self.send_once(envelope).await
    }
}
