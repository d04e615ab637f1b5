//! Best-effort error reporting and heartbeat.
//!
//! Reports are a single JSON POST with a 10 s timeout. A failed report is
//! logged and forgotten; nothing in the pipeline waits on or retries it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use reqwest::header::COOKIE;
use serde::Serialize;
use tokio::sync::watch;

use crate::schedule::sleep_or_shutdown;
use crate::status::StatusTracker;

pub const DEFAULT_IP_LOOKUP_URL: &str = "https://api.ipify.org?format=text";
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);
const IP_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Category of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportTag {
    SendFailed,
    DataError,
    FetchError,
    QueueOverflow,
    InternetTimeoutRestart,
    Heartbeat,
}

impl std::fmt::Display for ReportTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SendFailed => "SEND_FAILED",
            Self::DataError => "DATA_ERROR",
            Self::FetchError => "FETCH_ERROR",
            Self::QueueOverflow => "QUEUE_OVERFLOW",
            Self::InternetTimeoutRestart => "INTERNET_TIMEOUT_RESTART",
            Self::Heartbeat => "HEARTBEAT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportContext {
    pub device_id: String,
    pub station_id: String,
    pub public_ip: String,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_send: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Report {
    pub tag: String,
    pub message: String,
    pub context: ReportContext,
}

/// Where reports go and how to reach it.
#[derive(Debug, Clone, Default)]
pub struct ReporterSettings {
    /// `None` disables delivery; reports are only logged.
    pub endpoint: Option<String>,
    /// Value for a `ci_session` cookie, if the endpoint wants one.
    pub session_cookie: Option<String>,
    pub ip_lookup_url: Option<String>,
}

pub struct ErrorReporter {
    client: HttpClient,
    settings: ReporterSettings,
    device_id: String,
    station_id: String,
    status: Arc<StatusTracker>,
}

impl ErrorReporter {
    pub fn new(
        settings: ReporterSettings,
        device_id: impl Into<String>,
        station_id: impl Into<String>,
        status: Arc<StatusTracker>,
    ) -> Self {
        let client = HttpClient::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            settings,
            device_id: device_id.into(),
            station_id: station_id.into(),
            status,
        }
    }

    /// A reporter that only logs.
    pub fn log_only(status: Arc<StatusTracker>) -> Self {
        Self::new(ReporterSettings::default(), "", "", status)
    }

    /// Public address of this device, or `"Unknown"`.
    pub async fn public_ip(&self) -> String {
        let Some(url) = self.settings.ip_lookup_url.as_deref() else {
            return "Unknown".to_string();
        };
        let result = self
            .client
            .get(url)
            .timeout(IP_LOOKUP_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                _ => "Unknown".to_string(),
            },
            Ok(resp) => {
                log::warn!("public IP lookup returned HTTP {}", resp.status());
                "Unknown".to_string()
            }
            Err(e) => {
                log::warn!("public IP lookup failed: {e}");
                "Unknown".to_string()
            }
        }
    }

    pub async fn build_report(&self, tag: ReportTag, message: &str) -> Report {
        Report {
            tag: tag.to_string(),
            message: message.to_string(),
            context: ReportContext {
                device_id: self.device_id.clone(),
                station_id: self.station_id.clone(),
                public_ip: self.public_ip().await,
                last_fetch: self.status.last_fetch(),
                last_send: self.status.last_send(),
            },
        }
    }

    /// Log and (if configured) POST a report. Returns `true` if the endpoint
    /// accepted it.
    pub async fn report(&self, tag: ReportTag, message: &str) -> bool {
        if tag == ReportTag::Heartbeat {
            log::info!("{tag}: {message}");
        } else {
            log::error!("{tag}: {message}");
        }

        let Some(endpoint) = self.settings.endpoint.as_deref() else {
            return false;
        };
        let report = self.build_report(tag, message).await;

        let mut request = self.client.post(endpoint).json(&report);
        if let Some(cookie) = self.settings.session_cookie.as_deref() {
            if !cookie.is_empty() {
                request = request.header(COOKIE, format!("ci_session={cookie}"));
            }
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                log::warn!("error endpoint returned HTTP {} for {tag}", resp.status());
                false
            }
            Err(e) => {
                log::warn!("failed to deliver {tag} report: {e}");
                false
            }
        }
    }

    /// Send a heartbeat after `initial_delay`, then every `interval`.
    pub async fn run_heartbeat(
        &self,
        initial_delay: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("heartbeat loop started (every {}s)", interval.as_secs());
        let mut wait = initial_delay;
        while !sleep_or_shutdown(wait, &mut shutdown).await {
            let ip = self.public_ip().await;
            self.report(
                ReportTag::Heartbeat,
                &format!("Heartbeat - System Running - IP: {ip}"),
            )
            .await;
            wait = interval;
        }
        log::info!("heartbeat loop stopped");
    }
}
