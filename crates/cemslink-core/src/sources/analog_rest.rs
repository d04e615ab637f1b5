//! Poller for the analog acquisition service.
//!
//! The service exposes `GET /api/channels`:
//!
//! ```json
//! {"timestamp": "...", "device_connected": true,
//!  "channels": {"0": {"id": 0, "name": "PM10", "enabled": true,
//!                     "value": 41.27, "unit": "mg/Nm3", "raw_ma": 8.1}}}
//! ```
//!
//! Configured channel mappings pick channels by id (or name) and rename
//! them to reported parameters. Disabled channels and null values are
//! skipped.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use crate::config::{AnalogRestConfig, ChannelMapping};
use crate::error::SourceError;
use crate::source::{Reading, SensorSource, SourceInfo, SourceProtocol};

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    channels: HashMap<String, ChannelData>,
    #[serde(default = "connected_by_default")]
    device_connected: bool,
}

fn connected_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ChannelData {
    #[serde(default)]
    name: String,
    #[serde(default = "connected_by_default")]
    enabled: bool,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    unit: String,
}

pub struct AnalogRestSource {
    info: SourceInfo,
    url: String,
    client: HttpClient,
    channels: Vec<ChannelMapping>,
}

impl AnalogRestSource {
    pub fn from_config(config: &AnalogRestConfig) -> Self {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            info: SourceInfo {
                name: config.name.clone(),
                description: format!("Analog acquisition service at {}", config.url),
                protocol: SourceProtocol::Rest,
                poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            },
            url: config.url.clone(),
            client,
            channels: config.channels.clone(),
        }
    }

    async fn fetch(&self) -> Result<ChannelsResponse, SourceError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::Request {
                source_name: self.info.name.clone(),
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(SourceError::Response {
                source_name: self.info.name.clone(),
                message: format!("HTTP {}", resp.status()),
            });
        }
        resp.json::<ChannelsResponse>()
            .await
            .map_err(|e| SourceError::Response {
                source_name: self.info.name.clone(),
                message: e.to_string(),
            })
    }

    fn map_readings(&self, response: ChannelsResponse) -> Result<Vec<Reading>, SourceError> {
        if !response.device_connected {
            return Err(SourceError::Disconnected(self.info.name.clone()));
        }
        let now = Utc::now();
        let mut readings = Vec::with_capacity(self.channels.len());
        for mapping in &self.channels {
            let found = response.channels.get(&mapping.channel).or_else(|| {
                response
                    .channels
                    .values()
                    .find(|c| c.name.eq_ignore_ascii_case(&mapping.channel))
            });
            let Some(channel) = found else {
                log::debug!("{}: channel {} not reported", self.info.name, mapping.channel);
                continue;
            };
            if !channel.enabled {
                continue;
            }
            let Some(value) = channel.value.filter(|v| v.is_finite()) else {
                continue;
            };
            let unit = mapping.unit.clone().unwrap_or_else(|| channel.unit.clone());
            readings.push(Reading::new(mapping.parameter.clone(), value, unit, now));
        }
        Ok(readings)
    }
}

impl SensorSource for AnalogRestSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Blocking; must run on a runtime's blocking pool (e.g. `spawn_blocking`).
    fn poll(&self) -> Result<Vec<Reading>, SourceError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| SourceError::Request {
            source_name: self.info.name.clone(),
            message: format!("no async runtime: {e}"),
        })?;
        let response = handle.block_on(self.fetch())?;
        self.map_readings(response)
    }
}
