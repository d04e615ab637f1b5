//! Runtime configuration.
//!
//! Loaded once at startup from a JSON file, then overlaid with environment
//! variables (a `.env` file in the working directory is honoured). Nothing
//! re-reads configuration while the process runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::codec::{PayloadCodec, parse_public_key};
use crate::error::ConfigError;
use crate::monitor::{DEFAULT_PROBE_ENDPOINTS, MonitorPolicy};
use crate::queue::DEFAULT_CAPACITY;
use crate::report::{DEFAULT_IP_LOOKUP_URL, ReporterSettings};
use crate::schedule::Cadence;
use crate::transmit::RetryPolicy;

pub const DEFAULT_ENDPOINT: &str = "https://cems.cpcb.gov.in/v1.0/industry/data";
pub const DEFAULT_TIMEZONE: &str = "Asia/Kolkata";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Connectivity monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the monitor loop at all.
    pub enabled: bool,
    pub check_interval_minutes: u64,
    pub internet_timeout_minutes: u64,
    pub auto_restart_enabled: bool,
    pub restart_cooldown_minutes: u64,
    pub restart_command: Vec<String>,
    pub probe_endpoints: Vec<String>,
    pub probe_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_minutes: 5,
            internet_timeout_minutes: 30,
            auto_restart_enabled: true,
            restart_cooldown_minutes: 30,
            restart_command: vec!["sudo".into(), "reboot".into()],
            probe_endpoints: DEFAULT_PROBE_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            probe_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub initial_delay_minutes: u64,
    pub interval_minutes: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_minutes: 30,
            interval_minutes: 30,
        }
    }
}

/// Maps one analog channel to a reported parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub channel: String,
    pub parameter: String,
    /// Overrides the unit reported by the acquisition service.
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogRestConfig {
    #[serde(default = "default_analog_name")]
    pub name: String,
    pub url: String,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    pub channels: Vec<ChannelMapping>,
}

fn default_analog_name() -> String {
    "analog".to_string()
}

fn default_poll_secs() -> u64 {
    10
}

fn default_source_timeout_secs() -> u64 {
    5
}

/// A fixed value, for bench runs without hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticValue {
    pub parameter: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSourceConfig {
    #[serde(default = "default_static_name")]
    pub name: String,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    pub values: Vec<StaticValue>,
}

fn default_static_name() -> String {
    "static".to_string()
}

/// One configured sensor source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    AnalogRest(AnalogRestConfig),
    Static(StaticSourceConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    pub station_id: String,
    /// Shared secret issued with the device registration.
    pub token_id: String,
    /// Receiver public key, PEM.
    pub public_key: Option<String>,
    pub public_key_file: Option<PathBuf>,
    pub endpoint: String,
    pub timezone: String,
    pub cadence: Cadence,
    pub request_timeout_secs: u64,
    pub retry_backoff_secs: Vec<u64>,
    pub queue_capacity: usize,
    pub queue_file: PathBuf,
    pub error_endpoint_url: Option<String>,
    pub error_session_cookie: Option<String>,
    pub ip_lookup_url: Option<String>,
    pub heartbeat: HeartbeatConfig,
    pub monitor: MonitorConfig,
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            station_id: String::new(),
            token_id: String::new(),
            public_key: None,
            public_key_file: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            cadence: Cadence::Normal,
            request_timeout_secs: 20,
            retry_backoff_secs: vec![1, 2, 4],
            queue_capacity: DEFAULT_CAPACITY,
            queue_file: PathBuf::from("failed_queue.json"),
            error_endpoint_url: None,
            error_session_cookie: None,
            ip_lookup_url: Some(DEFAULT_IP_LOOKUP_URL.to_string()),
            heartbeat: HeartbeatConfig::default(),
            monitor: MonitorConfig::default(),
            sources: Vec::new(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: format!("'{raw}': {e}"),
    })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            reason: format!("'{raw}' is not a boolean"),
        }),
    }
}

impl Config {
    pub fn from_json_str(json: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Parse a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text, path)
    }

    /// File (if present) + `.env` + process environment, validated.
    pub fn load_layered(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load_overlay(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Same layering as [`Config::load_layered`] without validation, for
    /// tools that need only part of the configuration.
    pub fn load_overlay(path: &Path) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            log::debug!("loaded environment from {}", env_file.display());
        }
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            log::warn!(
                "config file {} not found, using defaults and environment",
                path.display()
            );
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TOKEN_ID") {
            self.token_id = v;
        }
        if let Some(v) = get("DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = get("STATION_ID") {
            self.station_id = v;
        }
        if let Some(v) = get("PUBLIC_KEY") {
            self.public_key = Some(v);
        }
        if let Some(v) = get("PUBLIC_KEY_FILE") {
            self.public_key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = get("ERROR_ENDPOINT_URL") {
            self.error_endpoint_url = Some(v);
        }
        if let Some(v) = get("ERROR_SESSION_COOKIE") {
            self.error_session_cookie = Some(v);
        }
        if let Some(v) = get("DIAGNOSTIC_CHECK_INTERVAL_MINUTES") {
            self.monitor.check_interval_minutes =
                parse_env("DIAGNOSTIC_CHECK_INTERVAL_MINUTES", &v)?;
        }
        if let Some(v) = get("DIAGNOSTIC_INTERNET_TIMEOUT_MINUTES") {
            self.monitor.internet_timeout_minutes =
                parse_env("DIAGNOSTIC_INTERNET_TIMEOUT_MINUTES", &v)?;
        }
        if let Some(v) = get("DIAGNOSTIC_AUTO_RESTART_ENABLED") {
            self.monitor.auto_restart_enabled = parse_bool("DIAGNOSTIC_AUTO_RESTART_ENABLED", &v)?;
        }
        if let Some(v) = get("DIAGNOSTIC_RESTART_COOLDOWN_MINUTES") {
            self.monitor.restart_cooldown_minutes =
                parse_env("DIAGNOSTIC_RESTART_COOLDOWN_MINUTES", &v)?;
        }
        Ok(())
    }

    /// Check everything needed to run the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Missing("device_id"));
        }
        if self.station_id.trim().is_empty() {
            return Err(ConfigError::Missing("station_id"));
        }
        if self.token_id.trim().is_empty() {
            return Err(ConfigError::Missing("token_id"));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "endpoint",
                reason: format!("'{}' is not an http(s) URL", self.endpoint),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.monitor.check_interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "monitor.check_interval_minutes",
                reason: "must be at least 1".into(),
            });
        }
        self.timezone()?;
        self.public_key()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    /// Receiver public key, from inline PEM or `public_key_file`.
    pub fn public_key(&self) -> Result<RsaPublicKey, ConfigError> {
        let pem = match (&self.public_key, &self.public_key_file) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?,
            (None, None) => return Err(ConfigError::Missing("public_key")),
        };
        parse_public_key(&pem).map_err(|e| ConfigError::Invalid {
            key: "public_key",
            reason: e.to_string(),
        })
    }

    pub fn codec(&self) -> Result<PayloadCodec, ConfigError> {
        Ok(PayloadCodec::new(
            self.device_id.clone(),
            self.station_id.clone(),
            self.token_id.clone(),
            self.public_key()?,
            self.timezone()?,
        ))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    pub fn monitor_policy(&self) -> MonitorPolicy {
        MonitorPolicy {
            interval: Duration::from_secs(self.monitor.check_interval_minutes * 60),
            timeout: Duration::from_secs(self.monitor.internet_timeout_minutes * 60),
            cooldown: Duration::from_secs(self.monitor.restart_cooldown_minutes * 60),
            auto_restart: self.monitor.auto_restart_enabled,
        }
    }

    pub fn reporter_settings(&self) -> ReporterSettings {
        ReporterSettings {
            endpoint: self.error_endpoint_url.clone(),
            session_cookie: self.error_session_cookie.clone(),
            ip_lookup_url: self.ip_lookup_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const PUBLIC_PEM: &str = include_str!("../tests/fixtures/receiver_public.pem");

    fn valid() -> Config {
        Config {
            device_id: "device_1".into(),
            station_id: "station_1".into(),
            token_id: "secret".into(),
            public_key: Some(PUBLIC_PEM.into()),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(c.timezone().unwrap(), chrono_tz::Asia::Kolkata);
        assert_eq!(c.cadence, Cadence::Normal);
        assert_eq!(c.queue_capacity, 100);
        assert_eq!(c.retry_policy(), RetryPolicy::default());
        assert_eq!(c.monitor_policy(), MonitorPolicy::default());
        assert_eq!(c.monitor.restart_command, vec!["sudo", "reboot"]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "device_id": "d", "station_id": "s", "token_id": "t",
            "cadence": "fast",
            "monitor": { "internet_timeout_minutes": 45 },
            "sources": [{
                "type": "analog_rest",
                "url": "http://127.0.0.1:5000/api/channels",
                "channels": [{ "channel": "ch0", "parameter": "pm10", "unit": "mg/Nm3" }]
            }]
        }"#;
        let c = Config::from_json_str(json, Path::new("inline")).unwrap();
        assert_eq!(c.cadence, Cadence::Fast);
        assert_eq!(c.monitor.internet_timeout_minutes, 45);
        assert_eq!(c.monitor.restart_cooldown_minutes, 30);
        assert_eq!(c.request_timeout_secs, 20);
        let SourceConfig::AnalogRest(analog) = &c.sources[0] else {
            panic!("expected analog_rest source");
        };
        assert_eq!(analog.name, "analog");
        assert_eq!(analog.poll_interval_secs, 10);
        assert_eq!(analog.channels[0].parameter, "pm10");
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DEVICE_ID", "env_device"),
            ("TOKEN_ID", "env_token"),
            ("STATION_ID", ""),
            ("DIAGNOSTIC_AUTO_RESTART_ENABLED", "false"),
            ("DIAGNOSTIC_INTERNET_TIMEOUT_MINUTES", "60"),
            ("ERROR_SESSION_COOKIE", "cookie"),
        ]);
        let mut c = valid();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.device_id, "env_device");
        assert_eq!(c.token_id, "env_token");
        // Empty values do not override.
        assert_eq!(c.station_id, "station_1");
        assert!(!c.monitor.auto_restart_enabled);
        assert_eq!(c.monitor.internet_timeout_minutes, 60);
        assert_eq!(c.error_session_cookie.as_deref(), Some("cookie"));
    }

    #[test]
    fn test_env_overlay_rejects_bad_numbers() {
        let mut c = valid();
        let err = c
            .apply_env(|k| (k == "DIAGNOSTIC_CHECK_INTERVAL_MINUTES").then(|| "often".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "DIAGNOSTIC_CHECK_INTERVAL_MINUTES",
                ..
            }
        ));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut c = valid();
        c.token_id.clear();
        assert!(matches!(c.validate(), Err(ConfigError::Missing("token_id"))));

        let mut c = valid();
        c.timezone = "Mars/Olympus".into();
        assert!(matches!(c.validate(), Err(ConfigError::UnknownTimezone(_))));

        let mut c = valid();
        c.queue_capacity = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                key: "queue_capacity",
                ..
            })
        ));

        let mut c = valid();
        c.public_key = Some("garbage".into());
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                key: "public_key",
                ..
            })
        ));
    }

    #[test]
    fn test_public_key_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pub.pem");
        std::fs::write(&path, PUBLIC_PEM).unwrap();
        let c = Config {
            public_key: None,
            public_key_file: Some(path),
            ..valid()
        };
        assert!(c.public_key().is_ok());
        assert!(c.codec().is_ok());
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let err = Config::load(Path::new("/nonexistent/cemslink.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
