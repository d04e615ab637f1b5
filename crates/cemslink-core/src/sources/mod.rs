//! Concrete sensor sources.
//!
//! HTML scraping and Modbus readers live outside this crate; anything that
//! implements [`SensorSource`] can be handed to the orchestrator.

pub mod analog_rest;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

pub use analog_rest::AnalogRestSource;

use crate::config::{SourceConfig, StaticSourceConfig};
use crate::error::SourceError;
use crate::source::{Reading, SensorSource, SourceInfo, SourceProtocol};

/// Fixed values, stamped with the poll time.
pub struct StaticSource {
    info: SourceInfo,
    values: Vec<(String, f64, String)>,
}

impl StaticSource {
    pub fn new(
        name: impl Into<String>,
        poll_interval: Duration,
        values: Vec<(String, f64, String)>,
    ) -> Self {
        Self {
            info: SourceInfo {
                name: name.into(),
                description: "Fixed bench values".to_string(),
                protocol: SourceProtocol::Static,
                poll_interval,
            },
            values,
        }
    }

    pub fn from_config(config: &StaticSourceConfig) -> Self {
        Self::new(
            config.name.clone(),
            Duration::from_secs(config.poll_interval_secs.max(1)),
            config
                .values
                .iter()
                .map(|v| (v.parameter.clone(), v.value, v.unit.clone()))
                .collect(),
        )
    }
}

impl SensorSource for StaticSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn poll(&self) -> Result<Vec<Reading>, SourceError> {
        let now = Utc::now();
        Ok(self
            .values
            .iter()
            .map(|(parameter, value, unit)| Reading::new(parameter.clone(), *value, unit.clone(), now))
            .collect())
    }
}

/// Instantiate every configured source.
pub fn build_sources(configs: &[SourceConfig]) -> Vec<Arc<dyn SensorSource>> {
    configs
        .iter()
        .map(|config| -> Arc<dyn SensorSource> {
            match config {
                SourceConfig::AnalogRest(c) => Arc::new(AnalogRestSource::from_config(c)),
                SourceConfig::Static(c) => Arc::new(StaticSource::from_config(c)),
            }
        })
        .collect()
}
