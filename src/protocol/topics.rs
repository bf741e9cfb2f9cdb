//! Broker address and topic derivation for TTN applications
//!
//! TTN's v2 broker lives at `<region>.thethings.network:1883` and routes
//! traffic under `<app_id>/devices/<dev_id>/{up,down}`. An empty device id
//! selects every device of the application through the `#` wildcard.

use crate::config::{ConfigError, ConnectionConfig};
use serde::Serialize;

/// Host suffix of the TTN regional brokers
pub const PROVIDER_HOST: &str = "thethings.network";

/// Plain MQTT port
pub const BROKER_PORT: u16 = 1883;

pub fn resolve_broker(region: &str) -> Result<String, ConfigError> {
    resolve_broker_with_host(region, PROVIDER_HOST)
}

pub fn resolve_broker_with_host(region: &str, host: &str) -> Result<String, ConfigError> {
    if region.is_empty() {
        return Err(ConfigError::MissingField("region"));
    }
    Ok(format!("tcp://{region}.{host}:{BROKER_PORT}"))
}

pub fn resolve_subscribe_topic(application_id: &str, device_id: &str) -> String {
    if device_id.is_empty() {
        format!("{application_id}/devices/#")
    } else {
        format!("{application_id}/devices/{device_id}/up")
    }
}

pub fn resolve_publish_topic(application_id: &str, device_id: &str) -> String {
    if device_id.is_empty() {
        format!("{application_id}/devices/#")
    } else {
        format!("{application_id}/devices/{device_id}/down")
    }
}

/// Broker URL and topics for one session, resolved once and then reused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTopics {
    pub broker_url: String,
    pub subscribe_topic: String,
    pub publish_topic: String,
}

impl ResolvedTopics {
    pub fn resolve(config: &ConnectionConfig) -> Result<Self, ConfigError> {
        Self::resolve_with_host(config, PROVIDER_HOST)
    }

    pub fn resolve_with_host(config: &ConnectionConfig, host: &str) -> Result<Self, ConfigError> {
        config.validate()?;
        let device_id = config.device_id();
        Ok(Self {
            broker_url: resolve_broker_with_host(&config.region, host)?,
            subscribe_topic: resolve_subscribe_topic(&config.application_id, device_id),
            publish_topic: resolve_publish_topic(&config.application_id, device_id),
        })
    }

    /// Replace the derived broker URL, keeping the topics
    pub fn with_broker_url(mut self, broker_url: impl Into<String>) -> Self {
        self.broker_url = broker_url.into();
        self
    }
}
