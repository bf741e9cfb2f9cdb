//! Pure connection state management for the MQTT client
//!
//! This module contains pure functions for connection state management,
//! configuration handling, and translation of transport errors.

use crate::config::{ClientConfig, ConfigError, ConnectionConfig, ReconnectSection};
use crate::protocol::{CodecError, ResolvedTopics, PROVIDER_HOST};
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Keep-alive the TTN broker expects from clients
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// rumqttc refuses keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Connection state for the MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected; initial state and the state after a failed or closed connection
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// ConnAck received, ready for traffic
    Connected,
    /// Connection lost, automatic reconnection attempt (attempt count)
    Reconnecting(u32),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, one entry per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectSection::default().into()
    }
}

impl From<ReconnectSection> for ReconnectConfig {
    fn from(section: ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_pattern_ms,
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Knobs of a [`ConnectionManager`](super::ConnectionManager) that are not account identifiers
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub reconnect: ReconnectConfig,
    /// Host suffix used to derive the regional broker
    pub provider_host: String,
    /// Use this broker instead of the derived one
    pub broker_url: Option<String>,
    pub keep_alive: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            provider_host: PROVIDER_HOST.to_string(),
            broker_url: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl From<&ClientConfig> for ManagerSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            reconnect: config.reconnect.clone().into(),
            provider_host: PROVIDER_HOST.to_string(),
            broker_url: config.mqtt.broker_url.clone(),
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
        }
    }
}

impl ManagerSettings {
    /// Resolve the session topics, honoring the broker override
    pub fn resolve_topics(&self, config: &ConnectionConfig) -> Result<ResolvedTopics, ConfigError> {
        let topics = ResolvedTopics::resolve_with_host(config, &self.provider_host)?;
        Ok(match &self.broker_url {
            Some(url) => topics.with_broker_url(url.clone()),
            None => topics,
        })
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Connection failed (reason code {reason_code:?}): {message}")]
    ConnectionFailed {
        reason_code: Option<u8>,
        message: String,
    },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid publish topic: {0}")]
    InvalidTopic(String),
    #[error("Payload error: {0}")]
    Codec(#[from] CodecError),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Offline buffer full ({capacity} frames) - message rejected")]
    BufferFull { capacity: usize },
    #[error("Connection already started")]
    AlreadyStarted,
}

impl MqttError {
    /// Whether the same request may succeed later
    ///
    /// A publish only fails transiently when the request queue is full.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PublishFailed(_))
    }
}

/// A client id unique to this process and connection
pub fn generate_client_id() -> String {
    format!("ttn-mqtt-{}", uuid::Uuid::new_v4().simple())
}

/// Split a `tcp://host:port` broker URL
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16), MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    if !matches!(url.scheme(), "tcp" | "mqtt") {
        return Err(MqttError::InvalidBrokerUrl(broker_url.to_string()));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(crate::protocol::topics::BROKER_PORT);

    Ok((host.to_string(), port))
}

/// Pure function to build transport options for one session
pub fn configure_mqtt_options(
    client_id: &str,
    config: &ConnectionConfig,
    topics: &ResolvedTopics,
    keep_alive: Duration,
) -> Result<MqttOptions, MqttError> {
    let (host, port) = parse_broker_url(&topics.broker_url)?;

    let mut mqtt_options = MqttOptions::new(client_id, host, port);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_keep_alive(keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_credentials(config.application_id.clone(), config.access_key.clone());

    Ok(mqtt_options)
}

/// MQTT 3.1.1 CONNACK return code of a refused connection
pub fn connect_reason_code(error: &ConnectionError) -> Option<u8> {
    match error {
        ConnectionError::ConnectionRefused(code) => Some(return_code_value(code)),
        _ => None,
    }
}

fn return_code_value(code: &ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}
