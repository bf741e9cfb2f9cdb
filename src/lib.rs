//! TTN MQTT - uplinks and downlinks for The Things Network applications
//!
//! Connects to a regional TTN MQTT broker with an application's credentials,
//! subscribes to device uplinks, decodes them into typed messages and
//! publishes short downlink commands.
//!
//! # Overview
//!
//! - [`protocol`] - Topic and broker resolution, the downlink codec and uplink types
//! - [`transport`] - The connection lifecycle state machine over rumqttc
//! - [`listener`] - Where decoded uplinks are delivered
//! - [`config`] - Account identifiers and TOML configuration
//! - [`observability`] - Structured logging setup
//!
//! # Quick Start
//!
//! ```rust
//! use ttn_mqtt::config::ConnectionConfig;
//! use ttn_mqtt::protocol::{encode_downlink, ResolvedTopics};
//!
//! let config = ConnectionConfig::new("eu", "my-app", "ttn-account-v2.secret", Some("node-1".to_string()));
//! let topics = ResolvedTopics::resolve(&config).unwrap();
//!
//! assert_eq!(topics.broker_url, "tcp://eu.thethings.network:1883");
//! assert_eq!(topics.subscribe_topic, "my-app/devices/node-1/up");
//! assert_eq!(topics.publish_topic, "my-app/devices/node-1/down");
//!
//! let body = encode_downlink("ON").unwrap();
//! assert_eq!(&body[..], br#"{"payload_raw":"T04="}"#);
//! ```

pub mod config;
pub mod listener;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError, ConnectionConfig};
pub use listener::{MessageListener, MessageSink, SinkListener};
pub use protocol::*;
pub use transport::mqtt::{
    ConnectionManager, ConnectionState, LifecycleEvent, ManagerSettings, MqttError, PublishOutcome,
};
