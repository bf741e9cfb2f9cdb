//! MQTT session management for The Things Network
//!
//! The module separates pure decision logic from I/O so the state machine can
//! be tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection state, settings and error translation
//! - [`message_handler`] - Pure event routing and uplink decoding
//! - [`health_monitor`] - Pure state transitions and reconnection decisions
//! - [`outbound`] - Bounded buffer for downlinks published while offline
//! - [`session`] - Synchronous core run under one lock per transition
//! - [`client`] - Impure event loop task and the public [`ConnectionManager`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ttn_mqtt::config::ConnectionConfig;
//! use ttn_mqtt::transport::mqtt::ConnectionManager;
//!
//! # tokio_test::block_on(async {
//! let mut manager = ConnectionManager::new();
//! manager.register_listener(std::sync::Arc::new(|message: ttn_mqtt::protocol::InboundMessage| {
//!     println!("{} sent {:?}", message.dev_id, message.payload_raw);
//! })).await;
//!
//! manager.connect(ConnectionConfig::new("eu", "my-app", "ttn-account-v2.secret", None))?;
//! manager.wait_until_connected(Duration::from_secs(10)).await?;
//! manager.publish("ON").await?;
//! manager.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod outbound;
pub mod session;

pub use client::{ConnectionManager, LifecycleEvent};
pub use connection::{ConnectionState, ManagerSettings, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
pub use outbound::{OutboundBuffer, OutboundFrame, OUTBOUND_BUFFER_CAPACITY};
pub use session::{FlushOutcome, PublishOutcome, Session};
