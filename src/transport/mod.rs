//! Transport layer for broker communication
//!
//! [`BrokerLink`] is the narrow, non-blocking surface the session state machine
//! needs from an MQTT client. The production implementation is
//! `rumqttc::AsyncClient`; tests use [`crate::testing::MockLink`].

use bytes::Bytes;
use rumqttc::QoS;

pub mod mqtt;

use mqtt::MqttError;

/// Non-blocking operations on a live (or reconnecting) broker client
///
/// Every call only enqueues a request; completion is reported by the event loop.
pub trait BrokerLink: Send {
    /// Request a subscription
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;

    /// Queue a non-retained publish
    ///
    /// Topics containing `+` or `#` fail with [`MqttError::InvalidTopic`].
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), MqttError>;

    /// Request a clean DISCONNECT
    fn disconnect(&self) -> Result<(), MqttError>;
}

impl BrokerLink for rumqttc::AsyncClient {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.try_subscribe(topic, qos)
            .map_err(|e| MqttError::SubscriptionFailed(format!("{topic}: {e}")))
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), MqttError> {
        // try_publish reports a wildcard topic the same way as a full queue
        if !rumqttc::valid_topic(topic) {
            return Err(MqttError::InvalidTopic(topic.to_string()));
        }
        self.try_publish(topic, qos, false, payload.to_vec())
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.try_disconnect()
            .map_err(|e| MqttError::ConnectionFailedStr(format!("Disconnect failed: {e}")))
    }
}
