//! Mock implementations for testing
//!
//! Provides a recording [`BrokerLink`] and a recording [`MessageSink`] so the
//! session state machine and listeners can be exercised without a broker.

use crate::listener::MessageSink;
use crate::protocol::InboundMessage;
use crate::transport::mqtt::MqttError;
use crate::transport::BrokerLink;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One request made through a [`MockLink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Subscribe { topic: String, qos: QoS },
    Publish { topic: String, qos: QoS, payload: Bytes },
    Disconnect,
}

#[derive(Debug, Default)]
struct LinkState {
    ops: Vec<LinkOp>,
    fail_subscribes: bool,
    /// Publishes still allowed before failing; None means unlimited
    publish_allowance: Option<usize>,
}

/// Broker link that records every request
///
/// Publish topics are validated like `rumqttc::AsyncClient` does.
/// Clones share the same history, so a test can keep a handle after moving
/// the link into a session.
#[derive(Debug, Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        lock(&self.state).ops.clone()
    }

    /// Published (topic, payload) pairs in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state)
            .ops
            .iter()
            .filter_map(|op| match op {
                LinkOp::Publish { topic, payload, .. } => Some((topic.clone(), payload.to_vec())),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.state).ops.clear();
    }

    pub fn fail_subscribes(&self, fail: bool) {
        lock(&self.state).fail_subscribes = fail;
    }

    /// Accept `count` more publishes, then fail every one after
    pub fn fail_publishes_after(&self, count: usize) {
        lock(&self.state).publish_allowance = match count {
            usize::MAX => None,
            n => Some(n),
        };
    }
}

impl BrokerLink for MockLink {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let mut state = lock(&self.state);
        if state.fail_subscribes {
            return Err(MqttError::SubscriptionFailed(format!(
                "{topic}: mock subscribe failure"
            )));
        }
        state.ops.push(LinkOp::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        Ok(())
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), MqttError> {
        if !rumqttc::valid_topic(topic) {
            return Err(MqttError::InvalidTopic(topic.to_string()));
        }
        let mut state = lock(&self.state);
        match state.publish_allowance {
            Some(0) => {
                return Err(MqttError::PublishFailed(
                    "mock publish failure".to_string().into(),
                ))
            }
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
        state.ops.push(LinkOp::Publish {
            topic: topic.to_string(),
            qos,
            payload,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        lock(&self.state).ops.push(LinkOp::Disconnect);
        Ok(())
    }
}

/// Sink that keeps every message it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<InboundMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        lock(&self.messages).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.messages).is_empty()
    }
}

impl MessageSink for RecordingSink {
    fn push(&self, message: InboundMessage) {
        lock(&self.messages).push(message);
    }
}
