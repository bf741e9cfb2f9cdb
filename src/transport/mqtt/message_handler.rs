//! Pure message routing and processing logic for MQTT events
//!
//! This module contains pure functions for classifying transport events and
//! decoding uplink frames, plus the single-slot listener forwarder.

use crate::listener::MessageListener;
use crate::protocol::{CodecError, InboundMessage};
use rumqttc::{Event, Packet, SubscribeReasonCode};
use std::sync::Arc;
use tracing::{debug, warn};

/// SUBACK return code signalling a refused subscription
const SUBACK_FAILURE: u8 = 0x80;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the handler that owns it (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback
                        .return_codes
                        .iter()
                        .map(Self::subscribe_return_code)
                        .collect(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    fn subscribe_return_code(code: &SubscribeReasonCode) -> u8 {
        match code {
            SubscribeReasonCode::Success(qos) => *qos as u8,
            SubscribeReasonCode::Failure => SUBACK_FAILURE,
        }
    }

    /// Decode an inbound frame into an uplink (pure function)
    pub fn decode_frame(payload: &[u8]) -> Result<InboundMessage, CodecError> {
        InboundMessage::decode(payload)
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.iter().any(|&code| code >= SUBACK_FAILURE) {
            Err(format!(
                "Subscription refused with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to subscribe and publish
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Subscription answered with return codes
    SubscriptionConfirmed { packet_id: u16, return_codes: Vec<u8> },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Holds the one registered listener
#[derive(Default)]
pub struct MessageForwarder {
    listener: Option<Arc<dyn MessageListener>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a listener, dropping any previous one
    pub fn set_listener(&mut self, listener: Arc<dyn MessageListener>) {
        if self.listener.replace(listener).is_some() {
            debug!("Replaced previously registered message listener");
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Hand a decoded uplink to the listener; false if none is registered
    pub fn forward(&self, message: InboundMessage) -> bool {
        match &self.listener {
            Some(listener) => {
                listener.on_message_received(message);
                true
            }
            None => {
                warn!("Received uplink but no listener registered - message dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::SinkListener;
    use crate::testing::RecordingSink;
    use rumqttc::{ConnAck, ConnectReturnCode, Outgoing, PubAck, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "app/devices/node/up",
            QoS::AtMostOnce,
            b"{}".to_vec(),
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                topic: "app/devices/node/up".to_string(),
                payload: b"{}".to_vec(),
            }
        );
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&suback),
            EventRoute::SubscriptionConfirmed {
                packet_id: 7,
                return_codes: vec![0x00, 0x80],
            }
        );
    }

    #[test]
    fn test_route_other_events() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PubAck(PubAck::new(1)))),
            EventRoute::InfrastructureEvent(_)
        ));
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_decode_frame() {
        let message = MessageHandler::decode_frame(br#"{"dev_id":"node-1"}"#).unwrap();
        assert_eq!(message.dev_id, "node-1");
        assert!(MessageHandler::decode_frame(b"\xff\xfe").is_err());
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[0x00]).is_ok());
        assert!(MessageHandler::validate_subscription_success(&[0x00, 0x01]).is_ok());
        assert!(MessageHandler::validate_subscription_success(&[0x80]).is_err());
        assert!(MessageHandler::validate_subscription_success(&[0x00, 0x80]).is_err());
    }

    #[test]
    fn test_forwarder_without_listener() {
        let forwarder = MessageForwarder::new();
        assert!(!forwarder.has_listener());
        assert!(!forwarder.forward(InboundMessage::default()));
    }

    #[test]
    fn test_forwarder_replaces_listener() {
        let first = Arc::new(SinkListener::new(RecordingSink::new()));
        let second = Arc::new(SinkListener::new(RecordingSink::new()));

        let mut forwarder = MessageForwarder::new();
        forwarder.set_listener(first.clone());
        assert!(forwarder.forward(InboundMessage::default()));

        forwarder.set_listener(second.clone());
        assert!(forwarder.forward(InboundMessage::default()));

        assert_eq!(first.sink().len(), 1);
        assert_eq!(second.sink().len(), 1);
    }
}
