//! Synchronous core of the connection state machine
//!
//! A [`Session`] owns everything that must change atomically when the broker
//! acknowledges a (re)connection: the state, the mandatory subscribe, and the
//! flush of the offline buffer. It never awaits, so the event loop can run a
//! whole transition under one lock and no `publish` can slip in between.

use super::connection::{ConnectionState, MqttError};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor};
use super::outbound::{OutboundBuffer, OutboundFrame};
use crate::protocol::{encode_downlink, ResolvedTopics};
use crate::transport::BrokerLink;
use bytes::Bytes;
use rumqttc::QoS;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Both directions run fire-and-forget
pub const SESSION_QOS: QoS = QoS::AtMostOnce;

/// What happened to an accepted publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport
    Sent,
    /// Queued until the connection returns; `queued` frames are now waiting
    Buffered { queued: usize },
}

/// Result of handling a ConnAck
#[derive(Debug)]
pub struct ConnectedReport {
    /// True when this ConnAck follows an earlier successful connection
    pub reconnect: bool,
    pub subscribe: Result<(), MqttError>,
    /// Buffered frames handed to the transport
    pub flushed: usize,
    /// Frames the transport will never accept; removed from the buffer
    pub rejected: Vec<MqttError>,
    /// Set when the flush stopped early; the unsent frames stay buffered
    pub flush_error: Option<MqttError>,
}

/// Result of draining the offline buffer
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub sent: usize,
    pub rejected: Vec<MqttError>,
    /// Transient failure that stopped the flush
    pub stopped: Option<MqttError>,
}

pub struct Session<L: BrokerLink> {
    link: L,
    topics: ResolvedTopics,
    state: ConnectionState,
    buffer: OutboundBuffer,
    buffering_enabled: bool,
    has_connected: bool,
    closing: bool,
    reconnect_count: u32,
    connect_time: Option<Instant>,
    last_message_time: Option<Instant>,
    last_failure: Option<(Option<u8>, String)>,
}

impl<L: BrokerLink> Session<L> {
    pub fn new(link: L, topics: ResolvedTopics) -> Self {
        Self {
            link,
            topics,
            state: ConnectionState::Disconnected,
            buffer: OutboundBuffer::default(),
            buffering_enabled: false,
            has_connected: false,
            closing: false,
            reconnect_count: 0,
            connect_time: None,
            last_message_time: None,
            last_failure: None,
        }
    }

    /// Apply a connection event and return the new state
    pub fn apply(&mut self, event: ConnectionEvent) -> ConnectionState {
        let next = HealthMonitor::determine_next_state(&event);
        if next != self.state {
            HealthMonitor::log_state_transition(&self.state, &next);
        }
        if next == ConnectionState::Disconnected {
            // Nothing will come back to flush these
            if !self.buffer.is_empty() {
                warn!("Discarding {} buffered downlinks", self.buffer.len());
                self.buffer.clear();
            }
            self.buffering_enabled = false;
        }
        self.state = next.clone();
        next
    }

    /// Broker accepted the connection: subscribe, then drain the buffer
    pub fn on_connack(&mut self) -> ConnectedReport {
        let reconnect = self.has_connected;
        self.has_connected = true;
        if reconnect {
            self.reconnect_count += 1;
        }
        self.connect_time.get_or_insert_with(Instant::now);
        self.apply(ConnectionEvent::ConnAckReceived);
        self.buffering_enabled = true;

        // Clean session: nothing survives a reconnect, so subscribe every time
        let subscribe = self.subscribe();
        let flush = self.flush();

        ConnectedReport {
            reconnect,
            subscribe,
            flushed: flush.sent,
            rejected: flush.rejected,
            flush_error: flush.stopped,
        }
    }

    pub fn subscribe(&self) -> Result<(), MqttError> {
        info!("Subscribing to {}", self.topics.subscribe_topic);
        self.link.subscribe(&self.topics.subscribe_topic, SESSION_QOS)
    }

    /// Send buffered frames in FIFO order
    ///
    /// A transient failure puts the frame back at the head and stops. Frames
    /// rejected for good are dropped so they cannot block the queue.
    pub fn flush(&mut self) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        while let Some(frame) = self.buffer.pop_front() {
            match self
                .link
                .publish(&frame.topic, SESSION_QOS, frame.payload.clone())
            {
                Ok(()) => outcome.sent += 1,
                Err(e) if e.is_transient() => {
                    warn!(
                        "Flush stopped after {} frames, {} still buffered: {}",
                        outcome.sent,
                        self.buffer.len() + 1,
                        e
                    );
                    self.buffer.push_front(frame);
                    outcome.stopped = Some(e);
                    return outcome;
                }
                Err(e) => {
                    warn!("Dropping buffered downlink for {}: {}", frame.topic, e);
                    outcome.rejected.push(e);
                }
            }
        }
        if outcome.sent > 0 {
            debug!("Flushed {} buffered downlinks", outcome.sent);
        }
        outcome
    }

    /// Encode and publish a downlink command
    pub fn publish(&mut self, command: &str) -> Result<PublishOutcome, MqttError> {
        let payload = encode_downlink(command)?;
        self.publish_encoded(payload)
    }

    /// Publish an already-encoded envelope to the session's downlink topic
    pub fn publish_encoded(&mut self, payload: Bytes) -> Result<PublishOutcome, MqttError> {
        if HealthMonitor::can_publish(&self.state) {
            self.link
                .publish(&self.topics.publish_topic, SESSION_QOS, payload)?;
            return Ok(PublishOutcome::Sent);
        }

        if !self.buffering_enabled {
            return Err(MqttError::NotConnected {
                state: self.state.clone(),
            });
        }

        let frame = OutboundFrame {
            topic: self.topics.publish_topic.clone(),
            payload,
        };
        match self.buffer.push(frame) {
            Ok(()) => Ok(PublishOutcome::Buffered {
                queued: self.buffer.len(),
            }),
            Err(_rejected) => Err(MqttError::BufferFull {
                capacity: self.buffer.capacity(),
            }),
        }
    }

    /// Request a clean shutdown; returns whether a live connection was closed
    pub fn close(&mut self) -> Result<bool, MqttError> {
        if self.closing {
            return Ok(false);
        }
        self.closing = true;
        let was_connected = matches!(self.state, ConnectionState::Connected);
        self.apply(ConnectionEvent::Closed);

        if was_connected {
            self.link.disconnect()?;
        }
        Ok(was_connected)
    }

    /// Remember why the session ended up disconnected
    pub fn record_failure(&mut self, reason_code: Option<u8>, message: String) {
        self.last_failure = Some((reason_code, message));
    }

    /// The failure recorded last, as a connection error
    pub fn last_failure(&self) -> Option<MqttError> {
        self.last_failure
            .as_ref()
            .map(|(reason_code, message)| MqttError::ConnectionFailed {
                reason_code: *reason_code,
                message: message.clone(),
            })
    }

    pub fn record_message(&mut self) {
        self.last_message_time = Some(Instant::now());
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            self.connect_time,
            self.last_message_time,
            self.reconnect_count,
        )
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn topics(&self) -> &ResolvedTopics {
        &self.topics
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_connected(&self) -> bool {
        self.has_connected
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::CodecError;
    use crate::testing::{LinkOp, MockLink};
    use crate::transport::mqtt::outbound::OUTBOUND_BUFFER_CAPACITY;

    fn topics(device: Option<&str>) -> ResolvedTopics {
        let config = ConnectionConfig::new("eu", "app1", "key", device.map(str::to_string));
        ResolvedTopics::resolve(&config).unwrap()
    }

    fn session() -> Session<MockLink> {
        let mut session = Session::new(MockLink::new(), topics(Some("dev1")));
        session.apply(ConnectionEvent::ConnectRequested);
        session
    }

    #[test]
    fn test_initial_connack_subscribes() {
        let mut session = session();
        assert_eq!(session.state(), &ConnectionState::Connecting);

        let report = session.on_connack();
        assert!(!report.reconnect);
        assert!(report.subscribe.is_ok());
        assert_eq!(report.flushed, 0);
        assert_eq!(session.state(), &ConnectionState::Connected);
        assert_eq!(
            session.link().ops(),
            vec![LinkOp::Subscribe {
                topic: "app1/devices/dev1/up".to_string(),
                qos: QoS::AtMostOnce,
            }]
        );
    }

    #[test]
    fn test_publish_before_first_connack_is_rejected() {
        let mut session = session();
        assert!(matches!(
            session.publish("ON"),
            Err(MqttError::NotConnected {
                state: ConnectionState::Connecting
            })
        ));
        assert!(session.link().ops().is_empty());
    }

    #[test]
    fn test_publish_when_connected_sends_immediately() {
        let mut session = session();
        session.on_connack();

        assert_eq!(session.publish("ON").unwrap(), PublishOutcome::Sent);
        assert_eq!(
            session.link().published(),
            vec![(
                "app1/devices/dev1/down".to_string(),
                br#"{"payload_raw":"T04="}"#.to_vec()
            )]
        );
    }

    #[test]
    fn test_long_command_rejected_without_io() {
        let mut session = session();
        session.on_connack();
        let before = session.link().ops().len();

        assert!(matches!(
            session.publish("TOOLONG"),
            Err(MqttError::Codec(CodecError::PayloadTooLong { .. }))
        ));
        assert_eq!(session.link().ops().len(), before);
    }

    #[test]
    fn test_offline_publishes_are_buffered_then_flushed_after_resubscribe() {
        let mut session = session();
        session.on_connack();
        session.apply(ConnectionEvent::ReconnectionStarted(1));

        assert_eq!(
            session.publish("A").unwrap(),
            PublishOutcome::Buffered { queued: 1 }
        );
        assert_eq!(
            session.publish("B").unwrap(),
            PublishOutcome::Buffered { queued: 2 }
        );
        session.link().clear();

        let report = session.on_connack();
        assert!(report.reconnect);
        assert_eq!(report.flushed, 2);
        assert_eq!(session.buffered_len(), 0);
        assert_eq!(session.reconnect_count(), 1);

        let ops = session.link().ops();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], LinkOp::Subscribe { .. }));
        let bodies: Vec<Vec<u8>> = session
            .link()
            .published()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(
            bodies,
            vec![
                br#"{"payload_raw":"QQ=="}"#.to_vec(),
                br#"{"payload_raw":"Qg=="}"#.to_vec()
            ]
        );
    }

    #[test]
    fn test_buffer_rejects_newest_at_capacity() {
        let mut session = session();
        session.on_connack();
        session.apply(ConnectionEvent::ReconnectionStarted(1));

        for _ in 0..OUTBOUND_BUFFER_CAPACITY {
            session.publish("X").unwrap();
        }
        assert!(matches!(
            session.publish("Y"),
            Err(MqttError::BufferFull { capacity: 100 })
        ));
        assert_eq!(session.buffered_len(), 100);
    }

    #[test]
    fn test_failed_flush_keeps_remaining_frames() {
        let mut session = session();
        session.on_connack();
        session.apply(ConnectionEvent::ReconnectionStarted(1));
        session.publish("A").unwrap();
        session.publish("B").unwrap();
        session.publish("C").unwrap();

        session.link().fail_publishes_after(1);
        let report = session.on_connack();
        assert_eq!(report.flushed, 1);
        assert!(report.flush_error.is_some());
        assert_eq!(session.buffered_len(), 2);

        session.link().fail_publishes_after(usize::MAX);
        let outcome = session.flush();
        assert_eq!(outcome.sent, 2);
        assert!(outcome.stopped.is_none());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_flush_drops_frames_the_link_never_accepts() {
        let mut session = Session::new(MockLink::new(), topics(None));
        session.apply(ConnectionEvent::ConnectRequested);
        session.on_connack();
        session.apply(ConnectionEvent::ReconnectionStarted(1));
        session.publish("A").unwrap();
        session.publish("B").unwrap();

        let report = session.on_connack();
        assert_eq!(report.flushed, 0);
        assert_eq!(report.rejected.len(), 2);
        assert!(matches!(report.rejected[0], MqttError::InvalidTopic(_)));
        assert!(report.flush_error.is_none());
        assert_eq!(session.buffered_len(), 0);
        assert!(session.link().published().is_empty());
    }

    #[test]
    fn test_subscribe_failure_is_reported_not_fatal() {
        let mut session = session();
        session.link().fail_subscribes(true);

        let report = session.on_connack();
        assert!(matches!(
            report.subscribe,
            Err(MqttError::SubscriptionFailed(_))
        ));
        assert_eq!(session.state(), &ConnectionState::Connected);
        assert_eq!(session.publish("ON").unwrap(), PublishOutcome::Sent);
    }

    #[test]
    fn test_wildcard_topics_without_device() {
        let mut session = Session::new(MockLink::new(), topics(None));
        session.apply(ConnectionEvent::ConnectRequested);
        session.on_connack();

        assert_eq!(
            session.link().ops(),
            vec![LinkOp::Subscribe {
                topic: "app1/devices/#".to_string(),
                qos: QoS::AtMostOnce,
            }]
        );
        assert!(matches!(
            session.publish("ON"),
            Err(MqttError::InvalidTopic(topic)) if topic == "app1/devices/#"
        ));
        assert!(session.link().published().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = session();
        session.on_connack();
        session.apply(ConnectionEvent::ReconnectionStarted(1));
        session.publish("A").unwrap();
        session.apply(ConnectionEvent::ConnAckReceived);

        assert!(session.close().unwrap());
        assert!(!session.close().unwrap());
        assert_eq!(session.state(), &ConnectionState::Disconnected);
        assert_eq!(session.buffered_len(), 0);

        let disconnects = session
            .link()
            .ops()
            .into_iter()
            .filter(|op| *op == LinkOp::Disconnect)
            .count();
        assert_eq!(disconnects, 1);

        assert!(matches!(
            session.publish("B"),
            Err(MqttError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_permanent_failure_stops_buffering() {
        let mut session = session();
        session.on_connack();
        session.apply(ConnectionEvent::ReconnectionStarted(1));
        session.publish("A").unwrap();

        session.apply(ConnectionEvent::PermanentFailure("gave up".to_string()));
        assert_eq!(session.buffered_len(), 0);
        assert!(matches!(
            session.publish("B"),
            Err(MqttError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[test]
    fn test_last_failure() {
        let mut session = session();
        assert!(session.last_failure().is_none());

        session.record_failure(Some(4), "bad user name or password".to_string());
        assert!(matches!(
            session.last_failure(),
            Some(MqttError::ConnectionFailed {
                reason_code: Some(4),
                ..
            })
        ));
    }

    #[test]
    fn test_health_metrics_track_activity() {
        let mut session = session();
        assert!(!session.health_metrics().is_healthy);

        session.on_connack();
        session.record_message();
        let metrics = session.health_metrics();
        assert!(metrics.is_healthy);
        assert!(metrics.time_since_last_message.is_some());
        assert_eq!(metrics.reconnect_count, 0);
    }
}
