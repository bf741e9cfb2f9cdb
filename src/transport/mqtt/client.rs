//! Impure I/O operations for the TTN connection manager
//!
//! This module owns the rumqttc event loop task. All decisions are delegated to
//! the pure modules ([`super::health_monitor`], [`super::message_handler`]) and
//! to the [`Session`] core; the code here only moves events between them.

use super::connection::{
    configure_mqtt_options, connect_reason_code, generate_client_id, ConnectionState,
    ManagerSettings, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use super::outbound::OUTBOUND_BUFFER_CAPACITY;
use super::session::{PublishOutcome, Session};
use crate::config::ConnectionConfig;
use crate::listener::MessageListener;
use crate::protocol::{encode_downlink, ResolvedTopics};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Room for a full buffer flush plus the subscribe request
const REQUEST_CHANNEL_CAPACITY: usize = OUTBOUND_BUFFER_CAPACITY + 10;

/// Lifecycle events kept for slow subscribers
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect` waits for the event loop to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// ConnAck received; `reconnect` is false only for the first one
    Connected { reconnect: bool, broker_url: String },
    /// The first connection attempt failed; no retry follows
    ConnectFailed {
        reason_code: Option<u8>,
        message: String,
    },
    /// An established connection dropped
    ConnectionLost { reason: String },
    /// Waiting `delay_ms` before reconnection attempt `attempt`
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Reconnection attempts exhausted
    ReconnectAbandoned { attempts: u32 },
    Subscribed { topic: String },
    SubscribeFailed { topic: String, reason: String },
    /// Buffered downlinks handed to the transport after a reconnect
    BufferFlushed { count: usize },
    PublishFailed { reason: String },
    /// An inbound frame could not be decoded
    FrameDropped { topic: String, reason: String },
    /// Closed by `disconnect`
    Disconnected,
}

/// Shared state handed to the event loop task
struct EventLoopContext {
    session: Arc<Mutex<Session<AsyncClient>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    reconnect_config: ReconnectConfig,
    broker_url: String,
    subscribe_topic: String,
}

impl EventLoopContext {
    fn publish_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }
}

/// Manages one TTN broker session: connect, reconnect, subscribe, publish
pub struct ConnectionManager {
    settings: ManagerSettings,
    session: Option<Arc<Mutex<Session<AsyncClient>>>>,
    topics: Option<ResolvedTopics>,
    client_id: Option<String>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    shutdown_tx: Option<watch::Sender<bool>>,
    event_loop_handle: Option<JoinHandle<()>>,
    /// Set by `disconnect`; a closed manager does not connect again
    closed: bool,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_settings(ManagerSettings::default())
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            settings,
            session: None,
            topics: None,
            client_id: None,
            message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
            state_tx,
            state_rx,
            events_tx,
            shutdown_tx: None,
            event_loop_handle: None,
            closed: false,
        }
    }

    /// Start connecting to the regional broker and return immediately
    ///
    /// Configuration problems are reported synchronously. Everything that
    /// happens on the wire is reported through [`Self::events`] and
    /// [`Self::state_receiver`]. Must be called from within a tokio runtime.
    ///
    /// Once an attempt has ended in `Disconnected` (connect refused or
    /// reconnection abandoned) `connect` may be called again. The listener,
    /// event subscribers and resolved topics carry over; the client id is new.
    /// Returns [`MqttError::AlreadyStarted`] while an attempt is live and
    /// after [`Self::disconnect`].
    pub fn connect(&mut self, config: ConnectionConfig) -> Result<(), MqttError> {
        let _span = crate::lifecycle_span!(phase = "connect").entered();
        if self.attempt_in_progress() {
            return Err(MqttError::AlreadyStarted);
        }

        let topics = match &self.topics {
            Some(topics) => {
                config.validate()?;
                topics.clone()
            }
            None => self.settings.resolve_topics(&config)?,
        };
        let client_id = generate_client_id();
        let mqtt_options =
            configure_mqtt_options(&client_id, &config, &topics, self.settings.keep_alive)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MqttError::ConnectionFailedStr(format!("No tokio runtime: {e}")))?;

        if let Some(previous) = self.shutdown_tx.take() {
            debug!("Retrying after the previous attempt ended");
            let _ = previous.send(true);
        }
        // The previous loop has already published its final state
        self.event_loop_handle.take();

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let mut session = Session::new(client, topics.clone());
        let state = session.apply(ConnectionEvent::ConnectRequested);
        self.state_tx.send_replace(state);

        let session = Arc::new(Mutex::new(session));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = EventLoopContext {
            session: session.clone(),
            message_forwarder: self.message_forwarder.clone(),
            state_tx: self.state_tx.clone(),
            events_tx: self.events_tx.clone(),
            reconnect_config: self.settings.reconnect.clone(),
            broker_url: topics.broker_url.clone(),
            subscribe_topic: topics.subscribe_topic.clone(),
        };

        info!(
            client_id = %client_id,
            broker = %topics.broker_url,
            application_id = %config.application_id,
            "Connecting to TTN broker"
        );

        let span = crate::mqtt_span!(client_id = %client_id, broker = %topics.broker_url);
        let handle =
            runtime.spawn(Self::run_event_loop(event_loop, context, shutdown_rx).instrument(span));

        self.session = Some(session);
        self.topics = Some(topics);
        self.client_id = Some(client_id);
        self.shutdown_tx = Some(shutdown_tx);
        self.event_loop_handle = Some(handle);
        Ok(())
    }

    /// Live from `connect` until the attempt ends in `Disconnected`
    fn attempt_in_progress(&self) -> bool {
        if self.session.is_none() {
            return false;
        }
        self.closed || self.connection_state() != ConnectionState::Disconnected
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        context: EventLoopContext,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                            debug!("DISCONNECT sent");
                            false
                        }
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            Self::process_event_route(route, &context, &mut reconnect_attempts).await
                        }
                        Err(e) => {
                            Self::handle_event_loop_error(
                                e,
                                &context,
                                &mut reconnect_attempts,
                                shutdown_rx.clone(),
                            )
                            .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!("MQTT event loop stopped");
    }

    /// Returns true to keep polling, false to stop the task
    async fn handle_event_loop_error(
        error: ConnectionError,
        context: &EventLoopContext,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let mut session = context.session.lock().await;
        if session.is_closing() {
            debug!("Transport closed after disconnect: {}", error);
            return false;
        }

        let reason = error.to_string();

        if !session.has_connected() {
            let reason_code = connect_reason_code(&error);
            let state = session.apply(ConnectionEvent::ConnectFailed(reason.clone()));
            session.record_failure(reason_code, reason.clone());
            context.publish_state(state);
            error!(reason_code = ?reason_code, "Connection to {} failed: {}", context.broker_url, reason);
            context.emit(LifecycleEvent::ConnectFailed {
                reason_code,
                message: reason,
            });
            return false;
        }

        let was_connected = HealthMonitor::can_publish(session.state());
        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &context.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                let state = session.apply(ConnectionEvent::ReconnectionStarted(attempt));
                // Publishes must be able to buffer while we wait
                drop(session);
                context.publish_state(state);

                if was_connected {
                    warn!("Connection lost: {}", reason);
                    context.emit(LifecycleEvent::ConnectionLost { reason });
                } else {
                    warn!("Reconnection attempt failed: {}", reason);
                }

                let max_display = context
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );
                context.emit(LifecycleEvent::Reconnecting { attempt, delay_ms });

                Self::interruptible_sleep(shutdown_rx, delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let attempts = *reconnect_attempts;
                let state = session.apply(ConnectionEvent::PermanentFailure(format!(
                    "Max reconnection attempts ({attempts}) exceeded"
                )));
                session.record_failure(connect_reason_code(&error), reason.clone());
                context.publish_state(state);
                error!("Giving up after {} reconnection attempts: {}", attempts, reason);
                context.emit(LifecycleEvent::ReconnectAbandoned { attempts });
                false
            }
        }
    }

    /// Returns true to keep polling, false to stop the task
    async fn process_event_route(
        route: EventRoute,
        context: &EventLoopContext,
        reconnect_attempts: &mut u32,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                Self::handle_connack(context, reconnect_attempts).await
            }
            EventRoute::MessageReceived { topic, payload } => {
                Self::handle_message_received(context, &topic, &payload).await;
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                match MessageHandler::validate_subscription_success(&return_codes) {
                    Ok(()) => {
                        info!(packet_id, "Subscribed to {}", context.subscribe_topic);
                        context.emit(LifecycleEvent::Subscribed {
                            topic: context.subscribe_topic.clone(),
                        });
                    }
                    Err(reason) => {
                        warn!(packet_id, "{}", reason);
                        context.emit(LifecycleEvent::SubscribeFailed {
                            topic: context.subscribe_topic.clone(),
                            reason,
                        });
                    }
                }
                true
            }
            EventRoute::Disconnected => {
                warn!("Broker sent DISCONNECT");
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Subscribe and flush under one lock so no publish interleaves
    async fn handle_connack(context: &EventLoopContext, reconnect_attempts: &mut u32) -> bool {
        let mut session = context.session.lock().await;
        if session.is_closing() {
            return false;
        }

        let report = session.on_connack();
        let state = session.state().clone();
        drop(session);

        *reconnect_attempts = 0;
        context.publish_state(state);
        context.emit(LifecycleEvent::Connected {
            reconnect: report.reconnect,
            broker_url: context.broker_url.clone(),
        });

        if let Err(e) = report.subscribe {
            error!("Failed to subscribe to {}: {}", context.subscribe_topic, e);
            context.emit(LifecycleEvent::SubscribeFailed {
                topic: context.subscribe_topic.clone(),
                reason: e.to_string(),
            });
        }
        if report.flushed > 0 {
            info!("Sent {} downlinks buffered while offline", report.flushed);
            context.emit(LifecycleEvent::BufferFlushed {
                count: report.flushed,
            });
        }
        for e in report.rejected {
            context.emit(LifecycleEvent::PublishFailed {
                reason: e.to_string(),
            });
        }
        if let Some(e) = report.flush_error {
            context.emit(LifecycleEvent::PublishFailed {
                reason: e.to_string(),
            });
        }
        true
    }

    async fn handle_message_received(context: &EventLoopContext, topic: &str, payload: &[u8]) {
        tracing::debug!(target: "mqtt_transport", "Received uplink on topic: {}", topic);

        match MessageHandler::decode_frame(payload) {
            Ok(message) => {
                context.session.lock().await.record_message();
                let forwarder = context.message_forwarder.lock().await;
                forwarder.forward(message);
            }
            Err(e) => {
                warn!("Dropping undecodable frame on {}: {}", topic, e);
                context.emit(LifecycleEvent::FrameDropped {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Returns true if the sleep completed, false if shutdown was requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Encode and publish a downlink command
    ///
    /// Sent immediately while connected. While a lost connection is being
    /// re-established the frame is buffered (up to 100 frames) and sent after
    /// the next successful subscribe.
    pub async fn publish(&self, command: &str) -> Result<PublishOutcome, MqttError> {
        // Length is checked before any connection state
        let payload = encode_downlink(command)?;

        let session = self.session.as_ref().ok_or_else(|| MqttError::NotConnected {
            state: self.connection_state(),
        })?;

        let result = session.lock().await.publish_encoded(payload);
        match &result {
            Ok(PublishOutcome::Sent) => debug!("Published downlink {:?}", command),
            Ok(PublishOutcome::Buffered { queued }) => {
                debug!("Buffered downlink {:?} ({} queued)", command, queued)
            }
            Err(e @ (MqttError::PublishFailed(_) | MqttError::InvalidTopic(_))) => {
                error!("Failed to publish downlink: {}", e);
                let _ = self.events_tx.send(LifecycleEvent::PublishFailed {
                    reason: e.to_string(),
                });
            }
            Err(e) => warn!("Downlink {:?} not accepted: {}", command, e),
        }
        result
    }

    /// Install the uplink listener, replacing any previous one
    pub async fn register_listener(&self, listener: Arc<dyn MessageListener>) {
        let mut forwarder = self.message_forwarder.lock().await;
        forwarder.set_listener(listener);
    }

    /// Close the session; safe to call repeatedly or before `connect`
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let span = crate::lifecycle_span!(
            phase = "disconnect",
            client_id = self.client_id.as_deref().unwrap_or("-")
        );
        self.shutdown().instrument(span).await
    }

    async fn shutdown(&mut self) -> Result<(), MqttError> {
        let mut was_connected = false;
        if let Some(session) = &self.session {
            self.closed = true;
            let mut session = session.lock().await;
            if !session.is_closing() {
                match session.close() {
                    Ok(connected) => was_connected = connected,
                    Err(e) => warn!("Failed to request DISCONNECT: {}", e),
                }
                self.state_tx.send_replace(session.state().clone());
                let _ = self.events_tx.send(LifecycleEvent::Disconnected);
            }
        }

        // A live connection stops the loop itself once DISCONNECT is written
        if !was_connected {
            if let Some(shutdown_tx) = &self.shutdown_tx {
                let _ = shutdown_tx.send(true);
            }
        }

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing stop");
                    if let Some(shutdown_tx) = &self.shutdown_tx {
                        let _ = shutdown_tx.send(true);
                    }
                }
            }
            info!("Disconnected from TTN broker");
        }
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.connection_state())
    }

    /// Watch channel that follows every state change
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to lifecycle events from now on
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    /// Wait for a ConnAck, failing if the attempt ends or `timeout` passes
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        match Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await {
            Err(MqttError::NotConnected { state }) => {
                let failure = match &self.session {
                    Some(session) => session.lock().await.last_failure(),
                    None => None,
                };
                Err(failure.unwrap_or(MqttError::NotConnected { state }))
            }
            other => other,
        }
    }

    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => {
                        return Err(MqttError::NotConnected { state });
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Topics derived at `connect`, if it has been called
    pub fn resolved_topics(&self) -> Option<&ResolvedTopics> {
        self.topics.as_ref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub async fn buffered_len(&self) -> usize {
        match &self.session {
            Some(session) => session.lock().await.buffered_len(),
            None => 0,
        }
    }

    pub async fn health_metrics(&self) -> HealthMetrics {
        match &self.session {
            Some(session) => session.lock().await.health_metrics(),
            None => HealthMonitor::calculate_health_metrics(None, None, 0),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // No async in Drop; call disconnect() for a clean DISCONNECT
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
