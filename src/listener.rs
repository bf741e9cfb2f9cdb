//! Consumer side of decoded uplinks
//!
//! A [`ConnectionManager`](crate::transport::mqtt::ConnectionManager) hands each
//! decoded frame to exactly one [`MessageListener`]. Listeners run on the
//! transport's event-loop task, so they should return quickly.

use crate::protocol::InboundMessage;
use tokio::sync::mpsc;
use tracing::warn;

/// Receives every successfully decoded uplink, in arrival order
pub trait MessageListener: Send + Sync {
    fn on_message_received(&self, message: InboundMessage);
}

impl<F> MessageListener for F
where
    F: Fn(InboundMessage) + Send + Sync,
{
    fn on_message_received(&self, message: InboundMessage) {
        self(message)
    }
}

impl MessageListener for mpsc::UnboundedSender<InboundMessage> {
    fn on_message_received(&self, message: InboundMessage) {
        if self.send(message).is_err() {
            warn!("Uplink receiver dropped - message discarded");
        }
    }
}

/// Where received messages end up (history store, stdout, database ...)
pub trait MessageSink: Send + Sync {
    fn push(&self, message: InboundMessage);
}

/// Listener that forwards into an injected sink
pub struct SinkListener<S> {
    sink: S,
}

impl<S: MessageSink> SinkListener<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: MessageSink> MessageListener for SinkListener<S> {
    fn on_message_received(&self, message: InboundMessage) {
        self.sink.push(message);
    }
}
