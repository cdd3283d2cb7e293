//! ---
//! swm_section: "02-messaging-ipc-data-model"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Structured logging and metrics for bus traffic."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use prometheus::{IntCounterVec, Opts, Registry};
use tracing::debug;

use crate::types::{Message, MessagePayload};

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message sent out via a transport.
    Outbound,
    /// Message received from a peer.
    Inbound,
}

impl MessageDirection {
    fn as_label(self) -> &'static str {
        match self {
            MessageDirection::Outbound => "outbound",
            MessageDirection::Inbound => "inbound",
        }
    }
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, message: &Message) {
    match &message.payload {
        MessagePayload::Call(call) => debug!(
            message_id = %message.id,
            timestamp = %message.timestamp,
            kind = message.kind(),
            schema_version = message.schema_version,
            direction = ?direction,
            service = %call.service,
            method = %call.method,
            args = call.args.len(),
            "messaging activity"
        ),
        MessagePayload::Reply(reply) => debug!(
            message_id = %message.id,
            timestamp = %message.timestamp,
            kind = message.kind(),
            schema_version = message.schema_version,
            direction = ?direction,
            in_reply_to = %reply.in_reply_to,
            accepted = reply.accepted,
            "messaging activity"
        ),
    }
}

/// Prometheus metric handles for bus activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    messages: IntCounterVec,
    dropped: IntCounterVec,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages = IntCounterVec::new(
            Opts::new("swm_bus_messages_total", "Bus messages by direction and method"),
            &["direction", "method"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new("swm_bus_dropped_total", "Outbound messages that failed to deliver"),
            &["service"],
        )?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(dropped.clone()))?;

        Ok(Self { messages, dropped })
    }

    /// Record a message crossing the bus.
    pub fn observe(&self, direction: MessageDirection, message: &Message) {
        let method = message
            .as_call()
            .map(|call| call.method.as_str())
            .unwrap_or("reply");
        self.messages
            .with_label_values(&[direction.as_label(), method])
            .inc();
    }

    /// Record an outbound message that could not be delivered.
    pub fn observe_dropped(&self, service: &str) {
        self.dropped.with_label_values(&[service]).inc();
    }
}

impl std::fmt::Debug for MessagingMetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingMetricsExporter").finish()
    }
}
