//! ---
//! swm_section: "02-messaging-ipc-data-model"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Bus transports and the line-delimited JSON codec."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::logging::{log_message, MessageDirection, MessagingMetricsExporter};
use crate::types::{Call, Message};
use crate::{MessagingError, Result};

/// Transport abstraction used by the orchestrator to reach remote services.
///
/// Sends are fire-and-forget: a successful return means the message was
/// accepted for delivery, not that the peer processed it.
pub trait Transport: Send + Sync {
    /// Send a message into the transport.
    fn send(&self, msg: Message) -> Result<()>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Encode a message as one newline-terminated JSON line.
pub fn encode_line(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one JSON line into a message.
pub fn decode_line(line: &str) -> Result<Message> {
    Ok(serde_json::from_str(line.trim())?)
}

/// In-memory transport backed by a mutex protected queue.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    queue: Arc<Mutex<VecDeque<Message>>>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued message in send order.
    pub fn drain(&self) -> Vec<Message> {
        self.queue.lock().drain(..).collect()
    }

    /// Take every queued call in send order, dropping replies.
    pub fn drain_calls(&self) -> Vec<Call> {
        self.drain()
            .into_iter()
            .filter_map(|message| message.as_call().cloned())
            .collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, msg: Message) -> Result<()> {
        log_message(MessageDirection::Outbound, &msg);
        self.queue.lock().push_back(msg);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

struct Outgoing {
    service: String,
    endpoint: SocketAddr,
    message: Message,
}

/// TCP transport routing calls to per-service endpoints.
///
/// Messages are queued to a background writer task which opens one
/// connection per message and writes a single JSON line.
pub struct TcpTransport {
    endpoints: IndexMap<String, SocketAddr>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    metrics: Option<MessagingMetricsExporter>,
}

impl TcpTransport {
    /// Start the writer task. Must be called from within a tokio runtime.
    pub fn spawn(
        endpoints: IndexMap<String, SocketAddr>,
        metrics: Option<MessagingMetricsExporter>,
    ) -> (Self, JoinHandle<()>) {
        let (outbox, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let writer_metrics = metrics.clone();
        let handle = tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                if let Err(err) = deliver(outgoing.endpoint, &outgoing.message).await {
                    warn!(
                        service = %outgoing.service,
                        endpoint = %outgoing.endpoint,
                        message_id = %outgoing.message.id,
                        error = %err,
                        "failed to deliver bus message"
                    );
                    if let Some(metrics) = &writer_metrics {
                        metrics.observe_dropped(&outgoing.service);
                    }
                }
            }
            debug!("tcp transport writer stopped");
        });

        (
            Self {
                endpoints,
                outbox,
                metrics,
            },
            handle,
        )
    }

    /// Endpoint configured for a service, if any.
    pub fn endpoint(&self, service: &str) -> Option<SocketAddr> {
        self.endpoints.get(service).copied()
    }
}

impl Transport for TcpTransport {
    fn send(&self, msg: Message) -> Result<()> {
        let call = msg
            .as_call()
            .ok_or(MessagingError::Unroutable(msg.kind()))?;
        let endpoint = self
            .endpoint(&call.service)
            .ok_or_else(|| MessagingError::UnknownEndpoint(call.service.clone()))?;
        let service = call.service.clone();

        log_message(MessageDirection::Outbound, &msg);
        if let Some(metrics) = &self.metrics {
            metrics.observe(MessageDirection::Outbound, &msg);
        }
        self.outbox
            .send(Outgoing {
                service,
                endpoint,
                message: msg,
            })
            .map_err(|_| MessagingError::Closed)
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

async fn deliver(endpoint: SocketAddr, message: &Message) -> Result<()> {
    let mut stream = TcpStream::connect(endpoint).await?;
    stream.write_all(&encode_line(message)?).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Send one message and wait for the peer's single-line answer.
pub async fn request(endpoint: SocketAddr, message: &Message) -> Result<Message> {
    let stream = TcpStream::connect(endpoint).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(&encode_line(message)?).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(line) => decode_line(&line),
        None => Err(MessagingError::NoReply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArgValue, MessagePayload};
    use tokio::net::TcpListener;

    #[test]
    fn in_memory_transport_keeps_send_order() {
        let transport = InMemoryTransport::new();
        transport
            .send(Message::call("svc", "first", Vec::new()))
            .expect("send");
        transport
            .send(Message::call("svc", "second", vec![ArgValue::Int(2)]))
            .expect("send");

        let calls = transport.drain_calls();
        let methods: Vec<_> = calls.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(methods, ["first", "second"]);
        assert!(transport.is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_line("not json"),
            Err(MessagingError::Json(_))
        ));
    }

    #[tokio::test]
    async fn tcp_transport_delivers_to_configured_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut endpoints = IndexMap::new();
        endpoints.insert("org.genivi.hmi".to_string(), addr);
        let (transport, _writer) = TcpTransport::spawn(endpoints, None);

        transport
            .send(Message::call(
                "org.genivi.hmi",
                "updateNotification",
                vec!["u1".into()],
            ))
            .expect("queued");

        let (stream, _) = listener.accept().await.expect("accept");
        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.expect("read").expect("line");
        let message = decode_line(&line).expect("decode");
        let call = message.as_call().expect("call");
        assert_eq!(call.method, "updateNotification");
        assert_eq!(call.args, vec![ArgValue::Str("u1".into())]);
    }

    #[tokio::test]
    async fn tcp_transport_rejects_unknown_service_and_replies() {
        let (transport, _writer) = TcpTransport::spawn(IndexMap::new(), None);
        let call = Message::call("org.genivi.nowhere", "poke", Vec::new());
        assert!(matches!(
            transport.send(call.clone()),
            Err(MessagingError::UnknownEndpoint(service)) if service == "org.genivi.nowhere"
        ));
        let reply = call.reply(true, None);
        assert!(matches!(reply.payload, MessagePayload::Reply(_)));
        assert!(matches!(
            transport.send(reply),
            Err(MessagingError::Unroutable("reply"))
        ));
    }

    #[tokio::test]
    async fn request_reads_single_line_answer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let line = lines.next_line().await.expect("read").expect("line");
            let incoming = decode_line(&line).expect("decode");
            let reply = incoming.reply(true, Some(ArgValue::Bool(true)));
            writer
                .write_all(&encode_line(&reply).expect("encode"))
                .await
                .expect("write");
        });

        let message = Message::call("swm", "getInstalledPackages", Vec::new());
        let answer = request(addr, &message).await.expect("reply");
        match answer.payload {
            MessagePayload::Reply(reply) => {
                assert_eq!(reply.in_reply_to, message.id);
                assert_eq!(reply.value, Some(ArgValue::Bool(true)));
            }
            MessagePayload::Call(_) => panic!("expected reply"),
        }
    }
}
