//! ---
//! swm_section: "05-networking-external-interfaces"
//! swm_subsection: "binary"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Inbound bus listener feeding the daemon event loop."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::net::SocketAddr;

use anyhow::{Context, Result};
use swm_core::{InboundRequest, SERVICE_NAME};
use swm_msg::{
    decode_line, encode_line, log_message, ArgValue, Message, MessageDirection,
    MessagingMetricsExporter,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decoded call waiting for the event loop, plus the channel its answer goes back on.
pub struct Inbound {
    pub request: InboundRequest,
    pub reply: oneshot::Sender<Option<ArgValue>>,
}

/// Bind `listen` and forward every decoded call to `events`.
pub async fn spawn_listener(
    listen: SocketAddr,
    events: mpsc::Sender<Inbound>,
    metrics: Option<MessagingMetricsExporter>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("unable to bind bus listener on {listen}"))?;
    let local = listener.local_addr()?;
    info!(address = %local, service = SERVICE_NAME, "bus listener ready");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let events = events.clone();
                    let metrics = metrics.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, events, metrics).await {
                            debug!(peer = %peer, error = %err, "bus connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept bus connection"),
            }
        }
    });
    Ok((local, handle))
}

async fn serve_connection(
    stream: TcpStream,
    events: mpsc::Sender<Inbound>,
    metrics: Option<MessagingMetricsExporter>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match decode_line(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable bus message");
                continue;
            }
        };
        log_message(MessageDirection::Inbound, &message);
        if let Some(metrics) = &metrics {
            metrics.observe(MessageDirection::Inbound, &message);
        }

        let answer = dispatch(&message, &events).await;
        writer.write_all(&encode_line(&answer)?).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn dispatch(message: &Message, events: &mpsc::Sender<Inbound>) -> Message {
    let Some(call) = message.as_call() else {
        debug!(message_id = %message.id, "ignoring inbound reply");
        return message.reply(false, None);
    };
    if call.service != SERVICE_NAME {
        warn!(service = %call.service, method = %call.method, "call addressed to another service");
        return message.reply(false, None);
    }
    let request = match InboundRequest::from_call(call) {
        Ok(request) => request,
        Err(err) => {
            warn!(method = %call.method, error = %err, "rejecting malformed call");
            return message.reply(false, None);
        }
    };

    let (reply, answer) = oneshot::channel();
    if events.send(Inbound { request, reply }).await.is_err() {
        warn!(method = %call.method, "event loop stopped; call not handled");
        return message.reply(false, None);
    }
    match answer.await {
        Ok(value) => message.reply(true, value),
        Err(_) => message.reply(false, None),
    }
}
