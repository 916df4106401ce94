//! Agent side of the command channel.
//!
//! The manager owns the connect/read/reconnect cycle. While connected it runs
//! one-shot commands inline on the read path and hands recurring requests to
//! the [`Scheduler`], whose ticks reach the socket through the [`OutboundLink`].

use crate::backoff::ReconnectPolicy;
use crate::executor::Execute;
use crate::link::OutboundLink;
use crate::scheduler::{DuplicatePolicy, Scheduler};
use adt_core::protocol::{CommandOutput, Envelope, ParseFailurePolicy};
use futures_util::{Sink, SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("connect to {url} failed: {source}")]
pub struct ConnectError {
    url: String,
    source: tungstenite::Error,
}

#[derive(Debug, Error)]
enum Disconnect {
    #[error("closed by coordinator")]
    Closed,
    #[error("stream ended")]
    StreamEnded,
    #[error("read failed: {0}")]
    Read(tungstenite::Error),
    #[error("write failed: {0}")]
    Write(tungstenite::Error),
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    pub parse_policy: ParseFailurePolicy,
    pub duplicate_policy: DuplicatePolicy,
    pub outbound_capacity: usize,
}

impl ManagerConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: ReconnectPolicy::default(),
            parse_policy: ParseFailurePolicy::Drop,
            duplicate_policy: DuplicatePolicy::Allow,
            outbound_capacity: 256,
        }
    }
}

pub struct ConnectionManager {
    config: ManagerConfig,
    executor: Arc<dyn Execute>,
    scheduler: Scheduler,
    link: OutboundLink,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, executor: Arc<dyn Execute>) -> Self {
        let link = OutboundLink::new();
        let scheduler = Scheduler::new(executor.clone(), link.clone(), config.duplicate_policy);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            executor,
            scheduler,
            link,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Connects, then serves and reconnects until `shutdown` flips to true.
    ///
    /// Only the first connect attempt can fail the call; later transport
    /// failures are retried following the reconnect policy.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConnectError> {
        let ws = self.connect().await?;
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {}
            _ = self.supervise(ws) => {}
        }
        self.link.detach();
        self.scheduler.stop_all();
        self.set_state(ConnectionState::Disconnected);
        info!(event = "agent_stopped");
        Ok(())
    }

    async fn supervise(&self, mut ws: WsStream) {
        let mut backoff = self.config.reconnect.backoff();
        loop {
            let reason = self.serve(ws).await;
            warn!(event = "agent_disconnected", reason = %reason);
            ws = loop {
                let delay = backoff.next_delay();
                info!(event = "reconnect_wait", delay_ms = delay.as_millis() as u64);
                tokio::time::sleep(delay).await;
                match self.connect().await {
                    Ok(ws) => {
                        backoff.reset();
                        break ws;
                    }
                    Err(err) => warn!(event = "reconnect_failed", error = %err),
                }
            };
        }
    }

    async fn connect(&self) -> Result<WsStream, ConnectError> {
        self.set_state(ConnectionState::Connecting);
        match connect_async(self.config.url.as_str()).await {
            Ok((ws, _)) => Ok(ws),
            Err(source) => {
                self.set_state(ConnectionState::Disconnected);
                Err(ConnectError {
                    url: self.config.url.to_string(),
                    source,
                })
            }
        }
    }

    async fn serve(&self, ws: WsStream) -> Disconnect {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.config.outbound_capacity.max(1));
        self.link.attach(tx);
        self.set_state(ConnectionState::Connected);
        info!(event = "agent_connected", url = %self.config.url);

        let reason = loop {
            tokio::select! {
                incoming = stream.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!(event = "message_invalid", error = "binary frame is not utf-8");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) => break Disconnect::Closed,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => break Disconnect::Read(err),
                        None => break Disconnect::StreamEnded,
                    };
                    if let Some(reply) = self.handle_text(&text).await {
                        if let Err(err) = send_envelope(&mut sink, &reply).await {
                            break err;
                        }
                    }
                }
                Some(envelope) = rx.recv() => {
                    if let Err(err) = send_envelope(&mut sink, &envelope).await {
                        break err;
                    }
                }
            }
        };

        self.link.detach();
        self.set_state(ConnectionState::Disconnected);
        let _ = sink.close().await;
        reason
    }

    /// Handles one inbound frame and returns the reply to write, if any.
    async fn handle_text(&self, text: &str) -> Option<Envelope> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "message_invalid", error = %err);
                return self.config.parse_policy.reply_for(&err);
            }
        };
        match envelope {
            Envelope::ExecuteCommand(request) => {
                debug!(event = "execute_command", command_id = request.id);
                let response = match self.executor.execute(&request.command).await {
                    Ok(output) => CommandOutput {
                        id: request.id,
                        output,
                        error: None,
                    },
                    Err(err) => {
                        warn!(event = "command_failed", command_id = request.id, error = %err);
                        CommandOutput {
                            id: request.id,
                            output: err.output().to_string(),
                            error: Some(err.to_string()),
                        }
                    }
                };
                Some(Envelope::ExecuteCommandResponse(response))
            }
            Envelope::ExecuteRecurringCommand(request) => {
                if let Err(err) = self.scheduler.schedule(&request) {
                    warn!(event = "schedule_refused", command_id = request.id, error = %err);
                }
                None
            }
            Envelope::Error(payload) => {
                warn!(
                    event = "coordinator_error",
                    code = payload.code,
                    message = %payload.message
                );
                None
            }
            other => {
                warn!(event = "unexpected_envelope", kind = %other.kind());
                None
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(event = "connection_state", from = %current, to = %state);
            *current = state;
            true
        });
    }
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), Disconnect>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "encode_failed", kind = %envelope.kind(), error = %err);
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await.map_err(Disconnect::Write)
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
