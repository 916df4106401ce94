use crate::registry::{ConnId, Outbound};
use crate::AppState;
use adt_core::protocol::{AgentId, Envelope};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<AgentId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_agent_socket(state, agent_id, socket))
}

/// Runs one agent connection until its read side closes or its writer gives up.
pub async fn serve_agent_socket(state: AppState, agent_id: AgentId, socket: WebSocket) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let registry = state.registry().clone();
    let (conn, rx) = registry.open(agent_id, state.config.queue_capacity);
    let conn_id = conn.conn_id;
    let reply_tx = conn.sender();
    let mut write_task = tokio::spawn(write_loop(
        ws_sender,
        rx,
        state.config.write_timeout,
        state.config.ping_interval,
        conn_id,
    ));

    if registry.register(conn).await.is_err() {
        warn!(event = "registry_unavailable", agent_id, conn_id);
        write_task.abort();
        return;
    }

    let mut writer_done = false;
    loop {
        let result = tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(result) => result,
                None => break,
            },
            _ = &mut write_task => {
                writer_done = true;
                info!(event = "writer_stopped", agent_id, conn_id);
                break;
            }
        };
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", agent_id, conn_id, error = %err);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(
                        event = "message_invalid",
                        agent_id,
                        conn_id,
                        error = "binary frame is not utf-8"
                    );
                    continue;
                }
            },
            Message::Close(_) => {
                info!(event = "agent_close", agent_id, conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if state.config.debug {
            debug!(event = "message_received", agent_id, conn_id, raw = %text);
        }
        match Envelope::decode(&text) {
            Ok(envelope) => state.dispatcher.handle_inbound(agent_id, envelope),
            Err(err) => {
                warn!(event = "message_invalid", agent_id, conn_id, error = %err);
                let Some(reply) = state.config.parse_policy.reply_for(&err) else {
                    continue;
                };
                match reply.encode() {
                    Ok(text) => {
                        queue_reply(&reply_tx, text, agent_id, conn_id);
                    }
                    Err(err) => warn!(event = "reply_encode_failed", conn_id, error = %err),
                }
            }
        }
    }

    let _ = registry.unregister(agent_id, conn_id).await;
    drop(reply_tx);
    if !writer_done {
        let _ = write_task.await;
    }
}

/// Queues a reply without waiting. Returns false, after logging, when it was dropped.
fn queue_reply(
    reply_tx: &mpsc::Sender<Outbound>,
    text: String,
    agent_id: AgentId,
    conn_id: ConnId,
) -> bool {
    match reply_tx.try_send(Outbound::Text(text)) {
        Ok(()) => true,
        Err(err) => {
            warn!(event = "reply_dropped", agent_id, conn_id, error = %err);
            false
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    ping_interval: Duration,
    conn_id: ConnId,
) {
    let mut ping = ping_ticker(ping_interval);
    loop {
        let msg = tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(text)) => Message::Text(text),
                Some(Outbound::Close(reason)) => Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                })),
                None => break,
            },
            _ = next_ping(&mut ping) => Message::Ping(Vec::new()),
        };
        let closing = matches!(msg, Message::Close(_));
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "write_error", conn_id, error = %err);
                return;
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id);
                return;
            }
        }
        if closing {
            return;
        }
    }
    let _ = sink.close().await;
}

fn ping_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::time::interval_at(Instant::now() + period, period))
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
