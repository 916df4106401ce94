//! Live agent connections, owned by a single task.
//!
//! The map from agent id to connection is only touched by the loop spawned in
//! [`spawn`]. Everything else goes through a [`RegistryHandle`], which feeds the
//! loop's register, unregister and route queues.

use adt_core::protocol::{AgentId, Envelope};
use adt_core::rest::ConnectionStatus;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const CONTROL_QUEUE: usize = 256;

pub type ConnId = u64;

/// Frame queued for a connection's write task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("agent {0} is not connected")]
    AgentNotFound(AgentId),
    #[error("outbound queue for agent {0} is full")]
    QueueFull(AgentId),
    #[error("envelope encode failed: {0}")]
    Encode(String),
    #[error("registry is not running")]
    RegistryClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("registry is not running")]
pub struct RegistryClosed;

#[derive(Debug)]
pub struct AgentConnection {
    pub agent_id: AgentId,
    pub conn_id: ConnId,
    pub status: ConnectionStatus,
    sender: mpsc::Sender<Outbound>,
}

impl AgentConnection {
    /// Extra handle on the outbound queue, for replies written by the read loop.
    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.sender.clone()
    }

    fn close(&self, reason: &'static str) {
        let _ = self.sender.try_send(Outbound::Close(reason));
    }
}

struct RouteRequest {
    agent_id: AgentId,
    text: String,
    reply: oneshot::Sender<Result<(), RouteError>>,
}

#[derive(Clone)]
pub struct RegistryHandle {
    register_tx: mpsc::Sender<AgentConnection>,
    unregister_tx: mpsc::Sender<(AgentId, ConnId)>,
    route_tx: mpsc::Sender<RouteRequest>,
    live_rx: watch::Receiver<BTreeSet<AgentId>>,
    conn_counter: Arc<AtomicU64>,
}

/// Starts the registry loop. It stops once every handle is dropped.
pub fn spawn() -> RegistryHandle {
    let (register_tx, register_rx) = mpsc::channel(CONTROL_QUEUE);
    let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_QUEUE);
    let (route_tx, route_rx) = mpsc::channel(CONTROL_QUEUE);
    let (live_tx, live_rx) = watch::channel(BTreeSet::new());

    let registry = Registry {
        connections: HashMap::new(),
        live_tx,
    };
    tokio::spawn(registry.run(register_rx, unregister_rx, route_rx));

    RegistryHandle {
        register_tx,
        unregister_tx,
        route_tx,
        live_rx,
        conn_counter: Arc::new(AtomicU64::new(0)),
    }
}

impl RegistryHandle {
    /// Builds a connection for `agent_id` and the receiver its write task drains.
    pub fn open(
        &self,
        agent_id: AgentId,
        capacity: usize,
    ) -> (AgentConnection, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = AgentConnection {
            agent_id,
            conn_id,
            status: ConnectionStatus::Offline,
            sender,
        };
        (conn, receiver)
    }

    pub async fn register(&self, conn: AgentConnection) -> Result<(), RegistryClosed> {
        self.register_tx.send(conn).await.map_err(|_| RegistryClosed)
    }

    pub async fn unregister(
        &self,
        agent_id: AgentId,
        conn_id: ConnId,
    ) -> Result<(), RegistryClosed> {
        self.unregister_tx
            .send((agent_id, conn_id))
            .await
            .map_err(|_| RegistryClosed)
    }

    pub async fn route(&self, agent_id: AgentId, envelope: &Envelope) -> Result<(), RouteError> {
        let text = envelope
            .encode()
            .map_err(|err| RouteError::Encode(err.to_string()))?;
        let (reply, response) = oneshot::channel();
        self.route_tx
            .send(RouteRequest {
                agent_id,
                text,
                reply,
            })
            .await
            .map_err(|_| RouteError::RegistryClosed)?;
        response.await.map_err(|_| RouteError::RegistryClosed)?
    }

    /// Snapshot of the agent ids with a live connection.
    pub fn connected(&self) -> BTreeSet<AgentId> {
        self.live_rx.borrow().clone()
    }

    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.live_rx.borrow().contains(&agent_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<AgentId>> {
        self.live_rx.clone()
    }
}

struct Registry {
    connections: HashMap<AgentId, AgentConnection>,
    live_tx: watch::Sender<BTreeSet<AgentId>>,
}

impl Registry {
    async fn run(
        mut self,
        mut register_rx: mpsc::Receiver<AgentConnection>,
        mut unregister_rx: mpsc::Receiver<(AgentId, ConnId)>,
        mut route_rx: mpsc::Receiver<RouteRequest>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(conn) = register_rx.recv() => self.register(conn),
                Some((agent_id, conn_id)) = unregister_rx.recv() => self.unregister(agent_id, conn_id),
                Some(request) = route_rx.recv() => {
                    let result = self.route(request.agent_id, request.text);
                    if result == Err(RouteError::AgentNotFound(request.agent_id)) {
                        self.prune_closed(request.agent_id);
                    }
                    let _ = request.reply.send(result);
                }
                else => break,
            }
        }
        for conn in self.connections.values() {
            conn.close("shutdown");
        }
        debug!(event = "registry_stopped");
    }

    fn register(&mut self, mut conn: AgentConnection) {
        conn.status = ConnectionStatus::Online;
        let agent_id = conn.agent_id;
        let conn_id = conn.conn_id;
        if let Some(previous) = self.connections.insert(agent_id, conn) {
            previous.close("replaced");
            warn!(
                event = "agent_replaced",
                agent_id,
                old_conn_id = previous.conn_id,
                conn_id
            );
        }
        info!(event = "agent_registered", agent_id, conn_id);
        self.publish();
    }

    fn unregister(&mut self, agent_id: AgentId, conn_id: ConnId) {
        match self.connections.get(&agent_id) {
            Some(current) if current.conn_id == conn_id => {
                self.connections.remove(&agent_id);
                info!(
                    event = "agent_unregistered",
                    agent_id,
                    conn_id,
                    status = %ConnectionStatus::Offline
                );
                self.publish();
            }
            _ => debug!(event = "stale_unregister", agent_id, conn_id),
        }
    }

    fn route(&self, agent_id: AgentId, text: String) -> Result<(), RouteError> {
        let conn = self
            .connections
            .get(&agent_id)
            .ok_or(RouteError::AgentNotFound(agent_id))?;
        match conn.sender.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RouteError::QueueFull(agent_id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RouteError::AgentNotFound(agent_id)),
        }
    }

    /// Drops a registered connection whose write task has already gone away.
    fn prune_closed(&mut self, agent_id: AgentId) {
        let closed = self
            .connections
            .get(&agent_id)
            .is_some_and(|conn| conn.sender.is_closed());
        if closed {
            self.connections.remove(&agent_id);
            warn!(event = "agent_pruned", agent_id, status = %ConnectionStatus::Offline);
            self.publish();
        }
    }

    fn publish(&self) {
        let live: BTreeSet<AgentId> = self.connections.keys().copied().collect();
        self.live_tx.send_replace(live);
    }
}
