//! WebSocket sync server routing views to per-diagram controllers.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── SyncController (diagram 1) ── DiagramStore
//!             ├── connection tasks ────┤          │                       OperationLog (shared)
//! Client B ──┘        │                └── SyncController (diagram 2)     SnapshotStore (optional)
//!                     │                           │
//!                     ◄── watch / mpsc ◄── ViewObserver ◄┘  (StateReplaced, PeerJoined, PeerLeft)
//! ```
//!
//! A connection joins exactly one diagram and the server picks its view id.
//! Each connection task owns its socket: inbound frames are handled in
//! order and replies are written directly. Fan-out reaches the same select
//! loop two ways. States go through a `watch` channel, so a slow socket
//! only ever sends the newest state. Peer events go through a bounded mpsc,
//! and a view that overflows it is disconnected.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use umlsync_core::DiagramState;
use uuid::Uuid;

use crate::broadcast::{ViewEvent, ViewInfo};
use crate::controller::{ControllerConfig, SyncController, ViewRegistration};
use crate::oplog::RetentionPolicy;
use crate::protocol::{JoinRequest, MessageType, ProtocolError, Rejection, SyncMessage};
use crate::registry::{DiagramRegistry, JoinError};
use crate::snapshot::{FileSnapshotStore, SnapshotError};
use crate::store::OperationError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: String,
    /// Per-view event backlog, also the bound on queued peer events per connection
    pub broadcast_capacity: usize,
    /// Directory for diagram snapshots (None = in-memory only)
    pub snapshot_dir: Option<PathBuf>,
    /// Automatic snapshot interval in versions
    pub snapshot_every: Option<u64>,
    /// Log pruning after each commit
    pub retention: Option<RetentionPolicy>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: controller.broadcast_capacity,
            snapshot_dir: None,
            snapshot_every: controller.snapshot_every,
            retention: controller.retention,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small buffers, no persistence.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 16,
            snapshot_dir: None,
            snapshot_every: None,
            retention: None,
        }
    }

    /// Per-diagram settings derived from this config.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            broadcast_capacity: self.broadcast_capacity,
            retention: self.retention,
            snapshot_every: self.snapshot_every,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub operations_confirmed: u64,
    pub operations_rejected: u64,
    pub operations_failed: u64,
}

/// A connection's membership in one diagram.
struct Session {
    controller: Arc<SyncController>,
    registration: ViewRegistration,
}

impl Session {
    fn view_id(&self) -> Uuid {
        self.registration.view_id()
    }
}

/// Outbound side of one connection, shared with its view observer.
#[derive(Clone)]
struct Outbound {
    /// Newest committed state not yet written to the socket.
    states: Arc<watch::Sender<Option<Arc<DiagramState>>>>,
    peers: mpsc::Sender<SyncMessage>,
    /// Signalled when `peers` is full.
    overflow: Arc<Notify>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DiagramRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the snapshot directory if configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let mut registry = DiagramRegistry::new(config.controller_config());
        if let Some(dir) = &config.snapshot_dir {
            registry = registry.with_snapshot_store(Arc::new(FileSnapshotStore::open(dir.clone())?));
        }
        Ok(Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Diagrams currently open.
    pub fn registry(&self) -> &Arc<DiagramRegistry> {
        &self.registry
    }

    /// Configured listen address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Copy of the connection and message counters.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);
            let capacity = self.config.broadcast_capacity.max(1);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, capacity).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<DiagramRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        capacity: usize,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = None;
        let result =
            Self::session_loop(ws_stream, addr, &registry, &stats, capacity, &mut session).await;

        if let Some(session) = session {
            let diagram_id = session.controller.diagram_id();
            session.registration.unregister().await;
            drop(session.controller);
            registry.remove_if_idle(diagram_id).await;
        }
        stats.write().await.active_connections -= 1;
        log::info!("connection closed from {addr}");
        result
    }

    async fn session_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        registry: &DiagramRegistry,
        stats: &RwLock<ServerStats>,
        capacity: usize,
        session: &mut Option<Session>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (states_tx, mut states_rx) = watch::channel(None);
        let (peers_tx, mut peers_rx) = mpsc::channel::<SyncMessage>(capacity);
        let outbound = Outbound {
            states: Arc::new(states_tx),
            peers: peers_tx,
            overflow: Arc::new(Notify::new()),
        };

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match SyncMessage::decode(&data) {
                                Ok(sync_msg) => {
                                    let reply = Self::handle_message(sync_msg, addr, registry, stats, session, &outbound).await?;
                                    if let Some(reply) = reply {
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                                Err(e) => log::warn!("failed to decode message from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                Ok(()) = states_rx.changed() => {
                    let latest = states_rx.borrow_and_update().clone();
                    if let (Some(state), Some(session)) = (latest, session.as_ref()) {
                        let msg = SyncMessage::state_replaced(
                            session.view_id(),
                            session.controller.diagram_id(),
                            &state,
                        )?;
                        ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                    }
                }

                Some(outgoing) = peers_rx.recv() => {
                    ws_sender.send(Message::Binary(outgoing.encode()?.into())).await?;
                }

                _ = outbound.overflow.notified() => {
                    log::warn!("{addr} fell more than {capacity} peer events behind; disconnecting");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle one inbound message. Returns the direct reply, if any.
    async fn handle_message(
        msg: SyncMessage,
        addr: SocketAddr,
        registry: &DiagramRegistry,
        stats: &RwLock<ServerStats>,
        session: &mut Option<Session>,
        outbound: &Outbound,
    ) -> Result<Option<SyncMessage>, ServerError> {
        match msg.msg_type {
            MessageType::Join => {
                if session.is_some() {
                    log::warn!("{addr} sent a second join; ignored");
                    return Ok(None);
                }
                let request = msg.join_request().unwrap_or_else(|e| {
                    log::warn!("join from {addr} without valid identity: {e}");
                    JoinRequest {
                        user_id: "anonymous".into(),
                        display_name: "Anonymous".into(),
                    }
                });
                // The client learns its id from the first StateReplaced.
                let view_id = Uuid::new_v4();
                let diagram_id = msg.diagram_id;

                let info = ViewInfo::with_id(view_id, request.user_id, request.display_name);
                let (controller, registration) = registry
                    .join(diagram_id, info, forward_to(outbound.clone(), view_id, diagram_id))
                    .await?;
                *session = Some(Session {
                    controller,
                    registration,
                });
                Ok(None)
            }

            MessageType::SubmitOperation => {
                let Some(session) = session.as_ref() else {
                    let rejection = Rejection {
                        client_sequence_number: msg.sequence,
                        errors: vec!["join a diagram before submitting operations".into()],
                        warnings: Vec::new(),
                    };
                    return Ok(Some(SyncMessage::rejected(msg.view_id, msg.diagram_id, &rejection)?));
                };
                let view_id = session.view_id();
                let diagram_id = session.controller.diagram_id();

                let operation = match msg.operation() {
                    Ok(operation) => operation,
                    Err(e) => {
                        let rejection = Rejection {
                            client_sequence_number: msg.sequence,
                            errors: vec![format!("malformed operation: {e}")],
                            warnings: Vec::new(),
                        };
                        stats.write().await.operations_rejected += 1;
                        return Ok(Some(SyncMessage::rejected(view_id, diagram_id, &rejection)?));
                    }
                };

                let reply = match session.controller.process_operation(view_id, operation).await {
                    Ok(confirmation) => {
                        stats.write().await.operations_confirmed += 1;
                        SyncMessage::confirmed(view_id, diagram_id, &confirmation)?
                    }
                    Err(OperationError::Rejected { errors, warnings }) => {
                        stats.write().await.operations_rejected += 1;
                        let rejection = Rejection {
                            client_sequence_number: msg.sequence,
                            errors,
                            warnings,
                        };
                        SyncMessage::rejected(view_id, diagram_id, &rejection)?
                    }
                    Err(OperationError::Internal(message)) => {
                        stats.write().await.operations_failed += 1;
                        let rejection = Rejection {
                            client_sequence_number: msg.sequence,
                            errors: vec![message],
                            warnings: Vec::new(),
                        };
                        SyncMessage::failed(view_id, diagram_id, &rejection)?
                    }
                };
                Ok(Some(reply))
            }

            MessageType::Ping => {
                let view_id = session.as_ref().map_or(msg.view_id, Session::view_id);
                Ok(Some(SyncMessage::pong(view_id)))
            }

            other => {
                log::debug!("unexpected {other:?} message from {addr}");
                Ok(None)
            }
        }
    }
}

/// Observer that hands fan-out events to one connection. States replace
/// any unsent state; peer events queue up to the channel bound.
fn forward_to(
    out: Outbound,
    view_id: Uuid,
    diagram_id: Uuid,
) -> impl Fn(&ViewEvent) + Send + Sync + 'static {
    move |event: &ViewEvent| match event {
        ViewEvent::StateReplaced(state) => {
            out.states.send_replace(Some(Arc::clone(state)));
        }
        peer => match SyncMessage::from_event(view_id, diagram_id, peer) {
            Ok(msg) => {
                if let Err(TrySendError::Full(_)) = out.peers.try_send(msg) {
                    out.overflow.notify_one();
                }
            }
            Err(e) => log::error!("failed to encode event for view {view_id}: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.snapshot_dir.is_none());
        assert_eq!(config.controller_config(), ControllerConfig::default());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_with_snapshot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot_dir: Some(dir.path().join("snapshots")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(dir.path().join("snapshots").is_dir());

        let controller = server.registry().get_or_create(Uuid::new_v4()).await.unwrap();
        assert!(controller.has_snapshot_store());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    fn outbound(capacity: usize) -> (Outbound, watch::Receiver<Option<Arc<DiagramState>>>, mpsc::Receiver<SyncMessage>) {
        let (states_tx, states_rx) = watch::channel(None);
        let (peers_tx, peers_rx) = mpsc::channel(capacity);
        let out = Outbound {
            states: Arc::new(states_tx),
            peers: peers_tx,
            overflow: Arc::new(Notify::new()),
        };
        (out, states_rx, peers_rx)
    }

    #[test]
    fn test_forward_to_encodes_peer_events() {
        let (out, _states, mut peers) = outbound(4);
        let view = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let observer = forward_to(out, view, diagram);

        observer(&ViewEvent::PeerJoined(ViewInfo::new("bob", "Bob")));
        let msg = peers.try_recv().unwrap();
        assert_eq!(msg.msg_type, MessageType::PeerJoined);
        assert_eq!(msg.view_id, view);
        assert_eq!(msg.diagram_id, diagram);
    }

    #[test]
    fn test_forward_to_keeps_only_latest_state() {
        let (out, mut states, _peers) = outbound(4);
        let observer = forward_to(out, Uuid::new_v4(), Uuid::new_v4());

        for version in 1..=50 {
            let mut state = DiagramState::new();
            state.version = version;
            observer(&ViewEvent::StateReplaced(Arc::new(state)));
        }
        assert!(states.has_changed().unwrap());
        let latest = states.borrow_and_update().clone().unwrap();
        assert_eq!(latest.version, 50);
        assert!(!states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_forward_to_signals_overflow() {
        let (out, _states, mut peers) = outbound(2);
        let overflow = Arc::clone(&out.overflow);
        let observer = forward_to(out, Uuid::new_v4(), Uuid::new_v4());

        for n in 0..3 {
            observer(&ViewEvent::PeerJoined(ViewInfo::new(format!("u{n}"), "U")));
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), overflow.notified())
            .await
            .expect("overflow not signalled");
        assert!(peers.try_recv().is_ok());
        assert!(peers.try_recv().is_ok());
        assert!(peers.try_recv().is_err());
    }
}
