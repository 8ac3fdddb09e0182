//! WebSocket server exposing the session coordinator.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── SessionStore ──┐
//!             ├── Connection (per socket)┼── OperationLog ──┼── dyn CollabStore
//! Client B ──┘        │                 └── Presence ──────┘   (RocksDB | memory)
//!                     │
//!                     └── next_event() ◄── EventBus (per session)
//! ```
//!
//! A socket starts unattached. Its first request must be `Join`; after
//! that it carries operations, heartbeats and role changes for that one
//! session. `Leave` ends the socket. When the session closes or the
//! user's presence expires the socket stays open and may `Join` again.
//!
//! Closing the socket without `Leave` does not mark the user offline:
//! the presence sweep does that once heartbeats stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub use crate::config::ServerConfig;

use crate::broadcast::{LocalBus, SessionEvent};
use crate::coordinator::{Connection, SessionCoordinator};
use crate::error::CollabError;
use crate::model::{OperationDraft, PresenceUpdate};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::AllowAll;
use crate::storage::{CollabStore, MemoryStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub joins: u64,
    pub operations_appended: u64,
    /// Requests answered with an error frame.
    pub rejected_requests: u64,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn CollabStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Persistent storage opened at {}", path.display());
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let bus = Arc::new(LocalBus::new(config.collab.broadcast_capacity));
        let coordinator =
            SessionCoordinator::new(store, bus, Arc::new(AllowAll), config.collab.clone());
        Ok(Self::with_coordinator(config, Arc::new(coordinator)))
    }

    /// Serve an existing coordinator (custom store, bus or capability gate).
    pub fn with_coordinator(config: ServerConfig, coordinator: Arc<SessionCoordinator>) -> Self {
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default config.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let coordinator = SessionCoordinator::in_memory(config.collab.clone());
        Self::with_coordinator(config, Arc::new(coordinator))
    }

    /// Bind to `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Collab server listening on {}", listener.local_addr()?);
        let _sweeper = self.coordinator.spawn_sweeper();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<SessionCoordinator>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut attached: Option<Attached> = None;
        let mut ping = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        ping.tick().await;

        let result: Result<(), BoxError> = async {
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
                                let request = match ClientMessage::decode(&data) {
                                    Ok(request) => request,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        let err = CollabError::invalid(e.to_string());
                                        reply(&mut ws_sender, &ServerMessage::error(None, &err)).await?;
                                        stats.write().await.rejected_requests += 1;
                                        continue;
                                    }
                                };
                                let flow = Self::dispatch(
                                    request,
                                    &coordinator,
                                    &mut attached,
                                    &stats,
                                    &mut ws_sender,
                                    config.collab.broadcast_capacity,
                                )
                                .await?;
                                if flow == Flow::Close {
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    break;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Text(_))) => {
                                log::warn!("Ignoring text frame from {addr}");
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Events forwarded from the attached connection
                    event = async {
                        match attached.as_mut() {
                            Some(a) => a.events.recv().await,
                            // Not joined yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Some(event) => {
                                reply(&mut ws_sender, &ServerMessage::Event(event)).await?;
                            }
                            None => {
                                // Session closed or presence expired; the socket may join again
                                if let Some(a) = attached.take() {
                                    log::info!(
                                        "Connection {} detached from session {}",
                                        a.connection.id(),
                                        a.connection.session_id()
                                    );
                                }
                            }
                        }
                    }

                    _ = ping.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        // Socket gone without Leave: presence stays until swept
        drop(attached);

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        result
    }

    /// Handle one decoded request.
    async fn dispatch<S>(
        request: ClientMessage,
        coordinator: &Arc<SessionCoordinator>,
        attached: &mut Option<Attached>,
        stats: &RwLock<ServerStats>,
        ws_sender: &mut S,
        event_buffer: usize,
    ) -> Result<Flow, BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        if let ClientMessage::Ping = request {
            reply(ws_sender, &ServerMessage::Pong).await?;
            return Ok(Flow::Continue);
        }

        if let ClientMessage::Join {
            session_id,
            user_id,
            since,
        } = request
        {
            if attached.is_some() {
                let err = CollabError::invalid("already joined a session");
                stats.write().await.rejected_requests += 1;
                reply(ws_sender, &ServerMessage::error(None, &err)).await?;
                return Ok(Flow::Continue);
            }
            let connection = coordinator.connect(session_id, user_id);
            match connection.join(since).await {
                Ok(info) => {
                    stats.write().await.joins += 1;
                    reply(
                        ws_sender,
                        &ServerMessage::Joined {
                            session: info.session,
                            role: info.participant.role,
                            participants: info.participants,
                            presence: info.presence,
                            tail: info.tail,
                        },
                    )
                    .await?;
                    *attached = Some(Attached::start(connection, event_buffer));
                }
                Err(e) => {
                    stats.write().await.rejected_requests += 1;
                    reply(ws_sender, &ServerMessage::error(None, &e)).await?;
                }
            }
            return Ok(Flow::Continue);
        }

        let Some(current) = attached.as_ref() else {
            let err = CollabError::invalid("first request must be Join");
            stats.write().await.rejected_requests += 1;
            reply(ws_sender, &ServerMessage::error(request_id(&request), &err)).await?;
            return Ok(Flow::Continue);
        };
        let connection = current.connection.clone();

        let response = match request {
            ClientMessage::SubmitOperation {
                request_id,
                operation_id,
                op_type,
                payload,
                vector_clock,
            } => {
                let draft = OperationDraft {
                    id: operation_id,
                    op_type,
                    payload,
                    vector_clock,
                };
                match connection.send_operation(draft).await {
                    Ok(op) => {
                        stats.write().await.operations_appended += 1;
                        Some(ServerMessage::OperationAck {
                            request_id,
                            sequence: op.sequence,
                        })
                    }
                    Err(e) => Some(ServerMessage::error(Some(request_id), &e)),
                }
            }
            ClientMessage::Heartbeat {
                online,
                cursor,
                selection,
                timestamp,
            } => {
                let update = PresenceUpdate {
                    online,
                    cursor,
                    selection,
                    timestamp: (timestamp > 0).then_some(timestamp),
                };
                match connection.heartbeat(update) {
                    Ok(_) => None,
                    Err(e) => Some(ServerMessage::error(None, &e)),
                }
            }
            ClientMessage::ChangeRole {
                request_id,
                target,
                role,
            } => match connection.change_role(target, role).await {
                Ok(_) => Some(ServerMessage::RoleChanged { request_id }),
                Err(e) => Some(ServerMessage::error(Some(request_id), &e)),
            },
            ClientMessage::Leave => {
                connection.leave().await;
                *attached = None;
                return Ok(Flow::Close);
            }
            ClientMessage::Join { .. } | ClientMessage::Ping => None,
        };

        if let Some(response) = response {
            if matches!(response, ServerMessage::Error { .. }) {
                stats.write().await.rejected_requests += 1;
            }
            reply(ws_sender, &response).await?;
        }
        Ok(Flow::Continue)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// A joined connection plus the task draining its events.
struct Attached {
    connection: Arc<Connection>,
    events: mpsc::Receiver<SessionEvent>,
    forwarder: JoinHandle<()>,
}

impl Attached {
    fn start(connection: Arc<Connection>, buffer: usize) -> Self {
        let (tx, events) = mpsc::channel(buffer.max(1));
        let source = connection.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = source.next_event().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Self {
            connection,
            events,
            forwarder,
        }
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn request_id(request: &ClientMessage) -> Option<u64> {
    match request {
        ClientMessage::SubmitOperation { request_id, .. }
        | ClientMessage::ChangeRole { request_id, .. } => Some(*request_id),
        _ => None,
    }
}

async fn reply<S>(ws_sender: &mut S, msg: &ServerMessage) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let bytes = msg.encode()?;
    ws_sender.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentType;
    use uuid::Uuid;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            heartbeat_interval_secs: 60,
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        let owner = Uuid::new_v4();
        let session = server
            .coordinator()
            .create_session("Persisted", DocumentType::Whiteboard, owner)
            .await
            .unwrap();
        assert_eq!(
            server.coordinator().get_session(session.id).await.unwrap().name,
            "Persisted"
        );
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.operations_appended, 0);
    }

    #[test]
    fn test_request_id_extraction() {
        let submit = ClientMessage::SubmitOperation {
            request_id: 4,
            operation_id: None,
            op_type: "add_node".into(),
            payload: vec![],
            vector_clock: Default::default(),
        };
        assert_eq!(request_id(&submit), Some(4));
        assert_eq!(request_id(&ClientMessage::Leave), None);
    }
}
