//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, leave, reconnect with catch-up)
//! - Operation submission with per-author vector clocks
//! - Presence heartbeats with cursor throttling
//! - Offline queue for operations submitted while disconnected
//!
//! On reconnect the client joins with `since` set to the highest sequence
//! it has contiguously observed, so the server replays whatever it missed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::SessionEvent;
use crate::error::{CollabError, CollabResult};
use crate::model::{
    now_millis, Operation, OperationId, Participant, PresenceRecord, PresenceUpdate, Role,
    Session, SessionId, UserId, VectorClock,
};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Minimum spacing between cursor heartbeats (~30 per second).
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(33);

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Join accepted
    Joined {
        session: Session,
        role: Role,
        participants: Vec<Participant>,
        presence: Vec<PresenceRecord>,
        tail: u64,
    },
    /// An operation appended by someone else (or replayed after reconnect)
    Operation(Operation),
    /// Our submission was recorded at `sequence`
    OperationAcked { request_id: u64, sequence: u64 },
    /// Presence of another participant changed
    Presence(PresenceRecord),
    ParticipantJoined(Participant),
    RoleChanged(Participant),
    /// Our role change request was accepted
    RoleChangeAccepted { request_id: u64 },
    SessionClosed,
    /// A request failed; `request_id` is `None` for unsolicited errors
    Error {
        request_id: Option<u64>,
        error: CollabError,
    },
    Pong,
    /// Connection lost
    Disconnected,
}

/// Returned by [`SyncClient::submit_operation`]. The ack, or the error,
/// carries the same `request_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitTicket {
    pub request_id: u64,
    pub operation_id: OperationId,
    /// True when the operation was queued for the next join.
    pub queued: bool,
}

// ─── Offline queue ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingOperation {
    request_id: u64,
    operation_id: OperationId,
    op_type: String,
    payload: Vec<u8>,
    vector_clock: VectorClock,
}

impl PendingOperation {
    fn to_message(&self) -> ClientMessage {
        ClientMessage::SubmitOperation {
            request_id: self.request_id,
            operation_id: Some(self.operation_id),
            op_type: self.op_type.clone(),
            payload: self.payload.clone(),
            vector_clock: self.vector_clock.clone(),
        }
    }
}

/// Operations submitted while disconnected, sent in order after the
/// next successful join.
pub struct OfflineQueue {
    queue: VecDeque<PendingOperation>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    fn enqueue(&mut self, op: PendingOperation) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(op);
        true
    }

    fn drain(&mut self) -> Vec<PendingOperation> {
        self.queue.drain(..).collect()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total payload bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|op| op.payload.len()).sum()
    }
}

// ─── Delivery bookkeeping ───────────────────────────────────────────

/// Highest sequence below which every operation has been seen, plus the
/// sequences seen out of order above it.
#[derive(Debug, Default)]
struct SequenceWatermark {
    last: u64,
    ahead: BTreeSet<u64>,
    joined: bool,
}

impl SequenceWatermark {
    /// Record `sequence`; false when it was already seen.
    fn observe(&mut self, sequence: u64) -> bool {
        if sequence <= self.last || !self.ahead.insert(sequence) {
            return false;
        }
        while self.ahead.remove(&(self.last + 1)) {
            self.last += 1;
        }
        true
    }

    /// First join starts at the server's tail.
    fn joined_at(&mut self, tail: u64) {
        if !self.joined {
            self.joined = true;
            self.last = self.last.max(tail);
            self.ahead.retain(|&s| s > tail);
        }
    }

    fn resume_from(&self) -> Option<u64> {
        self.joined.then_some(self.last)
    }
}

/// Drops presence updates older than the last one applied per user.
#[derive(Debug, Default)]
struct PresenceFilter {
    latest: HashMap<UserId, PresenceRecord>,
}

impl PresenceFilter {
    fn admit(&mut self, record: &PresenceRecord) -> bool {
        if let Some(current) = self.latest.get(&record.user_id) {
            if !record.supersedes(current) {
                return false;
            }
        }
        self.latest.insert(record.user_id, record.clone());
        true
    }
}

/// Rate limit for online heartbeats.
#[derive(Debug)]
struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl CursorThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    fn admit(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

/// State shared with the reader task.
struct Shared {
    user_id: UserId,
    state: RwLock<ClientState>,
    clock: RwLock<VectorClock>,
    watermark: Mutex<SequenceWatermark>,
    presence: Mutex<PresenceFilter>,
}

// ─── Client ─────────────────────────────────────────────────────────

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server for one
/// user in one session.
pub struct SyncClient {
    session_id: SessionId,
    server_url: String,
    shared: Arc<Shared>,

    /// Offline queue for disconnected submissions
    offline_queue: Arc<Mutex<OfflineQueue>>,

    throttle: Mutex<CursorThrottle>,
    next_request_id: AtomicU64,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,

    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a new client.
    pub fn new(session_id: SessionId, user_id: UserId, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            session_id,
            server_url: server_url.into(),
            shared: Arc::new(Shared {
                user_id,
                state: RwLock::new(ClientState::Disconnected),
                clock: RwLock::new(VectorClock::new()),
                watermark: Mutex::new(SequenceWatermark::default()),
                presence: Mutex::new(PresenceFilter::default()),
            }),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            throttle: Mutex::new(CursorThrottle::new(CURSOR_THROTTLE)),
            next_request_id: AtomicU64::new(1),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the session.
    ///
    /// After a previous join the client resumes from the last sequence it
    /// observed; queued offline operations are sent once the join is
    /// accepted.
    pub async fn connect(&mut self) -> CollabResult<()> {
        self.shutdown_tasks();
        *self.shared.state.write().await = ClientState::Connecting;

        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.shared.state.write().await = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> CollabResult<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.server_url.as_str())
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let since = self.shared.watermark.lock().await.resume_from();
        let join = ClientMessage::Join {
            session_id: self.session_id,
            user_id: self.shared.user_id,
            since,
        }
        .encode()?;
        ws_writer
            .send(Message::Binary(join.into()))
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;

        let reply = tokio::time::timeout(JOIN_TIMEOUT, next_server_message(&mut ws_reader))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        let joined = match reply {
            ServerMessage::Joined {
                session,
                role,
                participants,
                presence,
                tail,
            } => {
                self.shared.watermark.lock().await.joined_at(tail);
                {
                    let mut filter = self.shared.presence.lock().await;
                    for record in &presence {
                        filter.admit(record);
                    }
                }
                ClientEvent::Joined {
                    session,
                    role,
                    participants,
                    presence,
                    tail,
                }
            }
            ServerMessage::Error { kind, message, .. } => {
                return Err(CollabError::from_kind(kind, message));
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!("{other:?}")).into());
            }
        };
        log::info!(
            "Joined session {} as {} (resuming from {since:?})",
            self.session_id,
            self.shared.user_id
        );

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.tasks.push(writer);

        // Queue first so nothing sent by the flush races ahead of it
        let _ = self.event_tx.send(joined).await;
        *self.shared.state.write().await = ClientState::Connected;

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
            for op in &queued {
                let encoded = op.to_message().encode()?;
                if out_tx.send(encoded).await.is_err() {
                    return Err(ProtocolError::ConnectionClosed.into());
                }
            }
        }
        self.outgoing_tx = Some(out_tx);

        // Reader task: process incoming server messages
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                let msg = match next_server_message(&mut ws_reader).await {
                    Ok(msg) => msg,
                    Err(ProtocolError::DeserializationError(e)) => {
                        log::warn!("Failed to decode server message: {e}");
                        continue;
                    }
                    Err(_) => break,
                };
                if let Some(event) = shared.handle(msg).await {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }

            // Connection lost
            *shared.state.write().await = ClientState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        self.tasks.push(reader);
        Ok(())
    }

    /// Submit an operation.
    ///
    /// Ticks this user's vector clock. While disconnected the operation is
    /// queued and sent after the next join.
    pub async fn submit_operation(
        &self,
        op_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> CollabResult<SubmitTicket> {
        let vector_clock = {
            let mut clock = self.shared.clock.write().await;
            clock.tick(self.shared.user_id);
            clock.clone()
        };
        let op = PendingOperation {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            operation_id: Uuid::new_v4(),
            op_type: op_type.into(),
            payload,
            vector_clock,
        };
        let mut ticket = SubmitTicket {
            request_id: op.request_id,
            operation_id: op.operation_id,
            queued: false,
        };

        if self.connection_state().await == ClientState::Connected {
            if let Some(ref tx) = self.outgoing_tx {
                let encoded = op.to_message().encode()?;
                if tx.send(encoded).await.is_ok() {
                    return Ok(ticket);
                }
            }
        }

        // Queue for offline replay
        if !self.offline_queue.lock().await.enqueue(op) {
            return Err(CollabError::Unavailable("offline queue full".into()));
        }
        ticket.queued = true;
        Ok(ticket)
    }

    /// Send a presence heartbeat.
    ///
    /// Online heartbeats closer together than [`CURSOR_THROTTLE`] are
    /// dropped; offline ones always go out. Returns whether the heartbeat
    /// was sent. Presence is not queued while disconnected.
    pub async fn update_presence(&self, update: PresenceUpdate) -> CollabResult<bool> {
        if self.connection_state().await != ClientState::Connected {
            return Ok(false);
        }
        if update.online && !self.throttle.lock().await.admit(Instant::now()) {
            log::trace!("Throttled cursor update for {}", self.shared.user_id);
            return Ok(false);
        }
        let timestamp = update.timestamp.unwrap_or_else(now_millis);
        self.send(&ClientMessage::heartbeat(&update, timestamp)).await?;
        Ok(true)
    }

    /// Ask the server to change `target`'s role. Owner only.
    pub async fn change_role(&self, target: UserId, role: Role) -> CollabResult<u64> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.send(&ClientMessage::ChangeRole {
            request_id,
            target,
            role,
        })
        .await?;
        Ok(request_id)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> CollabResult<()> {
        self.send(&ClientMessage::Ping).await
    }

    /// Leave the session and close the connection.
    pub async fn leave(&mut self) -> CollabResult<()> {
        if self.connection_state().await == ClientState::Connected {
            self.send(&ClientMessage::Leave).await?;
        }
        *self.shared.state.write().await = ClientState::Disconnected;
        // Dropping the sender lets the writer flush Leave and close
        self.outgoing_tx = None;
        Ok(())
    }

    async fn send(&self, msg: &ClientMessage) -> CollabResult<()> {
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed.into()),
            None => Err(ProtocolError::ConnectionClosed.into()),
        }
    }

    fn shutdown_tasks(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ClientState {
        *self.shared.state.read().await
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.shared.user_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Snapshot of the local vector clock.
    pub async fn clock(&self) -> VectorClock {
        self.shared.clock.read().await.clone()
    }

    /// Highest sequence up to which every operation has been observed.
    pub async fn last_sequence(&self) -> u64 {
        self.shared.watermark.lock().await.last
    }

    /// Get offline queue length.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Shared {
    /// Turn a server message into an application event, or `None` if it
    /// is a duplicate or stale.
    async fn handle(&self, msg: ServerMessage) -> Option<ClientEvent> {
        match msg {
            ServerMessage::Event(event) => self.handle_event(event).await,
            ServerMessage::OperationAck {
                request_id,
                sequence,
            } => {
                self.watermark.lock().await.observe(sequence);
                Some(ClientEvent::OperationAcked {
                    request_id,
                    sequence,
                })
            }
            ServerMessage::RoleChanged { request_id } => {
                Some(ClientEvent::RoleChangeAccepted { request_id })
            }
            ServerMessage::Error {
                request_id,
                kind,
                message,
            } => Some(ClientEvent::Error {
                request_id,
                error: CollabError::from_kind(kind, message),
            }),
            ServerMessage::Pong => Some(ClientEvent::Pong),
            ServerMessage::Joined { .. } => {
                log::debug!("Ignoring unexpected Joined frame");
                None
            }
        }
    }

    async fn handle_event(&self, event: SessionEvent) -> Option<ClientEvent> {
        match event {
            SessionEvent::OperationAppended(op) => {
                if !self.watermark.lock().await.observe(op.sequence) {
                    return None;
                }
                self.clock.write().await.merge(&op.vector_clock);
                Some(ClientEvent::Operation(op))
            }
            SessionEvent::PresenceChanged(record) => {
                if !self.presence.lock().await.admit(&record) {
                    log::trace!("Discarding out-of-order presence of {}", record.user_id);
                    return None;
                }
                if record.user_id == self.user_id && !record.online {
                    // The server detached us
                    *self.state.write().await = ClientState::Disconnected;
                }
                Some(ClientEvent::Presence(record))
            }
            SessionEvent::ParticipantJoined(p) => Some(ClientEvent::ParticipantJoined(p)),
            SessionEvent::RoleChanged(p) => Some(ClientEvent::RoleChanged(p)),
            SessionEvent::SessionClosed { .. } => {
                *self.state.write().await = ClientState::Disconnected;
                Some(ClientEvent::SessionClosed)
            }
        }
    }
}

/// Next decodable server frame, skipping control frames.
async fn next_server_message<S, E>(reader: &mut S) -> Result<ServerMessage, ProtocolError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(data))) => return ServerMessage::decode(&data),
            Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ProtocolError::ConnectionFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: UserId, last_heartbeat: u64) -> PresenceRecord {
        PresenceRecord {
            session_id: Uuid::nil(),
            user_id,
            online: true,
            cursor: None,
            selection: Vec::new(),
            last_heartbeat,
        }
    }

    #[test]
    fn test_client_creation() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let client = SyncClient::new(session_id, user_id, "ws://localhost:9090");

        assert_eq!(client.session_id(), session_id);
        assert_eq!(client.user_id(), user_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");

        assert_eq!(client.connection_state().await, ClientState::Disconnected);
        assert!(client.clock().await.is_empty());
        assert_eq!(client.last_sequence().await, 0);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_submit_offline_queues_and_ticks_clock() {
        let user_id = Uuid::new_v4();
        let client = SyncClient::new(Uuid::new_v4(), user_id, "ws://localhost:9090");

        let first = client.submit_operation("add_node", vec![1, 2, 3]).await.unwrap();
        let second = client.submit_operation("add_node", vec![4, 5, 6]).await.unwrap();
        assert!(first.queued && second.queued);
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(client.offline_queue_len().await, 2);
        assert_eq!(client.clock().await.get(&user_id), 2);
    }

    #[tokio::test]
    async fn test_presence_offline_noop() {
        let client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        assert!(!client.update_presence(PresenceUpdate::online()).await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), format!("ws://127.0.0.1:{port}"));
        let err = client.connect().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.connection_state().await, ClientState::Disconnected);
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        let op = |n: u8| PendingOperation {
            request_id: n as u64,
            operation_id: Uuid::new_v4(),
            op_type: "draw_stroke".into(),
            payload: vec![n; 3],
            vector_clock: VectorClock::new(),
        };
        assert!(queue.enqueue(op(1)));
        assert!(queue.enqueue(op(2)));
        assert!(!queue.enqueue(op(3))); // Full
        assert_eq!(queue.total_bytes(), 6);

        let drained = queue.drain();
        assert_eq!(drained.iter().map(|o| o.request_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_watermark_advances_over_gaps() {
        let mut w = SequenceWatermark::default();
        w.joined_at(3);
        assert_eq!(w.resume_from(), Some(3));

        assert!(w.observe(5));
        assert_eq!(w.last, 3);
        assert!(w.observe(4));
        assert_eq!(w.last, 5);
        assert!(!w.observe(4));
        assert!(!w.observe(5));
        assert!(w.observe(6));
        assert_eq!(w.last, 6);
    }

    #[test]
    fn test_watermark_rejoin_keeps_position() {
        let mut w = SequenceWatermark::default();
        assert_eq!(w.resume_from(), None);
        w.joined_at(10);
        w.observe(11);
        // A later join does not jump to the new tail
        w.joined_at(20);
        assert_eq!(w.resume_from(), Some(11));
    }

    #[test]
    fn test_presence_filter_discards_older() {
        let user = Uuid::new_v4();
        let mut filter = PresenceFilter::default();
        assert!(filter.admit(&record(user, 100)));
        assert!(!filter.admit(&record(user, 90)));
        assert!(filter.admit(&record(user, 100)));
        assert!(filter.admit(&record(Uuid::new_v4(), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_throttle() {
        let mut throttle = CursorThrottle::new(CURSOR_THROTTLE);
        assert!(throttle.admit(Instant::now()));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!throttle.admit(Instant::now()));
        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(throttle.admit(Instant::now()));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
