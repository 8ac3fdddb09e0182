//! Session coordinator: the public entry point composing the session
//! store, operation log, presence tracker and event bus.
//!
//! Each client attachment to a session is a [`Connection`] with its own
//! state machine:
//!
//! ```text
//!                 join()                 Ok
//!  Disconnected ─────────► Joining ─────────────► Connected
//!       ▲                     │ NotFound / denied     │
//!       │                     ▼                       │ leave(), session closed,
//!       └──────────────── Disconnected                │ or presence expired
//!       │                                             ▼
//!       └──────────────────────────────────────── Leaving
//! ```
//!
//! A connection consumes the session's broadcast channel. Operations are
//! delivered in append order exactly once per connection: duplicates are
//! dropped by sequence, and a lagged or gapped channel is repaired by
//! replaying the operation log from the last delivered sequence.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{Delivery, EventBus, LocalBus, SessionEvent, Subscription, SubscriptionHandle};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::model::{
    DocumentType, Operation, OperationDraft, Participant, PresenceRecord, PresenceUpdate, Role,
    Session, SessionId, UserId,
};
use crate::oplog::OperationLog;
use crate::presence::{PresenceTracker, SweeperHandle};
use crate::session::{AllowAll, CapabilityCheck, SessionStore};
use crate::storage::{CollabStore, MemoryStore};

pub struct SessionCoordinator {
    config: CollabConfig,
    bus: Arc<dyn EventBus>,
    sessions: SessionStore,
    log: OperationLog,
    presence: Arc<PresenceTracker>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn CollabStore>,
        bus: Arc<dyn EventBus>,
        capability: Arc<dyn CapabilityCheck>,
        config: CollabConfig,
    ) -> Self {
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            bus.clone(),
            config.presence.clone(),
        ));
        let sessions = SessionStore::new(
            store.clone(),
            bus.clone(),
            presence.clone(),
            capability,
            config.retry.clone(),
        );
        let log = OperationLog::new(store, bus.clone(), config.clone());
        Self {
            config,
            bus,
            sessions,
            log,
            presence,
        }
    }

    /// Memory store, in-process bus, no capability gate.
    pub fn in_memory(config: CollabConfig) -> Self {
        let bus = Arc::new(LocalBus::new(config.broadcast_capacity));
        Self::new(Arc::new(MemoryStore::new()), bus, Arc::new(AllowAll), config)
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Start the background staleness sweep.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        self.presence.spawn_sweeper()
    }

    /// A new, not yet joined connection of `user_id` to `session_id`.
    pub fn connect(self: &Arc<Self>, session_id: SessionId, user_id: UserId) -> Arc<Connection> {
        Arc::new(Connection::new(self.clone(), session_id, user_id))
    }

    // ─── Session-level operations ─────────────────────────────────────

    pub async fn create_session(
        &self,
        name: &str,
        document_type: DocumentType,
        owner_id: UserId,
    ) -> CollabResult<Session> {
        self.sessions.create_session(name, document_type, owner_id).await
    }

    pub async fn get_session(&self, session_id: SessionId) -> CollabResult<Session> {
        self.sessions.get_session(session_id).await
    }

    pub async fn list_participants(&self, session_id: SessionId) -> CollabResult<Vec<Participant>> {
        self.sessions.list_participants(session_id).await
    }

    pub async fn list_user_sessions(&self, user_id: UserId) -> CollabResult<Vec<Session>> {
        self.sessions.list_user_sessions(user_id).await
    }

    pub async fn change_role(
        &self,
        session_id: SessionId,
        actor_id: UserId,
        target_id: UserId,
        role: Role,
    ) -> CollabResult<Participant> {
        self.sessions
            .update_participant_role(session_id, actor_id, target_id, role)
            .await
    }

    pub async fn update_session_settings(
        &self,
        session_id: SessionId,
        actor_id: UserId,
        settings: BTreeMap<String, String>,
    ) -> CollabResult<Session> {
        self.sessions
            .update_session_settings(session_id, actor_id, settings)
            .await
    }

    pub async fn deactivate_session(&self, session_id: SessionId, actor_id: UserId) -> CollabResult<Session> {
        self.sessions.deactivate_session(session_id, actor_id).await
    }

    pub fn presence_snapshot(&self, session_id: SessionId) -> Vec<PresenceRecord> {
        self.presence.snapshot(session_id)
    }

    pub async fn operations_since(&self, session_id: SessionId, after: u64) -> CollabResult<Vec<Operation>> {
        self.log.operations_since(session_id, after).await
    }
}

// ─── Connection ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Joining,
    Connected,
    Leaving,
}

/// What a successful join returns.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub session: Session,
    pub participant: Participant,
    pub participants: Vec<Participant>,
    pub presence: Vec<PresenceRecord>,
    /// Last sequence in the log at join time.
    pub tail: u64,
}

/// Receiving side of a connection.
struct Inbox {
    subscription: Option<Subscription>,
    /// Highest operation sequence delivered or skipped.
    last_seen: u64,
    pending: VecDeque<SessionEvent>,
}

/// One attachment of a user to a session.
pub struct Connection {
    id: Uuid,
    session_id: SessionId,
    user_id: UserId,
    coordinator: Arc<SessionCoordinator>,
    state: Mutex<ConnectionState>,
    /// Kept outside the inbox so `leave` can cancel a pending receive.
    handle: Mutex<Option<SubscriptionHandle>>,
    inbox: tokio::sync::Mutex<Inbox>,
}

impl Connection {
    fn new(coordinator: Arc<SessionCoordinator>, session_id: SessionId, user_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id,
            coordinator,
            state: Mutex::new(ConnectionState::Disconnected),
            handle: Mutex::new(None),
            inbox: tokio::sync::Mutex::new(Inbox {
                subscription: None,
                last_seen: 0,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Join the session.
    ///
    /// With `since = Some(n)` every operation after sequence `n` is queued
    /// for delivery before live events; with `None` delivery starts at the
    /// current tail.
    pub async fn join(&self, since: Option<u64>) -> CollabResult<JoinInfo> {
        self.transition(ConnectionState::Disconnected, ConnectionState::Joining)?;
        match self.try_join(since).await {
            Ok(info) => {
                self.set_state(ConnectionState::Connected);
                log::info!(
                    "Connection {} of {} joined session {} as {}",
                    self.id,
                    self.user_id,
                    self.session_id,
                    info.participant.role
                );
                Ok(info)
            }
            Err(e) => {
                self.release_subscription();
                self.inbox.lock().await.subscription = None;
                self.set_state(ConnectionState::Disconnected);
                log::debug!("Join of {} to session {} failed: {e}", self.user_id, self.session_id);
                Err(e)
            }
        }
    }

    async fn try_join(&self, since: Option<u64>) -> CollabResult<JoinInfo> {
        let c = &self.coordinator;
        let mut inbox = self.inbox.lock().await;

        // Unknown or closed sessions fail before any per-session state exists
        c.sessions.active_session(self.session_id).await?;

        // Subscribe before reading the tail so nothing appended during the
        // join is missed
        let subscription = c.bus.subscribe(self.session_id, self.user_id)?;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription.handle());
        inbox.subscription = Some(subscription);
        inbox.pending.clear();

        let participant = c.sessions.join_session(self.session_id, self.user_id).await?;
        let session = c.sessions.get_session(self.session_id).await?;
        c.presence.join(self.session_id, self.user_id);

        let tail = c.log.tail(self.session_id).await?;
        match since {
            Some(after) if after < tail => {
                let backlog = c.log.operations_since(self.session_id, after).await?;
                inbox.last_seen = backlog.last().map_or(after, |op| op.sequence);
                inbox
                    .pending
                    .extend(backlog.into_iter().map(SessionEvent::OperationAppended));
            }
            _ => inbox.last_seen = tail,
        }

        Ok(JoinInfo {
            session,
            participant,
            participants: c.sessions.list_participants(self.session_id).await?,
            presence: c.presence.snapshot(self.session_id),
            tail,
        })
    }

    /// Append an operation. The log rejects viewers with `PermissionDenied`.
    pub async fn send_operation(&self, draft: OperationDraft) -> CollabResult<Operation> {
        self.require_connected()?;
        self.coordinator
            .log
            .append(self.session_id, self.user_id, draft)
            .await
    }

    /// Refresh this user's presence. Returns false if the update was older
    /// than one already applied.
    pub fn heartbeat(&self, update: PresenceUpdate) -> CollabResult<bool> {
        self.require_connected()?;
        Ok(self
            .coordinator
            .presence
            .heartbeat(self.session_id, self.user_id, update))
    }

    pub async fn change_role(&self, target_id: UserId, role: Role) -> CollabResult<Participant> {
        self.require_connected()?;
        self.coordinator
            .change_role(self.session_id, self.user_id, target_id, role)
            .await
    }

    /// Record that the consumer durably applied operation `sequence`.
    pub async fn acknowledge_applied(&self, sequence: u64) -> CollabResult<()> {
        self.coordinator.log.mark_applied(self.session_id, sequence).await
    }

    /// Next event for this connection; `None` once it is disconnected.
    pub async fn next_event(&self) -> Option<SessionEvent> {
        let mut inbox = self.inbox.lock().await;
        loop {
            if let Some(event) = inbox.pending.pop_front() {
                return Some(event);
            }
            if !self.is_connected() {
                return None;
            }
            let delivery = match inbox.subscription.as_mut() {
                Some(subscription) => subscription.recv().await,
                None => None,
            };
            match delivery {
                None => {
                    inbox.subscription = None;
                    self.disconnect_quietly();
                    return None;
                }
                Some(Delivery::Lagged(skipped)) => {
                    log::debug!(
                        "Connection {} lagged by {skipped}; replaying from #{}",
                        self.id,
                        inbox.last_seen
                    );
                    self.catch_up(&mut inbox).await;
                }
                Some(Delivery::Event(event)) => {
                    if let Some(event) = self.accept(&mut inbox, &event).await {
                        return Some(event);
                    }
                }
            }
        }
    }

    /// Leave the session. Always ends `Disconnected`.
    pub async fn leave(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Disconnected | ConnectionState::Leaving => return,
                _ => *state = ConnectionState::Leaving,
            }
        }
        self.release_subscription();
        if let Err(e) = self
            .coordinator
            .sessions
            .leave_session(self.session_id, self.user_id)
            .await
        {
            log::warn!("Leave of {} from session {} failed: {e}", self.user_id, self.session_id);
        }
        self.inbox.lock().await.subscription = None;
        self.set_state(ConnectionState::Disconnected);
        log::info!("Connection {} of {} left session {}", self.id, self.user_id, self.session_id);
    }

    /// Feed delivered operations to `applier` on a background task until
    /// the connection disconnects.
    pub fn attach<A: OperationApplier>(self: &Arc<Self>, mut applier: A) -> ApplierHandle {
        let connection = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = connection.next_event().await {
                match &event {
                    SessionEvent::OperationAppended(op) => applier.apply(op),
                    other => applier.on_event(other),
                }
            }
        });
        ApplierHandle { task }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Filter one broadcast event; `None` means nothing to deliver yet.
    async fn accept(&self, inbox: &mut Inbox, event: &SessionEvent) -> Option<SessionEvent> {
        match event {
            SessionEvent::OperationAppended(op) => {
                if op.sequence <= inbox.last_seen {
                    return None;
                }
                if op.sequence > inbox.last_seen + 1 {
                    self.catch_up(inbox).await;
                    return None;
                }
                inbox.last_seen = op.sequence;
                self.wants(op).then(|| event.clone())
            }
            SessionEvent::PresenceChanged(record) if record.user_id == self.user_id => {
                if record.online {
                    return None;
                }
                // Swept or left elsewhere
                log::info!(
                    "Presence of {} in session {} expired; disconnecting {}",
                    self.user_id,
                    self.session_id,
                    self.id
                );
                self.set_state(ConnectionState::Leaving);
                self.release_subscription();
                inbox.subscription = None;
                self.set_state(ConnectionState::Disconnected);
                Some(event.clone())
            }
            SessionEvent::SessionClosed { .. } => {
                self.set_state(ConnectionState::Leaving);
                self.release_subscription();
                inbox.subscription = None;
                self.set_state(ConnectionState::Disconnected);
                Some(event.clone())
            }
            _ => Some(event.clone()),
        }
    }

    /// Queue every operation after `last_seen` from the log.
    async fn catch_up(&self, inbox: &mut Inbox) {
        match self
            .coordinator
            .log
            .operations_since(self.session_id, inbox.last_seen)
            .await
        {
            Ok(ops) => {
                for op in ops {
                    inbox.last_seen = op.sequence;
                    if self.wants(&op) {
                        inbox.pending.push_back(SessionEvent::OperationAppended(op));
                    }
                }
            }
            Err(e) => log::warn!(
                "Replay for connection {} in session {} failed: {e}",
                self.id,
                self.session_id
            ),
        }
    }

    fn wants(&self, op: &Operation) -> bool {
        self.coordinator.config.echo_own_operations || op.author_id != self.user_id
    }

    fn require_connected(&self) -> CollabResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(CollabError::invalid(format!(
                "connection {} is {state:?}",
                self.id
            ))),
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> CollabResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(CollabError::invalid(format!(
                "connection {} is {:?}, expected {from:?}",
                self.id, *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    fn release_subscription(&self) {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            self.coordinator.bus.unsubscribe(&handle);
        }
    }

    /// Channel ended under us. A concurrent `leave` owns the final
    /// transition.
    fn disconnect_quietly(&self) {
        self.release_subscription();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Disconnected;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release_subscription();
    }
}

// ─── Operation application ──────────────────────────────────────────

/// Document-specific consumer of delivered operations.
pub trait OperationApplier: Send + 'static {
    fn apply(&mut self, op: &Operation);

    /// Non-operation events (presence, membership, close).
    fn on_event(&mut self, _event: &SessionEvent) {}
}

impl<F> OperationApplier for F
where
    F: FnMut(&Operation) + Send + 'static,
{
    fn apply(&mut self, op: &Operation) {
        self(op)
    }
}

/// Background task started by [`Connection::attach`]; aborted on drop.
pub struct ApplierHandle {
    task: JoinHandle<()>,
}

impl ApplierHandle {
    /// Wait for the connection to disconnect.
    pub async fn finished(mut self) {
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ApplierHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
