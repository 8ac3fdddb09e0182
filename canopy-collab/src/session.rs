//! Sessions, participants and roles.
//!
//! Mutations of one session's participant table are serialized by a
//! per-session lock; the owner row is written in the same batch as the
//! session itself, so every session always has exactly one owner.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::broadcast::{EventBus, SessionEvent};
use crate::config::RetryPolicy;
use crate::error::{CollabError, CollabResult};
use crate::model::{now_millis, DocumentType, Participant, Role, Session, SessionId, UserId};
use crate::presence::PresenceTracker;
use crate::registry::SessionRegistry;
use crate::retry::with_retry;
use crate::storage::CollabStore;

/// Plan/tier gate consulted before a session is created.
pub trait CapabilityCheck: Send + Sync {
    fn can_collaborate(&self, user_id: UserId) -> bool;
}

impl<F> CapabilityCheck for F
where
    F: Fn(UserId) -> bool + Send + Sync,
{
    fn can_collaborate(&self, user_id: UserId) -> bool {
        self(user_id)
    }
}

/// Grants collaboration to every user.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn can_collaborate(&self, _user_id: UserId) -> bool {
        true
    }
}

pub struct SessionStore {
    store: Arc<dyn CollabStore>,
    bus: Arc<dyn EventBus>,
    presence: Arc<PresenceTracker>,
    capability: Arc<dyn CapabilityCheck>,
    retry: RetryPolicy,
    locks: SessionRegistry<Mutex<()>>,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn CollabStore>,
        bus: Arc<dyn EventBus>,
        presence: Arc<PresenceTracker>,
        capability: Arc<dyn CapabilityCheck>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            bus,
            presence,
            capability,
            retry,
            locks: SessionRegistry::new(),
        }
    }

    /// Create a session with `owner_id` as its sole owner.
    pub async fn create_session(
        &self,
        name: &str,
        document_type: DocumentType,
        owner_id: UserId,
    ) -> CollabResult<Session> {
        if !self.capability.can_collaborate(owner_id) {
            return Err(CollabError::permission_denied(format!(
                "user {owner_id} is not allowed to collaborate"
            )));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(CollabError::invalid("session name is empty"));
        }

        let session = Session::new(name, document_type, owner_id);
        let owner = Participant::new(session.id, owner_id, Role::Owner);
        let store = self.store.clone();
        with_retry(&self.retry, "insert_session", || {
            store.insert_session(&session, &owner)
        })
        .await?;

        log::info!(
            "Created {document_type} session {} '{}' owned by {owner_id}",
            session.id,
            session.name
        );
        Ok(session)
    }

    /// The session, active or not.
    pub async fn get_session(&self, session_id: SessionId) -> CollabResult<Session> {
        self.load_session(session_id)
            .await?
            .ok_or_else(|| CollabError::not_found(format!("session {session_id}")))
    }

    /// Add the user as a viewer. Returns the existing row unchanged if the
    /// user already participates.
    pub async fn join_session(&self, session_id: SessionId, user_id: UserId) -> CollabResult<Participant> {
        let lock = self.lock(session_id).await?;
        let _guard = lock.lock().await;

        self.active_session(session_id).await?;
        if let Some(existing) = self.participant(session_id, user_id).await? {
            return Ok(existing);
        }

        let participant = Participant::new(session_id, user_id, Role::Viewer);
        let store = self.store.clone();
        let rows = [participant.clone()];
        with_retry(&self.retry, "put_participants", || store.put_participants(&rows)).await?;

        log::info!("User {user_id} joined session {session_id} as viewer");
        self.publish(session_id, SessionEvent::ParticipantJoined(participant.clone()));
        Ok(participant)
    }

    /// Mark the user offline and stamp `last_seen`. The participant row is
    /// kept.
    pub async fn leave_session(&self, session_id: SessionId, user_id: UserId) -> CollabResult<()> {
        let lock = self.lock(session_id).await?;
        let _guard = lock.lock().await;

        self.get_session(session_id).await?;
        self.presence.mark_offline(session_id, user_id);

        if let Some(mut participant) = self.participant(session_id, user_id).await? {
            participant.last_seen = now_millis();
            let store = self.store.clone();
            let rows = [participant];
            with_retry(&self.retry, "put_participants", || store.put_participants(&rows)).await?;
        }
        log::info!("User {user_id} left session {session_id}");
        Ok(())
    }

    /// Change `target`'s role. Only the owner may do this, and the owner
    /// role itself can neither be granted nor taken away.
    pub async fn update_participant_role(
        &self,
        session_id: SessionId,
        actor_id: UserId,
        target_id: UserId,
        role: Role,
    ) -> CollabResult<Participant> {
        let lock = self.lock(session_id).await?;
        let _guard = lock.lock().await;

        self.active_session(session_id).await?;
        let actor = self.participant(session_id, actor_id).await?;
        if !actor.is_some_and(|a| a.role.can_manage_roles()) {
            return Err(CollabError::permission_denied(format!(
                "user {actor_id} cannot change roles in session {session_id}"
            )));
        }

        let Some(mut target) = self.participant(session_id, target_id).await? else {
            return Err(CollabError::not_found(format!(
                "participant {target_id} in session {session_id}"
            )));
        };
        if target.role == Role::Owner {
            return Err(CollabError::invalid("the session owner cannot be demoted"));
        }
        if role == Role::Owner {
            return Err(CollabError::invalid("a session has exactly one owner"));
        }
        if target.role == role {
            return Ok(target);
        }

        let previous = target.role;
        target.role = role;
        let store = self.store.clone();
        let rows = [target.clone()];
        with_retry(&self.retry, "put_participants", || store.put_participants(&rows)).await?;

        log::debug!("Session {session_id}: {target_id} changed from {previous} to {role} by {actor_id}");
        self.publish(session_id, SessionEvent::RoleChanged(target.clone()));
        Ok(target)
    }

    /// Participants ordered by join time.
    pub async fn list_participants(&self, session_id: SessionId) -> CollabResult<Vec<Participant>> {
        self.get_session(session_id).await?;
        let store = self.store.clone();
        let mut participants = with_retry(&self.retry, "list_participants", || {
            store.list_participants(session_id)
        })
        .await?;
        participants.sort_by_key(|p| (p.joined_at, p.user_id));
        Ok(participants)
    }

    /// Active sessions the user owns or participates in, oldest first.
    pub async fn list_user_sessions(&self, user_id: UserId) -> CollabResult<Vec<Session>> {
        let store = self.store.clone();
        let ids = with_retry(&self.retry, "sessions_for_user", || {
            store.sessions_for_user(user_id)
        })
        .await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.load_session(id).await? {
                if session.is_active {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by_key(|s| (s.created_at, s.id));
        Ok(sessions)
    }

    /// Close the session for good. Owner only; repeated calls are no-ops.
    pub async fn deactivate_session(&self, session_id: SessionId, actor_id: UserId) -> CollabResult<Session> {
        let lock = self.lock(session_id).await?;
        let _guard = lock.lock().await;

        let mut session = self.get_session(session_id).await?;
        if session.owner_id != actor_id {
            return Err(CollabError::permission_denied(format!(
                "only the owner can deactivate session {session_id}"
            )));
        }
        if !session.is_active {
            return Ok(session);
        }

        session.is_active = false;
        session.updated_at = now_millis();
        let store = self.store.clone();
        with_retry(&self.retry, "update_session", || store.update_session(&session)).await?;

        log::info!("Session {session_id} deactivated by {actor_id}");
        self.publish(session_id, SessionEvent::SessionClosed { session_id });
        self.bus.close_session(session_id);
        Ok(session)
    }

    /// Replace the session's settings. Owner or editor.
    pub async fn update_session_settings(
        &self,
        session_id: SessionId,
        actor_id: UserId,
        settings: BTreeMap<String, String>,
    ) -> CollabResult<Session> {
        let lock = self.lock(session_id).await?;
        let _guard = lock.lock().await;

        let mut session = self.active_session(session_id).await?;
        let actor = self.participant(session_id, actor_id).await?;
        if !actor.is_some_and(|a| a.role.can_write()) {
            return Err(CollabError::permission_denied(format!(
                "user {actor_id} cannot change settings of session {session_id}"
            )));
        }

        session.settings = settings;
        session.updated_at = now_millis();
        let store = self.store.clone();
        with_retry(&self.retry, "update_session", || store.update_session(&session)).await?;
        log::debug!("Session {session_id} settings updated by {actor_id}");
        Ok(session)
    }

    /// The user's participant row, if any.
    pub async fn participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> CollabResult<Option<Participant>> {
        let store = self.store.clone();
        with_retry(&self.retry, "load_participant", || {
            store.load_participant(session_id, user_id)
        })
        .await
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Mutation lock of an existing session. Unknown ids get no slot.
    async fn lock(&self, session_id: SessionId) -> CollabResult<Arc<Mutex<()>>> {
        if let Some(lock) = self.locks.get(&session_id) {
            return Ok(lock);
        }
        self.get_session(session_id).await?;
        Ok(self.locks.get_or_insert_with(session_id, Mutex::default))
    }

    async fn load_session(&self, session_id: SessionId) -> CollabResult<Option<Session>> {
        let store = self.store.clone();
        with_retry(&self.retry, "load_session", || store.load_session(session_id)).await
    }

    /// The session if it exists and is still active; `NotFound` otherwise.
    pub async fn active_session(&self, session_id: SessionId) -> CollabResult<Session> {
        match self.load_session(session_id).await? {
            Some(session) if session.is_active => Ok(session),
            _ => Err(CollabError::not_found(format!("session {session_id}"))),
        }
    }

    fn publish(&self, session_id: SessionId, event: SessionEvent) {
        if let Err(e) = self.bus.publish(session_id, event) {
            log::warn!("Publish in session {session_id} failed: {e}");
        }
    }
}
