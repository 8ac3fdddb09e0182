//! In-process store for tests and ephemeral servers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{CollabStore, StoreError};
use crate::model::{Operation, Participant, PresenceRecord, Session, SessionId, UserId};

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    participants: HashMap<SessionId, BTreeMap<UserId, Participant>>,
    user_sessions: HashMap<UserId, BTreeSet<SessionId>>,
    operations: HashMap<SessionId, Vec<Operation>>,
    presence: HashMap<SessionId, BTreeMap<UserId, PresenceRecord>>,
}

impl Tables {
    fn put_participant(&mut self, participant: &Participant) {
        self.participants
            .entry(participant.session_id)
            .or_default()
            .insert(participant.user_id, participant.clone());
        self.user_sessions
            .entry(participant.user_id)
            .or_default()
            .insert(participant.session_id);
    }
}

/// Mutex-guarded maps implementing [`CollabStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))
    }
}

impl CollabStore for MemoryStore {
    fn insert_session(&self, session: &Session, owner: &Participant) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(format!("session {}", session.id)));
        }
        tables.sessions.insert(session.id, session.clone());
        tables.put_participant(owner);
        Ok(())
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.tables()?.sessions.get(&session_id).cloned())
    }

    fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        self.tables()?.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn put_participants(&self, participants: &[Participant]) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        for participant in participants {
            tables.put_participant(participant);
        }
        Ok(())
    }

    fn load_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Option<Participant>, StoreError> {
        Ok(self
            .tables()?
            .participants
            .get(&session_id)
            .and_then(|rows| rows.get(&user_id))
            .cloned())
    }

    fn list_participants(&self, session_id: SessionId) -> Result<Vec<Participant>, StoreError> {
        Ok(self
            .tables()?
            .participants
            .get(&session_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn sessions_for_user(&self, user_id: UserId) -> Result<Vec<SessionId>, StoreError> {
        Ok(self
            .tables()?
            .user_sessions
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    fn append_operation(&self, op: &Operation) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let log = tables.operations.entry(op.session_id).or_default();
        let expected = log.last().map_or(1, |last| last.sequence + 1);
        if op.sequence != expected {
            return Err(StoreError::SequenceConflict {
                expected,
                got: op.sequence,
            });
        }
        log.push(op.clone());
        Ok(())
    }

    fn operations_after(
        &self,
        session_id: SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError> {
        let tables = self.tables()?;
        let Some(log) = tables.operations.get(&session_id) else {
            return Ok(Vec::new());
        };
        // Log is dense from sequence 1, so index == sequence - 1.
        let start = (after as usize).min(log.len());
        Ok(log[start..].iter().take(limit).cloned().collect())
    }

    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError> {
        Ok(self
            .tables()?
            .operations
            .get(&session_id)
            .and_then(|log| log.last())
            .map_or(0, |op| op.sequence))
    }

    fn mark_applied(&self, session_id: SessionId, sequence: u64) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let op = tables
            .operations
            .get_mut(&session_id)
            .and_then(|log| log.get_mut((sequence as usize).wrapping_sub(1)));
        match op {
            Some(op) if op.sequence == sequence => {
                op.applied = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn put_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        self.tables()?
            .presence
            .entry(record.session_id)
            .or_default()
            .insert(record.user_id, record.clone());
        Ok(())
    }

    fn list_presence(&self, session_id: SessionId) -> Result<Vec<PresenceRecord>, StoreError> {
        Ok(self
            .tables()?
            .presence
            .get(&session_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn presence_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        Ok(self.tables()?.presence.keys().copied().collect())
    }
}
