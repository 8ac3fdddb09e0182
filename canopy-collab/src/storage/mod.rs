//! Durable storage for sessions, participants, operations and presence.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  SessionStore   ┌──────────────────────────────────┐
//! │ Coordinator  │ ──────────────► │ dyn CollabStore                  │
//! │              │  OperationLog   │                                  │
//! │              │ ──────────────► │  MemoryStore (tests, ephemeral)  │
//! │              │  Presence       │  RocksStore  (column families)   │
//! │              │ ──────────────► │                                  │
//! └──────────────┘                 └──────────────────────────────────┘
//! ```
//!
//! The trait is synchronous; callers wrap it in [`crate::retry::with_retry`].

pub mod codec;
pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use thiserror::Error;

use crate::model::{Operation, Participant, PresenceRecord, Session, SessionId, UserId};

/// Storage errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Backend internal error
    #[error("Database error: {0}")]
    DatabaseError(String),
    /// Backend temporarily unreachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    /// Stored record failed its integrity check
    #[error("Checksum mismatch at sequence {sequence}")]
    ChecksumMismatch { sequence: u64 },
    /// Append would not extend the log by exactly one
    #[error("Sequence conflict: expected {expected}, got {got}")]
    SequenceConflict { expected: u64, got: u64 },
    /// Insert of a row that already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl StoreError {
    /// Backend failures may succeed on retry; encoding and integrity
    /// failures will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::DatabaseError(_) | StoreError::Unavailable(_))
    }
}

/// Storage backend for the collaboration core.
///
/// Implementations must make `insert_session` (session + owner row) and
/// `put_participants` atomic, and must reject an `append_operation` whose
/// sequence is not exactly `last_sequence + 1`.
pub trait CollabStore: Send + Sync {
    fn insert_session(&self, session: &Session, owner: &Participant) -> Result<(), StoreError>;
    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError>;
    fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Upsert participant rows as one batch.
    fn put_participants(&self, participants: &[Participant]) -> Result<(), StoreError>;
    fn load_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Option<Participant>, StoreError>;
    fn list_participants(&self, session_id: SessionId) -> Result<Vec<Participant>, StoreError>;
    /// Sessions the user owns or participates in, regardless of state.
    fn sessions_for_user(&self, user_id: UserId) -> Result<Vec<SessionId>, StoreError>;

    fn append_operation(&self, op: &Operation) -> Result<(), StoreError>;
    /// Up to `limit` operations with sequence > `after`, in sequence order.
    fn operations_after(
        &self,
        session_id: SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError>;
    /// Last recorded sequence (0 when the log is empty).
    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError>;
    /// Returns false when no such operation exists.
    fn mark_applied(&self, session_id: SessionId, sequence: u64) -> Result<bool, StoreError>;

    fn put_presence(&self, record: &PresenceRecord) -> Result<(), StoreError>;
    fn list_presence(&self, session_id: SessionId) -> Result<Vec<PresenceRecord>, StoreError>;
    /// Sessions with at least one persisted presence row.
    fn presence_sessions(&self) -> Result<Vec<SessionId>, StoreError>;
}
