//! Entities of the collaboration core: sessions, participants,
//! operations and presence records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::CollabError;

pub type SessionId = Uuid;
pub type UserId = Uuid;
pub type OperationId = Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Sessions & participants
// ───────────────────────────────────────────────────────────────────

/// Kind of document a session edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    Mindmap,
    Whiteboard,
    Presentation,
    Strategy,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Mindmap => "mindmap",
            DocumentType::Whiteboard => "whiteboard",
            DocumentType::Presentation => "presentation",
            DocumentType::Strategy => "strategy",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mindmap" => Ok(DocumentType::Mindmap),
            "whiteboard" => Ok(DocumentType::Whiteboard),
            "presentation" => Ok(DocumentType::Presentation),
            "strategy" => Ok(DocumentType::Strategy),
            other => Err(CollabError::invalid(format!("unknown document type '{other}'"))),
        }
    }
}

/// A named, typed collaboration context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub document_type: DocumentType,
    /// Immutable after creation.
    pub owner_id: UserId,
    pub settings: BTreeMap<String, String>,
    pub is_active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Session {
    pub fn new(name: impl Into<String>, document_type: DocumentType, owner_id: UserId) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            document_type,
            owner_id,
            settings: BTreeMap::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Participant role. Determines write capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    /// Owner and editor may mutate session/document state.
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn can_manage_roles(&self) -> bool {
        matches!(self, Role::Owner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(CollabError::invalid(format!("unknown role '{other}'"))),
        }
    }
}

/// A user's membership in a session. Unique per (session, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub role: Role,
    pub joined_at: u64,
    pub last_seen: u64,
}

impl Participant {
    pub fn new(session_id: SessionId, user_id: UserId, role: Role) -> Self {
        let now = now_millis();
        Self {
            session_id,
            user_id,
            role,
            joined_at: now,
            last_seen: now,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Vector clocks
// ───────────────────────────────────────────────────────────────────

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Per-author logical counters attached to an operation.
///
/// Advisory only: the log orders operations by append sequence and never
/// reorders by clock. Merge logic in the consuming document may use it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<UserId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `author`, returning the new value.
    pub fn tick(&mut self, author: UserId) -> u64 {
        let counter = self.counters.entry(author).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn get(&self, author: &UserId) -> u64 {
        self.counters.get(author).copied().unwrap_or(0)
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (author, &count) in &other.counters {
            let entry = self.counters.entry(*author).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrder {
        let mut less = false;
        let mut greater = false;
        for author in self.counters.keys().chain(other.counters.keys()) {
            let a = self.get(author);
            let b = other.get(author);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => ClockOrder::Equal,
            (true, false) => ClockOrder::Before,
            (false, true) => ClockOrder::After,
            (true, true) => ClockOrder::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &u64)> {
        self.counters.iter()
    }
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// An immutable edit event recorded in a session's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub session_id: SessionId,
    pub author_id: UserId,
    /// Server-assigned, strictly increasing per session; starts at 1.
    pub sequence: u64,
    /// Tag defined by the consuming document, e.g. "add_node".
    pub op_type: String,
    /// Opaque to the core.
    pub payload: Vec<u8>,
    pub submitted_at: u64,
    pub vector_clock: VectorClock,
    /// The only field that changes after recording.
    pub applied: bool,
}

/// What a participant submits; the log fills in the rest.
#[derive(Debug, Clone, Default)]
pub struct OperationDraft {
    /// Client-generated id for idempotency tracking. The log does not
    /// deduplicate on it.
    pub id: Option<OperationId>,
    pub op_type: String,
    pub payload: Vec<u8>,
    pub vector_clock: VectorClock,
}

impl OperationDraft {
    pub fn new(op_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: None,
            op_type: op_type.into(),
            payload,
            vector_clock: VectorClock::new(),
        }
    }

    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_clock(mut self, clock: VectorClock) -> Self {
        self.vector_clock = clock;
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// 2D position in document (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A user's live state within a session. At most one per (session, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub online: bool,
    pub cursor: Option<Vec2>,
    /// Opaque element ids.
    pub selection: Vec<String>,
    pub last_heartbeat: u64,
}

impl PresenceRecord {
    /// True when `self` may replace `current`. `last_heartbeat` is the
    /// server's receive stamp, which never moves backwards for a user, so
    /// an older record reaching a client late never overwrites a newer one.
    pub fn supersedes(&self, current: &PresenceRecord) -> bool {
        self.last_heartbeat >= current.last_heartbeat
    }
}

/// Payload of a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub online: bool,
    pub cursor: Option<Vec2>,
    pub selection: Vec<String>,
    /// Sender timestamp; the tracker uses receive time when absent.
    pub timestamp: Option<u64>,
}

impl PresenceUpdate {
    pub fn online() -> Self {
        Self {
            online: true,
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, cursor: Vec2) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_selection(mut self, selection: Vec<String>) -> Self {
        self.selection = selection;
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}
