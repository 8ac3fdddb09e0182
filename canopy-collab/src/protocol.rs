//! Binary wire protocol between `SyncClient` and `CollabServer`.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! message:
//!
//! ```text
//!  client                                    server
//!    │ Join { session, user, since } ─────────► │
//!    │ ◄──────── Joined { session, role, … }    │
//!    │ SubmitOperation { request_id, … } ─────► │
//!    │ ◄──────── OperationAck { request_id, seq }│
//!    │ ◄──────── Event(OperationAppended | …)   │
//!    │ Heartbeat { online, cursor, … } ───────► │
//!    │ Leave ─────────────────────────────────► │
//! ```
//!
//! Requests that expect an answer carry a client-chosen `request_id` that
//! the server echoes in the ack or error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broadcast::SessionEvent;
use crate::error::{CollabError, ErrorKind};
use crate::model::{
    Participant, PresenceRecord, PresenceUpdate, Role, Session, SessionId, UserId, Vec2,
    VectorClock,
};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first frame on a connection. `since` requests replay of
    /// every operation after that sequence.
    Join {
        session_id: SessionId,
        user_id: UserId,
        since: Option<u64>,
    },
    SubmitOperation {
        request_id: u64,
        /// Client-generated id for idempotency tracking.
        operation_id: Option<uuid::Uuid>,
        op_type: String,
        payload: Vec<u8>,
        vector_clock: VectorClock,
    },
    Heartbeat {
        online: bool,
        cursor: Option<Vec2>,
        selection: Vec<String>,
        timestamp: u64,
    },
    ChangeRole {
        request_id: u64,
        target: UserId,
        role: Role,
    },
    Leave,
    Ping,
}

impl ClientMessage {
    pub fn heartbeat(update: &PresenceUpdate, timestamp: u64) -> Self {
        ClientMessage::Heartbeat {
            online: update.online,
            cursor: update.cursor,
            selection: update.selection.clone(),
            timestamp,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined {
        session: Session,
        role: Role,
        participants: Vec<Participant>,
        presence: Vec<PresenceRecord>,
        /// Last sequence at join time.
        tail: u64,
    },
    OperationAck {
        request_id: u64,
        sequence: u64,
    },
    RoleChanged {
        request_id: u64,
    },
    Event(SessionEvent),
    Error {
        /// `None` for errors not tied to a request (e.g. a failed join).
        request_id: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(request_id: Option<u64>, err: &CollabError) -> Self {
        let message = match err {
            CollabError::NotFound(m)
            | CollabError::PermissionDenied(m)
            | CollabError::InvalidOperation(m)
            | CollabError::Unavailable(m) => m.clone(),
        };
        ServerMessage::Error {
            request_id,
            kind: err.kind(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[inline(always)]
fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

#[inline(always)]
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    /// A frame arrived that is not valid in the current connection state.
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnexpectedMessage(m) => CollabError::InvalidOperation(m),
            other => CollabError::Unavailable(other.to_string()),
        }
    }
}
