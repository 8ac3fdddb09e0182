//! Error kinds surfaced by the collaboration core.
//!
//! `NotFound`, `PermissionDenied` and `InvalidOperation` are deterministic
//! outcomes of caller input and are never retried. `Unavailable` wraps
//! storage or transport failures and is the only retryable class.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

/// Wire-friendly discriminant of [`CollabError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidOperation,
    Unavailable,
}

impl CollabError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn permission_denied(what: impl Into<String>) -> Self {
        Self::PermissionDenied(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidOperation(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Only transport/storage failures may be retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Rebuild an error received over the wire.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            ErrorKind::InvalidOperation => Self::InvalidOperation(message),
            ErrorKind::Unavailable => Self::Unavailable(message),
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Unavailable(e.to_string())
    }
}

pub type CollabResult<T> = Result<T, CollabError>;
