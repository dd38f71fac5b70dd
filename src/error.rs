//! Error types shared across the crate.

use crate::signs::SignError;

/// Failures reported by the data-access collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepoError {
    /// No valid session; for identity lookups this means "not signed in"
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found")]
    NotFound,
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Io(io) => RepoError::Transport(io.to_string()),
            sqlx::Error::PoolTimedOut => RepoError::Transport("pool timed out".to_string()),
            sqlx::Error::PoolClosed => RepoError::Transport("pool closed".to_string()),
            other => RepoError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

/// Coarse classification callers use to pick a user-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Nobody is signed in
    NotLoggedIn,
    /// A required user or character context is missing
    Precondition,
    /// The backend failed; retrying may help
    Backend,
    /// The request itself was malformed (unknown sign, too many signs)
    InvalidInput,
}

/// Errors from quest state operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuestStateError {
    #[error("user must be logged in")]
    NotAuthenticated,
    #[error("cannot {action} without user and character")]
    MissingContext { action: &'static str },
    #[error("no character selected")]
    NoCharacterSelected,
    #[error(transparent)]
    Backend(#[from] RepoError),
    #[error(transparent)]
    Sign(#[from] SignError),
}

impl QuestStateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuestStateError::NotAuthenticated => ErrorKind::NotLoggedIn,
            QuestStateError::Backend(RepoError::Unauthorized(_)) => ErrorKind::NotLoggedIn,
            QuestStateError::MissingContext { .. } | QuestStateError::NoCharacterSelected => {
                ErrorKind::Precondition
            }
            QuestStateError::Backend(_) => ErrorKind::Backend,
            QuestStateError::Sign(_) => ErrorKind::InvalidInput,
        }
    }
}
