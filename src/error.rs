//! Error taxonomy shared by the store, the transports and the sync engines.

use crate::entity::SessionId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or server-side failure. Background polls retry on the next tick.
    #[error("network error: {0}")]
    Network(String),

    /// Admin credential missing, wrong or revoked.
    #[error("admin authorization expired")]
    AuthExpired,

    /// Unknown session. Readers treat this as an empty conversation.
    #[error("conversation not found: {session_id}")]
    NotFound { session_id: SessionId },

    /// The request itself was invalid (empty text, bad id, ...).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Persistence failure inside the authoritative store.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn not_found(session_id: &SessionId) -> Self {
        Self::NotFound {
            session_id: session_id.clone(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Whether waiting for the next poll tick is the right reaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Storage(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
