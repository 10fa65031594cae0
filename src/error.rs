use std::time::Duration;

use thiserror::Error;

use crate::model::HabitId;

/// Errors reported by a [`RemoteStore`](crate::sync::remote::RemoteStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("session expired or not authorized")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Errors that will not go away by asking again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteError::Unauthorized | RemoteError::Rejected(_))
    }
}

/// Errors surfaced by the sync engine.
///
/// `Clone` so that callers awaiting the same in-flight action share one outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("no authenticated user")]
    NotAuthenticated,

    #[error("unknown habit {0}")]
    UnknownHabit(HabitId),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("remote write did not settle within {0:?}")]
    MutationTimeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, SyncError>;
