use eventsync_core::{CoreError, RebaseConflict, SequenceNumber};
use eventsync_storage::StorageError;
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The pushing session is behind the leader and must pull first.
    #[error("leader is ahead: expected at least {minimum_expected}, got {provided}")]
    LeaderAhead {
        minimum_expected: SequenceNumber,
        provided: SequenceNumber,
    },

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("rebase aborted with {} conflict(s): {}", .0.len(), describe(.0))]
    RebaseConflict(Vec<RebaseConflict>),

    /// An internal invariant did not hold.
    #[error("unexpected: {0}")]
    Unexpected(String),

    #[error("sync processor is shut down")]
    Shutdown,
}

impl EngineError {
    /// Transport failures clear up on their own; everything else needs a caller decision.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            _ => false,
        }
    }
}

fn describe(conflicts: &[RebaseConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
