//! Transport abstraction for the remote authority.
//!
//! The authority assigns the global order of synced events. The leader pulls
//! confirmed events page by page and pushes its pending ones in batches; a
//! push is accepted only when it extends the authority's current head.

use std::fmt;

use eventsync_core::{EncodedEvent, SequenceNumber};
use thiserror::Error;

/// Where a pull resumes: the last confirmed global sequence number, plus the
/// opaque metadata the backend attached to that event.
#[derive(Debug, Clone, PartialEq)]
pub struct PullCursor {
    pub cursor: SequenceNumber,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulledEvent {
    pub event: EncodedEvent,
    pub metadata: Option<serde_json::Value>,
}

/// One page of confirmed events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PullPage {
    pub batch: Vec<PulledEvent>,
    /// Events still waiting on the backend after this page.
    pub remaining: u64,
}

impl PullPage {
    pub fn is_last(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvalidPushReason {
    /// The backend already holds events past the pushed batch's parent.
    ServerAhead {
        minimum_expected: SequenceNumber,
        provided: SequenceNumber,
    },
    Unexpected(String),
}

impl fmt::Display for InvalidPushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerAhead {
                minimum_expected,
                provided,
            } => write!(
                f,
                "server is ahead: expected at least {minimum_expected}, got {provided}"
            ),
            Self::Unexpected(message) => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("backend is offline")]
    IsOffline,

    #[error("invalid pull: {0}")]
    InvalidPull(String),

    #[error("invalid push: {0}")]
    InvalidPush(InvalidPushReason),
}

impl BackendError {
    pub fn server_ahead(minimum_expected: SequenceNumber, provided: SequenceNumber) -> Self {
        Self::InvalidPush(InvalidPushReason::ServerAhead {
            minimum_expected,
            provided,
        })
    }

    /// Transport failures: the leader goes offline and retries on its
    /// schedule while local operation continues.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IsOffline | Self::InvalidPull(_))
    }

    pub fn is_server_ahead(&self) -> bool {
        matches!(
            self,
            Self::InvalidPush(InvalidPushReason::ServerAhead { .. })
        )
    }
}

/// Connection to the remote authority.
///
/// Implementations are driven by a single leader and need no internal
/// locking for that; sharing state with other leaders is their own business.
pub trait SyncBackend: Send {
    fn connect(&mut self) -> Result<(), BackendError>;

    /// Confirmed events strictly after `cursor` (from the start when `None`),
    /// at most `limit` of them.
    fn pull(&mut self, cursor: Option<&PullCursor>, limit: usize) -> Result<PullPage, BackendError>;

    /// Appends `batch` after the backend's head. The first event's parent
    /// must be that head.
    fn push(&mut self, batch: &[EncodedEvent]) -> Result<(), BackendError>;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self) {}
}
