//! Leader-side sync engine: applies local events, exchanges confirmed
//! events with a remote authority and rebases pending work on divergence.

pub mod applier;
pub mod backend;
pub mod boot;
pub mod config;
pub mod error;
pub mod leader;
pub mod pull;

pub use applier::{Applier, LogMode};
pub use backend::{
    BackendError, InvalidPushReason, PullCursor, PullPage, PulledEvent, SyncBackend,
};
pub use boot::{BootStatus, LeaderBuilder};
pub use config::{
    ConsistencyMode, InitialSyncOptions, MAX_BATCH_SIZE, RetryConfig, RetrySchedule, SyncConfig,
};
pub use error::EngineError;
pub use leader::{LeaderSyncProcessor, PushOptions, SyncStatus, TickReport};
pub use pull::{PullItem, PullPayload};
