//! Applies events to the state tables and rolls them back.
//!
//! Applying an event runs its materializer against the current state,
//! executes the resulting statements while capturing a changeset, records the
//! changeset next to the event and (unless rematerializing) appends the event
//! to the log. Rolling back applies the inverted changesets newest first.

use eventsync_core::{Event, SessionChangeset, hash_statements};
use eventsync_storage::{Changeset, SqliteStore, Storage};
use tracing::{debug, error};

use crate::config::ConsistencyMode;
use crate::error::EngineError;

/// Whether an applied event is also written to the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Append,
    /// The event is already in the log (rematerialization).
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct Applier {
    consistency: ConsistencyMode,
}

impl Applier {
    pub fn new(consistency: ConsistencyMode) -> Self {
        Self { consistency }
    }

    pub fn consistency(&self) -> ConsistencyMode {
        self.consistency
    }

    /// Materializes `event` and fills in its changeset (and, in checked mode,
    /// its materializer hash).
    pub fn apply(
        &self,
        store: &mut SqliteStore,
        event: &mut Event,
        log: LogMode,
    ) -> Result<(), EngineError> {
        let def = *store.schema().event(&event.name)?;
        let statements = (def.materializer)(&event.args, &*store)?;

        let checked = self.consistency.is_checked();
        let hash = if checked {
            let hash = hash_statements(&statements)?;
            if let Some(previous) = event.meta.materializer_hash
                && previous != hash
            {
                error!(
                    seq_num = %event.seq_num,
                    name = %event.name,
                    previous,
                    hash,
                    "materializer produced different statements for the same event"
                );
                return Err(EngineError::Unexpected(format!(
                    "materializer for {} is not deterministic (event {})",
                    event.name, event.seq_num
                )));
            }
            Some(hash)
        } else {
            None
        };

        let changeset = store.execute_tracked(&statements)?;
        let session_changeset = if changeset.is_empty() {
            SessionChangeset::NoOp
        } else {
            SessionChangeset::Changeset(changeset.encode()?)
        };

        if log == LogMode::Append {
            store.append_event(event, checked)?;
        }
        let description = checked.then(|| changeset.describe());
        store.record_changeset(
            event.seq_num,
            &session_changeset,
            hash,
            description.as_deref(),
        )?;

        debug!(
            seq_num = %event.seq_num,
            name = %event.name,
            rows = changeset.len(),
            "applied event"
        );
        event.meta.session_changeset = session_changeset;
        event.meta.materializer_hash = hash;
        Ok(())
    }

    /// Undoes the state changes of `events` (ascending), newest first. The
    /// events stay in the log; the caller decides what happens to them.
    pub fn rollback(&self, store: &mut SqliteStore, events: &[Event]) -> Result<usize, EngineError> {
        let mut undone = 0;
        for event in events.iter().rev() {
            match &event.meta.session_changeset {
                SessionChangeset::Unset => {
                    error!(seq_num = %event.seq_num, "no changeset recorded, cannot roll back");
                    return Err(EngineError::Unexpected(format!(
                        "no changeset recorded for event {}",
                        event.seq_num
                    )));
                }
                SessionChangeset::NoOp => {}
                SessionChangeset::Changeset(bytes) => {
                    let inverse = Changeset::decode(bytes)?.invert();
                    store.apply_changeset(&inverse)?;
                    undone += 1;
                }
            }
        }
        debug!(events = events.len(), undone, "rolled back events");
        Ok(undone)
    }
}
