use eventsync_core::{Event, MaterializerHash, SequenceNumber, SessionChangeset, Statement};

use crate::changeset::Changeset;
use crate::error::StorageError;

/// Persistence used by the leader: the event log, its sync cursor, the
/// per-event changesets and the materialized state tables.
pub trait Storage {
    // ------------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------------

    /// Appends one event. With `check_parent`, a parent missing from the log
    /// is rejected with `SchemaMismatch`.
    fn append_event(&mut self, event: &Event, check_parent: bool) -> Result<(), StorageError>;

    /// Events strictly after `cursor`, ascending, with their changesets.
    fn events_since(&self, cursor: SequenceNumber) -> Result<Vec<Event>, StorageError>;

    fn get_event(&self, seq_num: SequenceNumber) -> Result<Option<Event>, StorageError>;

    /// Highest sequence number in the log, `ROOT` when empty.
    fn local_head(&self) -> Result<SequenceNumber, StorageError>;

    /// Last confirmed global sequence number.
    fn head(&self) -> Result<SequenceNumber, StorageError>;

    fn update_head(&mut self, head: SequenceNumber) -> Result<(), StorageError>;

    fn event_count(&self) -> Result<u64, StorageError>;

    /// Deletes events (and their changesets) strictly after `seq_num`.
    fn delete_events_after(&mut self, seq_num: SequenceNumber) -> Result<usize, StorageError>;

    fn set_sync_metadata(
        &mut self,
        seq_num: SequenceNumber,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), StorageError>;

    // ------------------------------------------------------------------------
    // Changesets
    // ------------------------------------------------------------------------

    fn record_changeset(
        &mut self,
        seq_num: SequenceNumber,
        changeset: &SessionChangeset,
        materializer_hash: Option<MaterializerHash>,
        debug: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Drops changesets at or below `seq_num`; those events can no longer be
    /// rolled back.
    fn delete_changesets_up_to(&mut self, seq_num: SequenceNumber) -> Result<usize, StorageError>;

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Executes statements against the state tables, returning the changes.
    fn execute_tracked(&mut self, statements: &[Statement]) -> Result<Changeset, StorageError>;

    fn apply_changeset(&mut self, changeset: &Changeset) -> Result<(), StorageError>;

    fn export_state(&self) -> Result<Vec<u8>, StorageError>;

    fn import_state(&mut self, bytes: &[u8]) -> Result<(), StorageError>;
}
