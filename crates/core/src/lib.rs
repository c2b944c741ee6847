pub mod compact;
pub mod error;
pub mod event;
pub mod facts;
pub mod history_dag;
pub mod ids;
pub mod rebase;
pub mod schema;
pub mod seq_num;
pub mod value;

pub use compact::{compact, compact_events};
pub use error::CoreError;
pub use event::{EncodedEvent, Event, EventMeta, MaterializerHash, SessionChangeset};
pub use facts::{
    EventFacts, FactsGroup, FactsSnapshot, FactsTracker, facts_for_event, facts_for_events,
    replaces_facts,
};
pub use history_dag::{Edge, EdgeKind, HistoryDag, HistoryDagNode, history_dag_from_nodes};
pub use ids::*;
pub use rebase::{
    AbortOnMissingRequirement, ConflictKind, RebaseConflict, RebaseDecision, RebaseStrategy,
    detect_conflicts, rebase_events,
};
pub use schema::{
    Assignments, ColumnDef, ColumnType, EventDef, OnConflict, Row, Schema, StateReader, Statement,
    TableDef, hash_statements,
};
pub use seq_num::{SequenceDiff, SequenceNumber};
pub use value::SqlValue;
