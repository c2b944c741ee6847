use thiserror::Error;

use crate::seq_num::SequenceNumber;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid sequence number: {0}")]
    InvalidSequenceNumber(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("duplicate definition: {0}")]
    DuplicateDefinition(String),

    #[error("invalid event args for {name}: {reason}")]
    InvalidArgs { name: String, reason: String },

    #[error("event {seq_num} requires fact {key} which is not satisfied")]
    MissingRequirement { seq_num: SequenceNumber, key: String },

    #[error("event {seq_num} references unknown parent {parent}")]
    UnknownParent {
        seq_num: SequenceNumber,
        parent: SequenceNumber,
    },

    #[error("state query failed: {0}")]
    StateQuery(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
