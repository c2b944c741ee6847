use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{ClientId, SessionId};
use crate::seq_num::SequenceNumber;

/// Hash over the statements a materializer produced for one event.
pub type MaterializerHash = u64;

/// State diff recorded when an event was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionChangeset {
    /// Not recorded (yet), e.g. an event received but not applied.
    #[default]
    Unset,
    /// Applied, but the materializer did not change any row.
    NoOp,
    /// Encoded changeset bytes.
    Changeset(Vec<u8>),
}

impl SessionChangeset {
    pub fn is_unset(&self) -> bool {
        matches!(self, SessionChangeset::Unset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub session_changeset: SessionChangeset,
    /// Opaque metadata attached by the sync backend on confirmation.
    pub sync_metadata: Option<serde_json::Value>,
    /// Materializer hash recorded the last time this event was applied.
    /// Only consulted in checked consistency mode.
    pub materializer_hash: Option<MaterializerHash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub args: serde_json::Value,
    pub seq_num: SequenceNumber,
    pub parent_seq_num: SequenceNumber,
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub meta: EventMeta,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        args: serde_json::Value,
        seq_num: SequenceNumber,
        parent_seq_num: SequenceNumber,
        client_id: ClientId,
        session_id: SessionId,
    ) -> Self {
        Self {
            name: name.into(),
            args,
            seq_num,
            parent_seq_num,
            client_id,
            session_id,
            meta: EventMeta::default(),
        }
    }

    pub fn is_client_only(&self) -> bool {
        self.seq_num.is_client_only()
    }

    /// A copy of this event placed at a new position. Per-application
    /// metadata (changeset, materializer hash) does not carry over.
    pub fn rebased(&self, seq_num: SequenceNumber, parent_seq_num: SequenceNumber) -> Self {
        Self {
            name: self.name.clone(),
            args: self.args.clone(),
            seq_num,
            parent_seq_num,
            client_id: self.client_id,
            session_id: self.session_id,
            meta: EventMeta::default(),
        }
    }

    /// True when both events carry the same user intent, regardless of position.
    pub fn same_payload(&self, other: &Event) -> bool {
        self.name == other.name
            && self.args == other.args
            && self.client_id == other.client_id
            && self.session_id == other.session_id
    }

    pub fn args_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(&self.args).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn encode(&self) -> EncodedEvent {
        EncodedEvent {
            name: self.name.clone(),
            args: self.args.clone(),
            seq_num: self.seq_num.global(),
            parent_seq_num: self.parent_seq_num.global(),
            client_id: self.client_id,
            session_id: self.session_id,
        }
    }
}

/// Event as exchanged with the remote authority. Only the global component
/// of sequence numbers crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedEvent {
    pub name: String,
    pub args: serde_json::Value,
    pub seq_num: u64,
    pub parent_seq_num: u64,
    pub client_id: ClientId,
    pub session_id: SessionId,
}

impl EncodedEvent {
    pub fn seq_num(&self) -> SequenceNumber {
        SequenceNumber::global_only(self.seq_num)
    }

    pub fn decode(self, sync_metadata: Option<serde_json::Value>) -> Event {
        Event {
            name: self.name,
            args: self.args,
            seq_num: SequenceNumber::global_only(self.seq_num),
            parent_seq_num: SequenceNumber::global_only(self.parent_seq_num),
            client_id: self.client_id,
            session_id: self.session_id,
            meta: EventMeta {
                sync_metadata,
                ..EventMeta::default()
            },
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Event {
        let mut event = Event::new(
            "v1.BookmarkCreated",
            json!({"id": "b1", "name": "docs"}),
            SequenceNumber::new(4, 0),
            SequenceNumber::new(3, 1),
            ClientId::new(),
            SessionId::new(),
        );
        event.meta.session_changeset = SessionChangeset::NoOp;
        event.meta.materializer_hash = Some(99);
        event
    }

    #[test]
    fn rebased_resets_application_meta() {
        let event = sample();
        let moved = event.rebased(SequenceNumber::new(9, 0), SequenceNumber::new(8, 0));
        assert_eq!(moved.seq_num, SequenceNumber::new(9, 0));
        assert_eq!(moved.parent_seq_num, SequenceNumber::new(8, 0));
        assert!(moved.meta.session_changeset.is_unset());
        assert_eq!(moved.meta.materializer_hash, None);
        assert!(moved.same_payload(&event));
        // the original is untouched
        assert_eq!(event.seq_num, SequenceNumber::new(4, 0));
    }

    #[test]
    fn encode_strips_client_component() {
        let event = sample();
        let encoded = event.encode();
        assert_eq!(encoded.seq_num, 4);
        assert_eq!(encoded.parent_seq_num, 3);

        let bytes = encoded.to_msgpack().unwrap();
        let decoded = EncodedEvent::from_msgpack(&bytes)
            .unwrap()
            .decode(Some(json!({"offset": 12})));
        assert_eq!(decoded.seq_num, SequenceNumber::new(4, 0));
        assert_eq!(decoded.parent_seq_num, SequenceNumber::new(3, 0));
        assert_eq!(decoded.meta.sync_metadata, Some(json!({"offset": 12})));
        assert!(decoded.same_payload(&event));
    }
}
