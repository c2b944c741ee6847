//! Fan-out of merged events to client sessions.

use std::sync::mpsc::{self, Receiver};

use eventsync_core::{Event, SequenceNumber};
use eventsync_storage::Storage;

use crate::error::EngineError;
use crate::leader::LeaderSyncProcessor;

#[derive(Debug, Clone, PartialEq)]
pub enum PullPayload {
    /// Events appended after the receiver's head.
    Advance { events: Vec<Event> },
    /// `rollback` (ascending) is undone, then `new` applied in its place.
    Rebase {
        rollback: Vec<Event>,
        new: Vec<Event>,
    },
}

impl PullPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Advance { events } => events.is_empty(),
            Self::Rebase { rollback, new } => rollback.is_empty() && new.is_empty(),
        }
    }

    /// Head of a receiver that applied this payload, if it changes.
    pub fn new_head(&self) -> Option<SequenceNumber> {
        match self {
            Self::Advance { events } => events.last().map(|e| e.seq_num),
            Self::Rebase { rollback, new } => new
                .last()
                .map(|e| e.seq_num)
                .or_else(|| rollback.first().map(|e| e.parent_seq_num)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullItem {
    pub payload: PullPayload,
    pub merge_counter: u64,
}

impl LeaderSyncProcessor {
    /// Everything in the log after `cursor`, as one catch-up item.
    pub fn pull(&self, cursor: SequenceNumber) -> Result<PullItem, EngineError> {
        let events = self.store.events_since(cursor)?;
        Ok(PullItem {
            payload: PullPayload::Advance { events },
            merge_counter: self.state.merge_counter,
        })
    }

    /// Subscribes to merges. The receiver first gets the catch-up item for
    /// `cursor` (when there is anything to catch up on), then one item per
    /// merge. Dropping the receiver unsubscribes.
    pub fn pull_queue(&mut self, cursor: SequenceNumber) -> Result<Receiver<PullItem>, EngineError> {
        self.ensure_running()?;
        let (tx, rx) = mpsc::channel();
        let catch_up = self.pull(cursor)?;
        if !catch_up.payload.is_empty() {
            // The receiver is still in scope, this cannot fail.
            let _ = tx.send(catch_up);
        }
        self.subscribers.push(tx);
        Ok(rx)
    }

    pub(crate) fn emit(&mut self, payload: PullPayload) {
        let item = PullItem {
            payload,
            merge_counter: self.state.merge_counter,
        };
        self.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
    }
}
