//! Rebasing pending local events onto newly confirmed remote events.

use std::fmt;

use crate::error::CoreError;
use crate::event::Event;
use crate::facts::{FactKey, FactsGroup, FactsSnapshot, facts_for_event};
use crate::schema::Schema;
use crate::seq_num::SequenceNumber;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both events set the same facts. Replaying the local event after the
    /// remote one is still well defined.
    Overlap { keys: Vec<FactKey> },
    /// The local event requires a fact that no longer holds once the remote
    /// events are applied.
    MissingRequirement { key: FactKey },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseConflict {
    pub local: SequenceNumber,
    /// The remote event responsible, when one can be singled out.
    pub remote: Option<SequenceNumber>,
    pub kind: ConflictKind,
}

impl RebaseConflict {
    pub fn is_missing_requirement(&self) -> bool {
        matches!(self.kind, ConflictKind::MissingRequirement { .. })
    }
}

impl fmt::Display for RebaseConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConflictKind::Overlap { keys } => {
                write!(f, "{} overlaps on {}", self.local, keys.join(","))?;
            }
            ConflictKind::MissingRequirement { key } => {
                write!(f, "{} is missing requirement {key}", self.local)?;
            }
        }
        if let Some(remote) = self.remote {
            write!(f, " (remote {remote})")?;
        }
        Ok(())
    }
}

/// Classifies every pending event against the incoming remote events.
///
/// `base` is the facts snapshot at the last confirmed head, which is where
/// both the pending and the remote events were produced.
pub fn detect_conflicts(
    schema: &Schema,
    base: &FactsSnapshot,
    pending: &[Event],
    remote: &[Event],
) -> Result<Vec<RebaseConflict>, CoreError> {
    let mut after_remote = base.clone();
    let mut remote_groups: Vec<(SequenceNumber, FactsGroup)> = Vec::with_capacity(remote.len());
    for event in remote {
        let group = facts_for_event(schema.event(&event.name)?, event, &after_remote)?;
        after_remote.apply(&group);
        remote_groups.push((event.seq_num, group));
    }

    let mut conflicts = Vec::new();
    let mut original = base.clone();
    let mut replayed = after_remote;
    for event in pending {
        let def = schema.event(&event.name)?;

        let local = facts_for_event(def, event, &original)?;
        original.apply(&local);
        for (remote_seq, remote_group) in &remote_groups {
            let keys = local.overlapping_keys(remote_group);
            if !keys.is_empty() {
                conflicts.push(RebaseConflict {
                    local: event.seq_num,
                    remote: Some(*remote_seq),
                    kind: ConflictKind::Overlap { keys },
                });
            }
        }

        let moved = facts_for_event(def, event, &replayed)?;
        if let Some(key) = replayed.unmet_requirement(&moved) {
            let culprit = remote_groups
                .iter()
                .rev()
                .find(|(_, g)| g.modifies(key))
                .map(|(seq, _)| *seq);
            conflicts.push(RebaseConflict {
                local: event.seq_num,
                remote: culprit,
                kind: ConflictKind::MissingRequirement { key: key.clone() },
            });
        }
        replayed.apply(&moved);
    }

    Ok(conflicts)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebaseDecision {
    /// Replay these events, in order, on top of the new head.
    Replay(Vec<Event>),
    /// Leave pending events untouched and surface the conflicts.
    Abort(Vec<RebaseConflict>),
}

/// Decides how pending events survive a divergent remote update.
pub trait RebaseStrategy: Send {
    fn resolve(&self, pending: &[Event], conflicts: &[RebaseConflict]) -> RebaseDecision;
}

/// Replays everything unless some event lost a required fact, in which case
/// nothing is replayed and the conflicts are reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnMissingRequirement;

impl RebaseStrategy for AbortOnMissingRequirement {
    fn resolve(&self, pending: &[Event], conflicts: &[RebaseConflict]) -> RebaseDecision {
        let fatal: Vec<RebaseConflict> = conflicts
            .iter()
            .filter(|c| c.is_missing_requirement())
            .cloned()
            .collect();
        if fatal.is_empty() {
            RebaseDecision::Replay(pending.to_vec())
        } else {
            RebaseDecision::Abort(fatal)
        }
    }
}

/// Renumbers `events` so they chain onto `new_head`, preserving their order.
/// Client-only events keep bumping the client component.
pub fn rebase_events(events: &[Event], new_head: SequenceNumber) -> Vec<Event> {
    let mut parent = new_head;
    events
        .iter()
        .map(|event| {
            let seq_num = parent.next(event.is_client_only());
            let moved = event.rebased(seq_num, parent);
            parent = seq_num;
            moved
        })
        .collect()
}
