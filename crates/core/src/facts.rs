//! Fact tracking for conflict detection and compaction.
//!
//! A fact is an abstract key (with a JSON value) describing a piece of
//! application state. Each event may declare, through its definition's facts
//! callback, which facts it sets, unsets and requires. Reads done through
//! [`FactsTracker`] are recorded as read dependencies.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CoreError;
use crate::event::Event;
use crate::schema::{EventDef, Schema};
use crate::seq_num::SequenceNumber;

pub type FactKey = String;
pub type FactValue = serde_json::Value;
pub type FactsMap = BTreeMap<FactKey, FactValue>;

/// The set of facts holding at some position in history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactsSnapshot {
    facts: FactsMap,
}

impl FactsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.facts.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.facts.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FactKey, &FactValue)> {
        self.facts.iter()
    }

    pub fn set(&mut self, key: impl Into<FactKey>, value: FactValue) {
        self.facts.insert(key.into(), value);
    }

    pub fn unset(&mut self, key: &str) {
        self.facts.remove(key);
    }

    /// Applies an event's effects: sets first, then unsets.
    pub fn apply(&mut self, group: &FactsGroup) {
        for (key, value) in &group.modify_set {
            self.facts.insert(key.clone(), value.clone());
        }
        for key in group.modify_unset.keys() {
            self.facts.remove(key);
        }
    }

    /// First required fact that does not hold with the required value.
    pub fn unmet_requirement<'g>(&self, group: &'g FactsGroup) -> Option<&'g FactKey> {
        group
            .dep_require
            .iter()
            .find(|(key, value)| self.facts.get(*key) != Some(*value))
            .map(|(key, _)| key)
    }
}

/// Effects and dependencies of one event at one position in history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactsGroup {
    pub modify_set: FactsMap,
    pub modify_unset: FactsMap,
    pub dep_require: FactsMap,
    pub dep_read: FactsMap,
}

impl FactsGroup {
    pub fn is_empty(&self) -> bool {
        self.modify_set.is_empty()
            && self.modify_unset.is_empty()
            && self.dep_require.is_empty()
            && self.dep_read.is_empty()
    }

    pub fn has_modifications(&self) -> bool {
        !self.modify_set.is_empty() || !self.modify_unset.is_empty()
    }

    pub fn modifies(&self, key: &str) -> bool {
        self.modify_set.contains_key(key) || self.modify_unset.contains_key(key)
    }

    /// Keys this event depends on: required plus read.
    pub fn dependency_keys(&self) -> impl Iterator<Item = &FactKey> {
        self.dep_require
            .keys()
            .chain(self.dep_read.keys().filter(|k| !self.dep_require.contains_key(*k)))
    }

    /// Keys both groups set.
    pub fn overlapping_keys(&self, other: &FactsGroup) -> Vec<FactKey> {
        self.modify_set
            .keys()
            .filter(|k| other.modify_set.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Folds a later group into this one, yielding the combined net effect.
    /// Dependencies of `later` already satisfied by this group are dropped.
    pub fn merge_after(&mut self, later: &FactsGroup) {
        for (key, value) in &later.dep_require {
            if !self.modifies(key) {
                self.dep_require.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &later.dep_read {
            if !self.modifies(key) {
                self.dep_read.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &later.modify_set {
            self.modify_unset.remove(key);
            self.modify_set.insert(key.clone(), value.clone());
        }
        for (key, value) in &later.modify_unset {
            self.modify_set.remove(key);
            self.modify_unset.insert(key.clone(), value.clone());
        }
    }
}

/// True when `a` replaces `b`: both modify the same non-empty set of keys.
/// A set may replace an unset of the same key and vice versa; values are not
/// compared.
pub fn replaces_facts(a: &FactsGroup, b: &FactsGroup) -> bool {
    fn touched(group: &FactsGroup) -> BTreeSet<&FactKey> {
        group.modify_set.keys().chain(group.modify_unset.keys()).collect()
    }
    let keys = touched(a);
    !keys.is_empty() && keys == touched(b)
}

/// Effects an event declares through its facts callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFacts {
    pub set: Vec<(FactKey, FactValue)>,
    pub unset: Vec<FactKey>,
    pub require: Vec<(FactKey, FactValue)>,
}

impl EventFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<FactKey>, value: FactValue) -> Self {
        self.set.push((key.into(), value));
        self
    }

    pub fn unset(mut self, key: impl Into<FactKey>) -> Self {
        self.unset.push(key.into());
        self
    }

    pub fn require(mut self, key: impl Into<FactKey>, value: FactValue) -> Self {
        self.require.push((key.into(), value));
        self
    }
}

/// Read access to a facts snapshot that remembers every key looked at.
pub struct FactsTracker<'a> {
    snapshot: &'a FactsSnapshot,
    reads: FactsMap,
}

impl<'a> FactsTracker<'a> {
    pub fn new(snapshot: &'a FactsSnapshot) -> Self {
        Self {
            snapshot,
            reads: FactsMap::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<&'a FactValue> {
        let value = self.snapshot.get(key);
        self.record(key, value);
        value
    }

    pub fn has(&mut self, key: &str) -> bool {
        let value = self.snapshot.get(key);
        self.record(key, value);
        value.is_some()
    }

    fn record(&mut self, key: &str, value: Option<&FactValue>) {
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| value.cloned().unwrap_or(FactValue::Null));
    }

    pub fn into_reads(self) -> FactsMap {
        self.reads
    }
}

/// Computes the facts group for one event against the snapshot visible at
/// its position. Events without a facts callback have an empty group.
pub fn facts_for_event(
    def: &EventDef,
    event: &Event,
    snapshot: &FactsSnapshot,
) -> Result<FactsGroup, CoreError> {
    let Some(callback) = def.facts else {
        return Ok(FactsGroup::default());
    };

    let mut tracker = FactsTracker::new(snapshot);
    let declared = callback(&event.args, &mut tracker)?;
    let dep_read = tracker.into_reads();

    let mut group = FactsGroup {
        dep_read,
        ..FactsGroup::default()
    };
    for (key, value) in declared.set {
        group.modify_set.insert(key, value);
    }
    for key in declared.unset {
        let previous = snapshot.get(&key).cloned().unwrap_or(FactValue::Null);
        group.modify_set.remove(&key);
        group.modify_unset.insert(key, previous);
    }
    for (key, value) in declared.require {
        group.dep_require.insert(key, value);
    }
    Ok(group)
}

/// Walks `events` in order starting from `base`, computing and validating
/// each event's facts group. Returns the groups and the resulting snapshot.
pub fn facts_for_events(
    schema: &Schema,
    events: &[Event],
    base: &FactsSnapshot,
) -> Result<(Vec<FactsGroup>, FactsSnapshot), CoreError> {
    let mut snapshot = base.clone();
    let mut groups = Vec::with_capacity(events.len());
    for event in events {
        let group = facts_for_event(schema.event(&event.name)?, event, &snapshot)?;
        check_requirements(event.seq_num, &group, &snapshot)?;
        snapshot.apply(&group);
        groups.push(group);
    }
    Ok((groups, snapshot))
}

pub fn check_requirements(
    seq_num: SequenceNumber,
    group: &FactsGroup,
    snapshot: &FactsSnapshot,
) -> Result<(), CoreError> {
    match snapshot.unmet_requirement(group) {
        Some(key) => Err(CoreError::MissingRequirement {
            seq_num,
            key: key.clone(),
        }),
        None => Ok(()),
    }
}
