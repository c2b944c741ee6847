//! History DAG over a slice of the event log.
//!
//! Nodes live in an arena ordered by sequence number. Each node has one
//! `parent` edge (total order) and any number of `facts` edges pointing at
//! the nearest ancestor that last modified a fact it reads or requires.
//! Removing a node tombstones its slot and relinks its children.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::event::Event;
use crate::facts::{FactsGroup, FactsSnapshot, check_requirements, facts_for_events};
use crate::schema::Schema;
use crate::seq_num::SequenceNumber;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryDagNode {
    pub event: Event,
    pub facts: FactsGroup,
}

impl HistoryDagNode {
    pub fn new(event: Event, facts: FactsGroup) -> Self {
        Self { event, facts }
    }

    pub fn seq_num(&self) -> SequenceNumber {
        self.event.seq_num
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Parent,
    Facts,
}

/// An edge from a node to the node that depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: SequenceNumber,
    pub to: SequenceNumber,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) node: HistoryDagNode,
    /// `None` means the node hangs directly off the DAG base.
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) fact_deps: Vec<usize>,
    pub(crate) fact_dependents: Vec<usize>,
    pub(crate) removed: bool,
}

#[derive(Debug, Clone)]
pub struct HistoryDag {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    /// Parent of the first node; `ROOT` for a DAG built from the log start.
    base: SequenceNumber,
    base_facts: FactsSnapshot,
}

impl HistoryDag {
    /// Builds the DAG. Nodes are ordered by sequence number; every node but
    /// the first must name a parent inside the DAG. Fails with
    /// `MissingRequirement` when a required fact is not satisfied by the
    /// base snapshot plus the effects of earlier nodes.
    pub fn from_nodes(
        mut nodes: Vec<HistoryDagNode>,
        base_facts: FactsSnapshot,
    ) -> Result<Self, CoreError> {
        nodes.sort_by_key(|n| n.seq_num());
        let base = nodes
            .first()
            .map(|n| n.event.parent_seq_num)
            .unwrap_or(SequenceNumber::ROOT);

        let mut dag = Self {
            slots: Vec::with_capacity(nodes.len()),
            index: HashMap::with_capacity(nodes.len()),
            base,
            base_facts,
        };

        let mut running = dag.base_facts.clone();
        for node in nodes {
            let seq_num = node.seq_num();
            let key = seq_num.to_string();
            if dag.index.contains_key(&key) {
                return Err(CoreError::InvalidData(format!("duplicate node {key}")));
            }

            let parent_seq = node.event.parent_seq_num;
            let parent = if dag.slots.is_empty() {
                None
            } else {
                let idx = dag
                    .index
                    .get(&parent_seq.to_string())
                    .copied()
                    .ok_or(CoreError::UnknownParent {
                        seq_num,
                        parent: parent_seq,
                    })?;
                Some(idx)
            };

            check_requirements(seq_num, &node.facts, &running)?;
            running.apply(&node.facts);

            let idx = dag.slots.len();
            dag.slots.push(Slot {
                node,
                parent,
                children: Vec::new(),
                fact_deps: Vec::new(),
                fact_dependents: Vec::new(),
                removed: false,
            });
            if let Some(p) = parent {
                dag.slots[p].children.push(idx);
            }
            dag.index.insert(key, idx);
            dag.link_fact_deps(idx);
        }

        Ok(dag)
    }

    /// Computes facts for `events` starting from `base_facts` and builds the DAG.
    pub fn from_events(
        schema: &Schema,
        events: &[Event],
        base_facts: FactsSnapshot,
    ) -> Result<Self, CoreError> {
        let (groups, _) = facts_for_events(schema, events, &base_facts)?;
        let nodes = events
            .iter()
            .cloned()
            .zip(groups)
            .map(|(event, facts)| HistoryDagNode::new(event, facts))
            .collect();
        Self::from_nodes(nodes, base_facts)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| !s.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn base(&self) -> SequenceNumber {
        self.base
    }

    pub fn contains(&self, seq_num: SequenceNumber) -> bool {
        self.live_index(seq_num).is_some()
    }

    /// Live nodes in sequence order.
    pub fn nodes(&self) -> impl Iterator<Item = &HistoryDagNode> {
        self.slots.iter().filter(|s| !s.removed).map(|s| &s.node)
    }

    pub fn node(&self, seq_num: SequenceNumber) -> Option<&HistoryDagNode> {
        self.live_index(seq_num).map(|i| &self.slots[i].node)
    }

    /// Parent along the total order; the DAG base for the first live node.
    pub fn parent_of(&self, seq_num: SequenceNumber) -> Option<SequenceNumber> {
        let idx = self.live_index(seq_num)?;
        Some(match self.slots[idx].parent {
            Some(p) => self.slots[p].node.seq_num(),
            None => self.base,
        })
    }

    pub fn children_of(&self, seq_num: SequenceNumber) -> Vec<SequenceNumber> {
        self.related(seq_num, |s| &s.children)
    }

    pub fn fact_dependencies(&self, seq_num: SequenceNumber) -> Vec<SequenceNumber> {
        self.related(seq_num, |s| &s.fact_deps)
    }

    pub fn fact_dependents(&self, seq_num: SequenceNumber) -> Vec<SequenceNumber> {
        self.related(seq_num, |s| &s.fact_dependents)
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for slot in self.slots.iter().filter(|s| !s.removed) {
            let to = slot.node.seq_num();
            let parent = match slot.parent {
                Some(p) => self.slots[p].node.seq_num(),
                None => self.base,
            };
            edges.push(Edge {
                from: parent,
                to,
                kind: EdgeKind::Parent,
            });
            for &dep in &slot.fact_deps {
                edges.push(Edge {
                    from: self.slots[dep].node.seq_num(),
                    to,
                    kind: EdgeKind::Facts,
                });
            }
        }
        edges
    }

    /// Facts holding after the last live node.
    pub fn facts_snapshot(&self) -> FactsSnapshot {
        let mut snapshot = self.base_facts.clone();
        for node in self.nodes() {
            snapshot.apply(&node.facts);
        }
        snapshot
    }

    /// Removes a node, relinking its children onto its parent. Nodes that
    /// depended on its facts are relinked to the next ancestor modifying
    /// those facts.
    pub fn remove_node(&mut self, seq_num: SequenceNumber) -> Result<HistoryDagNode, CoreError> {
        let idx = self
            .live_index(seq_num)
            .ok_or_else(|| CoreError::InvalidData(format!("no live node {seq_num}")))?;
        self.remove_at(idx);
        Ok(self.slots[idx].node.clone())
    }

    pub fn into_events(self) -> Vec<Event> {
        self.slots
            .into_iter()
            .filter(|s| !s.removed)
            .map(|s| s.node.event)
            .collect()
    }

    // ========================================================================
    // Arena access for compaction
    // ========================================================================

    pub(crate) fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub(crate) fn live_indices(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| !self.slots[i].removed)
            .collect()
    }

    pub(crate) fn remove_at(&mut self, idx: usize) {
        let parent = self.slots[idx].parent;
        let parent_seq_num = self.slots[idx].node.event.parent_seq_num;
        let children = std::mem::take(&mut self.slots[idx].children);
        for &child in &children {
            self.slots[child].parent = parent;
            self.slots[child].node.event.parent_seq_num = parent_seq_num;
        }
        if let Some(p) = parent {
            let siblings = &mut self.slots[p].children;
            siblings.retain(|&c| c != idx);
            siblings.extend(children.iter().copied());
            siblings.sort_unstable();
        }

        for dep in std::mem::take(&mut self.slots[idx].fact_deps) {
            self.slots[dep].fact_dependents.retain(|&d| d != idx);
        }
        let dependents = std::mem::take(&mut self.slots[idx].fact_dependents);
        self.slots[idx].removed = true;
        for dependent in dependents {
            self.link_fact_deps(dependent);
        }
    }

    fn live_index(&self, seq_num: SequenceNumber) -> Option<usize> {
        self.index
            .get(&seq_num.to_string())
            .copied()
            .filter(|&i| !self.slots[i].removed)
    }

    fn related(&self, seq_num: SequenceNumber, pick: impl Fn(&Slot) -> &Vec<usize>) -> Vec<SequenceNumber> {
        match self.live_index(seq_num) {
            Some(idx) => pick(&self.slots[idx])
                .iter()
                .map(|&i| self.slots[i].node.seq_num())
                .collect(),
            None => Vec::new(),
        }
    }

    /// (Re)computes the fact edges of one node by walking up parent edges.
    fn link_fact_deps(&mut self, idx: usize) {
        for dep in std::mem::take(&mut self.slots[idx].fact_deps) {
            self.slots[dep].fact_dependents.retain(|&d| d != idx);
        }

        let mut deps = Vec::new();
        for key in self.slots[idx].node.facts.dependency_keys() {
            let mut cursor = self.slots[idx].parent;
            while let Some(ancestor) = cursor {
                let slot = &self.slots[ancestor];
                if slot.node.facts.modifies(key) {
                    if !deps.contains(&ancestor) {
                        deps.push(ancestor);
                    }
                    break;
                }
                cursor = slot.parent;
            }
        }
        deps.sort_unstable();

        for &dep in &deps {
            self.slots[dep].fact_dependents.push(idx);
        }
        self.slots[idx].fact_deps = deps;
    }
}

/// Builds a DAG from nodes starting at an empty facts snapshot.
pub fn history_dag_from_nodes(nodes: Vec<HistoryDagNode>) -> Result<HistoryDag, CoreError> {
    HistoryDag::from_nodes(nodes, FactsSnapshot::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientId, SessionId};
    use serde_json::json;

    fn node(global: u64, set: &[&str], read: &[&str], require: &[&str]) -> HistoryDagNode {
        let mut facts = FactsGroup::default();
        for k in set {
            facts.modify_set.insert(k.to_string(), json!(true));
        }
        for k in read {
            facts.dep_read.insert(k.to_string(), json!(true));
        }
        for k in require {
            facts.dep_require.insert(k.to_string(), json!(true));
        }
        let event = Event::new(
            "op",
            json!({ "n": global }),
            SequenceNumber::global_only(global),
            SequenceNumber::global_only(global - 1),
            ClientId::new(),
            SessionId::new(),
        );
        HistoryDagNode::new(event, facts)
    }

    fn seq(global: u64) -> SequenceNumber {
        SequenceNumber::global_only(global)
    }

    #[test]
    fn fact_edges_point_at_nearest_modifier() {
        let dag = history_dag_from_nodes(vec![
            node(1, &["a"], &[], &[]),
            node(2, &["a"], &[], &[]),
            node(3, &["b"], &[], &[]),
            node(4, &[], &["a"], &["b"]),
        ])
        .unwrap();

        assert_eq!(dag.len(), 4);
        assert_eq!(dag.fact_dependencies(seq(4)), vec![seq(2), seq(3)]);
        assert_eq!(dag.fact_dependents(seq(2)), vec![seq(4)]);
        assert!(dag.fact_dependents(seq(1)).is_empty());
        assert_eq!(dag.parent_of(seq(1)), Some(SequenceNumber::ROOT));
        assert_eq!(dag.children_of(seq(2)), vec![seq(3)]);

        let facts_edges = dag.edges().into_iter().filter(|e| e.kind == EdgeKind::Facts).count();
        assert_eq!(facts_edges, 2);
    }

    #[test]
    fn unsatisfied_requirement_fails_fast() {
        let err = history_dag_from_nodes(vec![
            node(1, &["a"], &[], &[]),
            node(2, &[], &[], &["b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, CoreError::MissingRequirement { key, .. } if key == "b"));
    }

    #[test]
    fn requirement_may_come_from_base_snapshot() {
        let mut base = FactsSnapshot::new();
        base.set("b", json!(true));
        let dag = HistoryDag::from_nodes(vec![node(5, &[], &[], &["b"])], base).unwrap();
        assert!(dag.fact_dependencies(seq(5)).is_empty());
        assert_eq!(dag.parent_of(seq(5)), Some(seq(4)));
    }

    #[test]
    fn unknown_parent_rejected() {
        let mut orphan = node(3, &[], &[], &[]);
        orphan.event.parent_seq_num = seq(9);
        let err = history_dag_from_nodes(vec![node(1, &[], &[], &[]), orphan]).unwrap_err();
        assert!(matches!(err, CoreError::UnknownParent { parent, .. } if parent == seq(9)));
    }

    #[test]
    fn removal_relinks_parent_and_fact_edges() {
        let mut dag = history_dag_from_nodes(vec![
            node(1, &["a"], &[], &[]),
            node(2, &["a"], &[], &[]),
            node(3, &[], &["a"], &[]),
        ])
        .unwrap();

        let removed = dag.remove_node(seq(2)).unwrap();
        assert_eq!(removed.seq_num(), seq(2));
        assert_eq!(dag.len(), 2);
        assert!(!dag.contains(seq(2)));
        assert_eq!(dag.parent_of(seq(3)), Some(seq(1)));
        assert_eq!(dag.children_of(seq(1)), vec![seq(3)]);
        assert_eq!(dag.fact_dependencies(seq(3)), vec![seq(1)]);
        assert!(dag.remove_node(seq(2)).is_err());

        dag.remove_node(seq(1)).unwrap();
        assert_eq!(dag.parent_of(seq(3)), Some(SequenceNumber::ROOT));
        assert!(dag.fact_dependencies(seq(3)).is_empty());
    }

    #[test]
    fn snapshot_follows_live_nodes() {
        let mut unset = node(2, &[], &[], &[]);
        unset.facts.modify_unset.insert("a".into(), json!(true));
        let mut dag = history_dag_from_nodes(vec![node(1, &["a", "b"], &[], &[]), unset]).unwrap();
        let snapshot = dag.facts_snapshot();
        assert!(!snapshot.has("a"));
        assert!(snapshot.has("b"));

        dag.remove_node(seq(2)).unwrap();
        assert!(dag.facts_snapshot().has("a"));
    }
}
