//! History compaction.
//!
//! Walks candidates from the leaves toward the root. For each candidate the
//! sub-DAG grows level by level along fact-dependency edges, and every level
//! is compared against earlier sub-DAGs (nearest first). An earlier sub-DAG
//! that is at least as large, is depended on by nothing outside itself and
//! whose effects the candidate replaces gets removed. Runs to a fixpoint.

use std::collections::BTreeSet;

use crate::facts::{FactsGroup, replaces_facts};
use crate::history_dag::HistoryDag;

/// Compacts `dag` and returns the result.
pub fn compact_events(mut dag: HistoryDag) -> HistoryDag {
    compact(&mut dag);
    dag
}

/// Compacts in place. Returns the number of removed nodes.
pub fn compact(dag: &mut HistoryDag) -> usize {
    let mut removed = 0;
    while let Some(target) = find_replaced(dag) {
        for idx in target.into_iter().rev() {
            dag.remove_at(idx);
            removed += 1;
        }
    }
    removed
}

fn find_replaced(dag: &HistoryDag) -> Option<BTreeSet<usize>> {
    let live = dag.live_indices();
    for &candidate in live.iter().rev() {
        if !dag.slot(candidate).node.facts.has_modifications() {
            continue;
        }

        for sub in levels(dag, candidate) {
            let sub_facts = merged(dag, &sub);
            if !sub_facts.has_modifications() {
                continue;
            }
            let Some(&earliest) = sub.first() else {
                continue;
            };

            for &start in live.iter().rev().filter(|&&i| i < earliest) {
                for target in levels(dag, start) {
                    if target.len() < sub.len() {
                        continue;
                    }
                    if has_outside_dependents(dag, &target) {
                        continue;
                    }
                    let target_facts = merged(dag, &target);
                    if target_facts.has_modifications() && replaces_facts(&sub_facts, &target_facts)
                    {
                        return Some(target);
                    }
                }
            }
        }
    }
    None
}

/// Sub-DAGs rooted at `start`: `{start}`, then each level adds the fact
/// dependencies of the previous one, until nothing new is reached.
fn levels(dag: &HistoryDag, start: usize) -> Vec<BTreeSet<usize>> {
    let mut current = BTreeSet::from([start]);
    let mut out = vec![current.clone()];
    loop {
        let mut next = current.clone();
        for &idx in &current {
            next.extend(dag.slot(idx).fact_deps.iter().copied());
        }
        if next.len() == current.len() {
            return out;
        }
        out.push(next.clone());
        current = next;
    }
}

fn merged(dag: &HistoryDag, members: &BTreeSet<usize>) -> FactsGroup {
    let mut group = FactsGroup::default();
    for &idx in members {
        group.merge_after(&dag.slot(idx).node.facts);
    }
    group
}

fn has_outside_dependents(dag: &HistoryDag, members: &BTreeSet<usize>) -> bool {
    members.iter().any(|&idx| {
        dag.slot(idx)
            .fact_dependents
            .iter()
            .any(|d| !members.contains(d))
    })
}
