/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::collections::BTreeMap;
use std::sync::Arc;

use dupe::Dupe;
use indexmap::IndexSet;
use itertools::Itertools;

use crate::target::label::TargetLabel;
use crate::target::node::TargetNode;

#[derive(Debug, thiserror::Error)]
pub enum TargetGraphError {
    #[error("No such target in the target graph: `{0}`")]
    NoSuchTarget(TargetLabel),
    #[error("Target `{0}` is declared more than once")]
    DuplicateTarget(TargetLabel),
    #[error("Target `{0}` depends on `{1}`, which is not in the target graph")]
    MissingDependency(TargetLabel, TargetLabel),
    #[error("Cycle in target graph: {}", .0.iter().join(" -> "))]
    Cycle(Vec<TargetLabel>),
}

/// Immutable graph of target nodes, keyed by label. Edges are the nodes' declared deps.
#[derive(Clone, Dupe)]
pub struct TargetGraph(Arc<BTreeMap<TargetLabel, TargetNode>>);

impl TargetGraph {
    /// Build a graph from `nodes`, checking that labels are unique, that every declared dep is
    /// part of the graph and that there are no cycles.
    pub fn new(nodes: impl IntoIterator<Item = TargetNode>) -> anyhow::Result<TargetGraph> {
        let mut map = BTreeMap::new();
        for node in nodes {
            let label = node.label().dupe();
            if map.insert(label.dupe(), node).is_some() {
                return Err(TargetGraphError::DuplicateTarget(label).into());
            }
        }
        for node in map.values() {
            for dep in node.deps() {
                if !map.contains_key(dep) {
                    return Err(TargetGraphError::MissingDependency(
                        node.label().dupe(),
                        dep.dupe(),
                    )
                    .into());
                }
            }
        }
        check_acyclic(&map)?;
        Ok(TargetGraph(Arc::new(map)))
    }

    pub fn empty() -> TargetGraph {
        TargetGraph(Arc::new(BTreeMap::new()))
    }

    pub fn get(&self, label: &TargetLabel) -> anyhow::Result<&TargetNode> {
        self.get_optional(label)
            .ok_or_else(|| TargetGraphError::NoSuchTarget(label.dupe()).into())
    }

    pub fn get_optional(&self, label: &TargetLabel) -> Option<&TargetNode> {
        self.0.get(label)
    }

    pub fn contains(&self, label: &TargetLabel) -> bool {
        self.0.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All nodes, in label order.
    pub fn nodes(&self) -> impl ExactSizeIterator<Item = &TargetNode> + '_ {
        self.0.values()
    }

    pub fn deps<'a>(&'a self, node: &'a TargetNode) -> impl Iterator<Item = &'a TargetNode> + 'a {
        // Deps were checked to exist at construction.
        node.deps().filter_map(|dep| self.0.get(dep))
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    InProgress,
    Done,
}

fn check_acyclic(map: &BTreeMap<TargetLabel, TargetNode>) -> Result<(), TargetGraphError> {
    fn visit<'a>(
        label: &'a TargetLabel,
        map: &'a BTreeMap<TargetLabel, TargetNode>,
        state: &mut BTreeMap<&'a TargetLabel, Visit>,
        stack: &mut IndexSet<&'a TargetLabel>,
    ) -> Result<(), TargetGraphError> {
        match state.get(label) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = stack.get_index_of(label).unwrap_or(0);
                let mut cycle: Vec<TargetLabel> =
                    stack.iter().skip(start).map(|l| (*l).dupe()).collect();
                cycle.push(label.dupe());
                return Err(TargetGraphError::Cycle(cycle));
            }
            None => {}
        }
        state.insert(label, Visit::InProgress);
        stack.insert(label);
        if let Some(node) = map.get(label) {
            for dep in node.deps() {
                visit(dep, map, state, stack)?;
            }
        }
        stack.pop();
        state.insert(label, Visit::Done);
        Ok(())
    }

    let mut state = BTreeMap::new();
    let mut stack = IndexSet::new();
    for label in map.keys() {
        visit(label, map, &mut state, &mut stack)?;
    }
    Ok(())
}
