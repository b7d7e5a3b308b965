/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Rules, descriptions and nodes for tests.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use allocative::Allocative;
use dupe::Dupe;

use crate::resolver::metadata::MetadataType;
use crate::resolver::metadata::MetadataValue;
use crate::resolver::BuildRuleResolver;
use crate::rule::BuildRule;
use crate::rule::BuildRuleRef;
use crate::rule::Demand;
use crate::target::graph::TargetGraph;
use crate::target::label::TargetLabel;
use crate::target::node::ConstructorArg;
use crate::target::node::Description;
use crate::target::node::MetadataProvidingDescription;
use crate::target::node::RuleType;
use crate::target::node::TargetNode;

#[derive(Debug, PartialEq, Allocative)]
pub struct FakeRule {
    label: TargetLabel,
    rule_type: RuleType,
    deps: Vec<TargetLabel>,
    payload: String,
}

impl FakeRule {
    pub fn new(label: TargetLabel, deps: Vec<TargetLabel>, payload: String) -> FakeRule {
        FakeRule {
            label,
            rule_type: RuleType::new(FakeDescription::RULE_TYPE),
            deps,
            payload,
        }
    }

    pub fn testing_new(label: &str, deps: &[&str], payload: &str) -> FakeRule {
        FakeRule::new(
            TargetLabel::testing_parse(label),
            deps.iter().map(|d| TargetLabel::testing_parse(d)).collect(),
            payload.to_owned(),
        )
    }

    pub fn deps(&self) -> &[TargetLabel] {
        &self.deps
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl BuildRule for FakeRule {
    fn label(&self) -> &TargetLabel {
        &self.label
    }

    fn rule_type(&self) -> &RuleType {
        &self.rule_type
    }

    fn provide(self: Arc<Self>, demand: &mut Demand) {
        demand.provide::<dyn HasFakeDeps>(self);
    }
}

/// Capability of rules that know the labels of the rules they were built from.
pub trait HasFakeDeps: Send + Sync {
    fn fake_deps(&self) -> &[TargetLabel];
}

impl HasFakeDeps for FakeRule {
    fn fake_deps(&self) -> &[TargetLabel] {
        &self.deps
    }
}

/// Constructor argument of nodes described by [`FakeDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeArg {
    pub payload: String,
}

/// Metadata answered by [`FakeDescription`]: the number of nodes in the dependency tree below a
/// target, counting shared dependencies once per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepTreeSize(pub usize);

/// Builds a [`FakeRule`] per node after requiring all of the node's deps, and counts how often it
/// is asked to do so.
pub struct FakeDescription {
    provides_metadata: bool,
    rule_constructions: AtomicUsize,
    metadata_derivations: AtomicUsize,
}

impl FakeDescription {
    pub const RULE_TYPE: &'static str = "fake_rule";

    pub fn new() -> Arc<FakeDescription> {
        Arc::new(FakeDescription {
            provides_metadata: false,
            rule_constructions: AtomicUsize::new(0),
            metadata_derivations: AtomicUsize::new(0),
        })
    }

    /// A description that also answers [`DepTreeSize`] metadata requests.
    pub fn with_metadata() -> Arc<FakeDescription> {
        Arc::new(FakeDescription {
            provides_metadata: true,
            rule_constructions: AtomicUsize::new(0),
            metadata_derivations: AtomicUsize::new(0),
        })
    }

    pub fn rule_constructions(&self) -> usize {
        self.rule_constructions.load(Ordering::SeqCst)
    }

    pub fn metadata_derivations(&self) -> usize {
        self.metadata_derivations.load(Ordering::SeqCst)
    }
}

impl Description for FakeDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::new(Self::RULE_TYPE)
    }

    fn create_build_rule(
        &self,
        _graph: &TargetGraph,
        resolver: &BuildRuleResolver,
        node: &TargetNode,
    ) -> anyhow::Result<BuildRuleRef> {
        self.rule_constructions.fetch_add(1, Ordering::SeqCst);
        let deps = resolver.require_all_rules(node.deps())?;
        let payload = match node.constructor_arg().downcast_ref::<FakeArg>() {
            Some(arg) => arg.payload.clone(),
            None => String::new(),
        };
        Ok(BuildRuleRef::new(FakeRule::new(
            node.label().dupe(),
            deps.iter().map(|d| d.label().dupe()).collect(),
            payload,
        )))
    }

    fn metadata_provider(&self) -> Option<&dyn MetadataProvidingDescription> {
        if self.provides_metadata {
            Some(self as &dyn MetadataProvidingDescription)
        } else {
            None
        }
    }
}

impl MetadataProvidingDescription for FakeDescription {
    fn create_metadata(
        &self,
        label: &TargetLabel,
        resolver: &BuildRuleResolver,
        _arg: &ConstructorArg,
        requested: MetadataType,
    ) -> anyhow::Result<Option<MetadataValue>> {
        if !requested.is::<DepTreeSize>() {
            return Ok(None);
        }
        self.metadata_derivations.fetch_add(1, Ordering::SeqCst);
        let node = resolver.target_graph().get(label)?;
        let mut size = 0;
        for dep in node.deps() {
            let dep_size = resolver.require_metadata::<DepTreeSize>(dep)?;
            size += 1 + dep_size.map_or(0, |s| s.0);
        }
        Ok(Some(MetadataValue::new(DepTreeSize(size))))
    }
}

/// A node described by `description`, whose constructor argument is a [`FakeArg`] carrying the
/// label as payload.
pub fn testing_node_with_description(
    label: &str,
    deps: &[&str],
    description: Arc<dyn Description>,
) -> TargetNode {
    TargetNode::new(
        TargetLabel::testing_parse(label),
        deps.iter().map(|d| TargetLabel::testing_parse(d)),
        ConstructorArg::new(FakeArg {
            payload: label.to_owned(),
        }),
        description,
    )
}

/// A node with a fresh [`FakeDescription`].
pub fn testing_node(label: &str, deps: &[&str]) -> TargetNode {
    testing_node_with_description(label, deps, FakeDescription::new())
}

/// A graph where every node shares `description`.
pub fn testing_graph(
    nodes: &[(&str, &[&str])],
    description: Arc<FakeDescription>,
) -> TargetGraph {
    TargetGraph::new(
        nodes
            .iter()
            .map(|(label, deps)| testing_node_with_description(label, deps, description.dupe())),
    )
    .unwrap()
}
