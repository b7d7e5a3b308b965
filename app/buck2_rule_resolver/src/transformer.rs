/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use crate::resolver::BuildRuleResolver;
use crate::rule::BuildRuleRef;
use crate::target::graph::TargetGraph;
use crate::target::node::TargetNode;

/// Turns one target node into its build rule.
///
/// Implementations must be deterministic for a given graph and resolver state, and must return
/// a rule labelled with the node's own label. They may call [`BuildRuleResolver::require_rule`]
/// for the node's dependencies; the resolver holds no lock while a transformer runs.
pub trait TargetNodeToBuildRuleTransformer: Send + Sync {
    fn transform(
        &self,
        graph: &TargetGraph,
        resolver: &BuildRuleResolver,
        node: &TargetNode,
    ) -> anyhow::Result<BuildRuleRef>;
}

/// Builds each rule with the [`crate::target::node::Description`] the node was declared with.
#[derive(Default, Clone, Copy)]
pub struct DefaultTargetNodeToBuildRuleTransformer;

impl TargetNodeToBuildRuleTransformer for DefaultTargetNodeToBuildRuleTransformer {
    fn transform(
        &self,
        graph: &TargetGraph,
        resolver: &BuildRuleResolver,
        node: &TargetNode,
    ) -> anyhow::Result<BuildRuleRef> {
        node.description().create_build_rule(graph, resolver, node)
    }
}

impl<F> TargetNodeToBuildRuleTransformer for F
where
    F: Fn(&TargetGraph, &BuildRuleResolver, &TargetNode) -> anyhow::Result<BuildRuleRef>
        + Send
        + Sync,
{
    fn transform(
        &self,
        graph: &TargetGraph,
        resolver: &BuildRuleResolver,
        node: &TargetNode,
    ) -> anyhow::Result<BuildRuleRef> {
        self(graph, resolver, node)
    }
}
