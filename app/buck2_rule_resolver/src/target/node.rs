/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::any::type_name;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use allocative::Allocative;
use derive_more::Display;
use dupe::Dupe;

use crate::resolver::metadata::MetadataType;
use crate::resolver::metadata::MetadataValue;
use crate::resolver::BuildRuleResolver;
use crate::rule::BuildRuleRef;
use crate::target::graph::TargetGraph;
use crate::target::label::TargetLabel;

/// The kind of a rule, e.g. `cxx_library`.
#[derive(Clone, Dupe, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Allocative)]
#[display(fmt = "{}", _0)]
pub struct RuleType(Arc<str>);

impl RuleType {
    pub fn new(name: &str) -> RuleType {
        RuleType(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// The coerced arguments a target was declared with. The resolver never looks inside, it only
/// hands the value to the node's [`Description`] and checks its concrete type when metadata of
/// that type is requested.
#[derive(Clone, Dupe)]
pub struct ConstructorArg {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ConstructorArg {
    pub fn new<T: Any + Send + Sync>(value: T) -> ConstructorArg {
        ConstructorArg {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// The argument as `Arc<T>`, sharing the allocation held by the node.
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.dupe().downcast::<T>().ok()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn metadata_type(&self) -> MetadataType {
        MetadataType::from_parts((*self.value).type_id(), self.type_name)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn as_metadata_value(&self) -> MetadataValue {
        MetadataValue::from_erased(self.value.dupe(), self.metadata_type())
    }
}

impl Debug for ConstructorArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructorArg")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// The strategy that knows how to interpret a node's [`ConstructorArg`] and build a rule out of
/// it. One instance is usually shared by every node of the same [`RuleType`].
pub trait Description: Send + Sync + 'static {
    fn rule_type(&self) -> RuleType;

    /// Build the rule for `node`. Rules for dependencies are obtained through `resolver`.
    fn create_build_rule(
        &self,
        graph: &TargetGraph,
        resolver: &BuildRuleResolver,
        node: &TargetNode,
    ) -> anyhow::Result<BuildRuleRef>;

    /// The metadata capability, for descriptions that can derive typed facts about a node
    /// without building its rule.
    fn metadata_provider(&self) -> Option<&dyn MetadataProvidingDescription> {
        None
    }
}

/// Capability of a [`Description`] to answer metadata requests.
pub trait MetadataProvidingDescription: Send + Sync {
    /// Produce a value of type `requested` for `label`, or `None` if this description has no
    /// such metadata. The returned value must be of exactly the requested type.
    fn create_metadata(
        &self,
        label: &TargetLabel,
        resolver: &BuildRuleResolver,
        arg: &ConstructorArg,
        requested: MetadataType,
    ) -> anyhow::Result<Option<MetadataValue>>;
}

/// A single declaration in the target graph.
#[derive(Clone, Dupe)]
pub struct TargetNode(Arc<TargetNodeData>);

struct TargetNodeData {
    label: TargetLabel,
    deps: BTreeSet<TargetLabel>,
    constructor_arg: ConstructorArg,
    description: Arc<dyn Description>,
}

impl TargetNode {
    pub fn new(
        label: TargetLabel,
        deps: impl IntoIterator<Item = TargetLabel>,
        constructor_arg: ConstructorArg,
        description: Arc<dyn Description>,
    ) -> TargetNode {
        TargetNode(Arc::new(TargetNodeData {
            label,
            deps: deps.into_iter().collect(),
            constructor_arg,
            description,
        }))
    }

    pub fn label(&self) -> &TargetLabel {
        &self.0.label
    }

    pub fn rule_type(&self) -> RuleType {
        self.0.description.rule_type()
    }

    /// Declared dependencies, in label order.
    pub fn deps(&self) -> impl ExactSizeIterator<Item = &TargetLabel> + '_ {
        self.0.deps.iter()
    }

    pub fn constructor_arg(&self) -> &ConstructorArg {
        &self.0.constructor_arg
    }

    pub fn description(&self) -> &dyn Description {
        &*self.0.description
    }
}

impl Debug for TargetNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetNode")
            .field("label", &self.0.label)
            .field("rule_type", &self.rule_type())
            .field("deps", &self.0.deps)
            .field("constructor_arg", &self.0.constructor_arg)
            .finish()
    }
}
