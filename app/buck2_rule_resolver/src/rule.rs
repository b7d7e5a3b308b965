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
use std::any::TypeId;
use std::cmp::Ordering;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use allocative::Allocative;
use dupe::Dupe;

use crate::target::label::TargetLabel;
use crate::target::node::RuleType;

/// A materialized, immutable build action for exactly one target.
///
/// `PartialEq` is the equality contract used when two constructions of the same target race:
/// the resolver keeps the first rule inserted and accepts the second only if it compares equal.
/// Implementations must therefore compare every field that determines what the rule does, and
/// nothing that merely records how or when it was built.
pub trait BuildRule: PartialEq + Allocative + Debug + Send + Sync + 'static {
    fn label(&self) -> &TargetLabel;

    fn rule_type(&self) -> &RuleType;

    /// Expose this rule as the capabilities (usually trait objects) it implements.
    ///
    /// Capabilities are fetched with [`BuildRuleRef::capability`]. A rule implementing
    /// `HasNativeLibs` would do `demand.provide::<dyn HasNativeLibs>(self)`.
    fn provide(self: Arc<Self>, demand: &mut Demand) {
        let _ = demand;
    }
}

/// A request for one capability of a rule, answered by [`BuildRule::provide`].
pub struct Demand {
    /// `TypeId` of `Arc<C>` for the requested capability `C`.
    wanted: TypeId,
    provided: Option<Box<dyn Any + Send + Sync>>,
}

impl Demand {
    fn new<C: ?Sized + Send + Sync + 'static>() -> Demand {
        Demand {
            wanted: TypeId::of::<Arc<C>>(),
            provided: None,
        }
    }

    /// Answer the demand if it asks for `C`. The first matching answer wins.
    pub fn provide<C: ?Sized + Send + Sync + 'static>(&mut self, capability: Arc<C>) -> &mut Self {
        if self.provided.is_none() && self.wanted == TypeId::of::<Arc<C>>() {
            self.provided = Some(Box::new(capability));
        }
        self
    }

    fn into_capability<C: ?Sized + Send + Sync + 'static>(self) -> Option<Arc<C>> {
        match self.provided?.downcast::<Arc<C>>() {
            Ok(capability) => Some(*capability),
            Err(_) => None,
        }
    }
}

/// Object safe view of a [`BuildRule`].
trait BuildRuleDyn: Allocative + Debug + Send + Sync + 'static {
    fn label(&self) -> &TargetLabel;
    fn rule_type(&self) -> &RuleType;
    fn type_name(&self) -> &'static str;
    /// Size of the rule itself plus the heap data it exclusively owns.
    fn allocated_bytes(&self) -> usize;
    fn provide(self: Arc<Self>, demand: &mut Demand);
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn equality(&self, other: &dyn BuildRuleDyn) -> bool;
}

impl<R: BuildRule> BuildRuleDyn for R {
    fn label(&self) -> &TargetLabel {
        BuildRule::label(self)
    }

    fn rule_type(&self) -> &RuleType {
        BuildRule::rule_type(self)
    }

    fn type_name(&self) -> &'static str {
        type_name::<R>()
    }

    fn allocated_bytes(&self) -> usize {
        std::mem::size_of::<R>() + allocative::size_of_unique_allocated_data(self)
    }

    fn provide(self: Arc<Self>, demand: &mut Demand) {
        BuildRule::provide(self, demand)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn equality(&self, other: &dyn BuildRuleDyn) -> bool {
        match other.as_any().downcast_ref::<R>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// Shared handle to a [`BuildRule`], as stored in the rule index and handed out to callers.
///
/// Equality, ordering and hashing are by label, matching the index's one-rule-per-label
/// invariant, so a sorted set of handles iterates in natural target order. Use
/// [`BuildRuleRef::equality`] to compare the rules themselves and [`BuildRuleRef::ptr_eq`] to
/// check that two handles point at the very same rule.
#[derive(Clone, Dupe, Allocative)]
pub struct BuildRuleRef(Arc<dyn BuildRuleDyn>);

impl BuildRuleRef {
    pub fn new<R: BuildRule>(rule: R) -> BuildRuleRef {
        BuildRuleRef(Arc::new(rule))
    }

    /// Wrap an existing `Arc`, so that typed lookups later return this same allocation.
    pub fn from_arc<R: BuildRule>(rule: Arc<R>) -> BuildRuleRef {
        BuildRuleRef(rule)
    }

    pub fn label(&self) -> &TargetLabel {
        self.0.label()
    }

    pub fn rule_type(&self) -> &RuleType {
        self.0.rule_type()
    }

    /// Rust type name of the concrete rule.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn is<R: BuildRule>(&self) -> bool {
        self.0.as_any().is::<R>()
    }

    pub fn downcast_ref<R: BuildRule>(&self) -> Option<&R> {
        self.0.as_any().downcast_ref()
    }

    pub fn downcast<R: BuildRule>(&self) -> Option<Arc<R>> {
        self.0.dupe().into_any().downcast::<R>().ok()
    }

    /// The rule viewed as capability `C`, if the rule provides it. `C` is usually a
    /// `dyn Trait`; the returned `Arc` shares the rule's allocation.
    pub fn capability<C: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        let mut demand = Demand::new::<C>();
        self.0.dupe().provide(&mut demand);
        demand.into_capability()
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.0.allocated_bytes()
    }

    /// Whether both handles hold rules of the same type that compare equal.
    pub fn equality(&self, other: &BuildRuleRef) -> bool {
        self.ptr_eq(other) || self.0.equality(&*other.0)
    }

    pub fn ptr_eq(&self, other: &BuildRuleRef) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl Debug for BuildRuleRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for BuildRuleRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.rule_type())
    }
}

impl PartialEq for BuildRuleRef {
    fn eq(&self, other: &BuildRuleRef) -> bool {
        self.label() == other.label()
    }
}

impl Eq for BuildRuleRef {}

impl PartialOrd for BuildRuleRef {
    fn partial_cmp(&self, other: &BuildRuleRef) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BuildRuleRef {
    fn cmp(&self, other: &BuildRuleRef) -> Ordering {
        self.label().cmp(other.label())
    }
}

impl Hash for BuildRuleRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.label().hash(state)
    }
}
