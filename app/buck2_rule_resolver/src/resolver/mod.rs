/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The build rule resolver: maps each target label to the one build rule built for it.

pub mod error;
pub mod metadata;
#[cfg(test)]
mod tests;

use std::any::type_name;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dupe::Dupe;

use crate::config::BuildRuleResolverConfig;
use crate::events::ConstructionOutcome;
use crate::events::ResolverEvent;
use crate::events::ResolverEventDispatcher;
use crate::events::ResolverEventSink;
use crate::resolver::error::BuildRuleResolverError;
use crate::resolver::metadata::MetadataCache;
use crate::resolver::metadata::MetadataType;
use crate::resolver::metadata::MetadataValue;
use crate::rule::BuildRule;
use crate::rule::BuildRuleRef;
use crate::target::graph::TargetGraph;
use crate::target::label::TargetLabel;
use crate::target::node::TargetNode;
use crate::transformer::TargetNodeToBuildRuleTransformer;

/// Lazily materializes the build rules of a target graph.
///
/// One resolver lives for one build. Its rule index only ever grows: the first rule inserted for
/// a label stays there for the resolver's lifetime. Every operation takes `&self` and may be
/// called from any number of threads; no lock is held while a rule is being constructed, so
/// transformers can freely require the rules of their dependencies.
pub struct BuildRuleResolver {
    target_graph: TargetGraph,
    transformer: Arc<dyn TargetNodeToBuildRuleTransformer>,
    events: Option<ResolverEventDispatcher>,
    slow_construction_threshold: Option<Duration>,
    build_rule_index: DashMap<TargetLabel, BuildRuleRef>,
    metadata_cache: MetadataCache,
    metrics: ResolverCounters,
}

#[derive(Default)]
struct ResolverCounters {
    constructions: AtomicU64,
    redundant_constructions: AtomicU64,
    failed_constructions: AtomicU64,
}

/// Point-in-time counters for a resolver, for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRuleResolverMetrics {
    pub rule_count: usize,
    pub metadata_entry_count: usize,
    /// Calls into the transformer, successful or not.
    pub constructions: u64,
    /// Constructions whose result was dropped because an equal rule won a race.
    pub redundant_constructions: u64,
    pub failed_constructions: u64,
}

pub struct BuildRuleResolverBuilder {
    target_graph: TargetGraph,
    transformer: Arc<dyn TargetNodeToBuildRuleTransformer>,
    config: BuildRuleResolverConfig,
    events: Option<ResolverEventDispatcher>,
}

impl BuildRuleResolverBuilder {
    pub fn config(mut self, config: BuildRuleResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_sink<T: ResolverEventSink + 'static>(mut self, sink: T) -> Self {
        self.events = Some(ResolverEventDispatcher::new(sink));
        self
    }

    pub fn event_dispatcher(mut self, events: ResolverEventDispatcher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> anyhow::Result<BuildRuleResolver> {
        self.config.validate()?;
        let build_rule_index = match self.config.index_shard_amount {
            Some(shards) => {
                DashMap::with_capacity_and_shard_amount(self.config.index_capacity, shards)
            }
            None => DashMap::with_capacity(self.config.index_capacity),
        };
        Ok(BuildRuleResolver {
            target_graph: self.target_graph,
            transformer: self.transformer,
            events: self.events,
            slow_construction_threshold: self.config.slow_construction_threshold,
            build_rule_index,
            metadata_cache: MetadataCache::default(),
            metrics: ResolverCounters::default(),
        })
    }
}

impl BuildRuleResolver {
    pub fn builder(
        target_graph: TargetGraph,
        transformer: impl TargetNodeToBuildRuleTransformer + 'static,
    ) -> BuildRuleResolverBuilder {
        BuildRuleResolverBuilder {
            target_graph,
            transformer: Arc::new(transformer),
            config: BuildRuleResolverConfig::default(),
            events: None,
        }
    }

    /// A resolver with default configuration and no event sink.
    pub fn new(
        target_graph: TargetGraph,
        transformer: impl TargetNodeToBuildRuleTransformer + 'static,
    ) -> BuildRuleResolver {
        BuildRuleResolver {
            target_graph,
            transformer: Arc::new(transformer),
            events: None,
            slow_construction_threshold: None,
            build_rule_index: DashMap::new(),
            metadata_cache: MetadataCache::default(),
            metrics: ResolverCounters::default(),
        }
    }

    pub fn target_graph(&self) -> &TargetGraph {
        &self.target_graph
    }

    /// The sink instrumentation events go to, if any.
    pub fn event_dispatcher(&self) -> Option<&ResolverEventDispatcher> {
        self.events.as_ref()
    }

    /// Snapshot of every rule materialized so far, in no particular order.
    pub fn build_rules(&self) -> Vec<BuildRuleRef> {
        self.build_rule_index
            .iter()
            .map(|entry| entry.value().dupe())
            .collect()
    }

    /// The rule already materialized for `target`. Fails if it was never required or added,
    /// which usually means the caller forgot to require a dependency first.
    pub fn get_rule(&self, target: &TargetLabel) -> anyhow::Result<BuildRuleRef> {
        self.get_rule_optional(target)
            .ok_or_else(|| BuildRuleResolverError::UnresolvedTarget(target.dupe()).into())
    }

    pub fn get_rule_optional(&self, target: &TargetLabel) -> Option<BuildRuleRef> {
        // Clone out so no shard lock outlives this call.
        self.build_rule_index
            .get(target)
            .map(|entry| entry.value().dupe())
    }

    /// `get_rule` as a closure, for mapping over collections of labels.
    pub fn rule_getter(&self) -> impl Fn(&TargetLabel) -> anyhow::Result<BuildRuleRef> + '_ {
        move |target: &TargetLabel| self.get_rule(target)
    }

    /// Returns the rule for `target`, constructing it with the transformer if needed.
    ///
    /// Two callers racing on the same target may both construct it. The first rule inserted wins;
    /// the other caller gets the winner back if its own rule is equal to it, and an
    /// [`BuildRuleResolverError::InconsistentRuleConstruction`] error otherwise. Construction
    /// failures are not remembered, so a later call tries again.
    pub fn require_rule(&self, target: &TargetLabel) -> anyhow::Result<BuildRuleRef> {
        if let Some(rule) = self.get_rule_optional(target) {
            return Ok(rule);
        }
        let node = self.target_graph.get(target)?;
        let start = Instant::now();
        let rule_type = node.rule_type();
        self.event(|| ResolverEvent::RuleConstructionStart {
            target: target.dupe(),
            rule_type: rule_type.dupe(),
        });

        let res = self.construct_and_insert(target, node);

        let duration = start.elapsed();
        let outcome = match &res {
            Ok((_, outcome)) => *outcome,
            Err(e) => match e.downcast_ref::<BuildRuleResolverError>() {
                Some(BuildRuleResolverError::InconsistentRuleConstruction { .. }) => {
                    ConstructionOutcome::Inconsistent
                }
                _ => ConstructionOutcome::Failed,
            },
        };
        if outcome == ConstructionOutcome::Failed {
            self.metrics
                .failed_constructions
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Some(threshold) = self.slow_construction_threshold {
            if duration > threshold {
                tracing::warn!(
                    "Constructing build rule for `{}` ({}) took {:.3}s",
                    target,
                    rule_type,
                    duration.as_secs_f64()
                );
            }
        }
        self.event(|| ResolverEvent::RuleConstructionEnd {
            target: target.dupe(),
            rule_type,
            outcome,
            duration,
        });

        res.map(|(rule, _)| rule)
    }

    fn construct_and_insert(
        &self,
        target: &TargetLabel,
        node: &TargetNode,
    ) -> anyhow::Result<(BuildRuleRef, ConstructionOutcome)> {
        self.metrics.constructions.fetch_add(1, Ordering::Relaxed);
        let rule = self
            .transformer
            .transform(&self.target_graph, self, node)
            .with_context(|| format!("Error constructing build rule for `{}`", target))?;
        if rule.label() != target {
            return Err(BuildRuleResolverError::RuleLabelMismatch {
                expected: target.dupe(),
                actual: rule.label().dupe(),
            }
            .into());
        }

        let existing = match self.build_rule_index.entry(target.dupe()) {
            Entry::Vacant(v) => {
                v.insert(rule.dupe());
                tracing::debug!("Constructed build rule `{}`", rule);
                return Ok((rule, ConstructionOutcome::Inserted));
            }
            Entry::Occupied(o) => o.get().dupe(),
        };
        // The transformer already put this very rule in the index itself.
        if existing.ptr_eq(&rule) {
            tracing::debug!("Constructed build rule `{}`", rule);
            return Ok((rule, ConstructionOutcome::Inserted));
        }
        // The shard lock is released by now, comparing may run arbitrary rule code.
        if existing.equality(&rule) {
            self.metrics
                .redundant_constructions
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Discarding redundant construction of `{}`", target);
            Ok((existing, ConstructionOutcome::Redundant))
        } else {
            let err = BuildRuleResolverError::inconsistent(target, &rule, &existing);
            tracing::error!("{}", err);
            Err(err.into())
        }
    }

    /// Requires every target, returning the rules in label order.
    pub fn require_all_rules<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a TargetLabel>,
    ) -> anyhow::Result<BTreeSet<BuildRuleRef>> {
        targets
            .into_iter()
            .map(|target| self.require_rule(target))
            .collect()
    }

    /// Like [`BuildRuleResolver::require_all_rules`], but every rule must already exist.
    pub fn get_all_rules<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a TargetLabel>,
    ) -> anyhow::Result<BTreeSet<BuildRuleRef>> {
        targets
            .into_iter()
            .map(|target| self.get_rule(target))
            .collect()
    }

    /// Inserts a rule built outside of the transformer, e.g. a flavored variant of the rule
    /// currently under construction. Adding the very same rule twice is a no-op; adding a
    /// different rule for an already populated label fails.
    pub fn add_to_index(&self, rule: BuildRuleRef) -> anyhow::Result<BuildRuleRef> {
        match self.build_rule_index.entry(rule.label().dupe()) {
            Entry::Vacant(v) => {
                v.insert(rule.dupe());
                Ok(rule)
            }
            Entry::Occupied(o) if o.get().ptr_eq(&rule) => Ok(rule),
            Entry::Occupied(o) => {
                Err(BuildRuleResolverError::DuplicateRule(o.key().dupe()).into())
            }
        }
    }

    /// Adds each rule in turn. Rules added before a failure stay in the index.
    pub fn add_all_to_index<C>(&self, rules: C) -> anyhow::Result<C>
    where
        for<'a> &'a C: IntoIterator<Item = &'a BuildRuleRef>,
    {
        for rule in &rules {
            self.add_to_index(rule.dupe())?;
        }
        Ok(rules)
    }

    /// The rule for `target` as a `R`, or `None` if no rule exists yet. Fails if the rule exists
    /// but has a different type.
    pub fn get_rule_optional_with_type<R: BuildRule>(
        &self,
        target: &TargetLabel,
    ) -> anyhow::Result<Option<Arc<R>>> {
        match self.get_rule_optional(target) {
            None => Ok(None),
            Some(rule) => match rule.downcast::<R>() {
                Some(rule) => Ok(Some(rule)),
                None => Err(BuildRuleResolverError::TypeMismatch {
                    target: target.dupe(),
                    expected: type_name::<R>(),
                    actual: rule.type_name(),
                }
                .into()),
            },
        }
    }

    pub fn get_rule_with_type<R: BuildRule>(&self, target: &TargetLabel) -> anyhow::Result<Arc<R>> {
        self.get_rule_optional_with_type(target)?
            .ok_or_else(|| BuildRuleResolverError::UnresolvedTarget(target.dupe()).into())
    }

    /// The rule for `target` viewed as capability `C` (see [`BuildRule::provide`]), or `None` if
    /// no rule exists yet. Fails if the rule exists but does not provide `C`.
    pub fn get_rule_optional_with_capability<C: ?Sized + Send + Sync + 'static>(
        &self,
        target: &TargetLabel,
    ) -> anyhow::Result<Option<Arc<C>>> {
        match self.get_rule_optional(target) {
            None => Ok(None),
            Some(rule) => match rule.capability::<C>() {
                Some(capability) => Ok(Some(capability)),
                None => Err(BuildRuleResolverError::TypeMismatch {
                    target: target.dupe(),
                    expected: type_name::<C>(),
                    actual: rule.type_name(),
                }
                .into()),
            },
        }
    }

    pub fn get_rule_with_capability<C: ?Sized + Send + Sync + 'static>(
        &self,
        target: &TargetLabel,
    ) -> anyhow::Result<Arc<C>> {
        self.get_rule_optional_with_capability(target)?
            .ok_or_else(|| BuildRuleResolverError::UnresolvedTarget(target.dupe()).into())
    }

    /// Metadata of type `T` for `target`, derived at most once per `(target, T)` and cached
    /// whether present or absent.
    ///
    /// If the node's constructor argument is itself a `T`, it is returned as is. Otherwise the
    /// node's description is asked, if it has the metadata capability. Errors from looking up the
    /// node or from the derivation are returned and not cached.
    pub fn require_metadata<T: Any + Send + Sync>(
        &self,
        target: &TargetLabel,
    ) -> anyhow::Result<Option<Arc<T>>> {
        let metadata_type = MetadataType::of::<T>();
        let value = self
            .metadata_cache
            .get_or_try_compute(target, metadata_type, || {
                self.derive_metadata(target, metadata_type)
            })?;
        match value {
            None => Ok(None),
            Some(value) => match value.downcast::<T>() {
                Some(value) => Ok(Some(value)),
                None => Err(BuildRuleResolverError::MetadataTypeMismatch {
                    target: target.dupe(),
                    expected: metadata_type.name(),
                    actual: value.metadata_type().name(),
                }
                .into()),
            },
        }
    }

    fn derive_metadata(
        &self,
        target: &TargetLabel,
        metadata_type: MetadataType,
    ) -> anyhow::Result<Option<MetadataValue>> {
        let node = self.target_graph.get(target)?;
        let arg = node.constructor_arg();
        if arg.metadata_type() == metadata_type {
            return Ok(Some(arg.as_metadata_value()));
        }
        let provider = match node.description().metadata_provider() {
            Some(provider) => provider,
            None => return Ok(None),
        };

        let start = Instant::now();
        let value = provider.create_metadata(target, self, arg, metadata_type)?;
        if let Some(value) = &value {
            if value.metadata_type() != metadata_type {
                return Err(BuildRuleResolverError::MetadataTypeMismatch {
                    target: target.dupe(),
                    expected: metadata_type.name(),
                    actual: value.metadata_type().name(),
                }
                .into());
            }
        }
        self.event(|| ResolverEvent::MetadataDerived {
            target: target.dupe(),
            metadata_type: metadata_type.name(),
            present: value.is_some(),
            duration: start.elapsed(),
        });
        Ok(value)
    }

    pub fn metrics(&self) -> BuildRuleResolverMetrics {
        BuildRuleResolverMetrics {
            rule_count: self.build_rule_index.len(),
            metadata_entry_count: self.metadata_cache.len(),
            constructions: self.metrics.constructions.load(Ordering::Relaxed),
            redundant_constructions: self
                .metrics
                .redundant_constructions
                .load(Ordering::Relaxed),
            failed_constructions: self.metrics.failed_constructions.load(Ordering::Relaxed),
        }
    }

    /// Memory held by the materialized rules, each rule plus the heap data it owns, as measured
    /// by `allocative`.
    pub fn rules_allocated_bytes(&self) -> usize {
        self.build_rules()
            .iter()
            .map(|rule| rule.allocated_bytes())
            .sum()
    }

    fn event(&self, event: impl FnOnce() -> ResolverEvent) {
        if let Some(events) = &self.events {
            events.event(event());
        }
    }
}
