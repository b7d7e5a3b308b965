/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dupe::Dupe;

use crate::config::BuildRuleResolverConfig;
use crate::events::create_source_sink_pair;
use crate::events::ConstructionOutcome;
use crate::events::ResolverEvent;
use crate::resolver::error::BuildRuleResolverError;
use crate::resolver::metadata::MetadataType;
use crate::resolver::metadata::MetadataValue;
use crate::resolver::BuildRuleResolver;
use crate::rule::BuildRuleRef;
use crate::target::graph::TargetGraph;
use crate::target::graph::TargetGraphError;
use crate::target::label::TargetLabel;
use crate::target::node::ConstructorArg;
use crate::target::node::Description;
use crate::target::node::MetadataProvidingDescription;
use crate::target::node::RuleType;
use crate::target::node::TargetNode;
use crate::testing::testing_graph;
use crate::testing::testing_node_with_description;
use crate::testing::DepTreeSize;
use crate::testing::FakeArg;
use crate::testing::FakeDescription;
use crate::testing::FakeRule;
use crate::testing::HasFakeDeps;
use crate::transformer::DefaultTargetNodeToBuildRuleTransformer;
use crate::transformer::TargetNodeToBuildRuleTransformer;

fn label(s: &str) -> TargetLabel {
    TargetLabel::testing_parse(s)
}

fn resolver_error(e: &anyhow::Error) -> &BuildRuleResolverError {
    match e.downcast_ref::<BuildRuleResolverError>() {
        Some(e) => e,
        None => panic!("expected a resolver error, got: {:#}", e),
    }
}

/// `//a:a` depends on `//b:b` and `//c:c`, both of which depend on `//d:d`.
fn diamond(description: Arc<FakeDescription>) -> BuildRuleResolver {
    BuildRuleResolver::new(
        testing_graph(
            &[
                ("//a:a", &["//b:b", "//c:c"]),
                ("//b:b", &["//d:d"]),
                ("//c:c", &["//d:d"]),
                ("//d:d", &[]),
            ],
            description,
        ),
        DefaultTargetNodeToBuildRuleTransformer,
    )
}

#[test]
fn test_require_rule_is_idempotent() -> anyhow::Result<()> {
    let description = FakeDescription::new();
    let resolver = diamond(description.dupe());

    let a = resolver.require_rule(&label("//a:a"))?;
    assert_eq!(4, description.rule_constructions());
    let a_again = resolver.require_rule(&label("//a:a"))?;
    assert!(a.ptr_eq(&a_again));
    assert_eq!(4, description.rule_constructions());

    let rule = a.downcast_ref::<FakeRule>().unwrap();
    assert_eq!(vec![label("//b:b"), label("//c:c")], rule.deps());
    assert_eq!("//a:a", rule.payload());

    let metrics = resolver.metrics();
    assert_eq!(4, metrics.rule_count);
    assert_eq!(4, metrics.constructions);
    assert_eq!(0, metrics.redundant_constructions);
    assert_eq!(0, metrics.failed_constructions);
    assert_eq!(4, resolver.build_rules().len());
    assert!(resolver.rules_allocated_bytes() > 0);
    Ok(())
}

#[test]
fn test_get_rule_before_require() -> anyhow::Result<()> {
    let resolver = diamond(FakeDescription::new());

    let err = resolver.get_rule(&label("//b:b")).unwrap_err();
    assert!(matches!(
        resolver_error(&err),
        BuildRuleResolverError::UnresolvedTarget(l) if *l == label("//b:b")
    ));
    assert!(resolver.get_rule_optional(&label("//b:b")).is_none());

    let b = resolver.require_rule(&label("//b:b"))?;
    assert!(b.ptr_eq(&resolver.get_rule(&label("//b:b"))?));
    // Required transitively.
    assert!(resolver.get_rule_optional(&label("//d:d")).is_some());
    assert!(resolver.get_rule_optional(&label("//a:a")).is_none());

    let getter = resolver.rule_getter();
    assert!(getter(&label("//d:d")).is_ok());
    assert!(getter(&label("//c:c")).is_err());
    Ok(())
}

#[test]
fn test_require_rule_no_such_target() {
    let resolver = diamond(FakeDescription::new());
    let err = resolver.require_rule(&label("//nope:nope")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TargetGraphError>(),
        Some(TargetGraphError::NoSuchTarget(_))
    ));
    assert_eq!(0, resolver.metrics().rule_count);
}

#[test]
fn test_require_all_rules_is_sorted() -> anyhow::Result<()> {
    let description = FakeDescription::new();
    let resolver = diamond(description.dupe());

    let rules = resolver.require_all_rules(&[label("//c:c"), label("//b:b"), label("//d:d")])?;
    assert_eq!(
        vec!["//b:b", "//c:c", "//d:d"],
        rules
            .iter()
            .map(|r| r.label().to_string())
            .collect::<Vec<_>>()
    );
    assert_eq!(3, description.rule_constructions());

    let rules = resolver.require_all_rules(&[label("//a:a"), label("//b:b")])?;
    assert_eq!(2, rules.len());
    assert_eq!(4, description.rule_constructions());

    let all = resolver.get_all_rules(&[label("//d:d"), label("//a:a")])?;
    assert_eq!(
        vec![label("//a:a"), label("//d:d")],
        all.iter().map(|r| r.label().dupe()).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_get_all_rules_requires_existing() -> anyhow::Result<()> {
    let resolver = diamond(FakeDescription::new());
    resolver.require_rule(&label("//b:b"))?;
    let err = resolver
        .get_all_rules(&[label("//b:b"), label("//c:c")])
        .unwrap_err();
    assert!(matches!(
        resolver_error(&err),
        BuildRuleResolverError::UnresolvedTarget(l) if *l == label("//c:c")
    ));
    Ok(())
}

#[test]
fn test_add_to_index() -> anyhow::Result<()> {
    let description = FakeDescription::new();
    let resolver = diamond(description.dupe());

    let r = resolver.add_to_index(BuildRuleRef::new(FakeRule::testing_new(
        "//b:b", &[], "manual",
    )))?;
    assert!(r.ptr_eq(&resolver.add_to_index(r.dupe())?));
    assert!(r.ptr_eq(&resolver.get_rule(&label("//b:b"))?));

    // Equal is not enough, it has to be the same rule.
    let err = resolver
        .add_to_index(BuildRuleRef::new(FakeRule::testing_new(
            "//b:b",
            &[],
            "manual",
        )))
        .unwrap_err();
    assert!(matches!(
        resolver_error(&err),
        BuildRuleResolverError::DuplicateRule(l) if *l == label("//b:b")
    ));

    // Requiring an added rule does not construct it.
    assert!(r.ptr_eq(&resolver.require_rule(&label("//b:b"))?));
    assert_eq!(0, description.rule_constructions());

    // Labels outside of the graph can be added too.
    let flavored = resolver.add_to_index(BuildRuleRef::new(FakeRule::testing_new(
        "//b:b#headers",
        &[],
        "headers",
    )))?;
    assert!(flavored.ptr_eq(&resolver.require_rule(&label("//b:b#headers"))?));
    Ok(())
}

#[test]
fn test_add_all_to_index_is_not_rolled_back() {
    let resolver = diamond(FakeDescription::new());
    let existing = resolver
        .add_to_index(BuildRuleRef::new(FakeRule::testing_new("//c:c", &[], "c")))
        .unwrap();

    let rules = vec![
        BuildRuleRef::new(FakeRule::testing_new("//b:b", &[], "b")),
        BuildRuleRef::new(FakeRule::testing_new("//c:c", &[], "other c")),
        BuildRuleRef::new(FakeRule::testing_new("//d:d", &[], "d")),
    ];
    assert!(resolver.add_all_to_index(rules).is_err());
    assert!(resolver.get_rule_optional(&label("//b:b")).is_some());
    assert!(existing.ptr_eq(&resolver.get_rule_optional(&label("//c:c")).unwrap()));
    assert!(resolver.get_rule_optional(&label("//d:d")).is_none());

    let rules = vec![BuildRuleRef::new(FakeRule::testing_new("//d:d", &[], "d"))];
    let returned = resolver.add_all_to_index(rules).unwrap();
    assert!(returned[0].ptr_eq(&resolver.get_rule(&label("//d:d")).unwrap()));
}

#[derive(Debug, PartialEq, allocative::Allocative)]
struct OtherRule {
    label: TargetLabel,
    rule_type: RuleType,
}

impl crate::rule::BuildRule for OtherRule {
    fn label(&self) -> &TargetLabel {
        &self.label
    }

    fn rule_type(&self) -> &RuleType {
        &self.rule_type
    }
}

#[test]
fn test_typed_lookup() -> anyhow::Result<()> {
    let resolver = diamond(FakeDescription::new());
    assert!(
        resolver
            .get_rule_optional_with_type::<FakeRule>(&label("//d:d"))?
            .is_none()
    );
    let err = resolver
        .get_rule_with_type::<FakeRule>(&label("//d:d"))
        .unwrap_err();
    assert!(matches!(
        resolver_error(&err),
        BuildRuleResolverError::UnresolvedTarget(_)
    ));

    let d = resolver.require_rule(&label("//d:d"))?;
    let typed = resolver.get_rule_with_type::<FakeRule>(&label("//d:d"))?;
    assert!(std::ptr::eq(
        Arc::as_ptr(&typed),
        d.downcast_ref::<FakeRule>().unwrap() as *const FakeRule
    ));

    let err = resolver
        .get_rule_with_type::<OtherRule>(&label("//d:d"))
        .unwrap_err();
    match resolver_error(&err) {
        BuildRuleResolverError::TypeMismatch {
            target,
            expected,
            actual,
        } => {
            assert_eq!(&label("//d:d"), target);
            assert!(expected.ends_with("OtherRule"));
            assert!(actual.ends_with("FakeRule"));
        }
        e => panic!("unexpected error: {}", e),
    }
    assert!(
        resolver
            .get_rule_optional_with_type::<OtherRule>(&label("//d:d"))
            .is_err()
    );
    Ok(())
}

#[test]
fn test_construction_failure_is_not_cached() -> anyhow::Result<()> {
    let attempts = Arc::new(AtomicUsize::new(0));
    let graph = testing_graph(&[("//a:a", &[])], FakeDescription::new());
    let resolver = BuildRuleResolver::new(graph, {
        let attempts = attempts.dupe();
        move |graph: &TargetGraph, resolver: &BuildRuleResolver, node: &TargetNode| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(anyhow::anyhow!("flaky"));
            }
            DefaultTargetNodeToBuildRuleTransformer.transform(graph, resolver, node)
        }
    });

    let err = resolver.require_rule(&label("//a:a")).unwrap_err();
    assert_eq!(
        "Error constructing build rule for `//a:a`: flaky",
        format!("{:#}", err)
    );
    assert!(resolver.get_rule_optional(&label("//a:a")).is_none());
    assert_eq!(1, resolver.metrics().failed_constructions);

    resolver.require_rule(&label("//a:a"))?;
    assert_eq!(2, attempts.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_rule_label_mismatch() {
    let graph = testing_graph(&[("//a:a", &[])], FakeDescription::new());
    let resolver = BuildRuleResolver::new(
        graph,
        |_: &TargetGraph, _: &BuildRuleResolver, _: &TargetNode| {
            Ok(BuildRuleRef::new(FakeRule::testing_new("//a:other", &[], "")))
        },
    );
    let err = resolver.require_rule(&label("//a:a")).unwrap_err();
    assert!(matches!(
        resolver_error(&err),
        BuildRuleResolverError::RuleLabelMismatch { .. }
    ));
    assert_eq!(0, resolver.metrics().rule_count);
}

#[test]
fn test_inconsistent_construction() {
    // The transformer sneaks a different rule into the index before returning its own.
    let graph = testing_graph(&[("//a:a", &[])], FakeDescription::new());
    let resolver = BuildRuleResolver::new(
        graph,
        |_: &TargetGraph, resolver: &BuildRuleResolver, node: &TargetNode| {
            resolver.add_to_index(BuildRuleRef::new(FakeRule::new(
                node.label().dupe(),
                Vec::new(),
                "first".to_owned(),
            )))?;
            Ok(BuildRuleRef::new(FakeRule::new(
                node.label().dupe(),
                Vec::new(),
                "second".to_owned(),
            )))
        },
    );
    let err = resolver.require_rule(&label("//a:a")).unwrap_err();
    match resolver_error(&err) {
        BuildRuleResolverError::InconsistentRuleConstruction {
            target,
            created,
            existing,
        } => {
            assert_eq!(&label("//a:a"), target);
            assert!(created.contains("second"));
            assert!(existing.contains("first"));
        }
        e => panic!("unexpected error: {}", e),
    }
    assert!(err.to_string().contains("//a:a"));
}

#[test]
fn test_equal_redundant_construction_returns_existing() -> anyhow::Result<()> {
    let graph = testing_graph(&[("//a:a", &[])], FakeDescription::new());
    let resolver = BuildRuleResolver::new(
        graph,
        |_: &TargetGraph, resolver: &BuildRuleResolver, node: &TargetNode| {
            resolver.add_to_index(BuildRuleRef::new(FakeRule::new(
                node.label().dupe(),
                Vec::new(),
                "same".to_owned(),
            )))?;
            Ok(BuildRuleRef::new(FakeRule::new(
                node.label().dupe(),
                Vec::new(),
                "same".to_owned(),
            )))
        },
    );
    let a = resolver.require_rule(&label("//a:a"))?;
    assert!(a.ptr_eq(&resolver.get_rule(&label("//a:a"))?));
    assert_eq!(1, resolver.metrics().redundant_constructions);
    assert_eq!(1, resolver.metrics().rule_count);
    Ok(())
}

#[test]
fn test_events() -> anyhow::Result<()> {
    let (recv, sink) = create_source_sink_pair();
    let resolver = BuildRuleResolver::builder(
        testing_graph(&[("//a:a", &["//b:b"]), ("//b:b", &[])], FakeDescription::new()),
        DefaultTargetNodeToBuildRuleTransformer,
    )
    .event_sink(sink)
    .build()?;
    assert!(resolver.event_dispatcher().is_some());

    resolver.require_rule(&label("//a:a"))?;
    resolver.require_rule(&label("//a:a"))?;

    let events = recv.try_iter().collect::<Vec<_>>();
    let summary = events
        .iter()
        .map(|e| match e {
            ResolverEvent::RuleConstructionStart { target, .. } => format!("start {}", target),
            ResolverEvent::RuleConstructionEnd {
                target, outcome, ..
            } => {
                assert_eq!(ConstructionOutcome::Inserted, *outcome);
                format!("end {}", target)
            }
            ResolverEvent::MetadataDerived { target, .. } => format!("metadata {}", target),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        vec!["start //a:a", "start //b:b", "end //b:b", "end //a:a"],
        summary
    );
    Ok(())
}

#[test]
fn test_builder_rejects_bad_config() {
    let res = BuildRuleResolver::builder(TargetGraph::empty(), DefaultTargetNodeToBuildRuleTransformer)
        .config(BuildRuleResolverConfig {
            index_shard_amount: Some(3),
            ..BuildRuleResolverConfig::default()
        })
        .build();
    assert!(res.is_err());

    let resolver =
        BuildRuleResolver::builder(TargetGraph::empty(), DefaultTargetNodeToBuildRuleTransformer)
            .config(BuildRuleResolverConfig {
                index_capacity: 128,
                index_shard_amount: Some(8),
                slow_construction_threshold: None,
            })
            .build()
            .unwrap();
    assert!(resolver.event_dispatcher().is_none());
    assert!(resolver.build_rules().is_empty());
}

#[test]
fn test_metadata_from_constructor_arg() -> anyhow::Result<()> {
    let description = FakeDescription::with_metadata();
    let resolver = diamond(description.dupe());

    let arg = resolver.require_metadata::<FakeArg>(&label("//b:b"))?.unwrap();
    assert_eq!("//b:b", arg.payload);
    let node_arg = resolver
        .target_graph()
        .get(&label("//b:b"))?
        .constructor_arg()
        .downcast_arc::<FakeArg>()
        .unwrap();
    assert!(Arc::ptr_eq(&arg, &node_arg));
    assert_eq!(0, description.metadata_derivations());
    // Metadata never builds rules.
    assert_eq!(0, description.rule_constructions());
    assert_eq!(0, resolver.metrics().rule_count);
    Ok(())
}

#[test]
fn test_metadata_is_derived_once() -> anyhow::Result<()> {
    let description = FakeDescription::with_metadata();
    let resolver = diamond(description.dupe());

    let size = resolver.require_metadata::<DepTreeSize>(&label("//a:a"))?;
    // b, c, and d under each of them.
    assert_eq!(Some(DepTreeSize(4)), size.as_deref().copied());
    // a, b, c and d, each once.
    assert_eq!(4, description.metadata_derivations());

    let again = resolver.require_metadata::<DepTreeSize>(&label("//a:a"))?;
    assert!(Arc::ptr_eq(size.as_ref().unwrap(), again.as_ref().unwrap()));
    resolver.require_metadata::<DepTreeSize>(&label("//d:d"))?;
    assert_eq!(4, description.metadata_derivations());
    assert_eq!(4, resolver.metrics().metadata_entry_count);
    Ok(())
}

#[test]
fn test_metadata_absent() -> anyhow::Result<()> {
    let without = FakeDescription::new();
    let resolver = diamond(without.dupe());
    assert!(resolver.require_metadata::<DepTreeSize>(&label("//a:a"))?.is_none());

    let with = FakeDescription::with_metadata();
    let resolver = diamond(with.dupe());
    assert!(resolver.require_metadata::<String>(&label("//a:a"))?.is_none());
    assert!(resolver.require_metadata::<String>(&label("//a:a"))?.is_none());
    assert_eq!(0, with.metadata_derivations());
    assert_eq!(1, resolver.metrics().metadata_entry_count);

    let err = resolver
        .require_metadata::<DepTreeSize>(&label("//x:x"))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TargetGraphError>(),
        Some(TargetGraphError::NoSuchTarget(_))
    ));
    Ok(())
}

struct WrongTypeDescription;

impl Description for WrongTypeDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::new("wrong_type")
    }

    fn create_build_rule(
        &self,
        _graph: &TargetGraph,
        _resolver: &BuildRuleResolver,
        node: &TargetNode,
    ) -> anyhow::Result<BuildRuleRef> {
        Err(anyhow::anyhow!("`{}` has no rule", node.label()))
    }

    fn metadata_provider(&self) -> Option<&dyn MetadataProvidingDescription> {
        Some(self as &dyn MetadataProvidingDescription)
    }
}

impl MetadataProvidingDescription for WrongTypeDescription {
    fn create_metadata(
        &self,
        _label: &TargetLabel,
        _resolver: &BuildRuleResolver,
        _arg: &ConstructorArg,
        _requested: MetadataType,
    ) -> anyhow::Result<Option<MetadataValue>> {
        Ok(Some(MetadataValue::new("not a number".to_owned())))
    }
}

#[test]
fn test_metadata_of_wrong_type_is_rejected() {
    let graph = TargetGraph::new([testing_node_with_description(
        "//w:w",
        &[],
        Arc::new(WrongTypeDescription),
    )])
    .unwrap();
    let resolver = BuildRuleResolver::new(graph, DefaultTargetNodeToBuildRuleTransformer);
    let err = resolver.require_metadata::<u64>(&label("//w:w")).unwrap_err();
    assert!(matches!(
        resolver_error(&err),
        BuildRuleResolverError::MetadataTypeMismatch { expected: "u64", .. }
    ));
    assert_eq!(0, resolver.metrics().metadata_entry_count);

    let err = resolver.require_rule(&label("//w:w")).unwrap_err();
    assert_eq!(
        "Error constructing build rule for `//w:w`: `//w:w` has no rule",
        format!("{:#}", err)
    );
}

#[test]
fn test_transformer_indexing_its_own_rule() -> anyhow::Result<()> {
    let (recv, sink) = create_source_sink_pair();
    let resolver = BuildRuleResolver::builder(
        testing_graph(&[("//a:a", &[])], FakeDescription::new()),
        |_: &TargetGraph, resolver: &BuildRuleResolver, node: &TargetNode| {
            let rule = BuildRuleRef::new(FakeRule::new(
                node.label().dupe(),
                Vec::new(),
                "self".to_owned(),
            ));
            resolver.add_to_index(rule)
        },
    )
    .event_sink(sink)
    .build()?;

    let a = resolver.require_rule(&label("//a:a"))?;
    assert!(a.ptr_eq(&resolver.get_rule(&label("//a:a"))?));
    let metrics = resolver.metrics();
    assert_eq!(1, metrics.constructions);
    assert_eq!(0, metrics.redundant_constructions);

    let outcomes = recv
        .try_iter()
        .filter_map(|e| match e {
            ResolverEvent::RuleConstructionEnd { outcome, .. } => Some(outcome),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(vec![ConstructionOutcome::Inserted], outcomes);
    Ok(())
}

trait HasOutputs: Send + Sync {}

#[test]
fn test_capability_lookup() -> anyhow::Result<()> {
    let resolver = diamond(FakeDescription::new());
    assert!(
        resolver
            .get_rule_optional_with_capability::<dyn HasFakeDeps>(&label("//b:b"))?
            .is_none()
    );
    let err = resolver
        .get_rule_with_capability::<dyn HasFakeDeps>(&label("//b:b"))
        .err().unwrap();
    assert!(matches!(
        resolver_error(&err),
        BuildRuleResolverError::UnresolvedTarget(_)
    ));

    resolver.require_rule(&label("//b:b"))?;
    let deps = resolver.get_rule_with_capability::<dyn HasFakeDeps>(&label("//b:b"))?;
    assert_eq!(&[label("//d:d")], deps.fake_deps());

    let err = resolver
        .get_rule_with_capability::<dyn HasOutputs>(&label("//b:b"))
        .err().unwrap();
    match resolver_error(&err) {
        BuildRuleResolverError::TypeMismatch {
            target,
            expected,
            actual,
        } => {
            assert_eq!(&label("//b:b"), target);
            assert!(expected.contains("HasOutputs"));
            assert!(actual.ends_with("FakeRule"));
        }
        e => panic!("unexpected error: {}", e),
    }
    assert!(
        resolver
            .get_rule_optional_with_capability::<dyn HasOutputs>(&label("//b:b"))
            .is_err()
    );
    Ok(())
}

/// Answers `DepTreeSize` by building the rules of the node's deps, which fails for targets named
/// `broken` until `fixed` is set.
struct RuleBackedDescription {
    fixed: AtomicBool,
}

impl Description for RuleBackedDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::new("rule_backed")
    }

    fn create_build_rule(
        &self,
        _graph: &TargetGraph,
        resolver: &BuildRuleResolver,
        node: &TargetNode,
    ) -> anyhow::Result<BuildRuleRef> {
        if node.label().name() == "broken" && !self.fixed.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("`{}` is broken", node.label()));
        }
        let deps = resolver.require_all_rules(node.deps())?;
        Ok(BuildRuleRef::new(FakeRule::new(
            node.label().dupe(),
            deps.iter().map(|d| d.label().dupe()).collect(),
            String::new(),
        )))
    }

    fn metadata_provider(&self) -> Option<&dyn MetadataProvidingDescription> {
        Some(self as &dyn MetadataProvidingDescription)
    }
}

impl MetadataProvidingDescription for RuleBackedDescription {
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
        let node = resolver.target_graph().get(label)?;
        let deps = resolver.require_all_rules(node.deps())?;
        Ok(Some(MetadataValue::new(DepTreeSize(deps.len()))))
    }
}

#[test]
fn test_metadata_derivation_failure_propagates() -> anyhow::Result<()> {
    let description = Arc::new(RuleBackedDescription {
        fixed: AtomicBool::new(false),
    });
    let graph = TargetGraph::new([
        testing_node_with_description("//a:a", &["//b:broken"], description.dupe()),
        testing_node_with_description("//b:broken", &[], description.dupe()),
    ])?;
    let resolver = BuildRuleResolver::new(graph, DefaultTargetNodeToBuildRuleTransformer);

    let err = resolver
        .require_metadata::<DepTreeSize>(&label("//a:a"))
        .unwrap_err();
    assert_eq!(
        "Error constructing build rule for `//b:broken`: `//b:broken` is broken",
        format!("{:#}", err)
    );
    assert_eq!(0, resolver.metrics().metadata_entry_count);
    assert!(resolver.get_rule_optional(&label("//b:broken")).is_none());

    // The failure was not remembered as absence.
    description.fixed.store(true, Ordering::SeqCst);
    let size = resolver.require_metadata::<DepTreeSize>(&label("//a:a"))?;
    assert_eq!(Some(DepTreeSize(1)), size.as_deref().copied());
    assert_eq!(1, resolver.metrics().metadata_entry_count);
    Ok(())
}

#[test]
fn test_rules_allocated_bytes() -> anyhow::Result<()> {
    let resolver = diamond(FakeDescription::new());
    assert_eq!(0, resolver.rules_allocated_bytes());
    resolver.require_rule(&label("//d:d"))?;
    let one = resolver.rules_allocated_bytes();
    assert!(one >= std::mem::size_of::<FakeRule>());
    resolver.require_rule(&label("//a:a"))?;
    assert!(resolver.rules_allocated_bytes() >= 4 * std::mem::size_of::<FakeRule>());
    Ok(())
}
