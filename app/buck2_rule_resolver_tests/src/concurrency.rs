/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use buck2_rule_resolver::events::create_source_sink_pair;
use buck2_rule_resolver::events::ConstructionOutcome;
use buck2_rule_resolver::events::ResolverEvent;
use buck2_rule_resolver::resolver::error::BuildRuleResolverError;
use buck2_rule_resolver::resolver::BuildRuleResolver;
use buck2_rule_resolver::rule::BuildRuleRef;
use buck2_rule_resolver::target::graph::TargetGraph;
use buck2_rule_resolver::target::node::TargetNode;
use buck2_rule_resolver::testing::testing_graph;
use buck2_rule_resolver::testing::FakeDescription;
use buck2_rule_resolver::testing::FakeRule;
use buck2_rule_resolver::transformer::DefaultTargetNodeToBuildRuleTransformer;
use buck2_rule_resolver::transformer::TargetNodeToBuildRuleTransformer;
use dupe::Dupe;

use crate::graph::label;
use crate::graph::layer_label;
use crate::graph::layered_graph;

const THREADS: usize = 8;

/// A transformer that holds every caller until `parties` of them are constructing at once.
fn rendezvous_transformer(
    parties: usize,
    calls: Arc<AtomicUsize>,
    payload: impl Fn(usize) -> String + Send + Sync + 'static,
) -> impl TargetNodeToBuildRuleTransformer + 'static {
    let barrier = Arc::new(Barrier::new(parties));
    move |_: &TargetGraph, _: &BuildRuleResolver, node: &TargetNode| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        barrier.wait();
        Ok(BuildRuleRef::new(FakeRule::new(
            node.label().dupe(),
            Vec::new(),
            payload(call),
        )))
    }
}

#[test]
fn test_racing_equal_constructions_share_one_rule() {
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = BuildRuleResolver::new(
        testing_graph(&[("//a:a", &[])], FakeDescription::new()),
        rendezvous_transformer(2, calls.dupe(), |_| "same".to_owned()),
    );
    let target = label("//a:a");

    let (first, second) = thread::scope(|s| {
        let first = s.spawn(|| resolver.require_rule(&target));
        let second = s.spawn(|| resolver.require_rule(&target));
        (first.join().unwrap(), second.join().unwrap())
    });
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(2, calls.load(Ordering::SeqCst));
    assert!(first.ptr_eq(&second));
    assert!(first.ptr_eq(&resolver.get_rule(&target).unwrap()));
    let metrics = resolver.metrics();
    assert_eq!(1, metrics.rule_count);
    assert_eq!(2, metrics.constructions);
    assert_eq!(1, metrics.redundant_constructions);
}

#[test]
fn test_racing_inconsistent_constructions_fail_one_caller() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (recv, sink) = create_source_sink_pair();
    let resolver = BuildRuleResolver::builder(
        testing_graph(&[("//a:a", &[])], FakeDescription::new()),
        rendezvous_transformer(2, calls.dupe(), |call| format!("call {}", call)),
    )
    .event_sink(sink)
    .build()
    .unwrap();
    let target = label("//a:a");

    let results = thread::scope(|s| {
        let handles = (0..2)
            .map(|_| s.spawn(|| resolver.require_rule(&target)))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    let (ok, err): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.is_ok());
    assert_eq!(1, ok.len());
    assert_eq!(1, err.len());
    let winner = ok.into_iter().next().unwrap().unwrap();
    assert!(winner.ptr_eq(&resolver.get_rule(&target).unwrap()));

    let err = err.into_iter().next().unwrap().unwrap_err();
    match err.downcast_ref::<BuildRuleResolverError>() {
        Some(BuildRuleResolverError::InconsistentRuleConstruction {
            target: t,
            existing,
            ..
        }) => {
            assert_eq!(&target, t);
            let payload = winner.downcast_ref::<FakeRule>().unwrap().payload();
            assert!(existing.contains(payload));
        }
        _ => panic!("unexpected error: {:#}", err),
    }

    let outcomes = recv
        .try_iter()
        .filter_map(|e| match e {
            ResolverEvent::RuleConstructionEnd { outcome, .. } => Some(outcome),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(2, outcomes.len());
    assert!(outcomes.contains(&ConstructionOutcome::Inserted));
    assert!(outcomes.contains(&ConstructionOutcome::Inconsistent));
}

#[test]
fn test_layered_graph_from_many_threads() {
    let description = FakeDescription::new();
    let (recv, sink) = create_source_sink_pair();
    let resolver = BuildRuleResolver::builder(
        layered_graph(4, 4, description.dupe()),
        DefaultTargetNodeToBuildRuleTransformer,
    )
    .event_sink(sink)
    .build()
    .unwrap();
    let start = Barrier::new(THREADS);

    let tops = thread::scope(|s| {
        let handles = (0..THREADS)
            .map(|i| {
                let resolver = &resolver;
                let start = &start;
                s.spawn(move || {
                    start.wait();
                    resolver.require_rule(&layer_label(0, i % 4))
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect::<Vec<_>>()
    });

    for (i, top) in tops.iter().enumerate() {
        assert!(top.ptr_eq(&resolver.get_rule(&layer_label(0, i % 4)).unwrap()));
    }
    for layer in 0..4 {
        for index in 0..4 {
            let rule = resolver.get_rule(&layer_label(layer, index)).unwrap();
            let deps = rule.downcast_ref::<FakeRule>().unwrap().deps();
            assert_eq!(if layer == 3 { 0 } else { 4 }, deps.len());
        }
    }

    let metrics = resolver.metrics();
    assert_eq!(16, metrics.rule_count);
    assert_eq!(0, metrics.failed_constructions);
    assert_eq!(
        metrics.constructions,
        metrics.rule_count as u64 + metrics.redundant_constructions
    );
    assert_eq!(metrics.constructions as usize, description.rule_constructions());

    let mut inserted = 0;
    let mut redundant = 0;
    for event in recv.try_iter() {
        if let ResolverEvent::RuleConstructionEnd { outcome, .. } = event {
            match outcome {
                ConstructionOutcome::Inserted => inserted += 1,
                ConstructionOutcome::Redundant => redundant += 1,
                outcome => panic!("unexpected outcome {:?}", outcome),
            }
        }
    }
    assert_eq!(16, inserted);
    assert_eq!(metrics.redundant_constructions, redundant);
}

#[test]
fn test_overlapping_require_all_rules() {
    let resolver = BuildRuleResolver::new(
        layered_graph(3, 4, FakeDescription::new()),
        DefaultTargetNodeToBuildRuleTransformer,
    );
    let start = Barrier::new(THREADS);

    let results = thread::scope(|s| {
        let handles = (0..THREADS)
            .map(|i| {
                let resolver = &resolver;
                let start = &start;
                s.spawn(move || {
                    // Each thread asks for a different but overlapping window of targets.
                    let targets = (0..3)
                        .map(|j| layer_label(1 + (i + j) % 2, (i + j) % 4))
                        .collect::<Vec<_>>();
                    start.wait();
                    resolver.require_all_rules(&targets)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect::<Vec<_>>()
    });

    for rules in &results {
        for rule in rules {
            assert!(rule.ptr_eq(&resolver.get_rule(rule.label()).unwrap()));
        }
    }
    // Nobody asked for the top layer.
    for index in 0..4 {
        assert!(resolver.get_rule_optional(&layer_label(0, index)).is_none());
    }
    // Even offsets land on layer 1 targets 0 and 2, which pull in all of layer 2.
    assert_eq!(6, resolver.metrics().rule_count);
}

#[test]
fn test_concurrent_add_to_index() {
    let resolver = BuildRuleResolver::new(TargetGraph::empty(), DefaultTargetNodeToBuildRuleTransformer);
    let shared = BuildRuleRef::new(FakeRule::testing_new("//a:a#shared", &[], "shared"));
    let start = Barrier::new(THREADS);

    let results = thread::scope(|s| {
        let handles = (0..THREADS)
            .map(|i| {
                let resolver = &resolver;
                let shared = &shared;
                let start = &start;
                s.spawn(move || {
                    start.wait();
                    let own = resolver.add_to_index(BuildRuleRef::new(FakeRule::testing_new(
                        "//a:a#contended",
                        &[],
                        &format!("thread {}", i),
                    )));
                    resolver.add_to_index(shared.dupe()).unwrap();
                    own
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(1, results.iter().filter(|r| r.is_ok()).count());
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(
            err.downcast_ref::<BuildRuleResolverError>(),
            Some(BuildRuleResolverError::DuplicateRule(_))
        ));
    }
    assert!(shared.ptr_eq(&resolver.get_rule(&label("//a:a#shared")).unwrap()));
    assert_eq!(2, resolver.metrics().rule_count);
}
