/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use buck2_rule_resolver::resolver::BuildRuleResolver;
use buck2_rule_resolver::testing::DepTreeSize;
use buck2_rule_resolver::testing::FakeArg;
use buck2_rule_resolver::testing::FakeDescription;
use buck2_rule_resolver::transformer::DefaultTargetNodeToBuildRuleTransformer;
use dupe::Dupe;

use crate::graph::layer_label;
use crate::graph::layered_graph;

const THREADS: usize = 8;

#[test]
fn test_concurrent_metadata_is_derived_once() {
    let description = FakeDescription::with_metadata();
    let resolver = BuildRuleResolver::new(
        layered_graph(4, 4, description.dupe()),
        DefaultTargetNodeToBuildRuleTransformer,
    );
    let start = Barrier::new(THREADS);

    let sizes = thread::scope(|s| {
        let handles = (0..THREADS)
            .map(|i| {
                let resolver = &resolver;
                let start = &start;
                s.spawn(move || {
                    start.wait();
                    resolver
                        .require_metadata::<DepTreeSize>(&layer_label(0, i % 4))
                        .unwrap()
                        .unwrap()
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    // 4 * (1 + 4 * (1 + 4 * (1 + 0)))
    for size in &sizes {
        assert_eq!(DepTreeSize(84), **size);
    }
    for i in 0..THREADS {
        assert!(Arc::ptr_eq(&sizes[i], &sizes[(i + 4) % THREADS]));
    }
    assert_eq!(16, description.metadata_derivations());
    assert_eq!(16, resolver.metrics().metadata_entry_count);
    assert_eq!(0, description.rule_constructions());
}

#[test]
fn test_metadata_and_rules_together() {
    let description = FakeDescription::with_metadata();
    let resolver = BuildRuleResolver::new(
        layered_graph(3, 2, description.dupe()),
        DefaultTargetNodeToBuildRuleTransformer,
    );

    thread::scope(|s| {
        let resolver = &resolver;
        s.spawn(move || resolver.require_rule(&layer_label(0, 0)).unwrap());
        s.spawn(move || {
            resolver
                .require_metadata::<DepTreeSize>(&layer_label(0, 0))
                .unwrap()
        });
        s.spawn(move || {
            resolver
                .require_metadata::<FakeArg>(&layer_label(1, 1))
                .unwrap()
        });
    });

    assert_eq!(
        Some(DepTreeSize(6)),
        resolver
            .require_metadata::<DepTreeSize>(&layer_label(0, 0))
            .unwrap()
            .as_deref()
            .copied()
    );
    assert_eq!(
        "//layer1:t1",
        resolver
            .require_metadata::<FakeArg>(&layer_label(1, 1))
            .unwrap()
            .unwrap()
            .payload
    );
    assert_eq!(5, resolver.metrics().rule_count);
}
