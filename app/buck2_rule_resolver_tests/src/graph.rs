/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;

use buck2_rule_resolver::target::graph::TargetGraph;
use buck2_rule_resolver::target::label::TargetLabel;
use buck2_rule_resolver::testing::testing_graph;
use buck2_rule_resolver::testing::FakeDescription;

pub(crate) fn label(s: &str) -> TargetLabel {
    TargetLabel::testing_parse(s)
}

pub(crate) fn layer_label(layer: usize, index: usize) -> TargetLabel {
    label(&format!("//layer{}:t{}", layer, index))
}

/// `layers` layers of `width` targets each, where every target depends on every target of the
/// next layer.
pub(crate) fn layered_graph(
    layers: usize,
    width: usize,
    description: Arc<FakeDescription>,
) -> TargetGraph {
    let nodes: Vec<(String, Vec<String>)> = (0..layers)
        .flat_map(|layer| {
            (0..width).map(move |index| {
                let deps = if layer + 1 < layers {
                    (0..width)
                        .map(|dep| format!("//layer{}:t{}", layer + 1, dep))
                        .collect()
                } else {
                    Vec::new()
                };
                (format!("//layer{}:t{}", layer, index), deps)
            })
        })
        .collect();
    let deps: Vec<Vec<&str>> = nodes
        .iter()
        .map(|(_, deps)| deps.iter().map(|d| d.as_str()).collect())
        .collect();
    let declared: Vec<(&str, &[&str])> = nodes
        .iter()
        .zip(&deps)
        .map(|((name, _), deps)| (name.as_str(), deps.as_slice()))
        .collect();
    testing_graph(&declared, description)
}

#[test]
fn test_layered_graph() {
    let graph = layered_graph(3, 2, FakeDescription::new());
    assert_eq!(6, graph.len());
    let top = graph.get(&layer_label(0, 1)).unwrap();
    assert_eq!(
        vec![layer_label(1, 0), layer_label(1, 1)],
        top.deps().cloned().collect::<Vec<_>>()
    );
    assert_eq!(0, graph.get(&layer_label(2, 0)).unwrap().deps().len());
}
