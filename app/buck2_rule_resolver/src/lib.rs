/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Turns the nodes of a static target graph into build rules.
//!
//! The [`resolver::BuildRuleResolver`] owns two insert-once indices: one mapping each
//! [`target::label::TargetLabel`] to the single [`rule::BuildRuleRef`] built for it, and one
//! caching typed metadata derived from target nodes. Rules are materialized lazily, depth first,
//! by a pluggable [`transformer::TargetNodeToBuildRuleTransformer`] which is free to call back into
//! the resolver for its dependencies, from as many threads as the build walk likes.

pub mod config;
pub mod events;
pub mod resolver;
pub mod rule;
pub mod target;
pub mod testing;
pub mod transformer;
