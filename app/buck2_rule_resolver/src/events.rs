/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Instrumentation events emitted by the resolver.
//!
//! Events are fire-and-forget: a [`ResolverEventSink`] never fails back into the resolver, and a
//! resolver without a sink behaves exactly like one with a [`NullEventSink`].

use std::sync::Arc;
use std::time::Duration;

use dupe::Dupe;

use crate::target::label::TargetLabel;
use crate::target::node::RuleType;

/// How a call into the rule transformer ended.
#[derive(Debug, Clone, Copy, Dupe, PartialEq, Eq)]
pub enum ConstructionOutcome {
    /// The new rule was inserted into the index.
    Inserted,
    /// Another caller inserted an equal rule first; the new rule was dropped.
    Redundant,
    /// The new rule conflicted with the one already in the index.
    Inconsistent,
    /// The transformer returned an error.
    Failed,
}

#[derive(Debug, Clone)]
pub enum ResolverEvent {
    RuleConstructionStart {
        target: TargetLabel,
        rule_type: RuleType,
    },
    RuleConstructionEnd {
        target: TargetLabel,
        rule_type: RuleType,
        outcome: ConstructionOutcome,
        duration: Duration,
    },
    MetadataDerived {
        target: TargetLabel,
        metadata_type: &'static str,
        present: bool,
        duration: Duration,
    },
}

impl ResolverEvent {
    pub fn target(&self) -> &TargetLabel {
        match self {
            ResolverEvent::RuleConstructionStart { target, .. }
            | ResolverEvent::RuleConstructionEnd { target, .. }
            | ResolverEvent::MetadataDerived { target, .. } => target,
        }
    }
}

/// A sink for resolver events. Sending is synchronous and must not fail; implementations deal
/// with their own errors.
pub trait ResolverEventSink: Send + Sync {
    fn send(&self, event: ResolverEvent);
}

/// Accepts events and drops them.
#[derive(Default, Clone, Dupe)]
pub struct NullEventSink;

impl NullEventSink {
    pub fn new() -> NullEventSink {
        NullEventSink
    }
}

impl ResolverEventSink for NullEventSink {
    fn send(&self, _event: ResolverEvent) {}
}

/// Pushes events onto an unbounded channel.
#[derive(Clone)]
pub struct ChannelEventSink(crossbeam_channel::Sender<ResolverEvent>);

impl ChannelEventSink {
    pub fn new(send: crossbeam_channel::Sender<ResolverEvent>) -> ChannelEventSink {
        ChannelEventSink(send)
    }
}

impl ResolverEventSink for ChannelEventSink {
    fn send(&self, event: ResolverEvent) {
        // A disconnected receiver means nobody is listening any more.
        let _ignore = self.0.send(event);
    }
}

// Cloning a crossbeam sender bumps a counter.
impl Dupe for ChannelEventSink {}

/// Creates a sink whose events can be read back from the returned receiver.
pub fn create_source_sink_pair() -> (crossbeam_channel::Receiver<ResolverEvent>, ChannelEventSink)
{
    let (send, recv) = crossbeam_channel::unbounded();
    (recv, ChannelEventSink::new(send))
}

/// Type-erased, dupe-able handle to a [`ResolverEventSink`].
#[derive(Clone, Dupe)]
pub struct ResolverEventDispatcher {
    sink: Arc<dyn ResolverEventSink>,
}

impl ResolverEventDispatcher {
    pub fn new<T: ResolverEventSink + 'static>(sink: T) -> ResolverEventDispatcher {
        ResolverEventDispatcher {
            sink: Arc::new(sink),
        }
    }

    pub fn null() -> ResolverEventDispatcher {
        Self::new(NullEventSink::new())
    }

    pub fn sink(&self) -> Arc<dyn ResolverEventSink> {
        self.sink.dupe()
    }

    pub fn event(&self, event: ResolverEvent) {
        self.sink.send(event)
    }
}
