// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multiplex: loads and manages combine-sink instances to fan one stream to
//! several real devices.
//!
//! PipeWire has no module-loader RPC reachable from a policy client, so
//! "loading" here means spawning an in-process
//! [`crate::combine::CombineSinkTask`] (one OS thread) and registering its
//! handle, rather than shelling out to load a module by name. `Multiplex`
//! owns each instance's [`CombineSinkTask`] directly (spec.md section
//! 4.10's "loads and manages combine sinks") so creating, branching, and
//! tearing down a mux is all done through this module rather than split
//! across a second registry kept by the caller.

use std::collections::HashMap;

use tracing::debug;

use crate::combine::{CombineSinkHandle, CombineSinkTask, Output};
use crate::config::CombineConfig;
use crate::node::{NodeType, PwObjectId};

/// Opaque handle to a live multiplex instance, stored on the owning
/// device-class stream node (`Node::mux`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MuxHandle(pub u32);

/// One fanned-out branch: the sink it targets, plus the consumer-side ends
/// of its channel pair. Nothing in-process drains these (the real consumer
/// is the host's own sink render path, outside this daemon) — they're held
/// here only so the channel stays connected and the task's sends don't
/// start failing the moment a branch attaches.
struct Branch {
    sink: PwObjectId,
    _from_task: std::sync::mpsc::Receiver<crate::combine::OutMsg>,
    _to_task: std::sync::mpsc::Sender<crate::combine::InMsg>,
}

pub struct MuxNode {
    pub handle: MuxHandle,
    pub primary_sink: PwObjectId,
    pub default_stream: Option<PwObjectId>,
    pub combine: CombineSinkHandle,
    task: CombineSinkTask,
    branches: Vec<Branch>,
}

impl MuxNode {
    fn has_branch(&self, sink: PwObjectId) -> bool {
        self.primary_sink == sink || self.branches.iter().any(|b| b.sink == sink)
    }
}

pub struct Multiplex {
    nodes: HashMap<MuxHandle, MuxNode>,
    next_handle: u32,
    next_combine: u32,
    by_sink: HashMap<PwObjectId, MuxHandle>,
    combine_config: CombineConfig,
}

impl Multiplex {
    pub fn new(combine_config: CombineConfig) -> Self {
        Multiplex {
            nodes: HashMap::new(),
            next_handle: 0,
            next_combine: 0,
            by_sink: HashMap::new(),
            combine_config,
        }
    }

    /// Spawns a fresh combine sink for `primary_sink` with `primary_sink`
    /// already attached as its first (default) branch. Use [`Self::ensure`]
    /// from policy code, which also dedups against an already-live mux.
    pub fn create(&mut self, primary_sink: PwObjectId, class: NodeType) -> MuxHandle {
        self.next_handle += 1;
        let handle = MuxHandle(self.next_handle);
        self.next_combine += 1;
        let combine = CombineSinkHandle(self.next_combine);

        let task = CombineSinkTask::spawn(combine, self.combine_config.rate, self.combine_config.adjust_time_secs);
        debug!(
            "multiplexer {handle:?} created for primary sink {primary_sink:?}, class {class}, resampler {}",
            self.combine_config.resample_method
        );

        let (output, from_task, to_task) = Output::new_pair(primary_sink, self.combine_config.rate);
        task.add_output(output);

        self.nodes.insert(
            handle,
            MuxNode {
                handle,
                primary_sink,
                default_stream: None,
                combine,
                task,
                branches: vec![Branch { sink: primary_sink, _from_task: from_task, _to_task: to_task }],
            },
        );
        self.by_sink.insert(primary_sink, handle);
        handle
    }

    /// Returns the existing mux for `primary_sink` if one is already live,
    /// spawning a new one only for classes that fan out at all (spec.md
    /// section 4.6: "optionally wraps it in a multiplex if the node class
    /// is multi-output-capable"). Non-multiplexing classes never get one.
    pub fn ensure(&mut self, primary_sink: PwObjectId, class: NodeType) -> Option<MuxHandle> {
        if !is_multiplex_class(class) {
            return None;
        }
        if let Some(handle) = self.by_sink.get(&primary_sink) {
            return Some(*handle);
        }
        Some(self.create(primary_sink, class))
    }

    pub fn destroy(&mut self, handle: MuxHandle) -> Option<CombineSinkHandle> {
        let node = self.nodes.remove(&handle)?;
        self.by_sink.remove(&node.primary_sink);
        Some(node.combine)
    }

    pub fn find_by_sink(&self, sink: PwObjectId) -> Option<&MuxNode> {
        self.by_sink.get(&sink).and_then(|h| self.nodes.get(h))
    }

    pub fn get(&self, handle: MuxHandle) -> Option<&MuxNode> {
        self.nodes.get(&handle)
    }

    pub fn get_mut(&mut self, handle: MuxHandle) -> Option<&mut MuxNode> {
        self.nodes.get_mut(&handle)
    }

    pub fn default_stream(&self, handle: MuxHandle) -> Option<PwObjectId> {
        self.nodes.get(&handle).and_then(|n| n.default_stream)
    }

    pub fn set_default_stream(&mut self, handle: MuxHandle, stream: Option<PwObjectId>) {
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.default_stream = stream;
        }
    }

    /// Adds an explicit branch to an existing mux. Returns `false` without
    /// attaching anything when `sink` is already the primary or an
    /// existing branch — spec.md section 4.10's `add_explicit_route`
    /// dedup, mirrored by scenario S2 ("attempting to add an explicit
    /// route to `speakers` is a no-op").
    pub fn add_explicit_route(&mut self, handle: MuxHandle, sink: PwObjectId) -> bool {
        let Some(node) = self.nodes.get_mut(&handle) else { return false };
        if node.has_branch(sink) {
            return false;
        }
        let (output, from_task, to_task) = Output::new_pair(sink, self.combine_config.rate);
        node.task.add_output(output);
        node.branches.push(Branch { sink, _from_task: from_task, _to_task: to_task });
        true
    }

    /// Removes an explicit branch. The primary branch is never removed
    /// this way — tearing down the mux entirely is `destroy`'s job.
    pub fn remove_explicit_route(&mut self, handle: MuxHandle, sink: PwObjectId) -> bool {
        let Some(node) = self.nodes.get_mut(&handle) else { return false };
        if sink == node.primary_sink {
            return false;
        }
        let before = node.branches.len();
        node.branches.retain(|b| b.sink != sink);
        if node.branches.len() == before {
            return false;
        }
        node.task.remove_output(sink);
        true
    }

    /// Whether `sink` is already a branch (primary or explicit) of the
    /// given mux — used by Switch to avoid double-routing.
    pub fn duplicate_route(&self, handle: MuxHandle, sink: PwObjectId) -> bool {
        self.nodes.get(&handle).is_some_and(|n| n.has_branch(sink))
    }
}

/// Which application classes get fanned out through a multiplex rather
/// than moved directly.
pub fn is_multiplex_class(class: NodeType) -> bool {
    matches!(class, NodeType::Player | NodeType::Game | NodeType::Browser)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> Multiplex {
        Multiplex::new(CombineConfig::default())
    }

    #[test]
    fn create_then_find_by_sink() {
        let mut mux = mux();
        let handle = mux.create(PwObjectId(5), NodeType::Player);
        assert_eq!(mux.find_by_sink(PwObjectId(5)).unwrap().handle, handle);
        assert!(mux.find_by_sink(PwObjectId(99)).is_none());
    }

    #[test]
    fn ensure_is_idempotent_for_the_same_sink() {
        let mut mux = mux();
        let a = mux.ensure(PwObjectId(5), NodeType::Player).unwrap();
        let b = mux.ensure(PwObjectId(5), NodeType::Player).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ensure_returns_none_for_non_multiplex_classes() {
        let mut mux = mux();
        assert!(mux.ensure(PwObjectId(5), NodeType::Phone).is_none());
    }

    #[test]
    fn explicit_route_to_primary_is_a_no_op_duplicate() {
        let mut mux = mux();
        let handle = mux.create(PwObjectId(5), NodeType::Player);
        assert!(!mux.add_explicit_route(handle, PwObjectId(5)));
        assert!(mux.duplicate_route(handle, PwObjectId(5)));
    }

    #[test]
    fn explicit_route_added_once_then_deduped() {
        let mut mux = mux();
        let handle = mux.create(PwObjectId(5), NodeType::Player);
        assert!(mux.add_explicit_route(handle, PwObjectId(9)));
        assert!(!mux.add_explicit_route(handle, PwObjectId(9)));
        assert!(mux.remove_explicit_route(handle, PwObjectId(9)));
        assert!(!mux.duplicate_route(handle, PwObjectId(9)));
    }

    #[test]
    fn primary_branch_cannot_be_removed_as_explicit() {
        let mut mux = mux();
        let handle = mux.create(PwObjectId(5), NodeType::Player);
        assert!(!mux.remove_explicit_route(handle, PwObjectId(5)));
    }

    #[test]
    fn multiplex_class_matches_expected_set() {
        assert!(is_multiplex_class(NodeType::Player));
        assert!(is_multiplex_class(NodeType::Game));
        assert!(is_multiplex_class(NodeType::Browser));
        assert!(!is_multiplex_class(NodeType::Phone));
    }
}
