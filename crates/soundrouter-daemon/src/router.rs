// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The router: routing groups with accept/compare predicates, class→group
//! assignment, class priorities, and default/explicit route resolution.
//!
//! This router only *decides* — it returns an ordered list of
//! [`RouteOrder`]s for the caller (the routing engine in `lib.rs`) to hand
//! to [`crate::switch`], keeping the module graph acyclic. Explicit routes
//! are always materialized before default routes within a pass, and
//! default routing walks from highest-to-lowest stream priority,
//! re-resolving already-present equal-or-higher-priority streams first
//! during prerouting.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use tracing::debug;

use crate::node::{new_stamp, Node, NodeGraph, NodeKey, NodeType};

pub type AcceptFn = fn(&Node) -> bool;
pub type CompareFn = fn(&Node, &Node) -> Ordering;

/// Per-node bookkeeping of routing-group membership, replacing the
/// original's intrusive `rtentries` doubly-linked list head. Device nodes
/// record every group they were accepted into (so unregister is O(degree));
/// stream nodes don't need this — their single membership is implicit in
/// `Router::nodlist`.
#[derive(Debug, Clone, Default)]
pub struct RtMembership {
    pub groups: Vec<String>,
}

pub struct RtGroup {
    pub name: String,
    accept: AcceptFn,
    compare: CompareFn,
    /// Ordered (by `compare`) device node keys, highest priority last, so
    /// the router walks it backward to try best candidates first.
    entries: Vec<NodeKey>,
}

impl RtGroup {
    fn print(&self, graph: &NodeGraph) -> String {
        self.entries
            .iter()
            .rev()
            .filter_map(|k| graph.find_by_key(k))
            .map(|n| format!(" '{}'", n.am_name))
            .collect()
    }
}

/// An admin-requested explicit route, process-wide, not owning either node.
#[derive(Debug, Clone)]
pub struct Connection {
    pub am_id: u16,
    pub from: NodeKey,
    pub to: NodeKey,
    pub blocked: bool,
}

/// A single routing decision for the switch layer to execute.
#[derive(Debug, Clone)]
pub struct RouteOrder {
    pub from: Option<NodeKey>,
    pub to: NodeKey,
    pub explicit: bool,
}

pub struct Router {
    rtgroups: HashMap<String, RtGroup>,
    classmap: HashMap<NodeType, String>,
    priormap: HashMap<NodeType, i32>,
    /// Stream nodes ordered by ascending priority.
    nodlist: Vec<NodeKey>,
    connlist: Vec<Connection>,
    making_routing: AtomicBool,
    next_conn_id: u16,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            rtgroups: HashMap::new(),
            classmap: HashMap::new(),
            priormap: HashMap::new(),
            nodlist: Vec::new(),
            connlist: Vec::new(),
            making_routing: AtomicBool::new(false),
            next_conn_id: 1,
        }
    }

    pub fn create_rtgroup(&mut self, name: &str, accept: AcceptFn, compare: CompareFn) -> bool {
        if self.rtgroups.contains_key(name) {
            return false;
        }
        self.rtgroups.insert(
            name.to_string(),
            RtGroup {
                name: name.to_string(),
                accept,
                compare,
                entries: Vec::new(),
            },
        );
        debug!("routing group '{name}' created");
        true
    }

    pub fn destroy_rtgroup(&mut self, name: &str) {
        if self.rtgroups.remove(name).is_some() {
            debug!("routing group '{name}' destroyed");
        } else {
            debug!("can't destroy routing group '{name}': group not found");
        }
    }

    pub fn assign_class_to_rtgroup(&mut self, class: NodeType, group_name: &str) -> bool {
        if !self.rtgroups.contains_key(group_name) {
            debug!("can't assign class '{class}' to routing group '{group_name}': not found");
            return false;
        }
        self.classmap.insert(class, group_name.to_string());
        debug!("class '{class}' assigned to routing group '{group_name}'");
        true
    }

    pub fn assign_priority(&mut self, class: NodeType, priority: i32) {
        self.priormap.insert(class, priority);
    }

    fn node_priority(&self, node: &Node) -> i32 {
        *self.priormap.get(&node.node_type).unwrap_or(&0)
    }

    /// Register a freshly created node. Device/output nodes are offered to
    /// every routing group; stream/input nodes are inserted into the
    /// priority-ordered stream list.
    pub fn register_node(&mut self, node: &mut Node) {
        use crate::node::{Direction, Implement};

        if node.implement == Implement::Device && node.direction == Direction::Output {
            let names: Vec<String> = self.rtgroups.keys().cloned().collect();
            for name in names {
                self.add_rtentry(&name, node);
            }
            return;
        }

        if node.implement == Implement::Stream && node.direction == Direction::Input {
            // Priority depends only on class, so appending and re-sorting
            // via `reorder_nodlist` (called by the routing engine right
            // after registration, once it has graph access) is equivalent
            // to the original's insert-before-first-higher-priority walk.
            self.nodlist.push(node.key.clone());
        }
    }

    /// Re-sort `nodlist` by class priority using live node data. The
    /// routing engine calls this after `register_node`/`unregister_node`
    /// since `Router` alone doesn't hold a `NodeGraph` reference.
    pub fn reorder_nodlist(&mut self, graph: &NodeGraph) {
        let priormap = &self.priormap;
        self.nodlist.sort_by_key(|key| {
            graph
                .find_by_key(key)
                .map(|n| *priormap.get(&n.node_type).unwrap_or(&0))
                .unwrap_or(i32::MAX)
        });
    }

    pub fn unregister_node(&mut self, node: &Node) {
        use crate::node::{Direction, Implement};

        if node.implement == Implement::Device && node.direction == Direction::Output {
            for group_name in &node.rt_membership.groups {
                if let Some(group) = self.rtgroups.get_mut(group_name) {
                    group.entries.retain(|k| k != &node.key);
                }
            }
            return;
        }

        if node.implement == Implement::Stream && node.direction == Direction::Input {
            self.nodlist.retain(|k| k != &node.key);
        }
    }

    fn add_rtentry(&mut self, group_name: &str, node: &mut Node) {
        let group = self.rtgroups.get_mut(group_name).expect("group exists");
        if !(group.accept)(node) {
            debug!(
                "refuse node '{}' registration to routing group '{group_name}'",
                node.am_name
            );
            return;
        }
        node.rt_membership.groups.push(group_name.to_string());
        group.entries.push(node.key.clone());
        debug!("node '{}' added to routing group '{group_name}'", node.am_name);
    }

    /// Re-sort a group's entries using live node data after membership
    /// changes. Sorting is deferred to the routing engine (which has graph
    /// access) via this method, called once per pass, rather than kept
    /// sorted on every insert.
    pub fn reorder_group(&mut self, group_name: &str, graph: &NodeGraph) {
        if let Some(group) = self.rtgroups.get_mut(group_name) {
            let compare = group.compare;
            group.entries.sort_by(|a, b| {
                match (graph.find_by_key(a), graph.find_by_key(b)) {
                    (Some(na), Some(nb)) => compare(na, nb),
                    _ => Ordering::Equal,
                }
            });
        }
    }

    pub fn reorder_all_groups(&mut self, graph: &NodeGraph) {
        let names: Vec<String> = self.rtgroups.keys().cloned().collect();
        for name in names {
            self.reorder_group(&name, graph);
        }
    }

    pub fn add_explicit_route(&mut self, am_id: u16, from: NodeKey, to: NodeKey) -> u16 {
        let conn_id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1).max(1);
        self.connlist.push(Connection {
            am_id,
            from,
            to,
            blocked: false,
        });
        conn_id
    }

    pub fn remove_explicit_route(&mut self, from: &NodeKey, to: &NodeKey) -> Option<Connection> {
        let idx = self.connlist.iter().position(|c| &c.from == from && &c.to == to)?;
        Some(self.connlist.remove(idx))
    }

    pub fn explicit_routes(&self) -> &[Connection] {
        &self.connlist
    }

    pub fn print_rtgroups(&self, graph: &NodeGraph) -> String {
        let mut out = String::from("routing table:\n");
        for group in self.rtgroups.values() {
            out.push_str(&format!("   {}:{}\n", group.name, group.print(graph)));
        }
        out
    }

    /// Compute (and return) the route for a freshly created stream node
    /// without yet touching already-settled streams, except that any
    /// already-present stream of equal-or-higher priority is re-resolved
    /// *first*.
    pub fn make_prerouting(&mut self, graph: &NodeGraph, stream: &Node) -> Vec<RouteOrder> {
        let mut orders = Vec::new();
        let priority = self.node_priority(stream);
        let stamp = new_stamp();
        let mut done = false;

        orders.extend(self.make_explicit_route_orders(graph, stamp));

        for key in self.nodlist.clone().into_iter().rev() {
            let Some(from) = graph.find_by_key(&key) else { continue };
            if priority >= self.node_priority(from) {
                if let Some(target) = self.find_default_route(graph, stream) {
                    orders.push(RouteOrder { from: None, to: target, explicit: false });
                }
                done = true;
            }
            if from.stamp >= stamp {
                continue;
            }
            if let Some(to) = self.find_default_route(graph, from) {
                orders.push(RouteOrder { from: Some(key.clone()), to, explicit: false });
            }
        }

        if !done {
            if let Some(target) = self.find_default_route(graph, stream) {
                orders.push(RouteOrder { from: None, to: target, explicit: false });
            }
        }

        orders
    }

    /// A full routing pass over every known stream. Reentrancy is refused
    /// via `making_routing`, a flag guarding against a routing pass
    /// triggering another one before it completes.
    pub fn make_routing(&mut self, graph: &NodeGraph) -> Vec<RouteOrder> {
        if self
            .making_routing
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            debug!("routing pass already in progress, skipping nested call");
            return Vec::new();
        }

        let stamp = new_stamp();
        let mut orders = self.make_explicit_route_orders(graph, stamp);

        for key in self.nodlist.clone().into_iter().rev() {
            let Some(from) = graph.find_by_key(&key) else { continue };
            if from.stamp >= stamp {
                continue;
            }
            if let Some(to) = self.find_default_route(graph, from) {
                orders.push(RouteOrder { from: Some(key.clone()), to, explicit: false });
            }
        }

        self.making_routing.store(false, AtomicOrdering::SeqCst);
        orders
    }

    fn make_explicit_route_orders(&self, graph: &NodeGraph, _stamp: u32) -> Vec<RouteOrder> {
        let mut orders = Vec::new();
        for conn in self.connlist.iter().rev() {
            if conn.blocked {
                continue;
            }
            if graph.find_by_key(&conn.from).is_none() || graph.find_by_key(&conn.to).is_none() {
                debug!("ignoring explicit route {}: some node not found", conn.am_id);
                continue;
            }
            orders.push(RouteOrder {
                from: Some(conn.from.clone()),
                to: conn.to.clone(),
                explicit: true,
            });
        }
        orders
    }

    /// `find_default_route`: walk a stream's assigned group from highest
    /// rank downward, skipping ignored/unavailable/invalid-index entries,
    /// with the documented bluetooth a2dp/sco exception (those may resolve
    /// to a node that only becomes valid once its profile is switched on).
    pub fn find_default_route(&self, graph: &NodeGraph, from: &Node) -> Option<NodeKey> {
        let class = from.node_type;
        let group_name = self.classmap.get(&class)?;
        let group = self.rtgroups.get(group_name)?;

        for key in group.entries.iter().rev() {
            let Some(to) = graph.find_by_key(key) else {
                debug!("node was missing for a routing-group entry");
                continue;
            };
            if to.ignore {
                debug!("'{}' ignored. Skipping...", to.am_name);
                continue;
            }
            if !to.available {
                debug!("'{}' not available. Skipping...", to.am_name);
                continue;
            }
            if !to.pw_index.is_valid()
                && to.node_type != NodeType::BluetoothA2dp
                && to.node_type != NodeType::BluetoothSco
            {
                debug!("'{}' has no host index. Skipping...", to.am_name);
                continue;
            }
            return Some(to.key.clone());
        }
        debug!("could not find route for '{}'", from.am_name);
        None
    }
}

// --- accept/compare presets ---

pub fn default_accept(node: &Node) -> bool {
    node.node_type.is_device_class()
}

pub fn phone_accept(node: &Node) -> bool {
    node.node_type.is_device_class()
        && !matches!(
            node.node_type,
            NodeType::BluetoothA2dp | NodeType::UsbHeadphone | NodeType::WiredHeadphone | NodeType::Hdmi | NodeType::Spdif
        )
}

fn location_rank(l: crate::node::Location) -> u8 {
    use crate::node::Location::*;
    match l {
        Unknown => 0,
        Internal => 1,
        External => 2,
    }
}

fn privacy_rank(p: crate::node::Privacy) -> u8 {
    use crate::node::Privacy::*;
    match p {
        Unknown => 0,
        Public => 1,
        Private => 2,
    }
}

pub fn default_compare(n1: &Node, n2: &Node) -> Ordering {
    if n1.node_type == NodeType::Null {
        return Ordering::Less;
    }
    if n2.node_type == NodeType::Null {
        return Ordering::Greater;
    }
    let key1 = (
        n1.channels.min(31),
        privacy_rank(n1.privacy),
        location_rank(n1.location),
        n1.node_type.device_class_rank(),
    );
    let key2 = (
        n2.channels.min(31),
        privacy_rank(n2.privacy),
        location_rank(n2.location),
        n2.node_type.device_class_rank(),
    );
    key1.cmp(&key2)
}

pub fn phone_compare(n1: &Node, n2: &Node) -> Ordering {
    if n1.node_type == NodeType::Null {
        return Ordering::Less;
    }
    if n2.node_type == NodeType::Null {
        return Ordering::Greater;
    }
    let key1 = (privacy_rank(n1.privacy), n1.node_type.device_class_rank());
    let key2 = (privacy_rank(n2.privacy), n2.node_type.device_class_rank());
    key1.cmp(&key2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CardRef, Direction, Implement, NodeSpec};

    fn device(key: &str, node_type: NodeType, channels: u32) -> NodeSpec {
        NodeSpec {
            key: NodeKey(key.to_string()),
            direction: Direction::Output,
            implement: Implement::Device,
            channels,
            location: crate::node::Location::Internal,
            privacy: crate::node::Privacy::Public,
            node_type,
            visible: true,
            available: true,
            am_name: None,
            am_descr: None,
            pw_name: key.to_string(),
            pw_index: crate::node::PwObjectId(1),
            pw_card: CardRef::default(),
            pw_port: None,
            stamp: new_stamp(),
        }
    }

    fn stream(key: &str, node_type: NodeType) -> NodeSpec {
        NodeSpec {
            key: NodeKey(key.to_string()),
            direction: Direction::Input,
            implement: Implement::Stream,
            channels: 2,
            location: crate::node::Location::Unknown,
            privacy: crate::node::Privacy::Unknown,
            node_type,
            visible: true,
            available: true,
            am_name: None,
            am_descr: None,
            pw_name: key.to_string(),
            pw_index: crate::node::PwObjectId::INVALID,
            pw_card: CardRef::default(),
            pw_port: None,
            stamp: new_stamp(),
        }
    }

    #[test]
    fn register_device_node_inserts_sorted_by_compare() {
        let mut router = Router::new();
        router.create_rtgroup("speakers", default_accept, default_compare);
        router.assign_class_to_rtgroup(NodeType::Player, "speakers");

        let mut graph = NodeGraph::new();
        graph.create(device("spk.mono", NodeType::Speakers, 1));
        graph.create(device("spk.stereo", NodeType::Speakers, 2));

        let mut node = graph.find_by_key_mut(&NodeKey("spk.mono".into())).unwrap().clone();
        router.register_node(&mut node);
        *graph.find_by_key_mut(&NodeKey("spk.mono".into())).unwrap() = node;

        let mut node2 = graph.find_by_key_mut(&NodeKey("spk.stereo".into())).unwrap().clone();
        router.register_node(&mut node2);
        *graph.find_by_key_mut(&NodeKey("spk.stereo".into())).unwrap() = node2;

        router.reorder_all_groups(&graph);

        let stream_spec = stream("player.0", NodeType::Player);
        graph.create(stream_spec);
        let player = graph.find_by_key(&NodeKey("player.0".into())).unwrap();

        let target = router.find_default_route(&graph, player);
        assert_eq!(target, Some(NodeKey("spk.stereo".into())));
    }

    #[test]
    fn find_default_route_skips_unavailable() {
        let mut router = Router::new();
        router.create_rtgroup("speakers", default_accept, default_compare);
        router.assign_class_to_rtgroup(NodeType::Player, "speakers");

        let mut graph = NodeGraph::new();
        let mut spec2 = device("spk.good", NodeType::Speakers, 2);
        spec2.pw_index = crate::node::PwObjectId(2);
        graph.create(spec2);
        let mut bad_spec = device("spk.bad", NodeType::Speakers, 2);
        bad_spec.available = false;
        graph.create(bad_spec);

        for key in ["spk.good", "spk.bad"] {
            let mut node = graph.find_by_key_mut(&NodeKey(key.into())).unwrap().clone();
            router.register_node(&mut node);
            *graph.find_by_key_mut(&NodeKey(key.into())).unwrap() = node;
        }
        router.reorder_all_groups(&graph);

        graph.create(stream("player.0", NodeType::Player));
        let player = graph.find_by_key(&NodeKey("player.0".into())).unwrap();
        let target = router.find_default_route(&graph, player);
        assert_eq!(target, Some(NodeKey("spk.good".into())));
    }

    #[test]
    fn explicit_routes_precede_defaults_and_are_idempotent() {
        let mut router = Router::new();
        let id = router.add_explicit_route(1, NodeKey("a".into()), NodeKey("b".into()));
        assert!(id > 0);
        assert_eq!(router.explicit_routes().len(), 1);
        // Re-adding the identical route is a distinct connection id per AM
        // semantics (each is its own admin request) but must not panic or
        // duplicate silently beyond what was asked.
        router.add_explicit_route(2, NodeKey("a".into()), NodeKey("b".into()));
        assert_eq!(router.explicit_routes().len(), 2);
    }

    #[test]
    fn phone_accept_excludes_headphone_and_a2dp() {
        let mut spec = device("hp", NodeType::WiredHeadphone, 2);
        spec.available = true;
        let node = Node::from_spec_for_test(spec);
        assert!(!phone_accept(&node));
    }

    impl Node {
        // test-only constructor shim avoiding `from_spec`'s crate-private
        // visibility without weakening it for production callers.
        fn from_spec_for_test(spec: NodeSpec) -> Node {
            let mut graph = NodeGraph::new();
            graph.create(spec);
            graph.iter().next().unwrap().clone()
        }
    }
}
