// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Discovery: turns host card/sink/source/sink-input events into node
//! graph mutations. The single writer of [`crate::node::NodeGraph`].
//!
//! Discovery operates directly on [`NodeGraph`]'s `by_key`/`by_host_ptr`
//! maps rather than keeping a second copy of its own.

use crate::classify::{self, CardSnapshot, PortSnapshot, StreamClassifier};
use crate::constraints::{ConstraintKind, Constraints};
use crate::host::HostHandle;
use crate::multiplex::{is_multiplex_class, Multiplex};
use crate::node::{
    new_stamp, CardRef, Direction, Implement, Location, NodeGraph, NodeKey, NodeSpec, NodeType, Privacy, PwObjectId,
};
use crate::router::Router;

use tracing::{debug, warn};

/// Host-reported state of one port on a card.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub direction: Direction,
    pub available: bool,
}

/// Host-reported state of one card; `active_profile` is the raw PipeWire
/// profile name, e.g. `"output:analog-stereo+input:analog-stereo"` for
/// alsa, or a single profile name (`"a2dp"`) for bluetooth.
#[derive(Debug, Clone)]
pub struct CardInfo {
    pub index: PwObjectId,
    pub name: String,
    pub bus: Option<String>,
    pub form_factor: Option<String>,
    pub active_profile: String,
    pub ports: Vec<PortInfo>,
}

#[derive(Debug, Clone)]
pub struct SinkInfo {
    pub index: PwObjectId,
    pub name: String,
    pub channels: u32,
    pub card: Option<PwObjectId>,
    pub port: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub index: PwObjectId,
    pub name: String,
    pub channels: u32,
    pub card: Option<PwObjectId>,
    pub port: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SinkInputInfo {
    pub index: PwObjectId,
    pub name: String,
    pub process_binary: Option<String>,
    pub media_role: Option<String>,
    pub channels: u32,
}

/// Admissible channel-count range for admitting a sink/source node.
#[derive(Debug, Clone, Copy)]
pub struct ChannelFilter {
    pub min: u32,
    pub max: u32,
}

impl Default for ChannelFilter {
    fn default() -> Self {
        ChannelFilter { min: 1, max: 2 }
    }
}

impl ChannelFilter {
    fn admits(&self, channels: u32) -> bool {
        channels >= self.min && channels <= self.max
    }
}

pub struct Discovery {
    pub channel_filter: ChannelFilter,
    /// When true (default for alsa cards), non-active profile segments are
    /// skipped entirely rather than creating unavailable prototypes.
    pub selected_only: bool,
    classifier: StreamClassifier,
    null_sink: PwObjectId,
    null_source: PwObjectId,
}

fn bluetooth_profiles() -> &'static [&'static str] {
    &["a2dp", "a2dp_source", "a2dp_sink", "hsp", "hfgw"]
}

fn is_bluetooth(card: &CardInfo) -> bool {
    card.bus.as_deref().is_some_and(|b| b.eq_ignore_ascii_case("bluetooth"))
}

impl Discovery {
    pub fn new(null_sink: PwObjectId, null_source: PwObjectId) -> Self {
        Discovery {
            channel_filter: ChannelFilter::default(),
            selected_only: true,
            classifier: StreamClassifier::default(),
            null_sink,
            null_source,
        }
    }

    /// Dispatches on bus. Returns the keys of every
    /// node prototype it created, so the caller can register them with the
    /// Router and Constraints.
    pub fn add_card(&self, graph: &mut NodeGraph, constraints: &mut Constraints, router: &mut Router, card: &CardInfo) -> Vec<NodeKey> {
        if is_bluetooth(card) {
            self.add_bluetooth_card(graph, constraints, router, card)
        } else {
            self.add_alsa_card(graph, constraints, router, card, new_stamp())
        }
    }

    fn add_alsa_card(
        &self,
        graph: &mut NodeGraph,
        constraints: &mut Constraints,
        router: &mut Router,
        card: &CardInfo,
        stamp: u32,
    ) -> Vec<NodeKey> {
        let mut created = Vec::new();
        let constraint_name = format!("card.{}", card.index.0);
        constraints.create(&constraint_name, ConstraintKind::Card, &card.name);

        for segment in card.active_profile.split('+') {
            let Some((kind, profile_name)) = segment.split_once(':') else { continue };
            let direction = match kind {
                "output" => Direction::Output,
                "input" => Direction::Input,
                _ => continue,
            };

            for port in card.ports.iter().filter(|p| p.direction == direction) {
                if self.selected_only && !port.available {
                    continue;
                }

                let snapshot = CardSnapshot { bus: card.bus.clone(), form_factor: card.form_factor.clone() };
                let port_snapshot = PortSnapshot { name: port.name.clone(), description: port.description.clone() };
                let classification = classify::classify_device(&snapshot, Some(profile_name), Some(&port_snapshot), direction);

                let key = NodeKey::for_device(&card.name, Some(&port.name));
                let spec = NodeSpec {
                    key: key.clone(),
                    direction,
                    implement: Implement::Device,
                    channels: 2,
                    location: classification.location,
                    privacy: classification.privacy,
                    node_type: classification.node_type,
                    visible: true,
                    available: port.available,
                    am_name: Some(port.description.clone()),
                    am_descr: Some(port.description.clone()),
                    pw_name: card.name.clone(),
                    pw_index: PwObjectId::INVALID,
                    pw_card: CardRef { index: card.index, profile: Some(segment.to_string()) },
                    pw_port: Some(port.name.clone()),
                    stamp,
                };

                if let Some(node) = graph.create(spec) {
                    let key = node.key.clone();
                    created.push(key.clone());
                    constraints.add_node(&constraint_name, key.clone());
                    if let Some(node) = graph.find_by_key_mut(&key) {
                        router.register_node(node);
                    }
                }
            }
        }
        created
    }

    fn add_bluetooth_card(
        &self,
        graph: &mut NodeGraph,
        constraints: &mut Constraints,
        router: &mut Router,
        card: &CardInfo,
    ) -> Vec<NodeKey> {
        let mut created = Vec::new();
        let constraint_name = format!("card.{}", card.index.0);
        constraints.create(&constraint_name, ConstraintKind::Card, &card.name);

        for profile in bluetooth_profiles() {
            for direction in [Direction::Output, Direction::Input] {
                let snapshot = CardSnapshot { bus: card.bus.clone(), form_factor: card.form_factor.clone() };
                let classification = classify::classify_device(&snapshot, Some(profile), None, direction);
                if classification.node_type == NodeType::Unknown {
                    continue;
                }

                let key = NodeKey::for_device(&card.name, Some(profile));
                let is_active = card.active_profile == *profile;
                let spec = NodeSpec {
                    key: key.clone(),
                    direction,
                    implement: Implement::Device,
                    channels: 2,
                    location: Location::External,
                    privacy: Privacy::Private,
                    node_type: classification.node_type,
                    visible: true,
                    available: is_active,
                    am_name: Some(card.name.clone()),
                    am_descr: Some(card.name.clone()),
                    pw_name: card.name.clone(),
                    pw_index: PwObjectId::INVALID,
                    pw_card: CardRef { index: card.index, profile: Some(profile.to_string()) },
                    pw_port: None,
                    stamp: new_stamp(),
                };

                if let Some(node) = graph.create(spec) {
                    let key = node.key.clone();
                    created.push(key.clone());
                    constraints.add_node(&constraint_name, key.clone());
                    if let Some(node) = graph.find_by_key_mut(&key) {
                        router.register_node(node);
                    }
                }
            }
        }
        created
    }

    /// Alsa path re-expands prototypes under
    /// a fresh stamp and destroys stale ones; bluetooth path flips
    /// availability in place and reports that a deferred routing pass is
    /// needed (the host's sink/source for the new profile may not exist
    /// yet at the moment this fires).
    pub fn profile_changed(
        &self,
        graph: &mut NodeGraph,
        constraints: &mut Constraints,
        router: &mut Router,
        card: &CardInfo,
    ) -> bool {
        if is_bluetooth(card) {
            let mut needs_routing = false;
            let keys: Vec<NodeKey> = graph
                .iter()
                .filter(|n| n.pw_card.index == card.index)
                .map(|n| n.key.clone())
                .collect();
            for key in keys {
                if let Some(node) = graph.find_by_key_mut(&key) {
                    let is_active = node.pw_card.profile.as_deref() == Some(card.active_profile.as_str());
                    if node.available != is_active {
                        node.available = is_active;
                        needs_routing = true;
                    }
                }
            }
            needs_routing
        } else {
            let stamp = new_stamp();
            self.add_alsa_card(graph, constraints, router, card, stamp);

            let stale: Vec<NodeKey> = graph
                .iter()
                .filter(|n| n.pw_card.index == card.index && n.stamp < stamp)
                .map(|n| n.key.clone())
                .collect();
            for key in &stale {
                if let Some(node) = graph.destroy(key) {
                    router.unregister_node(&node);
                    constraints.remove_node(&node.key);
                }
            }
            true
        }
    }

    /// Attach a host index to the
    /// matching prototype, creating a loopback if the node's class
    /// requires one to stay alive without a real stream.
    pub fn add_sink(&self, graph: &mut NodeGraph, host: &mut dyn HostHandle, sink: &SinkInfo) {
        if !self.channel_filter.admits(sink.channels) {
            debug!("sink '{}' has {} channels, outside admitted range", sink.name, sink.channels);
            return;
        }
        let Some(card) = sink.card else {
            return;
        };
        let key = NodeKey::for_device(&sink.name, sink.port.as_deref());
        let Some(node) = graph.find_by_key_mut(&key) else {
            debug!("no prototype found for sink '{}'", sink.name);
            return;
        };
        node.pw_name = sink.name.clone();
        let _ = card;
        let node_type = node.node_type;
        let node_key = node.key.clone();
        graph.rebind_host_ptr(&node_key, sink.index);

        if let Some(role) = classify::loopback_role(node_type) {
            let loopback = host.create_loopback(host.null_source(), sink.index, role);
            if let Some(node) = graph.find_by_key_mut(&node_key) {
                node.loop_handle = Some(loopback);
            }
        }
    }

    pub fn add_source(&self, graph: &mut NodeGraph, host: &mut dyn HostHandle, source: &SourceInfo) {
        if !self.channel_filter.admits(source.channels) {
            return;
        }
        let key = NodeKey::for_device(&source.name, source.port.as_deref());
        let Some(node) = graph.find_by_key_mut(&key) else {
            debug!("no prototype found for source '{}'", source.name);
            return;
        };
        node.pw_name = source.name.clone();
        let node_type = node.node_type;
        let node_key = node.key.clone();
        graph.rebind_host_ptr(&node_key, source.index);

        if let Some(role) = classify::loopback_role(node_type) {
            let loopback = host.create_loopback(source.index, host.null_sink(), role);
            if let Some(node) = graph.find_by_key_mut(&node_key) {
                node.loop_handle = Some(loopback);
            }
        }
    }

    /// Classify, pre-route, and (for
    /// multiplex-capable classes) wrap the route in a multiplex before
    /// asking the host to create the stream.
    pub fn add_sink_input(
        &self,
        graph: &mut NodeGraph,
        router: &mut Router,
        mux: &mut Multiplex,
        host: &mut dyn HostHandle,
        input: &SinkInputInfo,
    ) -> Option<NodeKey> {
        let node_type = self.classifier.classify(input.media_role.as_deref(), input.process_binary.as_deref());
        let key = NodeKey::for_stream(&input.name);

        let spec = NodeSpec {
            key: key.clone(),
            direction: Direction::Input,
            implement: Implement::Stream,
            channels: input.channels,
            location: Location::Unknown,
            privacy: Privacy::Unknown,
            node_type,
            visible: true,
            available: true,
            am_name: Some(input.name.clone()),
            am_descr: Some(input.name.clone()),
            pw_name: input.name.clone(),
            pw_index: input.index,
            pw_card: CardRef::default(),
            pw_port: None,
            stamp: new_stamp(),
        };

        let stream_node = graph.create(spec)?.clone();
        router.register_node(&mut stream_node.clone());
        router.reorder_nodlist(graph);

        let orders = router.make_prerouting(graph, &stream_node);
        let Some(order) = orders.iter().find(|o| o.from.is_none()) else {
            warn!("pre-routing produced no target for stream '{}'", input.name);
            return Some(key);
        };

        let Some(target) = graph.find_by_key(&order.to) else { return Some(key) };
        let sink_index = target.pw_index;

        if is_multiplex_class(node_type) {
            let handle = mux.ensure(sink_index, node_type).expect("is_multiplex_class implies ensure succeeds");
            mux.set_default_stream(handle, Some(input.index));
            if let Some(node) = graph.find_by_key_mut(&key) {
                node.mux = Some(handle);
            }
            debug!("stream '{}' wrapped in multiplex {handle:?} targeting '{}'", input.name, order.to);
        }

        host.move_stream(input.index, sink_index);
        Some(key)
    }

    /// Returns whether a routing pass
    /// is now required.
    pub fn port_available_changed(&self, graph: &mut NodeGraph, card: PwObjectId, port_name: &str, available: bool) -> bool {
        let Some(node) = graph.iter_mut().find(|n| n.pw_card.index == card && n.pw_port.as_deref() == Some(port_name)) else {
            return false;
        };
        if node.available == available {
            return false;
        }
        node.available = available;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use crate::router::{default_accept, default_compare};

    fn make_card() -> CardInfo {
        CardInfo {
            index: PwObjectId(1),
            name: "alsa_card.pci".to_string(),
            bus: Some("pci".to_string()),
            form_factor: Some("internal".to_string()),
            active_profile: "output:analog-stereo".to_string(),
            ports: vec![PortInfo {
                name: "analog-output-speaker".to_string(),
                description: "Speakers".to_string(),
                direction: Direction::Output,
                available: true,
            }],
        }
    }

    #[test]
    fn add_alsa_card_creates_one_prototype_per_admissible_port() {
        let discovery = Discovery::new(PwObjectId(100), PwObjectId(101));
        let mut graph = NodeGraph::new();
        let mut constraints = Constraints::new();
        let mut router = Router::new();
        router.create_rtgroup("speakers", default_accept, default_compare);
        router.assign_class_to_rtgroup(NodeType::Speakers, "speakers");

        let created = discovery.add_card(&mut graph, &mut constraints, &mut router, &make_card());
        assert_eq!(created.len(), 1);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn add_sink_attaches_host_index_and_rebinds_lookup() {
        let discovery = Discovery::new(PwObjectId(100), PwObjectId(101));
        let mut graph = NodeGraph::new();
        let mut constraints = Constraints::new();
        let mut router = Router::new();
        discovery.add_card(&mut graph, &mut constraints, &mut router, &make_card());

        let mut host = FakeHost::new(PwObjectId(100), PwObjectId(101));
        let sink = SinkInfo {
            index: PwObjectId(50),
            name: "alsa_card.pci".to_string(),
            channels: 2,
            card: Some(PwObjectId(1)),
            port: Some("analog-output-speaker".to_string()),
        };
        discovery.add_sink(&mut graph, &mut host, &sink);

        let key = NodeKey::for_device("alsa_card.pci", Some("analog-output-speaker"));
        assert_eq!(graph.find_by_key(&key).unwrap().pw_index, PwObjectId(50));
        assert!(graph.find_by_host_ptr(PwObjectId(50)).is_some());
    }

    #[test]
    fn sink_outside_channel_range_is_not_attached() {
        let discovery = Discovery::new(PwObjectId(100), PwObjectId(101));
        let mut graph = NodeGraph::new();
        let mut constraints = Constraints::new();
        let mut router = Router::new();
        discovery.add_card(&mut graph, &mut constraints, &mut router, &make_card());

        let mut host = FakeHost::new(PwObjectId(100), PwObjectId(101));
        let sink = SinkInfo {
            index: PwObjectId(50),
            name: "alsa_card.pci".to_string(),
            channels: 8,
            card: Some(PwObjectId(1)),
            port: Some("analog-output-speaker".to_string()),
        };
        discovery.add_sink(&mut graph, &mut host, &sink);
        assert!(graph.find_by_host_ptr(PwObjectId(50)).is_none());
    }

    #[test]
    fn add_sink_input_wraps_multiplex_class_in_a_mux_and_moves_it() {
        let discovery = Discovery::new(PwObjectId(100), PwObjectId(101));
        let mut graph = NodeGraph::new();
        let mut constraints = Constraints::new();
        let mut router = Router::new();
        router.create_rtgroup("default", default_accept, default_compare);
        router.assign_class_to_rtgroup(NodeType::Player, "default");
        router.assign_priority(NodeType::Player, 30);
        discovery.add_card(&mut graph, &mut constraints, &mut router, &make_card());

        let mut host = FakeHost::new(PwObjectId(100), PwObjectId(101));
        let sink = SinkInfo {
            index: PwObjectId(50),
            name: "alsa_card.pci".to_string(),
            channels: 2,
            card: Some(PwObjectId(1)),
            port: Some("analog-output-speaker".to_string()),
        };
        discovery.add_sink(&mut graph, &mut host, &sink);

        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let input = SinkInputInfo {
            index: PwObjectId(200),
            name: "firefox.music".to_string(),
            process_binary: None,
            media_role: Some("music".to_string()),
            channels: 2,
        };
        let key = discovery.add_sink_input(&mut graph, &mut router, &mut mux, &mut host, &input).unwrap();

        let node = graph.find_by_key(&key).unwrap();
        assert!(node.mux.is_some());
        assert_eq!(host.moves, vec![(PwObjectId(200), PwObjectId(50))]);
        assert!(mux.find_by_sink(PwObjectId(50)).is_some());
    }
}
