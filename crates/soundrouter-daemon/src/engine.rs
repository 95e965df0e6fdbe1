// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Engine: owns every routing module (node graph, constraints, router,
//! switch, multiplex, volume engine) and the live host connection, and
//! drives one routing/volume pass per host event. The single place that
//! wires the otherwise-acyclic module graph together, the same role
//! `DaemonService` plays for PipeWire state in sibling daemons.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::DaemonConfig;
use crate::constraints::Constraints;
use crate::discover::{CardInfo, Discovery, SinkInfo, SinkInputInfo, SourceInfo};
use crate::host::{DaemonHost, HostHandle};
use crate::multiplex::Multiplex;
use crate::node::{NodeGraph, NodeKey, NodeType};
use crate::router::{self, Router};
use crate::switch::Switch;
use crate::tracker::{HostInventory, PwEvent, Tracker};
use crate::volume::{self, VolumeEngine};

/// Default phone-style suppression: an active phone call ducks media
/// playback rather than letting it mix in, mirroring
/// `mir_volume_suppress`'s exception-list approach generalized to one
/// limiting/suppressed pair.
const DEFAULT_SUPPRESSED_DURING_PHONE: NodeType = NodeType::Player;

fn configure_routing_groups(router: &mut Router) {
    router.create_rtgroup("default", router::default_accept, router::default_compare);
    router.create_rtgroup("phone", router::phone_accept, router::phone_compare);

    // Every application class routes through the default group except
    // phone calls, which use the narrower phone-style group (no a2dp/
    // usb-or-wired-headphone/hdmi/spdif targets) per spec.md section 4.8.
    for class in [
        NodeType::Radio,
        NodeType::Player,
        NodeType::Navigator,
        NodeType::Game,
        NodeType::Browser,
        NodeType::Event,
        NodeType::Camera,
        NodeType::Alert,
        NodeType::System,
    ] {
        router.assign_class_to_rtgroup(class, "default");
    }
    router.assign_class_to_rtgroup(NodeType::Phone, "phone");

    // Priority order: phone calls and navigation must not be silently
    // displaced by a later, lower-priority media stream.
    router.assign_priority(NodeType::Phone, 100);
    router.assign_priority(NodeType::Navigator, 90);
    router.assign_priority(NodeType::Alert, 80);
    router.assign_priority(NodeType::Event, 70);
    router.assign_priority(NodeType::Camera, 60);
    router.assign_priority(NodeType::Game, 50);
    router.assign_priority(NodeType::Radio, 40);
    router.assign_priority(NodeType::Player, 30);
    router.assign_priority(NodeType::Browser, 20);
    router.assign_priority(NodeType::System, 10);
}

fn configure_volume_limits(volume: &mut VolumeEngine, config: &DaemonConfig) {
    volume.add_limiting_class(NodeType::Phone, DEFAULT_SUPPRESSED_DURING_PHONE);
    // `mir_volume_correction`: device nodes with public privacy get a
    // mild headroom cut so a phone's built-in speaker doesn't clip at
    // unity gain; identity elsewhere.
    volume.set_correction_curve(vec![(0.0, 0.0), (0.8, 0.72), (1.0, 0.85)]);
    volume.set_fade_times(config.volume_fade.fade_out_ms, config.volume_fade.fade_in_ms);
}

/// A point-in-time inventory collected by draining a freshly connected
/// host's event stream for a bounded startup window, used to feed
/// [`Tracker::synchronize`] before the engine starts treating arriving
/// events as live. Grounded on `PipeWireHost::connect`'s own
/// deadline-bounded drain used to learn the null sink/source indices.
#[derive(Default)]
pub struct CollectedInventory {
    pub cards: Vec<CardInfo>,
    pub sinks: Vec<SinkInfo>,
    pub sources: Vec<SourceInfo>,
    pub sink_inputs: Vec<SinkInputInfo>,
}

impl HostInventory for CollectedInventory {
    fn cards(&self) -> Vec<CardInfo> {
        self.cards.clone()
    }
    fn sinks(&self) -> Vec<SinkInfo> {
        self.sinks.clone()
    }
    fn sources(&self) -> Vec<SourceInfo> {
        self.sources.clone()
    }
    fn sink_inputs(&self) -> Vec<SinkInputInfo> {
        self.sink_inputs.clone()
    }
}

/// Drains `events` for up to `window`, classifying every `*Added` event
/// into the startup inventory snapshot. Events unrelated to initial
/// enumeration (removals, availability changes) are rare during this
/// window on a freshly connected host and are logged and skipped rather
/// than replayed twice.
pub fn collect_startup_inventory(events: &std::sync::mpsc::Receiver<PwEvent>, window: Duration) -> CollectedInventory {
    let mut inventory = CollectedInventory::default();
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match events.recv_timeout(remaining) {
            Ok(PwEvent::CardAdded(card)) => inventory.cards.push(card),
            Ok(PwEvent::SinkAdded(sink)) => inventory.sinks.push(sink),
            Ok(PwEvent::SourceAdded(source)) => inventory.sources.push(source),
            Ok(PwEvent::SinkInputAdded(input)) => inventory.sink_inputs.push(input),
            Ok(other) => {
                tracing::debug!("ignoring non-enumeration event during startup sweep: {other:?}");
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => break,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    inventory
}

/// Owns every routing module plus the live host connection; `H` is the
/// concrete [`DaemonHost`] (the real PipeWire connection in production,
/// [`crate::host::FakeHost`] in tests).
pub struct Engine<H: DaemonHost> {
    graph: NodeGraph,
    constraints: Constraints,
    router: Router,
    switch: Switch,
    multiplex: Multiplex,
    volume: VolumeEngine,
    tracker: Tracker,
    host: H,
}

impl<H: DaemonHost> Engine<H> {
    pub fn new(host: H, config: &DaemonConfig) -> Self {
        let null_sink = host.null_sink();
        let null_source = host.null_source();
        let mut router = Router::new();
        configure_routing_groups(&mut router);
        let mut volume = VolumeEngine::new();
        configure_volume_limits(&mut volume, config);

        Engine {
            graph: NodeGraph::new(),
            constraints: Constraints::new(),
            router,
            switch: Switch::new(),
            multiplex: Multiplex::new(config.combine.clone()),
            volume,
            tracker: Tracker::new(Discovery::new(null_sink, null_source)),
            host,
        }
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Startup synchronization sweep (spec.md section 4.4): populate the
    /// graph from a point-in-time inventory, then always run a routing
    /// pass regardless of whether any stream was found, so volume limits
    /// and an empty-graph Audio Manager replay are consistent either way.
    pub fn synchronize(&mut self, inventory: &dyn HostInventory) {
        self.tracker.synchronize(&mut self.graph, &mut self.constraints, &mut self.router, &mut self.multiplex, &mut self.host, inventory);
        self.route_and_apply_volume();
    }

    /// Apply one live host event; runs a routing pass only when the event
    /// actually requires one (profile changes, port availability flips,
    /// stream removal), per each event's own contract.
    pub fn handle_event(&mut self, event: PwEvent) {
        let needs_routing = self.tracker.handle_event(&mut self.graph, &mut self.constraints, &mut self.router, &mut self.multiplex, &mut self.host, event);
        if needs_routing {
            self.route_and_apply_volume();
        }
    }

    /// One full routing pass: materialize the router's decision, execute
    /// it through Switch, then apply volume limits — volume limits are
    /// strictly a post-routing step (spec.md section 5's ordering
    /// guarantee).
    pub fn route_and_apply_volume(&mut self) {
        let orders = self.router.make_routing(&self.graph);
        let results = self.switch.execute(&mut self.graph, &mut self.multiplex, &mut self.host, &orders);
        for (order, result) in orders.iter().zip(&results) {
            if let Err(e) = result {
                warn!("route {:?} -> '{}' failed: {e}", order.from, order.to);
            }
        }
        self.volume.apply_limits(&mut self.graph);
        self.apply_stream_volumes(&orders, &results);
    }

    /// Post-routing volume application (spec.md section 4.12): for every
    /// order that landed a stream on an output, compute its attenuation
    /// against that output and drive the host, immediately or ramped.
    fn apply_stream_volumes(&mut self, orders: &[router::RouteOrder], results: &[Result<(), crate::switch::SwitchError>]) {
        for (order, result) in orders.iter().zip(results) {
            if result.is_err() {
                continue;
            }
            let Some(from) = &order.from else { continue };
            let Some(stream) = self.graph.find_by_key(from) else { continue };
            let stream_type = stream.node_type;
            let stream_pw_index = stream.pw_index;
            let Some(device) = self.graph.find_by_key(&order.to) else { continue };

            let db = self.volume.db_for_stream(device, stream_type);
            let linear = volume::linear_from_db(db);
            let ramp_ms = self.volume.ramp_ms_for(db);
            self.host.set_stream_volume(stream_pw_index, linear, ramp_ms);
        }
    }

    /// Adds an admin/Audio-Manager-requested explicit route and re-runs
    /// routing; adding is idempotent at the router layer (same
    /// `(amid, from, to)` triple resolves to the same switch state).
    pub fn add_explicit_route(&mut self, am_id: u16, from: NodeKey, to: NodeKey) -> u16 {
        let id = self.router.add_explicit_route(am_id, from, to);
        self.route_and_apply_volume();
        id
    }

    pub fn remove_explicit_route(&mut self, from: &NodeKey, to: &NodeKey) {
        self.router.remove_explicit_route(from, to);
        self.route_and_apply_volume();
    }

    /// Looks up the `(from, to)` pair behind an Audio-Manager connection
    /// id, used by the bridge to resolve `asyncDisconnect` without
    /// threading AM connection ids through the router's own state.
    pub fn find_explicit_route(&self, am_id: u16) -> Option<(NodeKey, NodeKey)> {
        self.router.explicit_routes().iter().find(|c| c.am_id == am_id).map(|c| (c.from.clone(), c.to.clone()))
    }

    /// Records the Audio Manager id assigned to a node once the bridge's
    /// `registerSink`/`registerSource` call completes, so later sweeps can
    /// tell an already-registered node from a newly discovered one.
    pub fn set_node_am_id(&mut self, key: &NodeKey, am_id: u16) {
        if let Some(node) = self.graph.find_by_key_mut(key) {
            node.am_id = Some(am_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use crate::node::PwObjectId;

    fn engine() -> Engine<FakeHost> {
        let host = FakeHost::new(PwObjectId(1), PwObjectId(2));
        Engine::new(host, &DaemonConfig::default())
    }

    #[test]
    fn new_engine_has_empty_graph_and_configured_groups() {
        let e = engine();
        assert_eq!(e.graph().len(), 0);
        assert!(e.router().explicit_routes().is_empty());
    }

    #[test]
    fn synchronize_with_empty_inventory_still_runs_a_pass() {
        let mut e = engine();
        let inventory = CollectedInventory::default();
        // Should not panic on an empty graph; this is the
        // "no stream found yet" branch of the startup sweep.
        e.synchronize(&inventory);
        assert_eq!(e.graph().len(), 0);
    }

    #[test]
    fn explicit_route_lookup_roundtrips_by_am_id() {
        let mut e = engine();
        e.graph.create(crate::node::NodeSpec {
            key: NodeKey("stream.a".into()),
            direction: crate::node::Direction::Input,
            implement: crate::node::Implement::Stream,
            channels: 2,
            location: crate::node::Location::Unknown,
            privacy: crate::node::Privacy::Unknown,
            node_type: NodeType::Player,
            visible: true,
            available: true,
            am_name: None,
            am_descr: None,
            pw_name: "stream.a".into(),
            pw_index: PwObjectId(10),
            pw_card: Default::default(),
            pw_port: None,
            stamp: crate::node::new_stamp(),
        });
        e.graph.create(crate::node::NodeSpec {
            key: NodeKey("sink.a".into()),
            direction: crate::node::Direction::Output,
            implement: crate::node::Implement::Device,
            channels: 2,
            location: crate::node::Location::Internal,
            privacy: crate::node::Privacy::Public,
            node_type: NodeType::Speakers,
            visible: true,
            available: true,
            am_name: None,
            am_descr: None,
            pw_name: "sink.a".into(),
            pw_index: PwObjectId(11),
            pw_card: Default::default(),
            pw_port: None,
            stamp: crate::node::new_stamp(),
        });
        let id = e.add_explicit_route(7, NodeKey("stream.a".into()), NodeKey("sink.a".into()));
        assert_eq!(e.find_explicit_route(id), Some((NodeKey("stream.a".into()), NodeKey("sink.a".into()))));
        assert_eq!(e.find_explicit_route(9999), None);
    }
}
