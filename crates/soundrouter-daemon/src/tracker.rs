// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tracker: the single point where host events (from the live PipeWire
//! connection or a startup inventory sweep) are translated into node graph
//! mutations via Discovery, reporting back whether a routing pass is now
//! due.
//!
//! Card/sink/source add events arrive independently and in no particular
//! order relative to each other — a sink can be reported before or after
//! its owning card. Discovery's prototype-then-attach split already
//! tolerates this (`add_sink` is a no-op until its card's prototype
//! exists), so Tracker's only job is dispatch and host-index cleanup on
//! removal, not sequencing.

use crate::constraints::Constraints;
use crate::discover::{CardInfo, Discovery, SinkInfo, SinkInputInfo, SourceInfo};
use crate::host::HostHandle;
use crate::multiplex::Multiplex;
use crate::node::{NodeGraph, PwObjectId};
use crate::router::Router;

use tracing::debug;

/// One host-reported change, collapsed from whatever the live connection
/// or inventory sweep observed.
#[derive(Debug, Clone)]
pub enum PwEvent {
    CardAdded(CardInfo),
    CardRemoved(PwObjectId),
    ProfileChanged(CardInfo),
    SinkAdded(SinkInfo),
    SinkRemoved(PwObjectId),
    SourceAdded(SourceInfo),
    SourceRemoved(PwObjectId),
    SinkInputAdded(SinkInputInfo),
    SinkInputRemoved(PwObjectId),
    PortAvailableChanged { card: PwObjectId, port_name: String, available: bool },
}

/// A point-in-time inventory of everything the host currently has, used
/// for the startup sweep so the daemon doesn't start with an empty graph
/// if it's launched after the compositor already has cards/sinks/sources
/// live.
pub trait HostInventory {
    fn cards(&self) -> Vec<CardInfo>;
    fn sinks(&self) -> Vec<SinkInfo>;
    fn sources(&self) -> Vec<SourceInfo>;
    fn sink_inputs(&self) -> Vec<SinkInputInfo>;
}

pub struct Tracker {
    discovery: Discovery,
}

impl Tracker {
    pub fn new(discovery: Discovery) -> Self {
        Tracker { discovery }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Apply one event to the graph/constraints/router, returning whether
    /// the caller should now run a routing pass.
    pub fn handle_event(
        &self,
        graph: &mut NodeGraph,
        constraints: &mut Constraints,
        router: &mut Router,
        mux: &mut Multiplex,
        host: &mut dyn HostHandle,
        event: PwEvent,
    ) -> bool {
        match event {
            PwEvent::CardAdded(card) => {
                self.discovery.add_card(graph, constraints, router, &card);
                false
            }
            PwEvent::ProfileChanged(card) => self.discovery.profile_changed(graph, constraints, router, &card),
            PwEvent::CardRemoved(card_index) => {
                self.remove_card(graph, constraints, router, card_index);
                false
            }
            PwEvent::SinkAdded(sink) => {
                self.discovery.add_sink(graph, host, &sink);
                false
            }
            PwEvent::SinkRemoved(index) => {
                self.detach_host_index(graph, index);
                false
            }
            PwEvent::SourceAdded(source) => {
                self.discovery.add_source(graph, host, &source);
                false
            }
            PwEvent::SourceRemoved(index) => {
                self.detach_host_index(graph, index);
                false
            }
            PwEvent::SinkInputAdded(input) => {
                self.discovery.add_sink_input(graph, router, mux, host, &input);
                false
            }
            PwEvent::SinkInputRemoved(index) => {
                if let Some(node) = graph.find_by_host_ptr(index) {
                    let key = node.key.clone();
                    if let Some(node) = graph.destroy(&key) {
                        router.unregister_node(&node);
                        constraints.remove_node(&node.key);
                    }
                }
                true
            }
            PwEvent::PortAvailableChanged { card, port_name, available } => {
                self.discovery.port_available_changed(graph, card, &port_name, available)
            }
        }
    }

    /// A device/stream node loses its live host index on removal but its
    /// prototype (for devices) stays registered so it can be re-attached
    /// when the sink/source reappears — mirrors how `add_sink`/`add_source`
    /// only ever populate an existing prototype rather than create one.
    fn detach_host_index(&self, graph: &mut NodeGraph, index: PwObjectId) {
        if let Some(node) = graph.find_by_host_ptr_mut(index) {
            let key = node.key.clone();
            graph.rebind_host_ptr(&key, PwObjectId::INVALID);
            if let Some(node) = graph.find_by_key_mut(&key) {
                node.available = false;
            }
            debug!("host index {index:?} detached from node '{key}'");
        }
    }

    fn remove_card(&self, graph: &mut NodeGraph, constraints: &mut Constraints, router: &mut Router, card_index: PwObjectId) {
        let keys: Vec<_> = graph.iter().filter(|n| n.pw_card.index == card_index).map(|n| n.key.clone()).collect();
        let constraint_name = format!("card.{}", card_index.0);
        for key in keys {
            if let Some(node) = graph.destroy(&key) {
                router.unregister_node(&node);
                constraints.remove_node(&node.key);
            }
        }
        constraints.destroy(&constraint_name);
    }

    /// Startup sweep: enumerate everything the host already has, in the
    /// order that lets each stage's prototypes exist before the next stage
    /// tries to attach to them (cards, then sinks/sources, then streams).
    /// Returns whether a routing pass is due.
    pub fn synchronize(
        &self,
        graph: &mut NodeGraph,
        constraints: &mut Constraints,
        router: &mut Router,
        mux: &mut Multiplex,
        host: &mut dyn HostHandle,
        inventory: &dyn HostInventory,
    ) -> bool {
        for card in inventory.cards() {
            self.discovery.add_card(graph, constraints, router, &card);
        }
        for sink in inventory.sinks() {
            self.discovery.add_sink(graph, host, &sink);
        }
        for source in inventory.sources() {
            self.discovery.add_source(graph, host, &source);
        }
        let mut needs_routing = false;
        for input in inventory.sink_inputs() {
            if self.discovery.add_sink_input(graph, router, mux, host, &input).is_some() {
                needs_routing = true;
            }
        }
        needs_routing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::PortInfo;
    use crate::host::FakeHost;
    use crate::node::Direction;

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

    struct Inventory {
        card: CardInfo,
        sink: SinkInfo,
    }

    impl HostInventory for Inventory {
        fn cards(&self) -> Vec<CardInfo> {
            vec![self.card.clone()]
        }
        fn sinks(&self) -> Vec<SinkInfo> {
            vec![self.sink.clone()]
        }
        fn sources(&self) -> Vec<SourceInfo> {
            Vec::new()
        }
        fn sink_inputs(&self) -> Vec<SinkInputInfo> {
            Vec::new()
        }
    }

    #[test]
    fn synchronize_sweeps_cards_before_sinks() {
        let tracker = Tracker::new(Discovery::new(PwObjectId(100), PwObjectId(101)));
        let mut graph = NodeGraph::new();
        let mut constraints = Constraints::new();
        let mut router = Router::new();
        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let mut host = FakeHost::new(PwObjectId(100), PwObjectId(101));

        let inventory = Inventory {
            card: make_card(),
            sink: SinkInfo {
                index: PwObjectId(50),
                name: "alsa_card.pci".to_string(),
                channels: 2,
                card: Some(PwObjectId(1)),
                port: Some("analog-output-speaker".to_string()),
            },
        };

        tracker.synchronize(&mut graph, &mut constraints, &mut router, &mut mux, &mut host, &inventory);
        assert!(graph.find_by_host_ptr(PwObjectId(50)).is_some());
    }

    #[test]
    fn card_removed_destroys_every_node_and_the_constraint_group() {
        let tracker = Tracker::new(Discovery::new(PwObjectId(100), PwObjectId(101)));
        let mut graph = NodeGraph::new();
        let mut constraints = Constraints::new();
        let mut router = Router::new();
        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let mut host = FakeHost::new(PwObjectId(100), PwObjectId(101));

        tracker.handle_event(
            &mut graph,
            &mut constraints,
            &mut router,
            &mut mux,
            &mut host,
            PwEvent::CardAdded(make_card()),
        );
        assert_eq!(graph.len(), 1);

        tracker.handle_event(
            &mut graph,
            &mut constraints,
            &mut router,
            &mut mux,
            &mut host,
            PwEvent::CardRemoved(PwObjectId(1)),
        );
        assert_eq!(graph.len(), 0);
        assert!(constraints.kind_of("card.1").is_none());
    }

    #[test]
    fn sink_removed_detaches_host_index_but_keeps_prototype() {
        let tracker = Tracker::new(Discovery::new(PwObjectId(100), PwObjectId(101)));
        let mut graph = NodeGraph::new();
        let mut constraints = Constraints::new();
        let mut router = Router::new();
        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let mut host = FakeHost::new(PwObjectId(100), PwObjectId(101));

        tracker.handle_event(
            &mut graph,
            &mut constraints,
            &mut router,
            &mut mux,
            &mut host,
            PwEvent::CardAdded(make_card()),
        );
        tracker.handle_event(
            &mut graph,
            &mut constraints,
            &mut router,
            &mut mux,
            &mut host,
            PwEvent::SinkAdded(SinkInfo {
                index: PwObjectId(50),
                name: "alsa_card.pci".to_string(),
                channels: 2,
                card: Some(PwObjectId(1)),
                port: Some("analog-output-speaker".to_string()),
            }),
        );
        assert!(graph.find_by_host_ptr(PwObjectId(50)).is_some());

        tracker.handle_event(
            &mut graph,
            &mut constraints,
            &mut router,
            &mut mux,
            &mut host,
            PwEvent::SinkRemoved(PwObjectId(50)),
        );
        assert!(graph.find_by_host_ptr(PwObjectId(50)).is_none());
        assert_eq!(graph.len(), 1);
    }
}
