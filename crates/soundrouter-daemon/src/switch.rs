// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Switch: executes the [`crate::router::RouteOrder`]s a routing pass
//! produces, by moving streams between devices and (for multiplexed
//! classes) fanning a stream out across several devices at once.
//!
//! Link setup dispatches on `(from.implement, to.implement)`. Only the
//! `stream -> device` and `device -> device` cases do real work; the other
//! two combinations are nonsensical for a routing decision (a device is
//! never the *source* of a route, a stream is never switched onto another
//! stream) and are logged as unsupported.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::combine::CombineSinkHandle;
use crate::multiplex::{is_multiplex_class, Multiplex};
use crate::node::{Implement, Node, NodeGraph, NodeKey, PwObjectId};
use crate::router::RouteOrder;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("node '{0}' not found")]
    NodeNotFound(NodeKey),
    #[error("'{from}' is a {from_kind}, '{to}' is a {to_kind}: no route between these implement kinds")]
    UnsupportedLink {
        from: NodeKey,
        from_kind: &'static str,
        to: NodeKey,
        to_kind: &'static str,
    },
    #[error("profile change on card refused: a change is already in progress")]
    ProfileChangeInProgress,
}

fn implement_name(i: Implement) -> &'static str {
    match i {
        Implement::Unknown => "unknown",
        Implement::Device => "device",
        Implement::Stream => "stream",
    }
}

/// Host-facing operations Switch needs but does not implement itself — the
/// actual PipeWire link/move calls live behind this so the module stays
/// testable without a live graph.
pub trait LinkHost {
    fn move_stream(&mut self, stream: PwObjectId, sink: PwObjectId);
    fn set_card_profile(&mut self, card: PwObjectId, profile: &str);
}

/// Tracks the one profile change request a card may have in flight, so a
/// second request on the same card while the first hasn't completed is
/// refused rather than silently reordered.
#[derive(Default)]
pub struct ProfileGuard {
    pending: HashMap<PwObjectId, String>,
}

impl ProfileGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&mut self, card: PwObjectId, profile: &str) -> Result<(), SwitchError> {
        if let Some(existing) = self.pending.get(&card) {
            if existing != profile {
                return Err(SwitchError::ProfileChangeInProgress);
            }
            return Ok(());
        }
        self.pending.insert(card, profile.to_string());
        Ok(())
    }

    pub fn complete(&mut self, card: PwObjectId) {
        self.pending.remove(&card);
    }
}

pub struct Switch {
    profiles: ProfileGuard,
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}

impl Switch {
    pub fn new() -> Self {
        Switch { profiles: ProfileGuard::new() }
    }

    /// Execute one routing pass's orders in order, mutating the graph's
    /// `pw_index`/multiplex bookkeeping as links land.
    pub fn execute(
        &mut self,
        graph: &mut NodeGraph,
        mux: &mut Multiplex,
        host: &mut dyn LinkHost,
        orders: &[RouteOrder],
    ) -> Vec<Result<(), SwitchError>> {
        orders
            .iter()
            .map(|order| self.setup_link(graph, mux, host, order))
            .collect()
    }

    fn setup_link(
        &mut self,
        graph: &mut NodeGraph,
        mux: &mut Multiplex,
        host: &mut dyn LinkHost,
        order: &RouteOrder,
    ) -> Result<(), SwitchError> {
        let to_implement = graph.find_by_key(&order.to).ok_or_else(|| SwitchError::NodeNotFound(order.to.clone()))?.implement;

        match order.from.clone() {
            Some(from_key) => {
                let from_implement = graph.find_by_key(&from_key).ok_or_else(|| SwitchError::NodeNotFound(from_key.clone()))?.implement;
                match (from_implement, to_implement) {
                    (Implement::Stream, Implement::Device) => {
                        if order.explicit {
                            self.explicit_link_from_stream_to_device(graph, mux, host, &from_key, &order.to)
                        } else {
                            self.default_link_from_stream_to_device(graph, mux, host, &from_key, &order.to)
                        }
                    }
                    (Implement::Device, Implement::Device) => self.setup_device_output(graph, host, &from_key, &order.to),
                    (f, t) => Err(SwitchError::UnsupportedLink {
                        from: from_key,
                        from_kind: implement_name(f),
                        to: order.to.clone(),
                        to_kind: implement_name(t),
                    }),
                }
            }
            None => {
                // A `RouteOrder` with no `from` came from `make_prerouting`
                // for a brand-new stream that has no prior link to replace.
                match to_implement {
                    Implement::Device => self.direct_link(graph, mux, host, &order.to, &order.to, true),
                    t => Err(SwitchError::UnsupportedLink {
                        from: order.to.clone(),
                        from_kind: "(new stream)",
                        to: order.to.clone(),
                        to_kind: implement_name(t),
                    }),
                }
            }
        }
    }

    /// `explicit_link_from_stream_to_device`: an admin-requested route. If
    /// the stream already feeds a multiplex, the target either collapses
    /// onto the mux's primary branch (already covered, nothing to add), is
    /// already an explicit branch (deduped), or becomes a new branch on
    /// the live mux; otherwise it's a direct move (spec.md section 4.9).
    fn explicit_link_from_stream_to_device(
        &mut self,
        graph: &mut NodeGraph,
        mux: &mut Multiplex,
        host: &mut dyn LinkHost,
        from: &NodeKey,
        to: &NodeKey,
    ) -> Result<(), SwitchError> {
        let to_node = graph.find_by_key(to).ok_or_else(|| SwitchError::NodeNotFound(to.clone()))?;
        let sink_index = to_node.pw_index;
        let from_node = graph.find_by_key(from).ok_or_else(|| SwitchError::NodeNotFound(from.clone()))?;

        if let Some(handle) = from_node.mux {
            if mux.duplicate_route(handle, sink_index) {
                debug!("'{from}' -> '{to}' already covered by multiplex {handle:?}, skipping");
                return Ok(());
            }
            mux.add_explicit_route(handle, sink_index);
            debug!("added explicit branch '{to}' to multiplex {handle:?} for '{from}'");
            return Ok(());
        }

        self.direct_link(graph, mux, host, from, to, true)
    }

    /// `default_link_from_stream_to_device`: a policy-computed route. For a
    /// multiplex-capable class this only ever redirects the mux's default
    /// branch (spec.md section 4.9: "redirect its default branch (only) to
    /// the target"); non-multiplexing classes move directly.
    fn default_link_from_stream_to_device(
        &mut self,
        graph: &mut NodeGraph,
        mux: &mut Multiplex,
        host: &mut dyn LinkHost,
        from: &NodeKey,
        to: &NodeKey,
    ) -> Result<(), SwitchError> {
        let to_node = graph.find_by_key(to).ok_or_else(|| SwitchError::NodeNotFound(to.clone()))?;
        let sink_index = to_node.pw_index;
        let from_node = graph.find_by_key(from).ok_or_else(|| SwitchError::NodeNotFound(from.clone()))?;
        let class = from_node.node_type;
        let stream_index = from_node.pw_index;

        if is_multiplex_class(class) {
            let handle = mux.ensure(sink_index, class).expect("is_multiplex_class implies ensure succeeds");
            mux.set_default_stream(handle, Some(stream_index));
            if let Some(node) = graph.find_by_key_mut(from) {
                node.mux = Some(handle);
            }
            // The mux's primary branch tracks whichever device is
            // currently the stream's default target; moving the stream
            // onto it is idempotent when it's already there, same as any
            // other re-resolved pass (spec.md property 3).
            host.move_stream(stream_index, sink_index);
            debug!("multiplex {handle:?} default branch now '{to}' for '{from}'");
            return Ok(());
        }

        self.direct_link(graph, mux, host, from, to, false)
    }

    fn direct_link(
        &mut self,
        graph: &mut NodeGraph,
        _mux: &mut Multiplex,
        host: &mut dyn LinkHost,
        from: &NodeKey,
        to: &NodeKey,
        _explicit: bool,
    ) -> Result<(), SwitchError> {
        let to_node = graph.find_by_key(to).ok_or_else(|| SwitchError::NodeNotFound(to.clone()))?;
        let sink_index = to_node.pw_index;
        let stream_index = graph.find_by_key(from).map(|n| n.pw_index).unwrap_or(PwObjectId::INVALID);
        host.move_stream(stream_index, sink_index);
        debug!("switched '{from}' -> '{to}'");
        Ok(())
    }

    /// `setup_device_output`: a device-to-device "route" only ever means
    /// preparing the destination card's profile; devices don't carry
    /// payload between each other outside of that.
    fn setup_device_output(
        &mut self,
        graph: &mut NodeGraph,
        host: &mut dyn LinkHost,
        from: &NodeKey,
        to: &NodeKey,
    ) -> Result<(), SwitchError> {
        let to_node = graph.find_by_key(to).ok_or_else(|| SwitchError::NodeNotFound(to.clone()))?;
        let card = to_node.pw_card.index;
        let profile = to_node.pw_card.profile.clone().unwrap_or_default();

        self.set_profile(host, card, &profile)?;
        debug!("prepared device output '{to}' for '{from}'");
        Ok(())
    }

    fn set_profile(&mut self, host: &mut dyn LinkHost, card: PwObjectId, profile: &str) -> Result<(), SwitchError> {
        if profile.is_empty() || !card.is_valid() {
            return Ok(());
        }
        self.profiles.begin(card, profile)?;
        host.set_card_profile(card, profile);
        Ok(())
    }

    /// Called once the host confirms a profile change landed, releasing the
    /// guard so the next request on that card is accepted.
    pub fn profile_change_completed(&mut self, card: PwObjectId) {
        self.profiles.complete(card);
    }
}

/// Tear down a combine-sink instance a multiplex no longer needs — called by
/// the routing engine when the last branch of a mux is removed.
pub fn teardown_multiplex(mux: &mut Multiplex, sink: PwObjectId) -> Option<CombineSinkHandle> {
    let handle = mux.find_by_sink(sink)?.handle;
    let combine = mux.destroy(handle)?;
    warn!("multiplex {handle:?} torn down for sink {sink:?}");
    Some(combine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CardRef, Direction, Location, NodeSpec, NodeType, Privacy};

    struct FakeHost {
        moves: Vec<(PwObjectId, PwObjectId)>,
        profiles: Vec<(PwObjectId, String)>,
    }

    impl LinkHost for FakeHost {
        fn move_stream(&mut self, stream: PwObjectId, sink: PwObjectId) {
            self.moves.push((stream, sink));
        }
        fn set_card_profile(&mut self, card: PwObjectId, profile: &str) {
            self.profiles.push((card, profile.to_string()));
        }
    }

    fn device(key: &str) -> NodeSpec {
        NodeSpec {
            key: NodeKey(key.to_string()),
            direction: Direction::Output,
            implement: Implement::Device,
            channels: 2,
            location: Location::Internal,
            privacy: Privacy::Public,
            node_type: NodeType::Speakers,
            visible: true,
            available: true,
            am_name: None,
            am_descr: None,
            pw_name: key.to_string(),
            pw_index: PwObjectId(7),
            pw_card: CardRef::default(),
            pw_port: None,
            stamp: crate::node::new_stamp(),
        }
    }

    fn stream(key: &str) -> NodeSpec {
        NodeSpec {
            key: NodeKey(key.to_string()),
            direction: Direction::Input,
            implement: Implement::Stream,
            channels: 2,
            location: Location::Unknown,
            privacy: Privacy::Unknown,
            node_type: NodeType::Player,
            visible: true,
            available: true,
            am_name: None,
            am_descr: None,
            pw_name: key.to_string(),
            pw_index: PwObjectId(3),
            pw_card: CardRef::default(),
            pw_port: None,
            stamp: crate::node::new_stamp(),
        }
    }

    #[test]
    fn default_link_from_stream_to_device_moves_the_stream() {
        let mut graph = NodeGraph::new();
        graph.create(device("spk"));
        graph.create(stream("player.0"));
        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let mut sw = Switch::new();
        let mut host = FakeHost { moves: vec![], profiles: vec![] };

        let orders = vec![RouteOrder { from: Some(NodeKey("player.0".into())), to: NodeKey("spk".into()), explicit: false }];
        let results = sw.execute(&mut graph, &mut mux, &mut host, &orders);
        assert!(results[0].is_ok());
        assert_eq!(host.moves, vec![(PwObjectId(3), PwObjectId(7))]);
    }

    #[test]
    fn device_to_device_route_prepares_profile_not_a_stream_move() {
        let mut graph = NodeGraph::new();
        graph.create(device("spk.a"));
        let mut to_spec = device("spk.b");
        to_spec.pw_card = CardRef { index: PwObjectId(2), profile: Some("output:analog-stereo".into()) };
        graph.create(to_spec);

        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let mut sw = Switch::new();
        let mut host = FakeHost { moves: vec![], profiles: vec![] };

        let orders = vec![RouteOrder { from: Some(NodeKey("spk.a".into())), to: NodeKey("spk.b".into()), explicit: false }];
        let results = sw.execute(&mut graph, &mut mux, &mut host, &orders);
        assert!(results[0].is_ok());
        assert!(host.moves.is_empty());
        assert_eq!(host.profiles, vec![(PwObjectId(2), "output:analog-stereo".to_string())]);
    }

    #[test]
    fn second_profile_change_on_same_card_is_refused_while_first_pending() {
        let mut graph = NodeGraph::new();
        let mut to_spec = device("spk.b");
        to_spec.pw_card = CardRef { index: PwObjectId(2), profile: Some("output:analog-stereo".into()) };
        graph.create(to_spec);
        let mut host = FakeHost { moves: vec![], profiles: vec![] };
        let mut sw = Switch::new();

        sw.set_profile(&mut host, PwObjectId(2), "output:analog-stereo").unwrap();
        let second = sw.set_profile(&mut host, PwObjectId(2), "output:iec958-stereo");
        assert!(matches!(second, Err(SwitchError::ProfileChangeInProgress)));

        sw.profile_change_completed(PwObjectId(2));
        assert!(sw.set_profile(&mut host, PwObjectId(2), "output:iec958-stereo").is_ok());
    }

    #[test]
    fn teardown_multiplex_returns_combine_handle_for_caller_to_shut_down() {
        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let handle = mux.create(PwObjectId(7), NodeType::Player);
        let combine = teardown_multiplex(&mut mux, PwObjectId(7));
        assert!(combine.is_some());
        assert!(mux.find_by_sink(PwObjectId(7)).is_none());
        let _ = handle;
    }

    #[test]
    fn explicit_route_reuses_stream_mux_and_adds_branch() {
        let mut graph = NodeGraph::new();
        graph.create(device("spk"));
        let mut headphone = device("headphone");
        headphone.pw_index = PwObjectId(8);
        graph.create(headphone);
        graph.create(stream("player.0"));

        let mut mux = Multiplex::new(crate::config::CombineConfig::default());
        let mut sw = Switch::new();
        let mut host = FakeHost { moves: vec![], profiles: vec![] };

        // First, a default route establishes the mux with "spk" primary.
        let default_orders = vec![RouteOrder { from: Some(NodeKey("player.0".into())), to: NodeKey("spk".into()), explicit: false }];
        sw.execute(&mut graph, &mut mux, &mut host, &default_orders);
        let mux_handle = graph.find_by_key(&NodeKey("player.0".into())).unwrap().mux.unwrap();

        // An explicit route to the same sink is a no-op.
        let dup_orders = vec![RouteOrder { from: Some(NodeKey("player.0".into())), to: NodeKey("spk".into()), explicit: true }];
        sw.execute(&mut graph, &mut mux, &mut host, &dup_orders);
        assert!(!mux.add_explicit_route(mux_handle, PwObjectId(7)));

        // An explicit route to a new device adds a branch rather than
        // moving the stream off its default target.
        let explicit_orders = vec![RouteOrder { from: Some(NodeKey("player.0".into())), to: NodeKey("headphone".into()), explicit: true }];
        sw.execute(&mut graph, &mut mux, &mut host, &explicit_orders);
        assert!(mux.duplicate_route(mux_handle, PwObjectId(8)));
    }
}
