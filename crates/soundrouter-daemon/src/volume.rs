// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Volume limiting: per-class and generic caps, suppression during phone
//! calls, and main-volume correction curves.
//!
//! A hash table of `(class) -> limit` entries is refreshed on a stamp and
//! applied by walking every node each time a relevant event fires — a
//! pure, host-independent computation kept entirely separate from the
//! host connection.

use std::collections::HashMap;

use tracing::debug;

use crate::node::{new_stamp, Node, NodeGraph, NodeType, Privacy};

/// Converts a dB attenuation to the host's linear 0.0..=1.0 volume-factor
/// scale; `-90` dB and below collapse to exact silence the same way the
/// original's `pa_sw_volume_from_dB` bottoms out.
pub fn linear_from_db(db: f64) -> f64 {
    if db <= -90.0 {
        0.0
    } else {
        10f64.powf(db / 20.0)
    }
}

fn db_from_linear(linear: f64) -> f64 {
    if linear <= 0.0 {
        -90.0
    } else {
        (20.0 * linear.log10()).max(-90.0)
    }
}

/// A cap applied to every node in one or more classes, expressed in the
/// same 0.0..=1.0 linear scale the Audio Manager reports volumes in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeLimit {
    pub ceiling: f64,
}

#[derive(Default)]
pub struct VolumeEngine {
    /// Per-class limit table.
    class_limits: HashMap<NodeType, VolumeLimit>,
    /// A single cap applied to every class not otherwise limited.
    generic_limit: Option<VolumeLimit>,
    /// Classes whose presence causes *other* classes to be suppressed
    /// entirely while active — e.g. phone calls suppressing media. Maps
    /// limiting class -> classes it suppresses.
    limiting_classes: HashMap<NodeType, Vec<NodeType>>,
    /// A monotonic correction curve applied to the AM main volume before
    /// it reaches any node; `None` means identity.
    correction: Option<Vec<(f64, f64)>>,
    /// Ramp duration applied on attenuation (ducking in) and on release
    /// (fading back out), per spec.md section 4.12's fade bounds.
    fade_out_ms: u64,
    fade_in_ms: u64,
}

impl VolumeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fade_times(&mut self, fade_out_ms: u64, fade_in_ms: u64) {
        self.fade_out_ms = fade_out_ms;
        self.fade_in_ms = fade_in_ms;
    }

    pub fn add_class_limit(&mut self, class: NodeType, ceiling: f64) {
        self.class_limits.insert(class, VolumeLimit { ceiling: ceiling.clamp(0.0, 1.0) });
    }

    pub fn add_generic_limit(&mut self, ceiling: f64) {
        self.generic_limit = Some(VolumeLimit { ceiling: ceiling.clamp(0.0, 1.0) });
    }

    pub fn add_limiting_class(&mut self, limiter: NodeType, suppressed: NodeType) {
        self.limiting_classes.entry(limiter).or_default().push(suppressed);
    }

    pub fn set_correction_curve(&mut self, points: Vec<(f64, f64)>) {
        self.correction = Some(points);
    }

    /// Piecewise-linear interpolation over the configured curve;
    /// identity if none was set.
    pub fn correct(&self, volume: f64) -> f64 {
        let Some(points) = &self.correction else { return volume };
        if points.is_empty() {
            return volume;
        }
        if volume <= points[0].0 {
            return points[0].1;
        }
        if volume >= points[points.len() - 1].0 {
            return points[points.len() - 1].1;
        }
        for window in points.windows(2) {
            let (x0, y0) = window[0];
            let (x1, y1) = window[1];
            if volume >= x0 && volume <= x1 {
                if (x1 - x0).abs() < f64::EPSILON {
                    return y0;
                }
                let t = (volume - x0) / (x1 - x0);
                return y0 + t * (y1 - y0);
            }
        }
        volume
    }

    /// Recompute the effective ceiling for every node, refreshing each
    /// node's volume-limit stamp so a later pass can tell which nodes it
    /// last touched.
    pub fn apply_limits(&self, graph: &mut NodeGraph) {
        let stamp = new_stamp();
        let active_limiters: Vec<NodeType> = self
            .limiting_classes
            .keys()
            .filter(|class| graph.iter().any(|n| &n.node_type == *class && !n.ignore && n.available))
            .copied()
            .collect();

        for node in graph.iter_mut() {
            let mut classes = Vec::new();
            if self.is_suppressed(node.node_type, &active_limiters) {
                classes.push(node.node_type);
                node.ignore = true;
                debug!("'{}' suppressed by an active limiting class", node.am_name);
            } else if node.ignore && self.was_suppressed_only(node) {
                node.ignore = false;
            }

            if let Some(limit) = self.effective_limit(node.node_type) {
                classes.push(node.node_type);
                let _ = limit;
            }

            node.vlim.classes = classes;
            node.vlim.stamp = stamp;
        }
    }

    fn was_suppressed_only(&self, node: &Node) -> bool {
        node.vlim.classes.contains(&node.node_type) && self.effective_limit(node.node_type).is_none()
    }

    fn is_suppressed(&self, class: NodeType, active_limiters: &[NodeType]) -> bool {
        active_limiters
            .iter()
            .any(|limiter| self.limiting_classes.get(limiter).is_some_and(|v| v.contains(&class)))
    }

    fn effective_limit(&self, class: NodeType) -> Option<VolumeLimit> {
        self.class_limits.get(&class).copied().or(self.generic_limit)
    }

    /// Ceiling-clamped volume a node should actually be set to, given the
    /// AM-requested value.
    pub fn clamp_for_node(&self, node: &Node, requested: f64) -> f64 {
        match self.effective_limit(node.node_type) {
            Some(limit) => requested.min(limit.ceiling),
            None => requested,
        }
    }

    /// `apply_limits(node, stream_class, stamp) -> dB` (spec.md section
    /// 4.12): the attenuation a stream of `stream_class` should carry once
    /// routed onto the output `node`. A class outside the application
    /// range is muted outright; otherwise the minimum of the generic/
    /// per-class ceiling and, for a public device, the correction curve.
    pub fn db_for_stream(&self, node: &Node, stream_class: NodeType) -> f64 {
        if !stream_class.is_application_class() {
            return -90.0;
        }

        let mut linear = self.effective_limit(stream_class).map(|l| l.ceiling).unwrap_or(1.0);
        if node.privacy == Privacy::Public {
            linear = self.correct(linear);
        }
        db_from_linear(linear)
    }

    /// Ramp duration for a just-computed attenuation: releasing back to
    /// 0 dB fades in slowly, a fresh attenuation ducks out quickly.
    pub fn ramp_ms_for(&self, db: f64) -> u64 {
        if db >= 0.0 {
            self.fade_in_ms
        } else {
            self.fade_out_ms
        }
    }

    /// Force a class silent immediately, independent of the limiting-class
    /// table (used for transient mutes).
    pub fn suppress(&self, graph: &mut NodeGraph, class: NodeType) {
        for node in graph.iter_mut().filter(|n| n.node_type == class) {
            node.ignore = true;
        }
    }

    /// Drop volume-limit bookkeeping that wasn't refreshed by the most
    /// recent `apply_limits` pass.
    pub fn reset_outdated(&self, graph: &mut NodeGraph, current_stamp: u32) {
        for node in graph.iter_mut() {
            if node.vlim.stamp != current_stamp && !node.vlim.classes.is_empty() {
                node.vlim = Default::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CardRef, Direction, Implement, Location, NodeKey, NodeSpec, Privacy};

    fn node(key: &str, class: NodeType) -> NodeSpec {
        NodeSpec {
            key: NodeKey(key.to_string()),
            direction: Direction::Output,
            implement: Implement::Device,
            channels: 2,
            location: Location::Internal,
            privacy: Privacy::Public,
            node_type: class,
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

    #[test]
    fn class_limit_overrides_generic_limit() {
        let mut engine = VolumeEngine::new();
        engine.add_generic_limit(0.9);
        engine.add_class_limit(NodeType::Navigator, 0.5);

        let mut graph = NodeGraph::new();
        graph.create(node("nav", NodeType::Navigator));
        let n = graph.find_by_key(&NodeKey("nav".into())).unwrap();
        assert_eq!(engine.clamp_for_node(n, 1.0), 0.5);
    }

    #[test]
    fn phone_call_suppresses_media_class() {
        let mut engine = VolumeEngine::new();
        engine.add_limiting_class(NodeType::Phone, NodeType::Player);

        let mut graph = NodeGraph::new();
        graph.create(node("call", NodeType::Phone));
        graph.create(node("music", NodeType::Player));

        engine.apply_limits(&mut graph);
        assert!(graph.find_by_key(&NodeKey("music".into())).unwrap().ignore);
        assert!(!graph.find_by_key(&NodeKey("call".into())).unwrap().ignore);
    }

    #[test]
    fn correction_curve_interpolates_between_points() {
        let mut engine = VolumeEngine::new();
        engine.set_correction_curve(vec![(0.0, 0.0), (0.5, 0.2), (1.0, 1.0)]);
        assert_eq!(engine.correct(0.25), 0.1);
        assert_eq!(engine.correct(0.0), 0.0);
        assert_eq!(engine.correct(1.0), 1.0);
    }

    #[test]
    fn no_curve_means_identity() {
        let engine = VolumeEngine::new();
        assert_eq!(engine.correct(0.42), 0.42);
    }

    #[test]
    fn db_for_stream_mutes_a_class_outside_the_application_range() {
        let engine = VolumeEngine::new();
        let mut graph = NodeGraph::new();
        graph.create(node("spk", NodeType::Speakers));
        let spk = graph.find_by_key(&NodeKey("spk".into())).unwrap();
        assert_eq!(engine.db_for_stream(spk, NodeType::Speakers), -90.0);
    }

    #[test]
    fn db_for_stream_applies_class_ceiling_and_correction_curve() {
        let mut engine = VolumeEngine::new();
        engine.add_class_limit(NodeType::Navigator, 0.5);
        engine.set_correction_curve(vec![(0.0, 0.0), (0.5, 0.4), (1.0, 1.0)]);

        let mut graph = NodeGraph::new();
        graph.create(node("spk", NodeType::Speakers));
        let spk = graph.find_by_key(&NodeKey("spk".into())).unwrap();

        let db = engine.db_for_stream(spk, NodeType::Navigator);
        assert!((linear_from_db(db) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn db_for_stream_is_identity_with_no_limits_configured() {
        let engine = VolumeEngine::new();
        let mut graph = NodeGraph::new();
        graph.create(node("spk", NodeType::Speakers));
        let spk = graph.find_by_key(&NodeKey("spk".into())).unwrap();
        assert_eq!(engine.db_for_stream(spk, NodeType::Player), 0.0);
    }

    #[test]
    fn ramp_ms_picks_fade_in_on_release_and_fade_out_on_attenuation() {
        let mut engine = VolumeEngine::new();
        engine.set_fade_times(200, 1_000);
        assert_eq!(engine.ramp_ms_for(0.0), 1_000);
        assert_eq!(engine.ramp_ms_for(-6.0), 200);
    }

    #[test]
    fn linear_from_db_round_trips_through_unity_and_silence() {
        assert_eq!(linear_from_db(0.0), 1.0);
        assert_eq!(linear_from_db(-90.0), 0.0);
        assert_eq!(linear_from_db(-120.0), 0.0);
    }
}
