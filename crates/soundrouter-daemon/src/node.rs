// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The node graph: the central typed entity every other module operates on.
//!
//! A [`Node`] represents either a device endpoint (a card/profile/port
//! surfaced as a PipeWire sink or source) or a stream endpoint (an
//! application playback/capture stream). [`NodeGraph`] owns every live node
//! and is the only thing allowed to mutate node identity or membership;
//! every other module holds a [`NodeKey`] and looks the node up again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::multiplex::MuxHandle;
use crate::router::RtMembership;

/// Stable identity of a node, derived from the host object name and (for
/// devices) the port name. Unique across all live nodes (invariant I1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub String);

impl NodeKey {
    pub fn for_device(pw_name: &str, port: Option<&str>) -> Self {
        match port {
            Some(p) => NodeKey(format!("{pw_name}@{p}")),
            None => NodeKey(pw_name.to_string()),
        }
    }

    pub fn for_stream(pw_name: &str) -> Self {
        NodeKey(pw_name.to_string())
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque index into the host's (PipeWire's) own object table. Re-resolved
/// on demand rather than held as a pointer: nodes own their key and
/// strings only, never a long-lived host handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PwObjectId(pub u32);

impl PwObjectId {
    pub const INVALID: PwObjectId = PwObjectId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for PwObjectId {
    fn default() -> Self {
        Self::INVALID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Unknown,
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Implement {
    Unknown,
    Device,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Unknown,
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privacy {
    Unknown,
    Public,
    Private,
}

/// The closed taxonomy of node classes. Device classes and application
/// (stream) classes occupy disjoint ranges so range checks
/// (`type >= device_class_begin && type < device_class_end`) can answer
/// "is this a device or a stream class" without a separate tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeType {
    Unknown,

    // --- device classes ---
    Speakers,
    FrontSpeakers,
    RearSpeakers,
    Microphone,
    Jack,
    Spdif,
    Hdmi,
    WiredHeadset,
    WiredHeadphone,
    UsbHeadset,
    UsbHeadphone,
    BluetoothSco,
    BluetoothA2dp,
    BluetoothCarkit,
    BluetoothSource,
    BluetoothSink,
    Null,

    // --- application (stream) classes ---
    Radio,
    Player,
    Navigator,
    Game,
    Browser,
    Phone,
    Event,
    Camera,
    Alert,
    System,
}

impl NodeType {
    pub const DEVICE_CLASS_BEGIN: NodeType = NodeType::Speakers;
    pub const DEVICE_CLASS_END_EXCLUSIVE: NodeType = NodeType::Radio;
    pub const APPLICATION_CLASS_BEGIN: NodeType = NodeType::Radio;

    /// Total ordering rank used by range checks and comparators. Kept
    /// separate from derive(Ord) on the enum so the device/stream range
    /// split stays explicit and documented instead of implicit in
    /// declaration order.
    fn rank(self) -> u8 {
        self as u8
    }

    pub fn is_device_class(self) -> bool {
        let r = self.rank();
        r >= NodeType::DEVICE_CLASS_BEGIN.rank() && r < NodeType::DEVICE_CLASS_END_EXCLUSIVE.rank()
    }

    pub fn is_application_class(self) -> bool {
        self.rank() >= NodeType::APPLICATION_CLASS_BEGIN.rank()
    }

    /// Offset used by comparators that pack `(type - device_class_begin)`
    /// into a sort key.
    pub fn device_class_rank(self) -> u8 {
        self.rank().saturating_sub(NodeType::DEVICE_CLASS_BEGIN.rank())
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Unknown => "Unknown",
            NodeType::Speakers => "Speakers",
            NodeType::FrontSpeakers => "Front Speakers",
            NodeType::RearSpeakers => "Rear Speakers",
            NodeType::Microphone => "Microphone",
            NodeType::Jack => "Line",
            NodeType::Spdif => "SPDIF",
            NodeType::Hdmi => "HDMI",
            NodeType::WiredHeadset => "Wired Headset",
            NodeType::WiredHeadphone => "Wired Headphone",
            NodeType::UsbHeadset => "USB Headset",
            NodeType::UsbHeadphone => "USB Headphone",
            NodeType::BluetoothSco => "Bluetooth Handsfree",
            NodeType::BluetoothA2dp => "Bluetooth Stereo",
            NodeType::BluetoothCarkit => "Bluetooth Carkit",
            NodeType::BluetoothSource => "Bluetooth Source",
            NodeType::BluetoothSink => "Bluetooth Sink",
            NodeType::Null => "Null",
            NodeType::Radio => "Radio",
            NodeType::Player => "Player",
            NodeType::Navigator => "Navigator",
            NodeType::Game => "Game",
            NodeType::Browser => "Browser",
            NodeType::Phone => "Phone",
            NodeType::Event => "Event",
            NodeType::Camera => "Camera",
            NodeType::Alert => "Alert",
            NodeType::System => "System",
        };
        write!(f, "{s}")
    }
}

/// Device-only card/profile/port back-reference (invariant I2: valid for
/// device nodes with ports, absent for streams).
#[derive(Debug, Clone, Default)]
pub struct CardRef {
    pub index: PwObjectId,
    pub profile: Option<String>,
}

/// Per-node volume-limit bookkeeping. Refreshed every stamp by the volume
/// engine; classes older than the current stamp are dropped rather than
/// carried forward.
#[derive(Debug, Clone, Default)]
pub struct VolumeLimitState {
    pub classes: Vec<NodeType>,
    pub stamp: u32,
}

/// A typed graph entity: device endpoint or stream endpoint.
#[derive(Debug, Clone)]
pub struct Node {
    pub key: NodeKey,
    pub direction: Direction,
    pub implement: Implement,
    pub channels: u32,
    pub location: Location,
    pub privacy: Privacy,
    pub node_type: NodeType,
    pub visible: bool,
    pub available: bool,
    pub ignore: bool,

    /// Audio Manager identity; `amid` is invalid until the node has been
    /// registered with the bridge.
    pub am_name: String,
    pub am_descr: String,
    pub am_id: Option<u16>,

    /// Host (PipeWire) identity.
    pub pw_name: String,
    pub pw_index: PwObjectId,
    pub pw_card: CardRef,
    pub pw_port: Option<String>,

    pub mux: Option<MuxHandle>,
    pub loop_handle: Option<PwObjectId>,

    pub rt_membership: RtMembership,
    pub vlim: VolumeLimitState,
    pub stamp: u32,
}

/// Data needed to create a node.
pub struct NodeSpec {
    pub key: NodeKey,
    pub direction: Direction,
    pub implement: Implement,
    pub channels: u32,
    pub location: Location,
    pub privacy: Privacy,
    pub node_type: NodeType,
    pub visible: bool,
    pub available: bool,
    pub am_name: Option<String>,
    pub am_descr: Option<String>,
    pub pw_name: String,
    pub pw_index: PwObjectId,
    pub pw_card: CardRef,
    pub pw_port: Option<String>,
    pub stamp: u32,
}

impl Node {
    fn from_spec(spec: NodeSpec) -> Self {
        let am_name = spec.am_name.unwrap_or_else(|| spec.pw_name.clone());
        Node {
            key: spec.key,
            direction: spec.direction,
            implement: spec.implement,
            channels: spec.channels,
            location: spec.location,
            privacy: spec.privacy,
            node_type: spec.node_type,
            visible: spec.visible,
            available: spec.available,
            ignore: false,
            am_name,
            am_descr: spec.am_descr.unwrap_or_default(),
            am_id: None,
            pw_name: spec.pw_name,
            pw_index: spec.pw_index,
            pw_card: spec.pw_card,
            pw_port: spec.pw_port,
            mux: None,
            loop_handle: None,
            rt_membership: RtMembership::default(),
            vlim: VolumeLimitState::default(),
            stamp: spec.stamp,
        }
    }

    pub fn print(&self) -> String {
        format!(
            "   key           : '{}'\n   direction     : {:?}\n   implement     : {:?}\n   \
             channels      : {}\n   location      : {:?}\n   privacy       : {:?}\n   \
             type          : {}\n   visible       : {}\n   available     : {}\n   \
             amname        : '{}'\n   amdescr       : '{}'\n   amid          : {:?}\n   \
             paname        : '{}'\n   paidx         : {:?}\n   stamp         : {}\n",
            self.key,
            self.direction,
            self.implement,
            self.channels,
            self.location,
            self.privacy,
            self.node_type,
            self.visible,
            self.available,
            self.am_name,
            self.am_descr,
            self.am_id,
            self.pw_name,
            self.pw_index,
            self.stamp,
        )
    }
}

static STAMP_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Process-wide monotonic stamp counter.
pub fn new_stamp() -> u32 {
    STAMP_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

pub fn current_stamp() -> u32 {
    STAMP_COUNTER.load(Ordering::SeqCst)
}

/// Owns every live node. Exclusive write access belongs to Discovery;
/// everyone else holds a [`NodeKey`] or a [`PwObjectId`] and looks the node
/// up again rather than caching a reference, since a host index may
/// transiently dangle between host-object removal and node destruction.
#[derive(Default)]
pub struct NodeGraph {
    by_key: HashMap<NodeKey, Node>,
    by_host_ptr: HashMap<PwObjectId, NodeKey>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a node. Returns `None` if `key` is already in
    /// use (invariant I1: key uniqueness is enforced here, not assumed).
    pub fn create(&mut self, spec: NodeSpec) -> Option<&Node> {
        let key = spec.key.clone();
        if self.by_key.contains_key(&key) {
            return None;
        }
        let pw_index = spec.pw_index;
        let node = Node::from_spec(spec);
        self.by_key.insert(key.clone(), node);
        if pw_index.is_valid() {
            self.by_host_ptr.insert(pw_index, key.clone());
        }
        self.by_key.get(&key)
    }

    pub fn destroy(&mut self, key: &NodeKey) -> Option<Node> {
        let node = self.by_key.remove(key)?;
        if node.pw_index.is_valid() {
            self.by_host_ptr.remove(&node.pw_index);
        }
        Some(node)
    }

    pub fn find_by_key(&self, key: &NodeKey) -> Option<&Node> {
        self.by_key.get(key)
    }

    pub fn find_by_key_mut(&mut self, key: &NodeKey) -> Option<&mut Node> {
        self.by_key.get_mut(key)
    }

    pub fn find_by_host_ptr(&self, ptr: PwObjectId) -> Option<&Node> {
        self.by_host_ptr.get(&ptr).and_then(|k| self.by_key.get(k))
    }

    pub fn find_by_host_ptr_mut(&mut self, ptr: PwObjectId) -> Option<&mut Node> {
        let key = self.by_host_ptr.get(&ptr)?.clone();
        self.by_key.get_mut(&key)
    }

    /// Re-point the host-index map after a node's `pw_index` changes (e.g.
    /// a prototype device node gets a real sink index attached by
    /// Discovery's `add_sink`).
    pub fn rebind_host_ptr(&mut self, key: &NodeKey, new_ptr: PwObjectId) {
        if let Some(node) = self.by_key.get_mut(key) {
            if node.pw_index.is_valid() {
                self.by_host_ptr.remove(&node.pw_index);
            }
            node.pw_index = new_ptr;
        }
        if new_ptr.is_valid() {
            self.by_host_ptr.insert(new_ptr, key.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.by_key.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.by_key.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str) -> NodeSpec {
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
            pw_index: PwObjectId(1),
            pw_card: CardRef::default(),
            pw_port: None,
            stamp: new_stamp(),
        }
    }

    #[test]
    fn create_then_find_by_key_is_consistent() {
        let mut graph = NodeGraph::new();
        graph.create(spec("sink.0"));
        assert!(graph.find_by_key(&NodeKey("sink.0".into())).is_some());
        assert!(graph.find_by_host_ptr(PwObjectId(1)).is_some());
    }

    #[test]
    fn duplicate_key_is_refused() {
        let mut graph = NodeGraph::new();
        assert!(graph.create(spec("sink.0")).is_some());
        assert!(graph.create(spec("sink.0")).is_none());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn destroy_removes_from_both_maps() {
        let mut graph = NodeGraph::new();
        graph.create(spec("sink.0"));
        let key = NodeKey("sink.0".into());
        assert!(graph.destroy(&key).is_some());
        assert!(graph.find_by_key(&key).is_none());
        assert!(graph.find_by_host_ptr(PwObjectId(1)).is_none());
    }

    #[test]
    fn device_class_range_check() {
        assert!(NodeType::Speakers.is_device_class());
        assert!(!NodeType::Player.is_device_class());
        assert!(NodeType::Player.is_application_class());
    }
}
