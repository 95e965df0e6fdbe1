// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Classifier: pure functions mapping (card bus, port name, profile name,
//! proplist role) to node type/location/privacy.

use std::collections::HashMap;

use crate::node::{Direction, Location, NodeType, Privacy};

/// A snapshot of the PipeWire card fields the classifier needs — kept
/// separate from any live PipeWire object so the classifier stays a pure
/// function testable without a host connection.
#[derive(Debug, Clone, Default)]
pub struct CardSnapshot {
    pub bus: Option<String>,
    pub form_factor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PortSnapshot {
    pub name: String,
    pub description: String,
}

/// Device classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceClassification {
    pub node_type: NodeType,
    pub location: Location,
    pub privacy: Privacy,
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// PCI port-name substring matching, used both as a fallback when the
/// card has no form factor and (for "internal" form-factor cards) as a
/// same-pass refinement.
fn guess_type_from_port_name(direction: Direction, name: &str) -> NodeType {
    let n = name.to_ascii_lowercase();
    if direction == Direction::Output && n.contains("headphone") {
        NodeType::WiredHeadphone
    } else if n.contains("headset") {
        NodeType::WiredHeadset
    } else if n.contains("line") {
        NodeType::Jack
    } else if n.contains("spdif") {
        NodeType::Spdif
    } else if n.contains("hdmi") {
        NodeType::Hdmi
    } else if direction == Direction::Input && n.contains("microphone") {
        NodeType::Microphone
    } else if direction == Direction::Output && n.contains("analog-output") {
        NodeType::Speakers
    } else if direction == Direction::Input && n.contains("analog-input") {
        NodeType::Jack
    } else {
        NodeType::Unknown
    }
}

pub fn classify_device(
    card: &CardSnapshot,
    profile: Option<&str>,
    port: Option<&PortSnapshot>,
    direction: Direction,
) -> DeviceClassification {
    let bus = card.bus.as_deref().unwrap_or("");
    let mut node_type = NodeType::Unknown;
    let mut location = Location::Unknown;

    if let Some(form) = &card.form_factor {
        if eq_ci(form, "internal") {
            location = Location::External;
            if let Some(p) = port {
                if eq_ci(bus, "pci") {
                    node_type = guess_type_from_port_name(direction, &p.name);
                }
            }
        } else if eq_ci(form, "speaker") || eq_ci(form, "car") {
            if direction == Direction::Output {
                location = Location::Internal;
                node_type = NodeType::Speakers;
            }
        } else if eq_ci(form, "handset") {
            location = Location::External;
            node_type = NodeType::Phone;
        } else if eq_ci(form, "headset") {
            location = Location::External;
            if eq_ci(bus, "usb") {
                node_type = NodeType::UsbHeadset;
            } else if eq_ci(bus, "bluetooth") {
                node_type = if profile == Some("a2dp") {
                    NodeType::BluetoothA2dp
                } else {
                    NodeType::BluetoothSco
                };
            } else {
                node_type = NodeType::WiredHeadset;
            }
        } else if eq_ci(form, "headphone") {
            if direction == Direction::Output {
                location = Location::External;
                if eq_ci(bus, "usb") {
                    node_type = NodeType::UsbHeadphone;
                } else if !eq_ci(bus, "bluetooth") {
                    node_type = NodeType::WiredHeadphone;
                }
            }
        } else if eq_ci(form, "microphone") && direction == Direction::Input {
            location = Location::External;
            node_type = NodeType::Microphone;
        }
    } else if let Some(p) = port {
        if eq_ci(bus, "pci") {
            node_type = guess_type_from_port_name(direction, &p.name);
        }
    } else if let Some(prof) = profile {
        if eq_ci(bus, "bluetooth") {
            node_type = match prof {
                "a2dp" => NodeType::BluetoothA2dp,
                "hsp" => NodeType::BluetoothSco,
                "hfgw" => NodeType::BluetoothCarkit,
                "a2dp_source" => NodeType::BluetoothSource,
                "a2dp_sink" => NodeType::BluetoothSink,
                _ => NodeType::Unknown,
            };
        }
    }

    let privacy = if direction == Direction::Input {
        Privacy::Unknown
    } else {
        match node_type {
            NodeType::Speakers | NodeType::FrontSpeakers | NodeType::RearSpeakers => Privacy::Public,
            NodeType::Phone
            | NodeType::WiredHeadset
            | NodeType::WiredHeadphone
            | NodeType::UsbHeadset
            | NodeType::UsbHeadphone
            | NodeType::BluetoothSco
            | NodeType::BluetoothA2dp => Privacy::Private,
            _ => Privacy::Unknown,
        }
    };

    DeviceClassification { node_type, location, privacy }
}

/// Media-role map with a per-binary override table (role `player`/unknown
/// defers to the binary table; any other recognized role wins outright).
pub struct StreamClassifier {
    binary_overrides: HashMap<String, NodeType>,
}

impl Default for StreamClassifier {
    fn default() -> Self {
        let mut binary_overrides = HashMap::new();
        binary_overrides.insert("rhythmbox".to_string(), NodeType::Player);
        binary_overrides.insert("firefox".to_string(), NodeType::Browser);
        binary_overrides.insert("chrome".to_string(), NodeType::Browser);
        binary_overrides.insert("sound-juicer".to_string(), NodeType::Player);
        StreamClassifier { binary_overrides }
    }
}

impl StreamClassifier {
    pub fn with_binary_override(mut self, binary: &str, node_type: NodeType) -> Self {
        self.binary_overrides.insert(binary.to_string(), node_type);
        self
    }

    fn role_type(role: &str) -> NodeType {
        match role {
            "video" | "music" => NodeType::Player,
            "game" => NodeType::Game,
            "event" => NodeType::Event,
            "navigator" => NodeType::Navigator,
            "phone" | "carkit" => NodeType::Phone,
            "animation" => NodeType::Browser,
            "test" => NodeType::Player,
            "ringtone" => NodeType::Alert,
            "camera" => NodeType::Camera,
            "system" => NodeType::System,
            _ => NodeType::Unknown,
        }
    }

    pub fn classify(&self, media_role: Option<&str>, process_binary: Option<&str>) -> NodeType {
        let rtype = media_role.map(Self::role_type).unwrap_or(NodeType::Unknown);

        if rtype != NodeType::Unknown && rtype != NodeType::Player {
            return rtype;
        }

        let btype = process_binary
            .and_then(|b| self.binary_overrides.get(b).copied())
            .unwrap_or(NodeType::Unknown);

        if btype == NodeType::Unknown {
            return rtype;
        }
        btype
    }
}

/// Applied to *device* nodes that act as a source of an application class
/// (bluetooth carkit/source act as a phone/player respectively for the
/// purposes of classmap lookups).
pub fn application_class_for_bluetooth_source(node_type: NodeType) -> NodeType {
    match node_type {
        NodeType::BluetoothCarkit => NodeType::Phone,
        NodeType::BluetoothSource => NodeType::Player,
        _ => NodeType::Unknown,
    }
}

/// The media role to use when opening a loopback stream to keep a device
/// node alive absent a real stream.
pub fn loopback_role(node_type: NodeType) -> Option<&'static str> {
    match node_type {
        NodeType::BluetoothCarkit => Some("phone"),
        NodeType::BluetoothSource => Some("music"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bluetooth_headset_form_factor_picks_a2dp_or_sco() {
        let card = CardSnapshot { bus: Some("bluetooth".into()), form_factor: Some("headset".into()) };
        let a2dp = classify_device(&card, Some("a2dp"), None, Direction::Output);
        assert_eq!(a2dp.node_type, NodeType::BluetoothA2dp);
        let sco = classify_device(&card, Some("hsp"), None, Direction::Output);
        assert_eq!(sco.node_type, NodeType::BluetoothSco);
    }

    #[test]
    fn bluetooth_without_form_factor_uses_profile_name_table() {
        let card = CardSnapshot { bus: Some("bluetooth".into()), form_factor: None };
        assert_eq!(classify_device(&card, Some("hfgw"), None, Direction::Output).node_type, NodeType::BluetoothCarkit);
        assert_eq!(classify_device(&card, Some("a2dp_source"), None, Direction::Output).node_type, NodeType::BluetoothSource);
    }

    #[test]
    fn pci_port_name_substrings_drive_type_without_form_factor() {
        let card = CardSnapshot { bus: Some("pci".into()), form_factor: None };
        let port = PortSnapshot { name: "analog-output-headphone".into(), description: "Headphones".into() };
        assert_eq!(classify_device(&card, None, Some(&port), Direction::Output).node_type, NodeType::WiredHeadphone);
    }

    #[test]
    fn privacy_is_unknown_for_inputs_and_set_by_type_for_outputs() {
        let card = CardSnapshot { bus: Some("pci".into()), form_factor: Some("speaker".into()) };
        let c = classify_device(&card, None, None, Direction::Output);
        assert_eq!(c.privacy, Privacy::Public);

        let mic_card = CardSnapshot { bus: Some("pci".into()), form_factor: Some("microphone".into()) };
        let mic = classify_device(&mic_card, None, None, Direction::Input);
        assert_eq!(mic.privacy, Privacy::Unknown);
    }

    #[test]
    fn stream_classifier_prefers_role_over_binary_unless_role_is_player() {
        let classifier = StreamClassifier::default();
        assert_eq!(classifier.classify(Some("game"), Some("firefox")), NodeType::Game);
        assert_eq!(classifier.classify(Some("music"), Some("firefox")), NodeType::Browser);
        assert_eq!(classifier.classify(None, Some("firefox")), NodeType::Browser);
        assert_eq!(classifier.classify(None, Some("unknown-binary")), NodeType::Unknown);
    }

    #[test]
    fn multiplex_classes_match_table() {
        assert!(crate::multiplex::is_multiplex_class(NodeType::Player));
        assert!(!crate::multiplex::is_multiplex_class(NodeType::Phone));
    }
}
