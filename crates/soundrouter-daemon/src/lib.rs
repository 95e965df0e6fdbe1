// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Policy-driven audio routing core: the node graph, discovery pipeline,
//! router, switch, combine sink, volume engine and Audio Manager bridge
//! that together decide and realize PipeWire routing topology.
//!
//! `engine` is the seam that wires every other module into one owned
//! state machine driven from a single task, the way `service.rs` does in
//! sibling daemons; `bridge` is the only module that talks to the
//! external Audio Manager process.

pub mod augment;
pub mod bridge;
pub mod bus;
pub mod classify;
pub mod combine;
pub mod config;
pub mod constraints;
pub mod discover;
pub mod engine;
pub mod host;
pub mod multiplex;
pub mod node;
pub mod pipewire_thread;
pub mod router;
pub mod switch;
pub mod tracker;
pub mod volume;
pub mod watch;
