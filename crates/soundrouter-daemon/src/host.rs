// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Host abstraction: the seam between policy (Router/Switch/Volume/
//! Discovery) and the live PipeWire graph, so every module above this
//! line is testable without a running compositor.
//!
//! The real connection lives in `pipewire_thread.rs`; the rest of the
//! daemon only ever talks to it through this trait, so tests can supply
//! [`FakeHost`] instead.

use crate::node::PwObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCardInfo {
    pub index: PwObjectId,
    pub active_profile: Option<u32>,
}

/// Everything the policy layer needs to ask of the live host, kept
/// deliberately small: discovery of identity fields happens via the event
/// stream (`tracker`), not by polling through this trait.
pub trait HostHandle: Send {
    /// Move a playback/capture stream onto a different sink/source.
    fn move_stream(&mut self, stream: PwObjectId, target: PwObjectId);

    /// Switch a card's active profile. Async in the real implementation
    /// (pw_device profile changes round-trip through the server); the
    /// trait exposes it as fire-and-forget with completion delivered later
    /// through the tracker's hook stream.
    fn set_card_profile(&mut self, card: PwObjectId, profile: &str);

    /// Create a loopback stream from `source` to `sink`, used to keep a
    /// device node alive absent a real application stream (bluetooth
    /// carkit/source).
    fn create_loopback(&mut self, source: PwObjectId, sink: PwObjectId, media_role: &str) -> PwObjectId;

    fn destroy_loopback(&mut self, loopback: PwObjectId);

    /// Set a stream's volume factor in the host's native linear scale.
    /// `ramp_ms` of `0` sets the factor immediately (with a host-flat-
    /// volume fallback where the stream isn't natively bound); a nonzero
    /// value ramps linearly to it over that many milliseconds.
    fn set_stream_volume(&mut self, stream: PwObjectId, linear: f64, ramp_ms: u64);

    /// The host's null sink/source indices, established at startup.
    fn null_sink(&self) -> PwObjectId;
    fn null_source(&self) -> PwObjectId;
}

/// Every host operation the engine needs, combined: Discovery/Tracker use
/// [`HostHandle`], Switch uses [`crate::switch::LinkHost`], and the engine
/// holds one trait object satisfying both rather than threading two
/// separate `dyn` references through its call sites.
pub trait DaemonHost: HostHandle + crate::switch::LinkHost {}
impl<T: HostHandle + crate::switch::LinkHost> DaemonHost for T {}

/// A recording fake used by unit and integration tests: records every call
/// it receives instead of touching a real compositor.
#[derive(Default)]
pub struct FakeHost {
    pub moves: Vec<(PwObjectId, PwObjectId)>,
    pub profile_changes: Vec<(PwObjectId, String)>,
    pub loopbacks: Vec<(PwObjectId, PwObjectId, String)>,
    pub destroyed_loopbacks: Vec<PwObjectId>,
    pub volumes: Vec<(PwObjectId, f64, u64)>,
    next_loopback_id: u32,
    null_sink: PwObjectId,
    null_source: PwObjectId,
}

impl FakeHost {
    pub fn new(null_sink: PwObjectId, null_source: PwObjectId) -> Self {
        FakeHost {
            null_sink,
            null_source,
            next_loopback_id: 10_000,
            ..Default::default()
        }
    }
}

impl HostHandle for FakeHost {
    fn move_stream(&mut self, stream: PwObjectId, target: PwObjectId) {
        self.moves.push((stream, target));
    }

    fn set_card_profile(&mut self, card: PwObjectId, profile: &str) {
        self.profile_changes.push((card, profile.to_string()));
    }

    fn create_loopback(&mut self, source: PwObjectId, sink: PwObjectId, media_role: &str) -> PwObjectId {
        self.loopbacks.push((source, sink, media_role.to_string()));
        self.next_loopback_id += 1;
        PwObjectId(self.next_loopback_id)
    }

    fn destroy_loopback(&mut self, loopback: PwObjectId) {
        self.destroyed_loopbacks.push(loopback);
    }

    fn set_stream_volume(&mut self, stream: PwObjectId, linear: f64, ramp_ms: u64) {
        self.volumes.push((stream, linear, ramp_ms));
    }

    fn null_sink(&self) -> PwObjectId {
        self.null_sink
    }

    fn null_source(&self) -> PwObjectId {
        self.null_source
    }
}

impl crate::switch::LinkHost for FakeHost {
    fn move_stream(&mut self, stream: PwObjectId, sink: PwObjectId) {
        HostHandle::move_stream(self, stream, sink);
    }
    fn set_card_profile(&mut self, card: PwObjectId, profile: &str) {
        HostHandle::set_card_profile(self, card, profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_host_records_moves_and_profile_changes() {
        let mut host = FakeHost::new(PwObjectId(1), PwObjectId(2));
        host.move_stream(PwObjectId(5), PwObjectId(6));
        host.set_card_profile(PwObjectId(7), "output:analog-stereo");
        assert_eq!(host.moves, vec![(PwObjectId(5), PwObjectId(6))]);
        assert_eq!(host.profile_changes, vec![(PwObjectId(7), "output:analog-stereo".to_string())]);
    }

    #[test]
    fn fake_host_assigns_unique_loopback_ids() {
        let mut host = FakeHost::new(PwObjectId(1), PwObjectId(2));
        let a = host.create_loopback(PwObjectId(2), PwObjectId(9), "phone");
        let b = host.create_loopback(PwObjectId(2), PwObjectId(10), "music");
        assert_ne!(a, b);
    }
}
