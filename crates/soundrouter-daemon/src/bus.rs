// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bus transport: outstanding-call bookkeeping and peer-liveness tracking
//! shared by the Audio Manager bridge, kept separate from the bridge's own
//! method bodies so reconnection logic isn't duplicated per call site.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use zbus::Connection;

/// Tracks async bus calls in flight, keyed the way the wire protocol
/// itself keys them: an incrementing sequence number paired with the
/// caller-supplied request tag. `zbus` already matches a call to its
/// reply internally, so this registry's job is narrower than the
/// protocol's own pending-call list — it exists so every in-flight call
/// can be aborted in one place when the peer goes away, rather than each
/// call site having to remember to do so.
#[derive(Default)]
pub struct PendingCalls {
    next_sequence: u32,
    in_flight: HashMap<(u32, u16), AbortHandle>,
}

impl PendingCalls {
    pub fn new() -> Self {
        PendingCalls::default()
    }

    /// Registers a call's abort handle and returns the sequence number
    /// assigned to it.
    pub fn track(&mut self, request_tag: u16, handle: AbortHandle) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.in_flight.insert((sequence, request_tag), handle);
        sequence
    }

    /// Removes a call once its reply has been matched and delivered.
    pub fn complete(&mut self, sequence: u32, request_tag: u16) {
        self.in_flight.remove(&(sequence, request_tag));
    }

    /// Aborts and forgets every outstanding call — used when the peer's
    /// bus name disappears.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.in_flight.drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// Whether the Audio Manager's well-known bus name is currently owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Up,
    Down,
}

/// Watches one bus name's ownership via `NameOwnerChanged` and delivers
/// transitions over an async channel, so the bridge can re-register on
/// reappearance and tear down pending calls on disappearance without
/// polling.
pub struct PeerWatcher {
    pub events: tokio::sync::mpsc::UnboundedReceiver<PeerState>,
    _task: tokio::task::JoinHandle<()>,
}

impl PeerWatcher {
    pub async fn spawn(connection: &Connection, peer_name: &str) -> zbus::Result<Self> {
        let dbus = zbus::fdo::DBusProxy::new(connection).await?;
        let mut owner_changes = dbus.receive_name_owner_changed().await?;
        let peer_name = peer_name.to_string();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let initial_owner = dbus.get_name_owner(zbus::names::BusName::try_from(peer_name.as_str())?).await;
        let _ = tx.send(if initial_owner.is_ok() { PeerState::Up } else { PeerState::Down });

        let task = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(signal) = owner_changes.next().await {
                let Ok(args) = signal.args() else { continue };
                if args.name() != &peer_name {
                    continue;
                }
                let state = if args.new_owner().as_ref().is_some() { PeerState::Up } else { PeerState::Down };
                debug!("peer {peer_name} bus ownership changed: {state:?}");
                if tx.send(state).is_err() {
                    break;
                }
            }
        });

        Ok(PeerWatcher { events: rx, _task: task })
    }
}

/// Exponential backoff for re-establishing a registration after the peer
/// reappears: `2s, 4s, 8s, 16s`, capped at `30s`.
pub fn reconnect_backoff(consecutive_failures: u32) -> Duration {
    Duration::from_secs((2u64 << consecutive_failures.min(4)).min(30))
}

/// Connects to the session bus and registers the bridge's own well-known
/// name, retrying with [`reconnect_backoff`] until it succeeds.
pub async fn connect_with_retry(bridge_bus_name: &str) -> zbus::Result<Connection> {
    let mut failures = 0u32;
    loop {
        match Connection::session().await {
            Ok(conn) => match conn.request_name(bridge_bus_name).await {
                Ok(()) => {
                    info!("acquired bus name {bridge_bus_name}");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("failed to acquire bus name {bridge_bus_name}: {e}");
                }
            },
            Err(e) => {
                warn!("failed to connect to the session bus: {e}");
            }
        }
        let delay = reconnect_backoff(failures);
        failures += 1;
        tokio::time::sleep(delay).await;
    }
}
