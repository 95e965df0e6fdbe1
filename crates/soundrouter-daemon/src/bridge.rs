// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio Manager bridge: the only module that talks to the external
//! GENIVI Audio Manager process over D-Bus.
//!
//! Outbound calls (`registerDomain`, `registerSink`/`registerSource`,
//! `ackConnect`/`ackDisconnect`) go through a generated [`AudioManagerProxy`].
//! Inbound calls (`asyncConnect`/`asyncDisconnect`) are served by
//! implementing `org.genivi.audiomanager.RoutingInterface` directly on
//! [`AudioMgrBridge`], the same "interface struct wraps one shared,
//! lock-guarded piece of state" shape the sibling daemon uses for its own
//! D-Bus service.
//!
//! `asyncConnect`/`asyncDisconnect` are handle/ack pairs, not
//! request/response calls: the interface method returns as soon as the
//! request is accepted, and the routing result is reported later via a
//! separate `ackConnect`/`ackDisconnect` call back to the Audio Manager.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zbus::{proxy, Connection};

use soundrouter_ipc::{
    AckReply, AmDirection, AmError, Availability, ConnectionFormat, RegisterDomainRequest, RegisterNodeRequest,
    SoundProperty,
};

use crate::bus::{self, PeerState, PendingCalls};
use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::host::DaemonHost;
use crate::node::{Direction, Implement, NodeKey, NodeType};

#[proxy(
    interface = "org.genivi.audiomanager.RoutingSender",
    default_service = "org.genivi.audiomanager",
    default_path = "/org/genivi/audiomanager/RoutingInterface"
)]
trait AudioManager {
    fn register_domain(&self, request: RegisterDomainRequest) -> zbus::Result<soundrouter_ipc::RegisterDomainReply>;
    fn hook_domain_registration_complete(&self, domain_id: u16) -> zbus::Result<()>;
    fn deregister_domain(&self, domain_id: u16) -> zbus::Result<()>;
    fn register_sink(&self, request: RegisterNodeRequest) -> zbus::Result<soundrouter_ipc::RegisterNodeReply>;
    fn register_source(&self, request: RegisterNodeRequest) -> zbus::Result<soundrouter_ipc::RegisterNodeReply>;
    fn deregister_sink(&self, id: u16) -> zbus::Result<()>;
    fn deregister_source(&self, id: u16) -> zbus::Result<()>;
    fn ack_connect(&self, reply: AckReply) -> zbus::Result<()>;
    fn ack_disconnect(&self, reply: AckReply) -> zbus::Result<()>;
}

/// The Audio Manager's external class ids are assigned by its own
/// configuration and are opaque to this bridge; this mapping only needs
/// to be stable and distinct per node class, not match any particular
/// deployment's numbering.
fn am_class_for(node_type: NodeType) -> u16 {
    use NodeType::*;
    match node_type {
        Unknown => 0,
        Speakers | FrontSpeakers | RearSpeakers => 1,
        Jack => 2,
        Spdif => 3,
        Hdmi => 4,
        WiredHeadset | WiredHeadphone => 5,
        UsbHeadset | UsbHeadphone => 6,
        BluetoothSco | BluetoothCarkit => 7,
        BluetoothA2dp | BluetoothSink => 8,
        BluetoothSource => 9,
        Microphone => 10,
        Null => 11,
        Radio => 20,
        Player => 21,
        Navigator => 22,
        Game => 23,
        Browser => 24,
        Phone => 25,
        Event => 26,
        Camera => 27,
        Alert => 28,
        System => 29,
    }
}

struct BridgeShared<H: DaemonHost + 'static> {
    engine: Arc<tokio::sync::Mutex<Engine<H>>>,
    config: BridgeConfig,
    domain_id: Mutex<Option<u16>>,
    /// `(direction, Audio Manager id)` -> our node key, used to resolve
    /// `asyncConnect`'s source/sink ids back into graph nodes.
    node_am_ids: Mutex<HashMap<(AmDirection, u16), NodeKey>>,
    am_proxy: tokio::sync::Mutex<Option<AudioManagerProxy<'static>>>,
    pending: Mutex<PendingCalls>,
    up: Mutex<bool>,
}

/// The Audio Manager bridge. Cheaply `Clone`-able (an `Arc` handle) so the
/// same value can be registered on the object server and retained by
/// `main.rs` for driving registration/peer-liveness out of band.
#[derive(Clone)]
pub struct AudioMgrBridge<H: DaemonHost + 'static>(Arc<BridgeShared<H>>);

impl<H: DaemonHost + 'static> AudioMgrBridge<H> {
    pub fn new(engine: Arc<tokio::sync::Mutex<Engine<H>>>, config: BridgeConfig) -> Self {
        AudioMgrBridge(Arc::new(BridgeShared {
            engine,
            config,
            domain_id: Mutex::new(None),
            node_am_ids: Mutex::new(HashMap::new()),
            am_proxy: tokio::sync::Mutex::new(None),
            pending: Mutex::new(PendingCalls::new()),
            up: Mutex::new(false),
        }))
    }

    /// Builds the outbound proxy against `connection`, targeting the
    /// configured Audio Manager bus name/path rather than the proxy
    /// macro's defaults, so a non-standard deployment can still be
    /// reached.
    pub async fn attach_proxy(&self, connection: &Connection) -> zbus::Result<()> {
        let proxy = AudioManagerProxy::builder(connection)
            .destination(self.0.config.dbus_audiomgr_name.as_str())?
            .path(self.0.config.dbus_audiomgr_path.as_str())?
            .build()
            .await?;
        *self.0.am_proxy.lock().await = Some(proxy);
        Ok(())
    }

    /// `registerDomain` followed by `hookDomainRegistrationComplete`, the
    /// two-call sequence GENIVI domains use to announce themselves.
    pub async fn register_domain(&self) -> zbus::Result<()> {
        let request = RegisterDomainRequest {
            domain_id_placeholder: 0,
            name: self.0.config.domain_name.clone(),
            node: "pipewire".to_string(),
            bus: "dbus".to_string(),
            early: false,
            complete: true,
            state: 1,
            dbus_name: self.0.config.dbus_bridge_name.clone(),
            dbus_path: self.0.config.dbus_bridge_path.clone(),
            dbus_interface: "org.genivi.audiomanager.RoutingInterface".to_string(),
        };

        let proxy_guard = self.0.am_proxy.lock().await;
        let Some(proxy) = proxy_guard.as_ref() else {
            return Ok(());
        };
        let reply = proxy.register_domain(request).await?;
        drop(proxy_guard);

        *self.0.domain_id.lock() = Some(reply.domain_id);
        info!("registered domain '{}' with Audio Manager, id {}", self.0.config.domain_name, reply.domain_id);

        let proxy_guard = self.0.am_proxy.lock().await;
        if let Some(proxy) = proxy_guard.as_ref() {
            proxy.hook_domain_registration_complete(reply.domain_id).await?;
        }
        Ok(())
    }

    /// `deregisterDomain`, used on graceful shutdown.
    pub async fn deregister_domain(&self) {
        let Some(domain_id) = *self.0.domain_id.lock() else { return };
        let proxy_guard = self.0.am_proxy.lock().await;
        if let Some(proxy) = proxy_guard.as_ref() {
            if let Err(e) = proxy.deregister_domain(domain_id).await {
                warn!("deregisterDomain failed: {e}");
            }
        }
    }

    /// Mirrors every currently-visible device node to the Audio Manager.
    /// Called once domain registration completes and again on every
    /// peer-liveness reconnection, since a restarted Audio Manager has no
    /// memory of anything this bridge registered with it before.
    pub async fn register_all_nodes(&self) {
        let Some(domain_id) = *self.0.domain_id.lock() else { return };
        let device_nodes: Vec<(NodeKey, Direction, String, NodeType)> = {
            let engine = self.0.engine.lock().await;
            engine
                .graph()
                .iter()
                .filter(|n| n.implement == Implement::Device && n.visible)
                .map(|n| (n.key.clone(), n.direction, n.am_name.clone(), n.node_type))
                .collect()
        };
        for (key, direction, am_name, node_type) in device_nodes {
            if let Err(e) = self.register_node(domain_id, key.clone(), direction, am_name, node_type).await {
                warn!("failed to register node '{key}' with Audio Manager: {e}");
            }
        }
    }

    /// Registers one device node discovered after the initial sweep
    /// (e.g. a card/sink/source that showed up while already connected).
    /// A no-op while the bridge isn't up or domain registration hasn't
    /// completed yet — the next `register_all_nodes` sweep on
    /// reconnection will pick it up.
    pub async fn register_device_node(&self, key: &NodeKey) {
        if !*self.0.up.lock() {
            return;
        }
        let Some(domain_id) = *self.0.domain_id.lock() else { return };
        let info = {
            let engine = self.0.engine.lock().await;
            engine
                .graph()
                .find_by_key(key)
                .filter(|n| n.implement == Implement::Device && n.visible && n.am_id.is_none())
                .map(|n| (n.direction, n.am_name.clone(), n.node_type))
        };
        if let Some((direction, am_name, node_type)) = info {
            if let Err(e) = self.register_node(domain_id, key.clone(), direction, am_name, node_type).await {
                warn!("failed to register node '{key}' with Audio Manager: {e}");
            }
        }
    }

    async fn register_node(
        &self,
        domain_id: u16,
        key: NodeKey,
        direction: Direction,
        am_name: String,
        node_type: NodeType,
    ) -> zbus::Result<()> {
        let am_direction = match direction {
            Direction::Output => AmDirection::Sink,
            Direction::Input => AmDirection::Source,
            Direction::Unknown => return Ok(()),
        };

        let request = RegisterNodeRequest {
            name: am_name,
            domain: domain_id,
            class: am_class_for(node_type),
            volume: 0,
            visible: true,
            availability: Availability::AVAILABLE,
            mute: 0,
            main_volume: 0,
            sound_properties: vec![SoundProperty::default(), SoundProperty::default()],
            connection_formats: vec![ConnectionFormat(0)],
            main_sound_properties: vec![],
        };

        let proxy_guard = self.0.am_proxy.lock().await;
        let Some(proxy) = proxy_guard.as_ref() else {
            return Ok(());
        };
        let reply = match am_direction {
            AmDirection::Sink => proxy.register_sink(request).await?,
            AmDirection::Source => proxy.register_source(request).await?,
        };
        drop(proxy_guard);

        debug!("registered '{key}' with Audio Manager as {am_direction:?} id {}", reply.id);
        self.0.engine.lock().await.set_node_am_id(&key, reply.id);
        self.0.node_am_ids.lock().insert((am_direction, reply.id), key);
        Ok(())
    }

    async fn ack_connect(&self, handle: u16, error: AmError) {
        let proxy_guard = self.0.am_proxy.lock().await;
        if let Some(proxy) = proxy_guard.as_ref() {
            if let Err(e) = proxy.ack_connect(AckReply { handle, param1: 0, error: error.as_i16() }).await {
                warn!("ackConnect failed: {e}");
            }
        }
    }

    async fn ack_disconnect(&self, handle: u16, error: AmError) {
        let proxy_guard = self.0.am_proxy.lock().await;
        if let Some(proxy) = proxy_guard.as_ref() {
            if let Err(e) = proxy.ack_disconnect(AckReply { handle, param1: 0, error: error.as_i16() }).await {
                warn!("ackDisconnect failed: {e}");
            }
        }
    }

    /// React to the Audio Manager's bus name appearing/disappearing:
    /// re-register everything on reappearance (it has forgotten this
    /// bridge's prior registrations), and drop in-flight connect/disconnect
    /// tasks on disappearance rather than let them ack into the void.
    pub async fn handle_peer_state(&self, state: PeerState) {
        match state {
            PeerState::Up => {
                *self.0.up.lock() = true;
                if let Err(e) = self.register_domain().await {
                    warn!("registerDomain failed: {e}");
                    *self.0.up.lock() = false;
                    return;
                }
                self.register_all_nodes().await;
            }
            PeerState::Down => {
                *self.0.up.lock() = false;
                *self.0.domain_id.lock() = None;
                self.0.pending.lock().cancel_all();
                debug!("Audio Manager peer went away, pending connect/disconnect calls cancelled");
            }
        }
    }
}

#[zbus::interface(name = "org.genivi.audiomanager.RoutingInterface")]
impl<H: DaemonHost + 'static> AudioMgrBridge<H> {
    /// `asyncConnect`: resolve `source`/`sink` Audio Manager ids back to
    /// graph nodes, add an explicit route, and ack asynchronously.
    async fn async_connect(&self, handle: u16, connection: u16, source: u16, sink: u16, format: i16) -> zbus::fdo::Result<()> {
        let _ = format;
        let from = self.0.node_am_ids.lock().get(&(AmDirection::Source, source)).cloned();
        let to = self.0.node_am_ids.lock().get(&(AmDirection::Sink, sink)).cloned();

        let bridge = self.clone();
        let task = tokio::spawn(async move {
            let error = match (from, to) {
                (Some(from), Some(to)) => {
                    let mut engine = bridge.0.engine.lock().await;
                    engine.add_explicit_route(connection, from, to);
                    AmError::Ok
                }
                _ => {
                    warn!("asyncConnect: unresolvable source {source} or sink {sink}");
                    AmError::NonExistent
                }
            };
            bridge.ack_connect(handle, error).await;
            bridge.0.pending.lock().complete(0, connection);
        });
        self.0.pending.lock().track(connection, task.abort_handle());
        Ok(())
    }

    /// `asyncDisconnect`: resolve `connection` back to the `(from, to)`
    /// pair the router holds, remove the route, and ack asynchronously.
    async fn async_disconnect(&self, handle: u16, connection: u16) -> zbus::fdo::Result<()> {
        let bridge = self.clone();
        let task = tokio::spawn(async move {
            let route = {
                let engine = bridge.0.engine.lock().await;
                engine.find_explicit_route(connection)
            };
            let error = match route {
                Some((from, to)) => {
                    let mut engine = bridge.0.engine.lock().await;
                    engine.remove_explicit_route(&from, &to);
                    AmError::Ok
                }
                None => {
                    warn!("asyncDisconnect: unknown connection {connection}");
                    AmError::NonExistent
                }
            };
            bridge.ack_disconnect(handle, error).await;
            bridge.0.pending.lock().complete(0, connection);
        });
        self.0.pending.lock().track(connection, task.abort_handle());
        Ok(())
    }
}

/// Spawns the peer watcher for the Audio Manager's bus name and feeds
/// every liveness transition into the bridge, reconnecting registration
/// state on reappearance without the caller having to poll.
pub async fn drive_peer_watch<H: DaemonHost + 'static>(
    connection: Connection,
    bridge: AudioMgrBridge<H>,
    peer_name: String,
) -> zbus::Result<()> {
    let mut watcher = bus::PeerWatcher::spawn(&connection, &peer_name).await?;
    while let Some(state) = watcher.events.recv().await {
        bridge.handle_peer_state(state).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn am_class_assigns_distinct_ids_per_device_class() {
        assert_ne!(am_class_for(NodeType::Speakers), am_class_for(NodeType::Microphone));
        assert_ne!(am_class_for(NodeType::BluetoothA2dp), am_class_for(NodeType::BluetoothSco));
    }

    #[test]
    fn am_class_assigns_distinct_ids_per_application_class() {
        assert_ne!(am_class_for(NodeType::Phone), am_class_for(NodeType::Player));
        assert_ne!(am_class_for(NodeType::Navigator), am_class_for(NodeType::Alert));
    }
}
