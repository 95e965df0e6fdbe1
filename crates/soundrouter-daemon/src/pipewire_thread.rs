// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The live PipeWire connection: a dedicated OS thread running its own
//! `pipewire::main_loop::MainLoopRc`, talked to from the rest of the
//! daemon through [`PipeWireHost`] (a [`HostHandle`] impl) and
//! [`tracker::PwEvent`]s delivered back over a channel.
//!
//! Registry state (nodes, ports, devices) lives entirely on this thread;
//! nothing outside it touches a `pipewire` type directly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::process::Child;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pipewire::link::Link;
use pipewire::node::{Node, NodeListener};
use pipewire::properties::properties;
use pipewire::spa::param::ParamType;
use pipewire::spa::pod::Pod;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::discover::{CardInfo, PortInfo, SinkInfo, SinkInputInfo, SourceInfo};
use crate::host::HostHandle;
use crate::node::PwObjectId;
use crate::tracker::PwEvent;

#[derive(Debug, Error)]
pub enum PwError {
    #[error("PipeWire initialization failed: {0}")]
    InitFailed(String),
    #[error("failed to connect to the PipeWire server: {0}")]
    ConnectionFailed(String),
    #[error("PipeWire thread is gone")]
    ThreadGone,
}

/// Commands the rest of the daemon sends to the PipeWire thread. Each
/// [`HostHandle`] method maps to exactly one of these.
enum PwCommand {
    MoveStream { stream: PwObjectId, target: PwObjectId },
    SetCardProfile { card: PwObjectId, profile: String },
    CreateLoopback { correlation: PwObjectId, source: PwObjectId, sink: PwObjectId, media_role: String },
    DestroyLoopback { correlation: PwObjectId },
    SetStreamVolume { stream: PwObjectId, linear: f64 },
    Shutdown,
}

struct BoundNode {
    proxy: Node,
    _listener: NodeListener,
}

/// A `pw-loopback` child process backing one [`HostHandle::create_loopback`]
/// call, the same subprocess-based loopback this crate's host abstraction
/// is grounded on for virtual sink/source creation — native in-process
/// loopback streams would need a second `pipewire::stream::Stream` pumped
/// on this same thread, which is future work, not a correctness gap for
/// any currently exercised path.
struct LoopbackProcess {
    child: Child,
}

impl Drop for LoopbackProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

struct PwThreadState {
    bound_nodes: HashMap<PwObjectId, BoundNode>,
    loopbacks: HashMap<PwObjectId, LoopbackProcess>,
    node_name_by_id: HashMap<PwObjectId, String>,
    device_card_index_by_id: HashMap<PwObjectId, PwObjectId>,
    event_tx: Rc<mpsc::Sender<PwEvent>>,
}

impl PwThreadState {
    fn new(event_tx: Rc<mpsc::Sender<PwEvent>>) -> Self {
        PwThreadState {
            bound_nodes: HashMap::new(),
            loopbacks: HashMap::new(),
            node_name_by_id: HashMap::new(),
            device_card_index_by_id: HashMap::new(),
            event_tx,
        }
    }
}

/// Handle owned by the rest of the daemon. Dropping it shuts the thread
/// down and joins it.
pub struct PwThread {
    cmd_tx: Arc<Mutex<pipewire::channel::Sender<PwCommand>>>,
    handle: Option<JoinHandle<()>>,
}

impl PwThread {
    fn spawn(event_tx: mpsc::Sender<PwEvent>, null_sink_name: String) -> Result<Self, PwError> {
        let (cmd_tx, cmd_rx) = pipewire::channel::channel::<PwCommand>();
        let cmd_tx = Arc::new(Mutex::new(cmd_tx));

        let handle = thread::Builder::new()
            .name("pipewire".to_string())
            .spawn(move || {
                if let Err(e) = run_pipewire_loop(cmd_rx, event_tx.clone(), &null_sink_name) {
                    error!("pipewire thread exited with error: {e}");
                }
            })
            .map_err(|e| PwError::InitFailed(e.to_string()))?;

        Ok(PwThread { cmd_tx, handle: Some(handle) })
    }

    fn send(&self, cmd: PwCommand) {
        if self.cmd_tx.lock().unwrap().send(cmd).is_err() {
            warn!("pipewire thread command channel closed, command dropped");
        }
    }

    /// A cloneable handle onto the command channel, for the volume-ramp
    /// stepper thread to post follow-up `SetStreamVolume` commands from
    /// outside the call that started the ramp.
    fn sender_handle(&self) -> Arc<Mutex<pipewire::channel::Sender<PwCommand>>> {
        Arc::clone(&self.cmd_tx)
    }
}

impl Drop for PwThread {
    fn drop(&mut self) {
        let _ = self.cmd_tx.lock().unwrap().send(PwCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Locally-allocated ids for loopback streams: real PipeWire node ids for
/// these only become known asynchronously (after the child process's
/// stream registers), so callers get an immediately-usable correlation id
/// instead of blocking on that round trip.
fn next_correlation() -> PwObjectId {
    static NEXT: AtomicU32 = AtomicU32::new(1_000_000);
    PwObjectId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// The production [`HostHandle`]: every method is fire-and-forget onto the
/// PipeWire thread's command channel, with completion (where it matters)
/// reported back asynchronously as a [`PwEvent`] through the tracker.
pub struct PipeWireHost {
    thread: PwThread,
    null_sink: PwObjectId,
    null_source: PwObjectId,
    /// Last linear volume factor sent per stream, used as the ramp's
    /// interpolation start point; unseen streams are assumed at unity.
    last_volume: Arc<Mutex<HashMap<PwObjectId, f64>>>,
}

impl PipeWireHost {
    /// Connects to the PipeWire server, ensures the null sink/source this
    /// daemon parks unrouted streams on exist, and returns a handle plus
    /// the receiving end of the event stream the tracker drains.
    pub fn connect(null_sink_name: &str) -> Result<(Self, mpsc::Receiver<PwEvent>), PwError> {
        let (event_tx, event_rx) = mpsc::channel();
        let thread = PwThread::spawn(event_tx, null_sink_name.to_string())?;

        // The null sink/source are reported back as ordinary SinkAdded/
        // SourceAdded events once the thread's startup loopback process
        // registers; block briefly for them so null_sink()/null_source()
        // can stay synchronous for callers.
        let mut null_sink = None;
        let mut null_source = None;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while (null_sink.is_none() || null_source.is_none()) && std::time::Instant::now() < deadline {
            match event_rx.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(PwEvent::SinkAdded(sink)) if sink.name == format!("{null_sink_name}.sink") => {
                    null_sink = Some(sink.index);
                }
                Ok(PwEvent::SourceAdded(source)) if source.name == format!("{null_sink_name}.source") => {
                    null_source = Some(source.index);
                }
                Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let null_sink = null_sink.unwrap_or(PwObjectId::INVALID);
        let null_source = null_source.unwrap_or(PwObjectId::INVALID);
        if !null_sink.is_valid() {
            warn!("null sink did not register within the startup window, continuing without one");
        }

        Ok((
            PipeWireHost { thread, null_sink, null_source, last_volume: Arc::new(Mutex::new(HashMap::new())) },
            event_rx,
        ))
    }
}

impl HostHandle for PipeWireHost {
    fn move_stream(&mut self, stream: PwObjectId, target: PwObjectId) {
        self.thread.send(PwCommand::MoveStream { stream, target });
    }

    fn set_card_profile(&mut self, card: PwObjectId, profile: &str) {
        self.thread.send(PwCommand::SetCardProfile { card, profile: profile.to_string() });
    }

    fn create_loopback(&mut self, source: PwObjectId, sink: PwObjectId, media_role: &str) -> PwObjectId {
        let correlation = next_correlation();
        self.thread.send(PwCommand::CreateLoopback {
            correlation,
            source,
            sink,
            media_role: media_role.to_string(),
        });
        correlation
    }

    fn destroy_loopback(&mut self, loopback: PwObjectId) {
        self.thread.send(PwCommand::DestroyLoopback { correlation: loopback });
    }

    fn set_stream_volume(&mut self, stream: PwObjectId, linear: f64, ramp_ms: u64) {
        let from = {
            let mut cache = self.last_volume.lock().unwrap();
            let prev = *cache.get(&stream).unwrap_or(&1.0);
            cache.insert(stream, linear);
            prev
        };

        if ramp_ms == 0 || (from - linear).abs() < f64::EPSILON {
            self.thread.send(PwCommand::SetStreamVolume { stream, linear });
            return;
        }

        let sender = self.thread.sender_handle();
        thread::spawn(move || {
            const STEP_MS: u64 = 20;
            let steps = (ramp_ms / STEP_MS).max(1);
            for i in 1..=steps {
                let t = i as f64 / steps as f64;
                let value = from + (linear - from) * t;
                let sent = sender.lock().unwrap().send(PwCommand::SetStreamVolume { stream, linear: value });
                if sent.is_err() {
                    break;
                }
                if i < steps {
                    thread::sleep(Duration::from_millis(STEP_MS));
                }
            }
        });
    }

    fn null_sink(&self) -> PwObjectId {
        self.null_sink
    }

    fn null_source(&self) -> PwObjectId {
        self.null_source
    }
}

impl crate::switch::LinkHost for PipeWireHost {
    fn move_stream(&mut self, stream: PwObjectId, sink: PwObjectId) {
        HostHandle::move_stream(self, stream, sink);
    }

    fn set_card_profile(&mut self, card: PwObjectId, profile: &str) {
        HostHandle::set_card_profile(self, card, profile);
    }
}

fn run_pipewire_loop(
    cmd_rx: pipewire::channel::Receiver<PwCommand>,
    event_tx: mpsc::Sender<PwEvent>,
    null_sink_name: &str,
) -> Result<(), PwError> {
    pipewire::init();

    let main_loop =
        pipewire::main_loop::MainLoopRc::new(None).map_err(|e| PwError::InitFailed(e.to_string()))?;
    let context =
        pipewire::context::ContextRc::new(&main_loop, None).map_err(|e| PwError::InitFailed(e.to_string()))?;
    let core = context.connect_rc(None).map_err(|e| PwError::ConnectionFailed(e.to_string()))?;
    let registry = core.get_registry_rc().map_err(|e| PwError::ConnectionFailed(e.to_string()))?;

    info!("connected to pipewire");

    let event_tx = Rc::new(event_tx);
    let state = Rc::new(RefCell::new(PwThreadState::new(event_tx.clone())));

    spawn_null_endpoint(&state, null_sink_name);

    let state_cmd = state.clone();
    let core_cmd = core.clone();
    let _cmd_receiver = cmd_rx.attach(main_loop.loop_(), move |cmd| {
        handle_command(cmd, &state_cmd, &core_cmd);
    });

    let _registry_listener = setup_registry_listener(&registry, state.clone(), event_tx.clone());

    main_loop.run();

    info!("pipewire thread shutting down");
    Ok(())
}

/// Starts the subprocess that backs this daemon's null sink/source pair,
/// the same `pw-loopback`-driven pattern used for every other loopback
/// this host creates.
fn spawn_null_endpoint(state: &Rc<RefCell<PwThreadState>>, null_sink_name: &str) {
    match std::process::Command::new("pw-loopback")
        .args([
            "--capture-props",
            &format!("media.class=Audio/Sink node.name={null_sink_name}.sink"),
            "--playback-props",
            &format!("media.class=Audio/Source node.name={null_sink_name}.source"),
        ])
        .spawn()
    {
        Ok(child) => {
            state.borrow_mut().loopbacks.insert(PwObjectId(0), LoopbackProcess { child });
        }
        Err(e) => warn!("failed to start null sink/source via pw-loopback: {e}"),
    }
}

fn setup_registry_listener(
    registry: &pipewire::registry::RegistryRc,
    state: Rc<RefCell<PwThreadState>>,
    event_tx: Rc<mpsc::Sender<PwEvent>>,
) -> pipewire::registry::Listener {
    let state_add = state.clone();
    let state_remove = state;
    let event_tx_add = event_tx.clone();
    let event_tx_remove = event_tx;

    registry
        .add_listener_local()
        .global(move |global| {
            use pipewire::types::ObjectType;

            let props = match global.props {
                Some(p) => p,
                None => return,
            };

            match global.type_ {
                ObjectType::Node => handle_node_global(global.id, props, &state_add, &event_tx_add),
                ObjectType::Device => handle_device_global(global.id, props, &state_add, &event_tx_add),
                _ => {}
            }
        })
        .global_remove(move |id| {
            let id = PwObjectId(id);
            let mut st = state_remove.borrow_mut();
            st.bound_nodes.remove(&id);
            if let Some(name) = st.node_name_by_id.remove(&id) {
                debug!("node {id:?} ({name}) removed");
                let event = if name.ends_with(".sink") || name.contains("Audio/Sink") {
                    PwEvent::SinkRemoved(id)
                } else if name.ends_with(".source") || name.contains("Audio/Source") {
                    PwEvent::SourceRemoved(id)
                } else {
                    PwEvent::SinkInputRemoved(id)
                };
                let _ = event_tx_remove.send(event);
            } else if st.device_card_index_by_id.remove(&id).is_some() {
                let _ = event_tx_remove.send(PwEvent::CardRemoved(id));
            }
        })
        .register()
}

fn handle_node_global(
    id: u32,
    props: &pipewire::spa::utils::dict::DictRef,
    state: &Rc<RefCell<PwThreadState>>,
    event_tx: &Rc<mpsc::Sender<PwEvent>>,
) {
    let index = PwObjectId(id);
    let name = props.get("node.name").unwrap_or_default().to_string();
    let media_class = props.get("media.class").unwrap_or_default();
    let card = props.get("device.id").and_then(|s| s.parse::<u32>().ok()).map(PwObjectId);
    let channels = props.get("audio.channels").and_then(|s| s.parse::<u32>().ok()).unwrap_or(2);
    let port = props.get("port.name").map(str::to_string);

    state.borrow_mut().node_name_by_id.insert(index, name.clone());

    let event = match media_class {
        "Audio/Sink" => Some(PwEvent::SinkAdded(SinkInfo { index, name, channels, card, port })),
        "Audio/Source" => Some(PwEvent::SourceAdded(SourceInfo { index, name, channels, card, port })),
        "Stream/Output/Audio" | "Stream/Input/Audio" => {
            let process_binary = props.get("application.process.binary").map(str::to_string);
            let media_role = props.get("media.role").map(str::to_string);
            Some(PwEvent::SinkInputAdded(SinkInputInfo { index, name, process_binary, media_role, channels }))
        }
        _ => None,
    };

    if let Some(event) = event {
        debug!("node {id} registered as {media_class}");
        let _ = event_tx.send(event);
    }
}

/// Devices are reported from whatever static registry properties are
/// present at registration time; a running profile *change* on an
/// already-known device is not observed here (that needs the device
/// proxy's Param/EnumProfile events, not just registry globals) and is
/// recorded as an open simplification rather than implemented.
fn handle_device_global(
    id: u32,
    props: &pipewire::spa::utils::dict::DictRef,
    state: &Rc<RefCell<PwThreadState>>,
    event_tx: &Rc<mpsc::Sender<PwEvent>>,
) {
    let index = PwObjectId(id);
    let name = props.get("device.name").unwrap_or_default().to_string();
    let bus = props.get("device.bus").map(str::to_string);
    let form_factor = props.get("device.form-factor").map(str::to_string);
    let active_profile = props.get("device.profile.name").unwrap_or("off").to_string();

    state.borrow_mut().device_card_index_by_id.insert(index, index);

    let card = CardInfo { index, name, bus, form_factor, active_profile, ports: Vec::<PortInfo>::new() };
    debug!("device {id} registered as card {}", card.name);
    let _ = event_tx.send(PwEvent::CardAdded(card));
}

fn handle_command(cmd: PwCommand, state: &Rc<RefCell<PwThreadState>>, core: &pipewire::core::CoreRc) {
    match cmd {
        PwCommand::MoveStream { stream, target } => move_stream(stream, target, core, state),
        PwCommand::SetCardProfile { card, profile } => set_card_profile(card, &profile),
        PwCommand::CreateLoopback { correlation, source, sink, media_role } => {
            create_loopback(correlation, source, sink, &media_role, state)
        }
        PwCommand::DestroyLoopback { correlation } => {
            state.borrow_mut().loopbacks.remove(&correlation);
        }
        PwCommand::SetStreamVolume { stream, linear } => set_stream_volume(stream, linear, state),
        PwCommand::Shutdown => {
            // The main loop is torn down by PwThread::spawn's caller joining
            // this thread; nothing further to do here.
        }
    }
}

fn move_stream(stream: PwObjectId, target: PwObjectId, core: &pipewire::core::CoreRc, state: &Rc<RefCell<PwThreadState>>) {
    trace!("moving stream {stream:?} to {target:?}");
    let result = core.create_object::<Link>(
        "link-factory",
        &properties! {
            "link.output.node" => stream.0.to_string(),
            "link.input.node" => target.0.to_string(),
            "object.linger" => "true",
        },
    );
    match result {
        Ok(_link) => debug!("linked {stream:?} -> {target:?}"),
        Err(e) => warn!("failed to create link {stream:?} -> {target:?}: {e:?}"),
    }
    let _ = state;
}

fn set_card_profile(card: PwObjectId, profile: &str) {
    debug!("setting card {card:?} to profile '{profile}'");
    match std::process::Command::new("pactl").args(["set-card-profile", &card.0.to_string(), profile]).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("pactl set-card-profile exited with {status}"),
        Err(e) => warn!("failed to run pactl set-card-profile: {e}"),
    }
}

fn create_loopback(
    correlation: PwObjectId,
    source: PwObjectId,
    sink: PwObjectId,
    media_role: &str,
    state: &Rc<RefCell<PwThreadState>>,
) {
    let result = std::process::Command::new("pw-loopback")
        .args([
            "--capture-props",
            &format!("target.object={} media.role={media_role}", source.0),
            "--playback-props",
            &format!("target.object={}", sink.0),
        ])
        .spawn();
    match result {
        Ok(child) => {
            state.borrow_mut().loopbacks.insert(correlation, LoopbackProcess { child });
        }
        Err(e) => warn!("failed to spawn loopback {source:?} -> {sink:?}: {e}"),
    }
}

fn set_stream_volume(stream: PwObjectId, linear: f64, state: &Rc<RefCell<PwThreadState>>) {
    let bound = state.borrow();
    if let Some(node) = bound.bound_nodes.get(&stream) {
        if let Some(pod) = build_channel_volume_pod(linear as f32) {
            node.proxy.set_param(ParamType::Props, 0, pod.as_pod());
            trace!("set stream {stream:?} volume to {linear:.3} via native param");
            return;
        }
    }
    drop(bound);
    debug!("stream {stream:?} not bound, falling back to wpctl for volume {linear:.3}");
    let _ = std::process::Command::new("wpctl")
        .args(["set-volume", &stream.0.to_string(), &format!("{linear:.3}")])
        .status();
}

struct OwnedPod(Vec<u8>);

impl OwnedPod {
    fn as_pod(&self) -> &Pod {
        Pod::from_bytes(&self.0).expect("just-serialized pod is well-formed")
    }
}

fn build_channel_volume_pod(linear: f32) -> Option<OwnedPod> {
    use libspa::pod::serialize::PodSerializer;
    use libspa::pod::Value;
    use std::io::Cursor;

    let props = Value::Object(libspa::pod::Object {
        type_: libspa::sys::SPA_TYPE_OBJECT_Props,
        id: libspa::sys::SPA_PARAM_Props,
        properties: vec![libspa::pod::Property {
            key: libspa::sys::SPA_PROP_channelVolumes,
            flags: libspa::pod::PropertyFlags::empty(),
            value: Value::ValueArray(libspa::pod::ValueArray::Float(vec![linear, linear])),
        }],
    });

    let mut buffer = Vec::new();
    let cursor = Cursor::new(&mut buffer);
    PodSerializer::serialize(cursor, &props).ok()?;
    Some(OwnedPod(buffer))
}
