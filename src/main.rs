// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SoundRouter Daemon - policy-driven PipeWire audio routing.
//!
//! Connects to PipeWire, builds the node graph from the live registry,
//! routes streams according to the configured router/volume policy, and
//! bridges routing requests from a GENIVI-style Audio Manager over D-Bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use soundrouter_daemon::augment::{RuleCache, SinkInputRuleEngine};
use soundrouter_daemon::bridge::{self, AudioMgrBridge};
use soundrouter_daemon::bus;
use soundrouter_daemon::config::ConfigManager;
use soundrouter_daemon::engine::{self, Engine};
use soundrouter_daemon::node::NodeKey;
use soundrouter_daemon::pipewire_thread::PipeWireHost;
use soundrouter_daemon::tracker::PwEvent;
use soundrouter_daemon::watch::{DirectoryWatch, WatchAction};

/// The device-node key a host event would register/rebind, if any — mirrors
/// `Discovery::add_sink`/`add_source`'s own key derivation so the bridge can
/// register newly-visible device nodes without re-deriving graph state.
fn device_key_for(event: &PwEvent) -> Option<NodeKey> {
    match event {
        PwEvent::SinkAdded(sink) => Some(NodeKey::for_device(&sink.name, sink.port.as_deref())),
        PwEvent::SourceAdded(source) => Some(NodeKey::for_device(&source.name, source.port.as_deref())),
        _ => None,
    }
}

/// Enriches a newly-discovered sink input's media role in place from the
/// client rule cache and sink-input rule engine, mirroring the way
/// PulseAudio-derived augment rules feed classification before a stream is
/// ever admitted into the graph.
fn augment_sink_input(info: &mut soundrouter_daemon::discover::SinkInputInfo, cache: &mut RuleCache, rules: &SinkInputRuleEngine) {
    let Some(binary) = info.process_binary.clone() else { return };
    let mut props = std::collections::HashMap::new();
    if let Some(role) = &info.media_role {
        props.insert("MEDIA_ROLE".to_string(), role.clone());
    }
    cache.lookup_and_merge(&binary, &mut props);
    rules.apply(Some(&binary), &mut props);
    if let Some(role) = props.get("MEDIA_ROLE") {
        info.media_role = Some(role.clone());
    }
}

/// Reacts to a client-rule/desktop/sink-input-rule directory change:
/// invalidates the affected cache entry, or reloads the whole sink-input
/// rule set when a rule file under that directory changes.
fn handle_watch_action(
    action: WatchAction,
    rule_cache: &mut Option<RuleCache>,
    sink_input_rules: &mut SinkInputRuleEngine,
    sink_input_rules_dir: Option<&std::path::Path>,
) {
    if Some(action.path().parent().unwrap_or(action.path())) == sink_input_rules_dir {
        if let Some(dir) = sink_input_rules_dir {
            sink_input_rules.reload(dir);
        }
        return;
    }
    if let (Some(cache), Some(binary)) = (rule_cache.as_mut(), action.binary_name()) {
        cache.invalidate(&binary);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("soundrouter_daemon=debug".parse().unwrap())
                .add_directive("zbus=warn".parse().unwrap()),
        )
        .init();

    info!("soundrouter daemon starting");

    let config_manager = ConfigManager::new()?;
    let config = config_manager.load().unwrap_or_default();

    let (host, pw_events) = PipeWireHost::connect(&config.bridge.null_sink_name)?;
    info!("connected to pipewire, running startup discovery sweep");

    let inventory = engine::collect_startup_inventory(&pw_events, Duration::from_millis(500));
    let mut engine = Engine::new(host, &config);
    engine.synchronize(&inventory);
    info!("startup sweep found {} node(s)", engine.graph().len());

    let engine = Arc::new(tokio::sync::Mutex::new(engine));

    // Forward the PipeWire thread's blocking mpsc channel into tokio:
    // PwEvent arrives on a std::sync::mpsc::Receiver because the PipeWire
    // connection lives on its own non-async thread.
    let (async_events_tx, mut async_events_rx) = tokio::sync::mpsc::unbounded_channel::<PwEvent>();
    std::thread::Builder::new().name("pw-event-bridge".to_string()).spawn(move || {
        while let Ok(event) = pw_events.recv() {
            if async_events_tx.send(event).is_err() {
                break;
            }
        }
        debug!("pipewire event forwarding thread exiting");
    })?;

    let connection = bus::connect_with_retry(&config.bridge.dbus_bridge_name).await?;

    let am_bridge = AudioMgrBridge::new(engine.clone(), config.bridge.clone());
    connection.object_server().at(config.bridge.dbus_bridge_path.as_str(), am_bridge.clone()).await?;
    info!("bridge D-Bus interface registered at {}", config.bridge.dbus_bridge_path);

    if let Err(e) = am_bridge.attach_proxy(&connection).await {
        warn!("failed to attach Audio Manager proxy: {e}");
    }

    let peer_watch_connection = connection.clone();
    let peer_watch_bridge = am_bridge.clone();
    let peer_name = config.bridge.dbus_audiomgr_name.clone();
    let peer_watch_task = tokio::spawn(async move {
        if let Err(e) = bridge::drive_peer_watch(peer_watch_connection, peer_watch_bridge, peer_name).await {
            warn!("Audio Manager peer watch exited: {e}");
        }
    });

    let mut rule_cache = config.augment.as_ref().map(|a| RuleCache::new(a.client_rules_dir.clone(), a.desktop_dir.clone()).with_capacity(a.cache_size));
    let mut sink_input_rules = SinkInputRuleEngine::new();
    if let Some(augment) = &config.augment {
        sink_input_rules.reload(&augment.sink_input_rules_dir);
    }
    let sink_input_rules_dir = config.augment.as_ref().map(|a| a.sink_input_rules_dir.clone());

    let augment_watch = config.augment.as_ref().and_then(|a| {
        DirectoryWatch::new(&[a.client_rules_dir.clone(), a.desktop_dir.clone(), a.sink_input_rules_dir.clone()])
            .inspect_err(|e| warn!("failed to start augment directory watch: {e}"))
            .ok()
    });

    let shutdown = Arc::new(AtomicBool::new(false));

    let event_engine = engine.clone();
    let event_bridge = am_bridge.clone();
    let event_shutdown = shutdown.clone();
    let event_task = tokio::spawn(async move {
        let mut watch = augment_watch;
        loop {
            tokio::select! {
                event = async_events_rx.recv() => {
                    match event {
                        Some(mut event) => {
                            if let (PwEvent::SinkInputAdded(info), Some(cache)) = (&mut event, rule_cache.as_mut()) {
                                augment_sink_input(info, cache, &sink_input_rules);
                            }
                            let newly_visible = device_key_for(&event);
                            let mut guard = event_engine.lock().await;
                            guard.handle_event(event);
                            drop(guard);
                            if let Some(key) = newly_visible {
                                event_bridge.register_device_node(&key).await;
                            }
                        }
                        None => break,
                    }
                }
                action = async {
                    match watch.as_mut() {
                        Some(w) => w.events.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match action {
                        Some(action) => handle_watch_action(action, &mut rule_cache, &mut sink_input_rules, sink_input_rules_dir.as_deref()),
                        None => {}
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    if event_shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        debug!("host event loop exiting");
    });

    info!("soundrouter daemon ready");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    shutdown.store(true, Ordering::Relaxed);
    peer_watch_task.abort();
    let _ = tokio::time::timeout(Duration::from_secs(2), event_task).await;

    am_bridge.deregister_domain().await;

    if let Err(e) = config_manager.save(&config) {
        error!("failed to save config on shutdown: {e}");
    }

    info!("soundrouter daemon stopped");
    Ok(())
}
