// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Directory watching for the property-augment module: client rule,
//! desktop, and sink-input rule directories are watched for changes so the
//! rule cache and sink-input rule engine pick up edits without a restart.
//!
//! A dedicated tokio task forwards `notify` filesystem events into a
//! channel the rest of the daemon consumes, the same background-task
//! shape used for every other long-lived I/O source in this crate.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What happened to a watched file, collapsed from `notify`'s richer event
/// kinds into the three actions the augment module cares about.
///
/// `notify` reports a file replace-via-rename as a `Remove` of the old
/// path followed by a `Create` of the new one; naively mapping every
/// non-remove event to `Create` would mean the rule cache never learns
/// that a file disappeared when an editor does a rename-based save. This
/// is why removes are reported as [`WatchAction::Delete`] rather than
/// folded into [`WatchAction::Create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Create(PathBuf),
    Modify(PathBuf),
    Delete(PathBuf),
}

fn binary_name_for(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_suffix(".rule").or_else(|| stem.strip_suffix(".desktop")).map(str::to_string).or(Some(stem.to_string()))
}

impl WatchAction {
    pub fn path(&self) -> &Path {
        match self {
            WatchAction::Create(p) | WatchAction::Modify(p) | WatchAction::Delete(p) => p,
        }
    }

    /// The binary name a rule/desktop file's name encodes, stripping the
    /// `.rule`/`.desktop` infix PulseAudio-style client rule files use.
    pub fn binary_name(&self) -> Option<String> {
        binary_name_for(self.path())
    }

    fn from_notify(event: Event) -> Vec<WatchAction> {
        event
            .paths
            .into_iter()
            .filter_map(|path| {
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    return None;
                }
                match event.kind {
                    EventKind::Create(_) => Some(WatchAction::Create(path)),
                    EventKind::Modify(_) => Some(WatchAction::Modify(path)),
                    EventKind::Remove(_) => Some(WatchAction::Delete(path)),
                    _ => None,
                }
            })
            .collect()
    }
}

/// A live filesystem watch over one or more directories, delivering
/// collapsed [`WatchAction`]s over an async channel.
pub struct DirectoryWatch {
    _watcher: RecommendedWatcher,
    pub events: mpsc::UnboundedReceiver<WatchAction>,
}

impl DirectoryWatch {
    /// Starts watching every directory in `dirs` non-recursively. A
    /// directory that doesn't exist yet is skipped with a warning rather
    /// than failing the whole watch — rule directories are optional.
    pub fn new(dirs: &[PathBuf]) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for action in WatchAction::from_notify(event) {
                    debug!("augment directory watch: {action:?}");
                    let _ = tx.send(action);
                }
            }
            Err(e) => warn!("augment directory watch error: {e}"),
        })?;

        for dir in dirs {
            if !dir.is_dir() {
                warn!("augment watch directory {dir:?} does not exist, skipping");
                continue;
            }
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        Ok(DirectoryWatch { _watcher: watcher, events: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    #[test]
    fn create_event_maps_to_create_action() {
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/tmp/firefox.rule.toml"));
        let actions = WatchAction::from_notify(event);
        assert_eq!(actions, vec![WatchAction::Create(PathBuf::from("/tmp/firefox.rule.toml"))]);
    }

    #[test]
    fn remove_event_maps_to_delete_not_create() {
        let event =
            Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/tmp/firefox.rule.toml"));
        let actions = WatchAction::from_notify(event);
        assert_eq!(actions, vec![WatchAction::Delete(PathBuf::from("/tmp/firefox.rule.toml"))]);
    }

    #[test]
    fn modify_event_maps_to_modify_action() {
        let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/tmp/firefox.rule.toml"));
        let actions = WatchAction::from_notify(event);
        assert_eq!(actions, vec![WatchAction::Modify(PathBuf::from("/tmp/firefox.rule.toml"))]);
    }

    #[test]
    fn non_toml_paths_are_filtered_out() {
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/tmp/.firefox.rule.swp"));
        assert!(WatchAction::from_notify(event).is_empty());
    }

    #[test]
    fn binary_name_strips_rule_and_desktop_infixes() {
        let create = WatchAction::Create(PathBuf::from("/tmp/firefox.rule.toml"));
        assert_eq!(create.binary_name().as_deref(), Some("firefox"));
        let modify = WatchAction::Modify(PathBuf::from("/tmp/firefox.desktop.toml"));
        assert_eq!(modify.binary_name().as_deref(), Some("firefox"));
    }
}
