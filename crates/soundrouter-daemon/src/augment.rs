// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Property augmentation: a bounded rule cache that enriches a stream's
//! proplist with role/icon/application-name fragments read from on-disk
//! client rule files, plus a separate sink-input rule engine that can
//! rewrite arbitrary proplist keys based on regex matches.
//!
//! Both on-disk formats are plaintext INI-like section files, not TOML:
//! desktop-entry-style `Name`/`Icon`/`Type`/`X-PulseAudio-Properties`/
//! `Categories` keys under `[Desktop Entry]` for rule/desktop files, and
//! `[result]`/`[general]`/arbitrary match sections for sink-input rules.
//! Parsed with a small hand-rolled section scanner rather than a real INI
//! crate, since nothing else in this crate pulls one in for ~40 lines of
//! line-oriented parsing.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::{debug, warn};

const DEFAULT_CACHE_SIZE: usize = 50;
const FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

/// One `[section]`, in file order, holding its `key = value` pairs in the
/// order they appeared. Keys before any `[section]` header land in a
/// section named `""` and are ignored by every parser here.
fn parse_ini(text: &str) -> Vec<(String, Vec<(String, String)>)> {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
    let mut current = String::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            current = name.trim().to_string();
            if !sections.iter().any(|(n, _)| n == &current) {
                sections.push((current.clone(), Vec::new()));
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        let pair = (key.trim().to_string(), value.trim().to_string());
        match sections.iter_mut().find(|(n, _)| n == &current) {
            Some((_, pairs)) => pairs.push(pair),
            None => sections.push((current.clone(), vec![pair])),
        }
    }
    sections
}

/// `key=value;key=value;` proplist fragment, as carried in
/// `X-PulseAudio-Properties`.
fn parse_properties_fragment(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Semicolon-separated `Categories`; last matching category wins, mirroring
/// the original's unconditional reassignment on every match.
fn categories_to_role(raw: &str) -> Option<String> {
    let mut role = None;
    for category in raw.split(';') {
        match category.trim() {
            "Game" => role = Some("game".to_string()),
            "Telephony" => role = Some("phone".to_string()),
            _ => {}
        }
    }
    role
}

#[derive(Debug, Clone, Default)]
pub struct RuleFragment {
    pub role: Option<String>,
    pub icon_name: Option<String>,
    pub application_name: Option<String>,
    /// Arbitrary keys from `X-PulseAudio-Properties`, merged into a
    /// stream's proplist for keys it doesn't already carry.
    pub properties: HashMap<String, String>,
}

/// Parses one desktop-entry-style file (used for both the client `.conf`
/// rule file and the desktop `.desktop` file — the original reuses the
/// same config table for both). Returns `None` if a `Type` key is present
/// and isn't `Application`, matching the original's `check_type` abort.
fn parse_descriptor(text: &str) -> Option<RuleFragment> {
    let sections = parse_ini(text);
    let Some((_, entries)) = sections.iter().find(|(name, _)| name == "Desktop Entry") else {
        return Some(RuleFragment::default());
    };

    let mut fragment = RuleFragment::default();
    for (key, value) in entries {
        match key.as_str() {
            "Name" => fragment.application_name = Some(value.clone()),
            "Icon" => fragment.icon_name = Some(value.clone()),
            "Type" if value != "Application" => return None,
            "Type" => {}
            "X-PulseAudio-Properties" => {
                for (k, v) in parse_properties_fragment(value) {
                    fragment.properties.insert(k, v);
                }
            }
            "Categories" => {
                if let Some(role) = categories_to_role(value) {
                    fragment.role = Some(role);
                }
            }
            _ => {}
        }
    }
    if fragment.role.is_none() {
        fragment.role = fragment.properties.get("media.role").cloned();
    }
    Some(fragment)
}

struct CacheEntry {
    fragment: RuleFragment,
    rule_mtime: Option<SystemTime>,
    desktop_mtime: Option<SystemTime>,
    last_checked: SystemTime,
}

/// Client-rule-file-keyed LRU cache.
pub struct RuleCache {
    rules_dir: PathBuf,
    desktop_dir: PathBuf,
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

fn is_valid_binary_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/')
}

impl RuleCache {
    pub fn new(rules_dir: PathBuf, desktop_dir: PathBuf) -> Self {
        RuleCache {
            rules_dir,
            desktop_dir,
            capacity: DEFAULT_CACHE_SIZE,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn rule_path(&self, binary: &str) -> PathBuf {
        self.rules_dir.join(format!("{binary}.conf"))
    }

    fn desktop_path(&self, binary: &str) -> PathBuf {
        self.desktop_dir.join(format!("{binary}.desktop"))
    }

    fn mtime(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).ok()?.modified().ok()
    }

    /// Client `.conf` file wins outright (first=TRUE in the original); the
    /// desktop file only fills fields the client file left unset.
    fn load_fragment(&self, binary: &str) -> RuleFragment {
        let mut fragment = RuleFragment::default();
        if let Ok(text) = std::fs::read_to_string(self.rule_path(binary)) {
            match parse_descriptor(&text) {
                Some(f) => fragment = f,
                None => warn!("client rule for '{binary}' has Type != Application, ignoring"),
            }
        }
        if let Ok(text) = std::fs::read_to_string(self.desktop_path(binary)) {
            if let Some(desktop) = parse_descriptor(&text) {
                if fragment.icon_name.is_none() {
                    fragment.icon_name = desktop.icon_name;
                }
                if fragment.application_name.is_none() {
                    fragment.application_name = desktop.application_name;
                }
                if fragment.role.is_none() {
                    fragment.role = desktop.role;
                }
                for (k, v) in desktop.properties {
                    fragment.properties.entry(k).or_insert(v);
                }
            }
        }
        fragment
    }

    fn evict_if_full(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(victim) = self.order.pop_front() {
                self.entries.remove(&victim);
            }
        }
    }

    /// Look up (revalidating if stale) the rule fragment for `binary`,
    /// merging it into `proplist`: `icon_name`/`role`/arbitrary properties
    /// set only if absent; `application_name` overwrites only when absent
    /// or equal to the raw binary name.
    pub fn lookup_and_merge(&mut self, binary: &str, proplist: &mut HashMap<String, String>) {
        if !is_valid_binary_name(binary) {
            return;
        }

        let now = SystemTime::now();
        let needs_refresh = match self.entries.get(binary) {
            None => true,
            Some(entry) => {
                let stale_check = now.duration_since(entry.last_checked).unwrap_or_default() > FRESHNESS_WINDOW;
                if !stale_check {
                    false
                } else {
                    let rule_mtime = Self::mtime(&self.rule_path(binary));
                    let desktop_mtime = Self::mtime(&self.desktop_path(binary));
                    rule_mtime != entry.rule_mtime || desktop_mtime != entry.desktop_mtime
                }
            }
        };

        if needs_refresh {
            let fragment = self.load_fragment(binary);
            let rule_mtime = Self::mtime(&self.rule_path(binary));
            let desktop_mtime = Self::mtime(&self.desktop_path(binary));
            if !self.entries.contains_key(binary) {
                self.order.push_back(binary.to_string());
                self.evict_if_full();
            }
            self.entries.insert(
                binary.to_string(),
                CacheEntry { fragment, rule_mtime, desktop_mtime, last_checked: now },
            );
            debug!("refreshed augment rule cache entry for '{binary}'");
        } else if let Some(entry) = self.entries.get_mut(binary) {
            entry.last_checked = now;
        }

        let Some(entry) = self.entries.get(binary) else { return };
        let fragment = &entry.fragment;

        for (key, value) in &fragment.properties {
            proplist.entry(key.clone()).or_insert_with(|| value.clone());
        }
        if !proplist.contains_key("MEDIA_ROLE") {
            if let Some(role) = &fragment.role {
                proplist.insert("MEDIA_ROLE".to_string(), role.clone());
            }
        }
        if !proplist.contains_key("APPLICATION_ICON_NAME") {
            if let Some(icon) = &fragment.icon_name {
                proplist.insert("APPLICATION_ICON_NAME".to_string(), icon.clone());
            }
        }
        if let Some(name) = &fragment.application_name {
            let overwrite = match proplist.get("APPLICATION_NAME") {
                None => true,
                Some(existing) => existing == binary,
            };
            if overwrite {
                proplist.insert("APPLICATION_NAME".to_string(), name.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop one binary's cached fragment so the next lookup re-reads its
    /// rule/desktop files immediately, instead of waiting out the
    /// freshness window. Called when a directory watch reports a change.
    pub fn invalidate(&mut self, binary: &str) {
        if self.entries.remove(binary).is_some() {
            self.order.retain(|b| b != binary);
        }
    }
}

/// Three-state match outcome for one sink-input rule file, evaluated once
/// per stream across every `(prop_key, regex)` section it defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchState {
    Undefined,
    Hit,
    Miss,
}

#[derive(Debug)]
pub struct MatchSection {
    pub prop_key: String,
    pub prop_value_regex: String,
}

#[derive(Debug)]
pub struct SinkInputRuleFile {
    pub client_name: Option<String>,
    pub target_key: String,
    pub target_value: String,
    pub matches: Vec<MatchSection>,
}

/// `[result]` gives `target_key`/`target_value`, `[general]` gives an
/// optional `client_name` restriction, and every other section is a match
/// with `prop_key`/`prop_value` (an extended regex). A file lacking a
/// `target_key`/`target_value` pair is rejected, mirroring
/// `validate_sink_input_rule`.
fn parse_sink_input_rule(text: &str) -> Option<SinkInputRuleFile> {
    let sections = parse_ini(text);
    let mut target_key = None;
    let mut target_value = None;
    let mut client_name = None;
    let mut matches = Vec::new();

    for (name, pairs) in &sections {
        match name.as_str() {
            "result" => {
                for (k, v) in pairs {
                    match k.as_str() {
                        "target_key" => target_key = Some(v.clone()),
                        "target_value" => target_value = Some(v.clone()),
                        _ => {}
                    }
                }
            }
            "general" => {
                for (k, v) in pairs {
                    if k == "client_name" {
                        client_name = Some(v.clone());
                    }
                }
            }
            "" => {}
            _ => {
                let mut prop_key = None;
                let mut prop_value_regex = None;
                for (k, v) in pairs {
                    match k.as_str() {
                        "prop_key" => prop_key = Some(v.clone()),
                        "prop_value" => prop_value_regex = Some(v.clone()),
                        _ => {}
                    }
                }
                if let (Some(prop_key), Some(prop_value_regex)) = (prop_key, prop_value_regex) {
                    matches.push(MatchSection { prop_key, prop_value_regex });
                }
            }
        }
    }

    Some(SinkInputRuleFile { client_name, target_key: target_key?, target_value: target_value?, matches })
}

pub struct SinkInputRuleEngine {
    rules: Vec<(String, SinkInputRuleFile)>,
}

impl SinkInputRuleEngine {
    pub fn new() -> Self {
        SinkInputRuleEngine { rules: Vec::new() }
    }

    /// Rebuild the entire rule set from scratch — called on a directory
    /// watch event. Every regular file in `dir` is a candidate, matching
    /// the original's unconditional `DT_REG` scan rather than filtering by
    /// extension.
    pub fn reload(&mut self, dir: &Path) {
        self.rules.clear();
        let Ok(read_dir) = std::fs::read_dir(dir) else { return };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else { continue };
            match parse_sink_input_rule(&text) {
                Some(rule) => {
                    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("rule").to_string();
                    self.rules.push((name, rule));
                }
                None => warn!("sink-input rule {path:?} has no target_key/target_value, ignoring"),
            }
        }
        debug!("reloaded {} sink-input rule files", self.rules.len());
    }

    /// Evaluate every rule file against one stream's proplist, applying the
    /// target key/value for every file whose three-state machine lands on
    /// `Hit`.
    pub fn apply(&self, client_name: Option<&str>, proplist: &mut HashMap<String, String>) {
        for (name, rule) in &self.rules {
            if let Some(restrict) = &rule.client_name {
                if client_name != Some(restrict.as_str()) {
                    continue;
                }
            }

            let mut state = MatchState::Undefined;
            for section in &rule.matches {
                let Some(value) = proplist.get(&section.prop_key) else {
                    state = MatchState::Miss;
                    break;
                };
                match Regex::new(&section.prop_value_regex) {
                    Ok(re) if re.is_match(value) => {
                        if state != MatchState::Miss {
                            state = MatchState::Hit;
                        }
                    }
                    Ok(_) => {
                        state = MatchState::Miss;
                        break;
                    }
                    Err(e) => {
                        warn!("rule '{name}': invalid regex '{}': {e}", section.prop_value_regex);
                        state = MatchState::Miss;
                        break;
                    }
                }
            }

            if state == MatchState::Hit {
                proplist.insert(rule.target_key.clone(), rule.target_value.clone());
            }
        }
    }
}

impl Default for SinkInputRuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn invalid_binary_names_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut cache = RuleCache::new(dir.path().to_path_buf(), dir.path().to_path_buf());
        let mut props = HashMap::new();
        cache.lookup_and_merge(".hidden", &mut props);
        cache.lookup_and_merge("has/slash", &mut props);
        assert!(props.is_empty());
    }

    #[test]
    fn merge_policy_does_not_overwrite_existing_role() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("firefox.conf"), "[Desktop Entry]\nCategories=Game;\n").unwrap();
        let mut cache = RuleCache::new(dir.path().to_path_buf(), dir.path().to_path_buf());

        let mut props = HashMap::new();
        props.insert("MEDIA_ROLE".to_string(), "video".to_string());
        cache.lookup_and_merge("firefox", &mut props);
        assert_eq!(props.get("MEDIA_ROLE"), Some(&"video".to_string()));
    }

    #[test]
    fn categories_map_game_and_telephony_to_roles() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("mplayer.conf"), "[Desktop Entry]\nCategories=AudioVideo;Game;\n").unwrap();
        let mut cache = RuleCache::new(dir.path().to_path_buf(), dir.path().to_path_buf());
        let mut props = HashMap::new();
        cache.lookup_and_merge("mplayer", &mut props);
        assert_eq!(props.get("MEDIA_ROLE"), Some(&"game".to_string()));

        let dir2 = TempDir::new().unwrap();
        std::fs::write(dir2.path().join("sip.conf"), "[Desktop Entry]\nCategories=Telephony;\n").unwrap();
        let mut cache2 = RuleCache::new(dir2.path().to_path_buf(), dir2.path().to_path_buf());
        let mut props2 = HashMap::new();
        cache2.lookup_and_merge("sip", &mut props2);
        assert_eq!(props2.get("MEDIA_ROLE"), Some(&"phone".to_string()));
    }

    #[test]
    fn type_mismatch_rejects_the_whole_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("daemon.conf"), "[Desktop Entry]\nType=Service\nName=Daemon\n").unwrap();
        let mut cache = RuleCache::new(dir.path().to_path_buf(), dir.path().to_path_buf());
        let mut props = HashMap::new();
        props.insert("APPLICATION_NAME".to_string(), "daemon".to_string());
        cache.lookup_and_merge("daemon", &mut props);
        assert_eq!(props.get("APPLICATION_NAME"), Some(&"daemon".to_string()));
    }

    #[test]
    fn application_name_overwritten_only_when_equal_to_binary() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("firefox.conf"), "[Desktop Entry]\nName=Firefox\n").unwrap();
        let mut cache = RuleCache::new(dir.path().to_path_buf(), dir.path().to_path_buf());

        let mut props = HashMap::new();
        props.insert("APPLICATION_NAME".to_string(), "firefox".to_string());
        cache.lookup_and_merge("firefox", &mut props);
        assert_eq!(props.get("APPLICATION_NAME"), Some(&"Firefox".to_string()));

        let mut props2 = HashMap::new();
        props2.insert("APPLICATION_NAME".to_string(), "custom title".to_string());
        cache.lookup_and_merge("firefox", &mut props2);
        assert_eq!(props2.get("APPLICATION_NAME"), Some(&"custom title".to_string()));
    }

    #[test]
    fn cache_evicts_when_over_capacity() {
        let dir = TempDir::new().unwrap();
        let mut cache = RuleCache::new(dir.path().to_path_buf(), dir.path().to_path_buf()).with_capacity(2);
        let mut props = HashMap::new();
        cache.lookup_and_merge("a", &mut props);
        cache.lookup_and_merge("b", &mut props);
        cache.lookup_and_merge("c", &mut props);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn sink_input_rule_hits_only_when_every_section_matches() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("nav"),
            "[result]\ntarget_key = MEDIA_ROLE\ntarget_value = navigator\n\n[match1]\nprop_key = APPLICATION_NAME\nprop_value = ^Maps$\n",
        )
        .unwrap();
        let mut engine = SinkInputRuleEngine::new();
        engine.reload(dir.path());

        let mut hit = HashMap::new();
        hit.insert("APPLICATION_NAME".to_string(), "Maps".to_string());
        engine.apply(None, &mut hit);
        assert_eq!(hit.get("MEDIA_ROLE"), Some(&"navigator".to_string()));

        let mut miss = HashMap::new();
        miss.insert("APPLICATION_NAME".to_string(), "Browser".to_string());
        engine.apply(None, &mut miss);
        assert!(!miss.contains_key("MEDIA_ROLE"));
    }

    #[test]
    fn sink_input_rule_respects_client_name_restriction() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("restricted"),
            "[result]\ntarget_key = MEDIA_ROLE\ntarget_value = game\n\n[general]\nclient_name = steam\n",
        )
        .unwrap();
        let mut engine = SinkInputRuleEngine::new();
        engine.reload(dir.path());

        let mut props = HashMap::new();
        engine.apply(Some("other"), &mut props);
        assert!(!props.contains_key("MEDIA_ROLE"));

        // client_name only gates eligibility; a rule with no [matchN]
        // sections never reaches MatchState::Hit, so it still doesn't
        // apply even once the client_name restriction is satisfied.
        let mut props2 = HashMap::new();
        engine.apply(Some("steam"), &mut props2);
        assert!(!props2.contains_key("MEDIA_ROLE"));
    }

    #[test]
    fn sink_input_rule_with_client_name_restriction_applies_once_matched() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("restricted"),
            "[result]\ntarget_key = MEDIA_ROLE\ntarget_value = game\n\n[general]\nclient_name = steam\n\n[match1]\nprop_key = APPLICATION_NAME\nprop_value = ^Steam$\n",
        )
        .unwrap();
        let mut engine = SinkInputRuleEngine::new();
        engine.reload(dir.path());

        let mut wrong_client = HashMap::new();
        wrong_client.insert("APPLICATION_NAME".to_string(), "Steam".to_string());
        engine.apply(Some("other"), &mut wrong_client);
        assert!(!wrong_client.contains_key("MEDIA_ROLE"));

        let mut matched = HashMap::new();
        matched.insert("APPLICATION_NAME".to_string(), "Steam".to_string());
        engine.apply(Some("steam"), &mut matched);
        assert_eq!(matched.get("MEDIA_ROLE"), Some(&"game".to_string()));
    }

    #[test]
    fn rule_file_without_result_section_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("incomplete"), "[match1]\nprop_key = FOO\nprop_value = bar\n").unwrap();
        let mut engine = SinkInputRuleEngine::new();
        engine.reload(dir.path());
        assert!(engine.rules.is_empty());
    }
}
