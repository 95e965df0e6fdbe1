// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Daemon configuration: routing group/class tables, null sink name,
//! Audio Manager bus names, augment rule directories, and combine sink
//! defaults, loaded from a TOML file.
//!
//! Uses the same load/save/default-on-missing `ConfigManager` pattern
//! over `directories::ProjectDirs` as the rest of this crate's persisted
//! state.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("no config directory could be determined for this platform")]
    NoConfigDir,
}

fn default_null_sink_name() -> String {
    "soundrouter.null".to_string()
}

fn default_adjust_time() -> u64 {
    10
}

fn default_resample_method() -> String {
    "speex-float-3".to_string()
}

fn default_rate() -> u32 {
    48_000
}

fn default_channels() -> u32 {
    2
}

fn default_fade_out_ms() -> u64 {
    200
}

fn default_fade_in_ms() -> u64 {
    1_000
}

fn default_chmin() -> u32 {
    1
}

fn default_chmax() -> u32 {
    2
}

/// Combine sink creation arguments: which slave sinks to fan out to, the
/// rate-adjustment period, and the resampler used to match slave rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombineConfig {
    #[serde(default)]
    pub sink_name: Option<String>,
    #[serde(default)]
    pub slaves: Vec<String>,
    #[serde(default = "default_adjust_time")]
    pub adjust_time_secs: u64,
    #[serde(default = "default_resample_method")]
    pub resample_method: String,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
    #[serde(default)]
    pub channel_map: Option<String>,
}

impl Default for CombineConfig {
    fn default() -> Self {
        CombineConfig {
            sink_name: None,
            slaves: Vec::new(),
            adjust_time_secs: default_adjust_time(),
            resample_method: default_resample_method(),
            rate: default_rate(),
            channels: default_channels(),
            channel_map: None,
        }
    }
}

/// Audio Manager bridge wiring: bus names/paths on both sides of the
/// D-Bus connection, the domain name registered with the Audio Manager,
/// and the null sink used to park unrouted streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_null_sink_name")]
    pub null_sink_name: String,
    #[serde(default = "default_bridge_bus_name")]
    pub dbus_bridge_name: String,
    #[serde(default = "default_bridge_path")]
    pub dbus_bridge_path: String,
    #[serde(default = "default_am_bus_name")]
    pub dbus_audiomgr_name: String,
    #[serde(default = "default_am_path")]
    pub dbus_audiomgr_path: String,
    #[serde(default = "default_domain_name")]
    pub domain_name: String,
}

fn default_bridge_bus_name() -> String {
    soundrouter_ipc::BRIDGE_BUS_NAME.to_string()
}
fn default_bridge_path() -> String {
    soundrouter_ipc::BRIDGE_PATH.to_string()
}
fn default_am_bus_name() -> String {
    soundrouter_ipc::AM_BUS_NAME.to_string()
}
fn default_am_path() -> String {
    soundrouter_ipc::AM_ROUTING_PATH.to_string()
}
fn default_domain_name() -> String {
    "soundrouter".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            null_sink_name: default_null_sink_name(),
            dbus_bridge_name: default_bridge_bus_name(),
            dbus_bridge_path: default_bridge_path(),
            dbus_audiomgr_name: default_am_bus_name(),
            dbus_audiomgr_path: default_am_path(),
            domain_name: default_domain_name(),
        }
    }
}

/// Admissible channel-count range for sink/source admission, and whether
/// only the system-default sink/source should be tracked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_chmin")]
    pub chmin: u32,
    #[serde(default = "default_chmax")]
    pub chmax: u32,
    #[serde(default = "default_true")]
    pub selected_only: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig { chmin: default_chmin(), chmax: default_chmax(), selected_only: true }
    }
}

/// Fade bounds for the volume engine's ramped attenuation application:
/// clamped to `0..10s`, defaulting to `200ms` out / `1s` in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeFadeConfig {
    #[serde(default = "default_fade_out_ms")]
    pub fade_out_ms: u64,
    #[serde(default = "default_fade_in_ms")]
    pub fade_in_ms: u64,
}

impl Default for VolumeFadeConfig {
    fn default() -> Self {
        let mut v = VolumeFadeConfig { fade_out_ms: default_fade_out_ms(), fade_in_ms: default_fade_in_ms() };
        v.clamp();
        v
    }
}

impl VolumeFadeConfig {
    pub fn clamp(&mut self) {
        self.fade_out_ms = self.fade_out_ms.min(10_000);
        self.fade_in_ms = self.fade_in_ms.min(10_000);
    }
}

/// Property-augment module directories: where client property-override
/// rules, desktop-file role hints, and sink-input matching rules live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentConfig {
    pub client_rules_dir: PathBuf,
    pub desktop_dir: PathBuf,
    pub sink_input_rules_dir: PathBuf,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_cache_size() -> usize {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub combine: CombineConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub volume_fade: VolumeFadeConfig,
    pub augment: Option<AugmentConfig>,
}

impl DaemonConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Loads/saves [`DaemonConfig`] under the platform config directory:
/// missing file falls back to `Default`, the directory is created eagerly
/// so later saves don't race.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("org", "genivi", "soundrouter")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        fs::create_dir_all(&config_dir)?;
        debug!("config directory: {config_dir:?}");
        Ok(ConfigManager { config_dir })
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join("soundrouter.toml")
    }

    pub fn load(&self) -> Result<DaemonConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("no config found at {path:?}, using defaults");
            return Ok(self.with_default_augment_dirs());
        }
        let content = fs::read_to_string(&path)?;
        let mut config = DaemonConfig::from_toml(&content)?;
        if config.augment.is_none() {
            config.augment = self.with_default_augment_dirs().augment;
        }
        info!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn save(&self, config: &DaemonConfig) -> Result<(), ConfigError> {
        let path = self.config_path();
        let content = config.to_toml()?;
        fs::write(&path, content)?;
        debug!("saved config to {path:?}");
        Ok(())
    }

    fn with_default_augment_dirs(&self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.augment = Some(AugmentConfig {
            client_rules_dir: self.config_dir.join("rules"),
            desktop_dir: self.config_dir.join("desktop"),
            sink_input_rules_dir: self.config_dir.join("sink-input-rules"),
            cache_size: default_cache_size(),
        });
        if let Some(augment) = &config.augment {
            for dir in [&augment.client_rules_dir, &augment.desktop_dir, &augment.sink_input_rules_dir] {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!("failed to create augment directory {dir:?}: {e}");
                }
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = DaemonConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = DaemonConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.combine.rate, config.combine.rate);
        assert_eq!(parsed.bridge.null_sink_name, config.bridge.null_sink_name);
    }

    #[test]
    fn fade_bounds_are_clamped_to_ten_seconds() {
        let mut fade = VolumeFadeConfig { fade_out_ms: 99_999, fade_in_ms: 50 };
        fade.clamp();
        assert_eq!(fade.fade_out_ms, 10_000);
        assert_eq!(fade.fade_in_ms, 50);
    }

    #[test]
    fn missing_section_falls_back_to_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config.discovery.chmin, 1);
        assert_eq!(config.discovery.chmax, 2);
        assert!(config.discovery.selected_only);
    }
}
