//! Daemon configuration loaded from TOML.

use std::path::PathBuf;
use std::time::Duration;

use dinput_input::{HubConfig, VIRTUAL_DEVICE_NAME_MARKER};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub injector: InjectorConfig,
    #[serde(default)]
    pub whitelist: WhiteListConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Identifier of this machine towards its peers.
    #[serde(default = "default_network_id")]
    pub network_id: String,
    /// Depth of the channels between the workers and the event loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            network_id: default_network_id(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Device capture settings, converted into a [`HubConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    /// Most events handed over per collection call.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_virtual_device_marker")]
    pub virtual_device_marker: String,
    /// Case-insensitive name fragments that identify a touchpad.
    #[serde(default = "default_touchpad_patterns")]
    pub touchpad_patterns: Vec<String>,
    #[serde(default = "default_key_state_retries")]
    pub key_state_retries: u32,
    #[serde(default = "default_key_state_retry_interval_ms")]
    pub key_state_retry_interval_ms: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            device_dir: default_device_dir(),
            event_buffer_size: default_event_buffer_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            virtual_device_marker: default_virtual_device_marker(),
            touchpad_patterns: default_touchpad_patterns(),
            key_state_retries: default_key_state_retries(),
            key_state_retry_interval_ms: default_key_state_retry_interval_ms(),
        }
    }
}

impl HubSection {
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            device_dir: self.device_dir.clone(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            virtual_device_marker: self.virtual_device_marker.clone(),
            touchpad_patterns: self.touchpad_patterns.clone(),
            key_state_retries: self.key_state_retries,
            key_state_retry_interval: Duration::from_millis(self.key_state_retry_interval_ms),
        }
    }
}

/// Virtual device injection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Key combinations that stay on this machine even while a keyboard is
/// shared. Each entry lists evdev key codes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhiteListConfig {
    #[serde(default)]
    pub combinations: Vec<Vec<u16>>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "dinput".to_string())
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/input")
}

fn default_event_buffer_size() -> usize {
    512
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_virtual_device_marker() -> String {
    VIRTUAL_DEVICE_NAME_MARKER.to_string()
}

fn default_touchpad_patterns() -> Vec<String> {
    vec!["touchpad".to_string()]
}

fn default_key_state_retries() -> u32 {
    5
}

fn default_key_state_retry_interval_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}
