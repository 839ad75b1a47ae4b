//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument (parsed by clap in main)
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/sprint-gate.toml
//!
//! Notification credentials have no default. They come from the file or from
//! the SPRINT_GATE_PUSHOVER_USER / SPRINT_GATE_PUSHOVER_TOKEN environment
//! variables, which take precedence.

use crate::domain::types::{Distance, Lane};
use crate::services::decoder::{ClassRule, ClassificationTable};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const ENV_PUSHOVER_USER: &str = "SPRINT_GATE_PUSHOVER_USER";
pub const ENV_PUSHOVER_TOKEN: &str = "SPRINT_GATE_PUSHOVER_TOKEN";

const DEFAULT_CONFIG_PATH: &str = "config/sprint-gate.toml";
const DEFAULT_PUSHOVER_URL: &str = "https://api.pushover.net/1/messages.json";

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// "20", "40" or any other value as a custom distance in metres
    #[serde(default = "default_distance")]
    pub distance: String,
    #[serde(default = "default_auto_reset")]
    pub auto_reset: bool,
    #[serde(default = "default_lane")]
    pub lane: u8,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { distance: default_distance(), auto_reset: default_auto_reset(), lane: default_lane() }
    }
}

fn default_distance() -> String {
    "20".to_string()
}

fn default_auto_reset() -> bool {
    true
}

fn default_lane() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub user_key: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_notify_queue_size")]
    pub queue_size: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_key: None,
            api_token: None,
            api_url: default_api_url(),
            timeout_ms: default_notify_timeout_ms(),
            queue_size: default_notify_queue_size(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_PUSHOVER_URL.to_string()
}

fn default_notify_timeout_ms() -> u64 {
    5000
}

fn default_notify_queue_size() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct BleConfig {
    /// Advertised-name keywords that rank a device as a likely timing hub
    #[serde(default = "default_name_keywords")]
    pub name_keywords: Vec<String>,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self { name_keywords: default_name_keywords(), scan_timeout_secs: default_scan_timeout_secs() }
    }
}

fn default_name_keywords() -> Vec<String> {
    ["smart", "hub", "speed", "veld", "fusion", "gate"].iter().map(|s| s.to_string()).collect()
}

fn default_scan_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DecoderConfig {
    /// Replaces the built-in marker table when non-empty
    #[serde(default)]
    pub rules: Vec<ClassRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { event_queue_size: default_event_queue_size(), event_buffer: default_event_buffer() }
    }
}

fn default_event_queue_size() -> usize {
    256
}

fn default_event_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub ble: BleConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    distance: Distance,
    auto_reset: bool,
    lane: Lane,
    notifications_enabled: bool,
    pushover_user_key: Option<String>,
    pushover_api_token: Option<String>,
    pushover_api_url: String,
    notify_timeout_ms: u64,
    notify_queue_size: usize,
    name_keywords: Vec<String>,
    scan_timeout_secs: u64,
    classification: ClassificationTable,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    event_queue_size: usize,
    event_buffer: usize,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_sections(TomlConfig::default(), ClassificationTable::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(mut toml_config: TomlConfig, config_file: String) -> anyhow::Result<Self> {
        let rules = std::mem::take(&mut toml_config.decoder.rules);
        let classification = if rules.is_empty() {
            ClassificationTable::default()
        } else {
            ClassificationTable::from_rules(rules)?
        };
        Ok(Self::from_sections(toml_config, classification, config_file))
    }

    fn from_sections(
        toml_config: TomlConfig,
        classification: ClassificationTable,
        config_file: String,
    ) -> Self {
        Self {
            distance: Distance::from_input(&toml_config.timing.distance),
            auto_reset: toml_config.timing.auto_reset,
            lane: Lane(toml_config.timing.lane),
            notifications_enabled: toml_config.notifications.enabled,
            pushover_user_key: non_empty(toml_config.notifications.user_key),
            pushover_api_token: non_empty(toml_config.notifications.api_token),
            pushover_api_url: toml_config.notifications.api_url,
            notify_timeout_ms: toml_config.notifications.timeout_ms,
            notify_queue_size: toml_config.notifications.queue_size.max(1),
            name_keywords: toml_config.ble.name_keywords,
            scan_timeout_secs: toml_config.ble.scan_timeout_secs,
            classification,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            prometheus_port: toml_config.metrics.prometheus_port,
            event_queue_size: toml_config.engine.event_queue_size.max(1),
            event_buffer: toml_config.engine.event_buffer.max(16),
            config_file,
        }
    }

    /// Determine the config file path: explicit `--config` value, then
    /// `CONFIG_FILE`, then the default location
    pub fn resolve_config_path(cli_path: Option<String>) -> String {
        if let Some(path) = cli_path {
            return path;
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load configuration from a path, falling back to defaults on error.
    /// Credential environment variables are applied either way.
    pub fn load_from_path(path: &str) -> Self {
        let config = match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path, error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        };
        config.with_env_credentials()
    }

    fn with_env_credentials(mut self) -> Self {
        if let Some(user) = non_empty(env::var(ENV_PUSHOVER_USER).ok()) {
            self.pushover_user_key = Some(user);
        }
        if let Some(token) = non_empty(env::var(ENV_PUSHOVER_TOKEN).ok()) {
            self.pushover_api_token = Some(token);
        }
        self
    }

    pub fn distance(&self) -> &Distance {
        &self.distance
    }

    pub fn auto_reset(&self) -> bool {
        self.auto_reset
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled
    }

    pub fn pushover_user_key(&self) -> Option<&str> {
        self.pushover_user_key.as_deref()
    }

    pub fn pushover_api_token(&self) -> Option<&str> {
        self.pushover_api_token.as_deref()
    }

    pub fn pushover_api_url(&self) -> &str {
        &self.pushover_api_url
    }

    pub fn notify_timeout_ms(&self) -> u64 {
        self.notify_timeout_ms
    }

    pub fn notify_queue_size(&self) -> usize {
        self.notify_queue_size
    }

    pub fn name_keywords(&self) -> &[String] {
        &self.name_keywords
    }

    pub fn scan_timeout_secs(&self) -> u64 {
        self.scan_timeout_secs
    }

    pub fn classification(&self) -> &ClassificationTable {
        &self.classification
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn event_queue_size(&self) -> usize {
        self.event_queue_size
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
