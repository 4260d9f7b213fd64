//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::CardUid;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_client_id() -> String {
    "locknode".to_string()
}

fn default_keepalive_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_topic_prefix")]
    pub prefix: String,
}

fn default_topic_prefix() -> String {
    "casa/tranca".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self { prefix: default_topic_prefix() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationConfig {
    /// Allowed card UIDs as 8-char uppercase hex strings
    #[serde(default)]
    pub allow_list: Vec<String>,
    /// An empty allow_list grants every card when true
    #[serde(default = "default_allow_all_when_empty")]
    pub allow_all_when_empty: bool,
}

fn default_allow_all_when_empty() -> bool {
    true
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self { allow_list: Vec::new(), allow_all_when_empty: default_allow_all_when_empty() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProximityConfig {
    #[serde(default = "default_t_near_cm")]
    pub t_near_cm: f64,
    #[serde(default = "default_t_far_cm")]
    pub t_far_cm: f64,
    #[serde(default = "default_hysteresis_cm")]
    pub hysteresis_cm: f64,
    #[serde(default = "default_proximity_enabled")]
    pub enabled: bool,
}

fn default_t_near_cm() -> f64 {
    5.0
}

fn default_t_far_cm() -> f64 {
    12.0
}

fn default_hysteresis_cm() -> f64 {
    1.0
}

fn default_proximity_enabled() -> bool {
    true
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            t_near_cm: default_t_near_cm(),
            t_far_cm: default_t_far_cm(),
            hysteresis_cm: default_hysteresis_cm(),
            enabled: default_proximity_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuationConfig {
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_pulse_ms() -> u64 {
    3000
}

fn default_debounce_ms() -> u64 {
    1500
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self { pulse_ms: default_pulse_ms(), debounce_ms: default_debounce_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { reconnect_backoff_ms: default_reconnect_backoff_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub actuation: ActuationConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

/// Fully-resolved topic names derived from the configured prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    pub rfid: String,
    pub status: String,
    pub event: String,
    pub cmd: String,
    pub sensor: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            rfid: format!("{prefix}/rfid"),
            status: format!("{prefix}/status"),
            event: format!("{prefix}/evento"),
            cmd: format!("{prefix}/cmd"),
            sensor: format!("{prefix}/sensor"),
        }
    }

    /// The fixed set the bus client subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.cmd.clone(), self.sensor.clone()]
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_keepalive_secs: u64,
    topic_prefix: String,
    allow_list: Vec<String>,
    allow_all_when_empty: bool,
    t_near_cm: f64,
    t_far_cm: f64,
    hysteresis_cm: f64,
    proximity_enabled: bool,
    pulse_ms: u64,
    debounce_ms: u64,
    reconnect_backoff_ms: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: default_client_id(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_keepalive_secs: default_keepalive_secs(),
            topic_prefix: default_topic_prefix(),
            allow_list: Vec::new(),
            allow_all_when_empty: true,
            t_near_cm: default_t_near_cm(),
            t_far_cm: default_t_far_cm(),
            hysteresis_cm: default_hysteresis_cm(),
            proximity_enabled: default_proximity_enabled(),
            pulse_ms: default_pulse_ms(),
            debounce_ms: default_debounce_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_keepalive_secs: toml_config.mqtt.keepalive_secs,
            topic_prefix: toml_config.topics.prefix,
            allow_list: toml_config.authorization.allow_list,
            allow_all_when_empty: toml_config.authorization.allow_all_when_empty,
            t_near_cm: toml_config.proximity.t_near_cm,
            t_far_cm: toml_config.proximity.t_far_cm,
            hysteresis_cm: toml_config.proximity.hysteresis_cm,
            proximity_enabled: toml_config.proximity.enabled,
            pulse_ms: toml_config.actuation.pulse_ms,
            debounce_ms: toml_config.actuation.debounce_ms,
            reconnect_backoff_ms: toml_config.bus.reconnect_backoff_ms,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load from a specific path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_credentials(&self) -> Option<(String, String)> {
        match (&self.mqtt_username, &self.mqtt_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.topic_prefix)
    }

    /// Parsed allow-list. Entries that are not valid 4-byte hex UIDs are
    /// dropped with a warning rather than aborting startup.
    pub fn allow_list(&self) -> Vec<CardUid> {
        self.allow_list
            .iter()
            .filter_map(|entry| match CardUid::parse_hex(entry) {
                Some(uid) => Some(uid),
                None => {
                    warn!(entry, "allow_list_entry_invalid");
                    None
                }
            })
            .collect()
    }

    pub fn allow_all_when_empty(&self) -> bool {
        self.allow_all_when_empty
    }

    pub fn t_near_cm(&self) -> f64 {
        self.t_near_cm
    }

    pub fn t_far_cm(&self) -> f64 {
        self.t_far_cm
    }

    pub fn hysteresis_cm(&self) -> f64 {
        self.hysteresis_cm
    }

    pub fn proximity_enabled(&self) -> bool {
        self.proximity_enabled
    }

    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_ms
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the allow-list
    #[cfg(test)]
    pub fn with_allow_list(mut self, entries: &[&str]) -> Self {
        self.allow_list = entries.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.topic_prefix(), "casa/tranca");
        assert_eq!(config.debounce_ms(), 1500);
        assert_eq!(config.pulse(), Duration::from_millis(3000));
        assert!(config.allow_all_when_empty());
        assert!(config.allow_list().is_empty());
    }

    #[test]
    fn test_topics_from_prefix() {
        let topics = Topics::new("casa/tranca");
        assert_eq!(topics.rfid, "casa/tranca/rfid");
        assert_eq!(topics.status, "casa/tranca/status");
        assert_eq!(topics.event, "casa/tranca/evento");
        assert_eq!(topics.cmd, "casa/tranca/cmd");
        assert_eq!(topics.sensor, "casa/tranca/sensor");
        assert_eq!(topics.subscriptions(), vec!["casa/tranca/cmd", "casa/tranca/sensor"]);
    }

    #[test]
    fn test_allow_list_parses_hex_uids() {
        let config = Config::default().with_allow_list(&["AABBCCDD", "00112233"]);
        let uids = config.allow_list();
        assert_eq!(uids.len(), 2);
        assert_eq!(uids[0].to_string(), "AABBCCDD");
    }

    #[test]
    fn test_allow_list_drops_invalid_entries() {
        let config = Config::default().with_allow_list(&["AABBCCDD", "nothex", "AB"]);
        assert_eq!(config.allow_list().len(), 1);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["locknode".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["locknode".to_string(), "--config".to_string(), "config/site.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/site.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["locknode".to_string(), "--config=config/site.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/site.toml");
    }
}
