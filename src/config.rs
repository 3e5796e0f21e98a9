//! Configuration for calculation-member

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::stream::{BackoffConfig, ManagerConfig, MonitorConfig};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "CALC_MEMBER_";

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("calculation-member")
        .join("config.toml")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Platform event stream endpoint
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,

    /// Source URI stamped on outbound envelopes (generated if unset)
    #[serde(default)]
    pub source: Option<String>,

    /// Capability tags announced in the join
    #[serde(default)]
    pub tags: Vec<String>,

    /// Transport connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long to wait for the greet after joining
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Failed attempts after which reconnecting stops
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Maximum tracked unacknowledged events
    #[serde(default = "default_sent_cache_max_size")]
    pub sent_cache_max_size: usize,

    #[serde(default = "default_sent_cache_ttl_secs")]
    pub sent_cache_ttl_secs: u64,

    #[serde(default = "default_monitor_initial_delay_ms")]
    pub monitor_initial_delay_ms: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Keep-alive silence that triggers a warning
    #[serde(default = "default_keep_alive_warning_threshold_ms")]
    pub keep_alive_warning_threshold_ms: u64,

    /// Inbound envelopes handled concurrently
    #[serde(default = "default_max_concurrent_dispatch")]
    pub max_concurrent_dispatch: usize,
}

fn default_endpoint_url() -> String {
    "ws://localhost:9090/events".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_initial_delay_ms() -> u64 {
    200
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_sent_cache_max_size() -> usize {
    100
}

fn default_sent_cache_ttl_secs() -> u64 {
    300
}

fn default_monitor_initial_delay_ms() -> u64 {
    1_000
}

fn default_monitor_interval_ms() -> u64 {
    3_000
}

fn default_keep_alive_warning_threshold_ms() -> u64 {
    60_000
}

fn default_max_concurrent_dispatch() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            source: None,
            tags: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            sent_cache_max_size: default_sent_cache_max_size(),
            sent_cache_ttl_secs: default_sent_cache_ttl_secs(),
            monitor_initial_delay_ms: default_monitor_initial_delay_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            keep_alive_warning_threshold_ms: default_keep_alive_warning_threshold_ms(),
            max_concurrent_dispatch: default_max_concurrent_dispatch(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ClientError::Config(format!("Invalid config file: {}", e)))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ClientError::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override fields from `CALC_MEMBER_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from `lookup`, keyed by full variable name.
    ///
    /// Values that fail to parse are ignored and the current value kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(val) = var("ENDPOINT_URL") {
            self.endpoint_url = val;
        }
        if let Some(val) = var("SOURCE") {
            self.source = Some(val);
        }
        if let Some(val) = var("TAGS") {
            self.tags = val
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        parse_into(var("CONNECT_TIMEOUT_MS"), &mut self.connect_timeout_ms);
        parse_into(var("HANDSHAKE_TIMEOUT_MS"), &mut self.handshake_timeout_ms);
        parse_into(var("RECONNECT_INITIAL_DELAY_MS"), &mut self.reconnect_initial_delay_ms);
        parse_into(var("RECONNECT_MAX_DELAY_MS"), &mut self.reconnect_max_delay_ms);
        parse_into(var("RECONNECT_MAX_ATTEMPTS"), &mut self.reconnect_max_attempts);
        parse_into(var("SENT_CACHE_MAX_SIZE"), &mut self.sent_cache_max_size);
        parse_into(var("SENT_CACHE_TTL_SECS"), &mut self.sent_cache_ttl_secs);
        parse_into(var("MONITOR_INITIAL_DELAY_MS"), &mut self.monitor_initial_delay_ms);
        parse_into(var("MONITOR_INTERVAL_MS"), &mut self.monitor_interval_ms);
        parse_into(
            var("KEEP_ALIVE_WARNING_THRESHOLD_MS"),
            &mut self.keep_alive_warning_threshold_ms,
        );
        parse_into(var("MAX_CONCURRENT_DISPATCH"), &mut self.max_concurrent_dispatch);
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint_url.starts_with("ws://") || self.endpoint_url.starts_with("wss://")) {
            return Err(ClientError::Config(format!(
                "endpoint_url must be a ws:// or wss:// URL, got {}",
                self.endpoint_url
            )));
        }
        if self.reconnect_initial_delay_ms > self.reconnect_max_delay_ms {
            return Err(ClientError::Config(
                "reconnect_initial_delay_ms exceeds reconnect_max_delay_ms".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ClientError::Config("handshake_timeout_ms must be positive".into()));
        }
        if self.sent_cache_max_size == 0 {
            return Err(ClientError::Config("sent_cache_max_size must be positive".into()));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ClientError::Config("monitor_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            sent_cache_max_size: self.sent_cache_max_size,
            sent_cache_ttl: Duration::from_secs(self.sent_cache_ttl_secs),
            initial_delay: Duration::from_millis(self.monitor_initial_delay_ms),
            interval: Duration::from_millis(self.monitor_interval_ms),
            keep_alive_warning_threshold: Duration::from_millis(self.keep_alive_warning_threshold_ms),
            ..MonitorConfig::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            source: self.source.clone().unwrap_or(defaults.source),
            tags: self.tags.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_concurrent_dispatch: self.max_concurrent_dispatch,
            backoff: self.backoff_config(),
            monitor: self.monitor_config(),
        }
    }
}

fn parse_into<T: FromStr>(value: Option<String>, target: &mut T) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse::<T>().ok()) {
        *target = parsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.reconnect_max_attempts, 10);

        let manager = config.manager_config();
        assert!(manager.source.starts_with("urn:calculation-member:"));
        assert_eq!(manager.backoff.initial_delay, Duration::from_millis(200));
        assert_eq!(manager.backoff.max_delay, Duration::from_millis(10_000));
        assert_eq!(manager.monitor.sent_cache_ttl, Duration::from_secs(300));
        assert_eq!(manager.monitor.keep_alive_warning_threshold, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            endpoint_url = "wss://dispatch.example.com/events"
            tags = ["pricing", "risk"]
            reconnect_max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint_url, "wss://dispatch.example.com/events");
        assert_eq!(config.tags, vec!["pricing", "risk"]);
        assert_eq!(config.reconnect_max_attempts, 3);
        assert_eq!(config.monitor_interval_ms, 3000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            source: Some("urn:calculation-member:node-a".into()),
            handshake_timeout_ms: 2500,
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "handshake_timeout_ms = \"soon\"").unwrap();

        assert!(matches!(Config::load(&path), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CALC_MEMBER_ENDPOINT_URL", "ws://10.0.0.5:9090/events"),
            ("CALC_MEMBER_TAGS", "pricing, risk,,"),
            ("CALC_MEMBER_HANDSHAKE_TIMEOUT_MS", "750"),
            ("CALC_MEMBER_RECONNECT_MAX_ATTEMPTS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.endpoint_url, "ws://10.0.0.5:9090/events");
        assert_eq!(config.tags, vec!["pricing", "risk"]);
        assert_eq!(config.handshake_timeout_ms, 750);
        assert_eq!(config.reconnect_max_attempts, 10);
    }

    #[test]
    fn test_validate() {
        let bad_url = Config {
            endpoint_url: "http://localhost".into(),
            ..Default::default()
        };
        assert!(bad_url.validate().is_err());

        let inverted = Config {
            reconnect_initial_delay_ms: 20_000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
