//! Application configuration.
//!
//! One `Config` resolved at startup and passed explicitly to each component.
//! Loaded from YAML files and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use backon::ConstantBuilder;
use serde::Deserialize;

use crate::utils::retry::fixed_backoff;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LOGBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LOGBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LOGBUS_LOG";
/// Environment variable for the broker URL.
pub const BROKER_ADDR_ENV_VAR: &str = "RABBITMQ_ADDR";
/// Environment variable overriding the receiver's host name.
pub const RECEIVER_HOST_ENV_VAR: &str = "RECEIVER_HOST";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid peer address '{0}': expected host:port")]
    PeerAddress(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection and topic.
    pub broker: BrokerConfig,
    /// Log monitor (subscriber + read endpoint).
    pub monitor: MonitorConfig,
    /// Progress line emitter.
    pub emitter: EmitterConfig,
    /// Line receiver.
    pub receiver: ReceiverConfig,
}

/// Broker configuration shared by every component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Topic (exchange) that carries log lines.
    pub topic: String,
    /// Routing key stamped on published lines.
    pub routing_key: String,
    /// Fixed delay between connection attempts.
    pub connect_retry_ms: u64,
    /// Bound on a single publish.
    pub publish_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            topic: "log".to_string(),
            routing_key: String::new(),
            connect_retry_ms: 2000,
            publish_timeout_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn connect_backoff(&self) -> ConstantBuilder {
        fixed_backoff(Duration::from_millis(self.connect_retry_ms))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Monitor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Port for the read endpoint.
    pub port: u16,
    /// Named durable queue. When unset, an exclusive auto-deleted queue is used.
    pub queue: Option<String>,
    /// Binding pattern for the receiving queue.
    pub routing_pattern: String,
    /// Reopen the subscription when its stream ends.
    pub reconnect: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            port: 8087,
            queue: None,
            routing_pattern: crate::bus::MATCH_ALL.to_string(),
            reconnect: false,
        }
    }
}

/// Emitter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Receiver address as host:port.
    pub peer: String,
    /// Number of numbered lines before STOP.
    pub count: u32,
    /// Pause after each line.
    pub interval_ms: u64,
    /// Local log file.
    pub log_path: PathBuf,
    /// Mirror lines onto the bus.
    pub publish: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            peer: "service2:8000".to_string(),
            count: 20,
            interval_ms: 2000,
            log_path: PathBuf::from("logs/service1.log"),
            publish: true,
        }
    }
}

impl EmitterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Replace the host part of `peer`, keeping its port.
    pub fn override_peer_host(&mut self, host: &str) -> Result<(), ConfigError> {
        let (_, port) = self
            .peer
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::PeerAddress(self.peer.clone()))?;
        self.peer = format!("{}:{}", host, port);
        Ok(())
    }
}

/// Receiver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Port for the POST endpoint.
    pub port: u16,
    /// Local log file.
    pub log_path: PathBuf,
    /// Wait before binding the listener.
    pub startup_delay_ms: u64,
    /// Mirror received lines onto the bus.
    pub publish: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            log_path: PathBuf::from("logs/service2.log"),
            startup_delay_ms: 2000,
            publish: false,
        }
    }
}

impl ReceiverConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `RABBITMQ_ADDR` and `RECEIVER_HOST`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let mut config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply the single-variable overrides the deployment sets.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var(BROKER_ADDR_ENV_VAR) {
            self.broker.url = url;
        }
        if let Ok(host) = std::env::var(RECEIVER_HOST_ENV_VAR) {
            if !host.is_empty() {
                self.emitter.override_peer_host(&host)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
