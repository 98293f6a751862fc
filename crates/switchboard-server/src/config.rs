//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (first found of the search paths, or an
//!   explicit path)
//! - Environment variables (`SWITCHBOARD_PORT`, `SWITCHBOARD_LIMITS__MAX_CONNECTIONS`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use switchboard_core::{BusConfig, HubConfig};
use switchboard_transport::SessionConfig;
use tracing::info;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SWITCHBOARD";

/// Configuration files searched by [`Config::load`], in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "switchboard.toml",
    "/etc/switchboard/switchboard.toml",
    "~/.config/switchboard/switchboard.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Event bus configuration.
    #[serde(default)]
    pub bus: BusSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per session.
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,

    /// Hub command queue capacity.
    #[serde(default = "default_hub_command_capacity")]
    pub hub_command_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Maximum silence from a peer in milliseconds.
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,

    /// Keepalive ping interval in milliseconds. Defaults to 90 % of the
    /// liveness timeout.
    #[serde(default)]
    pub ping_interval_ms: Option<u64>,

    /// Deadline for each write in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Queue capacity per subscriber.
    #[serde(default = "default_bus_buffer")]
    pub buffer_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    switchboard_protocol::MAX_MESSAGE_SIZE
}

fn default_session_buffer() -> usize {
    256
}

fn default_hub_command_capacity() -> usize {
    256
}

fn default_liveness_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_bus_buffer() -> usize {
    switchboard_core::bus::DEFAULT_BUFFER_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            bus: BusSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            session_buffer: default_session_buffer(),
            hub_command_capacity: default_hub_command_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: default_liveness_timeout(),
            ping_interval_ms: None,
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_bus_buffer(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let found = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::layered(found.as_deref().map(Path::new), environment())
    }

    /// Load configuration from a specific file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let expanded = shellexpand::tilde(&path.as_ref().to_string_lossy()).into_owned();
        Self::layered(Some(Path::new(&expanded)), environment())
    }

    fn layered(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Config = builder
            .add_source(env)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file, without overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check settings that deserialize fine but cannot run.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address or the session timings are unusable.
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        self.session_config()
            .validate()
            .map_err(|reason| anyhow::anyhow!("Invalid heartbeat configuration: {reason}"))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Session limits derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let liveness = Duration::from_millis(self.heartbeat.liveness_timeout_ms);
        let mut session = SessionConfig {
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            max_message_size: self.limits.max_message_size,
            buffer: self.limits.session_buffer,
            ..SessionConfig::default()
        }
        .with_liveness_timeout(liveness);

        if let Some(ping) = self.heartbeat.ping_interval_ms {
            session.ping_interval = Duration::from_millis(ping);
        }
        session
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.limits.hub_command_capacity,
        }
    }

    /// Bus settings derived from this configuration.
    #[must_use]
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            buffer_size: self.bus.buffer_size,
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
