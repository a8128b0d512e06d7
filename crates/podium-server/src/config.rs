//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (explicit path, or the first of the search paths
//!   that exists)
//! - Environment variables (`PODIUM__PORT`, `PODIUM__LIMITS__MAX_CONNECTIONS`, ...)

use anyhow::{Context, Result};
use podium_core::{ConsumerConfig, HubConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionConfig;

/// Files searched when no explicit path is given.
const CONFIG_PATHS: [&str; 3] = [
    "podium.toml",
    "/etc/podium/podium.toml",
    "~/.config/podium/podium.toml",
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

    /// Score updates stream and its history consumer.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Outbox for events whose append failed.
    #[serde(default)]
    pub outbox: OutboxConfig,

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
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Outbound frames buffered per connection before it counts as slow.
    #[serde(default = "default_queue_capacity")]
    pub client_queue_capacity: usize,

    /// Requests buffered in front of the hub loop.
    #[serde(default = "default_queue_capacity")]
    pub hub_command_capacity: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between pings in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Time without a pong before the connection is dropped, in milliseconds.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Time allowed for a single write, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Updates stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream score events are appended to.
    #[serde(default = "default_stream_name")]
    pub name: String,

    /// Consumer group of the history recorder.
    #[serde(default = "default_stream_group")]
    pub group: String,

    /// Consumer name within the group.
    #[serde(default = "default_stream_consumer")]
    pub consumer: String,

    /// Entries read per call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long one read blocks, in milliseconds.
    #[serde(default = "default_block")]
    pub block_ms: u64,

    /// Idle time before a pending entry is reclaimed, in milliseconds.
    #[serde(default = "default_reclaim_idle")]
    pub reclaim_idle_ms: u64,

    /// Deliveries before an entry is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Entries kept when the stream is trimmed.
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Suffix of the dead-letter stream name.
    #[serde(default = "default_dead_letter_suffix")]
    pub dead_letter_suffix: String,
}

/// Outbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Events held before the oldest is dropped.
    #[serde(default = "default_outbox_capacity")]
    pub capacity: usize,

    /// Retry interval in milliseconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
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

fn default_max_subscriptions() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_ping_interval() -> u64 {
    54_000 // 9/10 of the pong timeout
}

fn default_pong_timeout() -> u64 {
    60_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_stream_name() -> String {
    podium_protocol::LEADERBOARD_UPDATES_STREAM.to_string()
}

fn default_stream_group() -> String {
    "leaderboard-history".to_string()
}

fn default_stream_consumer() -> String {
    "history-recorder".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_block() -> u64 {
    5_000
}

fn default_reclaim_idle() -> u64 {
    30_000
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_max_len() -> usize {
    100_000
}

fn default_dead_letter_suffix() -> String {
    ":dead-letter".to_string()
}

fn default_outbox_capacity() -> usize {
    10_000
}

fn default_flush_interval() -> u64 {
    1_000
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
            stream: StreamConfig::default(),
            outbox: OutboxConfig::default(),
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
            max_subscriptions_per_connection: default_max_subscriptions(),
            client_queue_capacity: default_queue_capacity(),
            hub_command_capacity: default_queue_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_timeout_ms: default_pong_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: default_stream_name(),
            group: default_stream_group(),
            consumer: default_stream_consumer(),
            batch_size: default_batch_size(),
            block_ms: default_block(),
            reclaim_idle_ms: default_reclaim_idle(),
            max_deliveries: default_max_deliveries(),
            max_len: default_max_len(),
            dead_letter_suffix: default_dead_letter_suffix(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: default_outbox_capacity(),
            flush_interval_ms: default_flush_interval(),
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
    /// Load configuration from defaults, a file, and the environment.
    ///
    /// With no explicit `path` the search paths are tried in order and a
    /// missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the explicit file is missing, or if any source
    /// cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.to_path_buf())
            }
            None => Self::find_file(),
        };

        let mut builder = ::config::Config::builder();
        if let Some(file) = &file {
            tracing::info!(path = %file.display(), "Loading config file");
            builder = builder.add_source(::config::File::from(file.as_path()));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("PODIUM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| match &file {
                Some(file) => format!("Failed to load config from {}", file.display()),
                None => "Failed to load config from environment".to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("limits.client_queue_capacity", self.limits.client_queue_capacity as u64),
            ("limits.hub_command_capacity", self.limits.hub_command_capacity as u64),
            ("limits.max_message_size", self.limits.max_message_size as u64),
            ("heartbeat.ping_interval_ms", self.heartbeat.ping_interval_ms),
            ("heartbeat.pong_timeout_ms", self.heartbeat.pong_timeout_ms),
            ("heartbeat.write_timeout_ms", self.heartbeat.write_timeout_ms),
            ("stream.batch_size", self.stream.batch_size as u64),
            ("stream.reclaim_idle_ms", self.stream.reclaim_idle_ms),
            ("stream.max_deliveries", u64::from(self.stream.max_deliveries)),
            ("outbox.capacity", self.outbox.capacity as u64),
            ("outbox.flush_interval_ms", self.outbox.flush_interval_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            anyhow::bail!("{name} must be greater than zero");
        }

        if self.heartbeat.pong_timeout_ms <= self.heartbeat.ping_interval_ms {
            anyhow::bail!(
                "heartbeat.pong_timeout_ms ({}) must exceed heartbeat.ping_interval_ms ({})",
                self.heartbeat.pong_timeout_ms,
                self.heartbeat.ping_interval_ms
            );
        }
        if !self.transport.websocket_path.starts_with('/') {
            anyhow::bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        for (name, value) in [
            ("stream.name", &self.stream.name),
            ("stream.group", &self.stream.group),
            ("stream.consumer", &self.stream.consumer),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{name} must not be empty");
            }
        }
        Ok(())
    }

    /// First search path that exists, tilde-expanded.
    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .find(|p| p.exists())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Hub settings.
    #[must_use]
    pub fn hub(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.limits.hub_command_capacity,
            client_queue_capacity: self.limits.client_queue_capacity,
            max_subscriptions_per_client: self.limits.max_subscriptions_per_connection,
        }
    }

    /// History consumer settings.
    #[must_use]
    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.stream.batch_size,
            block: Duration::from_millis(self.stream.block_ms),
            reclaim_idle: Duration::from_millis(self.stream.reclaim_idle_ms),
            max_deliveries: self.stream.max_deliveries,
            dead_letter_suffix: self.stream.dead_letter_suffix.clone(),
            ..ConsumerConfig::default()
        }
    }

    /// Per-connection session settings.
    #[must_use]
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            pong_timeout: Duration::from_millis(self.heartbeat.pong_timeout_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.heartbeat.ping_interval_ms, 54_000);
        assert_eq!(config.stream.name, "leaderboard-updates");
        assert_eq!(config.hub().client_queue_capacity, 256);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [stream]
            max_deliveries = 3
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.client_queue_capacity, 256);
        assert_eq!(config.consumer().max_deliveries, 3);
        assert_eq!(config.session().pong_timeout, Duration::from_secs(60));
    }

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "podium-test-{}-{name}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{contents}").unwrap();
        path
    }

    #[test]
    fn test_load_explicit_file() {
        let path = write_config("explicit", "port = 7070\n[heartbeat]\nping_interval_ms = 1000");

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.port, 7070);
        assert_eq!(config.heartbeat.ping_interval_ms, 1000);
        assert_eq!(config.heartbeat.pong_timeout_ms, 60_000);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_rejects_unusable_settings() {
        let cases = [
            ("flush", "[outbox]\nflush_interval_ms = 0", "outbox.flush_interval_ms"),
            ("ping", "[heartbeat]\nping_interval_ms = 0", "heartbeat.ping_interval_ms"),
            ("batch", "[stream]\nbatch_size = 0", "stream.batch_size"),
            ("queue", "[limits]\nclient_queue_capacity = 0", "limits.client_queue_capacity"),
            (
                "pong",
                "[heartbeat]\nping_interval_ms = 60000\npong_timeout_ms = 30000",
                "heartbeat.pong_timeout_ms",
            ),
            ("path", "[transport]\nwebsocket_path = \"ws\"", "transport.websocket_path"),
        ];

        for (name, contents, setting) in cases {
            let path = write_config(name, contents);
            let err = Config::load(Some(&path)).unwrap_err();
            std::fs::remove_file(&path).unwrap();
            assert!(
                format!("{err:#}").contains(setting),
                "{name}: unexpected error {err:#}"
            );
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_load_missing_explicit_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/podium.toml"))).is_err());
    }
}
