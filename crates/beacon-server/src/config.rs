//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

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

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Rate limiter configuration.
    #[serde(default)]
    pub rate: RateConfig,

    /// Typing indicator configuration.
    #[serde(default)]
    pub typing: TypingConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

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

/// How connect credentials are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Credentials resolve through the configured token table.
    Static,
    /// The credential is taken as the user id. Development only.
    Permissive,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Validator selection.
    #[serde(default = "default_auth_mode")]
    pub mode: AuthMode,

    /// How long a connection may sit before completing the handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Credential to user-id table for `static` mode.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message content size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound frame queue capacity per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Consecutive failed deliveries before a slow consumer is closed.
    #[serde(default = "default_delivery_strikes")]
    pub delivery_strikes: u32,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Token bucket capacity per sender.
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,

    /// Refill window in seconds.
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Coalescing window for repeated identical signals, in milliseconds.
    #[serde(default = "default_typing_coalesce")]
    pub coalesce_ms: u64,

    /// Idle time after which typing state is swept, in seconds.
    #[serde(default = "default_typing_idle")]
    pub idle_secs: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time in milliseconds before a silent connection is closed.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_auth_mode() -> AuthMode {
    AuthMode::Static
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_delivery_strikes() -> u32 {
    3
}

fn default_rate_capacity() -> u32 {
    10
}

fn default_rate_window() -> u64 {
    60
}

fn default_typing_coalesce() -> u64 {
    1_000
}

fn default_typing_idle() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
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
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            rate: RateConfig::default(),
            typing: TypingConfig::default(),
            heartbeat: HeartbeatConfig::default(),
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

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            handshake_timeout_ms: default_handshake_timeout(),
            tokens: HashMap::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
            delivery_strikes: default_delivery_strikes(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            window_secs: default_rate_window(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            coalesce_ms: default_typing_coalesce(),
            idle_secs: default_typing_idle(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
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

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Handshake timeout as a duration.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.handshake_timeout_ms)
    }

    /// Rate limiter window as a duration.
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate.window_secs)
    }

    /// Typing coalescing window as a duration.
    #[must_use]
    pub fn typing_coalesce_window(&self) -> Duration {
        Duration::from_millis(self.typing.coalesce_ms)
    }

    /// Typing idle eviction horizon as a duration.
    #[must_use]
    pub fn typing_idle(&self) -> Duration {
        Duration::from_secs(self.typing.idle_secs)
    }

    /// Heartbeat idle timeout as a duration.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate.capacity, 10);
        assert_eq!(config.rate.window_secs, 60);
        assert_eq!(config.typing.coalesce_ms, 1_000);
        assert_eq!(config.auth.mode, AuthMode::Static);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.heartbeat.timeout_ms, 60_000);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [auth]
            mode = "permissive"

            [rate]
            capacity = 5
            window_secs = 30

            [limits]
            max_connections = 50000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth.mode, AuthMode::Permissive);
        assert_eq!(config.rate.capacity, 5);
        assert_eq!(config.limits.max_connections, 50000);
        // Untouched sections keep their defaults
        assert_eq!(config.typing.coalesce_ms, 1_000);
    }

    #[test]
    fn test_auth_tokens_table() {
        let toml_str = r#"
            [auth]
            mode = "static"

            [auth.tokens]
            "secret-token-1" = "alice"
            "secret-token-2" = "bob"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.auth.tokens.get("secret-token-1").unwrap(), "alice");
        assert_eq!(config.auth.tokens.len(), 2);
    }
}
