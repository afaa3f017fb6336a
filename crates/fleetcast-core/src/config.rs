use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{FleetcastError, Result};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";

// Per-connection keepalive and buffering defaults.
pub const DEFAULT_WRITE_WAIT_MS: u64 = 10_000;
pub const DEFAULT_PONG_WAIT_MS: u64 = 60_000;
pub const DEFAULT_PING_PERIOD_MS: u64 = 54_000; // 9/10 of pong wait
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 256;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_HUB_QUEUE_SIZE: usize = 256;
pub const DEFAULT_HOOK_QUEUE_SIZE: usize = 1024;

pub const DEFAULT_WORKER_COUNT: usize = 10;
pub const DEFAULT_PUSH_QUEUE_SIZE: usize = 10_000;

/// Top-level config (fleetcast.toml + FLEETCAST_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetcastConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub pusher: PusherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Keepalive and buffering for a single client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Upper bound on a single frame write.
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
    /// How long the read side waits for the next pong before giving up.
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,
    /// Keepalive ping cadence. Must be shorter than `pong_wait_ms`.
    #[serde(default = "default_ping_period_ms")]
    pub ping_period_ms: u64,
    /// Largest inbound frame accepted, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Capacity of the outbound message queue.
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: DEFAULT_WRITE_WAIT_MS,
            pong_wait_ms: DEFAULT_PONG_WAIT_MS,
            ping_period_ms: DEFAULT_PING_PERIOD_MS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_period_ms >= self.pong_wait_ms {
            return Err(FleetcastError::Config(format!(
                "connection.ping_period_ms ({}) must be less than pong_wait_ms ({})",
                self.ping_period_ms, self.pong_wait_ms
            )));
        }
        if self.ping_period_ms == 0 || self.write_wait_ms == 0 {
            return Err(FleetcastError::Config(
                "connection timings must be non-zero".to_string(),
            ));
        }
        if self.send_buffer_size == 0 {
            return Err(FleetcastError::Config(
                "connection.send_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(FleetcastError::Config(
                "connection.max_message_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry capacity, queue sizes and optional timing overrides.
///
/// The timing fields are unset by default. When present they replace the
/// matching [`ConnectionConfig`] value for every connection the gateway accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Capacity of each of the register, unregister and broadcast queues.
    #[serde(default = "default_hub_queue_size")]
    pub queue_size: usize,
    /// Capacity of the queue feeding connect/disconnect/message hooks.
    #[serde(default = "default_hook_queue_size")]
    pub hook_queue_size: usize,
    pub write_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub pong_timeout_ms: Option<u64>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            queue_size: DEFAULT_HUB_QUEUE_SIZE,
            hook_queue_size: DEFAULT_HOOK_QUEUE_SIZE,
            write_timeout_ms: None,
            read_timeout_ms: None,
            ping_interval_ms: None,
            pong_timeout_ms: None,
        }
    }
}

impl HubConfig {
    /// Apply the hub-level timing overrides on top of `base`.
    ///
    /// `read_timeout_ms` and `pong_timeout_ms` both bound the read side; the
    /// pong timeout wins when both are set.
    pub fn connection_config(&self, base: &ConnectionConfig) -> ConnectionConfig {
        let mut cfg = base.clone();
        if let Some(ms) = self.write_timeout_ms {
            cfg.write_wait_ms = ms;
        }
        if let Some(ms) = self.read_timeout_ms {
            cfg.pong_wait_ms = ms;
        }
        if let Some(ms) = self.pong_timeout_ms {
            cfg.pong_wait_ms = ms;
        }
        if let Some(ms) = self.ping_interval_ms {
            cfg.ping_period_ms = ms;
        }
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(FleetcastError::Config(
                "hub.max_connections must be at least 1".to_string(),
            ));
        }
        if self.queue_size == 0 || self.hook_queue_size == 0 {
            return Err(FleetcastError::Config(
                "hub queue sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PusherConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_push_queue_size")]
    pub queue_size: usize,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_size: DEFAULT_PUSH_QUEUE_SIZE,
        }
    }
}

impl PusherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(FleetcastError::Config(
                "pusher.worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(FleetcastError::Config(
                "pusher.queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_write_wait_ms() -> u64 {
    DEFAULT_WRITE_WAIT_MS
}
fn default_pong_wait_ms() -> u64 {
    DEFAULT_PONG_WAIT_MS
}
fn default_ping_period_ms() -> u64 {
    DEFAULT_PING_PERIOD_MS
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}
fn default_send_buffer_size() -> usize {
    DEFAULT_SEND_BUFFER_SIZE
}
fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}
fn default_hub_queue_size() -> usize {
    DEFAULT_HUB_QUEUE_SIZE
}
fn default_hook_queue_size() -> usize {
    DEFAULT_HOOK_QUEUE_SIZE
}
fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_push_queue_size() -> usize {
    DEFAULT_PUSH_QUEUE_SIZE
}

impl FleetcastConfig {
    /// Load config from a TOML file with FLEETCAST_* env var overrides.
    ///
    /// Nested keys use a double underscore: `FLEETCAST_HUB__MAX_CONNECTIONS=500`.
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FleetcastConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FLEETCAST_").split("__"))
            .extract()
            .map_err(|e| FleetcastError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }

    /// Check cross-field constraints, including the effective per-connection
    /// timings after hub overrides are applied.
    pub fn validate(&self) -> Result<()> {
        self.hub.validate()?;
        self.pusher.validate()?;
        self.effective_connection().validate()
    }

    /// Connection settings with hub-level overrides applied.
    pub fn effective_connection(&self) -> ConnectionConfig {
        self.hub.connection_config(&self.connection)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fleetcast/fleetcast.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = FleetcastConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.connection.ping_period() < cfg.connection.pong_wait());
    }

    #[test]
    fn ping_period_must_be_below_pong_wait() {
        let cfg = ConnectionConfig {
            ping_period_ms: 60_000,
            pong_wait_ms: 60_000,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn hub_overrides_replace_connection_timings() {
        let hub = HubConfig {
            write_timeout_ms: Some(2_000),
            pong_timeout_ms: Some(30_000),
            ping_interval_ms: Some(25_000),
            ..Default::default()
        };
        let cfg = hub.connection_config(&ConnectionConfig::default());
        assert_eq!(cfg.write_wait_ms, 2_000);
        assert_eq!(cfg.pong_wait_ms, 30_000);
        assert_eq!(cfg.ping_period_ms, 25_000);
        assert_eq!(cfg.send_buffer_size, DEFAULT_SEND_BUFFER_SIZE);
    }

    #[test]
    fn override_that_breaks_keepalive_is_rejected() {
        let mut cfg = FleetcastConfig::default();
        cfg.hub.pong_timeout_ms = Some(1_000);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = PusherConfig { worker_count: 0, queue_size: 10 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: FleetcastConfig = Figment::new()
            .merge(Toml::string("[hub]\nmax_connections = 5\n[pusher]\nworker_count = 2\n"))
            .extract()
            .unwrap();
        assert_eq!(cfg.hub.max_connections, 5);
        assert_eq!(cfg.hub.queue_size, DEFAULT_HUB_QUEUE_SIZE);
        assert_eq!(cfg.pusher.worker_count, 2);
        assert_eq!(cfg.pusher.queue_size, DEFAULT_PUSH_QUEUE_SIZE);
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
    }
}
