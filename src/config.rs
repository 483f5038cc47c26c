//! Code for the configuration of the application.

use std::{path::Path, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// The configuration of the application. Every section and key is optional.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// How we identify ourselves to machines.
    pub client: ClientConfig,
    /// Network ports and probing.
    pub network: NetworkConfig,
    /// Serial line settings.
    pub serial: SerialConfig,
    /// Session timing.
    pub session: SessionConfig,
    /// LAN discovery.
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &Path) -> Result<Self> {
        let config = std::fs::read_to_string(file)?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    pub fn from_str(config: &str) -> Result<Self> {
        Ok(toml::from_str(config)?)
    }
}

/// How we identify ourselves to machines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identifier sent in the SACP handshake.
    pub name: String,
    /// Auth token for SACP and the legacy HTTP api.
    pub token: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "machine-link".to_owned(),
            token: String::new(),
        }
    }
}

/// Network ports and probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// SACP over TCP.
    pub sacp_port: u16,
    /// Legacy HTTP api.
    pub http_port: u16,
    /// Bound on each protocol-detection connect attempt.
    pub probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sacp_port: 8888,
            http_port: legacy_http::DEFAULT_PORT,
            probe_timeout_ms: 1000,
        }
    }
}

impl NetworkConfig {
    /// Bound on each protocol-detection connect attempt.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Serial line settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line speed.
    pub baud: u32,
    /// How long to wait for a reply to the probe command.
    pub probe_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            probe_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    /// How long to wait for a reply to the probe command.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Session timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Heartbeat subscription period, and HTTP/serial polling period.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat silence after which a SACP or serial session is lost.
    pub liveness_timeout_ms: u64,
    /// Polling silence after which a legacy HTTP session is lost.
    pub http_liveness_timeout_ms: u64,
    /// How long a single request waits for its response.
    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            liveness_timeout_ms: 10_000,
            http_liveness_timeout_ms: 3000,
            request_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    /// Heartbeat subscription period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// SACP and serial liveness window.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Legacy HTTP liveness window.
    pub fn http_liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.http_liveness_timeout_ms)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// LAN discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UDP port machines listen for discover datagrams on.
    pub port: u16,
    /// Age after which a registry entry is no longer listed.
    pub ttl_ms: u64,
    /// How long to collect replies after broadcasting.
    pub debounce_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 20054,
            ttl_ms: 10_000,
            debounce_ms: 1000,
        }
    }
}

impl DiscoveryConfig {
    /// Age after which a registry entry is no longer listed.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// How long to collect replies after broadcasting.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
