//! Configuration for both bridge roles.
//!
//! One [`PortalConfig`] describes a deployment; the frontend reads the
//! `frontend` table, the outlet reads `outlet`, and both honour `channel` and
//! `rate_limit`. Every field has a default so a partial TOML file is fine.

pub use portal_wire::{ChannelConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Public server settings (`portal frontend`).
    pub frontend: FrontendConfig,
    /// Outlet client settings (`portal outlet`).
    pub outlet: OutletConfig,
    /// Channel timers, shared by both sides.
    pub channel: ChannelConfig,
    /// Outbound bus shaping; disabled by default.
    pub rate_limit: RateLimitConfig,
}

/// Public-facing server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Address the HTTP/WebSocket server binds.
    pub listen_addr: String,
    /// How long `/ws_out` waits for an existing outlet to answer `PING`.
    pub arbitration_timeout_ms: u64,
    /// Capacity of each in-process broadcast bus direction.
    pub bus_capacity: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            arbitration_timeout_ms: 1000,
            bus_capacity: 1024,
        }
    }
}

impl FrontendConfig {
    pub fn arbitration_timeout(&self) -> Duration {
        Duration::from_millis(self.arbitration_timeout_ms)
    }

    /// Replace the port of `listen_addr`, keeping the host.
    pub fn set_port(&mut self, port: u16) {
        let host = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        self.listen_addr = format!("{host}:{port}");
    }
}

/// Outlet client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutletConfig {
    /// Frontend `/ws_out` endpoint.
    pub agent_url: String,
    /// Destination used when a client asks for none.
    pub default_dest: String,
    /// Always dial `default_dest`, whatever the client asked for.
    pub force_default_dest: bool,
    /// Pause before reconnecting after the bus drops.
    pub reconnect_interval_ms: u64,
    /// Upper bound for the connect-failure backoff.
    pub max_backoff_ms: u64,
}

impl Default for OutletConfig {
    fn default() -> Self {
        Self {
            agent_url: "ws://localhost:8000/ws_out".to_string(),
            default_dest: String::new(),
            force_default_dest: false,
            reconnect_interval_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl OutletConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.reconnect_interval_ms))
    }

    /// The destination to dial for a client's request.
    pub fn resolve_destination(&self, requested: &str) -> String {
        if self.force_default_dest || requested.trim().is_empty() {
            self.default_dest.clone()
        } else {
            requested.to_string()
        }
    }
}
