//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so a single instance starts with no
//! configuration at all.

use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TetherConfig {
    /// Env: `TETHER_HOST`. Default: `0.0.0.0`
    pub host: String,

    /// Env: `TETHER_PORT`. Default: `6000`
    pub port: u16,

    /// SQLite database file.
    /// Env: `TETHER_DB_PATH`. Default: `tether.db`
    pub db_path: PathBuf,

    /// Fanout hub run by another instance.
    /// Env: `TETHER_HUB_ADDR`. Default: none
    pub hub_addr: Option<String>,

    /// Run the fanout hub in this process, listening here for other
    /// instances. Takes precedence over `hub_addr`.
    /// Env: `TETHER_HUB_LISTEN`. Default: none
    pub hub_listen: Option<SocketAddr>,

    /// Mark every user offline at startup. Only safe when no other instance
    /// shares the database.
    /// Env: `TETHER_RESET_PRESENCE` (true/false). Default: true when no hub
    /// is configured, false otherwise.
    pub reset_presence: Option<bool>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6000,
            db_path: PathBuf::from("tether.db"),
            hub_addr: None,
            hub_listen: None,
            reset_presence: None,
        }
    }
}

impl TetherConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("TETHER_HOST") {
            config.host = host;
        }

        if let Some(port) = lookup("TETHER_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %port, "Invalid TETHER_PORT, using default"),
            }
        }

        if let Some(path) = lookup("TETHER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        config.hub_addr = lookup("TETHER_HUB_ADDR").filter(|addr| !addr.is_empty());

        if let Some(addr) = lookup("TETHER_HUB_LISTEN").filter(|addr| !addr.is_empty()) {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.hub_listen = Some(parsed),
                Err(_) => tracing::warn!(value = %addr, "Invalid TETHER_HUB_LISTEN, not running a hub"),
            }
        }

        if let Some(val) = lookup("TETHER_RESET_PRESENCE") {
            config.reset_presence = Some(val != "false" && val != "0");
        }

        config
    }

    /// No hub configured: this instance is the whole cluster.
    pub fn is_standalone(&self) -> bool {
        self.hub_addr.is_none() && self.hub_listen.is_none()
    }

    pub fn resets_presence_on_start(&self) -> bool {
        self.reset_presence.unwrap_or_else(|| self.is_standalone())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
