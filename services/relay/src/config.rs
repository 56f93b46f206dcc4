//! Relay configuration.
//!
//! Env-driven, like the other fleetd services. Only the default backend is
//! mandatory; everything else has a workable default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_MAX_SESSIONS, DEFAULT_MAX_SNIFF_BYTES, DEFAULT_SNIFF_TIMEOUT,
};

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the relay listens on.
    pub listen_addr: SocketAddr,

    /// Backend dialed when the request line carries no GUID
    /// (example: the management service's web API).
    pub default_backend_addr: SocketAddr,

    /// Optional JSON file mapping device GUIDs to tunnel endpoints.
    pub device_map_file: Option<PathBuf>,

    /// Maximum concurrent relay sessions.
    pub max_sessions: usize,

    /// Backend dial timeout.
    pub dial_timeout: Duration,

    /// Deadline for the first request line to arrive.
    pub sniff_timeout: Duration,

    /// Maximum bytes read while waiting for the request line.
    pub sniff_max_bytes: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = std::env::var("RELAY_LISTEN_ADDR")
            .unwrap_or_else(|_| "[::]:8003".to_string())
            .parse()
            .context("RELAY_LISTEN_ADDR must be a host:port address.")?;

        let default_backend_addr: SocketAddr = std::env::var("RELAY_DEFAULT_BACKEND")
            .context("Missing default backend. Set RELAY_DEFAULT_BACKEND (host:port).")?
            .parse()
            .context("RELAY_DEFAULT_BACKEND must be a host:port address.")?;

        let device_map_file = std::env::var("RELAY_DEVICE_MAP").ok().map(PathBuf::from);

        let max_sessions: usize = std::env::var("RELAY_MAX_SESSIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_MAX_SESSIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_SESSIONS)
            .max(1);

        let dial_timeout_ms: u64 = std::env::var("RELAY_DIAL_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_DIAL_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_DIAL_TIMEOUT.as_millis() as u64);
        let dial_timeout = Duration::from_millis(dial_timeout_ms.max(50));

        let sniff_timeout_ms: u64 = std::env::var("RELAY_SNIFF_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_SNIFF_TIMEOUT.as_millis() as u64);
        let sniff_timeout = Duration::from_millis(sniff_timeout_ms.max(10));

        let sniff_max_bytes: usize = std::env::var("RELAY_SNIFF_MAX_BYTES")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_SNIFF_MAX_BYTES must be an integer.")?
            .unwrap_or(DEFAULT_MAX_SNIFF_BYTES)
            .max(64);

        let log_level = std::env::var("RELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            default_backend_addr,
            device_map_file,
            max_sessions,
            dial_timeout,
            sniff_timeout,
            sniff_max_bytes,
            log_level,
        })
    }
}
