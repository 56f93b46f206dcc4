//! fleetd relay
//!
//! TCP relay that demultiplexes device traffic by GUID.
//!
//! This service:
//! - Accepts TCP connections on the configured listener
//! - Scans the first request line for a device GUID
//! - Resolves the GUID to a device tunnel endpoint, falling back to the
//!   management service when no GUID is present
//! - Relays bytes in both directions until either side closes

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
pub mod proxy;

// Re-export proxy types for external use
pub use proxy::{
    backward, forward, parse_guid, run_session, AcceptLoop, BackendResolver, DeviceTable,
    GuidSniffer, RelayConfig, RelayServer, RelayStats, ResolveError, ServeStrategy, SessionGate,
    SharedResolver, SniffConfig, SniffResult,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetd relay");
    info!(
        listen_addr = %config.listen_addr,
        default_backend = %config.default_backend_addr,
        max_sessions = config.max_sessions,
        "Configuration loaded"
    );

    let table = match &config.device_map_file {
        Some(path) => {
            let table = DeviceTable::from_map_file(path)?;
            info!(
                device_count = table.len(),
                device_map = %path.display(),
                "Device map loaded"
            );
            table
        }
        None => DeviceTable::new(),
    };

    let mut relay_config = RelayConfig::new(config.listen_addr, config.default_backend_addr);
    relay_config.max_sessions = config.max_sessions;
    relay_config.dial_timeout = config.dial_timeout;
    relay_config.sniff_config = SniffConfig {
        timeout: config.sniff_timeout,
        max_bytes: config.sniff_max_bytes,
    };

    let server = Arc::new(RelayServer::new(relay_config, Arc::new(table)));

    let serve_handle = tokio::spawn(Arc::clone(&server).listen_and_serve());

    // Wait for shutdown signal or a fatal serve error
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = serve_handle => {
            match result {
                Ok(Ok(())) => info!("Relay exited normally"),
                Ok(Err(e)) => {
                    error!(error = %e, "Relay exited with error");
                    return Err(e.into());
                }
                Err(e) => error!(error = %e, "Relay task panicked"),
            }
        }
    }

    let stats = server.stats();
    info!(
        connections_accepted = stats.connections_accepted.load(Ordering::Relaxed),
        connections_active = stats.connections_active.load(Ordering::Relaxed),
        "Relay shutdown complete"
    );

    Ok(())
}
