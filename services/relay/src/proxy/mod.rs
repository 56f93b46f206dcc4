//! GUID-routed TCP relay implementation.
//!
//! This module provides:
//! - Request line sniffing and device GUID extraction
//! - Backend resolution behind a pluggable resolver trait
//! - Per-session forward/backward copy loops with shared-fate teardown
//! - An accept loop behind a replaceable serve strategy
//!
//! ## Architecture
//!
//! ```text
//! Client -> RelayServer -> GuidSniffer -> BackendResolver -> forward/backward -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{DeviceTable, RelayConfig, RelayServer};
//!
//! let table = Arc::new(DeviceTable::new());
//! let config = RelayConfig::new("[::]:8003".parse()?, "127.0.0.1:3000".parse()?);
//! let server = Arc::new(RelayServer::new(config, table));
//! server.listen_and_serve().await?;
//! ```

mod guid;
mod resolver;
mod server;
mod session;

pub use guid::{
    parse_guid, GuidSniffer, SniffConfig, SniffResult, DEFAULT_MAX_SNIFF_BYTES,
    DEFAULT_SNIFF_TIMEOUT,
};
pub use resolver::{BackendResolver, DeviceTable, ResolveError, SharedResolver};
pub use server::{
    AcceptLoop, RelayConfig, RelayServer, RelayStats, ServeStrategy, DEFAULT_MAX_SESSIONS,
};
pub use session::{backward, forward, run_session, SessionGate, DEFAULT_DIAL_TIMEOUT};
