pub mod proxy;

pub use proxy::{
    backward, forward, parse_guid, run_session, AcceptLoop, BackendResolver, DeviceTable,
    GuidSniffer, RelayConfig, RelayServer, RelayStats, ResolveError, ServeStrategy, SessionGate,
    SharedResolver, SniffConfig, SniffResult,
};
