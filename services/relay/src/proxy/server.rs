//! Relay server: listener, accept loop, and per-connection handling.
//!
//! The server owns the listen/serve contract:
//! - `listen_and_serve` binds the listen address, then hands the bound
//!   socket to the configured [`ServeStrategy`]; a bind failure is
//!   returned without invoking the strategy.
//! - The default strategy, [`AcceptLoop`], accepts connections for as long
//!   as the listener is open and spawns one relay session per connection.
//!   Transient accept errors are logged and accepting continues; a fatal
//!   listener error ends the loop and becomes the serve result.
//!
//! Each session sniffs the request line for a device GUID, resolves the
//! backend through the injected resolver, and relays bytes until either
//! side closes. Sessions are independent; a session's failure never
//! affects its siblings or the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::guid::{GuidSniffer, SniffConfig, SniffResult};
use super::resolver::BackendResolver;
use super::session::{run_session, DEFAULT_DIAL_TIMEOUT};

/// Default maximum concurrent relay sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10000;

/// Configuration for a relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Backend dialed when the request line carries no GUID.
    pub default_backend_addr: SocketAddr,
    /// Maximum concurrent relay sessions.
    pub max_sessions: usize,
    /// Request line sniffing configuration.
    pub sniff_config: SniffConfig,
    /// Backend dial timeout.
    pub dial_timeout: Duration,
}

impl RelayConfig {
    /// Create a new relay configuration.
    pub fn new(listen_addr: SocketAddr, default_backend_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            default_backend_addr,
            max_sessions: DEFAULT_MAX_SESSIONS,
            sniff_config: SniffConfig::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Statistics for a relay server.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to the session limit.
    pub connections_rejected: AtomicU64,
    /// Request lines that carried a GUID.
    pub guids_found: AtomicU64,
    /// Request lines that carried no GUID.
    pub guids_absent: AtomicU64,
    /// Connections whose request line never completed in time.
    pub sniff_timeouts: AtomicU64,
    /// Sessions aborted because resolution failed.
    pub resolve_failed: AtomicU64,
    /// Sessions aborted because the backend dial failed.
    pub dial_failed: AtomicU64,
    /// Bytes relayed to backends, request lines included.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends.
    pub bytes_from_backend: AtomicU64,
}

/// Replaceable accept-loop behavior.
///
/// `RelayServer::listen_and_serve` binds the listening socket and invokes
/// the configured strategy with it. Swapping the strategy changes what
/// happens after the bind (TLS wrapping, a test double) without altering
/// the bind contract.
#[async_trait]
pub trait ServeStrategy: Send + Sync {
    /// Serve connections from a bound listener until done or a fatal error.
    async fn serve(&self, server: Arc<RelayServer>, listener: TcpListener) -> io::Result<()>;
}

/// The default serve strategy: the plain accept loop.
#[derive(Debug, Default)]
pub struct AcceptLoop;

#[async_trait]
impl ServeStrategy for AcceptLoop {
    async fn serve(&self, server: Arc<RelayServer>, listener: TcpListener) -> io::Result<()> {
        server.accept_loop(listener).await
    }
}

/// A GUID-routing TCP relay server.
pub struct RelayServer {
    /// Relay configuration.
    config: RelayConfig,
    /// Backend resolution for device GUIDs.
    resolver: Arc<dyn BackendResolver>,
    /// Serve strategy invoked with the bound listener.
    strategy: Arc<dyn ServeStrategy>,
    /// Session semaphore for limiting concurrent sessions.
    session_semaphore: Arc<Semaphore>,
    /// Request line sniffer.
    sniffer: GuidSniffer,
    /// Statistics.
    stats: Arc<RelayStats>,
}

impl RelayServer {
    /// Create a new relay server with the default accept-loop strategy.
    pub fn new(config: RelayConfig, resolver: Arc<dyn BackendResolver>) -> Self {
        Self {
            session_semaphore: Arc::new(Semaphore::new(config.max_sessions)),
            sniffer: GuidSniffer::with_config(config.sniff_config.clone()),
            strategy: Arc::new(AcceptLoop),
            config,
            resolver,
            stats: Arc::new(RelayStats::default()),
        }
    }

    /// Replace the serve strategy.
    ///
    /// Takes effect for the next `listen_and_serve` call; swap before
    /// starting the server.
    pub fn set_serve_strategy(&mut self, strategy: Arc<dyn ServeStrategy>) {
        self.strategy = strategy;
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Get relay statistics.
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Bind the listen address and run the configured serve strategy.
    ///
    /// The strategy is invoked exactly once per successful bind, with the
    /// bound socket; its result is the serve result. A bind failure is
    /// returned directly and the strategy is never invoked.
    pub async fn listen_and_serve(self: Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            listen_addr = %local_addr,
            default_backend = %self.config.default_backend_addr,
            max_sessions = self.config.max_sessions,
            "Relay listening"
        );

        let strategy = Arc::clone(&self.strategy);
        strategy.serve(self, listener).await
    }

    /// Accept connections until a fatal listener error.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.session_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max sessions reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let server = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %e,
                                    "Session error"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("session", peer = %peer_addr)),
                    );
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept error");
                    // Brief sleep to avoid a tight loop on repeated errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    error!(error = %e, "Fatal accept error");
                    return Err(e);
                }
            }
        }
    }

    /// Handle a single connection: sniff, resolve, relay.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<()> {
        debug!(peer_addr = %peer_addr, "Handling connection");

        let mut preamble = Vec::new();
        let (result, _bytes_read) = self.sniffer.sniff(&mut client, &mut preamble).await;

        let guid = match result {
            SniffResult::Found(guid) => {
                self.stats.guids_found.fetch_add(1, Ordering::Relaxed);
                debug!(guid = %guid, "Device GUID extracted");
                Some(guid)
            }
            SniffResult::NoGuid => {
                self.stats.guids_absent.fetch_add(1, Ordering::Relaxed);
                debug!("No GUID in request line");
                None
            }
            SniffResult::Timeout(guid) => {
                self.stats.sniff_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Request line sniff timeout, routing on partial data");
                guid
            }
            SniffResult::IoError(e) => {
                return Err(io::Error::other(e));
            }
        };

        let backend_addr = match self
            .resolver
            .resolve(guid.as_ref(), self.config.default_backend_addr)
            .await
        {
            Ok(addr) => addr,
            Err(e) => {
                self.stats.resolve_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Backend resolution failed");
                return Ok(());
            }
        };

        debug!(backend_addr = %backend_addr, "Backend resolved");

        match run_session(client, backend_addr, self.config.dial_timeout, preamble).await {
            Ok((bytes_to_backend, bytes_from_backend)) => {
                self.stats
                    .bytes_to_backend
                    .fetch_add(bytes_to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(bytes_from_backend, Ordering::Relaxed);

                debug!(
                    bytes_to_backend = bytes_to_backend,
                    bytes_from_backend = bytes_from_backend,
                    "Session closed"
                );
                Ok(())
            }
            Err(e) => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                warn!(backend_addr = %backend_addr, error = %e, "Backend dial failed");
                Ok(())
            }
        }
    }
}

/// Per-connection accept failures that leave the listener usable.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
