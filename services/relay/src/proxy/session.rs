//! Relay session lifecycle: dial, handoff, and the two copy loops.
//!
//! One session per accepted client connection. The session driver spawns
//! [`forward`] (client to backend) as its own task and runs [`backward`]
//! (backend to client) inline. `forward` owns the backend dial; the dialed
//! connection's read half crosses to the driver through a one-shot handoff
//! that is published exactly once. A dial failure is published through the
//! same handoff so the driver never waits forever.
//!
//! The two directions share a single fate. Whichever loop terminates first
//! (EOF, error, write failure) trips the session's [`SessionGate`]; the
//! other loop observes the gate at its next suspension point and exits.
//! Once both loops have returned, all four stream halves have been dropped
//! and both sockets are fully closed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::debug;

/// Default timeout for dialing a backend.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Close-once gate shared by the two copy directions of a session.
///
/// Tripping the gate is idempotent; both directions may race to close and
/// neither can double-close. The gate carries no data, only the fact that
/// the session is over.
#[derive(Debug, Clone)]
pub struct SessionGate {
    inner: Arc<watch::Sender<bool>>,
}

impl SessionGate {
    /// Create an open gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(tx),
        }
    }

    /// Trip the gate. Safe to call from either direction, any number of
    /// times.
    pub fn close(&self) {
        self.inner.send_replace(true);
    }

    /// Whether the gate has been tripped.
    pub fn is_closed(&self) -> bool {
        *self.inner.borrow()
    }

    /// Resolves once the gate is tripped; immediately if it already was.
    pub async fn closed(&self) {
        let mut rx = self.inner.subscribe();
        // wait_for only errors when the sender drops, and `self` holds it.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-to-backend half of a relay session.
///
/// Dials `backend_addr`, publishes the backend's read half through `ready`
/// for the backward loop, replays `preamble` (the bytes consumed while
/// routing), then copies client bytes to the backend until either peer
/// ends the session. On a dial failure the error is published through
/// `ready` instead of a connection and no bytes are relayed.
///
/// Returns the number of bytes delivered to the backend, preamble
/// included.
pub async fn forward(
    mut client_read: OwnedReadHalf,
    backend_addr: SocketAddr,
    dial_timeout: Duration,
    preamble: Vec<u8>,
    ready: oneshot::Sender<io::Result<OwnedReadHalf>>,
    gate: SessionGate,
) -> io::Result<u64> {
    let backend = match dial(backend_addr, dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            gate.close();
            let kind = e.kind();
            let _ = ready.send(Err(e));
            return Err(io::Error::new(kind, "backend dial failed"));
        }
    };

    let (backend_read, mut backend_write) = backend.into_split();
    if ready.send(Ok(backend_read)).is_err() {
        // Session driver is gone; nobody will run the backward loop.
        gate.close();
        return Ok(0);
    }

    let mut total = 0u64;

    // The request line was consumed for routing; the backend still gets it,
    // ahead of everything the client sends next.
    if !preamble.is_empty() {
        if let Err(e) = backend_write.write_all(&preamble).await {
            gate.close();
            return Err(e);
        }
        total += preamble.len() as u64;
    }

    let result = copy_until_closed(&mut client_read, &mut backend_write, &gate, &mut total).await;
    gate.close();
    result.map(|()| total)
}

/// Backend-to-client half of a relay session.
///
/// Copies backend bytes to the client until either peer ends the session,
/// then trips the gate so the forward loop tears down with it. Returns the
/// number of bytes delivered to the client.
pub async fn backward(
    mut backend_read: OwnedReadHalf,
    mut client_write: OwnedWriteHalf,
    gate: SessionGate,
) -> io::Result<u64> {
    let mut total = 0u64;
    let result = copy_until_closed(&mut backend_read, &mut client_write, &gate, &mut total).await;
    gate.close();
    result.map(|()| total)
}

/// Drive one relay session to completion.
///
/// Spawns `forward` with a fresh handoff, waits for the backend dial, then
/// runs `backward` inline. Mid-session I/O failures are ordinary
/// termination and are folded into the byte counts; only a dial failure
/// (or a vanished forward task) surfaces as an error.
///
/// Returns `(bytes_to_backend, bytes_from_backend)`.
pub async fn run_session(
    client: TcpStream,
    backend_addr: SocketAddr,
    dial_timeout: Duration,
    preamble: Vec<u8>,
) -> io::Result<(u64, u64)> {
    let (client_read, client_write) = client.into_split();
    let (ready_tx, ready_rx) = oneshot::channel();
    let gate = SessionGate::new();

    let forward_task = tokio::spawn(forward(
        client_read,
        backend_addr,
        dial_timeout,
        preamble,
        ready_tx,
        gate.clone(),
    ));

    let backend_read = match ready_rx.await {
        Ok(Ok(half)) => half,
        Ok(Err(e)) => {
            // Dial failed; dropping client_write closes our side.
            return Err(e);
        }
        Err(_) => return Err(io::Error::other("forward task dropped the handoff")),
    };

    let bytes_from_backend = backward(backend_read, client_write, gate).await.unwrap_or(0);

    // The gate is tripped by now, so forward unblocks promptly.
    let bytes_to_backend = match forward_task.await {
        Ok(result) => result.unwrap_or(0),
        Err(_) => 0,
    };

    Ok((bytes_to_backend, bytes_from_backend))
}

/// Copy bytes from `read` to `write` until EOF, an I/O error, or the gate
/// tripping. Copied bytes accumulate into `total` as the loop runs, so the
/// count survives an early exit.
async fn copy_until_closed<R, W>(
    read: &mut R,
    write: &mut W,
    gate: &SessionGate,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];

    loop {
        let step = async {
            let n = read.read(&mut buf).await?;
            if n > 0 {
                write.write_all(&buf[..n]).await?;
            }
            Ok::<usize, io::Error>(n)
        };

        let n = tokio::select! {
            result = step => result?,
            _ = gate.closed() => return Ok(()),
        };

        if n == 0 {
            break;
        }
        *total += n as u64;
    }

    write.shutdown().await?;
    Ok(())
}

/// Dial a backend with a bounded timeout.
async fn dial(addr: SocketAddr, dial_timeout: Duration) -> io::Result<TcpStream> {
    debug!(backend_addr = %addr, "Dialing backend");

    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timeout")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_close_is_idempotent() {
        let gate = SessionGate::new();
        assert!(!gate.is_closed());

        gate.close();
        gate.close();
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn test_gate_closed_resolves_after_close() {
        let gate = SessionGate::new();
        let waiter = gate.clone();

        let handle = tokio::spawn(async move {
            waiter.closed().await;
        });

        gate.close();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_gate_closed_resolves_immediately_when_pretripped() {
        let gate = SessionGate::new();
        gate.close();

        timeout(Duration::from_millis(100), gate.closed())
            .await
            .expect("pre-tripped gate should not block");
    }

    #[tokio::test]
    async fn test_gate_is_shared_across_clones() {
        let gate = SessionGate::new();
        let other = gate.clone();

        other.close();
        assert!(gate.is_closed());
    }
}
