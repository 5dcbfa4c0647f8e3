//! Bidirectional stream relay.
//!
//! After routing, the client connection and a freshly dialed backend
//! connection are joined by two copy loops, one per direction. The handler
//! task copies client to backend and a spawned task copies backend to
//! client. Whichever direction stops first (EOF or error) claims the
//! teardown: it cancels the other direction, shuts down its write side and
//! logs the disconnect. The other direction sees the cancellation and exits
//! without closing or logging anything. Both sockets close when the last
//! half is dropped.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tlsmux_common::{BufferPool, PooledBuffer};
use tlsmux_config::Backend;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ProxyContext;
use crate::error::ProxyError;

/// Copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToBackend => f.write_str("client->backend"),
            Self::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// Single-use claim on tearing a relay down.
#[derive(Debug, Default)]
pub struct Teardown {
    fired: AtomicBool,
    token: CancellationToken,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the teardown. Exactly one caller ever gets `true`; it also
    /// cancels every direction waiting on [`Teardown::cancelled`].
    pub fn claim(&self) -> bool {
        let won = !self.fired.swap(true, Ordering::AcqRel);
        if won {
            self.token.cancel();
        }
        won
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// What one direction did before it stopped.
#[derive(Debug)]
struct DirectionResult {
    bytes: u64,
    /// Present only for the direction that claimed the teardown
    closed: Option<io::Result<()>>,
}

/// Outcome of a finished relay.
#[derive(Debug)]
pub struct RelaySummary {
    /// Direction that finished first and tore the relay down
    pub closed_by: Direction,
    /// Error that ended the winning direction, if it did not end at EOF
    pub error: Option<io::Error>,
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Dial `backend` under the configured timeout.
pub async fn dial(backend: &Backend, timeout: std::time::Duration) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(timeout, TcpStream::connect(&backend.addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Dial {
            backend: backend.name.clone(),
            addr: backend.addr.clone(),
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout {
            backend: backend.name.clone(),
            addr: backend.addr.clone(),
            timeout,
        }),
    }
}

/// Dial the backend and relay until either side closes.
///
/// A dial failure is returned without touching the client; dropping it
/// closes the connection.
pub async fn relay<C>(
    ctx: &ProxyContext,
    client: C,
    backend: Arc<Backend>,
    peer: SocketAddr,
) -> Result<RelaySummary, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let upstream = dial(&backend, ctx.dial_timeout).await?;
    info!(peer = %peer, backend = %backend, "Connected to backend");

    Ok(relay_streams(client, upstream, &ctx.buffers, &backend, peer).await)
}

/// Relay bytes between two established streams.
pub async fn relay_streams<C, B>(
    client: C,
    backend: B,
    buffers: &Arc<BufferPool>,
    label: &Backend,
    peer: SocketAddr,
) -> RelaySummary
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);
    let teardown = Arc::new(Teardown::new());

    let downstream = tokio::spawn(copy_direction(
        backend_read,
        client_write,
        buffers.acquire(),
        Arc::clone(&teardown),
    ));
    let up = copy_direction(client_read, backend_write, buffers.acquire(), teardown).await;

    let down = match downstream.await {
        Ok(result) => result,
        Err(e) => {
            warn!(peer = %peer, backend = %label, error = %e, "Relay task failed");
            DirectionResult {
                bytes: 0,
                closed: Some(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))),
            }
        }
    };

    let (closed_by, outcome) = match (up.closed, down.closed) {
        (Some(outcome), _) => (Direction::ClientToBackend, outcome),
        (None, Some(outcome)) => (Direction::BackendToClient, outcome),
        (None, None) => (Direction::ClientToBackend, Ok(())),
    };

    let error = outcome.err();
    if let Some(ref e) = error {
        debug!(peer = %peer, backend = %label, direction = %closed_by, error = %e, "Relay error");
    }
    info!(
        peer = %peer,
        backend = %label,
        closed_by = %closed_by,
        client_to_backend = up.bytes,
        backend_to_client = down.bytes,
        "Disconnected"
    );

    RelaySummary {
        closed_by,
        error,
        client_to_backend: up.bytes,
        backend_to_client: down.bytes,
    }
}

/// Copy `src` into `dst` until EOF, error or cancellation by the other direction.
async fn copy_direction<R, W>(
    mut src: R,
    mut dst: W,
    mut buf: PooledBuffer,
    teardown: Arc<Teardown>,
) -> DirectionResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;

    let finished = tokio::select! {
        biased;
        _ = teardown.cancelled() => None,
        result = copy_loop(&mut src, &mut dst, &mut buf, &mut bytes) => Some(result),
    };
    drop(buf);

    let Some(result) = finished else {
        return DirectionResult { bytes, closed: None };
    };
    if !teardown.claim() {
        return DirectionResult { bytes, closed: None };
    }

    // Errors here only mean the peer is already gone
    let _ = dst.shutdown().await;

    DirectionResult {
        bytes,
        closed: Some(result),
    }
}

async fn copy_loop<R, W>(src: &mut R, dst: &mut W, buf: &mut [u8], bytes: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = src.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        *bytes += n as u64;
    }
}
