//! Connection acceptor.
//!
//! One accept loop runs per bound interface. Every accepted connection is
//! handed to its own task, so a slow handshake never holds up the loop.
//! Temporary accept failures (descriptor exhaustion, connections reset
//! before accept, interrupted calls) are retried with exponential backoff;
//! anything else ends the loop with an error.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tlsmux_common::Backoff;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::ProxyError;

/// Keep-alive period applied to accepted connections.
pub const TCP_KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

const LISTEN_BACKLOG: i32 = 1024;

/// Source of incoming connections.
#[async_trait]
pub trait Accept: Send + Sync {
    type Conn: Send + 'static;

    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)>;
}

/// TCP listener that enables keep-alive on every accepted socket.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Accept for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;

        let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_PERIOD);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(peer = %peer, error = %e, "Failed to enable TCP keep-alive");
        }

        Ok((stream, peer))
    }
}

/// Bind a listener on `interface` and `port`.
///
/// The empty interface is the wildcard: a dual-stack IPv6 socket, or IPv4
/// when IPv6 is unavailable. Must be called inside a Tokio runtime.
pub fn bind(interface: &str, port: u16) -> Result<TcpAcceptor, ProxyError> {
    let listener = if interface.is_empty() {
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        match bind_socket(v6) {
            Ok(listener) => listener,
            Err(e) => {
                debug!(error = %e, "Dual-stack bind failed, falling back to IPv4");
                let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                bind_socket(v4).map_err(|source| ProxyError::Bind { addr: v4, source })?
            }
        }
    } else {
        let addr = resolve(interface, port)?;
        bind_socket(addr).map_err(|source| ProxyError::Bind { addr, source })?
    };

    let acceptor = TcpAcceptor::new(listener);
    if let Ok(addr) = acceptor.local_addr() {
        info!(address = %addr, "Listening");
    }
    Ok(acceptor)
}

fn resolve(interface: &str, port: u16) -> Result<SocketAddr, ProxyError> {
    let host = interface.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .and_then(|mut addrs| {
            addrs.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses found")
            })
        })
        .map_err(|source| ProxyError::Resolve {
            interface: interface.to_string(),
            source,
        })
}

fn bind_socket(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Whether an accept error is worth retrying.
pub fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
        );
    }

    false
}

/// Accept connections forever, spawning `handler` for each one.
///
/// Returns only on a non-temporary accept error.
pub async fn serve<A, H, Fut>(acceptor: A, handler: H) -> io::Result<()>
where
    A: Accept,
    H: Fn(A::Conn, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut backoff = Backoff::default();

    loop {
        match acceptor.accept().await {
            Ok((conn, peer)) => {
                backoff.reset();
                tokio::spawn(handler(conn, peer));
            }
            Err(e) if is_temporary(&e) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Accept error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
