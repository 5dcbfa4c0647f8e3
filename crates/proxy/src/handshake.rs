//! Handshake router.
//!
//! Each accepted connection runs here on its own task. The ClientHello is
//! read first so that certificate issuance (which is async and may take
//! seconds) happens before rustls runs its synchronous certificate lookup.
//! After the handshake completes, the negotiated ALPN protocol and the SNI
//! hostname select the backend, and the connection is handed to the relay.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use crate::acme::is_challenge_alpn;
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::listener::{self, Accept};
use crate::relay;

enum Handshake<IO> {
    /// Regular client, ready to be routed
    Established(TlsStream<IO>),
    /// TLS-ALPN-01 validation handshake, already answered
    Challenge,
}

/// Serve one accepted connection to completion.
///
/// Never returns an error: every failure is logged and the connection is
/// closed by dropping it.
pub async fn handle_connection<IO>(ctx: Arc<ProxyContext>, stream: IO, peer: SocketAddr)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tls = match handshake(&ctx, stream).await {
        Ok(Handshake::Established(tls)) => tls,
        Ok(Handshake::Challenge) => {
            debug!(peer = %peer, "Answered TLS-ALPN-01 validation");
            return;
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "TLS handshake error");
            return;
        }
    };

    let (protocol, hostname) = {
        let (_, conn) = tls.get_ref();
        let protocol = conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        let hostname = conn.server_name().unwrap_or_default().to_string();
        (protocol, hostname)
    };

    let Some(backend) = ctx.routes.lookup(&protocol, &hostname).cloned() else {
        info!(
            peer = %peer,
            protocol = %protocol,
            hostname = %hostname,
            "Unable to find backend"
        );
        return;
    };

    debug!(peer = %peer, protocol = %protocol, hostname = %hostname, backend = %backend, "Routing connection");

    if let Err(e) = relay::relay(&ctx, tls, backend, peer).await {
        warn!(peer = %peer, error = %e, "Backend unavailable");
    }
}

async fn handshake<IO>(ctx: &ProxyContext, stream: IO) -> Result<Handshake<IO>, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .map_err(ProxyError::Handshake)?;

    let (server_name, challenge, config) = {
        let hello = start.client_hello();
        (
            hello.server_name().map(str::to_ascii_lowercase),
            is_challenge_alpn(hello.alpn()),
            Arc::clone(ctx.config_for(hello.alpn())),
        )
    };

    let server_name = server_name.ok_or(ProxyError::MissingServerName)?;

    if challenge {
        let mut tls = start
            .into_stream(Arc::clone(&ctx.challenge_tls))
            .await
            .map_err(ProxyError::Handshake)?;
        // Validation only needs the handshake itself
        let _ = tls.shutdown().await;
        return Ok(Handshake::Challenge);
    }

    ctx.certificates.ensure(&server_name).await?;

    let tls = start
        .into_stream(config)
        .await
        .map_err(ProxyError::Handshake)?;
    Ok(Handshake::Established(tls))
}

/// Run the accept loop for one listener until a fatal accept error.
pub async fn run<A>(acceptor: A, ctx: Arc<ProxyContext>) -> io::Result<()>
where
    A: Accept,
    A::Conn: AsyncRead + AsyncWrite + Unpin,
{
    listener::serve(acceptor, move |conn, peer| {
        handle_connection(Arc::clone(&ctx), conn, peer)
    })
    .await
}
