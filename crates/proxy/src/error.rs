//! Connection and startup error types.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::acme::AcmeError;
use crate::tls::TicketKeyError;

/// Errors raised while setting up the proxy or serving a connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("Client did not send a server name")]
    MissingServerName,

    #[error("Certificate unavailable: {0}")]
    Certificate(#[from] AcmeError),

    #[error("Failed to connect to {backend} at {addr}: {source}")]
    Dial {
        backend: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {backend} at {addr} after {timeout:?}")]
    DialTimeout {
        backend: String,
        addr: String,
        timeout: Duration,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot resolve bind interface {interface:?}: {source}")]
    Resolve {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Session ticket key error: {0}")]
    TicketKey(#[from] TicketKeyError),
}
