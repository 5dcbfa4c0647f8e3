//! tlsmux proxy library
//!
//! A TLS-terminating reverse proxy that serves several backends behind one
//! port. Each connection is routed by the ALPN protocol it negotiates and
//! the server name it presents; certificates come from an ACME authority on
//! first use.
//!
//! - **Acceptor**: one accept loop per bound interface with backoff on
//!   temporary failures
//! - **Handshake Router**: TLS handshake, ALPN + SNI lookup in the routing table
//! - **Relay**: bidirectional copy with pooled buffers and single-shot teardown
//! - **TLS Endpoint**: server configuration and rotating session ticket keys
//! - **Certificate Provider**: on-demand ACME issuance, disk cache, renewal
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tlsmux_proxy::{bind, handshake, ProxyContext};
//!
//! let ctx = Arc::new(ProxyContext::new(routes, provider, ticketer, &config.relay)?);
//! let acceptor = bind("", config.port)?;
//! handshake::run(acceptor, ctx).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod context;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod relay;
pub mod signals;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Shared connection state
pub use context::ProxyContext;

// Errors
pub use error::ProxyError;

// Acceptor
pub use listener::{bind, Accept, TcpAcceptor};

// Handshake routing
pub use handshake::handle_connection;

// Relay
pub use relay::{Direction, RelaySummary, Teardown};

// TLS endpoint
pub use tls::{CertResolver, RotatingTicketer, SessionKeyRotator, SessionKeySet};

// Certificates
pub use acme::{
    AcmeClient, AcmeError, CertificateIssuer, CertificateProvider, CertificateStorage,
    ChallengeManager, IssuedCertificate, RenewalScheduler,
};

// Signals
pub use signals::{ShutdownSignals, SignalType};
