//! Process-wide state shared by every connection handler.

use std::sync::Arc;
use std::time::Duration;

use rustls::server::ProducesTickets;
use rustls::ServerConfig;
use tlsmux_common::BufferPool;
use tlsmux_config::{RelayConfig, RoutingTable};

use crate::acme::CertificateProvider;
use crate::error::ProxyError;
use crate::tls::{build_challenge_config, build_server_config, CertResolver, RotatingTicketer};

/// Everything a connection needs, built once at startup.
///
/// Handlers receive it as `Arc<ProxyContext>`. The only state that changes
/// after construction is the ticket key ring inside the TLS configuration
/// and the certificate cache, both of which synchronize internally.
#[derive(Debug)]
pub struct ProxyContext {
    pub routes: RoutingTable,
    /// Configuration for routed handshakes
    pub tls: Arc<ServerConfig>,
    /// Same as `tls` without ALPN, for clients offering none of our protocols
    pub fallback_tls: Arc<ServerConfig>,
    /// Configuration for TLS-ALPN-01 validation handshakes
    pub challenge_tls: Arc<ServerConfig>,
    pub certificates: Arc<CertificateProvider>,
    pub ticketer: Arc<RotatingTicketer>,
    pub buffers: Arc<BufferPool>,
    pub dial_timeout: Duration,
}

impl ProxyContext {
    pub fn new(
        routes: RoutingTable,
        certificates: Arc<CertificateProvider>,
        ticketer: Arc<RotatingTicketer>,
        relay: &RelayConfig,
    ) -> Result<Self, ProxyError> {
        let resolver = Arc::new(CertResolver::new(
            certificates.cache(),
            certificates.challenges().clone(),
        ));

        let tls = build_server_config(
            Arc::clone(&resolver),
            routes.protocols(),
            Arc::clone(&ticketer) as Arc<dyn ProducesTickets>,
        )?;
        let fallback_tls = build_server_config(
            Arc::clone(&resolver),
            &[],
            Arc::clone(&ticketer) as Arc<dyn ProducesTickets>,
        )?;
        let challenge_tls = build_challenge_config(resolver)?;

        Ok(Self {
            routes,
            tls,
            fallback_tls,
            challenge_tls,
            certificates,
            ticketer,
            buffers: Arc::new(BufferPool::new(relay.buffer_size)),
            dial_timeout: relay.dial_timeout(),
        })
    }

    /// Configuration to finish a handshake with, given the client's ALPN offer.
    ///
    /// rustls refuses a client whose offer shares nothing with ours. Such a
    /// client gets the ALPN-less configuration instead and is routed through
    /// the default protocol, like one that offered nothing.
    pub fn config_for<'a>(
        &self,
        offered: Option<impl Iterator<Item = &'a [u8]>>,
    ) -> &Arc<ServerConfig> {
        let Some(mut offered) = offered else {
            return &self.tls;
        };
        let protocols = self.routes.protocols();
        if offered.any(|p| protocols.iter().any(|c| c.as_bytes() == p)) {
            &self.tls
        } else {
            &self.fallback_tls
        }
    }
}
