//! TLS endpoint configuration.
//!
//! Assembles the shared rustls [`ServerConfig`]: TLS 1.2 minimum, the
//! configured protocols advertised over ALPN, certificates chosen per SNI by
//! the [`CertResolver`], and session tickets sealed under the rotating
//! [`RotatingTicketer`] key set.

mod resolver;
pub mod tickets;

use std::io::BufReader;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ProducesTickets;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::acme::{AcmeError, ACME_TLS_ALPN};

pub use resolver::CertResolver;
pub use tickets::{RotatingTicketer, SessionKeyRotator, SessionKeySet, TicketKey, TicketKeyError};

/// Crypto provider used for every TLS configuration in the proxy.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Build the configuration used for routed connections.
pub fn build_server_config(
    resolver: Arc<CertResolver>,
    protocols: &[String],
    ticketer: Arc<dyn ProducesTickets>,
) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    config.ticketer = ticketer;

    Ok(Arc::new(config))
}

/// Build the configuration used to answer TLS-ALPN-01 validation handshakes.
pub fn build_challenge_config(resolver: Arc<CertResolver>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![ACME_TLS_ALPN.to_vec()];
    config.send_tls13_tickets = 0;

    Ok(Arc::new(config))
}

/// Turn a DER chain and key into a signing-ready certified key.
pub fn certified_key_from_der(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, rustls::Error> {
    let signing_key = crypto_provider().key_provider.load_private_key(key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Parse a PEM chain and PEM private key into a certified key.
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, AcmeError> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AcmeError::InvalidCertificate(format!("unreadable certificate PEM: {e}")))?;
    if chain.is_empty() {
        return Err(AcmeError::InvalidCertificate(
            "no certificate found in PEM".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
        .map_err(|e| AcmeError::InvalidCertificate(format!("unreadable private key PEM: {e}")))?
        .ok_or_else(|| AcmeError::InvalidCertificate("no private key found in PEM".to_string()))?;

    Ok(certified_key_from_der(chain, key)?)
}

/// Expiry (`notAfter`) of the leaf certificate in a PEM chain.
pub fn certificate_expiry(cert_pem: &str) -> Result<chrono::DateTime<chrono::Utc>, AcmeError> {
    let leaf = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
        .next()
        .ok_or_else(|| AcmeError::InvalidCertificate("no certificate found in PEM".to_string()))?
        .map_err(|e| AcmeError::InvalidCertificate(format!("unreadable certificate PEM: {e}")))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| AcmeError::InvalidCertificate(format!("unparseable certificate: {e}")))?;

    let not_after = parsed.validity().not_after.timestamp();
    chrono::DateTime::from_timestamp(not_after, 0)
        .ok_or_else(|| AcmeError::InvalidCertificate(format!("notAfter out of range: {not_after}")))
}
