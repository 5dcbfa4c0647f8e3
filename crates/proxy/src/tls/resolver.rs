//! SNI certificate resolver.
//!
//! rustls calls the resolver synchronously in the middle of a handshake, so
//! it only reads in-memory state. Issuance happens earlier, in the handshake
//! router, before the configuration is handed to rustls.

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::debug;

use crate::acme::{is_challenge_alpn, CertificateCache, ChallengeManager};

/// Picks the certificate for a handshake by server name.
///
/// TLS-ALPN-01 validation handshakes get the pending challenge certificate;
/// all other handshakes get the cached certificate for the name.
#[derive(Debug)]
pub struct CertResolver {
    certificates: Arc<CertificateCache>,
    challenges: ChallengeManager,
}

impl CertResolver {
    pub fn new(certificates: Arc<CertificateCache>, challenges: ChallengeManager) -> Self {
        Self {
            certificates,
            challenges,
        }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_ascii_lowercase();

        if is_challenge_alpn(client_hello.alpn()) {
            return self.challenges.get_certificate(&name);
        }

        let cert = self.certificates.get(&name);
        if cert.is_none() {
            debug!(server_name = %name, "No certificate available");
        }
        cert
    }
}
