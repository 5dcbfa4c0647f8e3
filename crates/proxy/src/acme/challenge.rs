//! TLS-ALPN-01 ACME challenge management
//!
//! While an order is pending, the authority connects to the domain on port
//! 443 offering only the `acme-tls/1` protocol and expects a self-signed
//! certificate that carries the key-authorization digest. This manager holds
//! those certificates, keyed by domain, for the certificate resolver.

use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, trace};

use super::error::AcmeError;
use crate::tls::certified_key_from_der;

/// ALPN protocol identifier used by TLS-ALPN-01 validation.
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Whether a ClientHello's ALPN offer is a TLS-ALPN-01 validation attempt.
///
/// Validators offer exactly one protocol, `acme-tls/1`.
pub fn is_challenge_alpn<'a>(offered: Option<impl Iterator<Item = &'a [u8]>>) -> bool {
    let Some(mut offered) = offered else {
        return false;
    };
    offered.next() == Some(ACME_TLS_ALPN) && offered.next().is_none()
}

/// Pending TLS-ALPN-01 challenge certificates.
///
/// # Thread Safety
///
/// Uses `DashMap` so the issuing task can register challenges while
/// handshakes read them concurrently. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    /// Domain -> challenge certificate
    challenges: Arc<DashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge for `domain`.
    ///
    /// Builds the self-signed validation certificate embedding
    /// `key_authorization_digest` (SHA-256 of the key authorization).
    pub fn add_challenge(
        &self,
        domain: &str,
        key_authorization_digest: &[u8],
    ) -> Result<(), AcmeError> {
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.custom_extensions = vec![CustomExtension::new_acme_identifier(
            key_authorization_digest,
        )];
        let cert = params.self_signed(&key_pair)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let certified = certified_key_from_der(vec![cert.der().clone()], key_der)?;

        debug!(domain = %domain, "Registering ACME TLS-ALPN-01 challenge");
        self.challenges
            .insert(domain.to_string(), Arc::new(certified));
        Ok(())
    }

    /// Remove a completed or abandoned challenge.
    pub fn remove_challenge(&self, domain: &str) {
        if self.challenges.remove(domain).is_some() {
            debug!(domain = %domain, "Removed ACME challenge");
        }
    }

    /// Challenge certificate for a domain, if one is pending.
    pub fn get_certificate(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        let result = self.challenges.get(domain).map(|v| Arc::clone(&v));
        trace!(domain = %domain, found = result.is_some(), "ACME challenge lookup");
        result
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: [u8; 32] = [7u8; 32];

    #[test]
    fn test_add_and_get_challenge() {
        let manager = ChallengeManager::new();

        manager.add_challenge("a.example", &DIGEST).unwrap();

        let cert = manager.get_certificate("a.example").unwrap();
        assert_eq!(cert.cert.len(), 1);
        assert!(manager.get_certificate("b.example").is_none());
    }

    #[test]
    fn test_challenge_certificate_carries_acme_identifier() {
        let manager = ChallengeManager::new();
        manager.add_challenge("a.example", &DIGEST).unwrap();

        let cert = manager.get_certificate("a.example").unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.cert[0].as_ref()).unwrap();

        // id-pe-acmeIdentifier, RFC 8737
        let ext = parsed
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == "1.3.6.1.5.5.7.1.31")
            .unwrap();
        assert!(ext.critical);
        assert!(ext.value.ends_with(&DIGEST));
    }

    #[test]
    fn test_remove_challenge() {
        let manager = ChallengeManager::new();

        manager.add_challenge("a.example", &DIGEST).unwrap();
        assert_eq!(manager.pending_count(), 1);

        manager.remove_challenge("a.example");
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.get_certificate("a.example").is_none());
    }

    #[test]
    fn test_clone_shares_state() {
        let manager1 = ChallengeManager::new();
        let manager2 = manager1.clone();

        manager1.add_challenge("a.example", &DIGEST).unwrap();

        assert!(manager2.get_certificate("a.example").is_some());
    }

    #[test]
    fn test_is_challenge_alpn() {
        let only_acme: Vec<&[u8]> = vec![b"acme-tls/1"];
        let mixed: Vec<&[u8]> = vec![b"h2", b"acme-tls/1"];
        let none: Vec<&[u8]> = vec![];

        assert!(is_challenge_alpn(Some(only_acme.into_iter())));
        assert!(!is_challenge_alpn(Some(mixed.into_iter())));
        assert!(!is_challenge_alpn(Some(none.into_iter())));
        assert!(!is_challenge_alpn(None::<std::vec::IntoIter<&[u8]>>));
    }
}
