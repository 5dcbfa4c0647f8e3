//! ACME automatic certificate management
//!
//! Obtains certificates from Let's Encrypt (or any ACME directory) on the
//! first handshake for each allow-listed server name, and renews them as
//! they approach expiry.
//!
//! # Architecture
//!
//! - [`CertificateProvider`] - Allow-list, in-memory cache and issuance orchestration
//! - [`AcmeClient`] - Wrapper around `instant-acme` implementing [`CertificateIssuer`]
//! - [`CertificateStorage`] - On-disk cache of certificates and account credentials
//! - [`ChallengeManager`] - Pending TLS-ALPN-01 challenge certificates
//! - [`RenewalScheduler`] - Periodic sweep renewing idle certificates
//!
//! # Challenge Flow
//!
//! 1. A handshake arrives for an allow-listed name without a usable certificate
//! 2. [`AcmeClient`] creates an order and picks the TLS-ALPN-01 challenge
//! 3. [`ChallengeManager`] registers a self-signed certificate carrying the
//!    key-authorization digest
//! 4. The authority connects offering only `acme-tls/1` and receives that certificate
//! 5. Once the order is ready, [`AcmeClient`] finalizes it with a fresh key
//! 6. [`CertificateStorage`] persists the result and the provider caches it

mod challenge;
mod client;
mod error;
mod provider;
mod scheduler;
mod storage;

pub use challenge::{is_challenge_alpn, ChallengeManager, ACME_TLS_ALPN};
pub use client::{AcmeClient, CertificateIssuer, IssuedCertificate};
pub use error::{AcmeError, StorageError};
pub use provider::{CertificateCache, CertificateProvider};
pub use scheduler::RenewalScheduler;
pub use storage::CertificateStorage;
