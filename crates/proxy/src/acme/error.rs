//! ACME and certificate storage error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while obtaining or loading certificates.
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("ACME request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Host {0:?} is not in the allow-list")]
    HostNotAllowed(String),

    #[error("Order creation failed: {0}")]
    OrderCreation(String),

    #[error("No TLS-ALPN-01 challenge offered for {0}")]
    NoChallenge(String),

    #[error("Challenge validation failed for {domain}: {message}")]
    ChallengeValidation { domain: String, message: String },

    #[error("Order finalization failed: {0}")]
    Finalization(String),

    #[error("Certificate generation failed: {0}")]
    CertGeneration(#[from] rcgen::Error),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the on-disk certificate cache.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
