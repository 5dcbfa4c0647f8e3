//! On-demand certificate provider
//!
//! Makes sure a certificate exists for a server name before its handshake
//! proceeds. Lookups go to memory first, then to the on-disk cache, and only
//! then to the issuer. Names outside the allow-list are refused.
//!
//! Certificates inside the renewal window keep being served while a single
//! background task replaces them. A failed renewal is not retried for that
//! name until its backoff delay has passed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use rustls::sign::CertifiedKey;
use tlsmux_common::Backoff;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::challenge::ChallengeManager;
use super::client::CertificateIssuer;
use super::error::AcmeError;
use super::storage::{CertificateStorage, StoredCertificate};
use crate::tls::{certificate_expiry, certified_key_from_pem};

/// First wait after a failed renewal; doubles up to [`RENEWAL_RETRY_MAX`].
const RENEWAL_RETRY_INITIAL: Duration = Duration::from_secs(60);
const RENEWAL_RETRY_MAX: Duration = Duration::from_secs(6 * 60 * 60);

/// Renewal attempts that failed for one name.
#[derive(Debug)]
struct RenewalFailure {
    backoff: Backoff,
    retry_at: Instant,
}

/// A certificate ready for handshakes.
#[derive(Debug, Clone)]
struct CachedCertificate {
    key: Arc<CertifiedKey>,
    expires: DateTime<Utc>,
}

/// In-memory certificates keyed by lowercase server name.
///
/// Shared between the provider, which fills it, and the certificate
/// resolver, which reads it during handshakes.
#[derive(Debug, Default)]
pub struct CertificateCache {
    entries: DashMap<String, CachedCertificate>,
}

impl CertificateCache {
    /// Certificate for `name` if present and not yet expired.
    pub fn get(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let entry = self.entries.get(name)?;
        if entry.expires <= Utc::now() {
            return None;
        }
        Some(Arc::clone(&entry.key))
    }

    fn expiry(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries.get(name).map(|entry| entry.expires)
    }

    fn insert(&self, name: &str, key: Arc<CertifiedKey>, expires: DateTime<Utc>) {
        self.entries
            .insert(name.to_string(), CachedCertificate { key, expires });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Supplies certificates for allow-listed server names.
#[derive(Debug)]
pub struct CertificateProvider {
    allowed: HashSet<String>,
    cache: Arc<CertificateCache>,
    storage: Arc<CertificateStorage>,
    issuer: Arc<dyn CertificateIssuer>,
    challenges: ChallengeManager,
    /// Serializes loading and issuance per name
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Names with a background renewal in flight
    renewing: DashSet<String>,
    failures: DashMap<String, RenewalFailure>,
    renew_before: chrono::Duration,
}

impl CertificateProvider {
    pub fn new(
        hostnames: &[String],
        storage: Arc<CertificateStorage>,
        issuer: Arc<dyn CertificateIssuer>,
        challenges: ChallengeManager,
        renew_before_days: u32,
    ) -> Self {
        Self {
            allowed: hostnames.iter().map(|h| h.to_ascii_lowercase()).collect(),
            cache: Arc::new(CertificateCache::default()),
            storage,
            issuer,
            challenges,
            locks: DashMap::new(),
            renewing: DashSet::new(),
            failures: DashMap::new(),
            renew_before: chrono::Duration::days(i64::from(renew_before_days)),
        }
    }

    /// Cache read by the certificate resolver.
    pub fn cache(&self) -> Arc<CertificateCache> {
        Arc::clone(&self.cache)
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    /// Make sure a usable certificate for `name` is in memory.
    ///
    /// Returns once the certificate can be served. A certificate inside the
    /// renewal window counts as usable and triggers a background renewal.
    pub async fn ensure(self: &Arc<Self>, name: &str) -> Result<(), AcmeError> {
        let name = name.to_ascii_lowercase();
        if !self.is_allowed(&name) {
            return Err(AcmeError::HostNotAllowed(name));
        }

        if self.serve_cached(&name) {
            return Ok(());
        }

        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;

        // Filled while we waited for the lock
        if self.serve_cached(&name) {
            return Ok(());
        }

        if let Some(stored) = self.storage.load_certificate(&name)? {
            if !stored.is_expired(Utc::now()) {
                match self.install(&name, &stored) {
                    Ok(expires) => {
                        debug!(domain = %name, expires = %expires, "Using cached certificate");
                        if self.needs_renewal(expires) {
                            self.spawn_renewal(&name);
                        }
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(domain = %name, error = %e, "Discarding unusable cached certificate");
                    }
                }
            }
        }

        self.obtain(&name).await
    }

    /// Start background renewal for every in-memory certificate that is due.
    ///
    /// Returns the number of names scheduled.
    pub fn renew_due(self: &Arc<Self>) -> usize {
        let due: Vec<String> = self
            .cache
            .entries
            .iter()
            .filter(|entry| self.needs_renewal(entry.expires))
            .map(|entry| entry.key().clone())
            .collect();

        for name in &due {
            self.spawn_renewal(name);
        }
        due.len()
    }

    /// True when a live certificate is cached; schedules renewal if it is due.
    fn serve_cached(self: &Arc<Self>, name: &str) -> bool {
        let Some(expires) = self.cache.expiry(name) else {
            return false;
        };
        if expires <= Utc::now() {
            return false;
        }
        if self.needs_renewal(expires) {
            self.spawn_renewal(name);
        }
        true
    }

    fn needs_renewal(&self, expires: DateTime<Utc>) -> bool {
        expires <= Utc::now() + self.renew_before
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(name.to_string()).or_default().value())
    }

    fn install(&self, name: &str, stored: &StoredCertificate) -> Result<DateTime<Utc>, AcmeError> {
        let key = certified_key_from_pem(&stored.cert_pem, &stored.key_pem)?;
        self.cache.insert(name, Arc::new(key), stored.meta.expires);
        Ok(stored.meta.expires)
    }

    /// Issue, persist and cache a certificate. Caller holds the name's lock.
    async fn obtain(&self, name: &str) -> Result<(), AcmeError> {
        info!(domain = %name, "Obtaining certificate");

        let issued = self.issuer.issue(name).await?;
        let key = certified_key_from_pem(&issued.cert_pem, &issued.key_pem)?;
        let expires = certificate_expiry(&issued.cert_pem)?;

        // Disk cache is best effort; the in-memory copy still serves
        if let Err(e) = self
            .storage
            .save_certificate(name, &issued.cert_pem, &issued.key_pem, expires)
        {
            warn!(domain = %name, error = %e, "Failed to cache certificate on disk");
        }

        self.cache.insert(name, Arc::new(key), expires);
        Ok(())
    }

    /// Note a failed renewal and return how long to wait before the next one.
    fn record_failure(&self, name: &str) -> Duration {
        let mut failure = self
            .failures
            .entry(name.to_string())
            .or_insert_with(|| RenewalFailure {
                backoff: Backoff::new(RENEWAL_RETRY_INITIAL, RENEWAL_RETRY_MAX),
                retry_at: Instant::now(),
            });
        let delay = failure.backoff.next_delay();
        failure.retry_at = Instant::now() + delay;
        delay
    }

    fn retry_pending(&self, name: &str) -> bool {
        self.failures
            .get(name)
            .is_some_and(|failure| Instant::now() < failure.retry_at)
    }

    fn spawn_renewal(self: &Arc<Self>, name: &str) {
        if self.retry_pending(name) || !self.renewing.insert(name.to_string()) {
            return;
        }

        let provider = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let lock = provider.lock_for(&name);
            let guard = lock.lock().await;

            let still_due = provider
                .cache
                .expiry(&name)
                .map_or(true, |expires| provider.needs_renewal(expires));

            if still_due {
                info!(domain = %name, "Renewing certificate");
                match provider.obtain(&name).await {
                    Ok(()) => {
                        provider.failures.remove(&name);
                    }
                    Err(e) => {
                        let retry_in = provider.record_failure(&name);
                        error!(
                            domain = %name,
                            error = %e,
                            retry_in_secs = retry_in.as_secs(),
                            "Certificate renewal failed"
                        );
                    }
                }
            }

            drop(guard);
            provider.renewing.remove(&name);
        });
    }
}
