//! Background certificate renewal scheduler
//!
//! Handshakes renew certificates they find near expiry, but a name that
//! receives no traffic would otherwise be left to lapse. The scheduler sweeps
//! the in-memory certificates periodically and renews those that are due.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::provider::CertificateProvider;

/// Default check interval (12 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 minute)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic renewal sweep over cached certificates.
pub struct RenewalScheduler {
    provider: Arc<CertificateProvider>,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(provider: Arc<CertificateProvider>) -> Self {
        Self {
            provider,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the check interval, clamped to at least one minute.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Sweep at the configured interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        let mut ticks = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Certificate renewal scheduler stopped");
                    return;
                }
                _ = ticks.tick() => {
                    let scheduled = self.provider.renew_due();
                    if scheduled > 0 {
                        info!(scheduled, "Scheduled certificate renewals");
                    } else {
                        debug!("No certificates due for renewal");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("cached_certificates", &self.provider.cache().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AcmeError, CertificateIssuer, CertificateStorage, ChallengeManager, IssuedCertificate};
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct NeverIssues;

    #[async_trait]
    impl CertificateIssuer for NeverIssues {
        async fn issue(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
            Err(AcmeError::OrderCreation(format!("refusing {domain}")))
        }
    }

    #[test]
    fn test_interval_clamped() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(dir.path()).unwrap());
        let provider = Arc::new(CertificateProvider::new(
            &[],
            storage,
            Arc::new(NeverIssues),
            ChallengeManager::new(),
            30,
        ));

        let scheduler = RenewalScheduler::new(provider).with_interval(Duration::from_secs(1));
        assert_eq!(scheduler.check_interval, MIN_CHECK_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(dir.path()).unwrap());
        let provider = Arc::new(CertificateProvider::new(
            &["a.example".to_string()],
            storage,
            Arc::new(NeverIssues),
            ChallengeManager::new(),
            30,
        ));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(RenewalScheduler::new(provider).run(cancel.clone()));

        // A few empty sweeps, then shutdown
        tokio::time::sleep(DEFAULT_CHECK_INTERVAL * 3).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
