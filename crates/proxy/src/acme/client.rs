//! ACME client wrapper
//!
//! Drives `instant-acme` through a TLS-ALPN-01 order for a single domain.
//! Every call to the authority is bounded by the configured request timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tlsmux_common::Backoff;
use tlsmux_config::AcmeConfig;
use tokio::sync::OnceCell;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::challenge::ChallengeManager;
use super::error::AcmeError;
use super::storage::CertificateStorage;

/// Attempts when polling the authority for order status.
const MAX_POLL_ATTEMPTS: usize = 15;

/// First delay between order polls; doubles up to [`POLL_MAX_DELAY`].
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(250);
const POLL_MAX_DELAY: Duration = Duration::from_secs(5);

/// A freshly issued certificate.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded certificate chain
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

/// Obtains certificates for single domains.
///
/// The production implementation is [`AcmeClient`]; tests substitute a local
/// issuer.
#[async_trait]
pub trait CertificateIssuer: Send + Sync + std::fmt::Debug {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, AcmeError>;
}

/// ACME client for TLS-ALPN-01 issuance.
pub struct AcmeClient {
    directory_url: String,
    contact: Option<String>,
    request_timeout: Duration,
    storage: Arc<CertificateStorage>,
    challenges: ChallengeManager,
    account: OnceCell<Account>,
}

impl AcmeClient {
    pub fn new(
        config: &AcmeConfig,
        email: Option<&str>,
        storage: Arc<CertificateStorage>,
        challenges: ChallengeManager,
    ) -> Self {
        let directory_url = match (&config.directory_url, config.staging) {
            (Some(url), _) => url.clone(),
            (None, true) => LetsEncrypt::Staging.url().to_string(),
            (None, false) => LetsEncrypt::Production.url().to_string(),
        };

        Self {
            directory_url,
            contact: email
                .filter(|e| !e.is_empty())
                .map(|e| format!("mailto:{e}")),
            request_timeout: config.request_timeout(),
            storage,
            challenges,
            account: OnceCell::new(),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// Run one call against the authority under the request timeout.
    async fn timed<T, F>(&self, call: F) -> Result<T, AcmeError>
    where
        F: Future<Output = Result<T, instant_acme::Error>>,
    {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| AcmeError::Timeout(self.request_timeout))?
            .map_err(AcmeError::from)
    }

    /// Load the stored account or register a new one.
    ///
    /// Terms of service are accepted on registration.
    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(json) = self.storage.load_credentials_json()? {
                    match serde_json::from_str::<AccountCredentials>(&json) {
                        Ok(creds) => {
                            let account = self.timed(Account::from_credentials(creds)).await?;
                            debug!("Restored ACME account from cache");
                            return Ok(account);
                        }
                        Err(e) => {
                            warn!(error = %e, "Ignoring unreadable ACME credentials");
                        }
                    }
                }

                let contact: Vec<&str> = self.contact.as_deref().into_iter().collect();
                let (account, creds) = self
                    .timed(Account::create(
                        &NewAccount {
                            contact: &contact,
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        &self.directory_url,
                        None,
                    ))
                    .await?;

                let json = serde_json::to_string(&creds).map_err(|e| {
                    AcmeError::OrderCreation(format!("failed to serialize account credentials: {e}"))
                })?;
                self.storage.save_credentials_json(&json)?;

                info!(directory = %self.directory_url, "Registered ACME account");
                Ok(account)
            })
            .await
    }

    /// Answer every pending authorization with a TLS-ALPN-01 challenge.
    async fn authorize(&self, order: &mut Order, domain: &str) -> Result<(), AcmeError> {
        let authorizations = self.timed(order.authorizations()).await?;

        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::ChallengeValidation {
                        domain: domain.to_string(),
                        message: format!("authorization is {status:?}"),
                    });
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .ok_or_else(|| AcmeError::NoChallenge(domain.to_string()))?;

            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .add_challenge(domain, key_authorization.digest().as_ref())?;

            self.timed(order.set_challenge_ready(&challenge.url)).await?;
        }

        let mut backoff = Backoff::new(POLL_INITIAL_DELAY, POLL_MAX_DELAY);
        for _ in 0..MAX_POLL_ATTEMPTS {
            match self.timed(order.refresh()).await?.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::ChallengeValidation {
                        domain: domain.to_string(),
                        message: "order became invalid".to_string(),
                    });
                }
                _ => sleep(backoff.next_delay()).await,
            }
        }

        Err(AcmeError::ChallengeValidation {
            domain: domain.to_string(),
            message: "timed out waiting for validation".to_string(),
        })
    }

    /// Submit the CSR and wait for the certificate chain.
    async fn finalize(&self, order: &mut Order, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair)?;

        self.timed(order.finalize(csr.der())).await?;

        let mut backoff = Backoff::new(POLL_INITIAL_DELAY, POLL_MAX_DELAY);
        for _ in 0..MAX_POLL_ATTEMPTS {
            if let Some(cert_pem) = self.timed(order.certificate()).await? {
                return Ok(IssuedCertificate {
                    cert_pem,
                    key_pem: key_pair.serialize_pem(),
                });
            }
            sleep(backoff.next_delay()).await;
        }

        Err(AcmeError::Finalization(format!(
            "certificate for {domain} was not issued in time"
        )))
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        let start = Instant::now();
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = self
            .timed(account.new_order(&NewOrder {
                identifiers: &identifiers,
            }))
            .await?;

        info!(domain = %domain, "Created ACME order");

        // The challenge certificate must not outlive the attempt
        let authorized = self.authorize(&mut order, domain).await;
        self.challenges.remove_challenge(domain);
        authorized?;

        let issued = self.finalize(&mut order, domain).await?;

        info!(
            domain = %domain,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Certificate issued"
        );
        Ok(issued)
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("contact", &self.contact)
            .field("request_timeout", &self.request_timeout)
            .field("has_account", &self.account.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client(config: &AcmeConfig, email: Option<&str>) -> (TempDir, AcmeClient) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());
        let client = AcmeClient::new(config, email, storage, ChallengeManager::new());
        (temp_dir, client)
    }

    #[test]
    fn test_directory_selection() {
        let (_dir, production) = client(&AcmeConfig::default(), None);
        assert_eq!(production.directory_url(), LetsEncrypt::Production.url());

        let staging_config = AcmeConfig {
            staging: true,
            ..Default::default()
        };
        let (_dir, staging) = client(&staging_config, None);
        assert_eq!(staging.directory_url(), LetsEncrypt::Staging.url());

        let custom_config = AcmeConfig {
            directory_url: Some("https://acme.internal/directory".to_string()),
            staging: true,
            ..Default::default()
        };
        let (_dir, custom) = client(&custom_config, None);
        assert_eq!(custom.directory_url(), "https://acme.internal/directory");
    }

    #[test]
    fn test_contact_uses_mailto() {
        let (_dir, with_email) = client(&AcmeConfig::default(), Some("ops@example.com"));
        assert_eq!(with_email.contact.as_deref(), Some("mailto:ops@example.com"));

        let (_dir, empty_email) = client(&AcmeConfig::default(), Some(""));
        assert!(empty_email.contact.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_maps_elapsed_calls() {
        let (_dir, client) = client(&AcmeConfig::default(), None);

        let result: Result<(), AcmeError> = client
            .timed(async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AcmeError::Timeout(t)) if t == Duration::from_secs(15)));
    }
}
