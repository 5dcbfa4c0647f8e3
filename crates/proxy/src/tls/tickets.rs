//! Session ticket keys and their rotation.
//!
//! Tickets are sealed with AES-256-GCM under the newest key in a bounded,
//! newest-first ring. Each ticket carries the 16-byte name of the key that
//! sealed it, so any key still in the ring can open it. Once a key falls off
//! the end of the ring its tickets no longer decrypt and the client simply
//! performs a full handshake.
//!
//! # Ticket Layout
//!
//! ```text
//! key name (16) || nonce (12) || ciphertext + tag
//! ```
//!
//! The key name is also the AEAD associated data.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use arc_swap::ArcSwap;
use rand::rngs::OsRng;
use rand::RngCore;
use rustls::server::ProducesTickets;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Size of a ticket key secret.
pub const TICKET_KEY_LEN: usize = 32;

/// Size of the key name prefixed to every ticket.
pub const KEY_NAME_LEN: usize = 16;

const NONCE_LEN: usize = 12;

/// Upper bound on advertised ticket lifetime (RFC 8446 limit).
const MAX_TICKET_LIFETIME: Duration = Duration::from_secs(7 * 24 * 3600);

/// Session ticket key errors.
#[derive(Error, Debug)]
pub enum TicketKeyError {
    #[error("Secure random source unavailable: {0}")]
    Randomness(#[from] rand::Error),
}

/// One ticket encryption key.
pub struct TicketKey {
    name: [u8; KEY_NAME_LEN],
    cipher: Aes256Gcm,
}

impl TicketKey {
    /// Generate a fresh key from the operating system's secure random source.
    pub fn generate() -> Result<Self, TicketKeyError> {
        let mut secret = [0u8; TICKET_KEY_LEN];
        OsRng.try_fill_bytes(&mut secret)?;
        Ok(Self::from_secret(&secret))
    }

    /// Build a key from raw secret bytes.
    pub fn from_secret(secret: &[u8; TICKET_KEY_LEN]) -> Self {
        let digest = Sha256::digest(secret);
        let mut name = [0u8; KEY_NAME_LEN];
        name.copy_from_slice(&digest[..KEY_NAME_LEN]);

        Self {
            name,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret)),
        }
    }

    pub fn name(&self) -> &[u8; KEY_NAME_LEN] {
        &self.name
    }

    fn seal(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.try_fill_bytes(&mut nonce).ok()?;

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plain,
                    aad: &self.name,
                },
            )
            .ok()?;

        let mut ticket = Vec::with_capacity(KEY_NAME_LEN + NONCE_LEN + sealed.len());
        ticket.extend_from_slice(&self.name);
        ticket.extend_from_slice(&nonce);
        ticket.extend_from_slice(&sealed);
        Some(ticket)
    }

    fn open(&self, nonce: &[u8], sealed: &[u8]) -> Option<Vec<u8>> {
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &self.name,
                },
            )
            .ok()
    }
}

impl fmt::Debug for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketKey")
            .field("name", &format_args!("{:02x?}", &self.name[..4]))
            .finish_non_exhaustive()
    }
}

/// Bounded newest-first ring of ticket keys.
#[derive(Debug, Clone)]
pub struct SessionKeySet {
    keys: Vec<Arc<TicketKey>>,
    capacity: usize,
}

impl SessionKeySet {
    /// Start a ring holding a single key. Capacity is at least one.
    pub fn new(initial: TicketKey, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut keys = Vec::with_capacity(capacity);
        keys.push(Arc::new(initial));
        Self { keys, capacity }
    }

    /// A new ring with `fresh` in front, dropping the oldest key when full.
    pub fn rotated(&self, fresh: Arc<TicketKey>) -> Self {
        let mut keys = Vec::with_capacity(self.capacity);
        keys.push(fresh);
        keys.extend(self.keys.iter().take(self.capacity - 1).cloned());
        Self {
            keys,
            capacity: self.capacity,
        }
    }

    /// Key used to seal new tickets.
    pub fn newest(&self) -> &TicketKey {
        &self.keys[0]
    }

    /// Key with the given name, if it is still in the ring.
    pub fn find(&self, name: &[u8]) -> Option<&TicketKey> {
        self.keys
            .iter()
            .map(|k| k.as_ref())
            .find(|k| k.name.as_slice() == name)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Key names, newest first.
    pub fn names(&self) -> impl Iterator<Item = &[u8; KEY_NAME_LEN]> {
        self.keys.iter().map(|k| &k.name)
    }
}

/// rustls ticket producer backed by an atomically swappable key ring.
///
/// Handshakes load whichever ring is current; rotation installs a whole new
/// ring, so a handshake never sees a partially updated list.
pub struct RotatingTicketer {
    keys: ArcSwap<SessionKeySet>,
    lifetime: u32,
}

impl RotatingTicketer {
    /// Create a ticketer around an existing ring.
    ///
    /// Tickets are advertised as valid for as long as their key can stay in
    /// the ring, capped at seven days.
    pub fn new(keys: SessionKeySet, rotation_interval: Duration) -> Self {
        let retention = rotation_interval.saturating_mul(keys.capacity() as u32);
        let lifetime = retention.min(MAX_TICKET_LIFETIME).as_secs() as u32;

        Self {
            keys: ArcSwap::from_pointee(keys),
            lifetime,
        }
    }

    /// Create a ticketer with one freshly generated key.
    pub fn generate(capacity: usize, rotation_interval: Duration) -> Result<Self, TicketKeyError> {
        let initial = TicketKey::generate()?;
        Ok(Self::new(SessionKeySet::new(initial, capacity), rotation_interval))
    }

    /// Snapshot of the current ring.
    pub fn current(&self) -> Arc<SessionKeySet> {
        self.keys.load_full()
    }

    /// Generate a key and install it at the front of the ring.
    pub fn rotate(&self) -> Result<(), TicketKeyError> {
        let fresh = Arc::new(TicketKey::generate()?);
        self.keys.rcu(|set| set.rotated(Arc::clone(&fresh)));
        Ok(())
    }
}

impl fmt::Debug for RotatingTicketer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.keys.load();
        f.debug_struct("RotatingTicketer")
            .field("keys", &keys.len())
            .field("capacity", &keys.capacity())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl ProducesTickets for RotatingTicketer {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        self.lifetime
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        self.keys.load().newest().seal(plain)
    }

    fn decrypt(&self, ticket: &[u8]) -> Option<Vec<u8>> {
        if ticket.len() < KEY_NAME_LEN + NONCE_LEN {
            return None;
        }
        let (name, rest) = ticket.split_at(KEY_NAME_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let keys = self.keys.load();
        let Some(key) = keys.find(name) else {
            trace!("Session ticket key not found, falling back to full handshake");
            return None;
        };
        key.open(nonce, sealed)
    }
}

/// Background task replacing the newest ticket key on a fixed period.
#[derive(Debug)]
pub struct SessionKeyRotator {
    ticketer: Arc<RotatingTicketer>,
    period: Duration,
}

impl SessionKeyRotator {
    pub fn new(ticketer: Arc<RotatingTicketer>, period: Duration) -> Self {
        Self { ticketer, period }
    }

    /// Rotate every period until cancelled.
    ///
    /// A randomness failure ends the task with an error; the caller treats
    /// it as fatal.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TicketKeyError> {
        info!(
            period_secs = self.period.as_secs(),
            capacity = self.ticketer.current().capacity(),
            "Starting session ticket key rotation"
        );

        let mut ticks = interval_at(Instant::now() + self.period, self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Session ticket key rotation stopped");
                    return Ok(());
                }
                _ = ticks.tick() => {
                    if let Err(e) = self.ticketer.rotate() {
                        error!(error = %e, "Error generating session ticket key");
                        return Err(e);
                    }
                    debug!(keys = self.ticketer.current().len(), "Rotated session ticket key");
                }
            }
        }
    }
}
