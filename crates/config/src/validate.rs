//! Range checks for tunables.
//!
//! Structural checks (protocols, hosts, cache directory) happen while the
//! routing table is built; these run afterwards.

use crate::{ConfigError, ProxyConfig};

/// Smallest relay buffer accepted.
pub const MIN_BUFFER_SIZE: usize = 1024;

pub(crate) fn validate_tunables(config: &ProxyConfig) -> Result<(), ConfigError> {
    if config.session_tickets.key_capacity < 1 {
        return Err(ConfigError::OutOfRange {
            field: "sessionTickets.keyCapacity",
            min: 1,
        });
    }
    if config.session_tickets.rotation_interval_secs < 1 {
        return Err(ConfigError::OutOfRange {
            field: "sessionTickets.rotationIntervalSecs",
            min: 1,
        });
    }
    if config.relay.buffer_size < MIN_BUFFER_SIZE {
        return Err(ConfigError::OutOfRange {
            field: "relay.bufferSize",
            min: MIN_BUFFER_SIZE as u64,
        });
    }
    if config.relay.dial_timeout_ms < 1 {
        return Err(ConfigError::OutOfRange {
            field: "relay.dialTimeoutMs",
            min: 1,
        });
    }
    if config.acme.request_timeout_secs < 1 {
        return Err(ConfigError::OutOfRange {
            field: "acme.requestTimeoutSecs",
            min: 1,
        });
    }
    Ok(())
}
