//! Configuration for the tlsmux proxy.
//!
//! The configuration document lists the protocols the proxy advertises over
//! ALPN and, for each protocol, which backend serves each TLS server name.
//! It is read once at startup (JSON or TOML), validated, and turned into an
//! immutable [`RoutingTable`].
//!
//! # Example
//!
//! ```json
//! {
//!   "bindInterfaces": [""],
//!   "email": "admin@example.com",
//!   "cacheDir": "/var/cache/tlsmuxd",
//!   "protos": [
//!     { "name": "h2", "hosts": { "example.com": "127.0.0.1:8080" } },
//!     { "name": "http/1.1", "hosts": { "example.com": "127.0.0.1:8081" } }
//!   ],
//!   "defaultProto": "http/1.1"
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

mod error;
mod routing;
mod validate;

pub use error::ConfigError;
pub use routing::{Backend, HostMap, RoutingTable};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 443;

const WILDCARD_INTERFACES: &[String] = &[String::new()];

/// Top-level proxy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Interfaces to listen on; `""` is the wildcard address.
    #[serde(default)]
    pub bind_interfaces: Vec<String>,

    /// Listening port on every interface.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Contact address registered with the certificate authority.
    #[serde(default)]
    pub email: Option<String>,

    /// Directory holding issued certificates and account credentials.
    #[serde(default)]
    pub cache_dir: String,

    /// Protocol definitions, in ALPN advertisement order.
    #[serde(default)]
    pub protos: Vec<ProtocolConfig>,

    /// Protocol used when the client negotiates no ALPN protocol.
    #[serde(default)]
    pub default_proto: String,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub session_tickets: SessionTicketConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

/// One ALPN protocol and the backends serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// ALPN protocol name, e.g. `h2`.
    #[serde(default)]
    pub name: String,

    /// Server name to backend address (`host:port`).
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
}

/// Certificate authority settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeConfig {
    /// ACME directory URL; overrides `staging` when set.
    #[serde(default)]
    pub directory_url: Option<String>,

    /// Use the Let's Encrypt staging environment.
    #[serde(default)]
    pub staging: bool,

    /// Renew certificates this many days before they expire.
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,

    /// Bound on every network call to the certificate authority.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl AcmeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: None,
            staging: false,
            renew_before_days: default_renew_before_days(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Session ticket key rotation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicketConfig {
    /// Seconds between key rotations.
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,

    /// Number of keys retained for decrypting older tickets.
    #[serde(default = "default_key_capacity")]
    pub key_capacity: usize,
}

impl SessionTicketConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
}

impl Default for SessionTicketConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_interval_secs(),
            key_capacity: default_key_capacity(),
        }
    }
}

/// Backend relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Backend connect timeout in milliseconds.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Size of each pooled copy buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl RelayConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_rotation_interval_secs() -> u64 {
    3600
}

fn default_key_capacity() -> usize {
    96
}

fn default_dial_timeout_ms() -> u64 {
    3000
}

fn default_buffer_size() -> usize {
    32 * 1024
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_interfaces: Vec::new(),
            port: DEFAULT_PORT,
            email: None,
            cache_dir: String::new(),
            protos: Vec::new(),
            default_proto: String::new(),
            acme: AcmeConfig::default(),
            session_tickets: SessionTicketConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a file.
    ///
    /// Files ending in `.toml` are parsed as TOML, everything else as JSON.
    /// The result is not validated; call [`ProxyConfig::routing_table`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        debug!(path = %path.display(), toml = is_toml, "Parsing configuration file");

        if is_toml {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Interfaces to bind, defaulting to the single wildcard interface.
    pub fn bind_interfaces(&self) -> &[String] {
        if self.bind_interfaces.is_empty() {
            WILDCARD_INTERFACES
        } else {
            &self.bind_interfaces
        }
    }

    /// Validate the configuration and build its routing table.
    pub fn routing_table(&self) -> Result<RoutingTable, ConfigError> {
        let table = RoutingTable::build(self)?;
        validate::validate_tunables(self)?;
        Ok(table)
    }

    /// Validate without keeping the routing table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.routing_table().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_JSON: &str = r#"{
        "email": "ops@example.com",
        "cacheDir": "/var/cache/tlsmuxd",
        "protos": [
            { "name": "h2", "hosts": { "a.example": "127.0.0.1:8080" } },
            { "name": "http/1.1", "hosts": { "a.example": "127.0.0.1:8081" } }
        ],
        "defaultProto": "http/1.1"
    }"#;

    #[test]
    fn test_parse_json_with_defaults() {
        let config = ProxyConfig::from_json_str(SAMPLE_JSON).unwrap();

        assert_eq!(config.email.as_deref(), Some("ops@example.com"));
        assert_eq!(config.port, 443);
        assert_eq!(config.bind_interfaces(), &[String::new()]);
        assert_eq!(config.protos.len(), 2);
        assert_eq!(config.protos[0].name, "h2");
        assert_eq!(config.session_tickets.key_capacity, 96);
        assert_eq!(config.session_tickets.rotation_interval(), Duration::from_secs(3600));
        assert_eq!(config.relay.dial_timeout(), Duration::from_secs(3));
        assert_eq!(config.relay.buffer_size, 32768);
        assert_eq!(config.acme.request_timeout(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = ProxyConfig::from_toml_str(
            r#"
            bindInterfaces = ["127.0.0.1", "::1"]
            port = 8443
            cacheDir = "/tmp/certs"
            defaultProto = "h2"

            [[protos]]
            name = "h2"
            hosts = { "a.example" = "127.0.0.1:8080" }

            [sessionTickets]
            rotationIntervalSecs = 60
            keyCapacity = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_interfaces(), &["127.0.0.1", "::1"]);
        assert_eq!(config.port, 8443);
        assert_eq!(config.session_tickets.key_capacity, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_selects_format_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();

        let json_path = dir.path().join("config.json");
        std::fs::File::create(&json_path)
            .unwrap()
            .write_all(SAMPLE_JSON.as_bytes())
            .unwrap();
        assert!(ProxyConfig::from_file(&json_path).is_ok());

        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, "cacheDir = \"/tmp\"\ndefaultProto = \"h2\"\n").unwrap();
        let config = ProxyConfig::from_file(&toml_path).unwrap();
        assert_eq!(config.default_proto, "h2");
    }

    #[test]
    fn test_from_file_missing() {
        let err = ProxyConfig::from_file("/nonexistent/tlsmuxd.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_invalid_json_reported() {
        let err = ProxyConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
