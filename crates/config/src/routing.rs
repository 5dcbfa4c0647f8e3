//! ALPN + SNI routing table.
//!
//! Maps a negotiated protocol name and a TLS server name to the backend that
//! owns the connection. The table is built once from a validated
//! [`ProxyConfig`] and never mutated, so it can be shared between
//! connection tasks without locking.
//!
//! Connections that negotiate no ALPN protocol look up the empty protocol
//! name, which is an alias for the default protocol's host map.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::{ConfigError, ProxyConfig};

/// Hostname to backend map for a single protocol.
pub type HostMap = HashMap<String, Arc<Backend>>;

/// A backend service reachable over plain TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Log label, `"proto"."host"`.
    pub name: String,
    /// Dial address (`host:port`).
    pub addr: String,
}

impl Backend {
    fn new(protocol: &str, host: &str, addr: &str) -> Self {
        Self {
            name: format!("{protocol:?}.{host:?}"),
            addr: addr.to_string(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Immutable protocol → hostname → backend mapping.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, Arc<HostMap>>,
    protocols: Vec<String>,
    hostnames: Vec<String>,
    default_protocol: String,
}

impl RoutingTable {
    /// Validate the structural parts of `config` and build the table.
    ///
    /// Checks run in a fixed order and the first violation is returned:
    /// default protocol present, then each protocol in order (name, duplicate,
    /// hosts, then each host's key, address and uniqueness), then the default protocol
    /// reference, then the cache directory.
    pub fn build(config: &ProxyConfig) -> Result<Self, ConfigError> {
        if config.default_proto.is_empty() {
            return Err(ConfigError::MissingDefaultProto);
        }

        let mut routes: HashMap<String, Arc<HostMap>> = HashMap::new();
        let mut protocols = Vec::with_capacity(config.protos.len());
        let mut hostnames = Vec::new();
        let mut seen_hosts = HashSet::new();

        for (index, proto) in config.protos.iter().enumerate() {
            if proto.name.is_empty() {
                return Err(ConfigError::MissingProtoName { index });
            }
            if routes.contains_key(&proto.name) {
                return Err(ConfigError::DuplicateProto {
                    index,
                    name: proto.name.clone(),
                });
            }
            if proto.hosts.is_empty() {
                return Err(ConfigError::MissingHosts { index });
            }

            let mut hosts = HostMap::with_capacity(proto.hosts.len());
            for (host, addr) in &proto.hosts {
                if host.is_empty() {
                    return Err(ConfigError::EmptyHostname { index });
                }
                if addr.is_empty() {
                    return Err(ConfigError::EmptyBackendAddress {
                        index,
                        host: host.clone(),
                    });
                }

                let host = host.to_ascii_lowercase();
                if hosts.contains_key(&host) {
                    return Err(ConfigError::DuplicateHostname { index, host });
                }
                hosts.insert(
                    host.clone(),
                    Arc::new(Backend::new(&proto.name, &host, addr)),
                );
                if seen_hosts.insert(host.clone()) {
                    hostnames.push(host);
                }
            }

            routes.insert(proto.name.clone(), Arc::new(hosts));
            protocols.push(proto.name.clone());
        }

        let default_hosts = routes
            .get(&config.default_proto)
            .cloned()
            .ok_or_else(|| ConfigError::UndefinedDefaultProto(config.default_proto.clone()))?;
        routes.insert(String::new(), default_hosts);

        if config.cache_dir.is_empty() {
            return Err(ConfigError::MissingCacheDir);
        }

        debug!(
            protocols = protocols.len(),
            hostnames = hostnames.len(),
            default_protocol = %config.default_proto,
            "Built routing table"
        );

        Ok(Self {
            routes,
            protocols,
            hostnames,
            default_protocol: config.default_proto.clone(),
        })
    }

    /// Find the backend for a negotiated protocol and server name.
    ///
    /// An empty `protocol` resolves through the default protocol.
    pub fn lookup(&self, protocol: &str, hostname: &str) -> Option<&Arc<Backend>> {
        let hosts = self.routes.get(protocol)?;
        match hosts.get(hostname) {
            Some(backend) => Some(backend),
            None if hostname.bytes().any(|b| b.is_ascii_uppercase()) => {
                hosts.get(&hostname.to_ascii_lowercase())
            }
            None => None,
        }
    }

    /// Host map for a protocol (the empty name yields the default's map).
    pub fn hosts(&self, protocol: &str) -> Option<&Arc<HostMap>> {
        self.routes.get(protocol)
    }

    /// Protocol names in configuration order, for ALPN advertisement.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Every distinct hostname across all protocols, lowercased.
    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn default_protocol(&self) -> &str {
        &self.default_protocol
    }
}
