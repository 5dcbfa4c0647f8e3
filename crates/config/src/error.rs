//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a [`ProxyConfig`](crate::ProxyConfig).
///
/// Validation stops at the first violation, so each variant names exactly
/// one offending field.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("defaultProto is empty or missing")]
    MissingDefaultProto,

    #[error("protos[{index}].name is empty or missing")]
    MissingProtoName { index: usize },

    #[error("protos[{index}].name ({name:?}) is defined more than once")]
    DuplicateProto { index: usize, name: String },

    #[error("protos[{index}].hosts is empty or missing")]
    MissingHosts { index: usize },

    #[error("empty key in protos[{index}].hosts")]
    EmptyHostname { index: usize },

    #[error("protos[{index}].hosts.{host:?} is empty")]
    EmptyBackendAddress { index: usize, host: String },

    #[error("protos[{index}].hosts.{host:?} is defined more than once")]
    DuplicateHostname { index: usize, host: String },

    #[error("defaultProto ({0:?}) is not defined in protos")]
    UndefinedDefaultProto(String),

    #[error("empty or missing cacheDir")]
    MissingCacheDir,

    #[error("{field} must be at least {min}")]
    OutOfRange { field: &'static str, min: u64 },
}

impl ConfigError {
    /// Path of the configuration field this error refers to, if any.
    pub fn field(&self) -> Option<String> {
        match self {
            Self::Io { .. } | Self::Json(_) | Self::Toml(_) => None,
            Self::MissingDefaultProto | Self::UndefinedDefaultProto(_) => {
                Some("defaultProto".to_string())
            }
            Self::MissingProtoName { index } | Self::DuplicateProto { index, .. } => {
                Some(format!("protos[{index}].name"))
            }
            Self::MissingHosts { index } | Self::EmptyHostname { index } => {
                Some(format!("protos[{index}].hosts"))
            }
            Self::EmptyBackendAddress { index, host }
            | Self::DuplicateHostname { index, host } => {
                Some(format!("protos[{index}].hosts.{host:?}"))
            }
            Self::MissingCacheDir => Some("cacheDir".to_string()),
            Self::OutOfRange { field, .. } => Some((*field).to_string()),
        }
    }
}
