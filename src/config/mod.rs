//! # Master configuration
//!
//! Configuration is read from an optional YAML file and an optional inline
//! YAML override (`--options`), deep-merged in that order and validated
//! before anything starts. Every key is optional.
//!
//! ```yaml
//! noPublish: false
//! autoDefaultNs: true
//! extraLabelNs: [vendor.example.com]
//! denyLabelNs: ["*.denied.example.com"]
//! resourceLabels: [vendor.example.com/widgets]
//! enableTaints: false
//! labelWhiteList: "^cpu-"
//! resyncPeriod: 1h
//! nfdApiParallelism: 10
//! leaderElection:
//!   leaseDuration: 15s
//!   renewDeadline: 10s
//!   retryPeriod: 2s
//! watchNamespaces: []
//! ```

pub mod master;
pub mod reload;

pub use master::{
    parse_config, validate_config, validate_instance_name, LeaderElectionConfig, MasterConfig,
};
pub use reload::spawn_config_watcher;

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Fatal configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Failed to parse inline options: {0}")]
    InvalidOptions(String),

    #[error("nfdApiParallelism must be greater than zero")]
    InvalidParallelism,

    #[error("Invalid labelWhiteList regexp '{0}': {1}")]
    InvalidWhitelist(String, String),

    #[error("Invalid denyLabelNs entry '{0}'")]
    InvalidDenyNs(String),

    #[error("Invalid leader election settings: {0}")]
    InvalidLeaderElection(String),

    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),

    #[error("Invalid instance name '{0}'")]
    InvalidInstance(String),

    #[error("TLS settings must be given all together or not at all")]
    PartialTls,

    #[error("Node name verification needs client certificates (--tls-*) or a trusted identity header")]
    UnverifiableIdentity,
}

/// CA, certificate and key files; either all or none must be given
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl TlsFiles {
    /// `Ok(false)` if TLS is off, `Ok(true)` if fully configured
    pub fn validate(&self) -> Result<bool, ConfigError> {
        match (&self.ca_file, &self.cert_file, &self.key_file) {
            (None, None, None) => Ok(false),
            (Some(_), Some(_), Some(_)) => Ok(true),
            _ => Err(ConfigError::PartialTls),
        }
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Expand `~` and environment variables in a user supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}

/// Load, merge and validate the configuration.
///
/// A missing file is not an error; defaults apply.
pub fn load_config(path: Option<&Path>, options: Option<&str>) -> Result<MasterConfig, ConfigError> {
    let file_content = match path {
        Some(path) => {
            let path = expand_path(path);
            match std::fs::read_to_string(&path) {
                Ok(content) => Some(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!("Config file {} not found, using defaults", path.display());
                    None
                }
                Err(source) => return Err(ConfigError::Io { path, source }),
            }
        }
        None => None,
    };

    let config = parse_config(file_content.as_deref(), options)?;
    validate_config(&config)?;
    Ok(config)
}
