//! Daemon configuration: TOML file loading and validation.
//!
//! The shared key never appears in the file as plaintext; the file
//! stores its SHA-256 digest in hex, produced by `wardend hash-key`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::acceptor::{Endpoint, Transport};
use crate::protocol::auth::DaemonKey;

/// Configuration errors, reported at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// TOML deserialization error.
        source: toml::de::Error,
    },

    /// A semantic constraint is violated.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of the violation.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// TLS file paths for one listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

/// One listening endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// Address to bind.
    pub address: IpAddr,
    /// Port to bind.
    pub port: u16,
    /// Enable TLS on this endpoint.
    pub tls: Option<TlsFiles>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Hex SHA-256 digest of the shared daemon key.
    pub daemon_key_digest: String,
    /// Peer addresses allowed to connect.
    pub allow_from: Vec<IpAddr>,
    /// Listening endpoints; at least one is required.
    pub listen: Vec<ListenConfig>,
    /// Service control program for restart tasks.
    #[serde(default = "default_service_control")]
    pub service_control: String,
}

fn default_service_control() -> String {
    "systemctl".to_string()
}

impl DaemonConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Read, parse, and semantic validation failures.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed key digest, an
    /// empty listener list, or duplicate endpoints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        decode_digest(&self.daemon_key_digest)?;

        if self.listen.is_empty() {
            return Err(ConfigError::invalid("at least one [[listen]] is required"));
        }
        if self.allow_from.is_empty() {
            return Err(ConfigError::invalid(
                "allow_from is empty, no peer could ever connect",
            ));
        }
        if self.service_control.is_empty() {
            return Err(ConfigError::invalid("service_control must not be empty"));
        }

        let mut seen = Vec::new();
        for listen in &self.listen {
            let addr = (listen.address, listen.port);
            if seen.contains(&addr) {
                return Err(ConfigError::invalid(format!(
                    "duplicate listen endpoint {}:{}",
                    listen.address, listen.port
                )));
            }
            seen.push(addr);
        }
        Ok(())
    }

    /// The daemon key in verifier form.
    ///
    /// # Errors
    ///
    /// Fails on a malformed digest (already rejected by
    /// [`validate`](Self::validate)).
    pub fn daemon_key(&self) -> Result<DaemonKey, ConfigError> {
        Ok(DaemonKey::from_digest(decode_digest(
            &self.daemon_key_digest,
        )?))
    }

    /// The configured endpoints in acceptor form.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.listen
            .iter()
            .map(|listen| Endpoint {
                addr: SocketAddr::new(listen.address, listen.port),
                transport: listen.tls.as_ref().map_or(Transport::Plain, |tls| {
                    Transport::Tls {
                        cert_path: tls.cert.clone(),
                        key_path: tls.key.clone(),
                    }
                }),
            })
            .collect()
    }
}

/// Decode a 64-character hex string into a SHA-256 digest.
fn decode_digest(hex: &str) -> Result<[u8; 32], ConfigError> {
    if hex.len() != 64 {
        return Err(ConfigError::invalid(format!(
            "daemon_key_digest must be 64 hex characters, got {}",
            hex.len()
        )));
    }
    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        let pair = &hex[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(pair, 16).map_err(|_| {
            ConfigError::invalid(format!("daemon_key_digest has non-hex characters: {pair:?}"))
        })?;
    }
    Ok(digest)
}
