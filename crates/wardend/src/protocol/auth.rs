//! Peer authentication and privilege assignment.
//!
//! Two independent gates run after the handshake:
//!
//! 1. The peer address must appear in the allow-list. Failure closes
//!    the connection.
//! 2. If the peer supplied a shared key, its SHA-256 digest is compared
//!    in constant time against the configured daemon key digest. A
//!    match grants [`Privilege::Master`]; a mismatch closes the
//!    connection.
//!
//! A peer that supplies NO key is not rejected: it is admitted with
//! [`Privilege::ReadOnly`] and may run unprivileged tasks only. The
//! plaintext key is never stored; only digests are compared.

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

/// Privilege level assigned to an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Full access; may run privileged tasks.
    Master,
    /// Unprivileged access; restricted to tasks open to any caller.
    ReadOnly,
}

impl Privilege {
    /// Whether this level satisfies a master-only requirement.
    #[must_use]
    pub const fn is_master(self) -> bool {
        matches!(self, Self::Master)
    }
}

/// Why a peer was turned away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthRejection {
    /// The peer's address is not on the allow-list.
    #[error("address {0} is not allowed to connect")]
    AddressNotAllowed(IpAddr),

    /// The peer presented a key whose digest does not match.
    #[error("supplied key does not match the daemon key")]
    KeyMismatch,
}

/// The daemon's shared secret, held as a SHA-256 digest only.
#[derive(Clone)]
pub struct DaemonKey {
    digest: [u8; 32],
}

impl DaemonKey {
    /// Derive the key from a plaintext secret. The plaintext is hashed
    /// immediately and not retained.
    #[must_use]
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(secret).into(),
        }
    }

    /// Construct from a pre-computed digest (the form stored in the
    /// config file).
    #[must_use]
    pub const fn from_digest(digest: [u8; 32]) -> Self {
        Self { digest }
    }

    /// Constant-time comparison of a supplied plaintext key against
    /// the stored digest.
    #[must_use]
    pub fn matches(&self, supplied: &[u8]) -> bool {
        let supplied_digest: [u8; 32] = Sha256::digest(supplied).into();
        supplied_digest.ct_eq(&self.digest).into()
    }
}

impl std::fmt::Debug for DaemonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, even hashed.
        f.debug_struct("DaemonKey").finish_non_exhaustive()
    }
}

/// Post-handshake gatekeeper combining the allow-list and key check.
#[derive(Debug, Clone)]
pub struct Authenticator {
    key: DaemonKey,
    allow_list: Vec<IpAddr>,
}

impl Authenticator {
    /// Build an authenticator from the configured key and allow-list.
    #[must_use]
    pub fn new(key: DaemonKey, allow_list: Vec<IpAddr>) -> Self {
        Self { key, allow_list }
    }

    /// Authenticate a peer, yielding its privilege level.
    ///
    /// # Errors
    ///
    /// Returns [`AuthRejection`] if the address is not allowed or a
    /// supplied key fails verification. Either rejection must close
    /// the connection; the caller decides whether a reply byte is
    /// owed first.
    pub fn authenticate(
        &self,
        peer: SocketAddr,
        supplied_key: Option<&[u8]>,
    ) -> Result<Privilege, AuthRejection> {
        if !self.allow_list.contains(&peer.ip()) {
            warn!(peer = %peer, "rejected connection from address outside allow-list");
            return Err(AuthRejection::AddressNotAllowed(peer.ip()));
        }

        match supplied_key {
            Some(key) if self.key.matches(key) => Ok(Privilege::Master),
            Some(_) => {
                warn!(peer = %peer, "rejected connection with mismatched daemon key");
                Err(AuthRejection::KeyMismatch)
            }
            None => Ok(Privilege::ReadOnly),
        }
    }
}
