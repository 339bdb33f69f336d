//! One-time access key registry.
//!
//! A privileged session may grant a single-use key that pre-authorizes
//! one specific command with pinned parameters. A later (possibly
//! unprivileged) session redeems the key to run exactly that command.
//! Keys live for [`GRANT_TTL`]; expired entries are removed by an
//! opportunistic sweep that runs on grant, at most once per
//! [`SWEEP_INTERVAL`]. Redemption never sweeps, so an expired entry
//! that has not yet been swept still redeems; the TTL bounds staleness,
//! it is not a hard deadline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// How long a granted key remains valid.
pub const GRANT_TTL: Duration = Duration::from_secs(60 * 60);

/// Minimum interval between expiry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Number of pinned parameter slots per grant.
pub const GRANT_PARAMS: usize = 4;

/// A granted one-time authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyGrant {
    /// Command code this key authorizes.
    pub command: u16,
    /// Parameters pinned at grant time; the redeeming session runs the
    /// command with these, not values of its own choosing.
    pub params: [Option<String>; GRANT_PARAMS],
    created: Instant,
}

/// Why a redemption failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrantError {
    /// No live grant under this key. Reported to the caller as a
    /// per-request data failure.
    #[error("access key is not recognized")]
    UnknownKey,

    /// The key exists but authorizes a different command. The key is
    /// consumed anyway; a caller probing commands with a stolen key
    /// does not get retries.
    #[error("access key authorizes task {stored}, not task {requested}")]
    CommandMismatch {
        /// Command the grant was issued for.
        stored: u16,
        /// Command the caller tried to run.
        requested: u16,
    },
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<u64, AccessKeyGrant>,
    last_sweep: Instant,
}

/// Thread-safe registry of live access key grants.
///
/// Shared across all connection tasks; all operations take the lock
/// briefly and never hold it across an await point.
#[derive(Debug)]
pub struct AccessKeyRegistry {
    inner: Mutex<Inner>,
}

impl Default for AccessKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessKeyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Store a one-time grant under the caller-chosen random `key`,
    /// authorizing `command` with pinned `params`.
    ///
    /// A colliding key replaces the previous entry; the keyspace is 64
    /// bits of caller-supplied randomness, so a collision in practice
    /// means the controller reissued the same grant. Granting also
    /// sweeps expired entries if the last sweep is older than
    /// [`SWEEP_INTERVAL`].
    pub fn grant(&self, key: u64, command: u16, params: [Option<String>; GRANT_PARAMS]) {
        self.grant_at(key, command, params, Instant::now());
    }

    fn grant_at(
        &self,
        key: u64,
        command: u16,
        params: [Option<String>; GRANT_PARAMS],
        now: Instant,
    ) {
        let mut inner = self.inner.lock().expect("lock poisoned");

        if now.duration_since(inner.last_sweep) >= SWEEP_INTERVAL {
            let before = inner.entries.len();
            inner
                .entries
                .retain(|_, g| now.duration_since(g.created) < GRANT_TTL);
            let swept = before - inner.entries.len();
            if swept > 0 {
                debug!(swept, "removed expired access key grants");
            }
            inner.last_sweep = now;
        }

        inner.entries.insert(
            key,
            AccessKeyGrant {
                command,
                params,
                created: now,
            },
        );
    }

    /// Redeem a key for `command`, consuming it.
    ///
    /// The entry is removed before the command comparison, so a
    /// mismatched redemption still burns the key.
    ///
    /// # Errors
    ///
    /// [`GrantError::UnknownKey`] if no grant exists under `key`;
    /// [`GrantError::CommandMismatch`] if the grant was issued for a
    /// different command.
    pub fn redeem(&self, key: u64, command: u16) -> Result<AccessKeyGrant, GrantError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let grant = inner.entries.remove(&key).ok_or(GrantError::UnknownKey)?;
        if grant.command != command {
            return Err(GrantError::CommandMismatch {
                stored: grant.command,
                requested: command,
            });
        }
        Ok(grant)
    }

    /// Number of live (unswept) grants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").entries.len()
    }

    /// Whether the registry holds no grants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
