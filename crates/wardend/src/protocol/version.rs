//! Protocol versions and negotiation.
//!
//! Versions form a closed set; an unrecognized label from a peer is a
//! negotiation failure, never a best-effort guess. Capabilities hang
//! off the version itself so call sites ask `has_sequencing()` instead
//! of comparing ordinals.

use super::error::{ProtocolError, ProtocolResult};

/// A recognized protocol version.
///
/// Ordering follows capability: later versions are supersets of
/// earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Original protocol: single version proposal, no sequencing.
    V1,
    /// Adds multi-version offers during the handshake.
    V2,
    /// Adds per-request sequence numbering.
    V3,
}

/// All versions this daemon speaks, most preferred first.
///
/// Negotiation picks the first entry present in the peer's offer set,
/// so order here is authoritative.
pub const SUPPORTED: &[ProtocolVersion] =
    &[ProtocolVersion::V3, ProtocolVersion::V2, ProtocolVersion::V1];

impl ProtocolVersion {
    /// The version's wire label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
            Self::V3 => "3",
        }
    }

    /// Parse a wire label into a version.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::HandshakeFailed`] for labels outside
    /// the closed set.
    pub fn from_label(label: &str) -> ProtocolResult<Self> {
        match label {
            "1" => Ok(Self::V1),
            "2" => Ok(Self::V2),
            "3" => Ok(Self::V3),
            other => Err(ProtocolError::handshake_failed(format!(
                "unrecognized protocol version {other:?}"
            ))),
        }
    }

    /// Whether this version carries per-request sequence numbers.
    #[must_use]
    pub const fn has_sequencing(self) -> bool {
        matches!(self, Self::V3)
    }

    /// Whether this version sends a list of additional acceptable
    /// versions after its primary proposal.
    #[must_use]
    pub const fn has_multi_version_offer(self) -> bool {
        matches!(self, Self::V2 | Self::V3)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Select the version to use for a session given the peer's offers.
///
/// Server preference is authoritative: the result is the first entry
/// of [`SUPPORTED`] that appears anywhere in `offers`, regardless of
/// the order the peer listed them in.
#[must_use]
pub fn negotiate(offers: &[ProtocolVersion]) -> Option<ProtocolVersion> {
    negotiate_with(SUPPORTED, offers)
}

/// [`negotiate`] against an explicit preference list.
#[must_use]
pub fn negotiate_with(
    supported: &[ProtocolVersion],
    offers: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    supported.iter().copied().find(|v| offers.contains(v))
}
