//! Error types for the daemon protocol layer.
//!
//! Two distinct severities exist and must never be conflated:
//!
//! - [`ProtocolError`]: fatal to the connection. Malformed framing,
//!   sequence mismatches, and handshake failures indicate a
//!   desynchronized or hostile peer; the session cannot continue.
//! - [`CommandError`]: fatal to one request only. A command handler
//!   that fails (missing file, dead downstream service) is converted
//!   into a typed failure reply and the command loop keeps serving the
//!   connection.
//!
//! The remote caller always receives either a success payload or a
//! typed failure with a readable message, never a raw backtrace.

use std::io;

use thiserror::Error;

/// Maximum length for a wire string in bytes (4 KiB).
///
/// Strings carry version labels, service names and failure messages;
/// none of them have any business being larger than this. Validated
/// before allocation.
pub const MAX_STRING_LEN: usize = 4 * 1024;

/// Maximum size for a length-prefixed blob (16 MiB).
///
/// Blobs carry key material and handler payloads. The limit is checked
/// against the length prefix BEFORE allocation to prevent memory
/// exhaustion by a hostile peer.
pub const MAX_BLOB_SIZE: usize = 16 * 1024 * 1024;

/// Fatal protocol errors. Any of these terminates the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A length prefix exceeds the allowed maximum for its element.
    #[error("frame element too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size claimed by the length prefix.
        size: usize,
        /// Maximum allowed size for this element.
        max: usize,
    },

    /// The frame structure does not match the expected format.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// The peer's claimed sequence number does not match the expected
    /// value. Detects desynchronized or replayed frames.
    #[error("sequence mismatch: expected {expected}, peer sent {got}")]
    SequenceMismatch {
        /// The value the server expected.
        expected: u64,
        /// The value the peer claimed.
        got: u64,
    },

    /// The handshake sequence did not complete.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Description of the handshake failure.
        reason: String,
    },

    /// TLS configuration or certificate loading failed.
    #[error("TLS configuration error: {reason}")]
    TlsConfig {
        /// Description of the TLS failure.
        reason: String,
    },

    /// The peer closed the connection mid-operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying transport error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Create an invalid-frame error.
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Create a handshake-failed error.
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Create a TLS configuration error.
    pub fn tls_config(reason: impl Into<String>) -> Self {
        Self::TlsConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is an ordinary peer disconnect
    /// rather than a protocol violation.
    ///
    /// Benign disconnects are logged at debug level only; controllers
    /// drop sessions all the time and that is not an operator-facing
    /// event.
    #[must_use]
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Returns `true` if this error indicates a protocol violation by
    /// the peer (as opposed to a local or transport fault).
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::InvalidFrame { .. }
                | Self::SequenceMismatch { .. }
                | Self::HandshakeFailed { .. }
        )
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Per-request command failures, reported in-band and survivable.
///
/// Exactly two kinds are visible on the wire (`Io` and `Data`, see the
/// reply markers in [`super::wire`]); authorization failures travel as
/// data failures with a distinguishing message.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Transport or external-process failure while serving the request.
    #[error("I/O failure: {message}")]
    Io {
        /// Human-readable description.
        message: String,
        /// Set when the failure is a known benign peer-reset pattern
        /// that should not be logged as an error.
        benign: bool,
    },

    /// The handler's underlying data operation failed (e.g. a
    /// referenced entity does not exist).
    #[error("data failure: {message}")]
    Data {
        /// Human-readable description.
        message: String,
    },

    /// The caller lacks the privilege required for this task.
    #[error("not permitted: {message}")]
    Denied {
        /// Human-readable description.
        message: String,
    },
}

impl CommandError {
    /// Create an I/O failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            benign: false,
        }
    }

    /// Create a data failure.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }

    /// Create an authorization failure.
    pub fn denied(message: impl Into<String>) -> Self {
        Self::Denied {
            message: message.into(),
        }
    }

    /// Returns `true` if this failure should not be logged as an
    /// error (known benign peer-reset condition).
    #[must_use]
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::Io { benign: true, .. })
    }
}

impl From<io::Error> for CommandError {
    fn from(e: io::Error) -> Self {
        let benign = matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
        );
        Self::Io {
            message: e.to_string(),
            benign,
        }
    }
}

/// Outcome type for command handlers.
///
/// A handler either produces a reply payload, fails the single request
/// ([`CommandError`]), or escalates to a connection-fatal
/// [`ProtocolError`] (malformed arguments, mismatched grant
/// redemption).
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Request-scoped failure; reported to the peer, loop continues.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Connection-fatal failure; the session is torn down.
    #[error(transparent)]
    Fatal(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_mismatch_is_protocol_violation() {
        let err = ProtocolError::SequenceMismatch {
            expected: 7,
            got: 9,
        };
        assert!(err.is_protocol_violation());
        assert!(!err.is_benign_disconnect());

        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('9'));
    }

    #[test]
    fn eof_is_benign_disconnect() {
        let err = ProtocolError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(err.is_benign_disconnect());
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn frame_too_large_mentions_sizes() {
        let err = ProtocolError::FrameTooLarge {
            size: 20_000_000,
            max: MAX_BLOB_SIZE,
        };
        let msg = err.to_string();
        assert!(msg.contains("20000000"));
        assert!(msg.contains(&MAX_BLOB_SIZE.to_string()));
    }

    #[test]
    fn command_error_from_reset_is_benign() {
        let err = CommandError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_benign());

        let err = CommandError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_benign());
    }

    #[test]
    fn denied_message_is_readable() {
        let err = CommandError::denied("master key required for task 3");
        assert!(err.to_string().contains("not permitted"));
    }

    const _: () = assert!(MAX_STRING_LEN < MAX_BLOB_SIZE);
}
