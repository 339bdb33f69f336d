//! Controller-side protocol client.
//!
//! Used by the integration tests and by tooling that drives a daemon.
//! The client owns the connection, performs the handshake and key
//! presentation, tracks the sequence counter when the negotiated
//! version requires one, and decodes the typed reply envelope.

use std::net::SocketAddr;

use tokio::io::{BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::dispatch::{TaskCode, TASK_QUIT};
use super::error::{ProtocolError, ProtocolResult};
use super::handshake::{self, ClientOutcome, ClientSession};
use super::version::{ProtocolVersion, SUPPORTED};
use super::wire::{
    BoxedStream, WireReader, WireWriter, MARKER_FAIL_DATA, MARKER_FAIL_IO, MARKER_SUCCESS,
};

/// Which failure channel a reply reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport or external-process failure on the daemon side.
    Io,
    /// The daemon's data operation failed.
    Data,
}

/// Decoded reply envelope for one request.
#[derive(Debug)]
pub enum Reply {
    /// The request succeeded; payload fields follow on the stream.
    Success,
    /// The request failed; the session remains usable.
    Failure {
        /// Which failure channel was reported.
        kind: FailureKind,
        /// The daemon's message.
        message: String,
    },
}

/// Connection options for a client session.
#[derive(Debug, Default)]
pub struct ClientOptions {
    /// Versions to offer, most preferred first. Empty means offer
    /// everything this build supports.
    pub offers: Vec<ProtocolVersion>,
    /// Shared key to present for master privilege. `None` connects
    /// unprivileged.
    pub key: Option<Vec<u8>>,
}

/// An established controller session.
pub struct ClientConnection {
    reader: WireReader<BufReader<ReadHalf<BoxedStream>>>,
    writer: WireWriter<BufWriter<WriteHalf<BoxedStream>>>,
    session: ClientSession,
}

impl ClientConnection {
    /// Connect over plain TCP and establish a session.
    ///
    /// # Errors
    ///
    /// Fails on connection errors, handshake rejection, or key
    /// rejection.
    pub async fn connect(addr: SocketAddr, options: ClientOptions) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::establish(Box::new(stream), options).await
    }

    /// Establish a session over an already-connected transport (used
    /// for TLS streams).
    ///
    /// # Errors
    ///
    /// Same contract as [`connect`](Self::connect).
    pub async fn establish(stream: BoxedStream, options: ClientOptions) -> ProtocolResult<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = WireReader::new(BufReader::new(read_half));
        let mut writer = WireWriter::new(BufWriter::new(write_half));

        let offers = if options.offers.is_empty() {
            SUPPORTED.to_vec()
        } else {
            options.offers
        };

        let session = match handshake::run_client(
            &mut reader,
            &mut writer,
            &offers,
            options.key.as_deref(),
        )
        .await?
        {
            ClientOutcome::Accepted(session) => session,
            ClientOutcome::Rejected(supported) => {
                return Err(ProtocolError::handshake_failed(format!(
                    "daemon rejected all offered versions, it speaks: {}",
                    supported.join(", ")
                )));
            }
        };

        if options.key.is_some() && !reader.read_bool().await? {
            return Err(ProtocolError::handshake_failed(
                "daemon rejected the supplied key",
            ));
        }

        debug!(version = %session.version, "client session established");

        Ok(Self {
            reader,
            writer,
            session,
        })
    }

    /// The negotiated protocol version.
    #[must_use]
    pub const fn version(&self) -> ProtocolVersion {
        self.session.version
    }

    /// Send a request header and pre-encoded arguments, then decode
    /// the reply envelope.
    ///
    /// On [`Reply::Success`] the caller reads the payload fields with
    /// the typed read methods; the payload shape is the task's
    /// contract.
    ///
    /// # Errors
    ///
    /// Fatal protocol errors only; in-band failures come back as
    /// [`Reply::Failure`].
    pub async fn call(&mut self, code: TaskCode, args: &[u8]) -> ProtocolResult<Reply> {
        if self.session.sequencing_enabled {
            self.writer.write_u64(self.session.sequence).await?;
        }
        self.writer.write_u16(code).await?;
        self.writer.write_raw(args).await?;
        self.writer.flush().await?;

        if self.session.sequencing_enabled {
            let echoed = self.reader.read_u64().await?;
            if echoed != self.session.sequence {
                return Err(ProtocolError::SequenceMismatch {
                    expected: self.session.sequence,
                    got: echoed,
                });
            }
            self.session.sequence = self.session.sequence.wrapping_add(1);
        }

        match self.reader.read_u8().await? {
            MARKER_SUCCESS => Ok(Reply::Success),
            marker @ (MARKER_FAIL_IO | MARKER_FAIL_DATA) => {
                let kind = if marker == MARKER_FAIL_IO {
                    FailureKind::Io
                } else {
                    FailureKind::Data
                };
                let message = self.reader.read_string().await?;
                Ok(Reply::Failure { kind, message })
            }
            other => Err(ProtocolError::invalid_frame(format!(
                "unknown reply marker {other}"
            ))),
        }
    }

    /// Read a string payload field from the current success reply.
    pub async fn read_string(&mut self) -> ProtocolResult<String> {
        self.reader.read_string().await
    }

    /// Read a `u64` payload field from the current success reply.
    pub async fn read_u64(&mut self) -> ProtocolResult<u64> {
        self.reader.read_u64().await
    }

    /// Read an `i64` payload field from the current success reply.
    pub async fn read_i64(&mut self) -> ProtocolResult<i64> {
        self.reader.read_i64().await
    }

    /// Read a blob payload field from the current success reply.
    pub async fn read_blob(&mut self) -> ProtocolResult<Vec<u8>> {
        self.reader.read_blob().await
    }

    /// End the session in an orderly fashion.
    ///
    /// # Errors
    ///
    /// Propagates transport failures while writing the quit frame.
    pub async fn quit(mut self) -> ProtocolResult<()> {
        if self.session.sequencing_enabled {
            self.writer.write_u64(self.session.sequence).await?;
        }
        self.writer.write_u16(TASK_QUIT).await?;
        self.writer.flush().await?;
        if self.session.sequencing_enabled {
            // The echo may or may not arrive before the daemon closes;
            // ignore a disconnect here.
            let _ = self.reader.read_u64().await;
        }
        Ok(())
    }
}
