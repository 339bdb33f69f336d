//! Per-connection session driver.
//!
//! One driver instance is shared by every connection task; per-session
//! state (privilege, sequence counter) lives on the stack of
//! [`ConnectionDriver::serve`]. The lifecycle is handshake, then
//! authentication, then the command loop. Requests are served strictly
//! in order on the connection; concurrency exists across connections,
//! never within one.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::grants::AccessKeyRegistry;

use super::auth::Authenticator;
use super::dispatch::{DispatchTable, RequestContext, TASK_QUIT};
use super::error::{HandlerError, ProtocolError, ProtocolResult};
use super::handshake::{self, HandshakeOutcome, SessionParams};
use super::wire::{
    BoxedStream, RequestReader, ResponseWriter, WireReader, WireWriter, MARKER_FAIL_DATA,
    MARKER_FAIL_IO, MARKER_SUCCESS,
};

/// Shared per-daemon state driving every accepted connection.
pub struct ConnectionDriver {
    table: Arc<DispatchTable>,
    auth: Arc<Authenticator>,
    grants: Arc<AccessKeyRegistry>,
}

impl ConnectionDriver {
    /// Wire up a driver from the daemon's shared components.
    #[must_use]
    pub fn new(
        table: Arc<DispatchTable>,
        auth: Arc<Authenticator>,
        grants: Arc<AccessKeyRegistry>,
    ) -> Self {
        Self {
            table,
            auth,
            grants,
        }
    }

    /// Serve one connection to completion.
    ///
    /// Returns `Ok(())` for every orderly ending (quit, disconnect,
    /// rejected handshake or authentication, unknown task code).
    ///
    /// # Errors
    ///
    /// Returns the fatal [`ProtocolError`] for protocol violations and
    /// transport failures; the acceptor logs it and drops the stream.
    pub async fn serve(&self, stream: BoxedStream, peer: SocketAddr) -> ProtocolResult<()> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: RequestReader = WireReader::new(BufReader::new(read_half));
        let mut writer: ResponseWriter = WireWriter::new(BufWriter::new(write_half));

        let params = match handshake::run_server(&mut reader, &mut writer).await? {
            HandshakeOutcome::Accepted(params) => params,
            HandshakeOutcome::Rejected => {
                debug!(peer = %peer, "closing connection after rejected handshake");
                return Ok(());
            }
            HandshakeOutcome::Closed => {
                debug!(peer = %peer, "peer disconnected before handshake");
                return Ok(());
            }
        };

        let supplied_key = params.peer_key.as_ref().map(|k| k.as_slice());
        let keyed = supplied_key.is_some();
        let privilege = match self.auth.authenticate(peer, supplied_key) {
            Ok(privilege) => privilege,
            Err(_) => {
                // A keyed caller is owed a verdict byte before the
                // close; an address rejection sends nothing.
                if keyed {
                    writer.write_bool(false).await?;
                    writer.flush().await?;
                }
                return Ok(());
            }
        };
        if keyed {
            writer.write_bool(true).await?;
            writer.flush().await?;
        }

        info!(peer = %peer, version = %params.version, ?privilege, "session established");

        self.command_loop(&mut reader, &mut writer, peer, params, privilege)
            .await
    }

    async fn command_loop(
        &self,
        reader: &mut RequestReader,
        writer: &mut ResponseWriter,
        peer: SocketAddr,
        params: SessionParams,
        privilege: super::auth::Privilege,
    ) -> ProtocolResult<()> {
        let mut sequence = params.sequence_start;

        loop {
            if params.sequencing_enabled {
                let claimed = match reader.read_u64().await {
                    Ok(value) => value,
                    Err(e) if e.is_benign_disconnect() => break,
                    Err(e) => return Err(e),
                };
                if claimed != sequence {
                    return Err(ProtocolError::SequenceMismatch {
                        expected: sequence,
                        got: claimed,
                    });
                }
                // The echo goes on the wire before the handler runs,
                // so the peer can confirm sequencing without waiting
                // out a slow dispatch.
                writer.write_u64(sequence).await?;
                writer.flush().await?;
                sequence = sequence.wrapping_add(1);
            }

            let code = match reader.read_u16().await {
                Ok(code) => code,
                Err(e) if !params.sequencing_enabled && e.is_benign_disconnect() => break,
                Err(e) => return Err(e),
            };

            if code == TASK_QUIT {
                debug!(peer = %peer, "peer requested session end");
                writer.flush().await?;
                break;
            }

            let Some(entry) = self.table.lookup(code) else {
                // Unknown codes end the session without a reply: we
                // cannot know the argument shape, so the stream is
                // unparseable from here on.
                debug!(peer = %peer, code, "unknown task code, closing session");
                break;
            };

            if !entry.privilege.permits(privilege) {
                warn!(peer = %peer, code, "privileged task refused for unprivileged session");
                writer.write_u8(MARKER_FAIL_DATA).await?;
                writer
                    .write_string("task requires the daemon key")
                    .await?;
                writer.flush().await?;
                continue;
            }

            let ctx = RequestContext {
                privilege,
                peer_addr: peer,
                grants: &self.grants,
            };

            match entry.handler.handle(reader, &ctx).await {
                Ok(payload) => {
                    writer.write_u8(MARKER_SUCCESS).await?;
                    writer.write_raw(&payload).await?;
                }
                Err(HandlerError::Command(err)) => {
                    if err.is_benign() {
                        debug!(peer = %peer, code, error = %err, "task failed");
                    } else {
                        warn!(peer = %peer, code, error = %err, "task failed");
                    }
                    let marker = match &err {
                        super::error::CommandError::Io { .. } => MARKER_FAIL_IO,
                        super::error::CommandError::Data { .. }
                        | super::error::CommandError::Denied { .. } => MARKER_FAIL_DATA,
                    };
                    writer.write_u8(marker).await?;
                    writer.write_string(&truncate_message(&err.to_string())).await?;
                }
                Err(HandlerError::Fatal(err)) => return Err(err),
            }
            writer.flush().await?;
        }

        debug!(peer = %peer, "session closed");
        Ok(())
    }
}

/// Bound a failure message to the wire string limit.
fn truncate_message(message: &str) -> String {
    const LIMIT: usize = super::error::MAX_STRING_LEN;
    if message.len() <= LIMIT {
        return message.to_string();
    }
    let mut end = LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
