//! Session handshake and version negotiation.
//!
//! Client opening frame: proposed version label, key blob (zero-length
//! means no key), and, when the proposed version supports it, a list
//! of additional acceptable versions.
//!
//! Server reply: an accept/reject boolean. On rejection the server's
//! own preference list follows so the peer can re-propose. On
//! acceptance, and only when the proposed version supports request
//! sequencing, the server echoes the selected version label and a
//! randomly chosen sequence start value.
//!
//! Without the echo the client has no way to learn a selection other
//! than its own proposal, so a server that would select a different
//! version from the offer list rejects instead; the rejection carries
//! the versions to re-propose with.

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::error::{ProtocolError, ProtocolResult};
use super::version::{negotiate_with, ProtocolVersion, SUPPORTED};
use super::wire::{WireReader, WireWriter};

/// Cap on the number of additional versions a peer may offer.
const MAX_VERSIONS: usize = 16;

/// Negotiated parameters of an accepted session.
pub struct SessionParams {
    /// The version both sides will speak.
    pub version: ProtocolVersion,
    /// Key material the peer supplied, if any. Zeroized on drop;
    /// consumed once by authentication.
    pub peer_key: Option<Zeroizing<Vec<u8>>>,
    /// First expected sequence value (meaningful only when sequencing
    /// is enabled).
    pub sequence_start: u64,
    /// Whether requests on this session carry sequence numbers.
    pub sequencing_enabled: bool,
}

impl std::fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParams")
            .field("version", &self.version)
            .field("has_key", &self.peer_key.is_some())
            .field("sequencing_enabled", &self.sequencing_enabled)
            .finish_non_exhaustive()
    }
}

/// Result of serving one handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Agreement reached; the command loop may start.
    Accepted(SessionParams),
    /// No common version; the rejection reply was sent and the
    /// connection must close.
    Rejected,
    /// The peer disconnected before completing the opening frame.
    Closed,
}

/// Serve the handshake on a fresh connection.
///
/// # Errors
///
/// Framing violations and transport failures are fatal. A clean
/// disconnect before any byte arrives is reported as
/// [`HandshakeOutcome::Closed`], not an error.
pub async fn run_server<R, W>(
    reader: &mut WireReader<R>,
    writer: &mut WireWriter<W>,
) -> ProtocolResult<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let proposed_label = match reader.read_string().await {
        Ok(label) => label,
        Err(e) if e.is_benign_disconnect() => return Ok(HandshakeOutcome::Closed),
        Err(e) => return Err(e),
    };
    let Ok(proposed) = ProtocolVersion::from_label(&proposed_label) else {
        // A label we do not recognize is the disjoint-version case; we
        // cannot parse the rest of the peer's opening frame, but we
        // can still tell it what we speak before closing.
        debug!(label = %proposed_label, "peer proposed an unknown version, rejecting");
        write_rejection(writer).await?;
        return Ok(HandshakeOutcome::Rejected);
    };

    let key_bytes = reader.read_blob().await?;
    let peer_key = if key_bytes.is_empty() {
        None
    } else {
        Some(Zeroizing::new(key_bytes))
    };

    let mut offers = vec![proposed];
    if proposed.has_multi_version_offer() {
        let count = usize::from(reader.read_u16().await?);
        if count > MAX_VERSIONS {
            return Err(ProtocolError::invalid_frame(format!(
                "peer offered {count} versions, maximum is {MAX_VERSIONS}"
            )));
        }
        for _ in 0..count {
            let label = reader.read_string().await?;
            // Unknown additional versions are simply not common ground.
            if let Ok(version) = ProtocolVersion::from_label(&label) {
                if !offers.contains(&version) {
                    offers.push(version);
                }
            }
        }
    }
    trace!(?offers, "peer version offers");

    let selected = negotiate_with(SUPPORTED, &offers);

    // A selection the peer cannot learn about is useless: without the
    // sequencing-era echo, acceptance implies the proposed version.
    let selected = selected.filter(|v| proposed.has_sequencing() || *v == proposed);

    let Some(selected) = selected else {
        debug!(?offers, "no usable common version, rejecting handshake");
        write_rejection(writer).await?;
        return Ok(HandshakeOutcome::Rejected);
    };

    writer.write_bool(true).await?;

    let mut sequence_start = 0;
    let mut sequencing_enabled = false;
    if proposed.has_sequencing() {
        sequence_start = rand::thread_rng().gen();
        writer.write_string(selected.label()).await?;
        writer.write_u64(sequence_start).await?;
        sequencing_enabled = selected.has_sequencing();
    }
    writer.flush().await?;

    debug!(version = %selected, sequencing_enabled, "handshake accepted");

    Ok(HandshakeOutcome::Accepted(SessionParams {
        version: selected,
        peer_key,
        sequence_start,
        sequencing_enabled,
    }))
}

/// Send the rejection reply: the server's preferred version followed
/// by the rest of its supported list.
async fn write_rejection<W>(writer: &mut WireWriter<W>) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_bool(false).await?;
    writer.write_string(SUPPORTED[0].label()).await?;
    let rest = &SUPPORTED[1..];
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u16(rest.len() as u16).await?;
    for version in rest {
        writer.write_string(version.label()).await?;
    }
    writer.flush().await
}

/// Client view of an accepted session.
#[derive(Debug)]
pub struct ClientSession {
    /// The version the server selected.
    pub version: ProtocolVersion,
    /// Whether requests must carry sequence numbers.
    pub sequencing_enabled: bool,
    /// Next sequence value to send.
    pub sequence: u64,
}

/// What the server answered a client proposal with.
#[derive(Debug)]
pub enum ClientOutcome {
    /// The session is live.
    Accepted(ClientSession),
    /// The server rejected the proposal and listed the versions it
    /// speaks, most preferred first.
    Rejected(Vec<String>),
}

/// Run the client side of the handshake.
///
/// Proposes the first entry of `offers` and lists the rest as
/// additional acceptable versions when the proposal's generation
/// supports that.
///
/// # Errors
///
/// Fails on empty `offers`, framing violations, or transport errors.
pub async fn run_client<R, W>(
    reader: &mut WireReader<R>,
    writer: &mut WireWriter<W>,
    offers: &[ProtocolVersion],
    key: Option<&[u8]>,
) -> ProtocolResult<ClientOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some((&proposed, additional)) = offers.split_first() else {
        return Err(ProtocolError::handshake_failed("no versions to offer"));
    };

    writer.write_string(proposed.label()).await?;
    writer.write_blob(key.unwrap_or_default()).await?;
    if proposed.has_multi_version_offer() {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16(additional.len() as u16).await?;
        for version in additional {
            writer.write_string(version.label()).await?;
        }
    }
    writer.flush().await?;

    if !reader.read_bool().await? {
        let mut supported = vec![reader.read_string().await?];
        let count = usize::from(reader.read_u16().await?);
        if count > MAX_VERSIONS {
            return Err(ProtocolError::invalid_frame(format!(
                "server listed {count} versions, maximum is {MAX_VERSIONS}"
            )));
        }
        for _ in 0..count {
            supported.push(reader.read_string().await?);
        }
        return Ok(ClientOutcome::Rejected(supported));
    }

    let (version, sequencing_enabled, sequence) = if proposed.has_sequencing() {
        let selected = ProtocolVersion::from_label(&reader.read_string().await?)?;
        let start = reader.read_u64().await?;
        (selected, selected.has_sequencing(), start)
    } else {
        (proposed, false, 0)
    };

    Ok(ClientOutcome::Accepted(ClientSession {
        version,
        sequencing_enabled,
        sequence,
    }))
}
