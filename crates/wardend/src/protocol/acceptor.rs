//! Listening endpoints and the accept loop.
//!
//! Each configured endpoint gets its own acceptor task. Accepted
//! connections are served on their own tasks so one slow controller
//! never delays another. Binding is retried with a fixed backoff: on
//! daemon restart the old socket may linger in `TIME_WAIT`, and giving
//! up would leave the daemon running but unreachable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionDriver;
use super::error::{ProtocolError, ProtocolResult};
use super::wire::BoxedStream;

/// Delay between bind attempts when the listening address is busy.
pub const BIND_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// How lingering close waits for unsent replies.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Transport security for one endpoint.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Plain TCP.
    Plain,
    /// TLS with the given certificate chain and private key files.
    Tls {
        /// PEM certificate chain path.
        cert_path: PathBuf,
        /// PEM private key path.
        key_path: PathBuf,
    },
}

/// One configured listening endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Address and port to bind.
    pub addr: SocketAddr,
    /// Transport security for connections on this endpoint.
    pub transport: Transport,
}

/// A bound listener serving one endpoint.
pub struct Acceptor {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    driver: Arc<ConnectionDriver>,
    shutdown: CancellationToken,
}

impl Acceptor {
    /// Bind the endpoint and prepare its TLS state, if any.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the TLS material cannot
    /// be loaded.
    pub async fn bind(
        endpoint: &Endpoint,
        driver: Arc<ConnectionDriver>,
        shutdown: CancellationToken,
    ) -> ProtocolResult<Self> {
        let tls = match &endpoint.transport {
            Transport::Plain => None,
            Transport::Tls {
                cert_path,
                key_path,
            } => Some(TlsAcceptor::from(Arc::new(load_tls_config(
                cert_path, key_path,
            )?))),
        };

        let listener = TcpListener::bind(endpoint.addr).await?;
        info!(
            addr = %endpoint.addr,
            tls = tls.is_some(),
            "listening for controller connections"
        );

        Ok(Self {
            listener,
            tls,
            driver,
            shutdown,
        })
    }

    /// Bind with retries, backing off [`BIND_RETRY_BACKOFF`] between
    /// attempts, until the bind succeeds or shutdown is requested.
    pub async fn bind_with_retry(
        endpoint: &Endpoint,
        driver: Arc<ConnectionDriver>,
        shutdown: CancellationToken,
    ) -> Option<Self> {
        loop {
            match Self::bind(endpoint, Arc::clone(&driver), shutdown.clone()).await {
                Ok(acceptor) => return Some(acceptor),
                Err(e) => {
                    warn!(
                        addr = %endpoint.addr,
                        error = %e,
                        retry_in = ?BIND_RETRY_BACKOFF,
                        "failed to bind endpoint"
                    );
                }
            }
            if !pause_for_retry(&shutdown, BIND_RETRY_BACKOFF).await {
                return None;
            }
        }
    }

    /// The bound local address. Useful when the endpoint was
    /// configured with port 0.
    ///
    /// # Errors
    ///
    /// Propagates the OS error if the socket is gone.
    pub fn local_addr(&self) -> ProtocolResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("acceptor shutting down");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Accept errors (EMFILE, reset during accept) must
                    // not kill the listener, but a persistent one would
                    // spin the loop hot; back off before retrying.
                    warn!(error = %e, retry_in = ?BIND_RETRY_BACKOFF, "accept failed");
                    if !pause_for_retry(&self.shutdown, BIND_RETRY_BACKOFF).await {
                        debug!("acceptor shutting down");
                        return;
                    }
                    continue;
                }
            };

            if let Err(e) = configure_stream(&stream) {
                warn!(peer = %peer, error = %e, "failed to configure accepted socket");
            }

            let driver = Arc::clone(&self.driver);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let boxed: BoxedStream = Box::new(tls_stream);
                            driver.serve(boxed, peer).await
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS accept failed");
                            return;
                        }
                    },
                    None => {
                        let boxed: BoxedStream = Box::new(stream);
                        driver.serve(boxed, peer).await
                    }
                };

                match result {
                    Ok(()) => {}
                    Err(e) if e.is_benign_disconnect() => {
                        debug!(peer = %peer, "peer disconnected");
                    }
                    Err(e) if e.is_protocol_violation() => {
                        warn!(peer = %peer, error = %e, "closing session after protocol violation");
                    }
                    Err(e) => {
                        error!(peer = %peer, error = %e, "session failed");
                    }
                }
            });
        }
    }
}

/// Wait out a retry backoff, returning `false` if shutdown was
/// requested instead of the pause elapsing.
async fn pause_for_retry(shutdown: &CancellationToken, backoff: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(backoff) => true,
    }
}

/// Socket options for an accepted connection: replies are small and
/// latency-sensitive, and unsent data should be flushed briefly on
/// close rather than discarded.
fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_linger(Some(CLOSE_LINGER))?;
    Ok(())
}

/// Load a rustls server configuration from PEM files.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> ProtocolResult<ServerConfig> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| {
            ProtocolError::tls_config(format!(
                "cannot read certificate file {}: {e}",
                cert_path.display()
            ))
        })?
        .collect::<Result<_, _>>()
        .map_err(|e| {
            ProtocolError::tls_config(format!(
                "invalid certificate in {}: {e}",
                cert_path.display()
            ))
        })?;
    if certs.is_empty() {
        return Err(ProtocolError::tls_config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        ProtocolError::tls_config(format!(
            "cannot read private key {}: {e}",
            key_path.display()
        ))
    })?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProtocolError::tls_config(format!("invalid certificate/key pair: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_pause_elapses_when_running() {
        let shutdown = CancellationToken::new();
        assert!(pause_for_retry(&shutdown, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn retry_pause_yields_to_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // Returns promptly even though the backoff is the full minute.
        assert!(!pause_for_retry(&shutdown, BIND_RETRY_BACKOFF).await);
    }
}
