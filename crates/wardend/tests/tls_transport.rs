//! Protocol sessions over the TLS transport.

use std::io::Write;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use wardend::grants::AccessKeyRegistry;
use wardend::handlers::{standard_table, TASK_TIME};
use wardend::protocol::acceptor::{Acceptor, Endpoint, Transport};
use wardend::protocol::auth::{Authenticator, DaemonKey};
use wardend::protocol::client::{ClientConnection, ClientOptions, Reply};
use wardend::protocol::connection::ConnectionDriver;

const SECRET: &[u8] = b"tls test key";

struct TlsFixture {
    _dir: tempfile::TempDir,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    connector: TlsConnector,
}

/// Generate a self-signed localhost certificate, start a TLS daemon
/// on an ephemeral port, and build a connector that trusts it.
async fn start_tls_daemon() -> TlsFixture {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::File::create(&cert_path)
        .unwrap()
        .write_all(certified.cert.pem().as_bytes())
        .unwrap();
    std::fs::File::create(&key_path)
        .unwrap()
        .write_all(certified.key_pair.serialize_pem().as_bytes())
        .unwrap();

    let auth = Arc::new(Authenticator::new(
        DaemonKey::from_secret(SECRET),
        vec!["127.0.0.1".parse().unwrap()],
    ));
    let table = Arc::new(standard_table("/bin/echo"));
    let grants = Arc::new(AccessKeyRegistry::new());
    let driver = Arc::new(ConnectionDriver::new(table, auth, grants));

    let endpoint = Endpoint {
        addr: "127.0.0.1:0".parse().unwrap(),
        transport: Transport::Tls {
            cert_path,
            key_path,
        },
    };
    let shutdown = CancellationToken::new();
    let acceptor = Acceptor::bind(&endpoint, driver, shutdown.clone())
        .await
        .unwrap();
    let addr = acceptor.local_addr().unwrap();
    tokio::spawn(acceptor.run());

    let mut roots = RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    TlsFixture {
        _dir: dir,
        addr,
        shutdown,
        connector,
    }
}

#[tokio::test]
async fn full_session_over_tls() {
    let fixture = start_tls_daemon().await;

    let tcp = TcpStream::connect(fixture.addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls = fixture.connector.connect(server_name, tcp).await.unwrap();

    let mut client = ClientConnection::establish(
        Box::new(tls),
        ClientOptions {
            key: Some(SECRET.to_vec()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let reply = client.call(TASK_TIME, &[]).await.unwrap();
    assert!(matches!(reply, Reply::Success));
    client.read_i64().await.unwrap();

    client.quit().await.unwrap();
    fixture.shutdown.cancel();
}

#[tokio::test]
async fn plain_client_cannot_speak_to_tls_endpoint() {
    let fixture = start_tls_daemon().await;

    // The handshake bytes are not a TLS ClientHello; the daemon's TLS
    // accept fails and the connection dies without a protocol reply.
    let result = ClientConnection::connect(fixture.addr, ClientOptions::default()).await;
    assert!(result.is_err());
    fixture.shutdown.cancel();
}

#[tokio::test]
async fn missing_certificate_file_fails_bind() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint {
        addr: "127.0.0.1:0".parse().unwrap(),
        transport: Transport::Tls {
            cert_path: dir.path().join("absent-cert.pem"),
            key_path: dir.path().join("absent-key.pem"),
        },
    };

    let auth = Arc::new(Authenticator::new(DaemonKey::from_secret(b"k"), Vec::new()));
    let table = Arc::new(standard_table("/bin/echo"));
    let grants = Arc::new(AccessKeyRegistry::new());
    let driver = Arc::new(ConnectionDriver::new(table, auth, grants));

    let result = Acceptor::bind(&endpoint, driver, CancellationToken::new()).await;
    assert!(result.is_err());
}
