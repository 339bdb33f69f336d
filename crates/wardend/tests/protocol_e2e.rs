//! End-to-end protocol tests over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use wardend::grants::AccessKeyRegistry;
use wardend::handlers::{
    standard_table, TASK_EXEC, TASK_GRANT_ACCESS, TASK_REDEEM_ACCESS, TASK_RESTART_SERVICE,
    TASK_TIME,
};
use wardend::protocol::acceptor::{Acceptor, Endpoint, Transport};
use wardend::protocol::auth::{Authenticator, DaemonKey};
use wardend::protocol::client::{ClientConnection, ClientOptions, FailureKind, Reply};
use wardend::protocol::connection::ConnectionDriver;
use wardend::protocol::handshake;
use wardend::protocol::wire::{
    put_blob, put_string, RequestReader, WireReader, WireWriter, MARKER_SUCCESS,
};
use wardend::protocol::{
    CommandHandler, DispatchTable, HandlerError, RequestContext, RequiredPrivilege,
};

const SECRET: &[u8] = b"e2e test key";

/// Start a daemon on an ephemeral loopback port; returns its address
/// and a token that stops it.
async fn start_daemon() -> (SocketAddr, CancellationToken) {
    // /bin/echo stands in for the service control program.
    start_daemon_with(standard_table("/bin/echo")).await
}

async fn start_daemon_with(table: DispatchTable) -> (SocketAddr, CancellationToken) {
    let auth = Arc::new(Authenticator::new(
        DaemonKey::from_secret(SECRET),
        vec!["127.0.0.1".parse().unwrap()],
    ));
    let table = Arc::new(table);
    let grants = Arc::new(AccessKeyRegistry::new());
    let driver = Arc::new(ConnectionDriver::new(table, auth, grants));

    let endpoint = Endpoint {
        addr: "127.0.0.1:0".parse().unwrap(),
        transport: Transport::Plain,
    };
    let shutdown = CancellationToken::new();
    let acceptor = Acceptor::bind(&endpoint, driver, shutdown.clone())
        .await
        .unwrap();
    let addr = acceptor.local_addr().unwrap();
    tokio::spawn(acceptor.run());
    (addr, shutdown)
}

async fn master_client(addr: SocketAddr) -> ClientConnection {
    ClientConnection::connect(
        addr,
        ClientOptions {
            key: Some(SECRET.to_vec()),
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

fn exec_args(program: &str, args: &[&str], stdin: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_string(&mut buf, program);
    buf.extend_from_slice(&(args.len() as u16).to_be_bytes());
    for arg in args {
        put_string(&mut buf, arg);
    }
    put_blob(&mut buf, stdin);
    buf
}

#[tokio::test]
async fn master_session_runs_time_and_exec() {
    let (addr, shutdown) = start_daemon().await;
    let mut client = master_client(addr).await;

    let reply = client.call(TASK_TIME, &[]).await.unwrap();
    assert!(matches!(reply, Reply::Success));
    let reported = client.read_i64().await.unwrap();
    let now = chrono::Utc::now().timestamp();
    assert!((reported - now).abs() < 30, "clock reply way off: {reported}");

    let args = exec_args("/bin/cat", &[], b"through the pipe");
    let reply = client.call(TASK_EXEC, &args).await.unwrap();
    assert!(matches!(reply, Reply::Success));
    assert_eq!(client.read_blob().await.unwrap(), b"through the pipe");
    assert_eq!(client.read_string().await.unwrap(), "");

    client.quit().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn exec_failure_reports_stderr_in_band() {
    let (addr, shutdown) = start_daemon().await;
    let mut client = master_client(addr).await;

    let args = exec_args("/bin/sh", &["-c", "echo oops >&2; exit 2"], b"");
    match client.call(TASK_EXEC, &args).await.unwrap() {
        Reply::Failure { kind, message } => {
            assert_eq!(kind, FailureKind::Data);
            assert!(message.contains("oops"), "stderr missing from {message:?}");
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    // The failure was request-scoped; the session still works.
    assert!(matches!(
        client.call(TASK_TIME, &[]).await.unwrap(),
        Reply::Success
    ));
    client.read_i64().await.unwrap();

    client.quit().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn unprivileged_session_is_refused_master_tasks_but_survives() {
    let (addr, shutdown) = start_daemon().await;
    let mut client = ClientConnection::connect(addr, ClientOptions::default())
        .await
        .unwrap();

    let args = exec_args("/bin/true", &[], b"");
    match client.call(TASK_EXEC, &args).await.unwrap() {
        Reply::Failure { kind, message } => {
            assert_eq!(kind, FailureKind::Data);
            assert!(message.contains("daemon key"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    assert!(matches!(
        client.call(TASK_TIME, &[]).await.unwrap(),
        Reply::Success
    ));
    client.read_i64().await.unwrap();

    client.quit().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn wrong_key_is_rejected_at_establishment() {
    let (addr, shutdown) = start_daemon().await;
    let result = ClientConnection::connect(
        addr,
        ClientOptions {
            key: Some(b"not the key".to_vec()),
            ..Default::default()
        },
    )
    .await;
    assert!(result.is_err());
    shutdown.cancel();
}

#[tokio::test]
async fn restart_service_runs_control_program() {
    let (addr, shutdown) = start_daemon().await;
    let mut client = master_client(addr).await;

    let mut args = Vec::new();
    put_string(&mut args, "webapp");
    let reply = client.call(TASK_RESTART_SERVICE, &args).await.unwrap();
    assert!(matches!(reply, Reply::Success));

    // An empty service name is a data failure, not a dead session.
    let mut args = Vec::new();
    put_string(&mut args, "");
    match client.call(TASK_RESTART_SERVICE, &args).await.unwrap() {
        Reply::Failure { kind, .. } => assert_eq!(kind, FailureKind::Data),
        other => panic!("unexpected reply: {other:?}"),
    }

    client.quit().await.unwrap();
    shutdown.cancel();
}

fn grant_args(key: u64, command: u16, params: [&str; 4]) -> Vec<u8> {
    let mut buf = key.to_be_bytes().to_vec();
    buf.extend_from_slice(&command.to_be_bytes());
    for p in params {
        put_string(&mut buf, p);
    }
    buf
}

fn redeem_args(key: u64, command: u16) -> Vec<u8> {
    let mut buf = key.to_be_bytes().to_vec();
    buf.extend_from_slice(&command.to_be_bytes());
    buf
}

#[tokio::test]
async fn access_key_grant_and_redeem_across_sessions() {
    let (addr, shutdown) = start_daemon().await;

    // Privileged session issues the key.
    let key: u64 = rand::random();
    let mut master = master_client(addr).await;
    let reply = master
        .call(
            TASK_GRANT_ACCESS,
            &grant_args(key, TASK_RESTART_SERVICE, ["webapp", "", "", ""]),
        )
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Success));
    master.quit().await.unwrap();

    // A later unprivileged session redeems it.
    let mut client = ClientConnection::connect(addr, ClientOptions::default())
        .await
        .unwrap();
    let reply = client
        .call(TASK_REDEEM_ACCESS, &redeem_args(key, TASK_RESTART_SERVICE))
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Success));
    assert_eq!(client.read_string().await.unwrap(), "webapp");
    for _ in 0..3 {
        assert_eq!(client.read_string().await.unwrap(), "");
    }

    // Single use: the second redemption is an in-band failure.
    match client
        .call(TASK_REDEEM_ACCESS, &redeem_args(key, TASK_RESTART_SERVICE))
        .await
        .unwrap()
    {
        Reply::Failure { kind, message } => {
            assert_eq!(kind, FailureKind::Data);
            assert!(message.contains("not recognized"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    client.quit().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn wrong_command_redemption_fails_distinctly_and_burns_the_key() {
    let (addr, shutdown) = start_daemon().await;

    let key: u64 = rand::random();
    let mut master = master_client(addr).await;
    let reply = master
        .call(
            TASK_GRANT_ACCESS,
            &grant_args(key, TASK_RESTART_SERVICE, ["", "", "", ""]),
        )
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Success));
    master.quit().await.unwrap();

    let mut client = ClientConnection::connect(addr, ClientOptions::default())
        .await
        .unwrap();

    // Mismatch is reported distinctly from "unknown key"...
    match client
        .call(TASK_REDEEM_ACCESS, &redeem_args(key, TASK_TIME))
        .await
        .unwrap()
    {
        Reply::Failure { kind, message } => {
            assert_eq!(kind, FailureKind::Data);
            assert!(message.contains("authorizes"), "got {message:?}");
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    // ...the session survives, and the key was consumed regardless.
    match client
        .call(TASK_REDEEM_ACCESS, &redeem_args(key, TASK_RESTART_SERVICE))
        .await
        .unwrap()
    {
        Reply::Failure { message, .. } => {
            assert!(message.contains("not recognized"), "got {message:?}");
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    client.quit().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn unknown_task_code_closes_without_reply() {
    let (addr, shutdown) = start_daemon().await;
    let mut client = master_client(addr).await;

    let result = client.call(0x4242, &[]).await;
    assert!(result.is_err());
    shutdown.cancel();
}

#[tokio::test]
async fn sequence_mismatch_is_fatal() {
    let (addr, shutdown) = start_daemon().await;

    // Drive the wire by hand so we can lie about the sequence.
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = WireReader::new(BufReader::new(read_half));
    let mut writer = WireWriter::new(BufWriter::new(write_half));

    let session = match handshake::run_client(
        &mut reader,
        &mut writer,
        wardend::protocol::SUPPORTED,
        None,
    )
    .await
    .unwrap()
    {
        handshake::ClientOutcome::Accepted(session) => session,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert!(session.sequencing_enabled);

    writer.write_u64(session.sequence.wrapping_add(5)).await.unwrap();
    writer.write_u16(TASK_TIME).await.unwrap();
    writer.flush().await.unwrap();

    // The daemon drops the connection without echoing.
    assert!(reader.read_u64().await.is_err());
    shutdown.cancel();
}

/// Holds its reply until released, so a test can observe what reaches
/// the wire while the handler is still running.
struct GatedHandler {
    release: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
}

#[async_trait::async_trait]
impl CommandHandler for GatedHandler {
    async fn handle(
        &self,
        _request: &mut RequestReader,
        _ctx: &RequestContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        if let Some(gate) = self.release.lock().await.take() {
            let _ = gate.await;
        }
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn sequence_echo_is_flushed_before_the_handler_replies() {
    const TASK_GATED: u16 = 9;
    let (release, gate) = tokio::sync::oneshot::channel();
    let mut table = DispatchTable::new();
    table.register(
        TASK_GATED,
        RequiredPrivilege::Any,
        Arc::new(GatedHandler {
            release: tokio::sync::Mutex::new(Some(gate)),
        }),
    );
    let (addr, shutdown) = start_daemon_with(table).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = WireReader::new(BufReader::new(read_half));
    let mut writer = WireWriter::new(BufWriter::new(write_half));

    let session = match handshake::run_client(
        &mut reader,
        &mut writer,
        wardend::protocol::SUPPORTED,
        None,
    )
    .await
    .unwrap()
    {
        handshake::ClientOutcome::Accepted(session) => session,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert!(session.sequencing_enabled);

    writer.write_u64(session.sequence).await.unwrap();
    writer.write_u16(TASK_GATED).await.unwrap();
    writer.flush().await.unwrap();

    // The echo must arrive while the handler is still held open.
    let echoed = tokio::time::timeout(std::time::Duration::from_secs(5), reader.read_u64())
        .await
        .expect("sequence echo was not flushed before the handler ran")
        .unwrap();
    assert_eq!(echoed, session.sequence);

    release.send(()).unwrap();
    assert_eq!(reader.read_u8().await.unwrap(), MARKER_SUCCESS);
    shutdown.cancel();
}

#[tokio::test]
async fn sequencing_survives_many_requests() {
    let (addr, shutdown) = start_daemon().await;
    let mut client = master_client(addr).await;

    for _ in 0..50 {
        assert!(matches!(
            client.call(TASK_TIME, &[]).await.unwrap(),
            Reply::Success
        ));
        client.read_i64().await.unwrap();
    }

    client.quit().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn legacy_version_session_without_sequencing() {
    use wardend::protocol::ProtocolVersion;

    let (addr, shutdown) = start_daemon().await;
    let mut client = ClientConnection::connect(
        addr,
        ClientOptions {
            offers: vec![ProtocolVersion::V1],
            key: Some(SECRET.to_vec()),
        },
    )
    .await
    .unwrap();
    assert_eq!(client.version(), ProtocolVersion::V1);

    assert!(matches!(
        client.call(TASK_TIME, &[]).await.unwrap(),
        Reply::Success
    ));
    client.read_i64().await.unwrap();

    client.quit().await.unwrap();
    shutdown.cancel();
}
