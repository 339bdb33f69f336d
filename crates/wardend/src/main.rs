//! wardend daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wardend::config::DaemonConfig;
use wardend::grants::AccessKeyRegistry;
use wardend::handlers::standard_table;
use wardend::protocol::acceptor::Acceptor;
use wardend::protocol::auth::Authenticator;
use wardend::protocol::connection::ConnectionDriver;

#[derive(Debug, Parser)]
#[command(name = "wardend", about = "server management daemon", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/wardend/wardend.toml")]
    config: PathBuf,

    /// Log filter (overrides RUST_LOG).
    #[arg(long)]
    log: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Hash a shared key read from stdin for the config file.
    HashKey,
}

fn init_tracing(log: Option<&str>) {
    let filter = match log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn hash_key() -> anyhow::Result<()> {
    let mut secret = String::new();
    std::io::stdin()
        .read_line(&mut secret)
        .context("reading key from stdin")?;
    let secret = secret.trim_end_matches(['\r', '\n']);
    anyhow::ensure!(!secret.is_empty(), "key must not be empty");

    let digest: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    println!("{hex}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::HashKey) = args.command {
        return hash_key();
    }

    init_tracing(args.log.as_deref());

    let config = DaemonConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let key = config.daemon_key().context("decoding daemon key digest")?;
    let auth = Arc::new(Authenticator::new(key, config.allow_from.clone()));
    let table = Arc::new(standard_table(config.service_control.clone()));
    let grants = Arc::new(AccessKeyRegistry::new());
    let driver = Arc::new(ConnectionDriver::new(table, auth, grants));

    let shutdown = CancellationToken::new();
    let mut acceptor_tasks = Vec::new();

    for endpoint in config.endpoints() {
        let driver = Arc::clone(&driver);
        let shutdown = shutdown.clone();
        acceptor_tasks.push(tokio::spawn(async move {
            if let Some(acceptor) =
                Acceptor::bind_with_retry(&endpoint, driver, shutdown.clone()).await
            {
                acceptor.run().await;
            }
        }));
    }

    info!(endpoints = config.listen.len(), "wardend started");

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    shutdown.cancel();
    for task in acceptor_tasks {
        if let Err(e) = task.await {
            error!(error = %e, "acceptor task panicked");
        }
    }

    info!("wardend stopped");
    Ok(())
}
