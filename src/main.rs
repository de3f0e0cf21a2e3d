//! wininspectd - desktop inspection daemon.
//!
//! Supervisor: parses the CLI, wires up logging, and launches the local
//! socket listener, the TCP listener, the UDP discovery responder, and the
//! session reaper. Owns the shutdown signal; on ctrl-c the listeners stop
//! accepting and in-flight requests complete.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser as ClapParser, ValueEnum};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wininspectd::{
    auth::{KeyStore, KeyStoreError},
    backend::{Backend, FakeBackend},
    discovery, logbuf,
    server::{self, default_socket_path},
    session,
    state::{Limits, ServerState},
    tcp,
};

/// wininspectd - desktop inspection daemon
///
/// Serves a framed JSON protocol over a local socket and TCP, plus a UDP
/// discovery responder. Configuration is CLI-only; nothing is persisted.
#[derive(ClapParser, Debug)]
#[command(name = "wininspectd", version, about, long_about = None)]
struct Args {
    /// Skip the startup banner (for service managers)
    #[arg(long)]
    headless: bool,

    /// Bind TCP to all interfaces instead of loopback
    #[arg(long)]
    public: bool,

    /// Refuse every mutating method
    #[arg(long)]
    read_only: bool,

    /// Authorized-keys file enabling the challenge/response handshake
    #[arg(long, value_name = "PATH")]
    auth_keys: Option<PathBuf>,

    /// TCP port
    #[arg(long, default_value_t = 1985)]
    port: u16,

    /// UDP discovery port
    #[arg(long, default_value_t = 1986)]
    discovery_port: u16,

    /// Snapshot registry capacity
    #[arg(long, default_value_t = 1000)]
    max_snapshots: usize,

    /// Concurrent connection limit across both transports
    #[arg(long, default_value_t = 32)]
    max_conns: usize,

    /// Idle session lifetime in seconds
    #[arg(long, value_name = "SEC", default_value_t = 3600)]
    session_ttl: u64,

    /// Per-request watchdog in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    request_timeout: u64,

    /// Internal polling granularity in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 100)]
    poll_interval: u64,

    /// Upper bound on events.poll wait_ms
    #[arg(long, value_name = "MS", default_value_t = 30_000)]
    max_wait: u64,

    /// Log verbosity
    #[arg(long, value_enum, default_value = "INFO")]
    log_level: LogLevel,

    /// Local socket path (defaults to the per-user runtime dir)
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error("failed to load auth keys: {0}")]
    Keys(#[from] KeyStoreError),
    #[error("failed to bind local socket: {0}")]
    BindLocal(std::io::Error),
    #[error("failed to bind tcp listener: {0}")]
    BindTcp(std::io::Error),
    #[error("failed to bind discovery socket: {0}")]
    BindDiscovery(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let limits = Limits {
        max_snapshots: args.max_snapshots,
        max_connections: args.max_conns,
        session_ttl: Duration::from_secs(args.session_ttl),
        request_timeout: Duration::from_millis(args.request_timeout),
        poll_interval: Duration::from_millis(args.poll_interval),
        max_wait: Duration::from_millis(args.max_wait),
    };
    let state = Arc::new(ServerState::new(limits, args.read_only, args.port));

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| format!("wininspectd={}", args.log_level.as_directive())),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(logbuf::BufferLayer::new(Arc::clone(&state.logs)))
        .init();

    match run(args, state).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, state: Arc<ServerState>) -> Result<(), DaemonError> {
    tracing::info!("wininspectd starting");

    // Platform backends plug in here; this build serves the in-memory one.
    let backend: Arc<dyn Backend> = Arc::new(FakeBackend::default());

    if !args.headless {
        let b = Arc::clone(&backend);
        if let Ok(meta) = tokio::task::spawn_blocking(move || b.env_metadata()).await {
            tracing::info!(os = %meta.os, arch = %meta.arch, is_wine = meta.is_wine, "environment");
            if let Some(wine) = meta.wine_version {
                tracing::info!(version = %wine, "wine detected");
            }
        }
    }

    let keys = match &args.auth_keys {
        Some(path) => {
            let store = KeyStore::load(path)?;
            tracing::info!(keys = store.len(), "authentication enabled");
            Some(Arc::new(store))
        }
        None => None,
    };
    if args.public && keys.is_none() {
        tracing::warn!("--public without --auth-keys: tcp endpoint is unauthenticated");
    }

    let socket_path = args.socket_path.unwrap_or_else(default_socket_path);
    let local_listener = server::bind_local(&socket_path).map_err(DaemonError::BindLocal)?;
    tracing::info!(path = %socket_path.display(), "local socket bound");

    let tcp_listener = tcp::bind_tcp(args.public, args.port)
        .await
        .map_err(DaemonError::BindTcp)?;
    let discovery_socket = discovery::bind_discovery(args.discovery_port)
        .await
        .map_err(DaemonError::BindDiscovery)?;

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(server::serve_local(
        local_listener,
        Arc::clone(&state),
        Arc::clone(&backend),
        keys.clone(),
    )));
    tasks.push(tokio::spawn(tcp::serve_tcp(
        tcp_listener,
        Arc::clone(&state),
        Arc::clone(&backend),
        keys.clone(),
    )));
    tasks.push(tokio::spawn(discovery::serve_discovery(
        discovery_socket,
        Arc::clone(&state),
        Arc::clone(&backend),
    )));
    tasks.push(tokio::spawn(session::run_reaper(
        Arc::clone(&state.sessions),
        state.shutdown.clone(),
    )));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutting down");
    state.shutdown.trigger();

    for task in tasks {
        let _ = task.await;
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(error = %e, "could not remove socket file");
    }
    Ok(())
}
