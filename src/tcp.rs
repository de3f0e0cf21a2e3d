//! TCP listener for cross-environment access (host <-> guest, host <->
//! Wine prefix).
//!
//! Binds loopback only unless `--public` was given. The handshake policy
//! is stricter than the local socket's: TCP always sends a hello frame,
//! and with keys configured every connection must pass the challenge.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::auth::KeyStore;
use crate::backend::Backend;
use crate::server::{handle_connection, TransportKind};
use crate::state::{ConnectionGuard, ServerState};

/// Bind the TCP endpoint. Fatal at startup on failure.
pub async fn bind_tcp(public: bool, port: u16) -> io::Result<TcpListener> {
    let ip = if public {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    TcpListener::bind(SocketAddr::new(ip, port)).await
}

/// Accept loop for the TCP endpoint. Runs until shutdown.
pub async fn serve_tcp(
    listener: TcpListener,
    state: Arc<ServerState>,
    backend: Arc<dyn Backend>,
    keys: Option<Arc<KeyStore>>,
) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(%addr, "tcp listener running"),
        Err(_) => tracing::info!("tcp listener running"),
    }
    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let Some(guard) = ConnectionGuard::try_acquire(&state) else {
                    tracing::warn!(%peer, "connection limit reached, refusing tcp client");
                    drop(stream);
                    continue;
                };
                let state = Arc::clone(&state);
                let backend = Arc::clone(&backend);
                let keys = keys.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) =
                        handle_connection(stream, state, backend, keys, TransportKind::Tcp).await
                    {
                        tracing::debug!(error = %e, %peer, "tcp connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to accept tcp connection");
            }
        }
    }
}
