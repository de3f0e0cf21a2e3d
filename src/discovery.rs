//! UDP discovery responder.
//!
//! Answers `WININSPECT_DISCOVER` probes with a one-shot JSON announcement
//! naming the TCP port and host environment. Fully stateless; unknown
//! datagrams are dropped silently.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;

use tokio::net::UdpSocket;

use crate::backend::Backend;
use crate::protocol::DISCOVERY_PROBE;
use crate::state::ServerState;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "announcement")]
struct Announcement {
    port: u16,
    os: String,
    is_wine: bool,
    hostname: String,
}

/// Bind the discovery socket. Fatal at startup on failure.
pub async fn bind_discovery(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
}

/// Respond to discovery probes until shutdown.
pub async fn serve_discovery(
    socket: UdpSocket,
    state: Arc<ServerState>,
    backend: Arc<dyn Backend>,
) {
    // Environment metadata does not change over the daemon's lifetime;
    // capture it once off the async path.
    let meta = {
        let backend = Arc::clone(&backend);
        match tokio::task::spawn_blocking(move || backend.env_metadata()).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::error!(error = %e, "discovery responder failed to read env metadata");
                return;
            }
        }
    };
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    tracing::info!("discovery responder running");
    let mut buf = [0u8; 512];
    loop {
        let received = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "discovery receive failed");
                continue;
            }
        };
        if &buf[..len] != DISCOVERY_PROBE {
            continue;
        }

        let announcement = Announcement {
            port: state.tcp_port,
            os: meta.os.clone(),
            is_wine: meta.is_wine,
            hostname: hostname.clone(),
        };
        match serde_json::to_vec(&announcement) {
            Ok(payload) => {
                if let Err(e) = socket.send_to(&payload, peer).await {
                    tracing::debug!(error = %e, %peer, "failed to answer discovery probe");
                } else {
                    tracing::debug!(%peer, "answered discovery probe");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode announcement"),
        }
    }
}
