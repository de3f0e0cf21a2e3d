//! Per-connection protocol handler and the local-socket listener.
//!
//! Each accepted byte stream walks the same state machine regardless of
//! transport: authenticate, then loop reading one framed request, producing
//! one framed response, until the peer closes, a frame error occurs, or the
//! supervisor shuts down. At most one request is in flight per connection
//! and responses are written in request order.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;

use crate::auth::{self, KeyStore};
use crate::backend::Backend;
use crate::dispatch::{self, ConnSession};
use crate::protocol::{
    read_frame, write_frame, AuthReply, AuthStatus, ErrorCode, Hello, Response, PROTOCOL_VERSION,
};
use crate::state::{ConnectionGuard, ServerState};

/// Handshake replies must arrive within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle limit between requests once authenticated.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Which endpoint accepted the connection. The local socket's ACL is
/// trusted, so with auth disabled it skips the hello frame entirely; TCP
/// always announces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Local,
    Tcp,
}

/// Drive one connection to completion.
pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    state: Arc<ServerState>,
    backend: Arc<dyn Backend>,
    keys: Option<Arc<KeyStore>>,
    transport: TransportKind,
) -> io::Result<()> {
    if !authenticate(&mut stream, &keys, transport).await? {
        // Failed or garbled handshake: close without further reply.
        return Ok(());
    }

    let mut session = ConnSession::default();
    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            read = tokio::time::timeout(IDLE_TIMEOUT, read_frame(&mut stream)) => {
                match read {
                    Err(_) => {
                        tracing::debug!("connection idle past limit");
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "connection ended");
                        break;
                    }
                    Ok(Ok(frame)) => frame,
                }
            }
        };

        let payload = dispatch::dispatch(&state, &backend, &mut session, &frame)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(&mut stream, payload.as_bytes()).await?;
    }
    Ok(())
}

/// Run the handshake. Returns whether the connection may proceed to the
/// request loop; `false` means close silently.
async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keys: &Option<Arc<KeyStore>>,
    transport: TransportKind,
) -> io::Result<bool> {
    let Some(keys) = keys else {
        // Auth disabled: the pipe's ACL is trusted and gets no frame at
        // all; TCP still announces itself.
        if transport == TransportKind::Tcp {
            let hello = Hello {
                version: PROTOCOL_VERSION.to_string(),
                nonce: None,
            };
            write_json(stream, &hello).await?;
        }
        return Ok(true);
    };

    let nonce = auth::generate_nonce();
    let hello = Hello {
        version: PROTOCOL_VERSION.to_string(),
        nonce: Some(BASE64.encode(nonce)),
    };
    write_json(stream, &hello).await?;

    loop {
        let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(stream)).await {
            Err(_) => {
                tracing::debug!("handshake timed out");
                return Ok(false);
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "handshake read failed");
                return Ok(false);
            }
            Ok(Ok(frame)) => frame,
        };

        let Ok(value) = serde_json::from_slice::<Value>(&frame) else {
            return Ok(false);
        };

        // A regular request before the handshake completes is refused
        // without changing state; the client may still answer the
        // challenge afterwards.
        if value.get("method").is_some() {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let resp = Response::failure(id, ErrorCode::Unauthorized, "authentication required");
            write_json(stream, &resp).await?;
            continue;
        }

        let Ok(reply) = serde_json::from_value::<AuthReply>(value) else {
            return Ok(false);
        };
        if reply.version != PROTOCOL_VERSION {
            tracing::warn!(version = %reply.version, "handshake version mismatch");
            return Ok(false);
        }
        let Some(key) = keys.find(&reply.identity) else {
            tracing::warn!(identity = %reply.identity, "unknown identity");
            return Ok(false);
        };
        if !auth::verify_signature(&key.key, &nonce, &reply.signature) {
            tracing::warn!(identity = %reply.identity, "signature verification failed");
            return Ok(false);
        }

        tracing::info!(identity = %reply.identity, "client authenticated");
        write_json(stream, &AuthStatus { ok: true }).await?;
        return Ok(true);
    }
}

async fn write_json<S, T>(stream: &mut S, value: &T) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let payload =
        serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(stream, &payload).await
}

// ── Local socket listener ──────────────────────────────────────────

/// Default path of the local endpoint for this user.
pub fn default_socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/tmp/wininspectd-{}", whoami()));
    PathBuf::from(runtime_dir).join("wininspectd.sock")
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Bind the local socket, replacing a stale file but refusing to displace
/// a live daemon.
pub fn bind_local(socket_path: &Path) -> io::Result<UnixListener> {
    if socket_path.exists() {
        match std::os::unix::net::UnixStream::connect(socket_path) {
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!(
                        "another daemon is already listening on {}",
                        socket_path.display()
                    ),
                ));
            }
            Err(_) => {
                std::fs::remove_file(socket_path)?;
            }
        }
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    // Restrict socket permissions to owner only (0600)
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Accept loop for the local endpoint. Runs until shutdown.
pub async fn serve_local(
    listener: UnixListener,
    state: Arc<ServerState>,
    backend: Arc<dyn Backend>,
    keys: Option<Arc<KeyStore>>,
) {
    tracing::info!("local socket listener running");
    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _addr)) => {
                let Some(guard) = ConnectionGuard::try_acquire(&state) else {
                    tracing::warn!("connection limit reached, refusing local client");
                    drop(stream);
                    continue;
                };
                let state = Arc::clone(&state);
                let backend = Arc::clone(&backend);
                let keys = keys.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) =
                        handle_connection(stream, state, backend, keys, TransportKind::Local).await
                    {
                        tracing::debug!(error = %e, "local connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to accept local connection");
            }
        }
    }
}
