//! Protocol client.
//!
//! Connects to a daemon endpoint, performs the handshake (signing the
//! challenge when the server demands it), and exchanges framed
//! request/response pairs. Used by tooling and by the integration tests.

use std::io;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs, UnixStream};

use crate::auth::{self, SignError};
use crate::protocol::{
    read_frame, write_frame, AuthReply, AuthStatus, FrameError, Hello, Response, PROTOCOL_VERSION,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error("server requires authentication but no credentials were given")]
    AuthRequired,
    #[error("server rejected the handshake")]
    AuthRejected,
    #[error("malformed challenge nonce")]
    BadChallenge,
    #[error("protocol version mismatch: server speaks {0}")]
    VersionMismatch(String),
}

/// Identity and key used to answer a challenge.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub identity: &'a str,
    pub key_path: &'a Path,
}

/// One authenticated connection to the daemon.
pub struct Client<S> {
    stream: S,
    next_id: u64,
}

impl Client<TcpStream> {
    /// Connect over TCP. The server always sends a hello on this
    /// transport; a nonce in it means credentials are required.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        credentials: Option<Credentials<'_>>,
    ) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        let hello: Hello = serde_json::from_slice(&read_frame(&mut stream).await?)?;
        handshake(&mut stream, hello, credentials).await?;
        Ok(Self { stream, next_id: 1 })
    }
}

impl Client<UnixStream> {
    /// Connect over the local socket. With auth disabled the server sends
    /// nothing; with keys configured it challenges like TCP, so pass
    /// credentials iff the daemon runs with `--auth-keys`.
    pub async fn connect_local(
        path: &Path,
        credentials: Option<Credentials<'_>>,
    ) -> Result<Self, ClientError> {
        let mut stream = UnixStream::connect(path).await?;
        if let Some(credentials) = credentials {
            let hello: Hello = serde_json::from_slice(&read_frame(&mut stream).await?)?;
            handshake(&mut stream, hello, Some(credentials)).await?;
        }
        Ok(Self { stream, next_id: 1 })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Send one request and read its response.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Response, ClientError> {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.send(&json!({ "id": id, "method": method, "params": params }))
            .await?;
        self.read_response().await
    }

    /// Send an arbitrary JSON body as one frame.
    pub async fn send(&mut self, body: &Value) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(body)?;
        write_frame(&mut self.stream, &payload).await?;
        Ok(())
    }

    /// Send raw bytes as one frame. For protocol tests.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        write_frame(&mut self.stream, payload).await?;
        Ok(())
    }

    /// Read one response frame.
    pub async fn read_response(&mut self) -> Result<Response, ClientError> {
        let frame = read_frame(&mut self.stream).await?;
        Ok(serde_json::from_slice(&frame)?)
    }
}

async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    hello: Hello,
    credentials: Option<Credentials<'_>>,
) -> Result<(), ClientError> {
    if hello.version != PROTOCOL_VERSION {
        return Err(ClientError::VersionMismatch(hello.version));
    }
    let Some(nonce_b64) = hello.nonce else {
        return Ok(());
    };
    let credentials = credentials.ok_or(ClientError::AuthRequired)?;
    let nonce = BASE64
        .decode(nonce_b64)
        .map_err(|_| ClientError::BadChallenge)?;
    let signature = auth::sign_nonce(credentials.key_path, &nonce)?;
    let reply = AuthReply {
        version: PROTOCOL_VERSION.to_string(),
        identity: credentials.identity.to_string(),
        signature,
    };
    let payload = serde_json::to_vec(&reply)?;
    write_frame(stream, &payload).await?;

    // A rejected handshake is a silent close; surface EOF as rejection.
    let frame = read_frame(stream)
        .await
        .map_err(|_| ClientError::AuthRejected)?;
    let status: AuthStatus =
        serde_json::from_slice(&frame).map_err(|_| ClientError::AuthRejected)?;
    if !status.ok {
        return Err(ClientError::AuthRejected);
    }
    Ok(())
}
