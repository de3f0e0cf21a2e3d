//! Framed JSON protocol shared by the local-socket and TCP endpoints.
//!
//! Wire format: `[length: u32 little-endian][payload: UTF-8 JSON]`.
//!
//! One frame carries one request or one response; there is no interior
//! framing and no multiplexing. Frame errors are connection-fatal.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Version string exchanged during the handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum frame payload size (10 MiB). Prevents OOM on malformed data.
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

/// Body of a discovery probe datagram.
pub const DISCOVERY_PROBE: &[u8] = b"WININSPECT_DISCOVER";

/// Connection-fatal framing failure.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("zero-length frame")]
    ZeroLength,
    #[error("frame payload too large: {0} bytes")]
    TooLarge(u32),
}

/// Read one length-prefixed frame, retrying on short reads.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 {
        return Err(FrameError::ZeroLength);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> io::Result<()> {
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

// ── Envelope types ─────────────────────────────────────────────────

/// A parsed client request. All three fields are mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: serde_json::Map<String, Value>,
}

/// Request-level error codes carried in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "E_BAD_METHOD")]
    BadMethod,
    #[serde(rename = "E_BAD_HWND")]
    BadHwnd,
    #[serde(rename = "E_BAD_SNAPSHOT")]
    BadSnapshot,
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "E_ACCESS_DENIED")]
    AccessDenied,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_READ_FAILED")]
    ReadFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub duration_ms: u64,
}

/// The response envelope written back for every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
            metrics: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, duration_ms: u64) -> Self {
        self.metrics = Some(Metrics { duration_ms });
        self
    }
}

// ── Handshake frames ───────────────────────────────────────────────

/// Server greeting. `nonce` is present only when keys are configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "hello")]
pub struct Hello {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Client reply to a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReply {
    pub version: String,
    pub identity: String,
    pub signature: String,
}

/// Server confirmation after a verified challenge reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "auth_status")]
pub struct AuthStatus {
    pub ok: bool,
}

// ── Canonical serialization ────────────────────────────────────────

/// Serialize a JSON value deterministically: object keys in byte-wise
/// ascending order recursively, numbers in their shortest decimal form,
/// literals for booleans and null. Both sides of the protocol use this
/// writer, so canonical output is byte-identical across peers.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
    }
}

fn write_escaped(out: &mut String, s: &str) {
    use std::fmt::Write;

    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Serialize a response, canonically when the request asked for it.
pub fn serialize_response(resp: &Response, canonical: bool) -> Result<String, serde_json::Error> {
    if canonical {
        Ok(to_canonical_string(&serde_json::to_value(resp)?))
    } else {
        serde_json::to_string(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"id\":\"1\"}").await.unwrap();
        assert_eq!(&buf[..4], &10u32.to_le_bytes());

        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap();
        assert_eq!(payload, b"{\"id\":\"1\"}");
    }

    #[tokio::test]
    async fn frame_rejects_zero_length() {
        let mut cursor = Cursor::new(0u32.to_le_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::ZeroLength)
        ));
    }

    #[tokio::test]
    async fn frame_rejects_oversize() {
        let len = MAX_FRAME_LEN + 1;
        let mut cursor = Cursor::new(len.to_le_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::TooLarge(n)) if n == len
        ));
    }

    #[tokio::test]
    async fn frame_fails_on_short_stream() {
        let mut data = 100u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"short");
        let mut cursor = Cursor::new(data);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Io(_))
        ));
    }

    #[test]
    fn error_codes_use_wire_names() {
        let resp = Response::failure("7", ErrorCode::BadSnapshot, "unknown or evicted snapshot_id");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"]["code"], "E_BAD_SNAPSHOT");
        assert_eq!(v["ok"], false);
        assert!(v.get("result").is_none());
    }

    #[test]
    fn hello_frame_shape() {
        let hello = Hello {
            version: PROTOCOL_VERSION.to_string(),
            nonce: None,
        };
        let v = serde_json::to_value(&hello).unwrap();
        assert_eq!(v, json!({"type": "hello", "version": "1.0.0"}));

        let with_nonce = Hello {
            version: PROTOCOL_VERSION.to_string(),
            nonce: Some("abc".to_string()),
        };
        let v = serde_json::to_value(&with_nonce).unwrap();
        assert_eq!(v["nonce"], "abc");
    }

    #[test]
    fn canonical_sorts_keys_recursively() {
        let v = json!({"b": {"z": 1, "a": [true, null]}, "a": 2});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":2,"b":{"a":[true,null],"z":1}}"#
        );
    }

    #[test]
    fn canonical_numbers_are_shortest_form() {
        let v = json!({"n": 1.5, "m": 10, "z": 0.25});
        assert_eq!(to_canonical_string(&v), r#"{"m":10,"n":1.5,"z":0.25}"#);
    }

    #[test]
    fn canonical_escapes_strings() {
        let v = json!({"s": "a\"b\\c\nd"});
        assert_eq!(to_canonical_string(&v), r#"{"s":"a\"b\\c\nd"}"#);
    }

    // Round-trip stability: canonical(parse(canonical(v))) == canonical(v).
    #[test]
    fn canonical_round_trip_is_stable() {
        let v = json!({
            "id": "42",
            "ok": true,
            "result": {"windows": [{"hwnd": "0xA", "visible": false}], "count": 1},
            "metrics": {"duration_ms": 3}
        });
        let once = to_canonical_string(&v);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(to_canonical_string(&reparsed), once);
    }
}
