//! Request dispatcher.
//!
//! Stateless per-request routine: binds a parsed request to a snapshot and
//! session context, applies the read-only gate, and routes the method to
//! the backend under a watchdog. The dispatcher knows the request/response
//! schema of every method but not how the backend computes it.
//!
//! Locking discipline: registry and session locks are never held across a
//! backend call; pins are the only way a snapshot reference leaves the
//! registry critical section.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use crate::backend::{Backend, PickFlags, Rect, RegistryValue, Snapshot};
use crate::handle::WindowHandle;
use crate::protocol::{self, ErrorCode, Request, Response, PROTOCOL_VERSION};
use crate::state::ServerState;

/// Default depth bound for recursive window trees.
const DEFAULT_TREE_DEPTH: usize = 10;

/// Default tail length for `daemon.logs`.
const DEFAULT_LOG_COUNT: usize = 100;

/// Per-connection session state. Mirrors the persistent record when the
/// client supplies a `session_id`; purely ephemeral otherwise.
#[derive(Debug, Clone, Default)]
pub struct ConnSession {
    pub id: Option<String>,
    pub last_snapshot_id: Option<String>,
    pub subscribed: bool,
}

type RouteError = (ErrorCode, String);
type RouteResult = Result<Value, RouteError>;

fn bad_request(message: impl Into<String>) -> RouteError {
    (ErrorCode::BadRequest, message.into())
}

/// Handle one framed request payload and serialize the response.
///
/// Never fails for request-level problems; those become error envelopes.
/// The only error case is response serialization itself, which is
/// connection-fatal.
pub async fn dispatch(
    state: &Arc<ServerState>,
    backend: &Arc<dyn Backend>,
    session: &mut ConnSession,
    raw: &[u8],
) -> Result<String, serde_json::Error> {
    let started = Instant::now();
    let (response, canonical) = dispatch_inner(state, backend, session, raw).await;
    let response = response.with_metrics(started.elapsed().as_millis() as u64);
    protocol::serialize_response(&response, canonical)
}

async fn dispatch_inner(
    state: &Arc<ServerState>,
    backend: &Arc<dyn Backend>,
    session: &mut ConnSession,
    raw: &[u8],
) -> (Response, bool) {
    let req: Request = match serde_json::from_slice(raw) {
        Ok(req) => req,
        Err(e) => {
            return (
                Response::failure("", ErrorCode::BadRequest, e.to_string()),
                false,
            )
        }
    };
    let canonical = req
        .params
        .get("canonical")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    // Bind the persistent session, creating it on first reference. The
    // recorded baseline may have been evicted since the last request;
    // check it with a non-pinning read and drop a dead ID here rather
    // than chase it during events.poll.
    if let Some(sid) = req.params.get("session_id").and_then(Value::as_str) {
        let record = state.sessions.touch_or_create(sid);
        session.id = Some(sid.to_string());
        session.last_snapshot_id = record
            .last_snapshot_id
            .filter(|snap_id| state.registry.peek(snap_id).is_some());
        session.subscribed = record.subscribed;
    }

    (route_request(state, backend, session, req).await, canonical)
}

async fn route_request(
    state: &Arc<ServerState>,
    backend: &Arc<dyn Backend>,
    session: &mut ConnSession,
    req: Request,
) -> Response {
    let id = req.id.clone();

    if state.read_only && is_mutating(&req.method) {
        return Response::failure(
            id,
            ErrorCode::AccessDenied,
            "daemon is running in read-only mode",
        );
    }

    // Methods answered from daemon state alone, no backend involvement.
    match req.method.as_str() {
        "session.terminate" => {
            let Some(target) = session.id.clone() else {
                return Response::failure(id, ErrorCode::BadRequest, "missing session_id");
            };
            let terminated = state.sessions.terminate(&target);
            *session = ConnSession::default();
            return Response::success(id, json!({ "terminated": terminated }));
        }
        "events.subscribe" | "events.unsubscribe" => {
            let subscribed = req.method == "events.subscribe";
            session.subscribed = subscribed;
            if let Some(sid) = &session.id {
                state.sessions.set_subscribed(sid, subscribed);
            }
            return Response::success(id, json!({ "subscribed": subscribed }));
        }
        "daemon.status" => {
            return Response::success(
                id,
                json!({
                    "version": PROTOCOL_VERSION,
                    "uptime_ms": state.started_at.elapsed().as_millis() as u64,
                    "active_connections": state.active_connections.load(Ordering::Relaxed),
                    "snapshots": state.registry.len(),
                    "sessions": state.sessions.len(),
                    "read_only": state.read_only,
                }),
            );
        }
        "daemon.health" => return Response::success(id, json!({ "ok": true })),
        "daemon.logs" => {
            let count = req
                .params
                .get("count")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_LOG_COUNT);
            let entries = state.logs.tail(count);
            return match serde_json::to_value(entries) {
                Ok(entries) => Response::success(id, json!({ "entries": entries })),
                Err(e) => Response::failure(id, ErrorCode::BadRequest, e.to_string()),
            };
        }
        "snapshot.capture" => {
            let b = Arc::clone(backend);
            return match with_watchdog(state, move || b.capture_snapshot()).await {
                Ok(snapshot) => {
                    let snapshot_id = state.registry.insert(snapshot);
                    Response::success(id, json!({ "snapshot_id": snapshot_id }))
                }
                Err((code, message)) => Response::failure(id, code, message),
            };
        }
        _ => {}
    }

    // Resolve the working snapshot: pin the named one, or have the worker
    // capture a fresh one inside the watchdog window.
    let mut _pin_main = None;
    let pinned: Option<Arc<Snapshot>> =
        match req.params.get("snapshot_id").and_then(Value::as_str) {
            Some(sid) => match state.registry.pin(sid) {
                Some(guard) => {
                    let snapshot = guard.snapshot();
                    _pin_main = Some(guard);
                    Some(snapshot)
                }
                None => {
                    return Response::failure(
                        id,
                        ErrorCode::BadSnapshot,
                        "unknown or evicted snapshot_id",
                    )
                }
            },
            None => None,
        };

    // Resolve the comparison snapshot for events.poll: explicit parameter
    // first, then the session's recorded baseline.
    let mut _pin_old = None;
    let old: Option<Arc<Snapshot>> = if req.method == "events.poll" {
        let guard = req
            .params
            .get("old_snapshot_id")
            .and_then(Value::as_str)
            .and_then(|sid| state.registry.pin(sid))
            .or_else(|| {
                session
                    .last_snapshot_id
                    .as_deref()
                    .and_then(|sid| state.registry.pin(sid))
            });
        guard.map(|g| {
            let snapshot = g.snapshot();
            _pin_old = Some(g);
            snapshot
        })
    } else {
        None
    };

    let wait = req
        .params
        .get("wait_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
        .min(state.limits.max_wait);

    let outcome = {
        let b = Arc::clone(backend);
        let method = req.method.clone();
        let params = req.params.clone();
        with_watchdog(state, move || {
            let snapshot = match pinned {
                Some(snapshot) => snapshot,
                None => Arc::new(b.capture_snapshot()),
            };
            route_backend(&*b, &method, &params, &snapshot, old.as_deref(), wait)
        })
        .await
        .and_then(|route| route)
    };

    // A successful poll establishes a fresh baseline for the session.
    if req.method == "events.poll" && outcome.is_ok() {
        let b = Arc::clone(backend);
        if let Ok(fresh) = tokio::task::spawn_blocking(move || b.capture_snapshot()).await {
            let snapshot_id = state.registry.insert(fresh);
            session.last_snapshot_id = Some(snapshot_id.clone());
            if let Some(sid) = &session.id {
                state.sessions.update_last_snapshot(sid, &snapshot_id);
            }
        }
    }

    match outcome {
        Ok(result) => Response::success(id, result),
        Err((code, message)) => Response::failure(id, code, message),
    }
}

/// Run a backend call on a blocking worker, bounded by the configured
/// request timeout. On timeout the join handle is dropped: the worker is
/// left to finish and its result is discarded (at most one reply per
/// request; this is abandonment, not cancellation).
async fn with_watchdog<T: Send + 'static>(
    state: &ServerState,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, RouteError> {
    let worker = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(state.limits.request_timeout, worker).await {
        Err(_) => Err((
            ErrorCode::Timeout,
            "request timed out in backend".to_string(),
        )),
        Ok(Err(join_err)) => Err((
            ErrorCode::BadRequest,
            format!("backend worker failed: {join_err}"),
        )),
        Ok(Ok(value)) => Ok(value),
    }
}

/// Methods denied outright on a read-only daemon. Everything that mutates
/// the host: window state, input injection, registry, clipboard, services,
/// environment, process memory, UI invocation, process termination.
pub fn is_mutating(method: &str) -> bool {
    matches!(
        method,
        "window.ensureVisible"
            | "window.ensureForeground"
            | "window.highlight"
            | "window.setProperty"
            | "window.postMessage"
            | "window.controlClick"
            | "window.controlSend"
            | "input.send"
            | "input.mouseClick"
            | "input.keyPress"
            | "input.text"
            | "input.hook"
            | "process.kill"
            | "reg.write"
            | "reg.delete"
            | "clipboard.write"
            | "service.control"
            | "env.set"
            | "sync.createMutex"
            | "mem.write"
            | "ui.invoke"
    )
}

// ── Parameter extraction ───────────────────────────────────────────

fn get_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, RouteError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request(format!("missing {key}")))
}

fn opt_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn get_bool(params: &Map<String, Value>, key: &str) -> Result<bool, RouteError> {
    params
        .get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| bad_request(format!("missing {key}")))
}

fn opt_bool(params: &Map<String, Value>, key: &str) -> Option<bool> {
    params.get(key).and_then(Value::as_bool)
}

fn get_i32(params: &Map<String, Value>, key: &str) -> Result<i32, RouteError> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .map(|n| n as i32)
        .ok_or_else(|| bad_request(format!("missing {key}")))
}

fn get_u64(params: &Map<String, Value>, key: &str) -> Result<u64, RouteError> {
    match params.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| bad_request(format!("bad {key}"))),
        // Addresses may exceed JSON's exact integer range; accept hex.
        Some(Value::String(s)) => {
            let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"));
            match hex {
                Some(hex) => u64::from_str_radix(hex, 16)
                    .map_err(|_| bad_request(format!("bad {key}"))),
                None => s.parse().map_err(|_| bad_request(format!("bad {key}"))),
            }
        }
        _ => Err(bad_request(format!("missing {key}"))),
    }
}

fn opt_u64(params: &Map<String, Value>, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn get_hwnd(params: &Map<String, Value>, key: &str) -> Result<WindowHandle, RouteError> {
    let raw = get_str(params, key)?;
    raw.parse()
        .map_err(|_| bad_request(format!("bad {key}: {raw:?}")))
}

fn get_rect(params: &Map<String, Value>) -> Result<Rect, RouteError> {
    Ok(Rect {
        left: get_i32(params, "left")?,
        top: get_i32(params, "top")?,
        right: get_i32(params, "right")?,
        bottom: get_i32(params, "bottom")?,
    })
}

fn to_value<T: serde::Serialize>(value: T) -> RouteResult {
    serde_json::to_value(value).map_err(|e| bad_request(e.to_string()))
}

fn hwnd_list(handles: Vec<WindowHandle>) -> RouteResult {
    Ok(Value::Array(
        handles
            .into_iter()
            .map(|h| json!({ "hwnd": h }))
            .collect(),
    ))
}

/// Route one method to the backend. Runs on a blocking worker under the
/// dispatcher's watchdog.
fn route_backend(
    backend: &dyn Backend,
    method: &str,
    params: &Map<String, Value>,
    snapshot: &Snapshot,
    old_snapshot: Option<&Snapshot>,
    wait: Duration,
) -> RouteResult {
    match method {
        // ── Windows ────────────────────────────────────────────────
        "window.listTop" => hwnd_list(backend.list_top(snapshot)),
        "window.listChildren" => {
            let parent = get_hwnd(params, "hwnd")?;
            hwnd_list(backend.list_children(snapshot, parent))
        }
        "window.getInfo" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            match backend.get_info(snapshot, hwnd) {
                Some(info) => to_value(info),
                None => Err((
                    ErrorCode::BadHwnd,
                    "not a valid window handle".to_string(),
                )),
            }
        }
        "window.getTree" => {
            let root = match opt_str(params, "hwnd") {
                Some(_) => get_hwnd(params, "hwnd")?,
                None => WindowHandle::NONE,
            };
            let depth = opt_u64(params, "max_depth")
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_TREE_DEPTH);
            to_value(backend.window_tree(snapshot, root, depth))
        }
        "window.pickAtPoint" => {
            let x = get_i32(params, "x")?;
            let y = get_i32(params, "y")?;
            let mut flags = PickFlags::default();
            if let Some(b) = opt_bool(params, "prefer_child") {
                flags.prefer_child = b;
            }
            if let Some(b) = opt_bool(params, "ignore_transparent") {
                flags.ignore_transparent = b;
            }
            match backend.pick_at_point(snapshot, x, y, flags) {
                Some(hwnd) => Ok(json!({ "hwnd": hwnd })),
                None => Err((ErrorCode::NotFound, "no window at point".to_string())),
            }
        }
        "window.findRegex" => {
            let title = opt_str(params, "title_regex").unwrap_or("");
            let class = opt_str(params, "class_regex").unwrap_or("");
            hwnd_list(backend.find_windows_regex(title, class))
        }
        "window.ensureVisible" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            let visible = get_bool(params, "visible")?;
            Ok(json!({ "changed": backend.ensure_visible(hwnd, visible) }))
        }
        "window.ensureForeground" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            Ok(json!({ "changed": backend.ensure_foreground(hwnd) }))
        }
        "window.highlight" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            Ok(json!({ "ok": backend.highlight_window(hwnd) }))
        }
        "window.setProperty" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            let name = get_str(params, "name")?;
            let value = get_str(params, "value")?;
            Ok(json!({ "ok": backend.set_window_property(hwnd, name, value) }))
        }
        "window.postMessage" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            let msg = get_u64(params, "msg")? as u32;
            let wparam = opt_u64(params, "wparam").unwrap_or(0);
            let lparam = opt_u64(params, "lparam").unwrap_or(0);
            Ok(json!({ "sent": backend.post_message(hwnd, msg, wparam, lparam) }))
        }
        "window.controlClick" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            let x = get_i32(params, "x")?;
            let y = get_i32(params, "y")?;
            let button = opt_u64(params, "button").unwrap_or(0) as u8;
            Ok(json!({ "sent": backend.control_click(hwnd, x, y, button) }))
        }
        "window.controlSend" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            let text = get_str(params, "text")?;
            Ok(json!({ "sent": backend.control_send(hwnd, text) }))
        }

        // ── Screen ─────────────────────────────────────────────────
        "screen.getPixel" => {
            let x = get_i32(params, "x")?;
            let y = get_i32(params, "y")?;
            match backend.get_pixel(x, y) {
                Some(color) => to_value(color),
                None => Err((ErrorCode::ReadFailed, "could not read pixel".to_string())),
            }
        }
        "screen.capture" => {
            let region = get_rect(params)?;
            match backend.capture_screen(region) {
                Some(capture) => to_value(capture),
                None => Err((ErrorCode::ReadFailed, "screen capture failed".to_string())),
            }
        }
        "screen.pixelSearch" => {
            let region = get_rect(params)?;
            let target = crate::backend::Color {
                r: get_u64(params, "r")? as u8,
                g: get_u64(params, "g")? as u8,
                b: get_u64(params, "b")? as u8,
            };
            let variation = opt_u64(params, "variation").unwrap_or(0) as u8;
            match backend.pixel_search(region, target, variation) {
                Some((x, y)) => Ok(json!({ "x": x, "y": y })),
                None => Err((ErrorCode::NotFound, "pixel not found".to_string())),
            }
        }
        "image.match" => {
            let region = get_rect(params)?;
            let needle = decode_b64(get_str(params, "image_b64")?)?;
            match backend.image_match(region, &needle) {
                Some(result) => to_value(result),
                None => Err((ErrorCode::NotFound, "image not found".to_string())),
            }
        }

        // ── Input injection ────────────────────────────────────────
        "input.send" => {
            let data = decode_b64(get_str(params, "data_b64")?)?;
            Ok(json!({ "sent": backend.send_input(&data) }))
        }
        "input.mouseClick" => {
            let x = get_i32(params, "x")?;
            let y = get_i32(params, "y")?;
            let button = opt_u64(params, "button").unwrap_or(0) as u8;
            Ok(json!({ "sent": backend.send_mouse_click(x, y, button) }))
        }
        "input.keyPress" => {
            let vk = get_u64(params, "vk")? as u32;
            Ok(json!({ "sent": backend.send_key_press(vk) }))
        }
        "input.text" => {
            let text = get_str(params, "text")?;
            Ok(json!({ "sent": backend.send_text(text) }))
        }
        "input.hook" => {
            let enabled = get_bool(params, "enabled")?;
            Ok(json!({ "ok": backend.input_hook(enabled) }))
        }

        // ── Processes and files ────────────────────────────────────
        "process.list" => to_value(backend.list_processes()),
        "process.kill" => {
            let pid = get_u64(params, "pid")? as u32;
            if backend.kill_process(pid) {
                Ok(json!({ "killed": true }))
            } else {
                Err((ErrorCode::NotFound, "no such process".to_string()))
            }
        }
        "file.getInfo" => {
            let path = get_str(params, "path")?;
            match backend.file_info(path) {
                Some(info) => to_value(info),
                None => Err((ErrorCode::NotFound, "no such file".to_string())),
            }
        }
        "file.read" => {
            let path = get_str(params, "path")?;
            match backend.read_file(path) {
                Some(content) => Ok(json!({ "content": content })),
                None => Err((ErrorCode::ReadFailed, "could not read file".to_string())),
            }
        }

        // ── Registry ───────────────────────────────────────────────
        "reg.read" => {
            let path = get_str(params, "path")?;
            match backend.reg_read(path) {
                Some(key) => to_value(key),
                None => Err((ErrorCode::NotFound, "no such registry key".to_string())),
            }
        }
        "reg.write" => {
            let path = get_str(params, "path")?;
            let value: RegistryValue = params
                .get("value")
                .cloned()
                .ok_or_else(|| bad_request("missing value"))
                .and_then(|v| serde_json::from_value(v).map_err(|e| bad_request(e.to_string())))?;
            Ok(json!({ "ok": backend.reg_write(path, &value) }))
        }
        "reg.delete" => {
            let path = get_str(params, "path")?;
            let value_name = opt_str(params, "value_name").unwrap_or("");
            if backend.reg_delete(path, value_name) {
                Ok(json!({ "ok": true }))
            } else {
                Err((ErrorCode::NotFound, "no such registry key or value".to_string()))
            }
        }

        // ── Clipboard ──────────────────────────────────────────────
        "clipboard.read" => match backend.clipboard_read() {
            Some(text) => Ok(json!({ "text": text })),
            None => Err((ErrorCode::ReadFailed, "clipboard unavailable".to_string())),
        },
        "clipboard.write" => {
            let text = get_str(params, "text")?;
            Ok(json!({ "ok": backend.clipboard_write(text) }))
        }

        // ── Services ───────────────────────────────────────────────
        "service.list" => to_value(backend.service_list()),
        "service.status" => {
            let name = get_str(params, "name")?;
            match backend.service_status(name) {
                Some(state) => Ok(json!({ "state": state })),
                None => Err((ErrorCode::NotFound, "no such service".to_string())),
            }
        }
        "service.control" => {
            let name = get_str(params, "name")?;
            let action = get_str(params, "action")?;
            if backend.service_control(name, action) {
                Ok(json!({ "ok": true }))
            } else {
                Err((ErrorCode::NotFound, "no such service or action".to_string()))
            }
        }

        // ── Environment ────────────────────────────────────────────
        "env.get" => match opt_str(params, "name") {
            Some(name) => backend
                .env_all()
                .into_iter()
                .find(|var| var.name == name)
                .map(|var| json!({ "name": var.name, "value": var.value }))
                .ok_or((ErrorCode::NotFound, "no such variable".to_string())),
            None => to_value(backend.env_all()),
        },
        "env.set" => {
            let name = get_str(params, "name")?;
            let value = get_str(params, "value")?;
            Ok(json!({ "ok": backend.env_set(name, value) }))
        }

        // ── Synchronization objects ────────────────────────────────
        "sync.checkMutex" => {
            let name = get_str(params, "name")?;
            Ok(json!({ "exists": backend.check_mutex(name) }))
        }
        "sync.createMutex" => {
            let name = get_str(params, "name")?;
            let own = opt_bool(params, "own").unwrap_or(false);
            Ok(json!({ "created": backend.create_mutex(name, own) }))
        }

        // ── Process memory ─────────────────────────────────────────
        "mem.read" => {
            let pid = get_u64(params, "pid")? as u32;
            let address = get_u64(params, "address")?;
            let size = get_u64(params, "size")? as usize;
            match backend.mem_read(pid, address, size) {
                Some(region) => to_value(region),
                None => Err((ErrorCode::ReadFailed, "could not read memory".to_string())),
            }
        }
        "mem.write" => {
            let pid = get_u64(params, "pid")? as u32;
            let address = get_u64(params, "address")?;
            let data = decode_b64(get_str(params, "data_b64")?)?;
            if backend.mem_write(pid, address, &data) {
                Ok(json!({ "ok": true }))
            } else {
                Err((ErrorCode::NotFound, "no such process".to_string()))
            }
        }

        // ── UI Automation ──────────────────────────────────────────
        "ui.inspect" => {
            let parent = get_hwnd(params, "hwnd")?;
            to_value(backend.inspect_ui(parent))
        }
        "ui.invoke" => {
            let hwnd = get_hwnd(params, "hwnd")?;
            let automation_id = get_str(params, "automation_id")?;
            if backend.invoke_ui(hwnd, automation_id) {
                Ok(json!({ "ok": true }))
            } else {
                Err((ErrorCode::NotFound, "no such element".to_string()))
            }
        }

        // ── Events ─────────────────────────────────────────────────
        "events.poll" => match old_snapshot {
            Some(old) => to_value(backend.poll_events(old, snapshot, wait)),
            // First poll on a session: nothing to diff against yet; the
            // dispatcher records this capture as the new baseline.
            None => Ok(json!([])),
        },

        _ => Err((ErrorCode::BadMethod, format!("unknown method: {method}"))),
    }
}

fn decode_b64(input: &str) -> Result<Vec<u8>, RouteError> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    BASE64
        .decode(input)
        .map_err(|e| bad_request(format!("bad base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeBackend, FakeWindow};
    use crate::state::Limits;

    fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState::new(Limits::default(), false, 1985))
    }

    fn seeded_backend() -> Arc<dyn Backend> {
        Arc::new(FakeBackend::new(vec![
            FakeWindow::top_level(0x1, "A", true),
            FakeWindow::top_level(0x2, "B", false),
        ]))
    }

    async fn call(
        state: &Arc<ServerState>,
        backend: &Arc<dyn Backend>,
        session: &mut ConnSession,
        body: Value,
    ) -> Value {
        let raw = serde_json::to_vec(&body).unwrap();
        let out = dispatch(state, backend, session, &raw).await.unwrap();
        serde_json::from_str(&out).unwrap()
    }

    #[tokio::test]
    async fn malformed_json_is_a_request_level_error() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();
        let out = dispatch(&state, &backend, &mut session, b"{nope")
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "E_BAD_REQUEST");
        assert_eq!(v["id"], "");
    }

    #[tokio::test]
    async fn unknown_method_maps_to_bad_method() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();
        let v = call(
            &state,
            &backend,
            &mut session,
            json!({"id": "1", "method": "nope.nothing", "params": {}}),
        )
        .await;
        assert_eq!(v["error"]["code"], "E_BAD_METHOD");
    }

    #[tokio::test]
    async fn capture_then_list_top_against_the_snapshot() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();

        let v = call(
            &state,
            &backend,
            &mut session,
            json!({"id": "1", "method": "snapshot.capture", "params": {}}),
        )
        .await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["result"]["snapshot_id"], "s-1");

        let v = call(
            &state,
            &backend,
            &mut session,
            json!({"id": "2", "method": "window.listTop", "params": {"snapshot_id": "s-1"}}),
        )
        .await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["result"][0]["hwnd"], "0x1");
        assert_eq!(v["result"][1]["hwnd"], "0x2");
        assert!(v["metrics"]["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn unknown_snapshot_is_bad_snapshot() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();
        let v = call(
            &state,
            &backend,
            &mut session,
            json!({"id": "1", "method": "window.listTop", "params": {"snapshot_id": "s-404"}}),
        )
        .await;
        assert_eq!(v["error"]["code"], "E_BAD_SNAPSHOT");
    }

    #[tokio::test]
    async fn bad_hwnd_string_is_bad_request() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();
        let v = call(
            &state,
            &backend,
            &mut session,
            json!({"id": "1", "method": "window.getInfo", "params": {"hwnd": "banana"}}),
        )
        .await;
        assert_eq!(v["error"]["code"], "E_BAD_REQUEST");
    }

    #[tokio::test]
    async fn unknown_window_is_bad_hwnd() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();
        let v = call(
            &state,
            &backend,
            &mut session,
            json!({"id": "1", "method": "window.getInfo", "params": {"hwnd": "0xFFFF"}}),
        )
        .await;
        assert_eq!(v["error"]["code"], "E_BAD_HWND");
    }

    #[tokio::test]
    async fn canonical_flag_sorts_response_keys() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();
        let body = json!({"id": "1", "method": "daemon.health", "params": {"canonical": true}});
        let raw = serde_json::to_vec(&body).unwrap();
        let out = dispatch(&state, &backend, &mut session, &raw).await.unwrap();
        let reparsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(out, protocol::to_canonical_string(&reparsed));
    }

    #[tokio::test]
    async fn session_terminate_without_session_is_bad_request() {
        let state = test_state();
        let backend = seeded_backend();
        let mut session = ConnSession::default();
        let v = call(
            &state,
            &backend,
            &mut session,
            json!({"id": "1", "method": "session.terminate", "params": {}}),
        )
        .await;
        assert_eq!(v["error"]["code"], "E_BAD_REQUEST");
    }

    #[test]
    fn mutating_set_covers_the_write_surface() {
        for method in [
            "window.postMessage",
            "input.send",
            "reg.write",
            "reg.delete",
            "mem.write",
            "clipboard.write",
            "service.control",
            "env.set",
            "ui.invoke",
            "process.kill",
            "window.setProperty",
        ] {
            assert!(is_mutating(method), "{method} must be gated");
        }
        for method in ["window.listTop", "events.poll", "session.terminate", "daemon.status"] {
            assert!(!is_mutating(method), "{method} must not be gated");
        }
    }
}
