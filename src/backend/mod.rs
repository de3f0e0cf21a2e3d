//! The OS-facing capability consumed by the dispatcher.
//!
//! The daemon core never touches the windowing system directly; every read
//! and mutation goes through the [`Backend`] trait. Real providers (Win32,
//! Wine extensions) live in platform crates; this crate ships the in-memory
//! [`FakeBackend`] used by tests and by the daemon binary on hosts without a
//! platform provider.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handle::WindowHandle;

mod fake;

pub use fake::{FakeBackend, FakeWindow};

/// A rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// An RGB color sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// A captured screen region, pixel data base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenCapture {
    pub width: i32,
    pub height: i32,
    pub data_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    pub last_modified: String,
}

/// A single registry value. `data` is UTF-8 for string types and a hex
/// string for binary data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryValue {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryKeyInfo {
    pub path: String,
    pub subkeys: Vec<String>,
    pub values: Vec<RegistryValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub display_name: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub address: u64,
    pub data_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMatchResult {
    pub x: i32,
    pub y: i32,
    pub confidence: f64,
}

/// Everything the daemon knows about one window at capture time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowInfo {
    pub hwnd: WindowHandle,
    pub parent: WindowHandle,
    pub owner: WindowHandle,
    pub class_name: String,
    pub title: String,
    pub window_rect: Rect,
    pub client_rect: Rect,
    pub pid: u32,
    pub tid: u32,
    #[serde(with = "hex_u64")]
    pub style: u64,
    #[serde(with = "hex_u64")]
    pub exstyle: u64,
    pub visible: bool,
    pub enabled: bool,
    pub iconic: bool,
    pub zoomed: bool,
    pub process_image: String,
}

/// One node of a window tree. Strict tree, owned recursive values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowNode {
    pub hwnd: WindowHandle,
    pub title: String,
    pub class_name: String,
    pub children: Vec<WindowNode>,
}

/// Options for `window.pickAtPoint`.
#[derive(Debug, Clone, Copy)]
pub struct PickFlags {
    pub prefer_child: bool,
    pub ignore_transparent: bool,
}

impl Default for PickFlags {
    fn default() -> Self {
        Self {
            prefer_child: true,
            ignore_transparent: true,
        }
    }
}

/// A UI Automation element. Depth is bounded by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiElement {
    pub automation_id: String,
    pub name: String,
    pub class_name: String,
    pub control_type: String,
    pub bounding_rect: Rect,
    pub enabled: bool,
    pub visible: bool,
    pub children: Vec<UiElement>,
}

/// The kind of a polled desktop event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "window.created")]
    WindowCreated,
    #[serde(rename = "window.destroyed")]
    WindowDestroyed,
    #[serde(rename = "window.changed")]
    WindowChanged,
}

/// A change observed between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub hwnd: WindowHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

/// Host environment description served by `daemon.status` and discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvMetadata {
    pub os: String,
    pub is_wine: bool,
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wine_version: Option<String>,
}

/// An immutable observation of the windowing state at a point in time.
///
/// The registry stores snapshots opaquely; `top` is the ordered list of
/// top-level handles and `windows` is whatever per-window detail the
/// backend chose to capture. Only the backend interprets `windows`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub top: Vec<WindowHandle>,
    pub windows: HashMap<u64, WindowInfo>,
}

/// The capability the dispatcher is polymorphic over.
///
/// Methods taking a [`Snapshot`] answer from the captured state; the rest
/// act on the live host. All calls run on blocking worker threads under the
/// dispatcher's watchdog, so implementations may block.
pub trait Backend: Send + Sync + 'static {
    fn capture_snapshot(&self) -> Snapshot;

    fn list_top(&self, snap: &Snapshot) -> Vec<WindowHandle>;
    fn list_children(&self, snap: &Snapshot, parent: WindowHandle) -> Vec<WindowHandle>;
    fn get_info(&self, snap: &Snapshot, hwnd: WindowHandle) -> Option<WindowInfo>;
    fn window_tree(&self, snap: &Snapshot, root: WindowHandle, max_depth: usize) -> Vec<WindowNode>;
    fn pick_at_point(&self, snap: &Snapshot, x: i32, y: i32, flags: PickFlags)
        -> Option<WindowHandle>;
    fn find_windows_regex(&self, title_regex: &str, class_regex: &str) -> Vec<WindowHandle>;

    // Desired-state actions; the returned bool is `changed`.
    fn ensure_visible(&self, hwnd: WindowHandle, visible: bool) -> bool;
    fn ensure_foreground(&self, hwnd: WindowHandle) -> bool;
    fn highlight_window(&self, hwnd: WindowHandle) -> bool;
    fn set_window_property(&self, hwnd: WindowHandle, name: &str, value: &str) -> bool;

    // Injection; the returned bool is `sent`.
    fn post_message(&self, hwnd: WindowHandle, msg: u32, wparam: u64, lparam: u64) -> bool;
    fn send_input(&self, raw: &[u8]) -> bool;
    fn send_mouse_click(&self, x: i32, y: i32, button: u8) -> bool;
    fn send_key_press(&self, vk: u32) -> bool;
    fn send_text(&self, text: &str) -> bool;
    fn input_hook(&self, enabled: bool) -> bool;
    fn control_click(&self, hwnd: WindowHandle, x: i32, y: i32, button: u8) -> bool;
    fn control_send(&self, hwnd: WindowHandle, text: &str) -> bool;

    // Visuals.
    fn get_pixel(&self, x: i32, y: i32) -> Option<Color>;
    fn capture_screen(&self, region: Rect) -> Option<ScreenCapture>;
    fn pixel_search(&self, region: Rect, target: Color, variation: u8) -> Option<(i32, i32)>;
    fn image_match(&self, region: Rect, needle_bmp: &[u8]) -> Option<ImageMatchResult>;

    // Processes and files.
    fn list_processes(&self) -> Vec<ProcessInfo>;
    fn kill_process(&self, pid: u32) -> bool;
    fn file_info(&self, path: &str) -> Option<FileInfo>;
    fn read_file(&self, path: &str) -> Option<String>;

    // Registry.
    fn reg_read(&self, path: &str) -> Option<RegistryKeyInfo>;
    fn reg_write(&self, path: &str, value: &RegistryValue) -> bool;
    fn reg_delete(&self, path: &str, value_name: &str) -> bool;

    // Clipboard.
    fn clipboard_read(&self) -> Option<String>;
    fn clipboard_write(&self, text: &str) -> bool;

    // Services.
    fn service_list(&self) -> Vec<ServiceInfo>;
    fn service_status(&self, name: &str) -> Option<String>;
    fn service_control(&self, name: &str, action: &str) -> bool;

    // Environment.
    fn env_all(&self) -> Vec<EnvVar>;
    fn env_set(&self, name: &str, value: &str) -> bool;

    // Synchronization objects.
    fn check_mutex(&self, name: &str) -> bool;
    fn create_mutex(&self, name: &str, own: bool) -> bool;

    // Process memory.
    fn mem_read(&self, pid: u32, address: u64, size: usize) -> Option<MemoryRegion>;
    fn mem_write(&self, pid: u32, address: u64, data: &[u8]) -> bool;

    // UI Automation.
    fn inspect_ui(&self, parent: WindowHandle) -> Vec<UiElement>;
    fn invoke_ui(&self, hwnd: WindowHandle, automation_id: &str) -> bool;

    fn env_metadata(&self) -> EnvMetadata;

    /// Diff two snapshots. `wait` bounds any internal polling the backend
    /// does before answering; implementations may ignore it.
    fn poll_events(&self, old: &Snapshot, new: &Snapshot, wait: Duration) -> Vec<Event>;
}

/// Serde helper for u64 fields carried as `"0x"` hex strings (window styles).
mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("0x{v:X}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| serde::de::Error::custom("expected 0x-prefixed hex"))?;
        u64::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_info_styles_serialize_as_hex() {
        let info = WindowInfo {
            hwnd: WindowHandle(1),
            parent: WindowHandle::NONE,
            owner: WindowHandle::NONE,
            class_name: "Edit".into(),
            title: "Untitled".into(),
            window_rect: Rect::default(),
            client_rect: Rect::default(),
            pid: 100,
            tid: 200,
            style: 0x94000000,
            exstyle: 0x8,
            visible: true,
            enabled: true,
            iconic: false,
            zoomed: false,
            process_image: "notepad.exe".into(),
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["style"], "0x94000000");
        assert_eq!(v["exstyle"], "0x8");
        assert_eq!(v["hwnd"], "0x1");

        let back: WindowInfo = serde_json::from_value(v).unwrap();
        assert_eq!(back.style, 0x94000000);
    }

    #[test]
    fn event_kind_wire_names() {
        let e = Event {
            kind: EventKind::WindowCreated,
            hwnd: WindowHandle(5),
            property: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "window.created");
        assert_eq!(v["hwnd"], "0x5");
        assert!(v.get("property").is_none());
    }
}
