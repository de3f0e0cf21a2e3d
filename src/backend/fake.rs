//! In-memory backend over a seeded fake desktop.
//!
//! Used by the test suite and by the daemon binary on hosts without a
//! platform provider. Mutations act on a single world guarded by a mutex;
//! snapshots copy the world so reads against an old snapshot stay
//! point-in-time consistent. Every mutating call is appended to an action
//! log that tests can inspect.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use regex::Regex;

use super::{
    Backend, Color, EnvMetadata, EnvVar, Event, EventKind, FileInfo, ImageMatchResult,
    MemoryRegion, PickFlags, ProcessInfo, Rect, RegistryKeyInfo, RegistryValue, ScreenCapture,
    ServiceInfo, Snapshot, UiElement, WindowInfo, WindowNode,
};
use crate::handle::WindowHandle;

/// Seed description of one fake window.
#[derive(Debug, Clone)]
pub struct FakeWindow {
    pub hwnd: u64,
    pub parent: u64,
    pub owner: u64,
    pub class_name: String,
    pub title: String,
    pub visible: bool,
}

impl FakeWindow {
    pub fn top_level(hwnd: u64, title: &str, visible: bool) -> Self {
        Self {
            hwnd,
            parent: 0,
            owner: 0,
            class_name: "FakeWindow".to_string(),
            title: title.to_string(),
            visible,
        }
    }
}

#[derive(Default)]
struct World {
    windows: BTreeMap<u64, FakeWindow>,
    foreground: u64,
    ui_elements: HashMap<u64, Vec<UiElement>>,
    actions: Vec<String>,
    clipboard: Option<String>,
    env: BTreeMap<String, String>,
    registry: BTreeMap<String, Vec<RegistryValue>>,
    services: BTreeMap<String, ServiceInfo>,
    mutexes: HashSet<String>,
    processes: Vec<ProcessInfo>,
    files: BTreeMap<String, String>,
    memory: HashMap<(u32, u64), Vec<u8>>,
    screen_color: Color,
    latency: Duration,
}

/// In-memory [`Backend`] implementation.
pub struct FakeBackend {
    world: Mutex<World>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FakeBackend {
    pub fn new(windows: Vec<FakeWindow>) -> Self {
        let mut world = World::default();
        for w in windows {
            world.windows.insert(w.hwnd, w);
        }
        Self {
            world: Mutex::new(world),
        }
    }

    // ── Test hooks ───────────────────────────────────────────────────

    /// Add a window to the live world (appears in the next snapshot).
    pub fn add_window(&self, w: FakeWindow) {
        self.world.lock().windows.insert(w.hwnd, w);
    }

    /// Remove a window from the live world.
    pub fn remove_window(&self, hwnd: u64) {
        self.world.lock().windows.remove(&hwnd);
    }

    /// Retitle a live window.
    pub fn set_title(&self, hwnd: u64, title: &str) {
        if let Some(w) = self.world.lock().windows.get_mut(&hwnd) {
            w.title = title.to_string();
        }
    }

    /// Artificial delay applied to snapshot reads, for watchdog tests.
    pub fn set_latency(&self, latency: Duration) {
        self.world.lock().latency = latency;
    }

    pub fn add_ui_element(&self, parent: u64, element: UiElement) {
        self.world
            .lock()
            .ui_elements
            .entry(parent)
            .or_default()
            .push(element);
    }

    pub fn add_process(&self, info: ProcessInfo) {
        self.world.lock().processes.push(info);
    }

    pub fn add_service(&self, info: ServiceInfo) {
        self.world.lock().services.insert(info.name.clone(), info);
    }

    pub fn add_file(&self, path: &str, content: &str) {
        self.world
            .lock()
            .files
            .insert(path.to_string(), content.to_string());
    }

    pub fn set_env_var(&self, name: &str, value: &str) {
        self.world
            .lock()
            .env
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_screen_color(&self, color: Color) {
        self.world.lock().screen_color = color;
    }

    /// Every mutating call recorded so far, in order.
    pub fn recorded_actions(&self) -> Vec<String> {
        self.world.lock().actions.clone()
    }

    pub fn clear_recorded_actions(&self) {
        self.world.lock().actions.clear();
    }

    fn sleep_latency(&self) {
        let latency = self.world.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }

    fn record(&self, action: String) {
        self.world.lock().actions.push(action);
    }
}

fn window_info(w: &FakeWindow) -> WindowInfo {
    WindowInfo {
        hwnd: WindowHandle(w.hwnd),
        parent: WindowHandle(w.parent),
        owner: WindowHandle(w.owner),
        class_name: w.class_name.clone(),
        title: w.title.clone(),
        window_rect: Rect {
            left: 0,
            top: 0,
            right: 100,
            bottom: 100,
        },
        client_rect: Rect {
            left: 0,
            top: 0,
            right: 100,
            bottom: 100,
        },
        pid: 1234,
        tid: 5678,
        style: 0,
        exstyle: 0,
        visible: w.visible,
        enabled: true,
        iconic: false,
        zoomed: false,
        process_image: "fake.exe".to_string(),
    }
}

fn build_tree(snap: &Snapshot, root: WindowHandle, depth: usize) -> Vec<WindowNode> {
    if depth == 0 {
        return Vec::new();
    }
    let mut children: Vec<&WindowInfo> = snap
        .windows
        .values()
        .filter(|w| w.parent == root)
        .collect();
    children.sort_by_key(|w| w.hwnd);
    children
        .into_iter()
        .map(|w| WindowNode {
            hwnd: w.hwnd,
            title: w.title.clone(),
            class_name: w.class_name.clone(),
            children: build_tree(snap, w.hwnd, depth - 1),
        })
        .collect()
}

fn find_ui_element<'a>(elements: &'a [UiElement], automation_id: &str) -> Option<&'a UiElement> {
    for e in elements {
        if e.automation_id == automation_id {
            return Some(e);
        }
        if let Some(found) = find_ui_element(&e.children, automation_id) {
            return Some(found);
        }
    }
    None
}

impl Backend for FakeBackend {
    fn capture_snapshot(&self) -> Snapshot {
        self.sleep_latency();
        let world = self.world.lock();
        let mut top: Vec<WindowHandle> = world
            .windows
            .values()
            .filter(|w| w.parent == 0)
            .map(|w| WindowHandle(w.hwnd))
            .collect();
        top.sort();
        let windows = world
            .windows
            .values()
            .map(|w| (w.hwnd, window_info(w)))
            .collect();
        Snapshot { top, windows }
    }

    fn list_top(&self, snap: &Snapshot) -> Vec<WindowHandle> {
        snap.top.clone()
    }

    fn list_children(&self, snap: &Snapshot, parent: WindowHandle) -> Vec<WindowHandle> {
        let mut out: Vec<WindowHandle> = snap
            .windows
            .values()
            .filter(|w| w.parent == parent && !w.hwnd.is_none())
            .map(|w| w.hwnd)
            .collect();
        out.sort();
        out
    }

    fn get_info(&self, snap: &Snapshot, hwnd: WindowHandle) -> Option<WindowInfo> {
        self.sleep_latency();
        snap.windows.get(&hwnd.0).cloned()
    }

    fn window_tree(&self, snap: &Snapshot, root: WindowHandle, max_depth: usize) -> Vec<WindowNode> {
        build_tree(snap, root, max_depth)
    }

    fn pick_at_point(
        &self,
        snap: &Snapshot,
        _x: i32,
        _y: i32,
        _flags: PickFlags,
    ) -> Option<WindowHandle> {
        // Deterministic: the smallest top-level handle.
        snap.top.first().copied()
    }

    fn find_windows_regex(&self, title_regex: &str, class_regex: &str) -> Vec<WindowHandle> {
        let title_re = Regex::new(title_regex).ok();
        let class_re = Regex::new(class_regex).ok();
        let world = self.world.lock();
        world
            .windows
            .values()
            .filter(|w| {
                title_re.as_ref().map_or(true, |re| re.is_match(&w.title))
                    && class_re.as_ref().map_or(true, |re| re.is_match(&w.class_name))
            })
            .map(|w| WindowHandle(w.hwnd))
            .collect()
    }

    fn ensure_visible(&self, hwnd: WindowHandle, visible: bool) -> bool {
        self.record(format!("ensure_visible:{hwnd}:{visible}"));
        let mut world = self.world.lock();
        match world.windows.get_mut(&hwnd.0) {
            Some(w) => {
                let changed = w.visible != visible;
                w.visible = visible;
                changed
            }
            None => false,
        }
    }

    fn ensure_foreground(&self, hwnd: WindowHandle) -> bool {
        self.record(format!("ensure_foreground:{hwnd}"));
        let mut world = self.world.lock();
        let changed = world.foreground != hwnd.0;
        world.foreground = hwnd.0;
        changed
    }

    fn highlight_window(&self, hwnd: WindowHandle) -> bool {
        self.record(format!("highlight:{hwnd}"));
        self.world.lock().windows.contains_key(&hwnd.0)
    }

    fn set_window_property(&self, hwnd: WindowHandle, name: &str, value: &str) -> bool {
        self.record(format!("set_property:{hwnd}:{name}={value}"));
        let mut world = self.world.lock();
        match world.windows.get_mut(&hwnd.0) {
            Some(w) if name == "title" => {
                w.title = value.to_string();
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    fn post_message(&self, hwnd: WindowHandle, msg: u32, wparam: u64, lparam: u64) -> bool {
        self.record(format!("post_message:{hwnd}:{msg}:{wparam}:{lparam}"));
        true
    }

    fn send_input(&self, raw: &[u8]) -> bool {
        self.record(format!("send_input:{}", raw.len()));
        true
    }

    fn send_mouse_click(&self, x: i32, y: i32, button: u8) -> bool {
        self.record(format!("mouse_click:{x},{y},{button}"));
        true
    }

    fn send_key_press(&self, vk: u32) -> bool {
        self.record(format!("key_press:{vk}"));
        true
    }

    fn send_text(&self, text: &str) -> bool {
        self.record(format!("text:{text}"));
        true
    }

    fn input_hook(&self, enabled: bool) -> bool {
        self.record(format!("input_hook:{enabled}"));
        true
    }

    fn control_click(&self, hwnd: WindowHandle, x: i32, y: i32, button: u8) -> bool {
        self.record(format!("control_click:{hwnd}:{x},{y},{button}"));
        self.world.lock().windows.contains_key(&hwnd.0)
    }

    fn control_send(&self, hwnd: WindowHandle, text: &str) -> bool {
        self.record(format!("control_send:{hwnd}:{text}"));
        self.world.lock().windows.contains_key(&hwnd.0)
    }

    fn get_pixel(&self, _x: i32, _y: i32) -> Option<Color> {
        Some(self.world.lock().screen_color)
    }

    fn capture_screen(&self, region: Rect) -> Option<ScreenCapture> {
        let width = (region.right - region.left).max(0);
        let height = (region.bottom - region.top).max(0);
        let pixels = vec![0u8; (width * height) as usize * 3];
        Some(ScreenCapture {
            width,
            height,
            data_b64: BASE64.encode(pixels),
        })
    }

    fn pixel_search(&self, region: Rect, target: Color, variation: u8) -> Option<(i32, i32)> {
        let screen = self.world.lock().screen_color;
        let close = |a: u8, b: u8| a.abs_diff(b) <= variation;
        if close(screen.r, target.r) && close(screen.g, target.g) && close(screen.b, target.b) {
            Some((region.left, region.top))
        } else {
            None
        }
    }

    fn image_match(&self, _region: Rect, _needle_bmp: &[u8]) -> Option<ImageMatchResult> {
        None
    }

    fn list_processes(&self) -> Vec<ProcessInfo> {
        self.world.lock().processes.clone()
    }

    fn kill_process(&self, pid: u32) -> bool {
        self.record(format!("kill_process:{pid}"));
        let mut world = self.world.lock();
        let before = world.processes.len();
        world.processes.retain(|p| p.pid != pid);
        world.processes.len() != before
    }

    fn file_info(&self, path: &str) -> Option<FileInfo> {
        let world = self.world.lock();
        world.files.get(path).map(|content| FileInfo {
            path: path.to_string(),
            size: content.len() as u64,
            is_directory: false,
            last_modified: "1970-01-01T00:00:00Z".to_string(),
        })
    }

    fn read_file(&self, path: &str) -> Option<String> {
        self.world.lock().files.get(path).cloned()
    }

    fn reg_read(&self, path: &str) -> Option<RegistryKeyInfo> {
        let world = self.world.lock();
        world.registry.get(path).map(|values| RegistryKeyInfo {
            path: path.to_string(),
            subkeys: Vec::new(),
            values: values.clone(),
        })
    }

    fn reg_write(&self, path: &str, value: &RegistryValue) -> bool {
        self.record(format!("reg_write:{path}:{}", value.name));
        let mut world = self.world.lock();
        let values = world.registry.entry(path.to_string()).or_default();
        values.retain(|v| v.name != value.name);
        values.push(value.clone());
        true
    }

    fn reg_delete(&self, path: &str, value_name: &str) -> bool {
        self.record(format!("reg_delete:{path}:{value_name}"));
        let mut world = self.world.lock();
        if value_name.is_empty() {
            return world.registry.remove(path).is_some();
        }
        match world.registry.get_mut(path) {
            Some(values) => {
                let before = values.len();
                values.retain(|v| v.name != value_name);
                values.len() != before
            }
            None => false,
        }
    }

    fn clipboard_read(&self) -> Option<String> {
        self.world.lock().clipboard.clone()
    }

    fn clipboard_write(&self, text: &str) -> bool {
        self.record(format!("clipboard_write:{text}"));
        self.world.lock().clipboard = Some(text.to_string());
        true
    }

    fn service_list(&self) -> Vec<ServiceInfo> {
        self.world.lock().services.values().cloned().collect()
    }

    fn service_status(&self, name: &str) -> Option<String> {
        self.world
            .lock()
            .services
            .get(name)
            .map(|s| s.state.clone())
    }

    fn service_control(&self, name: &str, action: &str) -> bool {
        self.record(format!("service_control:{name}:{action}"));
        let mut world = self.world.lock();
        match world.services.get_mut(name) {
            Some(service) => {
                service.state = match action {
                    "start" => "RUNNING".to_string(),
                    "stop" => "STOPPED".to_string(),
                    _ => return false,
                };
                true
            }
            None => false,
        }
    }

    fn env_all(&self) -> Vec<EnvVar> {
        self.world
            .lock()
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect()
    }

    fn env_set(&self, name: &str, value: &str) -> bool {
        self.record(format!("env_set:{name}={value}"));
        self.world
            .lock()
            .env
            .insert(name.to_string(), value.to_string());
        true
    }

    fn check_mutex(&self, name: &str) -> bool {
        self.world.lock().mutexes.contains(name)
    }

    fn create_mutex(&self, name: &str, _own: bool) -> bool {
        self.record(format!("create_mutex:{name}"));
        self.world.lock().mutexes.insert(name.to_string())
    }

    fn mem_read(&self, pid: u32, address: u64, size: usize) -> Option<MemoryRegion> {
        let world = self.world.lock();
        if !world.processes.iter().any(|p| p.pid == pid) {
            return None;
        }
        let data = world
            .memory
            .get(&(pid, address))
            .cloned()
            .unwrap_or_else(|| vec![0u8; size]);
        Some(MemoryRegion {
            address,
            data_b64: BASE64.encode(data),
        })
    }

    fn mem_write(&self, pid: u32, address: u64, data: &[u8]) -> bool {
        self.record(format!("mem_write:{pid}:{address:#x}:{}", data.len()));
        let mut world = self.world.lock();
        if !world.processes.iter().any(|p| p.pid == pid) {
            return false;
        }
        world.memory.insert((pid, address), data.to_vec());
        true
    }

    fn inspect_ui(&self, parent: WindowHandle) -> Vec<UiElement> {
        self.world
            .lock()
            .ui_elements
            .get(&parent.0)
            .cloned()
            .unwrap_or_default()
    }

    fn invoke_ui(&self, hwnd: WindowHandle, automation_id: &str) -> bool {
        self.record(format!("invoke_ui:{hwnd}:{automation_id}"));
        let world = self.world.lock();
        world
            .ui_elements
            .get(&hwnd.0)
            .is_some_and(|elements| find_ui_element(elements, automation_id).is_some())
    }

    fn env_metadata(&self) -> EnvMetadata {
        EnvMetadata {
            os: "windows".to_string(),
            is_wine: true,
            arch: "x86_64".to_string(),
            wine_version: Some("9.0".to_string()),
        }
    }

    fn poll_events(&self, old: &Snapshot, new: &Snapshot, _wait: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        for &hwnd in &new.top {
            if !old.top.contains(&hwnd) {
                events.push(Event {
                    kind: EventKind::WindowCreated,
                    hwnd,
                    property: None,
                });
            }
        }
        for &hwnd in &old.top {
            if !new.top.contains(&hwnd) {
                events.push(Event {
                    kind: EventKind::WindowDestroyed,
                    hwnd,
                    property: None,
                });
            }
        }
        for &hwnd in &new.top {
            let (Some(before), Some(after)) = (old.windows.get(&hwnd.0), new.windows.get(&hwnd.0))
            else {
                continue;
            };
            if before.title != after.title {
                events.push(Event {
                    kind: EventKind::WindowChanged,
                    hwnd,
                    property: Some("title".to_string()),
                });
            }
            if before.visible != after.visible {
                events.push(Event {
                    kind: EventKind::WindowChanged,
                    hwnd,
                    property: Some("visible".to_string()),
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> FakeBackend {
        FakeBackend::new(vec![
            FakeWindow::top_level(0x1, "A", true),
            FakeWindow::top_level(0x2, "B", false),
            FakeWindow {
                hwnd: 0x10,
                parent: 0x1,
                owner: 0,
                class_name: "Child".into(),
                title: "child".into(),
                visible: true,
            },
        ])
    }

    #[test]
    fn snapshot_lists_top_levels_in_handle_order() {
        let backend = seeded();
        let snap = backend.capture_snapshot();
        assert_eq!(snap.top, vec![WindowHandle(1), WindowHandle(2)]);
        assert_eq!(snap.windows.len(), 3);
    }

    #[test]
    fn get_info_answers_from_the_snapshot_not_the_live_world() {
        let backend = seeded();
        let snap = backend.capture_snapshot();
        backend.set_title(0x1, "renamed");
        let info = backend.get_info(&snap, WindowHandle(1)).unwrap();
        assert_eq!(info.title, "A");
    }

    #[test]
    fn ensure_visible_reports_changed_once() {
        let backend = seeded();
        assert!(backend.ensure_visible(WindowHandle(2), true));
        assert!(!backend.ensure_visible(WindowHandle(2), true));
    }

    #[test]
    fn window_tree_is_depth_bounded() {
        let backend = seeded();
        let snap = backend.capture_snapshot();
        let tree = backend.window_tree(&snap, WindowHandle::NONE, 1);
        assert_eq!(tree.len(), 2);
        assert!(tree[0].children.is_empty(), "depth 1 stops above children");

        let tree = backend.window_tree(&snap, WindowHandle::NONE, 2);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].hwnd, WindowHandle(0x10));
    }

    #[test]
    fn poll_events_diffs_created_destroyed_changed() {
        let backend = seeded();
        let old = backend.capture_snapshot();
        backend.add_window(FakeWindow::top_level(0x5, "new", true));
        backend.remove_window(0x2);
        backend.set_title(0x1, "retitled");
        let new = backend.capture_snapshot();

        let events = backend.poll_events(&old, &new, Duration::ZERO);
        let kinds: Vec<_> = events.iter().map(|e| (e.kind, e.hwnd.0)).collect();
        assert!(kinds.contains(&(EventKind::WindowCreated, 0x5)));
        assert!(kinds.contains(&(EventKind::WindowDestroyed, 0x2)));
        assert!(kinds.contains(&(EventKind::WindowChanged, 0x1)));
    }

    #[test]
    fn mutations_are_recorded() {
        let backend = seeded();
        backend.send_text("hi");
        backend.kill_process(99);
        assert_eq!(
            backend.recorded_actions(),
            vec!["text:hi".to_string(), "kill_process:99".to_string()]
        );
    }

    #[test]
    fn registry_round_trip() {
        let backend = seeded();
        let value = RegistryValue {
            name: "Version".into(),
            kind: "SZ".into(),
            data: "1.0".into(),
        };
        assert!(backend.reg_write("HKCU\\Software\\Fake", &value));
        let key = backend.reg_read("HKCU\\Software\\Fake").unwrap();
        assert_eq!(key.values.len(), 1);
        assert!(backend.reg_delete("HKCU\\Software\\Fake", "Version"));
        let key = backend.reg_read("HKCU\\Software\\Fake").unwrap();
        assert!(key.values.is_empty());
        assert!(backend.reg_delete("HKCU\\Software\\Fake", ""));
        assert!(backend.reg_read("HKCU\\Software\\Fake").is_none());
    }
}
