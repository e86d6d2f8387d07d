//! Mock input backends for testing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dinput_types::codes::{
    ABS_MT_POSITION_X, ABS_MT_POSITION_Y, ABS_MT_SLOT, ABS_X, ABS_Y, BTN_LEFT, BTN_MIDDLE,
    BTN_RIGHT, BTN_TOOL_FINGER, BTN_TOUCH, BUS_USB, EV_ABS, EV_KEY, EV_REL, EV_SYN, KEY_A,
    KEY_DELETE, KEY_LEFTALT, KEY_LEFTCTRL, KEY_LEFTSHIFT, REL_WHEEL, REL_X, REL_Y,
};
use dinput_types::{AbsAxisInfo, Capabilities};

use crate::backend::{
    DeviceIdentifiers, DeviceNode, InputBackend, Interest, KernelEvent, NodeChange, NodeWatcher,
    PollSource, ReadyEvent, Readiness, ENODEV,
};
use crate::virtual_device::{UinputBackend, UinputNode, VirtualDeviceSetup};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

/// Description of a fake device node.
#[derive(Debug, Clone, Default)]
pub struct MockDeviceSpec {
    pub name: String,
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub physical_path: String,
    pub unique_id: String,
    pub capabilities: Capabilities,
    /// Keys the kernel reports as currently held.
    pub held_keys: Vec<u16>,
    /// Number of key-state queries that fail before one succeeds.
    pub key_state_failures: u32,
    pub fail_identifiers: bool,
}

fn abs_info(code: u16, maximum: i32) -> AbsAxisInfo {
    AbsAxisInfo {
        code,
        maximum,
        ..AbsAxisInfo::default()
    }
}

impl MockDeviceSpec {
    fn base(name: &str, product: u16) -> Self {
        Self {
            name: name.to_string(),
            bus: BUS_USB,
            vendor: 0x1d6b,
            product,
            version: 1,
            physical_path: format!("usb-mock/input{product}"),
            ..Self::default()
        }
    }

    pub fn keyboard(name: &str) -> Self {
        Self {
            capabilities: Capabilities {
                event_types: vec![EV_SYN, EV_KEY],
                keys: vec![KEY_LEFTCTRL, KEY_A, KEY_LEFTSHIFT, KEY_LEFTALT, KEY_DELETE],
                ..Capabilities::default()
            },
            ..Self::base(name, 1)
        }
    }

    pub fn mouse(name: &str) -> Self {
        Self {
            capabilities: Capabilities {
                event_types: vec![EV_SYN, EV_KEY, EV_REL],
                keys: vec![BTN_LEFT, BTN_RIGHT, BTN_MIDDLE],
                rel_types: vec![REL_X, REL_Y, REL_WHEEL],
                ..Capabilities::default()
            },
            ..Self::base(name, 2)
        }
    }

    pub fn touchscreen_mt(name: &str) -> Self {
        Self {
            capabilities: Capabilities {
                event_types: vec![EV_SYN, EV_KEY, EV_ABS],
                keys: vec![BTN_TOUCH],
                abs_types: vec![ABS_X, ABS_Y, ABS_MT_SLOT, ABS_MT_POSITION_X, ABS_MT_POSITION_Y],
                abs_infos: vec![
                    abs_info(ABS_X, 1919),
                    abs_info(ABS_Y, 1079),
                    abs_info(ABS_MT_SLOT, 9),
                    abs_info(ABS_MT_POSITION_X, 1919),
                    abs_info(ABS_MT_POSITION_Y, 1079),
                ],
                ..Capabilities::default()
            },
            ..Self::base(name, 3)
        }
    }

    pub fn touchpad(name: &str) -> Self {
        Self {
            capabilities: Capabilities {
                event_types: vec![EV_SYN, EV_KEY, EV_ABS],
                keys: vec![BTN_LEFT, BTN_TOOL_FINGER, BTN_TOUCH],
                abs_types: vec![ABS_X, ABS_Y],
                abs_infos: vec![abs_info(ABS_X, 1200), abs_info(ABS_Y, 800)],
                ..Capabilities::default()
            },
            ..Self::base(name, 4)
        }
    }

    #[must_use]
    pub fn with_held_keys(mut self, keys: &[u16]) -> Self {
        self.held_keys = keys.to_vec();
        self
    }

    #[must_use]
    pub fn with_physical_path(mut self, path: &str) -> Self {
        self.physical_path = path.to_string();
        self
    }
}

#[derive(Debug)]
struct MockDevice {
    spec: MockDeviceSpec,
    queue: VecDeque<KernelEvent>,
    removed: bool,
    opens: usize,
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<PathBuf, MockDevice>,
    changes: Vec<NodeChange>,
    registered: HashMap<u64, Interest>,
    /// Registrations to report as hung up on the next wait.
    hangups: HashSet<u64>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockState>,
    wake: Condvar,
}

impl Shared {
    fn notify(&self, state: &mut MockState) {
        state.dirty = true;
        self.wake.notify_all();
    }
}

/// In-memory device directory with readiness and hot-plug notifications.
///
/// Clones share the same state, so tests keep one clone to drive devices
/// while the hub owns another.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device node.
    pub fn add_device(&self, path: impl Into<PathBuf>, spec: MockDeviceSpec) {
        let path = path.into();
        let mut state = lock(&self.shared.state);
        state.devices.insert(
            path.clone(),
            MockDevice {
                spec,
                queue: VecDeque::new(),
                removed: false,
                opens: 0,
            },
        );
        state.changes.push(NodeChange::Created(path));
        self.shared.notify(&mut state);
    }

    /// Unplug a device node. Open handles start failing with `ENODEV`.
    pub fn remove_device(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = lock(&self.shared.state);
        if let Some(device) = state.devices.get_mut(path) {
            device.removed = true;
            device.queue.clear();
        }
        state.changes.push(NodeChange::Removed(path.to_path_buf()));
        self.shared.notify(&mut state);
    }

    /// Queue events as if the kernel produced them.
    pub fn push_events(&self, path: impl AsRef<Path>, events: &[KernelEvent]) {
        let mut state = lock(&self.shared.state);
        if let Some(device) = state.devices.get_mut(path.as_ref()) {
            device.queue.extend(events.iter().copied());
        }
        self.shared.notify(&mut state);
    }

    /// Report a hang-up for a registration on the next readiness wait.
    ///
    /// Queued events stay readable, like a kernel fd that hangs up with
    /// data still buffered.
    pub fn hang_up(&self, token: u64) {
        let mut state = lock(&self.shared.state);
        state.hangups.insert(token);
        self.shared.notify(&mut state);
    }

    pub fn set_held_keys(&self, path: impl AsRef<Path>, keys: &[u16]) {
        let mut state = lock(&self.shared.state);
        if let Some(device) = state.devices.get_mut(path.as_ref()) {
            device.spec.held_keys = keys.to_vec();
        }
    }

    /// How many times a node has been opened.
    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        lock(&self.shared.state)
            .devices
            .get(path.as_ref())
            .map_or(0, |d| d.opens)
    }

    pub fn registered_tokens(&self) -> Vec<u64> {
        let mut tokens: Vec<u64> = lock(&self.shared.state)
            .registered
            .keys()
            .copied()
            .collect();
        tokens.sort_unstable();
        tokens
    }

    pub fn interest(&self, token: u64) -> Option<Interest> {
        lock(&self.shared.state).registered.get(&token).copied()
    }
}

impl InputBackend for MockBackend {
    fn list_nodes(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(lock(&self.shared.state)
            .devices
            .iter()
            .filter(|(path, d)| !d.removed && path.parent() == Some(dir))
            .map(|(path, _)| path.clone())
            .collect())
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn DeviceNode>> {
        let mut state = lock(&self.shared.state);
        match state.devices.get_mut(path) {
            Some(device) if !device.removed => {
                device.opens += 1;
                Ok(Box::new(MockNode {
                    path: path.to_path_buf(),
                    shared: Arc::clone(&self.shared),
                }))
            }
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn readiness(&self) -> io::Result<Box<dyn Readiness>> {
        Ok(Box::new(MockReadiness {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn watch(&self, _dir: &Path) -> io::Result<Box<dyn NodeWatcher>> {
        lock(&self.shared.state).changes.clear();
        Ok(Box::new(MockWatcher {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockNode {
    path: PathBuf,
    shared: Arc<Shared>,
}

impl MockNode {
    fn with_device<R>(&self, f: impl FnOnce(&mut MockDevice) -> io::Result<R>) -> io::Result<R> {
        let mut state = lock(&self.shared.state);
        match state.devices.get_mut(&self.path) {
            Some(device) if !device.removed => f(device),
            _ => Err(io::Error::from_raw_os_error(ENODEV)),
        }
    }

    fn spec(&self) -> Option<MockDeviceSpec> {
        self.with_device(|d| Ok(d.spec.clone())).ok()
    }
}

impl PollSource for MockNode {
    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

impl DeviceNode for MockNode {
    fn name(&self) -> Option<String> {
        self.spec().and_then(|s| non_empty(s.name))
    }

    fn identifiers(&self) -> io::Result<DeviceIdentifiers> {
        self.with_device(|d| {
            if d.spec.fail_identifiers {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            Ok(DeviceIdentifiers {
                bus: d.spec.bus,
                vendor: d.spec.vendor,
                product: d.spec.product,
                version: d.spec.version,
                driver_version: 0x01_00_01,
            })
        })
    }

    fn physical_path(&self) -> Option<String> {
        self.spec().and_then(|s| non_empty(s.physical_path))
    }

    fn unique_id(&self) -> Option<String> {
        self.spec().and_then(|s| non_empty(s.unique_id))
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        self.with_device(|d| Ok(d.spec.capabilities.clone()))
    }

    fn read_events(&mut self, out: &mut Vec<KernelEvent>, max: usize) -> io::Result<usize> {
        self.with_device(|d| {
            if d.queue.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let count = max.min(d.queue.len());
            out.extend(d.queue.drain(..count));
            Ok(count)
        })
    }

    fn key_state(&self) -> io::Result<Vec<u16>> {
        self.with_device(|d| {
            if d.spec.key_state_failures > 0 {
                d.spec.key_state_failures -= 1;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            Ok(d.spec.held_keys.clone())
        })
    }

    fn has_pending(&self) -> bool {
        self.with_device(|d| Ok(!d.queue.is_empty())).unwrap_or(false)
    }
}

/// Reports every readable registration, and any hung-up one, whenever the
/// backend changed.
struct MockReadiness {
    shared: Arc<Shared>,
}

impl Readiness for MockReadiness {
    fn register(
        &self,
        token: u64,
        _fd: Option<BorrowedFd<'_>>,
        interest: Interest,
    ) -> io::Result<()> {
        let mut state = lock(&self.shared.state);
        state.registered.insert(token, interest);
        self.shared.notify(&mut state);
        Ok(())
    }

    fn deregister(&self, token: u64, _fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        lock(&self.shared.state).registered.remove(&token);
        Ok(())
    }

    fn wait(&self, out: &mut Vec<ReadyEvent>, timeout: Duration) -> io::Result<usize> {
        let mut state = lock(&self.shared.state);
        if !state.dirty {
            state = self
                .shared
                .wake
                .wait_timeout(state, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if !state.dirty {
            return Ok(0);
        }
        state.dirty = false;
        let hangups = std::mem::take(&mut state.hangups);
        let mut ready: Vec<ReadyEvent> = state
            .registered
            .iter()
            .map(|(&token, &interest)| ReadyEvent {
                token,
                readable: interest == Interest::Readable,
                hangup: hangups.contains(&token),
            })
            .filter(|r| r.readable || r.hangup)
            .collect();
        ready.sort_unstable_by_key(|r| r.token);
        out.extend_from_slice(&ready);
        Ok(ready.len())
    }
}

struct MockWatcher {
    shared: Arc<Shared>,
}

impl PollSource for MockWatcher {
    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

impl NodeWatcher for MockWatcher {
    fn read_changes(&self) -> io::Result<Vec<NodeChange>> {
        Ok(std::mem::take(&mut lock(&self.shared.state).changes))
    }
}

// ---------------------------------------------------------------------------
// MockUinput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CreatedDevice {
    setup: VirtualDeviceSetup,
    written: Vec<KernelEvent>,
    destroyed: bool,
}

#[derive(Debug, Default)]
struct MockUinputState {
    created: Vec<CreatedDevice>,
    fail_next: bool,
}

/// Recording uinput backend.
#[derive(Debug, Default)]
pub struct MockUinput {
    state: Arc<Mutex<MockUinputState>>,
}

impl MockUinput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clonable handle for observing created devices from tests.
    pub fn handle(&self) -> MockUinputHandle {
        MockUinputHandle {
            state: Arc::clone(&self.state),
        }
    }
}

/// Clonable observer handle for `MockUinput`.
#[derive(Debug, Clone)]
pub struct MockUinputHandle {
    state: Arc<Mutex<MockUinputState>>,
}

impl MockUinputHandle {
    /// Setups of every device created so far, in creation order.
    pub fn created(&self) -> Vec<VirtualDeviceSetup> {
        lock(&self.state)
            .created
            .iter()
            .map(|c| c.setup.clone())
            .collect()
    }

    /// Events written to the `index`-th created device.
    pub fn written(&self, index: usize) -> Vec<KernelEvent> {
        lock(&self.state)
            .created
            .get(index)
            .map(|c| c.written.clone())
            .unwrap_or_default()
    }

    pub fn is_destroyed(&self, index: usize) -> bool {
        lock(&self.state)
            .created
            .get(index)
            .is_some_and(|c| c.destroyed)
    }

    /// Make the next `create` call fail.
    pub fn fail_next_create(&self) {
        lock(&self.state).fail_next = true;
    }
}

impl UinputBackend for MockUinput {
    fn create(&self, setup: &VirtualDeviceSetup) -> io::Result<Box<dyn UinputNode>> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        state.created.push(CreatedDevice {
            setup: setup.clone(),
            written: Vec::new(),
            destroyed: false,
        });
        Ok(Box::new(MockUinputNode {
            index: state.created.len() - 1,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockUinputNode {
    index: usize,
    state: Arc<Mutex<MockUinputState>>,
}

impl UinputNode for MockUinputNode {
    fn write_event(&mut self, event: KernelEvent) -> io::Result<()> {
        let mut state = lock(&self.state);
        let device = state
            .created
            .get_mut(self.index)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        device.written.push(event);
        Ok(())
    }

    fn sys_name(&self) -> Option<String> {
        Some(format!("input{}", 100 + self.index))
    }

    fn dev_node(&self) -> Option<PathBuf> {
        Some(PathBuf::from(format!("/dev/input/event{}", 100 + self.index)))
    }
}

impl Drop for MockUinputNode {
    fn drop(&mut self) {
        if let Some(device) = lock(&self.state).created.get_mut(self.index) {
            device.destroyed = true;
        }
    }
}
