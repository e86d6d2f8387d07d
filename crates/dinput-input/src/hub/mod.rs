//! The input hub: owns open devices and multiplexes their events.
//!
//! A hub runs in one of two modes fixed at construction. In
//! [`HubMode::EventCollection`] it drains raw events from every device; in
//! [`HubMode::PluginMonitor`] it only watches the device directory and
//! reports devices coming and going.

mod collect;
mod sharing;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dinput_types::{DeviceClass, InputDevice, InputDeviceEvent};
use tracing::{debug, info, warn};

use crate::backend::{
    InputBackend, Interest, NodeWatcher, ReadyEvent, Readiness, WATCHER_TOKEN,
};
use crate::device::{Device, DeviceTable};
use crate::enumerator::{query_device, TouchpadMatcher, VIRTUAL_DEVICE_NAME_MARKER};
use crate::error::InputError;
use crate::remap::TouchRemapper;
use crate::state::DInputState;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine-side hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub device_dir: PathBuf,
    /// Upper bound of one readiness wait.
    pub poll_timeout: Duration,
    /// Devices whose name contains this are our own virtual devices.
    pub virtual_device_marker: String,
    pub touchpad_patterns: Vec<String>,
    pub key_state_retries: u32,
    pub key_state_retry_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev/input"),
            poll_timeout: Duration::from_millis(100),
            virtual_device_marker: VIRTUAL_DEVICE_NAME_MARKER.to_string(),
            touchpad_patterns: vec!["touchpad".to_string()],
            key_state_retries: 5,
            key_state_retry_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubMode {
    EventCollection,
    PluginMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    /// Terminal; a stopped hub never runs again.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Requested,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorPhase {
    /// The first scan has not been reported yet.
    InitialScan,
    Watching,
}

pub struct InputHub {
    mode: HubMode,
    config: HubConfig,
    backend: Arc<dyn InputBackend>,
    state: Arc<DInputState>,
    remapper: TouchRemapper,
    touchpad: TouchpadMatcher,

    devices: Mutex<DeviceTable>,
    skip_paths: Mutex<HashSet<PathBuf>>,
    /// Serializes open+query so the same path is never opened twice.
    operation: Mutex<()>,

    readiness: Box<dyn Readiness>,
    watcher: Option<Box<dyn NodeWatcher>>,
    pending: Mutex<Vec<ReadyEvent>>,
    pending_index: AtomicUsize,
    pending_count: AtomicUsize,

    run_state: Mutex<RunState>,
    scan_state: Mutex<ScanState>,
    monitor_phase: Mutex<MonitorPhase>,
    device_events: Mutex<VecDeque<InputDeviceEvent>>,
    next_token: AtomicU64,
}

impl InputHub {
    pub fn new(
        mode: HubMode,
        config: HubConfig,
        backend: Arc<dyn InputBackend>,
        state: Arc<DInputState>,
        remapper: TouchRemapper,
    ) -> Result<Self, InputError> {
        let readiness = backend.readiness().map_err(InputError::Readiness)?;

        let watcher = match mode {
            HubMode::EventCollection => None,
            HubMode::PluginMonitor => {
                let watcher = backend
                    .watch(&config.device_dir)
                    .map_err(InputError::Watch)?;
                readiness
                    .register(WATCHER_TOKEN, watcher.poll_fd(), Interest::Readable)
                    .map_err(InputError::Watch)?;
                Some(watcher)
            }
        };

        info!(?mode, dir = %config.device_dir.display(), "input hub initialized");

        Ok(Self {
            mode,
            touchpad: TouchpadMatcher::new(&config.touchpad_patterns),
            config,
            backend,
            state,
            remapper,
            devices: Mutex::new(DeviceTable::new()),
            skip_paths: Mutex::new(HashSet::new()),
            operation: Mutex::new(()),
            readiness,
            watcher,
            pending: Mutex::new(Vec::new()),
            pending_index: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            run_state: Mutex::new(RunState::Idle),
            scan_state: Mutex::new(ScanState::Requested),
            monitor_phase: Mutex::new(MonitorPhase::InitialScan),
            device_events: Mutex::new(VecDeque::new()),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn mode(&self) -> HubMode {
        self.mode
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<DInputState> {
        &self.state
    }

    pub fn remapper(&self) -> &TouchRemapper {
        &self.remapper
    }

    // -- enumeration ------------------------------------------------------

    fn is_skipped(&self, path: &Path) -> bool {
        lock(&self.skip_paths).contains(path)
    }

    /// Open every new node under `dir`. Returns the devices added.
    pub fn scan_input_devices(&self, dir: &Path) -> Vec<InputDevice> {
        let paths = match self.backend.list_nodes(dir) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to list device directory");
                return Vec::new();
            }
        };

        let mut added = Vec::new();
        for path in paths {
            if self.is_skipped(&path) || lock(&self.devices).contains_path(&path) {
                continue;
            }
            match self.open_input_device_locked(&path) {
                Ok(device) => added.push(device),
                Err(e @ InputError::DeviceOpen { .. }) => {
                    warn!(path = %path.display(), error = %e, "failed to open device");
                }
                Err(e) => debug!(path = %path.display(), error = %e, "device not tracked"),
            }
        }
        added
    }

    /// Open, query, classify and register one device node.
    ///
    /// Virtual, unqueryable and unclassifiable nodes are remembered in the
    /// skip list. A node that merely fails to open is retried on the next
    /// scan.
    pub fn open_input_device_locked(&self, path: &Path) -> Result<InputDevice, InputError> {
        let _operation = lock(&self.operation);

        {
            let devices = lock(&self.devices);
            if let Some(device) = devices.token_for_path(path).and_then(|t| devices.get(t)) {
                return Ok(device.identity().clone());
            }
        }

        let node = self
            .backend
            .open(path)
            .map_err(|source| InputError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;

        let identity = match query_device(path, node.as_ref(), &self.config.virtual_device_marker)
        {
            Ok(identity) => identity,
            Err(e) => {
                if matches!(
                    e,
                    InputError::VirtualDevice { .. }
                        | InputError::DeviceQuery { .. }
                        | InputError::UnsupportedClass { .. }
                ) {
                    lock(&self.skip_paths).insert(path.to_path_buf());
                }
                return Err(e);
            }
        };

        let is_touchpad = identity
            .classes()
            .intersects(DeviceClass::Touch | DeviceClass::TouchMt | DeviceClass::Cursor)
            && self.touchpad.is_touchpad(&identity.name);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let interest = match self.mode {
            HubMode::EventCollection => Interest::Readable,
            HubMode::PluginMonitor => Interest::HangupOnly,
        };

        let mut devices = lock(&self.devices);
        devices.insert_opening(Device::new(
            token,
            path.to_path_buf(),
            identity.clone(),
            is_touchpad,
            node,
        ));
        let registered = devices
            .get(token)
            .and_then(Device::node)
            .map(|node| self.readiness.register(token, node.poll_fd(), interest));
        match registered {
            Some(Ok(())) => {
                devices.promote(token);
            }
            Some(Err(e)) => {
                devices.remove(token);
                return Err(InputError::Readiness(e));
            }
            None => {
                devices.remove(token);
                return Err(InputError::DeviceNotFound(path.display().to_string()));
            }
        }
        drop(devices);

        info!(
            path = %path.display(),
            name = %identity.name,
            descriptor = %identity.descriptor,
            classes = ?identity.classes(),
            is_touchpad,
            "opened device"
        );
        Ok(identity)
    }

    /// Run a pending directory scan, if one was requested.
    fn scan_and_record_input_devices(&self) -> Vec<InputDevice> {
        {
            let mut scan = lock(&self.scan_state);
            if *scan == ScanState::Done {
                return Vec::new();
            }
            *scan = ScanState::Done;
        }
        let dir = self.config.device_dir.clone();
        self.scan_input_devices(&dir)
    }

    /// Ask the collection loop to rescan the device directory.
    pub fn request_rescan(&self) {
        *lock(&self.scan_state) = ScanState::Requested;
    }

    // -- teardown ---------------------------------------------------------

    fn retire(&self, device: &mut Device) {
        self.state.release_device(device.descriptor());
        self.remapper.forget(&device.path_string());
        if let Some(node) = device.node() {
            if let Err(e) = self.readiness.deregister(device.token(), node.poll_fd()) {
                debug!(path = %device.path().display(), error = %e, "deregister failed");
            }
        }
        if device.close() {
            info!(
                path = %device.path().display(),
                descriptor = %device.descriptor(),
                "closed device"
            );
        }
    }

    /// Close devices marked during a drain.
    fn retire_closing(&self) -> usize {
        let closing = lock(&self.devices).take_closing();
        let count = closing.len();
        for mut device in closing {
            self.retire(&mut device);
        }
        count
    }

    pub fn close_device(&self, token: u64) -> Option<InputDevice> {
        let mut device = lock(&self.devices).remove(token)?;
        self.retire(&mut device);
        Some(device.identity().clone())
    }

    pub fn close_device_by_path(&self, path: &Path) -> Option<InputDevice> {
        let token = lock(&self.devices).token_for_path(path)?;
        self.close_device(token)
    }

    /// Close every device. Safe to call repeatedly.
    pub fn close_all_devices(&self) {
        let drained = lock(&self.devices).drain();
        if !drained.is_empty() {
            info!(count = drained.len(), "closing all devices");
        }
        for mut device in drained {
            self.retire(&mut device);
        }
        self.reset_pending();
    }

    // -- queries ----------------------------------------------------------

    pub fn get_all_input_devices(&self) -> Vec<InputDevice> {
        lock(&self.devices)
            .live()
            .map(|d| d.identity().clone())
            .collect()
    }

    pub fn device_count(&self) -> usize {
        lock(&self.devices).live().count()
    }

    pub fn get_skip_device_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = lock(&self.skip_paths).iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Forget every skipped path and rescan.
    pub fn clear_skip_device_paths(&self) {
        lock(&self.skip_paths).clear();
        self.request_rescan();
    }
}

impl Drop for InputHub {
    fn drop(&mut self) {
        self.close_all_devices();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockDeviceSpec};
    use crate::remap::ScreenRegistry;

    pub(super) fn hub(mode: HubMode, backend: &MockBackend) -> InputHub {
        InputHub::new(
            mode,
            HubConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(DInputState::new()),
            TouchRemapper::new(Arc::new(ScreenRegistry::new())),
        )
        .unwrap()
    }

    #[test]
    fn scan_classifies_multitouch_screen() {
        let backend = MockBackend::new();
        backend.add_device("/dev/input/event0", MockDeviceSpec::touchscreen_mt("Touch Panel"));
        let hub = hub(HubMode::EventCollection, &backend);

        let added = hub.scan_input_devices(Path::new("/dev/input"));
        assert_eq!(added.len(), 1);

        let all = hub.get_all_input_devices();
        assert_eq!(all.len(), 1);
        assert!(all[0].has_class(DeviceClass::TouchMt));
        assert!(all[0].has_class(DeviceClass::Touch));
    }

    #[test]
    fn virtual_devices_are_skipped_for_good() {
        let backend = MockBackend::new();
        backend.add_device(
            "/dev/input/event0",
            MockDeviceSpec::keyboard("DistributedInput Remote Keyboard"),
        );
        let hub = hub(HubMode::EventCollection, &backend);
        let err = hub
            .open_input_device_locked(Path::new("/dev/input/event0"))
            .unwrap_err();
        assert!(matches!(err, InputError::VirtualDevice { .. }));
        assert_eq!(hub.get_skip_device_paths(), vec![PathBuf::from("/dev/input/event0")]);

        assert!(hub.scan_input_devices(Path::new("/dev/input")).is_empty());
        assert_eq!(backend.open_count("/dev/input/event0"), 1);
    }

    #[test]
    fn identifier_failure_skips_path() {
        let backend = MockBackend::new();
        let spec = MockDeviceSpec {
            fail_identifiers: true,
            ..MockDeviceSpec::keyboard("Broken")
        };
        backend.add_device("/dev/input/event3", spec);
        let hub = hub(HubMode::EventCollection, &backend);
        assert!(hub.scan_input_devices(Path::new("/dev/input")).is_empty());
        assert_eq!(hub.get_skip_device_paths().len(), 1);

        hub.clear_skip_device_paths();
        assert!(hub.get_skip_device_paths().is_empty());
    }

    #[test]
    fn unclassified_devices_are_dropped() {
        let backend = MockBackend::new();
        let spec = MockDeviceSpec {
            name: "Power Button".to_string(),
            ..MockDeviceSpec::default()
        };
        backend.add_device("/dev/input/event1", spec);
        let hub = hub(HubMode::EventCollection, &backend);
        assert!(hub.scan_input_devices(Path::new("/dev/input")).is_empty());
        assert_eq!(hub.device_count(), 0);
    }

    #[test]
    fn open_twice_reuses_device() {
        let backend = MockBackend::new();
        backend.add_device("/dev/input/event0", MockDeviceSpec::keyboard("Keyboard"));
        let hub = hub(HubMode::EventCollection, &backend);
        let a = hub
            .open_input_device_locked(Path::new("/dev/input/event0"))
            .unwrap();
        let b = hub
            .open_input_device_locked(Path::new("/dev/input/event0"))
            .unwrap();
        assert_eq!(a.descriptor, b.descriptor);
        assert_eq!(backend.open_count("/dev/input/event0"), 1);
        assert_eq!(hub.device_count(), 1);
    }

    #[test]
    fn descriptor_survives_reopen() {
        let backend = MockBackend::new();
        backend.add_device("/dev/input/event0", MockDeviceSpec::mouse("Mouse"));
        let first = {
            let hub = hub(HubMode::EventCollection, &backend);
            hub.scan_input_devices(Path::new("/dev/input"))
        };
        let hub = hub(HubMode::EventCollection, &backend);
        let second = hub.scan_input_devices(Path::new("/dev/input"));
        assert_eq!(first[0].descriptor, second[0].descriptor);
    }

    #[test]
    fn close_all_is_idempotent() {
        let backend = MockBackend::new();
        backend.add_device("/dev/input/event0", MockDeviceSpec::keyboard("Keyboard"));
        backend.add_device("/dev/input/event1", MockDeviceSpec::mouse("Mouse"));
        let hub = hub(HubMode::EventCollection, &backend);
        hub.scan_input_devices(Path::new("/dev/input"));
        assert_eq!(backend.registered_tokens().len(), 2);

        hub.close_all_devices();
        assert_eq!(hub.device_count(), 0);
        assert!(backend.registered_tokens().is_empty());
        hub.close_all_devices();
        assert_eq!(hub.device_count(), 0);
    }

    #[test]
    fn touchpad_is_tagged_by_name() {
        let backend = MockBackend::new();
        backend.add_device(
            "/dev/input/event5",
            MockDeviceSpec::touchpad("SynPS/2 Synaptics TouchPad"),
        );
        let hub = hub(HubMode::EventCollection, &backend);
        hub.scan_input_devices(Path::new("/dev/input"));
        let devices = lock(&hub.devices);
        let device = devices.live().next().unwrap();
        assert!(device.is_touchpad());
        assert!(!device.is_touch_screen());
    }

    #[test]
    fn monitor_mode_registers_without_read_interest() {
        let backend = MockBackend::new();
        backend.add_device("/dev/input/event0", MockDeviceSpec::keyboard("Keyboard"));
        let hub = hub(HubMode::PluginMonitor, &backend);
        hub.scan_input_devices(Path::new("/dev/input"));
        assert_eq!(backend.interest(WATCHER_TOKEN), Some(Interest::Readable));
        assert_eq!(backend.interest(1), Some(Interest::HangupOnly));
    }
}
