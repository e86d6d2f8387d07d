//! Open devices and the table that tracks them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dinput_types::{DeviceClass, DeviceClasses, InputDevice, RawEvent};
use tracing::debug;

use crate::backend::DeviceNode;

/// An opened and classified input device.
///
/// The node is owned exclusively; [`Device::close`] releases it and can be
/// called any number of times.
pub struct Device {
    token: u64,
    path: PathBuf,
    identity: InputDevice,
    is_touchpad: bool,
    is_share: bool,
    /// Tail of a touch report whose sync has not been read yet.
    held_report: Vec<RawEvent>,
    node: Option<Box<dyn DeviceNode>>,
}

impl Device {
    pub fn new(
        token: u64,
        path: PathBuf,
        identity: InputDevice,
        is_touchpad: bool,
        node: Box<dyn DeviceNode>,
    ) -> Self {
        Self {
            token,
            path,
            identity,
            is_touchpad,
            is_share: false,
            held_report: Vec::new(),
            node: Some(node),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn identity(&self) -> &InputDevice {
        &self.identity
    }

    pub fn descriptor(&self) -> &str {
        &self.identity.descriptor
    }

    pub fn classes(&self) -> DeviceClasses {
        self.identity.classes()
    }

    pub fn has_class(&self, class: DeviceClass) -> bool {
        self.identity.has_class(class)
    }

    pub fn is_touchpad(&self) -> bool {
        self.is_touchpad
    }

    /// Touch stream whose coordinates need remapping before forwarding.
    pub fn is_touch_screen(&self) -> bool {
        !self.is_touchpad && self.classes().intersects(DeviceClass::Touch | DeviceClass::TouchMt)
    }

    pub fn is_share(&self) -> bool {
        self.is_share
    }

    pub fn set_share(&mut self, share: bool) {
        self.is_share = share;
    }

    pub fn held_report_len(&self) -> usize {
        self.held_report.len()
    }

    /// Prepend the held tail to `events`, then hold back whatever follows
    /// the last sync report. Returns the whole reports.
    pub fn complete_reports(&mut self, events: Vec<RawEvent>) -> Vec<RawEvent> {
        let mut reports = std::mem::take(&mut self.held_report);
        reports.extend(events);
        let whole = reports
            .iter()
            .rposition(RawEvent::is_sync_report)
            .map_or(0, |i| i + 1);
        self.held_report = reports.split_off(whole);
        reports
    }

    /// Drop the held tail. Returns how many events it had.
    pub fn discard_held_report(&mut self) -> usize {
        let count = self.held_report.len();
        self.held_report.clear();
        count
    }

    pub fn node(&self) -> Option<&dyn DeviceNode> {
        self.node.as_deref()
    }

    pub fn node_mut(&mut self) -> Option<&mut (dyn DeviceNode + 'static)> {
        self.node.as_deref_mut()
    }

    pub fn is_open(&self) -> bool {
        self.node.is_some()
    }

    /// Release the node. Returns whether it was still open.
    pub fn close(&mut self) -> bool {
        if self.node.take().is_some() {
            debug!(path = %self.path.display(), "closed device node");
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("token", &self.token)
            .field("path", &self.path)
            .field("descriptor", &self.identity.descriptor)
            .field("is_touchpad", &self.is_touchpad)
            .field("is_share", &self.is_share)
            .field("held_report", &self.held_report.len())
            .field("open", &self.node.is_some())
            .finish()
    }
}

/// Lifecycle stage of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Opened and classified, not yet registered for readiness.
    Opening,
    Live,
    /// Marked for retirement; removed by [`DeviceTable::take_closing`].
    Closing,
}

struct Entry {
    state: DeviceState,
    device: Device,
}

/// Devices keyed by readiness token, with a path index.
#[derive(Default)]
pub struct DeviceTable {
    entries: HashMap<u64, Entry>,
    by_path: HashMap<PathBuf, u64>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    /// Stage a freshly opened device.
    pub fn insert_opening(&mut self, device: Device) {
        self.by_path.insert(device.path.clone(), device.token);
        self.entries.insert(
            device.token,
            Entry {
                state: DeviceState::Opening,
                device,
            },
        );
    }

    /// Promote a staged device to live.
    pub fn promote(&mut self, token: u64) -> bool {
        match self.entries.get_mut(&token) {
            Some(entry) if entry.state == DeviceState::Opening => {
                entry.state = DeviceState::Live;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, token: u64) -> Option<DeviceState> {
        self.entries.get(&token).map(|e| e.state)
    }

    /// Remove an entry immediately, whatever its stage.
    pub fn remove(&mut self, token: u64) -> Option<Device> {
        let entry = self.entries.remove(&token)?;
        self.by_path.remove(&entry.device.path);
        Some(entry.device)
    }

    pub fn mark_closing(&mut self, token: u64) -> bool {
        match self.entries.get_mut(&token) {
            Some(entry) => {
                entry.state = DeviceState::Closing;
                true
            }
            None => false,
        }
    }

    /// Remove and return every entry marked for closing.
    pub fn take_closing(&mut self) -> Vec<Device> {
        let tokens: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == DeviceState::Closing)
            .map(|(t, _)| *t)
            .collect();
        tokens.into_iter().filter_map(|t| self.remove(t)).collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<Device> {
        self.by_path.clear();
        self.entries.drain().map(|(_, e)| e.device).collect()
    }

    pub fn token_for_path(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    pub fn get_live(&self, token: u64) -> Option<&Device> {
        self.entries
            .get(&token)
            .filter(|e| e.state == DeviceState::Live)
            .map(|e| &e.device)
    }

    pub fn get_live_mut(&mut self, token: u64) -> Option<&mut Device> {
        self.entries
            .get_mut(&token)
            .filter(|e| e.state == DeviceState::Live)
            .map(|e| &mut e.device)
    }

    /// Any entry regardless of stage.
    pub fn get(&self, token: u64) -> Option<&Device> {
        self.entries.get(&token).map(|e| &e.device)
    }

    pub fn live(&self) -> impl Iterator<Item = &Device> {
        self.entries
            .values()
            .filter(|e| e.state == DeviceState::Live)
            .map(|e| &e.device)
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.entries
            .values_mut()
            .filter(|e| e.state == DeviceState::Live)
            .map(|e| &mut e.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockDeviceSpec};
    use crate::InputBackend;

    fn device(backend: &MockBackend, token: u64, path: &str) -> Device {
        backend.add_device(path, MockDeviceSpec::keyboard("Test Keyboard"));
        let node = backend.open(Path::new(path)).unwrap();
        let identity = InputDevice {
            descriptor: format!("Input_{token}"),
            ..InputDevice::default()
        };
        Device::new(token, PathBuf::from(path), identity, false, node)
    }

    #[test]
    fn close_is_idempotent() {
        let backend = MockBackend::new();
        let mut dev = device(&backend, 1, "/dev/input/event1");
        assert!(dev.is_open());
        assert!(dev.close());
        assert!(!dev.close());
        assert!(!dev.is_open());
    }

    #[test]
    fn report_tail_is_held_until_sync() {
        use dinput_types::codes::{ABS_X, ABS_Y, EV_ABS, EV_SYN, SYN_REPORT};

        let backend = MockBackend::new();
        let mut dev = device(&backend, 1, "/dev/input/event1");
        let syn = RawEvent::new(EV_SYN, SYN_REPORT, 0);

        let whole = dev.complete_reports(vec![
            RawEvent::new(EV_ABS, ABS_X, 1),
            syn.clone(),
            RawEvent::new(EV_ABS, ABS_X, 2),
        ]);
        assert_eq!(whole.len(), 2);
        assert_eq!(dev.held_report_len(), 1);

        let whole = dev.complete_reports(vec![RawEvent::new(EV_ABS, ABS_Y, 3), syn]);
        let values: Vec<i32> = whole.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![2, 3, 0]);
        assert_eq!(dev.held_report_len(), 0);

        dev.complete_reports(vec![RawEvent::new(EV_ABS, ABS_X, 4)]);
        assert_eq!(dev.discard_held_report(), 1);
        assert_eq!(dev.held_report_len(), 0);
    }

    #[test]
    fn staged_devices_are_not_live() {
        let backend = MockBackend::new();
        let mut table = DeviceTable::new();
        table.insert_opening(device(&backend, 1, "/dev/input/event1"));
        assert!(table.contains_path(Path::new("/dev/input/event1")));
        assert!(table.get_live(1).is_none());
        assert_eq!(table.live().count(), 0);

        assert!(table.promote(1));
        assert!(!table.promote(1));
        assert!(table.get_live(1).is_some());
        assert_eq!(table.state(1), Some(DeviceState::Live));
    }

    #[test]
    fn closing_entries_are_retired_together() {
        let backend = MockBackend::new();
        let mut table = DeviceTable::new();
        for (token, path) in [(1, "/dev/input/event1"), (2, "/dev/input/event2")] {
            table.insert_opening(device(&backend, token, path));
            table.promote(token);
        }
        assert!(table.mark_closing(2));
        assert!(!table.mark_closing(9));
        assert_eq!(table.live().count(), 1);

        let retired = table.take_closing();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].token(), 2);
        assert!(!table.contains_path(Path::new("/dev/input/event2")));
        assert_eq!(table.token_for_path(Path::new("/dev/input/event1")), Some(1));
    }

    #[test]
    fn drain_empties_table() {
        let backend = MockBackend::new();
        let mut table = DeviceTable::new();
        table.insert_opening(device(&backend, 1, "/dev/input/event1"));
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
        assert!(table.drain().is_empty());
    }
}
