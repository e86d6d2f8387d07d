//! Virtual input devices replicating remote hardware.
//!
//! A [`VirtualDevice`] owns one uinput node created from a remote device's
//! identity. [`VirtualDeviceManager`] keeps one per `(network id, dh id)`.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use dinput_types::codes::{EV_ABS, EV_REP};
use dinput_types::{AbsAxisInfo, DeviceClass, InputDevice, RawEvent};
use tracing::{debug, info, warn};

use crate::backend::KernelEvent;
use crate::error::InputError;

/// Longest device name uinput accepts, excluding the terminator.
pub const MAX_NAME_BYTES: usize = 79;

/// Everything needed to declare a virtual device to the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualDeviceSetup {
    pub name: String,
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub phys: String,
    pub event_types: Vec<u16>,
    pub keys: Vec<u16>,
    pub abs_axes: Vec<AbsAxisInfo>,
    /// Axes declared with a zeroed range because the remote range was invalid.
    pub skipped_axes: Vec<u16>,
    pub rel_axes: Vec<u16>,
    pub properties: Vec<u16>,
    pub misc: Vec<u16>,
    pub leds: Vec<u16>,
    pub switches: Vec<u16>,
    pub repeats: Vec<u16>,
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES {
        return name.to_string();
    }
    let mut end = MAX_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

impl VirtualDeviceSetup {
    pub fn from_identity(
        identity: &InputDevice,
        marker: &str,
        network_id: &str,
        dh_id: &str,
    ) -> Self {
        let caps = &identity.capabilities;
        let pid = std::process::id();

        let mut abs_axes = Vec::new();
        let mut skipped_axes = Vec::new();
        for &code in &caps.abs_types {
            match caps.abs_info(code) {
                Some(info) if info.has_valid_range() => abs_axes.push(*info),
                Some(info) => {
                    warn!(
                        dh_id,
                        axis = code,
                        min = info.minimum,
                        max = info.maximum,
                        "skipping range of axis with max below min"
                    );
                    skipped_axes.push(code);
                    abs_axes.push(AbsAxisInfo {
                        code,
                        ..AbsAxisInfo::default()
                    });
                }
                None => abs_axes.push(AbsAxisInfo {
                    code,
                    ..AbsAxisInfo::default()
                }),
            }
        }

        let mut event_types = caps.event_types.clone();
        if !abs_axes.is_empty() && !event_types.contains(&EV_ABS) {
            event_types.push(EV_ABS);
        }

        Self {
            name: truncate_name(&format!("{marker}{}", identity.name)),
            bus: identity.bus,
            vendor: identity.vendor,
            product: identity.product,
            version: identity.version,
            phys: format!("{pid}/{pid}|{network_id}|{dh_id}"),
            event_types,
            keys: caps.keys.clone(),
            abs_axes,
            skipped_axes,
            rel_axes: caps.rel_types.clone(),
            properties: caps.properties.clone(),
            misc: caps.misc.clone(),
            leds: caps.leds.clone(),
            switches: caps.switches.clone(),
            repeats: caps.repeats.clone(),
        }
    }

    /// Whether the source device reports `EV_REP`.
    pub fn wants_autorepeat(&self) -> bool {
        self.event_types.contains(&EV_REP) || !self.repeats.is_empty()
    }
}

/// A created uinput device node.
///
/// Dropping the node destroys the kernel device. Implementations may buffer
/// events until the `SYN_REPORT` that ends their frame. A frame cut off
/// before its sync report, by an error or by the node being dropped, is
/// never emitted.
pub trait UinputNode: Send {
    /// Write one event record. Reaching the kernel may wait for the frame's
    /// sync report.
    fn write_event(&mut self, event: KernelEvent) -> io::Result<()>;

    /// Kernel-assigned sysfs name, if known.
    fn sys_name(&self) -> Option<String>;

    /// `/dev/input/event*` node of the created device, if known.
    fn dev_node(&self) -> Option<PathBuf>;
}

/// Creates uinput devices.
pub trait UinputBackend: Send + Sync {
    fn create(&self, setup: &VirtualDeviceSetup) -> io::Result<Box<dyn UinputNode>>;
}

/// Local stand-in for one remote device.
pub struct VirtualDevice {
    network_id: String,
    dh_id: String,
    identity: InputDevice,
    setup: VirtualDeviceSetup,
    node: Box<dyn UinputNode>,
}

impl VirtualDevice {
    pub fn create(
        backend: &dyn UinputBackend,
        identity: &InputDevice,
        marker: &str,
        network_id: &str,
        dh_id: &str,
    ) -> Result<Self, InputError> {
        let setup = VirtualDeviceSetup::from_identity(identity, marker, network_id, dh_id);
        let node = backend
            .create(&setup)
            .map_err(|e| InputError::VirtualDeviceCreate(format!("{}: {e}", setup.name)))?;
        info!(
            name = %setup.name,
            network_id,
            dh_id,
            sys_name = node.sys_name().as_deref().unwrap_or("unknown"),
            "created virtual device"
        );
        Ok(Self {
            network_id: network_id.to_string(),
            dh_id: dh_id.to_string(),
            identity: identity.clone(),
            setup,
            node,
        })
    }

    /// Write one event verbatim. Failures are not retried.
    pub fn inject_input_event(&mut self, event: &RawEvent) -> Result<(), InputError> {
        self.node
            .write_event(KernelEvent {
                when: event.when,
                event_type: event.event_type,
                code: event.code,
                value: event.value,
            })
            .map_err(|e| InputError::Inject(format!("{}: {e}", self.setup.name)))
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn dh_id(&self) -> &str {
        &self.dh_id
    }

    pub fn identity(&self) -> &InputDevice {
        &self.identity
    }

    pub fn setup(&self) -> &VirtualDeviceSetup {
        &self.setup
    }

    pub fn is_keyboard(&self) -> bool {
        self.identity.has_class(DeviceClass::Keyboard)
    }

    pub fn dev_node(&self) -> Option<PathBuf> {
        self.node.dev_node()
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        info!(name = %self.setup.name, dh_id = %self.dh_id, "destroyed virtual device");
    }
}

type DeviceKey = (String, String);

/// One virtual device per remote `(network id, dh id)`.
pub struct VirtualDeviceManager {
    backend: Arc<dyn UinputBackend>,
    marker: String,
    devices: Mutex<HashMap<DeviceKey, VirtualDevice>>,
}

impl VirtualDeviceManager {
    pub fn new(backend: Arc<dyn UinputBackend>, marker: impl Into<String>) -> Self {
        Self {
            backend,
            marker: marker.into(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceKey, VirtualDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the virtual counterpart of a remote device. Existing ones are kept.
    pub fn open_devices_node(
        &self,
        network_id: &str,
        dh_id: &str,
        identity: &InputDevice,
    ) -> Result<(), InputError> {
        let key = (network_id.to_string(), dh_id.to_string());
        if self.devices().contains_key(&key) {
            debug!(network_id, dh_id, "virtual device already exists");
            return Ok(());
        }
        let device =
            VirtualDevice::create(self.backend.as_ref(), identity, &self.marker, network_id, dh_id)?;
        self.devices().entry(key).or_insert(device);
        Ok(())
    }

    pub fn close_device_node(&self, network_id: &str, dh_id: &str) -> Result<(), InputError> {
        self.devices()
            .remove(&(network_id.to_string(), dh_id.to_string()))
            .map(drop)
            .ok_or_else(|| InputError::DeviceNotFound(format!("{network_id}/{dh_id}")))
    }

    /// Close every device that belongs to one peer.
    pub fn close_devices_of(&self, network_id: &str) -> usize {
        let mut devices = self.devices();
        let before = devices.len();
        devices.retain(|(net, _), _| net != network_id);
        before - devices.len()
    }

    pub fn close_all_devices(&self) {
        let drained: Vec<VirtualDevice> = self.devices().drain().map(|(_, d)| d).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "closing all virtual devices");
        }
    }

    pub fn inject_event(&self, network_id: &str, event: &RawEvent) -> Result<(), InputError> {
        let mut devices = self.devices();
        let device = devices
            .get_mut(&(network_id.to_string(), event.descriptor.clone()))
            .ok_or_else(|| {
                InputError::DeviceNotFound(format!("{network_id}/{}", event.descriptor))
            })?;
        device.inject_input_event(event)
    }

    /// Inject a batch. Per-event failures are logged and skipped.
    pub fn process_inject_events(&self, network_id: &str, events: &[RawEvent]) -> usize {
        let mut injected = 0;
        for event in events {
            match self.inject_event(network_id, event) {
                Ok(()) => injected += 1,
                Err(e) => warn!(network_id, dh_id = %event.descriptor, error = %e, "inject failed"),
            }
        }
        injected
    }

    /// Device nodes of the virtual keyboards created for `dh_ids`.
    pub fn get_virtual_keyboard_paths(&self, network_id: &str, dh_ids: &[String]) -> Vec<String> {
        let devices = self.devices();
        dh_ids
            .iter()
            .filter_map(|dh_id| devices.get(&(network_id.to_string(), dh_id.clone())))
            .filter(|d| d.is_keyboard())
            .filter_map(VirtualDevice::dev_node)
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    pub fn has_device(&self, network_id: &str, dh_id: &str) -> bool {
        self.devices()
            .contains_key(&(network_id.to_string(), dh_id.to_string()))
    }

    pub fn device_count(&self) -> usize {
        self.devices().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerator::VIRTUAL_DEVICE_NAME_MARKER;
    use crate::mock::{MockDeviceSpec, MockUinput};
    use dinput_types::codes::{ABS_X, ABS_Y, EV_KEY, EV_LED, KEY_A, REP_DELAY, REP_PERIOD};
    use dinput_types::Capabilities;

    fn touch_identity() -> InputDevice {
        let mut device = InputDevice {
            name: "Touch Panel".to_string(),
            descriptor: "Input_touch".to_string(),
            capabilities: MockDeviceSpec::touchscreen_mt("Touch Panel").capabilities,
            ..InputDevice::default()
        };
        device.set_classes(DeviceClass::Touch | DeviceClass::TouchMt);
        device
    }

    fn keyboard_identity() -> InputDevice {
        let mut device = InputDevice {
            name: "Keyboard".to_string(),
            descriptor: "Input_kbd".to_string(),
            capabilities: MockDeviceSpec::keyboard("Keyboard").capabilities,
            ..InputDevice::default()
        };
        device.set_classes(DeviceClass::Keyboard.into());
        device
    }

    #[test]
    fn setup_marks_name_and_phys() {
        let setup =
            VirtualDeviceSetup::from_identity(&touch_identity(), "DistributedInput ", "net", "dh");
        assert_eq!(setup.name, "DistributedInput Touch Panel");
        assert!(setup.phys.ends_with("|net|dh"));
        assert!(setup.skipped_axes.is_empty());
    }

    #[test]
    fn setup_carries_led_and_repeat_capabilities() {
        let mut identity = keyboard_identity();
        identity.capabilities.event_types = vec![EV_KEY, EV_LED, EV_REP];
        identity.capabilities.leds = vec![0, 1, 2];
        identity.capabilities.repeats = vec![REP_DELAY, REP_PERIOD];

        let setup = VirtualDeviceSetup::from_identity(&identity, "", "net", "dh");
        assert_eq!(setup.event_types, vec![EV_KEY, EV_LED, EV_REP]);
        assert_eq!(setup.leds, vec![0, 1, 2]);
        assert_eq!(setup.repeats, vec![REP_DELAY, REP_PERIOD]);
        assert!(setup.wants_autorepeat());

        let plain = VirtualDeviceSetup::from_identity(&touch_identity(), "", "net", "dh");
        assert!(!plain.wants_autorepeat());
    }

    #[test]
    fn long_names_are_truncated_on_char_boundary() {
        let identity = InputDevice {
            name: "é".repeat(60),
            ..InputDevice::default()
        };
        let setup = VirtualDeviceSetup::from_identity(&identity, "", "n", "d");
        assert!(setup.name.len() <= MAX_NAME_BYTES);
        assert_eq!(setup.name.len() % 2, 0);
    }

    #[test]
    fn invalid_axis_range_is_zeroed_not_fatal() {
        let mut identity = touch_identity();
        identity.capabilities = Capabilities {
            event_types: vec![EV_ABS],
            abs_types: vec![ABS_X, ABS_Y],
            abs_infos: vec![
                AbsAxisInfo {
                    code: ABS_X,
                    minimum: 100,
                    maximum: 10,
                    fuzz: 4,
                    flat: 8,
                    ..AbsAxisInfo::default()
                },
                AbsAxisInfo {
                    code: ABS_Y,
                    maximum: 1080,
                    ..AbsAxisInfo::default()
                },
            ],
            ..Capabilities::default()
        };

        let uinput = MockUinput::new();
        let device = VirtualDevice::create(&uinput, &identity, "M ", "net", "dh").unwrap();
        let setup = device.setup();
        assert_eq!(setup.skipped_axes, vec![ABS_X]);
        let x = setup.abs_axes.iter().find(|a| a.code == ABS_X).unwrap();
        assert_eq!((x.minimum, x.maximum, x.fuzz, x.flat), (0, 0, 0, 0));
        let y = setup.abs_axes.iter().find(|a| a.code == ABS_Y).unwrap();
        assert_eq!(y.maximum, 1080);
        assert_eq!(uinput.handle().created().len(), 1);
    }

    #[test]
    fn manager_lifecycle() {
        let uinput = MockUinput::new();
        let handle = uinput.handle();
        let manager = VirtualDeviceManager::new(Arc::new(uinput), VIRTUAL_DEVICE_NAME_MARKER);

        manager
            .open_devices_node("net", "Input_kbd", &keyboard_identity())
            .unwrap();
        manager
            .open_devices_node("net", "Input_kbd", &keyboard_identity())
            .unwrap();
        assert_eq!(manager.device_count(), 1);
        assert!(manager.has_device("net", "Input_kbd"));

        let events = [
            RawEvent::new(EV_KEY, KEY_A, 1).with_source("Input_kbd", ""),
            RawEvent::new(EV_KEY, KEY_A, 0).with_source("Input_unknown", ""),
        ];
        assert_eq!(manager.process_inject_events("net", &events), 1);
        assert_eq!(handle.written(0).len(), 1);

        assert_eq!(
            manager.get_virtual_keyboard_paths("net", &["Input_kbd".to_string()]).len(),
            1
        );

        manager.close_device_node("net", "Input_kbd").unwrap();
        assert!(matches!(
            manager.close_device_node("net", "Input_kbd"),
            Err(InputError::DeviceNotFound(_))
        ));
        assert!(handle.is_destroyed(0));
    }

    #[test]
    fn close_by_peer_and_all() {
        let uinput = MockUinput::new();
        let manager = VirtualDeviceManager::new(Arc::new(uinput), "M ");
        manager.open_devices_node("a", "d1", &keyboard_identity()).unwrap();
        manager.open_devices_node("a", "d2", &touch_identity()).unwrap();
        manager.open_devices_node("b", "d1", &keyboard_identity()).unwrap();
        assert_eq!(manager.close_devices_of("a"), 2);
        assert_eq!(manager.device_count(), 1);
        manager.close_all_devices();
        manager.close_all_devices();
        assert_eq!(manager.device_count(), 0);
    }

    #[test]
    fn create_failure_is_reported() {
        let uinput = MockUinput::new();
        uinput.handle().fail_next_create();
        let manager = VirtualDeviceManager::new(Arc::new(uinput), "M ");
        let err = manager
            .open_devices_node("net", "d", &keyboard_identity())
            .unwrap_err();
        assert_eq!(err.code(), -67008);
        assert_eq!(manager.device_count(), 0);
    }
}
