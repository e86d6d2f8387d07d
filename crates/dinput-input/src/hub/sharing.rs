//! Sharing state of live devices and pre-share key seeding.

use std::collections::HashMap;
use std::thread;

use dinput_types::codes::{
    BTN_LEFT, BTN_MIDDLE, BTN_RIGHT, BTN_TOUCH, EV_KEY, KEY_DOWN_STATE, KEY_MAX,
};
use dinput_types::{AffectDhIds, DeviceClass, InputType, InputTypes, RawEvent};
use tracing::{debug, info, warn};

use super::{lock, InputHub};
use crate::device::Device;

/// Keys worth checking on a device about to be shared.
fn seed_codes(device: &Device) -> Vec<u16> {
    let mut codes = Vec::new();
    if device.has_class(DeviceClass::Cursor) {
        codes.extend([BTN_LEFT, BTN_RIGHT, BTN_MIDDLE]);
    }
    if device.has_class(DeviceClass::Keyboard) {
        codes.extend(0..KEY_MAX);
    }
    if device.classes().intersects(DeviceClass::Touch | DeviceClass::TouchMt) {
        codes.push(BTN_TOUCH);
    }
    codes
}

impl InputHub {
    /// Mark devices as shared or not, by descriptor.
    ///
    /// Unknown descriptors are ignored. Returns the descriptors whose
    /// devices were touched, split by the new state.
    pub fn set_sharing_devices(&self, enabled: bool, dh_ids: &[String]) -> AffectDhIds {
        let mut affected = AffectDhIds::default();
        let mut devices = lock(&self.devices);
        for device in devices.live_mut() {
            if !dh_ids.iter().any(|id| id == device.descriptor()) {
                continue;
            }
            device.set_share(enabled);
            info!(
                descriptor = %device.descriptor(),
                path = %device.path().display(),
                share = enabled,
                "device sharing changed"
            );
            let target = if enabled {
                &mut affected.sharing_dh_ids
            } else {
                &mut affected.no_sharing_dh_ids
            };
            target.push(device.descriptor().to_string());
        }
        affected
    }

    /// Descriptors of every device currently shared.
    pub fn get_sharing_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.devices)
            .live()
            .filter(|d| d.is_share())
            .map(|d| d.descriptor().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Mark every device of the given input types as shared or not.
    pub fn set_support_input_type(&self, enabled: bool, types: InputTypes) -> AffectDhIds {
        let classes = InputType::device_classes(types);
        let mut affected = AffectDhIds::default();
        let mut devices = lock(&self.devices);
        for device in devices.live_mut() {
            if !device.classes().intersects(classes) {
                continue;
            }
            device.set_share(enabled);
            let target = if enabled {
                &mut affected.sharing_dh_ids
            } else {
                &mut affected.no_sharing_dh_ids
            };
            target.push(device.descriptor().to_string());
        }
        info!(
            ?types,
            share = enabled,
            count = affected.sharing_dh_ids.len() + affected.no_sharing_dh_ids.len(),
            "input type sharing changed"
        );
        affected
    }

    /// Device id to descriptor for every device of the given types.
    pub fn get_devices_info_by_type(&self, types: InputTypes) -> HashMap<u64, String> {
        let classes = InputType::device_classes(types);
        lock(&self.devices)
            .live()
            .filter(|d| d.classes().intersects(classes))
            .map(|d| (d.token(), d.descriptor().to_string()))
            .collect()
    }

    /// Device id to descriptor for the listed descriptors that are live.
    pub fn get_devices_info_by_dh_id(&self, dh_ids: &[String]) -> HashMap<u64, String> {
        lock(&self.devices)
            .live()
            .filter(|d| dh_ids.iter().any(|id| id == d.descriptor()))
            .map(|d| (d.token(), d.descriptor().to_string()))
            .collect()
    }

    /// Descriptor to device path for the listed descriptors that are live.
    pub fn get_device_paths_by_dh_ids(&self, dh_ids: &[String]) -> HashMap<String, String> {
        lock(&self.devices)
            .live()
            .filter(|d| dh_ids.iter().any(|id| id == d.descriptor()))
            .map(|d| (d.descriptor().to_string(), d.path_string()))
            .collect()
    }

    /// Path of the first shared cursor device among `dh_ids`.
    pub fn get_shared_mouse_path_by_dh_id(&self, dh_ids: &[String]) -> Option<String> {
        let devices = lock(&self.devices);
        dh_ids.iter().find_map(|id| {
            devices
                .live()
                .find(|d| {
                    d.descriptor() == id && d.is_share() && d.has_class(DeviceClass::Cursor)
                })
                .map(Device::path_string)
        })
    }

    /// Paths of the shared keyboards among `dh_ids`.
    pub fn get_shared_keyboard_paths_by_dh_ids(&self, dh_ids: &[String]) -> Vec<String> {
        let devices = lock(&self.devices);
        dh_ids
            .iter()
            .filter_map(|id| {
                devices
                    .live()
                    .find(|d| {
                        d.descriptor() == id && d.is_share() && d.has_class(DeviceClass::Keyboard)
                    })
                    .map(Device::path_string)
            })
            .collect()
    }

    /// Whether no device is currently shared.
    pub fn is_all_devices_stopped(&self) -> bool {
        !lock(&self.devices).live().any(Device::is_share)
    }

    /// Seed the key-down table with keys already held on the given devices.
    ///
    /// The kernel key state is queried directly, retrying a bounded number of
    /// times. The device table lock is released while waiting between tries.
    pub fn record_device_states(&self, dh_ids: &[String]) -> usize {
        let targets: Vec<(u64, String, String, Vec<u16>)> = lock(&self.devices)
            .live()
            .filter(|d| dh_ids.iter().any(|id| id == d.descriptor()))
            .map(|d| (d.token(), d.descriptor().to_string(), d.path_string(), seed_codes(d)))
            .filter(|(_, _, _, codes)| !codes.is_empty())
            .collect();

        let mut seeded = 0;
        for (token, descriptor, path, codes) in targets {
            let Some(held) = self.query_key_state(token, &path) else {
                continue;
            };
            for code in held.into_iter().filter(|c| codes.contains(c)) {
                let event = RawEvent::new(EV_KEY, code, KEY_DOWN_STATE)
                    .with_source(descriptor.as_str(), path.as_str());
                self.state.add_key_down_state(&event);
                debug!(descriptor = %descriptor, code, "seeded held key");
                seeded += 1;
            }
        }
        seeded
    }

    fn query_key_state(&self, token: u64, path: &str) -> Option<Vec<u16>> {
        let attempts = self.config.key_state_retries.max(1);
        for attempt in 1..=attempts {
            let result = {
                let devices = lock(&self.devices);
                let node = devices.get_live(token).and_then(Device::node)?;
                node.key_state()
            };
            match result {
                Ok(keys) => return Some(keys),
                Err(e) if attempt < attempts => {
                    debug!(path, attempt, error = %e, "key state query failed, retrying");
                    thread::sleep(self.config.key_state_retry_interval);
                }
                Err(e) => {
                    warn!(path, attempts, error = %e, "giving up on key state");
                }
            }
        }
        None
    }
}
