//! Device identity and capability types.

use bincode::{Decode, Encode};
use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};

use crate::codes::{BTN_MISC, EV_REP};

/// Classification of a device derived from its capability bits.
///
/// Bit values match the classes carried on the wire, so the raw `u32` in
/// [`InputDevice::classes`] is stable across peers.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Keyboard = 0x0000_0001,
    Touch = 0x0000_0004,
    Cursor = 0x0000_0008,
    TouchMt = 0x0000_0010,
}

pub type DeviceClasses = BitFlags<DeviceClass>;

/// Input type selector used when sharing by category rather than by id.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputType {
    Mouse = 0x1,
    Keyboard = 0x2,
    Touchscreen = 0x4,
}

pub type InputTypes = BitFlags<InputType>;

impl InputType {
    /// Device classes that belong to the given input types.
    pub fn device_classes(types: InputTypes) -> DeviceClasses {
        let mut classes = DeviceClasses::empty();
        if types.contains(InputType::Mouse) {
            classes |= DeviceClass::Cursor;
        }
        if types.contains(InputType::Keyboard) {
            classes |= DeviceClass::Keyboard;
        }
        if types.contains(InputType::Touchscreen) {
            classes |= DeviceClass::Touch | DeviceClass::TouchMt;
        }
        classes
    }
}

/// Range tuple of one absolute axis (`struct input_absinfo`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AbsAxisInfo {
    pub code: u16,
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

impl AbsAxisInfo {
    /// A range is usable when its maximum is not below its minimum.
    pub fn has_valid_range(&self) -> bool {
        self.maximum >= self.minimum
    }
}

/// Every code a device declares, grouped by event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Capabilities {
    pub event_types: Vec<u16>,
    pub keys: Vec<u16>,
    pub abs_types: Vec<u16>,
    pub abs_infos: Vec<AbsAxisInfo>,
    pub rel_types: Vec<u16>,
    pub properties: Vec<u16>,
    pub misc: Vec<u16>,
    pub leds: Vec<u16>,
    pub switches: Vec<u16>,
    pub repeats: Vec<u16>,
}

impl Capabilities {
    pub fn has_event_type(&self, event_type: u16) -> bool {
        self.event_types.contains(&event_type)
    }

    pub fn has_key(&self, code: u16) -> bool {
        self.keys.contains(&code)
    }

    pub fn has_abs(&self, code: u16) -> bool {
        self.abs_types.contains(&code)
    }

    pub fn has_rel(&self, code: u16) -> bool {
        self.rel_types.contains(&code)
    }

    /// Whether any key below the miscellaneous button range is present.
    pub fn has_keyboard_keys(&self) -> bool {
        self.keys.iter().any(|&code| code < BTN_MISC)
    }

    pub fn abs_info(&self, code: u16) -> Option<&AbsAxisInfo> {
        self.abs_infos.iter().find(|info| info.code == code)
    }

    pub fn has_auto_repeat(&self) -> bool {
        self.has_event_type(EV_REP) || !self.repeats.is_empty()
    }
}

/// Full identity of an input device.
///
/// This is what crosses the transport boundary so that the remote side can
/// rebuild an equivalent virtual device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct InputDevice {
    pub name: String,
    pub physical_path: String,
    pub unique_id: String,
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub driver_version: u32,
    /// Content-derived stable id (the dhId).
    pub descriptor: String,
    /// Raw [`DeviceClass`] bits.
    pub classes: u32,
    pub capabilities: Capabilities,
}

impl InputDevice {
    pub fn classes(&self) -> DeviceClasses {
        DeviceClasses::from_bits_truncate(self.classes)
    }

    pub fn set_classes(&mut self, classes: DeviceClasses) {
        self.classes = classes.bits();
    }

    pub fn has_class(&self, class: DeviceClass) -> bool {
        self.classes().contains(class)
    }
}

/// Device lifecycle notification produced by the hot-plug monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum InputDeviceEvent {
    Added(InputDevice),
    Removed(InputDevice),
    /// The initial directory scan has been fully reported.
    ScanFinished,
}
