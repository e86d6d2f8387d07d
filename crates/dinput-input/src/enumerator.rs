//! Device querying, descriptor generation and classification.

use std::path::Path;

use dinput_types::codes::{
    ABS_MT_POSITION_X, ABS_MT_POSITION_Y, ABS_X, ABS_Y, BTN_MOUSE, BTN_TOUCH, REL_X, REL_Y,
};
use dinput_types::{Capabilities, DeviceClass, DeviceClasses, InputDevice};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::backend::DeviceNode;
use crate::error::InputError;

/// Name prefix of every virtual device this crate creates.
pub const VIRTUAL_DEVICE_NAME_MARKER: &str = "DistributedInput ";

/// Prefix of every generated descriptor.
pub const DESCRIPTOR_PREFIX: &str = "Input_";

/// Build the stable descriptor of a device.
///
/// Only non-empty fields contribute, always in the same order, so the same
/// physical device yields the same descriptor on every open.
pub fn generate_descriptor(
    vendor: u16,
    product: u16,
    unique_id: &str,
    physical_path: &str,
    name: &str,
) -> String {
    let mut raw = format!(":{vendor:04x}:{product:04x}:");
    if !unique_id.is_empty() {
        raw.push_str("uniqueId:");
        raw.push_str(unique_id);
    }
    if !physical_path.is_empty() {
        raw.push_str("physicalPath:");
        raw.push_str(physical_path);
    }
    let compact_name: String = name.split_whitespace().collect();
    if !compact_name.is_empty() {
        raw.push_str("name:");
        raw.push_str(&compact_name);
    }
    format!("{DESCRIPTOR_PREFIX}{:x}", Sha256::digest(raw.as_bytes()))
}

/// Derive device classes from capability bits.
///
/// Keyboard is only assigned when nothing else matched, so a mouse with a
/// few extra keys stays a cursor device.
pub fn classify(caps: &Capabilities) -> DeviceClasses {
    let mut classes = DeviceClasses::empty();

    if caps.has_key(BTN_TOUCH) {
        if caps.has_abs(ABS_MT_POSITION_X) && caps.has_abs(ABS_MT_POSITION_Y) {
            classes |= DeviceClass::TouchMt | DeviceClass::Touch;
        } else if caps.has_abs(ABS_X) && caps.has_abs(ABS_Y) {
            classes |= DeviceClass::Touch;
        }
    }

    if caps.has_key(BTN_MOUSE) && caps.has_rel(REL_X) && caps.has_rel(REL_Y) {
        classes |= DeviceClass::Cursor;
    }

    if classes.is_empty() && caps.has_keyboard_keys() {
        classes |= DeviceClass::Keyboard;
    }

    classes
}

/// Case-insensitive device-name matcher that tags touchpads.
#[derive(Debug, Clone)]
pub struct TouchpadMatcher {
    patterns: Vec<String>,
}

impl Default for TouchpadMatcher {
    fn default() -> Self {
        Self::new(["touchpad"])
    }
}

impl TouchpadMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_touchpad(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }
}

/// Read the full identity of an open node and classify it.
///
/// Nodes created by our own injector are rejected with
/// [`InputError::VirtualDevice`] so the caller can skip them for good.
pub fn query_device(
    path: &Path,
    node: &dyn DeviceNode,
    marker: &str,
) -> Result<InputDevice, InputError> {
    let name = node.name().unwrap_or_default();
    if !marker.is_empty() && name.contains(marker) {
        debug!(path = %path.display(), name = %name, "skipping virtual device");
        return Err(InputError::VirtualDevice {
            path: path.to_path_buf(),
        });
    }

    let ids = node.identifiers().map_err(|e| InputError::DeviceQuery {
        path: path.to_path_buf(),
        reason: format!("identifiers: {e}"),
    })?;

    let physical_path = node.physical_path().unwrap_or_default();
    let unique_id = node.unique_id().unwrap_or_default();

    let capabilities = node.capabilities().map_err(|e| InputError::DeviceQuery {
        path: path.to_path_buf(),
        reason: format!("capabilities: {e}"),
    })?;
    for info in capabilities.abs_infos.iter().filter(|i| !i.has_valid_range()) {
        warn!(
            path = %path.display(),
            axis = info.code,
            min = info.minimum,
            max = info.maximum,
            "axis reports max below min"
        );
    }

    let classes = classify(&capabilities);
    if classes.is_empty() {
        return Err(InputError::UnsupportedClass {
            path: path.to_path_buf(),
        });
    }

    let descriptor =
        generate_descriptor(ids.vendor, ids.product, &unique_id, &physical_path, &name);

    let mut device = InputDevice {
        name,
        physical_path,
        unique_id,
        bus: ids.bus,
        vendor: ids.vendor,
        product: ids.product,
        version: ids.version,
        driver_version: ids.driver_version,
        descriptor,
        classes: 0,
        capabilities,
    };
    device.set_classes(classes);
    Ok(device)
}
