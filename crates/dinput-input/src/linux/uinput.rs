//! uinput-based virtual devices.
//!
//! Capabilities are declared through evdev's builder. It has no LED or
//! autorepeat setters, so those bits are never declared: the virtual device
//! rejects LED events and the kernel does not autorepeat its keys. Repeats
//! written by the source still arrive as `EV_KEY` value `2`.

use std::ffi::CString;
use std::io;
use std::path::PathBuf;

use dinput_types::codes::{EV_SYN, SYN_REPORT};
use evdev::uinput::VirtualDevice as UinputDevice;
use evdev::{
    AbsInfo, AbsoluteAxisCode, AttributeSet, BusType, InputId, KeyCode, MiscCode, PropType,
    RelativeAxisCode, SwitchCode, UinputAbsSetup,
};
use tracing::debug;

use crate::backend::KernelEvent;
use crate::virtual_device::{UinputBackend, UinputNode, VirtualDeviceSetup};

/// Creates devices through `/dev/uinput`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UinputDeviceBackend;

impl UinputDeviceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl UinputBackend for UinputDeviceBackend {
    fn create(&self, setup: &VirtualDeviceSetup) -> io::Result<Box<dyn UinputNode>> {
        let phys = CString::new(setup.phys.as_str())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut builder = UinputDevice::builder()?
            .name(&setup.name)
            .input_id(InputId::new(
                BusType(setup.bus),
                setup.vendor,
                setup.product,
                setup.version,
            ))
            .with_phys(&phys)?;

        if !setup.keys.is_empty() {
            let keys: AttributeSet<KeyCode> = setup.keys.iter().map(|&c| KeyCode(c)).collect();
            builder = builder.with_keys(&keys)?;
        }
        for axis in &setup.abs_axes {
            let info = AbsInfo::new(
                axis.value,
                axis.minimum,
                axis.maximum,
                axis.fuzz,
                axis.flat,
                axis.resolution,
            );
            let abs = UinputAbsSetup::new(AbsoluteAxisCode(axis.code), info);
            builder = builder.with_absolute_axis(&abs)?;
        }
        if !setup.rel_axes.is_empty() {
            let rel: AttributeSet<RelativeAxisCode> =
                setup.rel_axes.iter().map(|&c| RelativeAxisCode(c)).collect();
            builder = builder.with_relative_axes(&rel)?;
        }
        if !setup.properties.is_empty() {
            let props: AttributeSet<PropType> =
                setup.properties.iter().map(|&c| PropType(c)).collect();
            builder = builder.with_properties(&props)?;
        }
        if !setup.switches.is_empty() {
            let switches: AttributeSet<SwitchCode> =
                setup.switches.iter().map(|&c| SwitchCode(c)).collect();
            builder = builder.with_switches(&switches)?;
        }
        if !setup.misc.is_empty() {
            let misc: AttributeSet<MiscCode> = setup.misc.iter().map(|&c| MiscCode(c)).collect();
            builder = builder.with_msc(&misc)?;
        }
        if !setup.leds.is_empty() || setup.wants_autorepeat() {
            debug!(
                name = %setup.name,
                leds = setup.leds.len(),
                autorepeat = setup.wants_autorepeat(),
                event_types = ?setup.event_types,
                "LED and autorepeat capabilities left undeclared"
            );
        }

        let mut device = builder.build()?;
        let sys_name = device
            .get_syspath()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        let dev_node = device
            .enumerate_dev_nodes_blocking()?
            .find_map(Result::ok);

        Ok(Box::new(EvdevUinputNode {
            device,
            frame: Vec::new(),
            sys_name,
            dev_node,
        }))
    }
}

/// A live uinput device.
///
/// `emit` always terminates a write with its own sync report, so events are
/// held until the caller's sync report arrives and then written as one frame.
struct EvdevUinputNode {
    device: UinputDevice,
    frame: Vec<evdev::InputEvent>,
    sys_name: Option<String>,
    dev_node: Option<PathBuf>,
}

impl UinputNode for EvdevUinputNode {
    fn write_event(&mut self, event: KernelEvent) -> io::Result<()> {
        if event.event_type == EV_SYN && event.code == SYN_REPORT {
            let frame = std::mem::take(&mut self.frame);
            return self.device.emit(&frame);
        }
        self.frame.push(evdev::InputEvent::new(
            event.event_type,
            event.code,
            event.value,
        ));
        Ok(())
    }

    fn sys_name(&self) -> Option<String> {
        self.sys_name.clone()
    }

    fn dev_node(&self) -> Option<PathBuf> {
        self.dev_node.clone()
    }
}
