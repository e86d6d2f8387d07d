//! An open evdev device node.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::UNIX_EPOCH;

use dinput_types::codes::{EV_REP, REP_DELAY, REP_PERIOD};
use dinput_types::{AbsAxisInfo, Capabilities};

use crate::backend::{DeviceIdentifiers, DeviceNode, KernelEvent, PollSource};

/// evdev-backed [`DeviceNode`].
///
/// `fetch_events` hands over everything the kernel has buffered at once;
/// what does not fit the caller's room is kept for the next read.
pub struct EvdevNode {
    device: evdev::Device,
    pending: VecDeque<KernelEvent>,
}

impl EvdevNode {
    pub fn new(device: evdev::Device) -> Self {
        Self {
            device,
            pending: VecDeque::new(),
        }
    }
}

fn convert(ev: &evdev::InputEvent) -> KernelEvent {
    let when = ev
        .timestamp()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_nanos()).ok())
        .unwrap_or(0);
    KernelEvent {
        when,
        event_type: ev.event_type().0,
        code: ev.code(),
        value: ev.value(),
    }
}

impl PollSource for EvdevNode {
    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.device.as_fd())
    }
}

impl DeviceNode for EvdevNode {
    fn name(&self) -> Option<String> {
        self.device.name().map(str::to_string)
    }

    fn identifiers(&self) -> io::Result<DeviceIdentifiers> {
        let id = self.device.input_id();
        let (major, minor, patch) = self.device.driver_version();
        Ok(DeviceIdentifiers {
            bus: id.bus_type().0,
            vendor: id.vendor(),
            product: id.product(),
            version: id.version(),
            driver_version: u32::from(major) << 16 | u32::from(minor) << 8 | u32::from(patch),
        })
    }

    fn physical_path(&self) -> Option<String> {
        self.device.physical_path().map(str::to_string)
    }

    fn unique_id(&self) -> Option<String> {
        self.device.unique_name().map(str::to_string)
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        let device = &self.device;
        let event_types: Vec<u16> = device.supported_events().iter().map(|t| t.0).collect();

        let abs_infos = if device.supported_absolute_axes().is_some() {
            device
                .get_absinfo()?
                .map(|(axis, info)| AbsAxisInfo {
                    code: axis.0,
                    value: info.value(),
                    minimum: info.minimum(),
                    maximum: info.maximum(),
                    fuzz: info.fuzz(),
                    flat: info.flat(),
                    resolution: info.resolution(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(Capabilities {
            keys: device
                .supported_keys()
                .map(|set| set.iter().map(|k| k.code()).collect())
                .unwrap_or_default(),
            abs_types: device
                .supported_absolute_axes()
                .map(|set| set.iter().map(|a| a.0).collect())
                .unwrap_or_default(),
            abs_infos,
            rel_types: device
                .supported_relative_axes()
                .map(|set| set.iter().map(|r| r.0).collect())
                .unwrap_or_default(),
            properties: device.properties().iter().map(|p| p.0).collect(),
            misc: device
                .misc_properties()
                .map(|set| set.iter().map(|m| m.0).collect())
                .unwrap_or_default(),
            leds: device
                .supported_leds()
                .map(|set| set.iter().map(|l| l.0).collect())
                .unwrap_or_default(),
            switches: device
                .supported_switches()
                .map(|set| set.iter().map(|s| s.0).collect())
                .unwrap_or_default(),
            repeats: if event_types.contains(&EV_REP) {
                vec![REP_DELAY, REP_PERIOD]
            } else {
                Vec::new()
            },
            event_types,
        })
    }

    fn read_events(&mut self, out: &mut Vec<KernelEvent>, max: usize) -> io::Result<usize> {
        if self.pending.is_empty() {
            let fetched = self.device.fetch_events()?;
            self.pending.extend(fetched.map(|ev| convert(&ev)));
        }
        if self.pending.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let count = max.min(self.pending.len());
        out.extend(self.pending.drain(..count));
        Ok(count)
    }

    fn key_state(&self) -> io::Result<Vec<u16>> {
        Ok(self
            .device
            .get_key_state()?
            .iter()
            .map(|k| k.code())
            .collect())
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
