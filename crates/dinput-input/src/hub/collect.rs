//! The polling loops: raw event collection and hot-plug monitoring.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dinput_types::{DeviceClass, InputDeviceEvent, RawEvent};
use tracing::{debug, info, trace, warn};

use super::{lock, InputHub, MonitorPhase, RunState};
use crate::backend::{is_device_gone, is_transient, KernelEvent, NodeChange, WATCHER_TOKEN};
use crate::device::Device;
use crate::state::EventContext;

/// What to do with a device after one read attempt.
enum ReadOutcome {
    Keep,
    /// Keep, and come back to it before the next wait.
    Revisit,
    /// A held partial report leaves no room in this drain; read the device
    /// first on the next one.
    Defer,
    Close,
}

impl InputHub {
    /// Move to `Running` unless the hub has been stopped.
    fn enter_running(&self) -> bool {
        let mut run = lock(&self.run_state);
        match *run {
            RunState::Stopped => false,
            RunState::Idle | RunState::Running => {
                *run = RunState::Running;
                true
            }
        }
    }

    fn is_running(&self) -> bool {
        *lock(&self.run_state) == RunState::Running
    }

    pub(super) fn reset_pending(&self) {
        lock(&self.pending).clear();
        self.pending_count.store(0, Ordering::Release);
        self.pending_index.store(0, Ordering::Release);
    }

    /// Block up to `timeout` for readiness and refill the pending entries.
    ///
    /// Returns how many registrations became ready.
    pub fn poll_ready(&self, timeout: Duration) -> usize {
        let mut ready = Vec::new();
        if let Err(e) = self.readiness.wait(&mut ready, timeout) {
            if !is_transient(&e) {
                warn!(error = %e, "readiness wait failed");
            }
            ready.clear();
        }

        let count = ready.len();
        let mut pending = lock(&self.pending);
        *pending = ready;
        self.pending_index.store(0, Ordering::Release);
        self.pending_count.store(count, Ordering::Release);
        if count > 0 {
            trace!(count, "devices ready");
        }
        count
    }

    /// Collect raw events from shared devices until at least one is available.
    ///
    /// Blocks in bounded waits and returns the number of events appended to
    /// `out`, at most `capacity`. Returns `0` once the hub is stopped.
    pub fn start_collect_input_events(&self, out: &mut Vec<RawEvent>, capacity: usize) -> usize {
        if !self.enter_running() {
            return 0;
        }
        loop {
            if !self.is_running() {
                return 0;
            }
            self.scan_and_record_input_devices();
            let count = self.get_events(out, capacity);
            if count > 0 {
                return count;
            }
            self.poll_ready(self.config.poll_timeout);
        }
    }

    /// Drain the pending ready devices into `out`.
    ///
    /// Every event read updates the key/touch state, but only devices in
    /// sharing state contribute to `out`. Devices that hang up or report
    /// removal are closed before returning.
    pub fn get_events(&self, out: &mut Vec<RawEvent>, capacity: usize) -> usize {
        let mut produced = 0;
        let mut scratch = Vec::with_capacity(capacity);
        {
            let pending = lock(&self.pending);
            while produced < capacity {
                let index = self.pending_index.fetch_add(1, Ordering::AcqRel);
                if index >= self.pending_count.load(Ordering::Acquire) {
                    break;
                }
                let Some(ready) = pending.get(index).copied() else {
                    break;
                };
                if ready.token == WATCHER_TOKEN {
                    continue;
                }

                let mut devices = lock(&self.devices);
                let Some(device) = devices.get_live_mut(ready.token) else {
                    continue;
                };

                let outcome = if ready.readable {
                    scratch.clear();
                    self.read_device(device, &mut scratch, out, capacity - produced, &mut produced)
                } else {
                    ReadOutcome::Keep
                };

                match outcome {
                    ReadOutcome::Close => {
                        devices.mark_closing(ready.token);
                    }
                    _ if ready.hangup => {
                        debug!(token = ready.token, "device hung up");
                        devices.mark_closing(ready.token);
                    }
                    ReadOutcome::Revisit => {
                        self.pending_index.fetch_sub(1, Ordering::AcqRel);
                    }
                    ReadOutcome::Defer => {
                        self.pending_index.fetch_sub(1, Ordering::AcqRel);
                        break;
                    }
                    ReadOutcome::Keep => {}
                }
            }
            // Leave the index at the count after overshooting past the end.
            let count = self.pending_count.load(Ordering::Acquire);
            if self.pending_index.load(Ordering::Acquire) > count {
                self.pending_index.store(count, Ordering::Release);
            }
        }

        let closed = self.retire_closing();
        if closed > 0 {
            debug!(closed, "retired devices after drain");
        }
        produced
    }

    fn read_device(
        &self,
        device: &mut Device,
        scratch: &mut Vec<KernelEvent>,
        out: &mut Vec<RawEvent>,
        room: usize,
        produced: &mut usize,
    ) -> ReadOutcome {
        // Whole reports out of this read must fit in `room` together with
        // the held tail they complete.
        let held = device.held_report_len();
        if held > 0 && held >= room {
            if *produced > 0 {
                return ReadOutcome::Defer;
            }
            let dropped = device.discard_held_report();
            warn!(
                path = %device.path().display(),
                dropped,
                "touch report longer than the batch capacity dropped"
            );
        }
        let room = room - device.held_report_len();

        let Some(node) = device.node_mut() else {
            return ReadOutcome::Close;
        };
        match node.read_events(scratch, room) {
            Ok(0) => {
                debug!(path = %device.path().display(), "device returned no data, closing");
                ReadOutcome::Close
            }
            Ok(_) => {
                let more = node.has_pending();
                *produced += self.process_device_events(device, scratch, out);
                if more {
                    ReadOutcome::Revisit
                } else {
                    ReadOutcome::Keep
                }
            }
            Err(e) if is_device_gone(&e) => {
                info!(path = %device.path().display(), "device removed while reading");
                ReadOutcome::Close
            }
            Err(e) if is_transient(&e) => ReadOutcome::Keep,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %device.path().display(), error = %e, "discarding malformed read");
                ReadOutcome::Keep
            }
            Err(e) => {
                warn!(path = %device.path().display(), error = %e, "could not get event");
                ReadOutcome::Keep
            }
        }
    }

    /// Track a batch and copy it to `out` if the device is shared.
    fn process_device_events(
        &self,
        device: &mut Device,
        batch: &[KernelEvent],
        out: &mut Vec<RawEvent>,
    ) -> usize {
        let descriptor = device.descriptor().to_string();
        let path = device.path_string();
        let events: Vec<RawEvent> = batch
            .iter()
            .map(|k| {
                RawEvent::new(k.event_type, k.code, k.value)
                    .with_when(k.when)
                    .with_source(descriptor.as_str(), path.as_str())
            })
            .collect();

        let ctx = EventContext {
            is_cursor: device.has_class(DeviceClass::Cursor),
            is_touchpad: device.is_touchpad(),
            is_share: device.is_share(),
        };
        for event in &events {
            self.state.handle_event(event, ctx);
        }

        if !device.is_share() {
            device.discard_held_report();
            return 0;
        }

        if !device.is_touch_screen() {
            let count = events.len();
            out.extend(events);
            return count;
        }

        // Coordinates are only judged on whole reports.
        let mut events = device.complete_reports(events);
        let outcome = self.remapper.filter(&mut events);
        let events_len = events.len();
        let touch_descriptor = outcome
            .touch_descriptor
            .unwrap_or_else(|| descriptor.clone());
        let before = out.len();
        out.extend(
            events
                .into_iter()
                .zip(outcome.excluded)
                .filter(|(_, excluded)| !excluded)
                .map(|(event, _)| RawEvent {
                    descriptor: touch_descriptor.clone(),
                    ..event
                }),
        );
        let count = out.len() - before;
        let excluded = events_len - count;
        if excluded > 0 {
            trace!(
                path = %device.path().display(),
                dropped = excluded,
                held = device.held_report_len(),
                "touch events outside projection dropped"
            );
        }
        count
    }

    /// Report devices appearing and disappearing.
    ///
    /// The first call reports every device found by the initial scan followed
    /// by [`InputDeviceEvent::ScanFinished`]. Later calls block in bounded
    /// waits until the device directory or a device changes. Returns the
    /// number of events appended to `out`, or `0` once the hub is stopped.
    pub fn start_collect_input_handler(
        &self,
        out: &mut Vec<InputDeviceEvent>,
        capacity: usize,
    ) -> usize {
        if !self.enter_running() {
            return 0;
        }
        loop {
            if !self.is_running() {
                return 0;
            }

            let added = self.scan_and_record_input_devices();
            {
                let mut queue = lock(&self.device_events);
                queue.extend(added.into_iter().map(InputDeviceEvent::Added));
                let mut phase = lock(&self.monitor_phase);
                if *phase == MonitorPhase::InitialScan {
                    queue.push_back(InputDeviceEvent::ScanFinished);
                    *phase = MonitorPhase::Watching;
                    info!("initial device scan finished");
                }
            }

            self.handle_monitor_events();

            let count = {
                let mut queue = lock(&self.device_events);
                let take = capacity.min(queue.len());
                out.extend(queue.drain(..take));
                take
            };
            if count > 0 {
                return count;
            }
            self.poll_ready(self.config.poll_timeout);
        }
    }

    fn handle_monitor_events(&self) {
        let ready: Vec<_> = {
            let pending = lock(&self.pending);
            let count = self.pending_count.load(Ordering::Acquire);
            let index = self.pending_index.swap(count, Ordering::AcqRel);
            pending
                .get(index.min(count)..count.min(pending.len()))
                .map(<[_]>::to_vec)
                .unwrap_or_default()
        };

        for entry in ready {
            if entry.token == WATCHER_TOKEN {
                self.read_node_changes();
            } else if entry.hangup {
                if let Some(device) = self.close_device(entry.token) {
                    lock(&self.device_events).push_back(InputDeviceEvent::Removed(device));
                }
            }
        }
    }

    fn read_node_changes(&self) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        let changes = match watcher.read_changes() {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "failed to read directory notifications");
                return;
            }
        };

        for change in changes {
            match change {
                NodeChange::Created(path) => {
                    if self.is_skipped(&path) || lock(&self.devices).contains_path(&path) {
                        continue;
                    }
                    match self.open_input_device_locked(&path) {
                        Ok(device) => {
                            lock(&self.device_events).push_back(InputDeviceEvent::Added(device));
                        }
                        Err(e) => debug!(path = %path.display(), error = %e, "new node not tracked"),
                    }
                }
                NodeChange::Removed(path) => {
                    if let Some(device) = self.close_device_by_path(&path) {
                        info!(path = %path.display(), "device node removed");
                        lock(&self.device_events).push_back(InputDeviceEvent::Removed(device));
                    }
                }
            }
        }
    }

    /// Stop the event collection loop. A stopped hub does not restart.
    pub fn stop_collect_input_events(&self) {
        self.stop();
        info!("stopped collecting input events");
    }

    /// Stop the hot-plug monitor loop. A stopped hub does not restart.
    pub fn stop_collect_input_handler(&self) {
        self.stop();
        info!("stopped collecting device changes");
    }

    fn stop(&self) {
        *lock(&self.run_state) = RunState::Stopped;
        self.pending_count.store(0, Ordering::Release);
        self.pending_index.store(0, Ordering::Release);
    }
}
