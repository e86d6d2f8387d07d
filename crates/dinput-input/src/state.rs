//! Cross-device key and touch state tracking.
//!
//! [`DInputState`] remembers which keys each physical device holds down and
//! where each device's events are currently routed. When routing changes
//! mid-press it produces the compensating events the paired side needs to
//! release what it still believes is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dinput_types::codes::{BTN_MOUSE, EV_KEY, EV_SYN, KEY_UP_STATE, SYN_REPORT};
use dinput_types::{DhIdState, RawEvent};
use tracing::{debug, info, trace, warn};

use crate::error::InputError;
use crate::touchpad::TouchpadFragmentManager;

/// Delivers compensating events to the side a device is paired with.
pub trait RemoteStateSink: Send + Sync {
    fn simulate_events(
        &self,
        session_id: &str,
        dh_id: &str,
        events: &[RawEvent],
    ) -> Result<(), InputError>;
}

/// What the tracker needs to know about the device an event came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventContext {
    pub is_cursor: bool,
    pub is_touchpad: bool,
    pub is_share: bool,
}

#[derive(Debug, Clone)]
struct DhIdRecord {
    state: DhIdState,
    session_id: String,
}

/// Shared state tracker, one per engine instance.
#[derive(Default)]
pub struct DInputState {
    key_down: Mutex<HashMap<String, Vec<RawEvent>>>,
    dh_ids: Mutex<HashMap<String, DhIdRecord>>,
    touchpad: TouchpadFragmentManager,
    sink: RwLock<Option<Arc<dyn RemoteStateSink>>>,
}

impl DInputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_remote_sink(&self, sink: Arc<dyn RemoteStateSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn clear_remote_sink(&self) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn touchpad(&self) -> &TouchpadFragmentManager {
        &self.touchpad
    }

    // -- routing ----------------------------------------------------------

    pub fn record_dh_ids(&self, dh_ids: &[String], state: DhIdState, session_id: &str) {
        let mut records = self.dh_ids.lock().unwrap_or_else(PoisonError::into_inner);
        for dh_id in dh_ids {
            info!(dh_id = %dh_id, %state, session_id, "recorded dhid state");
            records.insert(
                dh_id.clone(),
                DhIdRecord {
                    state,
                    session_id: session_id.to_string(),
                },
            );
        }
    }

    pub fn remove_dh_ids(&self, dh_ids: &[String]) {
        let mut records = self.dh_ids.lock().unwrap_or_else(PoisonError::into_inner);
        for dh_id in dh_ids {
            if records.remove(dh_id).is_some() {
                debug!(dh_id = %dh_id, "removed dhid state");
            }
        }
    }

    /// Unknown ids are consumed locally.
    pub fn get_dh_id_state(&self, dh_id: &str) -> DhIdState {
        self.dh_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dh_id)
            .map_or(DhIdState::ThroughIn, |r| r.state)
    }

    fn session_for(&self, dh_id: &str) -> Option<String> {
        self.dh_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dh_id)
            .map(|r| r.session_id.clone())
    }

    // -- key-down table ---------------------------------------------------

    /// Whether any key is recorded down for the device.
    pub fn is_dh_id_down(&self, dh_id: &str) -> bool {
        self.key_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dh_id)
            .is_some_and(|keys| !keys.is_empty())
    }

    pub fn add_key_down_state(&self, event: &RawEvent) {
        let mut table = self.key_down.lock().unwrap_or_else(PoisonError::into_inner);
        let keys = table.entry(event.descriptor.clone()).or_default();
        if !keys.contains(event) {
            keys.push(event.clone());
        }
        trace!(dh_id = %event.descriptor, code = event.code, "key down");
    }

    pub fn remove_key_down_state(&self, event: &RawEvent) {
        let mut table = self.key_down.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(keys) = table.get_mut(&event.descriptor) {
            keys.retain(|k| k != event);
            if keys.is_empty() {
                table.remove(&event.descriptor);
            }
        }
        trace!(dh_id = %event.descriptor, code = event.code, "key up");
    }

    /// Move a repeating key to the end of its device's list.
    pub fn check_and_set_long_pressed_key_order(&self, event: &RawEvent) {
        let mut table = self.key_down.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(keys) = table.get_mut(&event.descriptor) else {
            return;
        };
        let Some(pos) = keys.iter().position(|k| k == event) else {
            return;
        };
        if pos + 1 != keys.len() {
            let key = keys.remove(pos);
            keys.push(key);
            trace!(dh_id = %event.descriptor, code = event.code, "long press moved to end");
        }
    }

    /// Keys held by a device, in press order.
    pub fn get_key_down_states(&self, dh_id: &str) -> Vec<RawEvent> {
        self.key_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dh_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_device_states(&self, dh_id: &str) {
        self.key_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dh_id);
        self.touchpad.clear(dh_id);
    }

    pub fn clear_all(&self) {
        self.key_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.touchpad.clear_all();
    }

    // -- classification ---------------------------------------------------

    /// Track one raw event from a physical device.
    pub fn handle_event(&self, event: &RawEvent, ctx: EventContext) {
        if event.is_key_down() {
            self.add_key_down_state(event);
        } else if event.is_key_up() {
            if ctx.is_cursor
                && event.code == BTN_MOUSE
                && !ctx.is_share
                && !self.is_dh_id_down(&event.descriptor)
            {
                debug!(dh_id = %event.descriptor, "mouse released without local press");
                self.simulate_to_remote(&event.descriptor, &mouse_up_sequence(event));
            }
            self.remove_key_down_state(event);
        } else if event.is_key_repeat() {
            self.check_and_set_long_pressed_key_order(event);
        }

        if ctx.is_touchpad {
            if let Some(events) = self.touchpad.push_event(event) {
                if !ctx.is_share {
                    self.simulate_to_remote(&event.descriptor, &events);
                }
            }
        }
    }

    fn simulate_to_remote(&self, dh_id: &str, events: &[RawEvent]) {
        let Some(session_id) = self.session_for(dh_id) else {
            debug!(dh_id, "no paired session, compensation skipped");
            return;
        };
        if let Err(e) = self.send_to_sink(&session_id, dh_id, events) {
            warn!(dh_id, error = %e, "compensation failed");
        }
    }

    fn send_to_sink(
        &self,
        session_id: &str,
        dh_id: &str,
        events: &[RawEvent],
    ) -> Result<(), InputError> {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(InputError::NoRemoteSink)?;
        sink.simulate_events(session_id, dh_id, events)
    }

    /// Release everything a device still holds on the paired side.
    ///
    /// Local state for the device is cleared even when delivery fails.
    pub fn simulate_event_inject_to_src(
        &self,
        session_id: &str,
        dh_id: &str,
    ) -> Result<usize, InputError> {
        // Contact keys of an unfinished touchpad gesture are released by
        // the touchpad sequence and skipped below.
        let mut events = self.touchpad.take_releases(dh_id);
        let lifted = events.clone();
        for key in self.get_key_down_states(dh_id) {
            if lifted.iter().any(|e| e.event_type == key.event_type && e.code == key.code) {
                continue;
            }
            events.extend(key_up_sequence(&key));
        }
        self.clear_device_states(dh_id);

        if events.is_empty() {
            return Ok(0);
        }
        info!(dh_id, session_id, count = events.len(), "releasing held input on peer");
        self.send_to_sink(session_id, dh_id, &events)?;
        Ok(events.len())
    }

    /// Forget a device that went away.
    ///
    /// A device routed to a peer has its held input released there first.
    pub fn release_device(&self, dh_id: &str) {
        if self.get_dh_id_state(dh_id) == DhIdState::ThroughOut {
            if let Some(session_id) = self.session_for(dh_id) {
                if let Err(e) = self.simulate_event_inject_to_src(&session_id, dh_id) {
                    warn!(dh_id, error = %e, "release of removed device failed");
                }
                return;
            }
        }
        self.clear_device_states(dh_id);
    }
}

fn key_up_sequence(key: &RawEvent) -> [RawEvent; 2] {
    [
        RawEvent {
            value: KEY_UP_STATE,
            ..key.clone()
        },
        RawEvent::new(EV_SYN, SYN_REPORT, 0).with_source(key.descriptor.clone(), key.path.clone()),
    ]
}

fn mouse_up_sequence(event: &RawEvent) -> [RawEvent; 2] {
    key_up_sequence(
        &RawEvent::new(EV_KEY, BTN_MOUSE, KEY_UP_STATE)
            .with_source(event.descriptor.clone(), event.path.clone())
            .with_when(event.when),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dinput_types::codes::{BTN_TOOL_FINGER, BTN_TOUCH, KEY_A, KEY_LEFTSHIFT};

    const DESC: &str = "Input_dev";
    const PATH: &str = "/dev/input/event4";

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, String, Vec<RawEvent>)>>,
    }

    impl RemoteStateSink for RecordingSink {
        fn simulate_events(
            &self,
            session_id: &str,
            dh_id: &str,
            events: &[RawEvent],
        ) -> Result<(), InputError> {
            self.calls.lock().unwrap().push((
                session_id.to_string(),
                dh_id.to_string(),
                events.to_vec(),
            ));
            Ok(())
        }
    }

    fn key(code: u16, value: i32) -> RawEvent {
        RawEvent::new(EV_KEY, code, value).with_source(DESC, PATH)
    }

    fn state_with_sink() -> (DInputState, Arc<RecordingSink>) {
        let state = DInputState::new();
        let sink = Arc::new(RecordingSink::default());
        state.set_remote_sink(sink.clone());
        state.record_dh_ids(&[DESC.to_string()], DhIdState::ThroughIn, "session-1");
        (state, sink)
    }

    #[test]
    fn down_then_up_clears_state() {
        let state = DInputState::new();
        let ctx = EventContext::default();
        state.handle_event(&key(KEY_A, 1), ctx);
        assert!(state.is_dh_id_down(DESC));
        state.handle_event(&key(KEY_A, 0), ctx);
        assert!(!state.is_dh_id_down(DESC));
    }

    #[test]
    fn repeat_moves_key_to_end() {
        let state = DInputState::new();
        state.add_key_down_state(&key(KEY_LEFTSHIFT, 1));
        state.add_key_down_state(&key(KEY_A, 1));
        state.handle_event(&key(KEY_LEFTSHIFT, 2), EventContext::default());
        let codes: Vec<u16> = state.get_key_down_states(DESC).iter().map(|e| e.code).collect();
        assert_eq!(codes, vec![KEY_A, KEY_LEFTSHIFT]);
    }

    #[test]
    fn duplicate_down_is_recorded_once() {
        let state = DInputState::new();
        state.add_key_down_state(&key(KEY_A, 1));
        state.add_key_down_state(&key(KEY_A, 1));
        assert_eq!(state.get_key_down_states(DESC).len(), 1);
    }

    #[test]
    fn unseen_mouse_release_is_compensated() {
        let (state, sink) = state_with_sink();
        let ctx = EventContext {
            is_cursor: true,
            ..EventContext::default()
        };
        state.handle_event(&key(BTN_MOUSE, 0), ctx);
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "session-1");
        assert_eq!(calls[0].2[0].code, BTN_MOUSE);
        assert_eq!(calls[0].2[0].value, 0);
        assert!(calls[0].2[1].is_sync_report());
    }

    #[test]
    fn seen_or_shared_mouse_release_is_not_compensated() {
        let (state, sink) = state_with_sink();
        let ctx = EventContext {
            is_cursor: true,
            ..EventContext::default()
        };
        state.handle_event(&key(BTN_MOUSE, 1), ctx);
        state.handle_event(&key(BTN_MOUSE, 0), ctx);

        let shared = EventContext {
            is_share: true,
            ..ctx
        };
        state.handle_event(&key(BTN_MOUSE, 0), shared);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn partial_touchpad_gesture_is_compensated() {
        let (state, sink) = state_with_sink();
        let ctx = EventContext {
            is_touchpad: true,
            ..EventContext::default()
        };
        state.handle_event(&key(BTN_TOUCH, 0), ctx);
        state.handle_event(
            &RawEvent::new(EV_SYN, SYN_REPORT, 0).with_source(DESC, PATH),
            ctx,
        );
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn dh_id_states() {
        let state = DInputState::new();
        assert_eq!(state.get_dh_id_state(DESC), DhIdState::ThroughIn);
        state.record_dh_ids(&[DESC.to_string()], DhIdState::ThroughOut, "s");
        assert_eq!(state.get_dh_id_state(DESC), DhIdState::ThroughOut);
        state.remove_dh_ids(&[DESC.to_string()]);
        assert_eq!(state.get_dh_id_state(DESC), DhIdState::ThroughIn);
    }

    #[test]
    fn inject_to_src_releases_held_keys() {
        let (state, sink) = state_with_sink();
        state.add_key_down_state(&key(KEY_LEFTSHIFT, 1));
        state.add_key_down_state(&key(KEY_A, 1));
        let sent = state.simulate_event_inject_to_src("session-9", DESC).unwrap();
        assert_eq!(sent, 4);
        assert!(!state.is_dh_id_down(DESC));

        let calls = sink.calls.lock().unwrap();
        let events = &calls[0].2;
        assert_eq!(calls[0].0, "session-9");
        assert_eq!(events[0].code, KEY_LEFTSHIFT);
        assert_eq!(events[0].value, 0);
        assert_eq!(events[2].code, KEY_A);
    }

    #[test]
    fn inject_to_src_lifts_touchpad_contact() {
        let (state, sink) = state_with_sink();
        let ctx = EventContext {
            is_touchpad: true,
            ..EventContext::default()
        };
        let syn = RawEvent::new(EV_SYN, SYN_REPORT, 0).with_source(DESC, PATH);
        for event in [key(BTN_TOUCH, 1), key(BTN_TOOL_FINGER, 1), syn.clone()] {
            state.handle_event(&event, ctx);
        }

        state.simulate_event_inject_to_src("session-1", DESC).unwrap();
        let calls = sink.calls.lock().unwrap();
        let events = &calls[0].2;
        assert!(events.iter().all(|e| e.event_type != EV_KEY || e.value == 0));
        let last_touch = events.iter().rev().find(|e| e.code == BTN_TOUCH).map(|e| e.value);
        assert_eq!(last_touch, Some(0));
        assert_eq!(events.iter().filter(|e| e.code == BTN_TOUCH).count(), 1);
        assert!(events.last().unwrap().is_sync_report());
        assert_eq!(state.touchpad().fragment_count(DESC), 0);
    }

    #[test]
    fn removed_device_releases_keys_on_peer() {
        let (state, sink) = state_with_sink();
        state.add_key_down_state(&key(KEY_A, 1));
        state.release_device(DESC);
        assert!(!state.is_dh_id_down(DESC));
        // Routed locally: nothing to release remotely.
        assert!(sink.calls.lock().unwrap().is_empty());

        state.record_dh_ids(&[DESC.to_string()], DhIdState::ThroughOut, "session-2");
        state.add_key_down_state(&key(KEY_A, 1));
        state.release_device(DESC);
        assert!(!state.is_dh_id_down(DESC));
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "session-2");
        assert_eq!(calls[0].2[0].code, KEY_A);
        assert_eq!(calls[0].2[0].value, 0);
    }

    #[test]
    fn inject_to_src_without_sink_still_clears() {
        let state = DInputState::new();
        state.add_key_down_state(&key(KEY_A, 1));
        let result = state.simulate_event_inject_to_src("s", DESC);
        assert!(matches!(result, Err(InputError::NoRemoteSink)));
        assert!(!state.is_dh_id_down(DESC));
        assert_eq!(state.simulate_event_inject_to_src("s", DESC).unwrap(), 0);
    }
}
