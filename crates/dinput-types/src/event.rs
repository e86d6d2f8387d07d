//! The flattened raw kernel input event.

use std::hash::{Hash, Hasher};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::codes::{
    EV_KEY, EV_SYN, KEY_DOWN_STATE, KEY_REPEAT_STATE, KEY_UP_STATE, SYN_REPORT,
};

/// A kernel `input_event` tagged with the device it came from.
///
/// Equality and hashing deliberately ignore `when` and `value`: two events
/// are equal when they share `(event_type, code, descriptor, path)`. The
/// key-down table relies on this to cancel a recorded press with its release.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Encode, Decode)]
pub struct RawEvent {
    /// Kernel timestamp in nanoseconds.
    pub when: i64,
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
    /// Stable descriptor (dhId) of the source device.
    pub descriptor: String,
    /// Device node path of the source device.
    pub path: String,
}

impl RawEvent {
    pub fn new(event_type: u16, code: u16, value: i32) -> Self {
        Self {
            event_type,
            code,
            value,
            ..Self::default()
        }
    }

    /// Tag the event with the device it belongs to.
    #[must_use]
    pub fn with_source(mut self, descriptor: impl Into<String>, path: impl Into<String>) -> Self {
        self.descriptor = descriptor.into();
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn with_when(mut self, when: i64) -> Self {
        self.when = when;
        self
    }

    pub fn is_key(&self) -> bool {
        self.event_type == EV_KEY
    }

    pub fn is_key_down(&self) -> bool {
        self.is_key() && self.value == KEY_DOWN_STATE
    }

    pub fn is_key_up(&self) -> bool {
        self.is_key() && self.value == KEY_UP_STATE
    }

    pub fn is_key_repeat(&self) -> bool {
        self.is_key() && self.value == KEY_REPEAT_STATE
    }

    pub fn is_sync_report(&self) -> bool {
        self.event_type == EV_SYN && self.code == SYN_REPORT
    }
}

impl PartialEq for RawEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_type == other.event_type
            && self.code == other.code
            && self.descriptor == other.descriptor
            && self.path == other.path
    }
}

impl Eq for RawEvent {}

impl Hash for RawEvent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.event_type.hash(state);
        self.code.hash(state);
        self.descriptor.hash(state);
        self.path.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::codes::{BTN_MOUSE, EV_REL, KEY_A, REL_X};

    #[test]
    fn equality_ignores_value_and_timestamp() {
        let down = RawEvent::new(EV_KEY, KEY_A, 1)
            .with_source("Input_abc", "/dev/input/event3")
            .with_when(100);
        let up = RawEvent::new(EV_KEY, KEY_A, 0)
            .with_source("Input_abc", "/dev/input/event3")
            .with_when(9_000);
        assert_eq!(down, up);

        let mut set = HashSet::new();
        set.insert(down);
        assert!(set.contains(&up));
    }

    #[test]
    fn equality_respects_identity_fields() {
        let base = RawEvent::new(EV_KEY, BTN_MOUSE, 1).with_source("Input_a", "/dev/input/event1");
        assert_ne!(
            base,
            RawEvent::new(EV_KEY, BTN_MOUSE, 1).with_source("Input_b", "/dev/input/event1")
        );
        assert_ne!(
            base,
            RawEvent::new(EV_KEY, BTN_MOUSE, 1).with_source("Input_a", "/dev/input/event2")
        );
        assert_ne!(
            base,
            RawEvent::new(EV_REL, BTN_MOUSE, 1).with_source("Input_a", "/dev/input/event1")
        );
    }

    #[test]
    fn key_edge_predicates() {
        assert!(RawEvent::new(EV_KEY, KEY_A, 1).is_key_down());
        assert!(RawEvent::new(EV_KEY, KEY_A, 0).is_key_up());
        assert!(RawEvent::new(EV_KEY, KEY_A, 2).is_key_repeat());
        assert!(!RawEvent::new(EV_REL, REL_X, 1).is_key_down());
        assert!(RawEvent::new(EV_SYN, SYN_REPORT, 0).is_sync_report());
    }
}
