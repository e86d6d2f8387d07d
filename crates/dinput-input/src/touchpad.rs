//! Touchpad gesture fragment reassembly.
//!
//! A touchpad gesture spans many sync reports. If sharing toggles in the
//! middle of one, the side that saw the contact go down never sees it lift.
//! Fragments are kept per device until the contact is released; a release
//! whose gesture never started on this side yields the events that must be
//! replayed to the paired side.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use dinput_types::codes::{
    is_position_axis, BTN_TOUCH, EV_ABS, EV_KEY, EV_SYN, KEY_UP_STATE, SYN_REPORT,
};
use dinput_types::RawEvent;
use tracing::trace;

/// Events between two sync reports.
#[derive(Debug, Clone, Default)]
struct Fragment {
    events: Vec<RawEvent>,
}

impl Fragment {
    fn has_touch(&self, value: i32) -> bool {
        self.events
            .iter()
            .any(|e| e.event_type == EV_KEY && e.code == BTN_TOUCH && e.value == value)
    }

    /// Contact went down in this fragment.
    fn is_start(&self) -> bool {
        self.has_touch(1)
    }

    /// Contact lifted in this fragment.
    fn is_finish(&self) -> bool {
        self.has_touch(0)
    }

    /// Fragments that neither start nor end a gesture carry no state.
    fn should_drop(&self) -> bool {
        !self.is_start() && !self.is_finish()
    }
}

/// Per-device fragment lists.
#[derive(Debug, Default)]
pub struct TouchpadFragmentManager {
    fragments: Mutex<HashMap<String, Vec<Fragment>>>,
}

impl TouchpadFragmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one touchpad event.
    ///
    /// Returns the events to replay on the paired side when a gesture ends
    /// that was never seen starting here.
    pub fn push_event(&self, event: &RawEvent) -> Option<Vec<RawEvent>> {
        if event.event_type == EV_ABS && is_position_axis(event.code) {
            return None;
        }

        let mut all = self.fragments.lock().unwrap_or_else(PoisonError::into_inner);
        let fragments = all.entry(event.descriptor.clone()).or_default();
        if fragments.is_empty() {
            fragments.push(Fragment::default());
        }
        if let Some(last) = fragments.last_mut() {
            last.events.push(event.clone());
        }

        if !event.is_sync_report() {
            return None;
        }

        let (last_finishes, last_drops) = fragments
            .last()
            .map_or((false, false), |f| (f.is_finish(), f.should_drop()));

        if last_finishes {
            let partial = fragments.first().is_some_and(|f| !f.is_start());
            let replay = partial.then(|| {
                fragments
                    .iter()
                    .flat_map(|f| f.events.iter().cloned())
                    .collect::<Vec<_>>()
            });
            fragments.clear();
            fragments.push(Fragment::default());
            if let Some(events) = &replay {
                trace!(
                    descriptor = %event.descriptor,
                    count = events.len(),
                    "partial touchpad gesture finished"
                );
            }
            return replay.filter(|events| !events.is_empty());
        }

        if last_drops {
            fragments.pop();
        }
        fragments.push(Fragment::default());
        None
    }

    /// Drop a device's fragments and return releases for every contact key
    /// still pressed in them, closed by a sync report.
    pub fn take_releases(&self, descriptor: &str) -> Vec<RawEvent> {
        let Some(fragments) = self
            .fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(descriptor)
        else {
            return Vec::new();
        };

        let mut held: Vec<RawEvent> = Vec::new();
        for event in fragments.iter().flat_map(|f| &f.events) {
            if event.event_type != EV_KEY {
                continue;
            }
            held.retain(|k| k.code != event.code);
            if event.value != KEY_UP_STATE {
                held.push(event.clone());
            }
        }

        let Some(source) = held.first().map(|k| (k.descriptor.clone(), k.path.clone())) else {
            return Vec::new();
        };
        let mut releases: Vec<RawEvent> = held
            .into_iter()
            .map(|key| RawEvent {
                value: KEY_UP_STATE,
                ..key
            })
            .collect();
        releases.push(RawEvent::new(EV_SYN, SYN_REPORT, 0).with_source(source.0, source.1));
        trace!(descriptor, count = releases.len(), "touchpad contact released");
        releases
    }

    pub fn clear(&self, descriptor: &str) {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(descriptor);
    }

    pub fn clear_all(&self) {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of fragments currently kept for a device.
    pub fn fragment_count(&self, descriptor: &str) -> usize {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(descriptor)
            .map_or(0, Vec::len)
    }
}
