//! Key combinations that are never forwarded.
//!
//! While a keyboard is shared, a key press completing one of the configured
//! combinations is kept on this machine. The press, its repeats and its
//! release are all dropped from the forwarded stream.

use std::collections::{HashMap, HashSet};

use dinput_types::codes::EV_KEY;
use dinput_types::RawEvent;
use tracing::{debug, info};

use crate::config::WhiteListConfig;
use crate::error::DaemonError;

/// Longest combination accepted.
pub const MAX_COMBINATION_KEYS: usize = 4;

#[derive(Debug, Default)]
pub struct WhiteList {
    /// Each entry sorted and free of duplicates.
    combinations: Vec<Vec<u16>>,
    /// Keys held per descriptor, in press order.
    held: HashMap<String, Vec<u16>>,
    /// Keys whose events are being consumed, per descriptor.
    consumed: HashMap<String, HashSet<u16>>,
}

impl WhiteList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &WhiteListConfig) -> Result<Self, DaemonError> {
        let mut list = Self::new();
        for keys in &config.combinations {
            list.add_combination(keys)?;
        }
        Ok(list)
    }

    pub fn add_combination(&mut self, keys: &[u16]) -> Result<(), DaemonError> {
        let mut combination = keys.to_vec();
        combination.sort_unstable();
        combination.dedup();
        if combination.is_empty() {
            return Err(DaemonError::Config("empty key combination".to_string()));
        }
        if combination.len() > MAX_COMBINATION_KEYS {
            return Err(DaemonError::CombinationTooLong(combination.len()));
        }
        if !self.combinations.contains(&combination) {
            info!(keys = ?combination, "whitelisted key combination");
            self.combinations.push(combination);
        }
        Ok(())
    }

    pub fn combinations(&self) -> &[Vec<u16>] {
        &self.combinations
    }

    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    fn completes_combination(&self, held: &[u16]) -> bool {
        let mut pressed = held.to_vec();
        pressed.sort_unstable();
        pressed.dedup();
        self.combinations.iter().any(|c| *c == pressed)
    }

    /// Whether `event` must stay local. Updates the held-key view.
    pub fn is_need_filter_out(&mut self, event: &RawEvent) -> bool {
        if event.event_type != EV_KEY {
            return false;
        }
        let descriptor = event.descriptor.as_str();

        if event.is_key_down() {
            let held = self.held.entry(descriptor.to_string()).or_default();
            if !held.contains(&event.code) {
                held.push(event.code);
            }
            let held = held.clone();
            if self.completes_combination(&held) {
                debug!(descriptor, code = event.code, "key combination kept local");
                self.consumed
                    .entry(descriptor.to_string())
                    .or_default()
                    .insert(event.code);
                return true;
            }
            return false;
        }

        let consumed = self
            .consumed
            .get(descriptor)
            .is_some_and(|codes| codes.contains(&event.code));

        if event.is_key_up() {
            if let Some(held) = self.held.get_mut(descriptor) {
                held.retain(|&c| c != event.code);
            }
            if let Some(codes) = self.consumed.get_mut(descriptor) {
                codes.remove(&event.code);
            }
        }
        consumed
    }

    /// Drop the events that must stay local.
    ///
    /// A sync report is dropped too when every event of its frame was.
    pub fn filter(&mut self, events: Vec<RawEvent>) -> Vec<RawEvent> {
        if self.combinations.is_empty() {
            return events;
        }
        let mut kept = Vec::with_capacity(events.len());
        let mut frame_dropped = false;
        let mut frame_kept = false;
        for event in events {
            if event.is_sync_report() {
                if frame_kept || !frame_dropped {
                    kept.push(event);
                }
                frame_dropped = false;
                frame_kept = false;
            } else if self.is_need_filter_out(&event) {
                frame_dropped = true;
            } else {
                frame_kept = true;
                kept.push(event);
            }
        }
        kept
    }

    /// Forget what a device holds, once it stops being shared.
    pub fn forget(&mut self, descriptor: &str) {
        self.held.remove(descriptor);
        self.consumed.remove(descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dinput_types::codes::{
        EV_SYN, KEY_A, KEY_DELETE, KEY_LEFTALT, KEY_LEFTCTRL, KEY_LEFTSHIFT, SYN_REPORT,
    };

    const KB: &str = "Input_kb";

    fn key(code: u16, value: i32) -> RawEvent {
        RawEvent::new(EV_KEY, code, value).with_source(KB, "/dev/input/event0")
    }

    fn syn() -> RawEvent {
        RawEvent::new(EV_SYN, SYN_REPORT, 0).with_source(KB, "/dev/input/event0")
    }

    fn ctrl_alt_del() -> WhiteList {
        let mut list = WhiteList::new();
        list.add_combination(&[KEY_LEFTCTRL, KEY_LEFTALT, KEY_DELETE])
            .unwrap();
        list
    }

    #[test]
    fn combinations_longer_than_four_are_rejected() {
        let mut list = WhiteList::new();
        let err = list
            .add_combination(&[KEY_LEFTCTRL, KEY_LEFTALT, KEY_LEFTSHIFT, KEY_A, KEY_DELETE])
            .unwrap_err();
        assert!(matches!(err, DaemonError::CombinationTooLong(5)));
        assert!(list.is_empty());

        // Duplicates do not count twice.
        list.add_combination(&[KEY_A, KEY_A, KEY_LEFTCTRL, KEY_LEFTALT, KEY_DELETE])
            .unwrap();
        assert_eq!(list.combinations().len(), 1);
    }

    #[test]
    fn empty_combination_is_rejected() {
        assert!(matches!(
            WhiteList::new().add_combination(&[]),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn completing_key_is_consumed_with_its_release() {
        let mut list = ctrl_alt_del();
        assert!(!list.is_need_filter_out(&key(KEY_LEFTCTRL, 1)));
        assert!(!list.is_need_filter_out(&key(KEY_LEFTALT, 1)));
        assert!(list.is_need_filter_out(&key(KEY_DELETE, 1)));
        assert!(list.is_need_filter_out(&key(KEY_DELETE, 2)));
        assert!(list.is_need_filter_out(&key(KEY_DELETE, 0)));
        assert!(!list.is_need_filter_out(&key(KEY_LEFTALT, 0)));
        assert!(!list.is_need_filter_out(&key(KEY_LEFTCTRL, 0)));

        // Once released, the key travels again.
        assert!(!list.is_need_filter_out(&key(KEY_DELETE, 1)));
    }

    #[test]
    fn partial_or_extra_keys_do_not_match() {
        let mut list = ctrl_alt_del();
        assert!(!list.is_need_filter_out(&key(KEY_LEFTCTRL, 1)));
        assert!(!list.is_need_filter_out(&key(KEY_DELETE, 1)));

        let mut list = ctrl_alt_del();
        for code in [KEY_LEFTSHIFT, KEY_LEFTCTRL, KEY_LEFTALT, KEY_DELETE] {
            assert!(!list.is_need_filter_out(&key(code, 1)));
        }
    }

    #[test]
    fn filter_drops_emptied_frames() {
        let mut list = ctrl_alt_del();
        let batch = vec![
            key(KEY_LEFTCTRL, 1),
            syn(),
            key(KEY_LEFTALT, 1),
            syn(),
            key(KEY_DELETE, 1),
            syn(),
        ];
        let kept = list.filter(batch);
        assert_eq!(kept.len(), 4);
        assert!(kept.iter().all(|e| e.code != KEY_DELETE || e.is_sync_report()));
    }

    #[test]
    fn forget_clears_held_keys() {
        let mut list = ctrl_alt_del();
        list.is_need_filter_out(&key(KEY_LEFTCTRL, 1));
        list.is_need_filter_out(&key(KEY_LEFTALT, 1));
        list.forget(KB);
        assert!(!list.is_need_filter_out(&key(KEY_DELETE, 1)));
    }
}
