//! Touchscreen coordinate remapping onto projected source windows.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dinput_types::codes::{ABS_MT_POSITION_X, ABS_MT_POSITION_Y, ABS_X, ABS_Y, EV_ABS};
use dinput_types::{screen_info_key, RawEvent, SinkScreenInfo};
use tracing::{debug, info, trace};

use crate::error::InputError;

/// Sink screens with a source window projected onto them.
#[derive(Debug, Default)]
pub struct ScreenRegistry {
    screens: RwLock<BTreeMap<String, SinkScreenInfo>>,
}

impl ScreenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record, recomputing its transform. Returns the key.
    pub fn update(&self, mut info: SinkScreenInfo) -> Result<String, InputError> {
        info.update_transform()?;
        let key = screen_info_key(
            &info.src_screen_info.dev_id,
            info.src_screen_info.source_win_id,
        );
        info!(
            key = %key,
            x = info.transform.sink_win_phy_x,
            y = info.transform.sink_win_phy_y,
            width = info.transform.sink_proj_phy_width,
            height = info.transform.sink_proj_phy_height,
            "updated sink screen"
        );
        self.screens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), info);
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Option<SinkScreenInfo> {
        self.screens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<SinkScreenInfo> {
        self.screens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn all(&self) -> Vec<SinkScreenInfo> {
        self.screens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.screens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_empty(&self) -> bool {
        self.screens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Result of filtering one read cycle of touch events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Parallel to the input; `true` entries must not be forwarded.
    pub excluded: Vec<bool>,
    /// `source_phy_id` of the screen the last accepted touch landed on.
    pub touch_descriptor: Option<String>,
}

impl FilterOutcome {
    pub fn excluded_count(&self) -> usize {
        self.excluded.iter().filter(|e| **e).count()
    }
}

fn is_x(event: &RawEvent) -> bool {
    event.event_type == EV_ABS && (event.code == ABS_X || event.code == ABS_MT_POSITION_X)
}

fn is_y(event: &RawEvent) -> bool {
    event.event_type == EV_ABS && (event.code == ABS_Y || event.code == ABS_MT_POSITION_Y)
}

/// Split a batch into `[first_position_index, syn_index]` ranges.
///
/// A fragment opens at the first X or Y event after a sync report and closes
/// at the next sync report. Events outside any fragment pass through
/// untouched. Callers hand over whole reports only.
fn fragments(events: &[RawEvent]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = None;
    for (i, event) in events.iter().enumerate() {
        if is_x(event) || is_y(event) {
            start.get_or_insert(i);
        } else if event.is_sync_report() {
            if let Some(first) = start.take() {
                ranges.push((first, i));
            }
        }
    }
    ranges
}

/// Crops and rescales absolute touch coordinates to the projected window.
///
/// A report that moves along one axis only is judged with the other axis
/// at its last raw position on the same device.
#[derive(Debug)]
pub struct TouchRemapper {
    screens: Arc<ScreenRegistry>,
    /// Last raw `(x, y)` seen per device path.
    last_position: Mutex<HashMap<String, (Option<i32>, Option<i32>)>>,
}

impl TouchRemapper {
    pub fn new(screens: Arc<ScreenRegistry>) -> Self {
        Self {
            screens,
            last_position: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the last position of a device.
    pub fn forget(&self, path: &str) {
        self.last_position
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    pub fn screens(&self) -> &Arc<ScreenRegistry> {
        &self.screens
    }

    /// Rewrite in-region touch reports in place and flag the rest.
    pub fn filter(&self, events: &mut [RawEvent]) -> FilterOutcome {
        let mut outcome = FilterOutcome {
            excluded: vec![false; events.len()],
            touch_descriptor: None,
        };
        let screens = self.screens.all();
        let mut last_position = self
            .last_position
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for (first, last) in fragments(events) {
            let fragment = &events[first..=last];
            let known = last_position.entry(fragment[0].path.clone()).or_default();
            if let Some(x) = fragment.iter().rev().find(|e| is_x(e)) {
                known.0 = Some(x.value);
            }
            if let Some(y) = fragment.iter().rev().find(|e| is_y(e)) {
                known.1 = Some(y.value);
            }
            let (x, y) = *known;

            let accepted = match (x, y) {
                (Some(x), Some(y)) => screens
                    .iter()
                    .find(|s| s.transform.contains(x, y)),
                _ => {
                    trace!(first, last, "touch report without both axes");
                    None
                }
            };

            let Some(screen) = accepted else {
                debug!(first, last, ?x, ?y, "touch report outside every projection");
                outcome.excluded[first..=last].fill(true);
                continue;
            };

            for event in &mut events[first..=last] {
                if is_x(event) {
                    event.value = screen.transform.map_x(event.value);
                } else if is_y(event) {
                    event.value = screen.transform.map_y(event.value);
                }
            }
            outcome.touch_descriptor = Some(screen.src_screen_info.source_phy_id.clone());
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dinput_types::codes::{ABS_MT_SLOT, BTN_TOUCH, EV_KEY, EV_SYN, SYN_REPORT};
    use dinput_types::SrcScreenInfo;

    fn screen(dev_id: &str, win_x: u32, source_phy_id: &str) -> SinkScreenInfo {
        // Show and physical sizes are equal, so show coordinates are physical.
        SinkScreenInfo {
            sink_show_width: 1000,
            sink_show_height: 1000,
            sink_phy_width: 1000,
            sink_phy_height: 1000,
            sink_proj_show_width: 100,
            sink_proj_show_height: 100,
            sink_win_show_x: win_x,
            sink_win_show_y: 0,
            src_screen_info: SrcScreenInfo {
                dev_id: dev_id.to_string(),
                source_win_id: 1,
                source_phy_id: source_phy_id.to_string(),
                source_phy_width: 200,
                source_phy_height: 200,
                ..SrcScreenInfo::default()
            },
            ..SinkScreenInfo::default()
        }
    }

    fn remapper() -> TouchRemapper {
        let registry = Arc::new(ScreenRegistry::new());
        registry.update(screen("peer", 100, "Input_src")).unwrap();
        TouchRemapper::new(registry)
    }

    fn abs(code: u16, value: i32) -> RawEvent {
        RawEvent::new(EV_ABS, code, value)
    }

    fn syn() -> RawEvent {
        RawEvent::new(EV_SYN, SYN_REPORT, 0)
    }

    #[test]
    fn origin_is_included() {
        let mut events = vec![abs(ABS_MT_POSITION_X, 100), abs(ABS_MT_POSITION_Y, 0), syn()];
        let outcome = remapper().filter(&mut events);
        assert_eq!(outcome.excluded_count(), 0);
        assert_eq!(events[0].value, 0);
        assert_eq!(events[1].value, 0);
        assert_eq!(outcome.touch_descriptor.as_deref(), Some("Input_src"));
    }

    #[test]
    fn far_edge_is_included_and_beyond_is_excluded() {
        let r = remapper();
        let mut inside = vec![abs(ABS_X, 200), abs(ABS_Y, 100), syn()];
        assert_eq!(r.filter(&mut inside).excluded_count(), 0);
        assert_eq!(inside[0].value, 200);
        assert_eq!(inside[1].value, 200);

        let mut outside = vec![abs(ABS_X, 201), abs(ABS_Y, 0), syn()];
        let outcome = r.filter(&mut outside);
        assert_eq!(outcome.excluded, vec![true, true, true]);
        assert!(outcome.touch_descriptor.is_none());
        assert_eq!(outside[0].value, 201);
    }

    #[test]
    fn missing_axis_excludes_fragment() {
        let r = remapper();
        let mut x_only = vec![abs(ABS_MT_POSITION_X, 120), syn()];
        assert_eq!(r.filter(&mut x_only).excluded, vec![true, true]);

        let r = remapper();
        let mut y_only = vec![abs(ABS_MT_POSITION_Y, 20), syn()];
        assert_eq!(r.filter(&mut y_only).excluded, vec![true, true]);
        assert_eq!(y_only[0].value, 20);
    }

    #[test]
    fn events_outside_fragments_pass_through() {
        let mut events = vec![
            RawEvent::new(EV_KEY, BTN_TOUCH, 1),
            abs(ABS_MT_SLOT, 0),
            abs(ABS_MT_POSITION_X, 150),
            abs(ABS_MT_POSITION_Y, 50),
            syn(),
        ];
        let outcome = remapper().filter(&mut events);
        assert_eq!(outcome.excluded, vec![false; 5]);
        assert_eq!(events[0].value, 1);
        assert_eq!(events[2].value, 100);
        assert_eq!(events[3].value, 100);
    }

    #[test]
    fn single_axis_report_uses_last_position() {
        let r = remapper();
        let mut events = vec![
            abs(ABS_MT_POSITION_X, 150),
            abs(ABS_MT_POSITION_Y, 50),
            syn(),
            abs(ABS_MT_POSITION_Y, 60),
            syn(),
        ];
        assert_eq!(r.filter(&mut events).excluded_count(), 0);
        assert_eq!(events[3].value, 120);

        // Moving down out of the window along Y alone.
        let mut below = vec![abs(ABS_MT_POSITION_Y, 400), syn()];
        assert_eq!(r.filter(&mut below).excluded, vec![true, true]);
        assert_eq!(below[0].value, 400);

        // Y before X in one report.
        let mut swapped = vec![abs(ABS_MT_POSITION_Y, 10), abs(ABS_MT_POSITION_X, 110), syn()];
        assert_eq!(r.filter(&mut swapped).excluded_count(), 0);
        assert_eq!((swapped[0].value, swapped[1].value), (20, 20));

        r.forget("");
        let mut forgotten = vec![abs(ABS_MT_POSITION_Y, 10), syn()];
        assert_eq!(r.filter(&mut forgotten).excluded_count(), 2);
    }

    #[test]
    fn each_fragment_is_judged_alone() {
        let mut events = vec![
            abs(ABS_X, 150),
            abs(ABS_Y, 50),
            syn(),
            abs(ABS_X, 900),
            abs(ABS_Y, 50),
            syn(),
        ];
        let outcome = remapper().filter(&mut events);
        assert_eq!(outcome.excluded, vec![false, false, false, true, true, true]);
    }

    #[test]
    fn second_screen_is_tried() {
        let registry = Arc::new(ScreenRegistry::new());
        registry.update(screen("a", 100, "Input_a")).unwrap();
        registry.update(screen("b", 500, "Input_b")).unwrap();
        let r = TouchRemapper::new(registry);
        let mut events = vec![abs(ABS_X, 550), abs(ABS_Y, 10), syn()];
        let outcome = r.filter(&mut events);
        assert_eq!(outcome.excluded_count(), 0);
        assert_eq!(outcome.touch_descriptor.as_deref(), Some("Input_b"));
        assert_eq!(events[0].value, 100);
    }

    #[test]
    fn no_screens_excludes_everything_in_fragments() {
        let r = TouchRemapper::new(Arc::new(ScreenRegistry::new()));
        let mut events = vec![abs(ABS_X, 1), abs(ABS_Y, 1), syn()];
        assert_eq!(r.filter(&mut events).excluded_count(), 3);
    }

    #[test]
    fn registry_crud() {
        let registry = ScreenRegistry::new();
        let key = registry.update(screen("peer", 0, "Input_src")).unwrap();
        assert_eq!(key, "peer###1");
        assert!(registry.get(&key).is_some());
        assert_eq!(registry.all().len(), 1);

        let mut bad = screen("peer", 0, "Input_src");
        bad.sink_show_width = 0;
        assert!(matches!(registry.update(bad), Err(InputError::ScreenInfo(_))));

        assert!(registry.remove(&key).is_some());
        assert!(registry.is_empty());
        registry.update(screen("peer", 0, "Input_src")).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
