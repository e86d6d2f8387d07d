//! Shared types for dinput.
//!
//! This crate contains all types shared across the dinput workspace: the
//! flattened raw kernel event, device identities and capability lists,
//! sharing-state bookkeeping, and the screen projection records used for
//! touch redirection.

pub mod codes;
pub mod device;
pub mod event;
pub mod screen;
pub mod sharing;

pub use device::{
    AbsAxisInfo, Capabilities, DeviceClass, DeviceClasses, InputDevice, InputDeviceEvent,
    InputType, InputTypes,
};
pub use event::RawEvent;
pub use screen::{screen_info_key, ScreenError, SinkScreenInfo, SrcScreenInfo, TransformInfo};
pub use sharing::{AffectDhIds, DhIdState};
