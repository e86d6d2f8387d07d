//! Input capture, event routing and virtual device injection for dinput.
//!
//! The [`InputHub`] enumerates kernel input devices, multiplexes their
//! descriptors and hands raw events of shared devices to the caller, while
//! [`DInputState`] keeps track of what each device holds down so that
//! routing changes never leave a key stuck on either side. On the receiving
//! side, [`VirtualDeviceManager`] recreates remote devices through uinput and
//! replays their events.
//!
//! All kernel access goes through the traits in [`backend`] and
//! [`virtual_device`]; the evdev/epoll/inotify implementation is behind the
//! `linux` feature and an in-memory one behind `mock`.

pub mod backend;
pub mod device;
pub mod enumerator;
pub mod error;
pub mod hub;
pub mod remap;
pub mod state;
pub mod touchpad;
pub mod virtual_device;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backend::{DeviceNode, InputBackend, NodeWatcher, Readiness};
pub use enumerator::{generate_descriptor, TouchpadMatcher, VIRTUAL_DEVICE_NAME_MARKER};
pub use error::InputError;
pub use hub::{HubConfig, HubMode, InputHub};
pub use remap::{ScreenRegistry, TouchRemapper};
pub use state::{DInputState, RemoteStateSink};
pub use touchpad::TouchpadFragmentManager;
pub use virtual_device::{UinputBackend, VirtualDevice, VirtualDeviceManager};
