//! Platform seam between the input hub and the kernel.
//!
//! The hub never touches device nodes directly. It talks to an
//! [`InputBackend`], which hands out [`DeviceNode`]s, a [`Readiness`]
//! context to multiplex them, and a [`NodeWatcher`] for the device
//! directory. The evdev/epoll/inotify implementation lives in
//! [`crate::linux`]; tests use [`crate::mock`].

use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dinput_types::Capabilities;

/// `ENODEV`: the device node went away underneath an open fd.
#[cfg(feature = "linux")]
pub const ENODEV: i32 = nix::errno::Errno::ENODEV as i32;

/// `ENODEV`: the device node went away underneath an open fd.
///
/// Builds without the `linux` feature have no errno table; this is the
/// Linux value, matched by the mock backend.
#[cfg(not(feature = "linux"))]
pub const ENODEV: i32 = 19;

/// Token the hub uses for the directory watcher in the readiness context.
pub const WATCHER_TOKEN: u64 = u64::MAX;

/// One kernel `input_event` record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelEvent {
    /// Timestamp in nanoseconds.
    pub when: i64,
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

impl KernelEvent {
    pub fn new(event_type: u16, code: u16, value: i32) -> Self {
        Self {
            when: 0,
            event_type,
            code,
            value,
        }
    }
}

/// Bus/vendor/product/version tuple (`struct input_id`) plus driver version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceIdentifiers {
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub driver_version: u32,
}

/// Something whose descriptor can be registered with a [`Readiness`] context.
pub trait PollSource {
    /// Descriptor to wait on, if the source is backed by one.
    fn poll_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// An open input device node.
pub trait DeviceNode: PollSource + Send {
    fn name(&self) -> Option<String>;

    fn identifiers(&self) -> io::Result<DeviceIdentifiers>;

    fn physical_path(&self) -> Option<String>;

    fn unique_id(&self) -> Option<String>;

    fn capabilities(&self) -> io::Result<Capabilities>;

    /// Append up to `max` pending events to `out`.
    ///
    /// Returns the number appended. `WouldBlock` means nothing is pending;
    /// an error with [`ENODEV`] or `UnexpectedEof` means the device is gone.
    fn read_events(&mut self, out: &mut Vec<KernelEvent>, max: usize) -> io::Result<usize>;

    /// Codes of every key currently held down, straight from the kernel.
    fn key_state(&self) -> io::Result<Vec<u16>>;

    /// Whether events are buffered in user space beyond what the fd reports.
    fn has_pending(&self) -> bool {
        false
    }
}

/// What a registration should wake up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    /// Only hang-up and error conditions.
    HangupOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: u64,
    pub readable: bool,
    pub hangup: bool,
}

/// A readiness-notification context (epoll on Linux).
pub trait Readiness: Send + Sync {
    fn register(&self, token: u64, fd: Option<BorrowedFd<'_>>, interest: Interest)
        -> io::Result<()>;

    fn deregister(&self, token: u64, fd: Option<BorrowedFd<'_>>) -> io::Result<()>;

    /// Block up to `timeout` and append ready registrations to `out`.
    fn wait(&self, out: &mut Vec<ReadyEvent>, timeout: Duration) -> io::Result<usize>;
}

/// A change observed in the device directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeChange {
    Created(PathBuf),
    Removed(PathBuf),
}

/// Watches a device directory for node creation and removal.
pub trait NodeWatcher: PollSource + Send + Sync {
    /// Drain every pending notification.
    fn read_changes(&self) -> io::Result<Vec<NodeChange>>;
}

/// Factory for everything the hub needs from the platform.
pub trait InputBackend: Send + Sync {
    /// Candidate device node paths under `dir`.
    fn list_nodes(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Open a node read-write, non-blocking and close-on-exec.
    fn open(&self, path: &Path) -> io::Result<Box<dyn DeviceNode>>;

    fn readiness(&self) -> io::Result<Box<dyn Readiness>>;

    fn watch(&self, dir: &Path) -> io::Result<Box<dyn NodeWatcher>>;
}

/// Whether a read error means the device has been unplugged.
pub fn is_device_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ENODEV) || err.kind() == io::ErrorKind::UnexpectedEof
}

/// Whether a read error is the normal "nothing pending" condition.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
