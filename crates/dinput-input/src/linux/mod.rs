//! evdev, epoll and inotify backends for Linux.

mod node;
mod poll;
mod uinput;
mod watch;

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;

use crate::backend::{DeviceNode, InputBackend, NodeWatcher, Readiness};

pub use node::EvdevNode;
pub use poll::EpollReadiness;
pub use uinput::UinputDeviceBackend;
pub use watch::InotifyWatcher;

/// Prefix of the character devices the hub considers.
pub(crate) const EVENT_NODE_PREFIX: &str = "event";

/// The kernel input subsystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvdevBackend;

impl EvdevBackend {
    pub fn new() -> Self {
        Self
    }
}

impl InputBackend for EvdevBackend {
    fn list_nodes(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(EVENT_NODE_PREFIX))
            })
            .map(|entry| entry.path())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn DeviceNode>> {
        // std opens with O_CLOEXEC already.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)?;
        let device = evdev::Device::from_fd(file.into())?;
        Ok(Box::new(EvdevNode::new(device)))
    }

    fn readiness(&self) -> io::Result<Box<dyn Readiness>> {
        Ok(Box::new(EpollReadiness::new()?))
    }

    fn watch(&self, dir: &Path) -> io::Result<Box<dyn NodeWatcher>> {
        Ok(Box::new(InotifyWatcher::new(dir)?))
    }
}
