//! inotify watch on the device directory.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tracing::{trace, warn};

use super::EVENT_NODE_PREFIX;
use crate::backend::{NodeChange, NodeWatcher, PollSource};

pub struct InotifyWatcher {
    inotify: Inotify,
    wd: WatchDescriptor,
    dir: PathBuf,
}

impl InotifyWatcher {
    pub fn new(dir: &Path) -> io::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        let wd = inotify.add_watch(dir, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE)?;
        Ok(Self {
            inotify,
            wd,
            dir: dir.to_path_buf(),
        })
    }
}

impl PollSource for InotifyWatcher {
    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.inotify.as_fd())
    }
}

impl NodeWatcher for InotifyWatcher {
    fn read_changes(&self) -> io::Result<Vec<NodeChange>> {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut changes = Vec::new();
        for event in events {
            if event.wd != self.wd {
                warn!(dir = %self.dir.display(), "notification for unknown watch");
                continue;
            }
            let Some(name) = event.name else {
                continue;
            };
            if !name.to_string_lossy().starts_with(EVENT_NODE_PREFIX) {
                continue;
            }
            let path = self.dir.join(&name);
            if event.mask.contains(AddWatchFlags::IN_CREATE) {
                trace!(path = %path.display(), "node created");
                changes.push(NodeChange::Created(path));
            } else if event.mask.contains(AddWatchFlags::IN_DELETE) {
                trace!(path = %path.display(), "node deleted");
                changes.push(NodeChange::Removed(path));
            }
        }
        Ok(changes)
    }
}
