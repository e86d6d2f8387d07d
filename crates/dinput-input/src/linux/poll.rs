//! epoll readiness context.

use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::backend::{Interest, ReadyEvent, Readiness};

/// Most registrations reported by one wait.
const MAX_EVENTS: usize = 64;

pub struct EpollReadiness {
    epoll: Epoll,
}

impl EpollReadiness {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
        })
    }
}

fn require_fd(fd: Option<BorrowedFd<'_>>) -> io::Result<BorrowedFd<'_>> {
    fd.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no descriptor"))
}

impl Readiness for EpollReadiness {
    fn register(
        &self,
        token: u64,
        fd: Option<BorrowedFd<'_>>,
        interest: Interest,
    ) -> io::Result<()> {
        // EPOLLHUP and EPOLLERR are always reported.
        let flags = match interest {
            Interest::Readable => EpollFlags::EPOLLIN,
            Interest::HangupOnly => EpollFlags::empty(),
        };
        self.epoll
            .add(require_fd(fd)?, EpollEvent::new(flags, token))
            .map_err(io::Error::from)
    }

    fn deregister(&self, _token: u64, fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        self.epoll.delete(require_fd(fd)?).map_err(io::Error::from)
    }

    fn wait(&self, out: &mut Vec<ReadyEvent>, timeout: Duration) -> io::Result<usize> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let count = match self.epoll.wait(&mut events, millis) {
            Ok(count) => count,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        out.extend(events[..count].iter().map(|ev| {
            let flags = ev.events();
            ReadyEvent {
                token: ev.data(),
                readable: flags.contains(EpollFlags::EPOLLIN),
                hangup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
            }
        }));
        Ok(count)
    }
}
