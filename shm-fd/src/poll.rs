//! An epoll set with user tokens.
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub struct PollSet {
    fd: OwnedFd,
}

/// One readiness event, as returned by [`PollSet::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollEvent {
    pub token: u64,
    pub events: u32,
}

impl PollSet {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(PollSet { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Register `fd` for readability, level-triggered.
    pub fn add(&self, fd: BorrowedFd<'_>, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };

        self.ctl(libc::EPOLL_CTL_ADD, fd.as_raw_fd(), &mut event)
    }

    pub fn remove(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        // Kernels before 2.6.9 required a non-null event even for removal.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        self.ctl(libc::EPOLL_CTL_DEL, fd.as_raw_fd(), &mut event)
    }

    /// Wait up to `timeout` for at most `max` events, replacing the contents of `events`.
    ///
    /// An interrupted wait returns successfully with no events.
    pub fn wait(
        &self,
        timeout: Duration,
        max: usize,
        events: &mut Vec<PollEvent>,
    ) -> io::Result<()> {
        let max = max.clamp(1, i32::MAX as usize);
        let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; max];

        events.clear();
        let ret = unsafe {
            libc::epoll_wait(self.fd.as_raw_fd(), raw.as_mut_ptr(), max as i32, timeout)
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }

            return Err(err);
        }

        events.extend(raw[..ret as usize].iter().map(|ev| PollEvent {
            token: ev.u64,
            events: ev.events,
        }));

        Ok(())
    }

    fn ctl(&self, op: i32, fd: RawFd, event: &mut libc::epoll_event) -> io::Result<()> {
        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, event) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl AsFd for PollSet {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PollSet {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[test]
fn wakes_on_event() {
    use crate::event::Event;

    let poll = PollSet::new().unwrap();
    let event = Event::new().unwrap();
    poll.add(event.as_fd(), 0xfeed).unwrap();

    let mut events = vec![];
    poll.wait(Duration::ZERO, 4, &mut events).unwrap();
    assert!(events.is_empty());

    event.set().unwrap();
    poll.wait(Duration::from_millis(100), 4, &mut events).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].token, 0xfeed);

    assert!(event.get().unwrap());
    poll.remove(event.as_fd()).unwrap();
    event.set().unwrap();
    poll.wait(Duration::ZERO, 4, &mut events).unwrap();
    assert!(events.is_empty());
}
