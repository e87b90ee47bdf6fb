//! Notification descriptors.
//!
//! An `eventfd` in semaphore mode: every `set` is matched by exactly one successful `get`.
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

pub struct Event {
    fd: OwnedFd,
}

impl Event {
    pub fn new() -> io::Result<Self> {
        let flags = libc::EFD_NONBLOCK | libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE;
        let fd = unsafe { libc::eventfd(0, flags) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Safety: freshly created, owned by nobody else.
        Ok(Event { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Wrap a descriptor received from a peer.
    ///
    /// The descriptor is assumed to be an eventfd created by [`Event::new`] in another process.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Event { fd }
    }

    /// Signal the event once.
    pub fn set(&self) -> io::Result<()> {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&one as *const u64).cast(),
                core::mem::size_of::<u64>(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            // The counter saturated, the reader has plenty of wakeups pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }

            return Err(err);
        }

        Ok(())
    }

    /// Consume one signal, if any is pending.
    pub fn get(&self) -> io::Result<bool> {
        let mut count: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut count as *mut u64).cast(),
                core::mem::size_of::<u64>(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }

            return Err(err);
        }

        Ok(count > 0)
    }
}

impl AsFd for Event {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[test]
fn semaphore_counts_each_set() {
    let event = Event::new().unwrap();
    assert!(!event.get().unwrap());

    event.set().unwrap();
    event.set().unwrap();

    assert!(event.get().unwrap());
    assert!(event.get().unwrap());
    assert!(!event.get().unwrap());
}
