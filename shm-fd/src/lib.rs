//! OS primitives for processes that share memory on one host.
//!
//! Every type here is a thin owner of one kind of descriptor, or a table of the libc functions
//! that act on them. Nothing in this crate knows about the layout of the memory being shared.
pub mod cma;
pub mod event;
pub mod op;
pub mod poll;
pub mod sock;

pub use cma::{Cma, CmaError, IoSegment};
pub use event::Event;
pub use op::{OpenMode, Shm, ShmError, Stat};
pub use poll::{PollEvent, PollSet};
pub use sock::DgramSocket;

/// The soft limit on open descriptors of this process.
pub fn nofile_limit() -> std::io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(limit.rlim_cur as u64)
}

/// The most segments a single vectored transfer accepts.
pub fn iov_max() -> usize {
    match unsafe { libc::sysconf(libc::_SC_IOV_MAX) } {
        // POSIX guarantees at least 16.
        n if n < 16 => 16,
        n => n as usize,
    }
}

#[test]
fn limits_are_sane() {
    assert!(nofile_limit().unwrap() > 3);
    assert!(iov_max() >= 16);
}
