//! Datagram sockets that carry descriptors as `SCM_RIGHTS` ancillary data.
use std::fs::DirBuilder;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Most descriptors accepted in a single datagram.
pub const MAX_FDS: usize = 4;

/// A non-blocking Unix datagram socket.
///
/// A bound socket owns its path and unlinks it when dropped, or earlier with
/// [`DgramSocket::unlink`].
pub struct DgramSocket {
    sock: UnixDatagram,
    bound: Mutex<Option<PathBuf>>,
}

impl DgramSocket {
    /// Bind at `path`, creating missing parent directories.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            create_dirs(parent)?;
        }

        let sock = UnixDatagram::bind(path)?;
        sock.set_nonblocking(true)?;

        Ok(DgramSocket {
            sock,
            bound: Mutex::new(Some(path.to_owned())),
        })
    }

    /// A socket that can only send.
    pub fn unbound() -> io::Result<Self> {
        let sock = UnixDatagram::unbound()?;
        sock.set_nonblocking(true)?;
        Ok(DgramSocket {
            sock,
            bound: Mutex::new(None),
        })
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.bound.lock().ok()?.clone()
    }

    /// Remove the bound path, so that no peer can reach this socket anymore.
    ///
    /// Returns the removed path. The socket stays usable for sending.
    pub fn unlink(&self) -> io::Result<Option<PathBuf>> {
        let path = match self.bound.lock() {
            Ok(mut bound) => bound.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(path) = &path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }

        Ok(path)
    }

    /// Send `payload` to the socket bound at `to`, with `fds` attached.
    ///
    /// The kernel duplicates the descriptors into the receiver; ours stay open.
    pub fn send_with_fds(&self, to: &Path, payload: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        if fds.len() > MAX_FDS {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let (mut addr, addr_len) = sockaddr_un(to)?;
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };

        // Safety: zeroed msghdr is valid before assigning pointers.
        let mut msghdr: libc::msghdr = unsafe { core::mem::zeroed() };
        msghdr.msg_name = (&mut addr as *mut libc::sockaddr_un).cast();
        msghdr.msg_namelen = addr_len;
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;

        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let data_len = core::mem::size_of_val(raw.as_slice());
        let mut control = Vec::new();

        if !raw.is_empty() {
            let space = unsafe { libc::CMSG_SPACE(data_len as u32) } as usize;
            control.resize(space, 0u8);
            msghdr.msg_control = control.as_mut_ptr().cast();
            msghdr.msg_controllen = control.len() as _;

            // Safety: control buffer sized with CMSG_SPACE and owned here.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msghdr);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
                core::ptr::copy_nonoverlapping(
                    raw.as_ptr(),
                    libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                    raw.len(),
                );
            }
        }

        let ret = unsafe { libc::sendmsg(self.sock.as_raw_fd(), &msghdr, libc::MSG_NOSIGNAL) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Receive one datagram into `payload`.
    ///
    /// Returns `None` if no datagram is pending. Received descriptors are owned by the caller.
    pub fn recv_with_fds(&self, payload: &mut [u8]) -> io::Result<Option<(usize, Vec<OwnedFd>)>> {
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };

        let space = unsafe {
            libc::CMSG_SPACE((MAX_FDS * core::mem::size_of::<RawFd>()) as u32)
        } as usize;
        let mut control = vec![0u8; space];

        // Safety: zeroed msghdr is valid before assigning pointers.
        let mut msghdr: libc::msghdr = unsafe { core::mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = control.len() as _;

        let ret = unsafe {
            libc::recvmsg(self.sock.as_raw_fd(), &mut msghdr, libc::MSG_CMSG_CLOEXEC)
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }

            return Err(err);
        }

        let fds = parse_fds(&msghdr);
        if msghdr.msg_flags & (libc::MSG_CTRUNC | libc::MSG_TRUNC) != 0 {
            // Dropping `fds` closes whatever did make it through.
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated datagram"));
        }

        Ok(Some((ret as usize, fds)))
    }
}

impl Drop for DgramSocket {
    fn drop(&mut self) {
        let _ = self.unlink();
    }
}

impl AsFd for DgramSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

impl AsRawFd for DgramSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// Create `path` and its missing parents with mode `0775`.
pub fn create_dirs(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o775).create(path)
}

/// Remove the empty directories from `path` up to, but excluding, `stop`.
///
/// Stops early at the first directory that is still in use by other entries.
pub fn remove_dirs(path: &Path, stop: &Path) -> io::Result<()> {
    for dir in path.ancestors() {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }

        match std::fs::remove_dir(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) if matches!(err.raw_os_error(), Some(libc::ENOTEMPTY | libc::EEXIST)) => break,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // Safety: all-zero is a valid sockaddr_un.
    let mut addr: libc::sockaddr_un = unsafe { core::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Keep one byte for the terminating nul.
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }

    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let base = core::mem::size_of::<libc::sa_family_t>();
    Ok((addr, (base + bytes.len() + 1) as libc::socklen_t))
}

fn parse_fds(msghdr: &libc::msghdr) -> Vec<OwnedFd> {
    let mut out = Vec::new();
    // Safety: msghdr points at a valid control buffer owned by caller.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                let count = cmsg_len.saturating_sub(base_len) / core::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    // Safety: descriptors from SCM_RIGHTS are owned by the receiver now.
                    out.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}

#[test]
fn passes_descriptors() {
    use crate::event::Event;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a/b/sock");
    let server = DgramSocket::bind(&path).unwrap();
    let client = DgramSocket::unbound().unwrap();

    let mut buf = [0u8; 8];
    assert!(server.recv_with_fds(&mut buf).unwrap().is_none());

    let event = Event::new().unwrap();
    client
        .send_with_fds(&path, &0xabcd_u64.to_ne_bytes(), &[event.as_fd()])
        .unwrap();

    let (len, mut fds) = server.recv_with_fds(&mut buf).unwrap().unwrap();
    assert_eq!(len, 8);
    assert_eq!(u64::from_ne_bytes(buf), 0xabcd);
    assert_eq!(fds.len(), 1);

    let received = Event::from_fd(fds.pop().unwrap());
    event.set().unwrap();
    assert!(received.get().unwrap());

    assert_eq!(server.unlink().unwrap(), Some(path.clone()));
    assert!(!path.exists());
    drop(server);
    remove_dirs(path.parent().unwrap(), dir.path()).unwrap();
    assert!(!dir.path().join("a").exists());
}
