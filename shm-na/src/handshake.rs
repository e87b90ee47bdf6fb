//! Carrying connection commands to a peer.
//!
//! Reserving and releasing a queue pair must be announced to the owner of the region. With a
//! socket, the announcement also carries the notification descriptors of the connection. Without
//! one, it is pushed to the command ring inside the region.
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use shm_fd::{sock, DgramSocket};
use shm_region::{CmdHdr, SharedRegion};

use crate::config::Naming;
use crate::Error;

/// The receiving end of a command.
pub(crate) struct Peer<'lt> {
    pub pid: u32,
    pub id: u8,
    /// The region of the peer, as mapped by us.
    pub region: &'lt SharedRegion,
}

/// One received command word and the descriptors that came with it.
pub(crate) struct Received {
    pub raw: u64,
    pub fds: Vec<OwnedFd>,
}

pub(crate) trait Handshake: Send + Sync {
    /// Announce `cmd` to `peer`.
    ///
    /// `fds` are passed along if the transport can carry them, otherwise they are ignored.
    /// A transport that is momentarily congested fails with [`Error::Again`].
    fn send(&self, peer: &Peer<'_>, cmd: CmdHdr, fds: &[BorrowedFd<'_>]) -> Result<(), Error>;

    /// Take one command addressed to us, if any is pending.
    fn recv(&self, local: Option<&SharedRegion>) -> Result<Option<Received>, Error>;

    /// A descriptor to poll for pending commands.
    fn poll_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Stop accepting commands. Sending stays possible.
    fn shutdown(&self) -> Result<(), Error>;
}

/// Commands as datagrams, descriptors as `SCM_RIGHTS`.
pub(crate) struct SocketHandshake {
    sock: DgramSocket,
    naming: Naming,
    listening: bool,
}

/// Commands in the command ring of the peer's region.
pub(crate) struct QueueHandshake;

impl SocketHandshake {
    pub fn new(naming: Naming, local: Option<(u32, u8)>) -> Result<Self, Error> {
        let sock = match local {
            Some((pid, id)) => DgramSocket::bind(&naming.sock_path(pid, id))?,
            None => DgramSocket::unbound()?,
        };

        Ok(SocketHandshake {
            sock,
            naming,
            listening: local.is_some(),
        })
    }
}

impl Handshake for SocketHandshake {
    fn send(&self, peer: &Peer<'_>, cmd: CmdHdr, fds: &[BorrowedFd<'_>]) -> Result<(), Error> {
        let path = self.naming.sock_path(peer.pid, peer.id);
        let word = cmd.encode().get().to_ne_bytes();

        match self.sock.send_with_fds(&path, &word, fds) {
            Ok(()) => Ok(()),
            // The receiver holds too many in-flight descriptors of ours.
            Err(err) if err.raw_os_error() == Some(libc::ETOOMANYREFS) => Err(Error::Again),
            Err(err) => Err(err.into()),
        }
    }

    fn recv(&self, _: Option<&SharedRegion>) -> Result<Option<Received>, Error> {
        if !self.listening {
            return Ok(None);
        }

        let mut word = [0u8; 8];
        let Some((len, fds)) = self.sock.recv_with_fds(&mut word)? else {
            return Ok(None);
        };

        if len != word.len() {
            tracing::error!(len, "dropping command datagram of unexpected length");
            return Ok(Some(Received { raw: 0, fds }));
        }

        Ok(Some(Received {
            raw: u64::from_ne_bytes(word),
            fds,
        }))
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        self.listening.then(|| self.sock.as_fd())
    }

    fn shutdown(&self) -> Result<(), Error> {
        let Some(path) = self.sock.unlink()? else {
            return Ok(());
        };

        // Also the per-pid and per-id directories, the user directory is shared.
        if let Some(dir) = path.parent() {
            sock::remove_dirs(dir, &self.naming.user_dir())?;
        }

        Ok(())
    }
}

impl Handshake for QueueHandshake {
    fn send(&self, peer: &Peer<'_>, cmd: CmdHdr, _: &[BorrowedFd<'_>]) -> Result<(), Error> {
        peer.region
            .get()
            .cmd_queue()
            .push(cmd.encode())
            .map_err(|_| Error::Again)
    }

    fn recv(&self, local: Option<&SharedRegion>) -> Result<Option<Received>, Error> {
        let Some(region) = local else {
            return Ok(None);
        };

        Ok(region.get().cmd_queue().pop().map(|raw| Received {
            raw: raw.get(),
            fds: Vec::new(),
        }))
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn shutdown(&self) -> Result<(), Error> {
        Ok(())
    }
}

