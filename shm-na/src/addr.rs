use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use parking_lot::Mutex;
use shm_fd::Event;
use shm_region::{CmdHdr, CmdKind, CopyBufs, MsgRing, QueuePair, SharedRegion};

use crate::endpoint::{Core, PollKey};
use crate::handshake::Peer;
use crate::{Error, PROTOCOL_NAME};

/// The queue pair of the peer's region is ours.
pub(crate) const RESERVED: u32 = 1 << 0;
/// The peer was told about the reservation.
pub(crate) const CMD_PUSHED: u32 = 1 << 1;
/// The queues can be used.
pub(crate) const RESOLVED: u32 = 1 << 2;

/// Bytes of a serialized address.
pub const ADDR_SERIALIZE_SIZE: usize = 5;

/// A peer, identified by process id and instance id.
///
/// Cheap to clone; all clones refer to the same connection. The connection is torn down when the
/// last clone is dropped, including those held by the endpoint while the peer is connected.
#[derive(Clone)]
pub struct Addr {
    pub(crate) inner: Arc<AddrInner>,
}

pub(crate) struct AddrInner {
    pid: u32,
    id: u8,
    /// Materialized by a reservation of the peer, rather than by a lookup.
    unexpected: bool,
    serial: u64,
    status: AtomicU32,
    state: Mutex<AddrState>,
    core: Arc<Core>,
}

#[derive(Default)]
struct AddrState {
    region: Option<Arc<SharedRegion>>,
    pair_idx: u8,
    tx_notify: Option<Event>,
    rx_notify: Option<Event>,
    rx_registered: bool,
}

/// The queues of a resolved address.
pub(crate) struct Channel {
    region: Arc<SharedRegion>,
    pair_idx: u8,
    inverted: bool,
}

impl Addr {
    pub(crate) fn new(core: Arc<Core>, pid: u32, id: u8) -> Self {
        let serial = core.next_serial();
        Self::with_state(core, pid, id, serial, false, 0, AddrState::default())
    }

    /// The address of ourselves, which shares the local region if there is one.
    pub(crate) fn source(core: Arc<Core>, region: Option<Arc<SharedRegion>>) -> Self {
        let (pid, id, serial) = (core.pid, core.id, core.next_serial());
        let state = AddrState {
            region,
            ..AddrState::default()
        };

        Self::with_state(core, pid, id, serial, false, 0, state)
    }

    /// Materialize the connection a peer announced with a reservation command.
    ///
    /// The peer sent its `[tx, rx]` notification descriptors, which are ours crosswise.
    pub(crate) fn accepted(
        core: Arc<Core>,
        cmd: &CmdHdr,
        region: Arc<SharedRegion>,
        fds: Vec<OwnedFd>,
    ) -> Result<Self, Error> {
        let mut fds = fds.into_iter().map(Event::from_fd);
        let (peer_tx, peer_rx) = (fds.next(), fds.next());
        let serial = core.next_serial();

        let mut state = AddrState {
            region: Some(region),
            pair_idx: cmd.pair_idx,
            tx_notify: peer_rx,
            rx_notify: peer_tx,
            rx_registered: false,
        };

        let count = state.tx_notify.iter().chain(&state.rx_notify).count() as u64;
        core.track_fds(count);

        if let (Some(poll), Some(rx)) = (&core.poll_set, &state.rx_notify) {
            if let Err(err) = poll.add(rx.as_fd(), PollKey::RxNotify(serial).token()) {
                core.untrack_fds(count);
                return Err(err.into());
            }

            state.rx_registered = true;
        }

        let status = RESERVED | RESOLVED;
        Ok(Self::with_state(core, cmd.pid, cmd.id, serial, true, status, state))
    }

    fn with_state(
        core: Arc<Core>,
        pid: u32,
        id: u8,
        serial: u64,
        unexpected: bool,
        status: u32,
        state: AddrState,
    ) -> Self {
        Addr {
            inner: Arc::new(AddrInner {
                pid,
                id,
                unexpected,
                serial,
                status: AtomicU32::new(status),
                state: Mutex::new(state),
                core,
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn id(&self) -> u8 {
        self.inner.id
    }

    /// Whether the peer connected to us, rather than us to the peer.
    pub fn is_unexpected(&self) -> bool {
        self.inner.unexpected
    }

    pub fn is_resolved(&self) -> bool {
        self.status() & RESOLVED != 0
    }

    /// Write the wire form: the pid, 4 bytes native endian, then the id.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let buf = buf
            .get_mut(..ADDR_SERIALIZE_SIZE)
            .ok_or(Error::Overflow)?;

        buf[..4].copy_from_slice(&self.inner.pid.to_ne_bytes());
        buf[4] = self.inner.id;
        Ok(ADDR_SERIALIZE_SIZE)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub(crate) fn status(&self) -> u32 {
        self.inner.status.load(Ordering::Acquire)
    }

    pub(crate) fn ptr_eq(&self, other: &Addr) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The queues, if the address is resolved.
    pub(crate) fn channel(&self) -> Option<Channel> {
        if !self.is_resolved() {
            return None;
        }

        let state = self.inner.state.lock();
        Some(Channel {
            region: Arc::clone(state.region.as_ref()?),
            pair_idx: state.pair_idx,
            inverted: self.inner.unexpected,
        })
    }

    pub(crate) fn pair_idx(&self) -> Option<u8> {
        if self.status() & RESERVED == 0 {
            return None;
        }

        Some(self.inner.state.lock().pair_idx)
    }

    /// Wake the peer, if it waits on a notification descriptor.
    pub(crate) fn notify_tx(&self) -> Result<(), Error> {
        if let Some(tx) = &self.inner.state.lock().tx_notify {
            tx.set()?;
        }

        Ok(())
    }

    /// Consume one wakeup sent by the peer.
    pub(crate) fn take_rx_notify(&self) -> Result<bool, Error> {
        match &self.inner.state.lock().rx_notify {
            Some(rx) => Ok(rx.get()?),
            None => Ok(false),
        }
    }

    /// Run the reservation handshake with the peer, as far as possible.
    ///
    /// Returns `true` if this call completed the resolution. On [`Error::Again`] everything
    /// acquired so far is kept and the next call continues where this one stopped. On any other
    /// error the acquired resources are released again.
    pub(crate) fn resolve(&self) -> Result<bool, Error> {
        if self.is_resolved() {
            return Ok(false);
        }

        let mut state = self.inner.state.lock();
        if self.is_resolved() {
            return Ok(false);
        }

        match self.inner.resolve_locked(&mut state) {
            Ok(()) => Ok(true),
            Err(Error::Again) => Err(Error::Again),
            Err(err) => {
                self.inner.unwind(&mut state);
                Err(err)
            }
        }
    }
}

impl AddrInner {
    fn resolve_locked(&self, state: &mut AddrState) -> Result<(), Error> {
        let core = &self.core;

        let region = match &state.region {
            Some(region) => Arc::clone(region),
            None => {
                let name = core.naming.shm_name(self.pid, self.id);
                let region = Arc::new(SharedRegion::open(&core.shm, &name)?);
                tracing::debug!(name, "opened peer region");
                state.region = Some(Arc::clone(&region));
                region
            }
        };

        if self.status.load(Ordering::Acquire) & RESERVED == 0 {
            state.pair_idx = region.get().reserve_pair().ok_or(Error::Again)?;
            self.status.fetch_or(RESERVED, Ordering::AcqRel);
            tracing::debug!(pid = self.pid, id = self.id, pair = state.pair_idx, "reserved queue pair");
        }

        if let Some(poll) = &core.poll_set {
            if state.tx_notify.is_none() {
                core.reserve_fds(2)?;
                match (Event::new(), Event::new()) {
                    (Ok(tx), Ok(rx)) => {
                        state.tx_notify = Some(tx);
                        state.rx_notify = Some(rx);
                    }
                    (Err(err), _) | (_, Err(err)) => {
                        core.untrack_fds(2);
                        return Err(err.into());
                    }
                }
            }

            if let (false, Some(rx)) = (state.rx_registered, &state.rx_notify) {
                poll.add(rx.as_fd(), PollKey::RxNotify(self.serial).token())?;
                state.rx_registered = true;
            }
        }

        if self.status.load(Ordering::Acquire) & CMD_PUSHED == 0 {
            let cmd = CmdHdr {
                kind: CmdKind::Reserved,
                pid: core.pid,
                id: core.id,
                pair_idx: state.pair_idx,
            };

            let fds: Vec<BorrowedFd<'_>> = state
                .tx_notify
                .iter()
                .chain(&state.rx_notify)
                .map(Event::as_fd)
                .collect();

            let peer = Peer {
                pid: self.pid,
                id: self.id,
                region: &region,
            };

            core.handshake.send(&peer, cmd, &fds)?;
            self.status.fetch_or(CMD_PUSHED, Ordering::AcqRel);
            tracing::debug!(pid = self.pid, id = self.id, "sent reservation");
        }

        self.status.fetch_or(RESOLVED, Ordering::AcqRel);
        Ok(())
    }

    /// Release a partial resolution, in reverse order of acquisition.
    fn unwind(&self, state: &mut AddrState) {
        self.release_notify(state);

        let status = self.status.fetch_and(!(RESERVED | CMD_PUSHED), Ordering::AcqRel);
        if let (true, Some(region)) = (status & RESERVED != 0, &state.region) {
            region.get().release_pair(state.pair_idx);
        }

        state.region = None;
    }

    fn release_notify(&self, state: &mut AddrState) {
        let core = &self.core;

        if let Some(rx) = state.rx_notify.take() {
            if let (true, Some(poll)) = (state.rx_registered, &core.poll_set) {
                if let Err(err) = poll.remove(rx.as_fd()) {
                    tracing::warn!(%err, "could not deregister rx notification");
                }
            }

            core.untrack_fds(1);
        }

        if state.tx_notify.take().is_some() {
            core.untrack_fds(1);
        }

        state.rx_registered = false;
    }
}

impl Drop for AddrInner {
    fn drop(&mut self) {
        let status = *self.status.get_mut();
        let state = self.state.get_mut();

        if let (true, Some(region)) = (status & RESERVED != 0, &state.region) {
            if self.unexpected || status & CMD_PUSHED == 0 {
                // Either the pair is in our region, or the peer never learned of it.
                let discarded = region.get().release_pair(state.pair_idx);
                if discarded > 0 {
                    tracing::warn!(discarded, pid = self.pid, id = self.id, "discarded undelivered messages");
                }
            } else {
                let cmd = CmdHdr {
                    kind: CmdKind::Released,
                    pid: self.core.pid,
                    id: self.core.id,
                    pair_idx: state.pair_idx,
                };

                let peer = Peer {
                    pid: self.pid,
                    id: self.id,
                    region,
                };

                // The pair stays reserved in the peer's region.
                if let Err(err) = self.core.handshake.send(&peer, cmd, &[]) {
                    tracing::warn!(%err, pid = self.pid, id = self.id, "could not send release");
                }
            }
        }

        let mut state = core::mem::take(state);
        self.release_notify(&mut state);
        // Unmaps if this was the last holder of the region.
        drop(state);
    }
}

impl Channel {
    fn pair(&self) -> &QueuePair {
        self.region.get().queue_pair(self.pair_idx)
    }

    pub(crate) fn tx(&self) -> &MsgRing {
        if self.inverted {
            &self.pair().rx
        } else {
            &self.pair().tx
        }
    }

    pub(crate) fn rx(&self) -> &MsgRing {
        if self.inverted {
            &self.pair().tx
        } else {
            &self.pair().rx
        }
    }

    pub(crate) fn bufs(&self) -> &CopyBufs {
        self.region.get().copy_bufs()
    }
}

/// Parse `sm://<pid>/<id>`, the scheme is optional.
pub(crate) fn parse(name: &str) -> Result<(u32, u8), Error> {
    let rest = match name.split_once("://") {
        Some((scheme, rest)) if scheme == PROTOCOL_NAME => rest,
        Some(_) => return Err(Error::ProtoNoSupport),
        None => name,
    };

    let (pid, id) = rest.split_once('/').ok_or(Error::InvalidArg)?;
    let pid = pid.parse().map_err(|_| Error::InvalidArg)?;
    let id = id.parse().map_err(|_| Error::InvalidArg)?;
    Ok((pid, id))
}

/// Read the wire form written by [`Addr::serialize`].
pub(crate) fn deserialize(buf: &[u8]) -> Result<(u32, u8), Error> {
    let buf = buf.get(..ADDR_SERIALIZE_SIZE).ok_or(Error::Overflow)?;
    let mut pid = [0u8; 4];
    pid.copy_from_slice(&buf[..4]);
    Ok((u32::from_ne_bytes(pid), buf[4]))
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        self.inner.pid == other.inner.pid && self.inner.id == other.inner.id
    }
}

impl Eq for Addr {}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROTOCOL_NAME}://{}/{}", self.inner.pid, self.inner.id)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("pid", &self.inner.pid)
            .field("id", &self.inner.id)
            .field("unexpected", &self.inner.unexpected)
            .field("status", &self.status())
            .finish()
    }
}
