//! The state shared by every operation of one plugin instance.
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::{HashMap, VecDeque};
use std::os::fd::AsFd;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use shm_fd::{Cma, Event, PollSet, Shm};
use shm_region::SharedRegion;

use crate::addr::{Addr, AddrInner};
use crate::config::{Config, Naming, ProgressMode};
use crate::handshake::{Handshake, QueueHandshake, SocketHandshake};
use crate::op::OpId;
use crate::{Error, Tag};

/// The parts of an endpoint that addresses need, and may outlive it.
pub(crate) struct Core {
    pub pid: u32,
    pub id: u8,
    pub naming: Naming,
    pub shm: Shm,
    pub poll_set: Option<PollSet>,
    pub handshake: Box<dyn Handshake>,
    nofile: AtomicU64,
    nofile_max: u64,
    serials: AtomicU64,
}

/// What a registration in the poll set stands for.
///
/// The kind is kept in the top byte of the token, an address serial in the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PollKey {
    Sock,
    RxNotify(u64),
    TxNotify,
}

pub(crate) struct UnexpectedMsg {
    pub addr: Addr,
    pub buf: Vec<u8>,
    pub tag: Tag,
}

/// Messages nobody asked for yet, and receives nothing arrived for yet.
///
/// At most one of the two queues is non-empty. Both are behind one lock so that a message and a
/// receive can never pass each other.
#[derive(Default)]
pub(crate) struct Unexpected {
    pub msgs: VecDeque<UnexpectedMsg>,
    pub ops: VecDeque<OpId>,
}

pub(crate) struct Endpoint {
    pub core: Arc<Core>,
    pub source: Addr,
    /// Our own region, if we are listening.
    pub region: Option<Arc<SharedRegion>>,
    /// Wakes a blocked progress call when an operation completes.
    pub local_notify: Option<Event>,
    pub listen: bool,
    pub cma: Cma,
    pub iov_max: usize,
    addr_map: RwLock<HashMap<u64, Weak<AddrInner>>>,
    /// Resolved addresses, whose rings are checked by progress.
    pub poll_addrs: Mutex<Vec<Addr>>,
    pub unexpected: Mutex<Unexpected>,
    pub expected_ops: Mutex<VecDeque<OpId>>,
    pub retry_ops: Mutex<VecDeque<OpId>>,
}

const SERIAL_MASK: u64 = (1 << 56) - 1;

impl PollKey {
    pub fn token(self) -> u64 {
        match self {
            PollKey::Sock => 1 << 56,
            PollKey::RxNotify(serial) => 2 << 56 | serial & SERIAL_MASK,
            PollKey::TxNotify => 3 << 56,
        }
    }

    pub fn from_token(token: u64) -> Option<Self> {
        match token >> 56 {
            1 => Some(PollKey::Sock),
            2 => Some(PollKey::RxNotify(token & SERIAL_MASK)),
            3 => Some(PollKey::TxNotify),
            _ => None,
        }
    }
}

impl Core {
    pub fn next_serial(&self) -> u64 {
        self.serials.fetch_add(1, Ordering::Relaxed) & SERIAL_MASK
    }

    /// Account for `n` descriptors about to be created.
    ///
    /// Fails with [`Error::Again`] if that would exceed the limit of the process, since others
    /// may be closed by the time the caller retries.
    pub fn reserve_fds(&self, n: u64) -> Result<(), Error> {
        let max = self.nofile_max;
        self.nofile
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(n).filter(|&next| next <= max)
            })
            .map(drop)
            .map_err(|_| Error::Again)
    }

    /// Account for `n` descriptors received from a peer.
    pub fn track_fds(&self, n: u64) {
        self.nofile.fetch_add(n, Ordering::AcqRel);
    }

    pub fn untrack_fds(&self, n: u64) {
        let _ = self
            .nofile
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(n))
            });
    }

    pub fn open_fds(&self) -> u64 {
        self.nofile.load(Ordering::Acquire)
    }
}

fn addr_key(pid: u32, id: u8) -> u64 {
    u64::from(pid) << 8 | u64::from(id)
}

impl Endpoint {
    pub fn open(config: &Config, naming: Naming, id: u8) -> Result<Self, Error> {
        let pid = std::process::id();
        let shm = Shm::new();

        let region = if config.listen {
            let name = naming.shm_name(pid, id);
            let region = SharedRegion::create(&shm, &name)?;
            tracing::debug!(name, "created region");
            Some(Arc::new(region))
        } else {
            None
        };

        let endpoint = Self::open_with_region(config, naming, shm.clone(), pid, id, region.clone());

        if let (Err(_), Some(region)) = (&endpoint, &region) {
            if let Err(err) = region.unlink(&shm) {
                tracing::warn!(%err, name = region.name(), "could not unlink region");
            }
        }

        endpoint
    }

    fn open_with_region(
        config: &Config,
        naming: Naming,
        shm: Shm,
        pid: u32,
        id: u8,
        region: Option<Arc<SharedRegion>>,
    ) -> Result<Self, Error> {
        let nofile_max = shm_fd::nofile_limit()?;
        let local = config.listen.then_some((pid, id));

        let (poll_set, handshake, local_notify) = match config.progress_mode {
            ProgressMode::Blocking => {
                let poll = PollSet::new()?;
                let sock = SocketHandshake::new(naming.clone(), local)?;
                if let Some(fd) = sock.poll_fd() {
                    poll.add(fd, PollKey::Sock.token())?;
                }

                let notify = Event::new()?;
                poll.add(notify.as_fd(), PollKey::TxNotify.token())?;
                (Some(poll), Box::new(sock) as Box<dyn Handshake>, Some(notify))
            }
            ProgressMode::NoBlock => (None, Box::new(QueueHandshake) as Box<dyn Handshake>, None),
        };

        let core = Arc::new(Core {
            pid,
            id,
            naming,
            shm,
            poll_set,
            handshake,
            nofile: AtomicU64::new(0),
            nofile_max,
            serials: AtomicU64::new(0),
        });

        let source = Addr::source(Arc::clone(&core), region.clone());
        tracing::debug!(%source, listen = config.listen, mode = ?config.progress_mode, "opened endpoint");

        Ok(Endpoint {
            core,
            source,
            region,
            local_notify,
            listen: config.listen,
            cma: Cma::new(),
            iov_max: shm_fd::iov_max(),
            addr_map: RwLock::new(HashMap::new()),
            poll_addrs: Mutex::new(Vec::new()),
            unexpected: Mutex::new(Unexpected::default()),
            expected_ops: Mutex::new(VecDeque::new()),
            retry_ops: Mutex::new(VecDeque::new()),
        })
    }

    /// Tear down, unless operations are pending and `force` is unset.
    ///
    /// With `force` pending operations are dropped without completion.
    pub fn close(&self, force: bool) -> Result<(), Error> {
        if !force && self.is_busy() {
            return Err(Error::Busy);
        }

        {
            let mut unexpected = self.unexpected.lock();
            unexpected.msgs.clear();
            unexpected.ops.clear();
        }
        self.expected_ops.lock().clear();
        self.retry_ops.lock().clear();

        // Dropped outside of the lock, dropping sends release commands.
        let addrs = core::mem::take(&mut *self.poll_addrs.lock());
        drop(addrs);

        if let Some(region) = &self.region {
            region.unlink(&self.core.shm)?;
            tracing::debug!(name = region.name(), "unlinked region");
        }

        if let Some(poll) = &self.core.poll_set {
            if let Some(notify) = &self.local_notify {
                poll.remove(notify.as_fd())?;
            }

            if let Some(fd) = self.core.handshake.poll_fd() {
                poll.remove(fd)?;
            }
        }

        self.core.handshake.shutdown()?;

        let open = self.core.open_fds();
        if open != 0 {
            tracing::warn!(open, "descriptors of addresses still in use");
        }

        Ok(())
    }

    fn is_busy(&self) -> bool {
        let unexpected = self.unexpected.lock();
        !unexpected.msgs.is_empty()
            || !unexpected.ops.is_empty()
            || !self.expected_ops.lock().is_empty()
            || !self.retry_ops.lock().is_empty()
    }

    pub fn is_self(&self, pid: u32, id: u8) -> bool {
        (pid, id) == (self.core.pid, self.core.id)
    }

    /// The address of `(pid, id)`, shared with every other lookup of it.
    pub fn lookup(&self, pid: u32, id: u8) -> Addr {
        if self.is_self(pid, id) {
            return self.source.clone();
        }

        let key = addr_key(pid, id);
        if let Some(addr) = Self::upgrade(self.addr_map.read().get(&key)) {
            return addr;
        }

        let mut map = self.addr_map.write();
        if let Some(addr) = Self::upgrade(map.get(&key)) {
            return addr;
        }

        map.retain(|_, weak| weak.strong_count() > 0);
        let addr = Addr::new(Arc::clone(&self.core), pid, id);
        map.insert(key, Arc::downgrade(&addr.inner));
        tracing::debug!(%addr, "inserted address");
        addr
    }

    /// The address of `(pid, id)` if some handle to it is alive.
    pub fn find(&self, pid: u32, id: u8) -> Option<Addr> {
        if self.is_self(pid, id) {
            return Some(self.source.clone());
        }

        Self::upgrade(self.addr_map.read().get(&addr_key(pid, id)))
    }

    fn upgrade(weak: Option<&Weak<AddrInner>>) -> Option<Addr> {
        weak?.upgrade().map(|inner| Addr { inner })
    }

    /// Resolve `addr` and start polling it once it is.
    pub fn resolve(&self, addr: &Addr) -> Result<(), Error> {
        if addr.resolve()? {
            tracing::debug!(%addr, "resolved address");
            self.poll_addrs.lock().push(addr.clone());
        }

        Ok(())
    }
}
