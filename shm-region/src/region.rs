use core::fmt;
use memmap2::{MmapOptions, MmapRaw};
use shm_fd::{Shm, ShmError};

use crate::area::AreaFd;
use crate::hdr::MsgHdr;
use crate::pool::{BitPool, CopyBufs, NUM_BUFS};
use crate::ring::Ring;

/// Most queue pairs, i.e. peers, a region serves.
pub const MAX_PEERS: usize = 256;
/// Slots of each message ring.
pub const MSG_RING_SIZE: usize = 64;
/// Slots of the command ring; every peer has at most two commands in flight.
pub const CMD_RING_SIZE: usize = MAX_PEERS * 2;

pub type MsgRing = Ring<MSG_RING_SIZE>;
pub type CmdRing = Ring<CMD_RING_SIZE>;

/// Two rings for one ordered pair of peers.
///
/// Named from the side that reserved the pair, the accepting side sends on `rx`.
#[repr(C)]
pub struct QueuePair {
    pub tx: MsgRing,
    pub rx: MsgRing,
}

#[repr(C, align(4096))]
struct QueuePairs([QueuePair; MAX_PEERS]);

/// The fixed layout of a region.
///
/// Contains only atomics and raw bytes, addressed by index. All-zero memory is a valid, if not a
/// usable, state; [`Region::reset`] makes it usable.
#[repr(C)]
pub struct Region {
    copy_bufs: CopyBufs,
    queue_pairs: QueuePairs,
    cmd_queue: CmdRing,
    available: BitPool<{ MAX_PEERS / 64 }>,
}

impl Region {
    /// Size of the mapping, a multiple of the page size.
    pub const SIZE: usize = (core::mem::size_of::<Region>() + 4095) & !4095;

    pub fn reset(&self) {
        self.copy_bufs.reset();

        for pair in &self.queue_pairs.0 {
            pair.tx.reset();
            pair.rx.reset();
        }

        self.cmd_queue.reset();
        self.available.reset();
    }

    pub fn copy_bufs(&self) -> &CopyBufs {
        &self.copy_bufs
    }

    pub fn queue_pair(&self, idx: u8) -> &QueuePair {
        &self.queue_pairs.0[usize::from(idx)]
    }

    pub fn cmd_queue(&self) -> &CmdRing {
        &self.cmd_queue
    }

    pub fn reserve_pair(&self) -> Option<u8> {
        self.available.reserve().map(|idx| idx as u8)
    }

    /// Return pair `idx` to the pool, once neither side uses it anymore.
    ///
    /// Messages still queued on the pair are discarded and their copy buffers released, the next
    /// peer to reserve the pair starts with empty rings. Returns the number of discarded messages.
    pub fn release_pair(&self, idx: u8) -> usize {
        let pair = self.queue_pair(idx);
        let mut discarded = 0;

        for ring in [&pair.tx, &pair.rx] {
            while let Some(raw) = ring.pop() {
                discarded += 1;
                match MsgHdr::decode(raw) {
                    Ok(hdr) if usize::from(hdr.buf_idx) < NUM_BUFS => {
                        self.copy_bufs.release(hdr.buf_idx);
                    }
                    _ => {}
                }
            }

            ring.reset();
        }

        self.available.release(usize::from(idx));
        discarded
    }

    pub fn available_pairs(&self) -> usize {
        self.available.available()
    }
}

/// A region mapped into this process.
///
/// Unmapped on drop. Whether the name is unlinked is up to the creator, see
/// [`SharedRegion::unlink`].
pub struct SharedRegion {
    map: MmapRaw,
    name: String,
}

pub enum RegionError {
    Shm(ShmError),
    Map(std::io::Error),
    /// The object is too small to hold a region.
    TooSmall { len: usize },
}

impl SharedRegion {
    /// Create, map and initialize a new region object called `name`.
    pub fn create(shm: &Shm, name: &str) -> Result<Self, RegionError> {
        let fd = shm.create(name, Region::SIZE).map_err(RegionError::Shm)?;
        let mapped = AreaFd::new(fd, shm).and_then(|area| Self::from_area(&area, name));

        let region = match mapped {
            Ok(region) => region,
            Err(err) => {
                let _ = shm.unlink(name);
                return Err(err);
            }
        };

        region.get().reset();
        Ok(region)
    }

    /// Map the existing region called `name`, as initialized by its creator.
    pub fn open(shm: &Shm, name: &str) -> Result<Self, RegionError> {
        let fd = shm.open(name).map_err(RegionError::Shm)?;
        let area = AreaFd::new(fd, shm)?;
        Self::from_area(&area, name)
    }

    /// Map a region from any descriptor, e.g. an anonymous memory file.
    ///
    /// The descriptor can be closed afterwards.
    pub fn from_area(area: &AreaFd, name: &str) -> Result<Self, RegionError> {
        if area.len() < Region::SIZE {
            return Err(RegionError::TooSmall { len: area.len() });
        }

        let map = MmapOptions::new()
            .len(Region::SIZE)
            .map_raw(area)
            .map_err(RegionError::Map)?;

        Ok(SharedRegion {
            map,
            name: name.to_owned(),
        })
    }

    pub fn get(&self) -> &Region {
        debug_assert!(self.map.as_ptr() as usize % core::mem::align_of::<Region>() == 0);
        // Safety: the mapping is page aligned, at least `Region::SIZE` long and lives as long as
        // `self`. `Region` consists of atomics and cells only, any bit pattern is valid.
        unsafe { &*(self.map.as_ptr() as *const Region) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the name, the mapping stays valid.
    pub fn unlink(&self, shm: &Shm) -> Result<(), RegionError> {
        shm.unlink(&self.name).map_err(RegionError::Shm)
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("ptr", &self.map.as_ptr())
            .finish()
    }
}

impl RegionError {
    /// The errno closest to this error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            RegionError::Shm(err) => Some(err.raw_os_error()),
            RegionError::Map(err) => err.raw_os_error(),
            RegionError::TooSmall { .. } => None,
        }
    }
}

impl fmt::Debug for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::Shm(err) => f.debug_tuple("Shm").field(err).finish(),
            RegionError::Map(err) => f.debug_tuple("Map").field(err).finish(),
            RegionError::TooSmall { len } => f.debug_struct("TooSmall").field("len", len).finish(),
        }
    }
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::Shm(err) => write!(f, "shared memory object: {err}"),
            RegionError::Map(err) => write!(f, "mapping region: {err}"),
            RegionError::TooSmall { len } => {
                write!(f, "object of {len} bytes can not hold a region of {}", Region::SIZE)
            }
        }
    }
}

impl std::error::Error for RegionError {}
