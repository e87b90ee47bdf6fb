//! Index reservation and the copy buffers staged between peers.
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// Number of copy buffers in a region.
pub const NUM_BUFS: usize = 64;
/// Size of one copy buffer, the largest message a region carries.
pub const COPY_BUF_SIZE: usize = 4096;

/// A set of `64 * W` indices, each either available (bit set) or owned by one reservation.
#[repr(C)]
pub struct BitPool<const W: usize> {
    words: CachePadded<[AtomicU64; W]>,
}

impl<const W: usize> BitPool<W> {
    pub const CAPACITY: usize = 64 * W;

    /// A pool with every index available.
    pub const fn full() -> Self {
        const FULL: AtomicU64 = AtomicU64::new(u64::MAX);

        BitPool {
            words: CachePadded::new([FULL; W]),
        }
    }

    /// Take ownership of one available index.
    ///
    /// Scans bit by bit and retries the same bit if another party changed its word in between.
    /// Returns `None` after a single scan finds nothing, it never waits for a release.
    pub fn reserve(&self) -> Option<usize> {
        for (j, word) in self.words.iter().enumerate() {
            let mut bit = 0;

            while bit < 64 {
                let available = word.load(Ordering::Acquire);
                if available == 0 {
                    break;
                }

                let mask = 1u64 << bit;
                if available & mask == 0 {
                    bit += 1;
                    continue;
                }

                if word
                    .compare_exchange(available, available & !mask, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(j * 64 + bit);
                }
            }
        }

        None
    }

    /// Return an index obtained from [`BitPool::reserve`].
    pub fn release(&self, index: usize) {
        debug_assert!(index < Self::CAPACITY);
        let previous = self.words[index / 64].fetch_or(1 << (index % 64), Ordering::Release);
        debug_assert!(previous & (1 << (index % 64)) == 0, "double release of {index}");
    }

    pub fn available(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn reset(&self) {
        for word in self.words.iter() {
            word.store(u64::MAX, Ordering::Relaxed);
        }
    }
}

/// A lock word usable across processes.
#[repr(C)]
pub struct SpinLock {
    locked: AtomicU32,
}

pub struct SpinGuard<'lt> {
    lock: &'lt SpinLock,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        SpinGuard { lock: self }
    }

    fn reset(&self) {
        self.locked.store(0, Ordering::Relaxed);
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(0, Ordering::Release);
    }
}

/// The pool of page-sized buffers that stage message payloads.
///
/// The availability mask transfers ownership of an index. The per-buffer lock orders the raw
/// byte copies of the owner against those of the previous and next owner.
#[repr(C)]
pub struct CopyBufs {
    locks: [SpinLock; NUM_BUFS],
    bufs: [CopyBuf; NUM_BUFS],
    available: BitPool<1>,
}

#[repr(C)]
struct CopyBuf(UnsafeCell<[u8; COPY_BUF_SIZE]>);

// Safety: bytes of a buffer are only accessed under its lock.
unsafe impl Sync for CopyBufs {}

impl CopyBufs {
    pub fn reserve(&self) -> Option<u8> {
        self.available.reserve().map(|idx| idx as u8)
    }

    pub fn release(&self, idx: u8) {
        self.available.release(usize::from(idx))
    }

    pub fn available(&self) -> usize {
        self.available.available()
    }

    /// Copy `data` to the start of buffer `idx`.
    ///
    /// At most [`COPY_BUF_SIZE`] bytes are copied, the count is returned.
    pub fn copy_to(&self, idx: u8, data: &[u8]) -> usize {
        let len = data.len().min(COPY_BUF_SIZE);
        let buf = &self.bufs[usize::from(idx)];

        let _guard = self.locks[usize::from(idx)].lock();
        // Safety: the lock excludes all other accesses to these bytes.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), buf.0.get().cast::<u8>(), len) };
        len
    }

    /// Copy the start of buffer `idx` into `data`.
    pub fn copy_from(&self, idx: u8, data: &mut [u8]) -> usize {
        let len = data.len().min(COPY_BUF_SIZE);
        let buf = &self.bufs[usize::from(idx)];

        let _guard = self.locks[usize::from(idx)].lock();
        // Safety: the lock excludes all other accesses to these bytes.
        unsafe { core::ptr::copy_nonoverlapping(buf.0.get().cast::<u8>(), data.as_mut_ptr(), len) };
        len
    }

    pub(crate) fn reset(&self) {
        for lock in &self.locks {
            lock.reset();
        }

        self.available.reset();
    }
}

#[test]
fn reserve_until_exhausted() {
    static POOL: BitPool<2> = BitPool::full();

    let mut seen = [false; 128];
    for _ in 0..128 {
        let idx = POOL.reserve().unwrap();
        assert!(!seen[idx]);
        seen[idx] = true;
    }

    assert_eq!(POOL.reserve(), None);
    assert_eq!(POOL.available(), 0);

    POOL.release(77);
    assert_eq!(POOL.reserve(), Some(77));
}
