use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// A bounded multi-producer, multi-consumer ring of non-zero words.
///
/// Similar in design to the FreeBSD `buf_ring`. Each side owns a pair of free-running cursors: a
/// party first claims a slot by advancing `head` and then publishes its effect by advancing `tail`
/// in claim order. Publication in order means a producer (consumer) briefly waits for those that
/// claimed before it.
///
/// The ring lives in shared memory and never contains a pointer. A zero slot value would be
/// indistinguishable from an empty ring to readers that inspect slots, hence only [`NonZeroU64`] is
/// accepted.
#[repr(C)]
pub struct Ring<const N: usize> {
    prod: CachePadded<Cursor>,
    cons: CachePadded<Cursor>,
    slots: CachePadded<[AtomicU64; N]>,
}

/// The ring has no free slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Full;

#[repr(C)]
struct Cursor {
    head: AtomicU32,
    tail: AtomicU32,
}

impl<const N: usize> Ring<N> {
    const MASK: u32 = {
        assert!(N.is_power_of_two() && N <= 1 << 16);
        (N - 1) as u32
    };

    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);

        Ring {
            prod: CachePadded::new(Cursor::new()),
            cons: CachePadded::new(Cursor::new()),
            slots: CachePadded::new([ZERO; N]),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Return to the empty state.
    ///
    /// Only valid while no other party accesses the ring, i.e. while initializing a region.
    pub fn reset(&self) {
        for cursor in [&*self.prod, &*self.cons] {
            cursor.head.store(0, Ordering::Relaxed);
            cursor.tail.store(0, Ordering::Relaxed);
        }

        for slot in self.slots.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }

    pub fn push(&self, value: NonZeroU64) -> Result<(), Full> {
        let mut head = self.prod.head.load(Ordering::Relaxed);

        loop {
            let cons_tail = self.cons.tail.load(Ordering::Acquire);
            if head.wrapping_sub(cons_tail) >= N as u32 {
                return Err(Full);
            }

            match self.prod.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.slots[(head & Self::MASK) as usize].store(value.get(), Ordering::Relaxed);

        // Publish after every earlier claim did, so that the tail covers only written slots.
        while self.prod.tail.load(Ordering::Acquire) != head {
            core::hint::spin_loop();
        }

        self.prod.tail.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<NonZeroU64> {
        let mut head = self.cons.head.load(Ordering::Relaxed);

        loop {
            let prod_tail = self.prod.tail.load(Ordering::Acquire);
            if prod_tail == head {
                return None;
            }

            match self.cons.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let value = self.slots[(head & Self::MASK) as usize].load(Ordering::Relaxed);

        // The slot may only be reused by producers once every earlier consumer is done with it.
        while self.cons.tail.load(Ordering::Acquire) != head {
            core::hint::spin_loop();
        }

        self.cons.tail.store(head.wrapping_add(1), Ordering::Release);
        debug_assert!(value != 0, "zero values are never pushed");
        NonZeroU64::new(value)
    }

    pub fn is_empty(&self) -> bool {
        let head = self.cons.head.load(Ordering::Acquire);
        self.prod.tail.load(Ordering::Acquire) == head
    }

    /// The number of published, not yet claimed entries. Only a snapshot.
    pub fn len(&self) -> usize {
        let head = self.cons.head.load(Ordering::Acquire);
        let tail = self.prod.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(N as u32) as usize
    }
}

impl<const N: usize> Default for Ring<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl Cursor {
    const fn new() -> Self {
        Cursor {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }
}

#[test]
fn primitive_ring_ops() {
    static RING: Ring<16> = Ring::new();

    let value = |v: u64| NonZeroU64::new(v).unwrap();

    assert!(RING.is_empty());
    assert_eq!(RING.pop(), None);

    for i in 1..=16 {
        RING.push(value(i)).unwrap();
    }

    assert_eq!(RING.len(), 16);
    assert_eq!(RING.push(value(0xdead_beef)), Err(Full));

    for i in 1..=16 {
        assert_eq!(RING.pop(), Some(value(i)));
    }

    assert_eq!(RING.pop(), None);

    // Cursors wrap past the slot array.
    RING.push(value(17)).unwrap();
    assert_eq!(RING.pop(), Some(value(17)));
    assert!(RING.is_empty());
}
