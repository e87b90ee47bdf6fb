use crate::hdr::{CmdHdr, CmdKind, HdrError, MsgHdr, MsgKind};
use crate::pool::BitPool;
use crate::ring::Ring;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn concurrent_ring_loses_nothing() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 20_000;
    const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

    let ring: &'static Ring<64> = Box::leak(Box::new(Ring::new()));
    let seen: &'static [AtomicBool] =
        Box::leak((0..TOTAL).map(|_| AtomicBool::new(false)).collect::<Box<[_]>>());
    let popped = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for p in 0..PRODUCERS {
            scope.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = NonZeroU64::new(p * PER_PRODUCER + i + 1).unwrap();
                    while ring.push(value).is_err() {
                        std::thread::yield_now();
                    }
                }
            });
        }

        for _ in 0..4 {
            scope.spawn(|| {
                while popped.load(Ordering::Relaxed) < TOTAL {
                    let Some(value) = ring.pop() else {
                        std::thread::yield_now();
                        continue;
                    };

                    let was = seen[value.get() as usize - 1].swap(true, Ordering::Relaxed);
                    assert!(!was, "duplicate {value}");
                    popped.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert!(ring.is_empty());
    assert!(seen.iter().all(|v| v.load(Ordering::Relaxed)));
}

#[test]
fn per_producer_order_is_fifo() {
    let ring: &'static Ring<8> = Box::leak(Box::new(Ring::new()));

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 1..=10_000u64 {
                while ring.push(NonZeroU64::new(i).unwrap()).is_err() {
                    core::hint::spin_loop();
                }
            }
        });

        let mut expected = 1;
        while expected <= 10_000 {
            if let Some(value) = ring.pop() {
                assert_eq!(value.get(), expected);
                expected += 1;
            }
        }
    });
}

#[test]
fn bit_pool_ownership_is_exclusive() {
    let pool: &'static BitPool<1> = Box::leak(Box::new(BitPool::full()));
    let owned: &'static [AtomicBool] =
        Box::leak((0..64).map(|_| AtomicBool::new(false)).collect::<Box<[_]>>());

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let mut held = vec![];
                for round in 0..5_000 {
                    if let Some(idx) = pool.reserve() {
                        assert!(!owned[idx].swap(true, Ordering::AcqRel), "{idx} reserved twice");
                        held.push(idx);
                    }

                    if round % 3 == 0 || held.len() > 6 {
                        while let Some(idx) = held.pop() {
                            owned[idx].store(false, Ordering::Release);
                            pool.release(idx);
                        }
                    }
                }

                for idx in held {
                    owned[idx].store(false, Ordering::Release);
                    pool.release(idx);
                }
            });
        }
    });

    assert_eq!(pool.available(), 64);
}

#[test]
fn message_header_layout() {
    let hdr = MsgHdr {
        kind: MsgKind::Expected,
        buf_idx: 0x3f,
        buf_size: 0x1000,
        tag: 0xdead_beef,
    };

    let raw = hdr.encode();
    assert_eq!(raw.get(), 0x023f_1000_dead_beef);
    assert_eq!(MsgHdr::decode(raw), Ok(hdr));

    // Everything zero but the kind still encodes to a usable slot value.
    let empty = MsgHdr {
        kind: MsgKind::Unexpected,
        buf_idx: 0,
        buf_size: 0,
        tag: 0,
    };
    assert_eq!(empty.encode().get(), 1 << 56);
}

#[test]
fn command_header_layout() {
    let hdr = CmdHdr {
        kind: CmdKind::Released,
        pid: 4242,
        id: 7,
        pair_idx: 255,
    };

    let raw = hdr.encode();
    assert_eq!(raw.get(), 2 << 48 | 255 << 40 | 7 << 32 | 4242);
    assert_eq!(CmdHdr::decode(raw), Ok(hdr));

    let bad_kind = NonZeroU64::new(9 << 48 | 1).unwrap();
    assert_eq!(CmdHdr::decode(bad_kind), Err(HdrError::Kind(9)));

    let bad_pad = NonZeroU64::new(1 << 56 | 1 << 48).unwrap();
    assert!(matches!(CmdHdr::decode(bad_pad), Err(HdrError::Padding(_))));
}
