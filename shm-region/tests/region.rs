#![cfg(target_os = "linux")]
use memfile::CreateOptions;
use shm_fd::Shm;
use shm_region::{AreaFd, CmdHdr, CmdKind, MsgHdr, MsgKind, Region, SharedRegion, MAX_PEERS, NUM_BUFS};
use std::os::fd::OwnedFd;

fn two_views() -> (SharedRegion, SharedRegion) {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len(Region::SIZE as u64).unwrap();
    let other = file.try_clone().unwrap();

    let shm = Shm::new();
    let area = AreaFd::new(OwnedFd::from(file.into_file()), &shm).unwrap();
    let first = SharedRegion::from_area(&area, "first").unwrap();
    first.get().reset();

    let area = AreaFd::new(OwnedFd::from(other.into_file()), &shm).unwrap();
    let second = SharedRegion::from_area(&area, "second").unwrap();

    (first, second)
}

#[test]
fn views_share_state() {
    let (a, b) = two_views();
    let (a, b) = (a.get(), b.get());

    assert_eq!(b.available_pairs(), MAX_PEERS);
    assert_eq!(b.copy_bufs().available(), NUM_BUFS);

    let pair = b.reserve_pair().unwrap();
    assert_eq!(a.available_pairs(), MAX_PEERS - 1);

    let buf = a.copy_bufs().reserve().unwrap();
    assert_eq!(a.copy_bufs().copy_to(buf, b"Hello, world"), 12);

    let hdr = MsgHdr {
        kind: MsgKind::Unexpected,
        buf_idx: buf,
        buf_size: 12,
        tag: 7,
    };
    a.queue_pair(pair).tx.push(hdr.encode()).unwrap();

    let received = MsgHdr::decode(b.queue_pair(pair).tx.pop().unwrap()).unwrap();
    assert_eq!(received, hdr);

    let mut data = [0u8; 12];
    b.copy_bufs().copy_from(received.buf_idx, &mut data);
    b.copy_bufs().release(received.buf_idx);
    assert_eq!(&data, b"Hello, world");
    assert_eq!(a.copy_bufs().available(), NUM_BUFS);

    b.release_pair(pair);
    assert_eq!(a.available_pairs(), MAX_PEERS);
}

#[test]
fn released_pair_starts_empty() {
    let (a, b) = two_views();
    let (a, b) = (a.get(), b.get());

    let pair = a.reserve_pair().unwrap();
    for tag in 1..=3 {
        let buf = a.copy_bufs().reserve().unwrap();
        let hdr = MsgHdr {
            kind: MsgKind::Expected,
            buf_idx: buf,
            buf_size: 0,
            tag,
        };
        a.queue_pair(pair).tx.push(hdr.encode()).unwrap();
    }

    // Only the first message is picked up before the peer goes away.
    let first = MsgHdr::decode(b.queue_pair(pair).tx.pop().unwrap()).unwrap();
    assert_eq!(first.tag, 1);
    b.copy_bufs().release(first.buf_idx);

    assert_eq!(b.release_pair(pair), 2);
    assert_eq!(a.copy_bufs().available(), NUM_BUFS);

    let again = a.reserve_pair().unwrap();
    assert_eq!(again, pair);
    assert!(b.queue_pair(again).tx.is_empty());
    assert!(b.queue_pair(again).rx.is_empty());

    let buf = a.copy_bufs().reserve().unwrap();
    let hdr = MsgHdr {
        kind: MsgKind::Expected,
        buf_idx: buf,
        buf_size: 0,
        tag: 99,
    };
    a.queue_pair(again).tx.push(hdr.encode()).unwrap();
    assert_eq!(MsgHdr::decode(b.queue_pair(again).tx.pop().unwrap()).unwrap().tag, 99);
}

#[test]
fn command_ring_holds_two_per_peer() {
    let (a, _b) = two_views();
    let queue = a.get().cmd_queue();

    for pid in 0..queue.capacity() as u32 {
        let cmd = CmdHdr {
            kind: CmdKind::Reserved,
            pid,
            id: 1,
            pair_idx: 0,
        };
        queue.push(cmd.encode()).unwrap();
    }

    let overflow = CmdHdr {
        kind: CmdKind::Released,
        pid: 0,
        id: 0,
        pair_idx: 0,
    };
    assert!(queue.push(overflow.encode()).is_err());

    let first = CmdHdr::decode(queue.pop().unwrap()).unwrap();
    assert_eq!(first.pid, 0);
    assert_eq!(first.kind, CmdKind::Reserved);
}

#[test]
fn named_region_lifecycle() {
    let shm = Shm::new();
    let name = format!("{}-{}", env!("CARGO_PKG_NAME"), std::process::id());

    let created = SharedRegion::create(&shm, &name).unwrap();
    assert!(SharedRegion::create(&shm, &name).is_err());

    let opened = SharedRegion::open(&shm, &name).unwrap();
    let idx = opened.get().reserve_pair().unwrap();
    assert_eq!(created.get().available_pairs(), MAX_PEERS - 1);
    created.get().release_pair(idx);

    created.unlink(&shm).unwrap();
    assert!(SharedRegion::open(&shm, &name).is_err());

    // Existing mappings outlive the name.
    assert_eq!(opened.get().available_pairs(), MAX_PEERS);
}

#[test]
fn rejects_small_objects() {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len(4096).unwrap();

    let area = AreaFd::new(OwnedFd::from(file.into_file()), &Shm::new()).unwrap();
    assert!(SharedRegion::from_area(&area, "small").is_err());
}
