use crate::addr::{deserialize, parse};
use crate::endpoint::PollKey;
use crate::id::InstanceId;
use crate::op::{Callback, CallbackInfo, Context, OpId, OpKind};
use crate::rma::{MemAccess, MemHandle};
use crate::{cleanup, Cleanup, Error, HostId, IoSegment, Naming};

#[test]
fn address_strings() {
    assert_eq!(parse("sm://1234/7"), Ok((1234, 7)));
    assert_eq!(parse("1234/7"), Ok((1234, 7)));
    assert_eq!(parse("tcp://1234/7"), Err(Error::ProtoNoSupport));
    assert_eq!(parse("sm://1234"), Err(Error::InvalidArg));
    assert_eq!(parse("sm://1234/256"), Err(Error::InvalidArg));
    assert_eq!(parse("sm://-1/0"), Err(Error::InvalidArg));
}

#[test]
fn address_wire_form() {
    let mut buf = [0u8; 5];
    buf[..4].copy_from_slice(&4321u32.to_ne_bytes());
    buf[4] = 9;

    assert_eq!(deserialize(&buf), Ok((4321, 9)));
    assert_eq!(deserialize(&buf[..4]), Err(Error::Overflow));
}

#[test]
fn errno_table() {
    assert_eq!(Error::from_errno(libc::EAGAIN), Error::Again);
    assert_eq!(Error::from_errno(libc::ENAMETOOLONG), Error::Overflow);
    assert_eq!(Error::from_errno(libc::EOVERFLOW), Error::Overflow);
    assert_eq!(Error::from_errno(libc::ECANCELED), Error::Canceled);
    assert_eq!(Error::from_errno(libc::EXDEV), Error::ProtocolError);

    let err = std::io::Error::from_raw_os_error(libc::EADDRINUSE);
    assert_eq!(Error::from(err), Error::AddrInUse);
    let err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
    assert_eq!(Error::from(err), Error::Again);

    assert!(Error::Again.is_retryable());
    assert!(!Error::Busy.is_retryable());
}

#[test]
fn object_names() {
    let naming = Naming::new("/tmp", "alice");
    assert_eq!(naming.shm_name(42, 3), "na_sm_alice-42-3");
    assert_eq!(
        naming.sock_path(42, 3),
        std::path::Path::new("/tmp/na_sm_alice/42/3/sock")
    );
}

#[test]
fn poll_tokens() {
    for key in [PollKey::Sock, PollKey::TxNotify, PollKey::RxNotify(0), PollKey::RxNotify(77)] {
        assert_eq!(PollKey::from_token(key.token()), Some(key));
    }

    assert_eq!(PollKey::from_token(0), None);
}

fn handle() -> MemHandle {
    let segments = vec![
        IoSegment { base: 0x1000, len: 16 },
        IoSegment { base: 0x8000, len: 0 },
        IoSegment { base: 0x4000, len: 8 },
        IoSegment { base: 0x2000, len: 32 },
    ];

    MemHandle::new(segments, MemAccess::ReadWrite).unwrap()
}

#[test]
fn mem_handle_wire_form() {
    let handle = handle();
    assert_eq!(handle.len(), 56);
    assert_eq!(handle.serialize_size(), 24 + 4 * 16);

    let mut buf = vec![0u8; handle.serialize_size()];
    assert_eq!(handle.serialize(&mut buf), Ok(buf.len()));
    assert_eq!(MemHandle::deserialize(&buf), Ok(handle.clone()));

    assert_eq!(handle.serialize(&mut buf[..30]), Err(Error::Overflow));
    assert_eq!(MemHandle::deserialize(&buf[..30]), Err(Error::Overflow));

    buf[16] = 0;
    assert_eq!(MemHandle::deserialize(&buf), Err(Error::InvalidArg));
}

#[test]
fn translate_segments() {
    let handle = handle();

    assert_eq!(
        handle.translate(12, 16).unwrap(),
        [
            IoSegment { base: 0x100c, len: 4 },
            IoSegment { base: 0x4000, len: 8 },
            IoSegment { base: 0x2000, len: 4 },
        ]
    );

    assert_eq!(
        handle.translate(16, 8).unwrap(),
        [IoSegment { base: 0x4000, len: 8 }]
    );

    assert_eq!(
        handle.translate(30, 26).unwrap(),
        [IoSegment { base: 0x2006, len: 26 }]
    );

    assert!(handle.translate(56, 0).unwrap().is_empty());
    assert_eq!(handle.translate(50, 7), Err(Error::InvalidArg));
    assert_eq!(handle.translate(usize::MAX, 2), Err(Error::InvalidArg));
}

#[test]
fn instance_ids_are_unique() {
    let held: Vec<_> = (0..8).map(|_| InstanceId::allocate().unwrap()).collect();

    let mut ids: Vec<u8> = held.iter().map(InstanceId::get).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), held.len());
}

#[test]
fn host_id_text() {
    let id = HostId::get();
    assert_eq!(id.to_string().len(), 8);
    assert_eq!(id.to_string().parse::<HostId>(), Ok(id));
    assert_eq!("0x0000abcd".parse::<HostId>().map(|id| id.raw()), Ok(0xabcd));
}

fn noop() -> Callback {
    Box::new(|_: CallbackInfo| {})
}

#[test]
fn op_slot_reuse() {
    let context = Context::new();
    let op = OpId::new();
    assert!(op.is_completed());

    op.begin(OpKind::Put, &context, noop(), None, vec![], 0)
        .unwrap();
    assert!(!op.is_completed());

    let again = op.begin(OpKind::Get, &context, noop(), None, vec![], 0);
    assert_eq!(again.err(), Some(Error::Busy));

    op.complete(Ok(()), None);
    assert!(op.is_completed());
    assert_eq!(context.pending(), 1);

    // Completed, but the callback did not run yet.
    let again = op.begin(OpKind::Get, &context, noop(), None, vec![], 0);
    assert_eq!(again.err(), Some(Error::Busy));

    assert_eq!(context.trigger(8), 1);
    op.begin(OpKind::Get, &context, noop(), None, vec![], 0)
        .unwrap();
}

#[test]
fn canceled_completion() {
    let context = Context::new();
    let op = OpId::new();

    let callback: Callback = Box::new(|info: CallbackInfo| {
        assert_eq!(info.kind, OpKind::RecvExpected);
        assert_eq!(info.ret, Err(Error::Canceled));
        assert_eq!(info.buf.len(), 32);
    });

    op.begin(OpKind::RecvExpected, &context, callback, None, vec![0; 32], 5)
        .unwrap();

    op.set_canceled();
    op.complete(Ok(()), None);
    assert_eq!(context.trigger(1), 1);
}

#[test]
fn cleanup_matches_whole_user_name() {
    let shm = tempfile::tempdir().unwrap();
    for name in ["na_sm_na-12-3", "na_sm_na-test-12-3", "na_sm_na-12-300", "na_sm_na-12", "na_sm_na-x-1"] {
        std::fs::write(shm.path().join(name), b"").unwrap();
    }

    let mut options = Cleanup::new(Naming::new(shm.path().join("tmp"), "na"));
    options.shm_dir = shm.path().to_owned();
    options.dry_run = true;

    let report = cleanup(&options).unwrap();
    assert!(report.dirs.is_empty());
    assert_eq!(report.segments, ["na_sm_na-12-3"]);
}
