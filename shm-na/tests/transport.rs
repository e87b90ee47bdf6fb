#![cfg(target_os = "linux")]
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use shm_fd::Shm;
use shm_na::{
    CallbackInfo, Class, Config, Context, Error, MemAccess, OpKind, Progress, ProgressMode,
    Transfer,
};
use shm_region::{SharedRegion, MAX_PEERS, NUM_BUFS};

struct Peer {
    class: Class,
    context: Context,
}

impl Peer {
    fn new(dir: &Path, mode: ProgressMode, listen: bool) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let config = Config {
            listen,
            progress_mode: mode,
            tmp_dir: dir.to_owned(),
            user: Some("na-test".to_owned()),
            ..Config::default()
        };

        let class = Class::initialize(config).expect("to initialize");
        let context = class.context_create();
        Peer { class, context }
    }

    /// Progress and trigger until nothing happens anymore.
    fn settle(&self) {
        for _ in 0..1000 {
            self.context.trigger(usize::MAX);
            let progress = self
                .class
                .progress(&self.context, Duration::from_millis(10))
                .unwrap();

            if progress == Progress::TimedOut {
                return;
            }
        }

        panic!("progress never settled");
    }

    fn region(&self) -> SharedRegion {
        let me = self.class.addr_self();
        let name = self.class.naming().shm_name(me.pid(), me.id());
        SharedRegion::open(&Shm::new(), &name).unwrap()
    }

    fn finalize(self) {
        if let Err((_, err)) = self.class.finalize() {
            panic!("finalize failed: {err}");
        }
    }
}

fn collect() -> (impl FnOnce(CallbackInfo) + Send + 'static, mpsc::Receiver<CallbackInfo>) {
    let (tx, rx) = mpsc::channel();
    let callback = move |info| {
        let _ = tx.send(info);
    };

    (callback, rx)
}

fn unexpected_message_is_held(mode: ProgressMode) {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), mode, true);
    let b = Peer::new(dir.path(), mode, true);

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let op = a.class.op_create();
    let (callback, sent) = collect();
    a.class
        .msg_send_unexpected(&a.context, callback, vec![0x5a; 64], &to_b, 7, &op)
        .unwrap();

    a.settle();
    let info = sent.try_recv().unwrap();
    assert_eq!(info.kind, OpKind::SendUnexpected);
    assert_eq!(info.ret, Ok(()));

    // Nothing is posted yet, so the message is held back.
    b.settle();

    let op = b.class.op_create();
    let (callback, received) = collect();
    b.class
        .msg_recv_unexpected(&b.context, callback, vec![0; 4096], &op)
        .unwrap();

    assert_eq!(b.context.trigger(usize::MAX), 1);
    let info = received.try_recv().unwrap();
    assert_eq!(info.ret, Ok(()));
    assert_eq!(info.actual_size, 64);
    assert_eq!(info.tag, 7);
    assert!(info.buf[..64].iter().all(|&byte| byte == 0x5a));

    let source = info.source.expect("a source address");
    assert_eq!(source, a.class.addr_self());
    assert!(source.is_unexpected());
    assert_eq!(source.to_string(), a.class.addr_self().to_string());

    assert!(b.class.op_destroy(op).is_ok());
    drop(source);
    b.finalize();
    a.finalize();
}

#[test]
fn unexpected_message_is_held_blocking() {
    unexpected_message_is_held(ProgressMode::Blocking);
}

#[test]
fn unexpected_message_is_held_noblock() {
    unexpected_message_is_held(ProgressMode::NoBlock);
}

fn send_waits_for_copy_buffer(mode: ProgressMode) {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), mode, true);
    let b = Peer::new(dir.path(), mode, true);

    let from_a = b.class.addr_lookup(&a.class.addr_self().to_string()).unwrap();
    let recv_op = b.class.op_create();
    let (callback, received) = collect();
    b.class
        .msg_recv_expected(&b.context, callback, vec![0; 64], &from_a, 3, &recv_op)
        .unwrap();

    let region = b.region();
    let bufs = region.get().copy_bufs();
    let taken: Vec<u8> = std::iter::from_fn(|| bufs.reserve()).collect();
    assert_eq!(taken.len(), NUM_BUFS);

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let send_op = a.class.op_create();
    let (callback, sent) = collect();
    a.class
        .msg_send_expected(&a.context, callback, b"payload".to_vec(), &to_b, 3, &send_op)
        .unwrap();

    assert!(!a.class.poll_try_wait(&a.context));
    assert_eq!(a.class.progress(&a.context, Duration::ZERO), Ok(Progress::TimedOut));
    assert_eq!(a.context.trigger(usize::MAX), 0);
    assert!(!send_op.is_completed());

    bufs.release(taken[0]);
    assert_eq!(
        a.class.progress(&a.context, Duration::from_millis(100)),
        Ok(Progress::Progressed)
    );

    assert_eq!(a.context.trigger(usize::MAX), 1);
    assert_eq!(sent.try_recv().unwrap().ret, Ok(()));

    a.settle();
    assert!(sent.try_recv().is_err());

    b.settle();
    let info = received.try_recv().unwrap();
    assert_eq!(info.ret, Ok(()));
    assert_eq!(info.tag, 3);
    assert_eq!(&info.buf[..info.actual_size], b"payload");

    for idx in &taken[1..] {
        bufs.release(*idx);
    }

    assert_eq!(bufs.available(), NUM_BUFS);
    b.finalize();
    a.finalize();
}

#[test]
fn send_waits_for_copy_buffer_blocking() {
    send_waits_for_copy_buffer(ProgressMode::Blocking);
}

#[test]
fn send_waits_for_copy_buffer_noblock() {
    send_waits_for_copy_buffer(ProgressMode::NoBlock);
}

fn cancel_after_completion(mode: ProgressMode) {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), mode, true);
    let b = Peer::new(dir.path(), mode, true);

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let op = a.class.op_create();
    let (callback, sent) = collect();
    a.class
        .msg_send_unexpected(&a.context, callback, vec![1; 16], &to_b, 0, &op)
        .unwrap();

    a.class.cancel(&op).unwrap();
    assert_eq!(a.context.trigger(usize::MAX), 1);
    assert_eq!(sent.try_recv().unwrap().ret, Ok(()));

    // A receive that is still waiting is canceled.
    let (callback, received) = collect();
    a.class
        .msg_recv_unexpected(&a.context, callback, vec![0; 16], &op)
        .unwrap();
    a.class.cancel(&op).unwrap();
    assert_eq!(a.context.trigger(usize::MAX), 1);

    let info = received.try_recv().unwrap();
    assert_eq!(info.ret, Err(Error::Canceled));
    assert_eq!(info.actual_size, 0);
    assert!(info.source.is_none());

    b.settle();
    let (callback, received) = collect();
    b.class
        .msg_recv_unexpected(&b.context, callback, vec![0; 16], &b.class.op_create())
        .unwrap();
    b.context.trigger(usize::MAX);
    assert_eq!(received.try_recv().unwrap().actual_size, 16);

    b.finalize();
    a.finalize();
}

#[test]
fn cancel_after_completion_blocking() {
    cancel_after_completion(ProgressMode::Blocking);
}

#[test]
fn cancel_after_completion_noblock() {
    cancel_after_completion(ProgressMode::NoBlock);
}

fn close_with_pending_receive(mode: ProgressMode) {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), mode, true);

    let from_self = a.class.addr_self();
    let op = a.class.op_create();
    let (callback, received) = collect();
    a.class
        .msg_recv_expected(&a.context, callback, vec![0; 8], &from_self, 1, &op)
        .unwrap();

    assert_eq!(a.class.op_destroy(op.clone()), Err(Error::Busy));

    let Peer { class, context } = a;
    let (class, err) = class.finalize().err().expect("a pending receive");
    assert_eq!(err, Error::Busy);

    // Still open.
    let me = class.addr_self();
    let name = class.naming().shm_name(me.pid(), me.id());
    assert!(SharedRegion::open(&Shm::new(), &name).is_ok());

    class.cancel(&op).unwrap();
    assert_eq!(context.trigger(usize::MAX), 1);
    assert_eq!(received.try_recv().unwrap().ret, Err(Error::Canceled));

    drop(from_self);
    Peer { class, context }.finalize();
    assert!(SharedRegion::open(&Shm::new(), &name).is_err());
}

#[test]
fn close_with_pending_receive_blocking() {
    close_with_pending_receive(ProgressMode::Blocking);
}

#[test]
fn close_with_pending_receive_noblock() {
    close_with_pending_receive(ProgressMode::NoBlock);
}

fn retries_run_with_pending_completions(mode: ProgressMode) {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), mode, true);
    let b = Peer::new(dir.path(), mode, true);

    let region = b.region();
    let bufs = region.get().copy_bufs();
    let taken: Vec<u8> = std::iter::from_fn(|| bufs.reserve()).collect();

    // A completion that is not triggered before progress is called.
    let recv_op = a.class.op_create();
    let (callback, canceled) = collect();
    a.class
        .msg_recv_unexpected(&a.context, callback, vec![0; 8], &recv_op)
        .unwrap();
    a.class.cancel(&recv_op).unwrap();
    assert_eq!(a.context.pending(), 1);

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let send_op = a.class.op_create();
    let (callback, sent) = collect();
    a.class
        .msg_send_unexpected(&a.context, callback, vec![5; 8], &to_b, 4, &send_op)
        .unwrap();
    assert!(!send_op.is_completed());

    bufs.release(taken[0]);
    assert_eq!(
        a.class.progress(&a.context, Duration::from_millis(50)),
        Ok(Progress::Progressed)
    );
    assert!(send_op.is_completed());

    assert_eq!(a.context.trigger(usize::MAX), 2);
    assert_eq!(canceled.try_recv().unwrap().ret, Err(Error::Canceled));
    assert_eq!(sent.try_recv().unwrap().ret, Ok(()));

    b.settle();
    let (callback, received) = collect();
    b.class
        .msg_recv_unexpected(&b.context, callback, vec![0; 8], &b.class.op_create())
        .unwrap();
    b.context.trigger(usize::MAX);
    assert_eq!(received.try_recv().unwrap().tag, 4);

    for idx in &taken[1..] {
        bufs.release(*idx);
    }

    b.finalize();
    a.finalize();
}

#[test]
fn retries_run_with_pending_completions_blocking() {
    retries_run_with_pending_completions(ProgressMode::Blocking);
}

#[test]
fn retries_run_with_pending_completions_noblock() {
    retries_run_with_pending_completions(ProgressMode::NoBlock);
}

fn cancel_parked_send(mode: ProgressMode) {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), mode, true);
    let b = Peer::new(dir.path(), mode, true);

    let region = b.region();
    let bufs = region.get().copy_bufs();
    let taken: Vec<u8> = std::iter::from_fn(|| bufs.reserve()).collect();

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let op = a.class.op_create();
    let (callback, sent) = collect();
    a.class
        .msg_send_unexpected(&a.context, callback, vec![8; 8], &to_b, 8, &op)
        .unwrap();
    assert!(!op.is_completed());

    a.class.cancel(&op).unwrap();
    assert!(op.is_completed());
    assert_eq!(a.context.trigger(usize::MAX), 1);
    assert_eq!(sent.try_recv().unwrap().ret, Err(Error::Canceled));

    // Buffers are free again, but the canceled send must not go out.
    for idx in taken {
        bufs.release(idx);
    }

    a.settle();
    assert!(sent.try_recv().is_err());
    b.settle();
    assert_eq!(bufs.available(), NUM_BUFS);

    let recv_op = b.class.op_create();
    let (callback, received) = collect();
    b.class
        .msg_recv_unexpected(&b.context, callback, vec![0; 8], &recv_op)
        .unwrap();
    assert_eq!(b.context.trigger(usize::MAX), 0);

    b.class.cancel(&recv_op).unwrap();
    assert_eq!(b.context.trigger(usize::MAX), 1);
    assert_eq!(received.try_recv().unwrap().ret, Err(Error::Canceled));

    b.finalize();
    a.finalize();
}

#[test]
fn cancel_parked_send_blocking() {
    cancel_parked_send(ProgressMode::Blocking);
}

#[test]
fn cancel_parked_send_noblock() {
    cancel_parked_send(ProgressMode::NoBlock);
}

fn send_all(peer: &Peer, to: &str, tags: &[u32]) {
    let dest = peer.class.addr_lookup(to).unwrap();
    let op = peer.class.op_create();

    for &tag in tags {
        let (callback, _) = collect();
        peer.class
            .msg_send_unexpected(&peer.context, callback, vec![tag as u8; 32], &dest, tag, &op)
            .unwrap();
        assert_eq!(peer.context.trigger(usize::MAX), 1);
    }
}

fn recv_from(peer: &Peer, tag: u32, source: &str) {
    let (callback, received) = collect();
    peer.class
        .msg_recv_unexpected(&peer.context, callback, vec![0; 32], &peer.class.op_create())
        .unwrap();
    assert_eq!(peer.context.trigger(usize::MAX), 1);

    let info = received.try_recv().unwrap();
    assert_eq!(info.ret, Ok(()));
    assert_eq!(info.tag, tag);
    assert_eq!(info.buf, [tag as u8; 32]);
    assert_eq!(info.source.unwrap().to_string(), source);
}

fn released_pair_is_drained_and_reused(mode: ProgressMode) {
    let dir = tempfile::tempdir().unwrap();
    let b = Peer::new(dir.path(), mode, true);
    let to_b = b.class.addr_self().to_string();
    let region = b.region();

    let a = Peer::new(dir.path(), mode, false);
    let from_a = a.class.addr_self().to_string();
    send_all(&a, &to_b, &[1, 2, 3]);
    a.finalize();

    // Reservation, messages and release are all waiting at once.
    b.settle();
    for tag in [1, 2, 3] {
        recv_from(&b, tag, &from_a);
    }

    assert_eq!(region.get().copy_bufs().available(), NUM_BUFS);
    assert_eq!(region.get().available_pairs(), MAX_PEERS);

    // The next client gets the same pair.
    let c = Peer::new(dir.path(), mode, false);
    let from_c = c.class.addr_self().to_string();
    send_all(&c, &to_b, &[99]);

    b.settle();
    recv_from(&b, 99, &from_c);

    let (callback, _) = collect();
    let op = b.class.op_create();
    b.class
        .msg_recv_unexpected(&b.context, callback, vec![0; 32], &op)
        .unwrap();
    assert_eq!(b.context.trigger(usize::MAX), 0);
    b.class.cancel(&op).unwrap();
    b.context.trigger(usize::MAX);

    c.finalize();
    b.settle();
    assert_eq!(region.get().copy_bufs().available(), NUM_BUFS);
    assert_eq!(region.get().available_pairs(), MAX_PEERS);
    b.finalize();
}

#[test]
fn released_pair_is_drained_and_reused_blocking() {
    released_pair_is_drained_and_reused(ProgressMode::Blocking);
}

#[test]
fn released_pair_is_drained_and_reused_noblock() {
    released_pair_is_drained_and_reused(ProgressMode::NoBlock);
}

/// Collects the messages of warnings.
#[derive(Clone, Default)]
struct Warnings(Arc<Mutex<Vec<String>>>);

struct Message(String);

impl tracing::field::Visit for Message {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Warnings {
    fn on_event(&self, event: &tracing::Event<'_>, _: tracing_subscriber::layer::Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            let mut message = Message(String::new());
            event.record(&mut message);
            self.0.lock().unwrap().push(message.0);
        }
    }
}

#[test]
fn unsent_release_is_a_warning() {
    use tracing_subscriber::layer::SubscriberExt;

    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), ProgressMode::Blocking, false);
    let b = Peer::new(dir.path(), ProgressMode::Blocking, true);

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let (callback, _) = collect();
    a.class
        .msg_send_unexpected(&a.context, callback, vec![0; 4], &to_b, 0, &a.class.op_create())
        .unwrap();
    a.context.trigger(usize::MAX);

    // Gone before it learns about the release.
    drop(b);

    let warnings = Warnings::default();
    let subscriber = tracing_subscriber::registry().with(warnings.clone());
    tracing::subscriber::with_default(subscriber, || {
        drop(to_b);
        a.finalize();
    });

    let warnings = warnings.0.lock().unwrap();
    assert!(
        warnings.iter().any(|message| message == "could not send release"),
        "{warnings:?}"
    );
}

#[test]
fn resolution_is_announced_once() {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), ProgressMode::NoBlock, false);
    let b = Peer::new(dir.path(), ProgressMode::NoBlock, true);

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let op = a.class.op_create();
    for tag in [1, 2] {
        let (callback, _) = collect();
        a.class
            .msg_send_unexpected(&a.context, callback, vec![tag as u8; 4], &to_b, tag, &op)
            .unwrap();
        assert_eq!(a.context.trigger(usize::MAX), 1);
    }

    let region = b.region();
    assert_eq!(region.get().cmd_queue().len(), 1);
    drop(region);

    b.settle();
    for tag in [1, 2] {
        let (callback, received) = collect();
        b.class
            .msg_recv_unexpected(&b.context, callback, vec![0; 4], &b.class.op_create())
            .unwrap();
        b.context.trigger(usize::MAX);

        let info = received.try_recv().unwrap();
        assert_eq!(info.tag, tag);
        assert_eq!(info.buf, [tag as u8; 4]);
    }

    b.finalize();
    a.finalize();
}

#[test]
fn short_receive_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), ProgressMode::Blocking, true);
    let b = Peer::new(dir.path(), ProgressMode::Blocking, true);

    let op = b.class.op_create();
    let (callback, received) = collect();
    b.class
        .msg_recv_unexpected(&b.context, callback, vec![0; 10], &op)
        .unwrap();

    let to_b = a.class.addr_lookup(&b.class.addr_self().to_string()).unwrap();
    let (callback, _) = collect();
    a.class
        .msg_send_unexpected(&a.context, callback, vec![9; 100], &to_b, 0, &a.class.op_create())
        .unwrap();

    b.settle();
    let info = received.try_recv().unwrap();
    assert_eq!(info.ret, Err(Error::MsgSize));
    assert_eq!(info.actual_size, 10);
    assert_eq!(info.buf, [9; 10]);

    let (callback, _) = collect();
    let oversized = vec![0; a.class.msg_max_unexpected_size() + 1];
    let op = a.class.op_create();
    assert_eq!(
        a.class.msg_send_unexpected(&a.context, callback, oversized, &to_b, 0, &op),
        Err(Error::Overflow)
    );
    assert!(op.is_completed());

    a.settle();
    b.finalize();
    a.finalize();
}

#[test]
fn lookup_and_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), ProgressMode::Blocking, false);

    let first = a.class.addr_lookup("sm://4242/17").unwrap();
    let second = a.class.addr_lookup("4242/17").unwrap();
    assert_eq!(first, second);
    assert!(!a.class.addr_is_self(&first));
    assert!(!first.is_resolved());

    let mut buf = [0u8; 8];
    let len = a.class.addr_serialize(&first, &mut buf).unwrap();
    assert_eq!(len, a.class.addr_serialize_size(&first));
    assert_eq!(a.class.addr_deserialize(&buf[..len]), Ok(first.clone()));

    let me = a.class.addr_self();
    assert!(a.class.addr_is_self(&me));
    assert_eq!(a.class.addr_lookup(&me.to_string()), Ok(me.clone()));

    let unknown = a.class.addr_lookup("sm://4243/17").unwrap();
    let len = a.class.addr_serialize(&unknown, &mut buf).unwrap();
    drop(unknown);
    assert_eq!(a.class.addr_deserialize(&buf[..len]), Err(Error::NoEntry));

    assert_eq!(a.class.addr_lookup("tcp://1/1").err(), Some(Error::ProtoNoSupport));
    assert_eq!(a.class.addr_lookup("sm://1").err(), Some(Error::InvalidArg));
    assert!(shm_na::check_protocol(a.class.protocol_name()));

    // Nobody listens there.
    let op = a.class.op_create();
    let (callback, _) = collect();
    assert_eq!(
        a.class.msg_send_unexpected(&a.context, callback, vec![0; 4], &first, 0, &op),
        Err(Error::NoEntry)
    );
    assert!(op.is_completed());

    a.finalize();
}

#[test]
fn put_and_get_own_memory() {
    let dir = tempfile::tempdir().unwrap();
    let a = Peer::new(dir.path(), ProgressMode::Blocking, false);
    let me = a.class.addr_self();

    let mut local: Vec<u8> = (1..=64).collect();
    let mut remote = vec![0u8; 128];

    let local_handle = a
        .class
        .mem_handle_create(local.as_mut_ptr(), local.len(), MemAccess::ReadWrite)
        .unwrap();
    let remote_handle = a
        .class
        .mem_handle_create(remote.as_mut_ptr(), remote.len(), MemAccess::ReadWrite)
        .unwrap();

    // As a peer would receive it.
    let mut wire = vec![0; remote_handle.serialize_size()];
    remote_handle.serialize(&mut wire).unwrap();
    let remote_handle = shm_na::MemHandle::deserialize(&wire).unwrap();

    let transfer = Transfer {
        local: &local_handle,
        local_offset: 0,
        remote: &remote_handle,
        remote_offset: 32,
        len: 64,
        remote_addr: &me,
    };

    let op = a.class.op_create();
    let (callback, done) = collect();
    unsafe { a.class.put(&a.context, callback, &transfer, &op) }.unwrap();
    assert_eq!(a.context.trigger(usize::MAX), 1);
    assert_eq!(done.try_recv().unwrap().kind, OpKind::Put);
    assert_eq!(&remote[32..96], &local[..]);

    local.fill(0);
    let (callback, done) = collect();
    unsafe { a.class.get(&a.context, callback, &transfer, &op) }.unwrap();
    assert_eq!(a.context.trigger(usize::MAX), 1);
    assert_eq!(done.try_recv().unwrap().ret, Ok(()));
    assert_eq!(local, (1..=64).collect::<Vec<u8>>());

    let read_only = a
        .class
        .mem_handle_create(remote.as_mut_ptr(), remote.len(), MemAccess::ReadOnly)
        .unwrap();
    let denied = Transfer {
        remote: &read_only,
        ..transfer
    };

    let (callback, _) = collect();
    assert_eq!(
        unsafe { a.class.put(&a.context, callback, &denied, &op) },
        Err(Error::Permission)
    );

    let beyond = Transfer {
        remote_offset: 96,
        ..transfer
    };

    let (callback, _) = collect();
    assert_eq!(
        unsafe { a.class.get(&a.context, callback, &beyond, &op) },
        Err(Error::InvalidArg)
    );

    a.finalize();
}
