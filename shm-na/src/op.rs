//! Operations, their completion and the contexts that collect them.
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use shm_fd::Event;

use crate::addr::Addr;
use crate::{Error, Tag};

/// The operation finished, successfully or not.
pub(crate) const COMPLETED: u32 = 1 << 0;
/// A cancel was requested.
pub(crate) const CANCELED: u32 = 1 << 1;
/// Owned by one of the queues of the endpoint.
pub(crate) const QUEUED: u32 = 1 << 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    SendUnexpected,
    RecvUnexpected,
    SendExpected,
    RecvExpected,
    Put,
    Get,
}

/// Called once with the result of an operation, from [`Context::trigger`].
pub type Callback = Box<dyn FnOnce(CallbackInfo) + Send>;

/// The result of one operation.
pub struct CallbackInfo {
    pub kind: OpKind,
    pub ret: Result<(), Error>,
    /// The buffer handed in when posting. For receives the first `actual_size` bytes are filled.
    pub buf: Vec<u8>,
    pub actual_size: usize,
    pub tag: Tag,
    /// The sender, for an unexpected receive.
    pub source: Option<Addr>,
}

/// A reusable operation slot.
///
/// Posting an operation requires the previous one to be completed and triggered.
#[derive(Clone)]
pub struct OpId(pub(crate) Arc<Op>);

pub(crate) struct Op {
    status: AtomicU32,
    state: Mutex<OpState>,
}

pub(crate) struct OpState {
    pub kind: OpKind,
    pub context: Option<Context>,
    pub callback: Option<Callback>,
    pub addr: Option<Addr>,
    pub buf: Vec<u8>,
    pub tag: Tag,
    pub actual_size: usize,
    pub ret: Result<(), Error>,
}

/// Collects completed operations until their callbacks are triggered.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    completions: Mutex<VecDeque<OpId>>,
}

impl OpId {
    pub(crate) fn new() -> Self {
        OpId(Arc::new(Op {
            status: AtomicU32::new(COMPLETED),
            state: Mutex::new(OpState {
                kind: OpKind::SendUnexpected,
                context: None,
                callback: None,
                addr: None,
                buf: Vec::new(),
                tag: 0,
                actual_size: 0,
                ret: Ok(()),
            }),
        }))
    }

    pub(crate) fn status(&self) -> u32 {
        self.0.status.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.status() & COMPLETED != 0
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, OpState> {
        self.0.state.lock()
    }

    pub(crate) fn ptr_eq(&self, other: &OpId) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Mark as owned by a queue. Call with the lock of that queue held.
    pub(crate) fn set_queued(&self) {
        self.0.status.fetch_or(QUEUED, Ordering::AcqRel);
    }

    /// Take back from a queue. Call with the lock of that queue held.
    pub(crate) fn clear_queued(&self) -> bool {
        self.0.status.fetch_and(!QUEUED, Ordering::AcqRel) & QUEUED != 0
    }

    pub(crate) fn set_canceled(&self) {
        self.0.status.fetch_or(CANCELED, Ordering::AcqRel);
    }

    /// Claim the slot for a new operation.
    pub(crate) fn begin(
        &self,
        kind: OpKind,
        context: &Context,
        callback: Callback,
        addr: Option<Addr>,
        buf: Vec<u8>,
        tag: Tag,
    ) -> Result<(), Error> {
        let mut state = self.state();

        let status = self.status();
        if status & COMPLETED == 0 || state.callback.is_some() {
            return Err(Error::Busy);
        }

        self.0
            .status
            .compare_exchange(status, 0, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;

        *state = OpState {
            kind,
            context: Some(context.clone()),
            callback: Some(callback),
            addr,
            buf,
            tag,
            actual_size: 0,
            ret: Ok(()),
        };

        Ok(())
    }

    /// Give the slot back without completion, after posting failed.
    pub(crate) fn abort(&self) {
        let mut state = self.state();
        state.addr = None;
        state.callback = None;
        state.context = None;
        self.0.status.store(COMPLETED, Ordering::Release);
    }

    /// Finish the operation with `ret` and hand it to its context.
    ///
    /// A cancel that was requested before turns the result into [`Error::Canceled`].
    pub(crate) fn complete(&self, ret: Result<(), Error>, notify: Option<&Event>) {
        let mut state = self.state();

        let prev = self.0.status.fetch_or(COMPLETED, Ordering::AcqRel);
        self.0.status.fetch_and(!QUEUED, Ordering::AcqRel);

        state.ret = ret;
        if prev & CANCELED != 0 {
            state.ret = Err(Error::Canceled);
            if state.kind == OpKind::RecvUnexpected {
                state.actual_size = 0;
                state.addr = None;
            }
        }

        let context = state.context.take();
        drop(state);

        if let Some(context) = context {
            context.inner.completions.lock().push_back(self.clone());
        }

        if let Some(notify) = notify {
            if let Err(err) = notify.set() {
                tracing::warn!(%err, "could not signal completion");
            }
        }
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpId")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    /// Completed operations whose callbacks did not run yet.
    pub fn pending(&self) -> usize {
        self.inner.completions.lock().len()
    }

    /// Run the callbacks of up to `max` completed operations, returns how many ran.
    pub fn trigger(&self, max: usize) -> usize {
        let mut count = 0;

        while count < max {
            let Some(op) = self.inner.completions.lock().pop_front() else {
                break;
            };

            let mut state = op.state();
            let Some(callback) = state.callback.take() else {
                continue;
            };

            // Only an unexpected receive hands the address on, as its source.
            let kind = state.kind;
            let source = state.addr.take().filter(|_| kind == OpKind::RecvUnexpected);
            let info = CallbackInfo {
                kind,
                ret: state.ret,
                buf: core::mem::take(&mut state.buf),
                actual_size: state.actual_size,
                tag: state.tag,
                source,
            };
            drop(state);

            callback(info);
            count += 1;
        }

        count
    }
}
