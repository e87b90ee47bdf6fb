//! A shared-memory transport for a connection-less network abstraction.
//!
//! Processes on one host exchange short messages through a region of shared memory and move bulk
//! data directly between their address spaces. A [`Class`] is one endpoint of the transport: it
//! posts sends and receives as operations, and [`Class::progress`] moves them along until their
//! completion shows up in a [`Context`].
//!
//! ## Connections
//!
//! A listening class creates a region named after its user, pid and instance id. Peers map it and
//! reserve a queue pair inside it, then announce the reservation. In
//! [`ProgressMode::Blocking`] the announcement is a datagram on a Unix socket that carries two
//! eventfds, on which both sides sleep. In [`ProgressMode::NoBlock`] it is pushed to the command
//! ring of the region, and progress polls every ring instead. All processes that talk to each
//! other must use the same mode.
//!
//! ## Put and get
//!
//! One-sided transfers copy with `process_vm_writev` and `process_vm_readv`, and therefore need
//! the permission to ptrace the peer.
mod addr;
mod cleanup;
mod config;
mod endpoint;
mod error;
mod handshake;
mod host;
mod id;
mod msg;
mod op;
mod progress;
mod rma;

#[cfg(test)]
mod tests;

use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use shm_region::{MsgKind, COPY_BUF_SIZE};

pub use addr::{Addr, ADDR_SERIALIZE_SIZE};
pub use cleanup::{cleanup, Cleanup, Report};
pub use config::{current_user, Config, Naming, ProgressMode, NAME_PREFIX, TMP_DIRECTORY_ENV};
pub use error::Error;
pub use host::HostId;
pub use op::{Callback, CallbackInfo, Context, OpId, OpKind};
pub use progress::{Progress, MAX_EVENTS};
pub use rma::{MemAccess, MemHandle, Transfer};
pub use shm_fd::IoSegment;

use endpoint::Endpoint;
use id::InstanceId;

/// The name of the transport in address strings.
pub const PROTOCOL_NAME: &str = "sm";

/// Matches expected messages to their receives.
pub type Tag = u32;

/// Whether addresses named `name` belong to this transport.
pub fn check_protocol(name: &str) -> bool {
    name == PROTOCOL_NAME
}

/// One instance of the transport.
///
/// Closed forcibly when dropped, see [`Class::finalize`] for an orderly shutdown.
pub struct Class {
    endpoint: Endpoint,
    max_contexts: u8,
    closed: bool,
    // Last, the id is reused only after the endpoint is gone.
    id: InstanceId,
}

impl Class {
    pub fn initialize(config: Config) -> Result<Self, Error> {
        let id = InstanceId::allocate()?;
        let naming = Naming::from_config(&config);
        let endpoint = Endpoint::open(&config, naming, id.get())?;

        Ok(Class {
            endpoint,
            max_contexts: config.max_contexts,
            closed: false,
            id,
        })
    }

    /// Close the endpoint.
    ///
    /// Fails with [`Error::Busy`] while operations are posted or unexpected messages are held,
    /// and hands the class back untouched.
    pub fn finalize(mut self) -> Result<(), (Self, Error)> {
        match self.endpoint.close(false) {
            Ok(()) => {
                self.closed = true;
                tracing::debug!(id = self.id.get(), "finalized");
                Ok(())
            }
            Err(err) => Err((self, err)),
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    pub fn naming(&self) -> &Naming {
        &self.endpoint.core.naming
    }

    pub fn max_contexts(&self) -> u8 {
        self.max_contexts
    }

    pub fn context_create(&self) -> Context {
        Context::new()
    }

    /// A fresh operation, ready to be posted.
    pub fn op_create(&self) -> OpId {
        OpId::new()
    }

    /// Fails with [`Error::Busy`] if the operation did not complete yet.
    pub fn op_destroy(&self, op: OpId) -> Result<(), Error> {
        if !op.is_completed() {
            return Err(Error::Busy);
        }

        Ok(())
    }

    /// Look up `sm://<pid>/<id>`.
    ///
    /// Every lookup of the same peer returns a handle to the same address. Nothing is opened
    /// until the first message is sent to it.
    pub fn addr_lookup(&self, name: &str) -> Result<Addr, Error> {
        let (pid, id) = addr::parse(name)?;
        Ok(self.endpoint.lookup(pid, id))
    }

    pub fn addr_self(&self) -> Addr {
        self.endpoint.source.clone()
    }

    pub fn addr_is_self(&self, addr: &Addr) -> bool {
        self.endpoint.is_self(addr.pid(), addr.id())
    }

    pub fn addr_serialize_size(&self, _: &Addr) -> usize {
        ADDR_SERIALIZE_SIZE
    }

    pub fn addr_serialize(&self, addr: &Addr, buf: &mut [u8]) -> Result<usize, Error> {
        addr.serialize(buf)
    }

    /// The address serialized in `buf`, which must be known to this class already.
    pub fn addr_deserialize(&self, buf: &[u8]) -> Result<Addr, Error> {
        let (pid, id) = addr::deserialize(buf)?;
        self.endpoint.find(pid, id).ok_or(Error::NoEntry)
    }

    pub fn msg_max_unexpected_size(&self) -> usize {
        COPY_BUF_SIZE
    }

    pub fn msg_max_expected_size(&self) -> usize {
        COPY_BUF_SIZE
    }

    pub fn msg_max_tag(&self) -> Tag {
        Tag::MAX
    }

    /// Send `buf` to `dest`, to be received by any unexpected receive.
    pub fn msg_send_unexpected(
        &self,
        context: &Context,
        callback: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: Vec<u8>,
        dest: &Addr,
        tag: Tag,
        op: &OpId,
    ) -> Result<(), Error> {
        let callback: Callback = Box::new(callback);
        self.endpoint
            .msg_send(MsgKind::Unexpected, context, callback, buf, dest, tag, op)
    }

    /// Receive the next unexpected message from any peer into `buf`.
    ///
    /// The length of `buf` is the most that is received.
    pub fn msg_recv_unexpected(
        &self,
        context: &Context,
        callback: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: Vec<u8>,
        op: &OpId,
    ) -> Result<(), Error> {
        self.endpoint
            .msg_recv_unexpected(context, Box::new(callback), buf, op)
    }

    /// Send `buf` to `dest`, which must have posted a receive with the same tag.
    pub fn msg_send_expected(
        &self,
        context: &Context,
        callback: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: Vec<u8>,
        dest: &Addr,
        tag: Tag,
        op: &OpId,
    ) -> Result<(), Error> {
        let callback: Callback = Box::new(callback);
        self.endpoint
            .msg_send(MsgKind::Expected, context, callback, buf, dest, tag, op)
    }

    pub fn msg_recv_expected(
        &self,
        context: &Context,
        callback: impl FnOnce(CallbackInfo) + Send + 'static,
        buf: Vec<u8>,
        source: &Addr,
        tag: Tag,
        op: &OpId,
    ) -> Result<(), Error> {
        self.endpoint
            .msg_recv_expected(context, Box::new(callback), buf, source, tag, op)
    }

    /// Describe `len` bytes at `base` for transfers.
    ///
    /// The memory is not touched until a put or get uses the handle.
    pub fn mem_handle_create(
        &self,
        base: *mut u8,
        len: usize,
        access: MemAccess,
    ) -> Result<MemHandle, Error> {
        let segment = IoSegment {
            base: base as usize,
            len,
        };

        MemHandle::new(vec![segment], access)
    }

    /// Describe several ranges as one contiguous handle, in order.
    pub fn mem_handle_create_segments(
        &self,
        segments: &[IoSegment],
        access: MemAccess,
    ) -> Result<MemHandle, Error> {
        if segments.len() > self.endpoint.iov_max {
            return Err(Error::InvalidArg);
        }

        MemHandle::new(segments.to_vec(), access)
    }

    pub fn mem_handle_max_segments(&self) -> usize {
        self.endpoint.iov_max
    }

    /// Copy `transfer.len` bytes of local memory into the memory of the peer.
    ///
    /// Completes before returning, the completion is still delivered through `context`.
    ///
    /// # Safety
    ///
    /// The local range must be valid for reads. The remote range must be memory the peer agreed to
    /// have written.
    pub unsafe fn put(
        &self,
        context: &Context,
        callback: impl FnOnce(CallbackInfo) + Send + 'static,
        transfer: &Transfer<'_>,
        op: &OpId,
    ) -> Result<(), Error> {
        self.endpoint.put(context, Box::new(callback), transfer, op)
    }

    /// Copy `transfer.len` bytes of the peer's memory into local memory.
    ///
    /// # Safety
    ///
    /// The local range must be valid for writes and must not be referenced during the call.
    pub unsafe fn get(
        &self,
        context: &Context,
        callback: impl FnOnce(CallbackInfo) + Send + 'static,
        transfer: &Transfer<'_>,
        op: &OpId,
    ) -> Result<(), Error> {
        self.endpoint.get(context, Box::new(callback), transfer, op)
    }

    /// A descriptor that becomes readable when progress can be made, in blocking mode.
    pub fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        self.endpoint.core.poll_set.as_ref().map(AsFd::as_fd)
    }

    /// Whether it is safe to sleep on [`Class::poll_fd`] without calling progress first.
    pub fn poll_try_wait(&self, context: &Context) -> bool {
        self.endpoint.poll_try_wait(context)
    }

    /// Receive messages and commands, and post parked sends.
    ///
    /// Returns once anything happened, or after `timeout` with [`Progress::TimedOut`].
    pub fn progress(&self, context: &Context, timeout: Duration) -> Result<Progress, Error> {
        self.endpoint.progress(context, timeout)
    }

    /// Cancel `op` if it is still waiting.
    ///
    /// A canceled operation completes with [`Error::Canceled`]. Operations already under way
    /// complete normally.
    pub fn cancel(&self, op: &OpId) -> Result<(), Error> {
        self.endpoint.cancel(op);
        Ok(())
    }
}

impl Drop for Class {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        if let Err(err) = self.endpoint.close(true) {
            tracing::warn!(%err, "could not close endpoint");
        }
    }
}
