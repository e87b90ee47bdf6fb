//! Making progress: receiving messages and commands, retrying sends, cancelling.
use core::num::NonZeroU64;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shm_fd::{PollEvent, PollSet};
use shm_region::{CmdHdr, CmdKind, HdrError, MsgHdr, MsgKind, COPY_BUF_SIZE, NUM_BUFS};

use crate::addr::{Addr, Channel};
use crate::endpoint::{Endpoint, PollKey, UnexpectedMsg};
use crate::handshake::Received;
use crate::op::{Context, OpId, OpKind, QUEUED};
use crate::Error;

/// Most events handled by one wait of a blocking progress call.
pub const MAX_EVENTS: usize = 16;

/// The outcome of a progress call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Something happened, completed operations may be waiting in the context.
    Progressed,
    TimedOut,
}

impl Endpoint {
    /// Progress until something happened, or `timeout` elapsed.
    pub(crate) fn progress(&self, context: &Context, timeout: Duration) -> Result<Progress, Error> {
        let deadline = Instant::now().checked_add(timeout);
        let mut events = Vec::with_capacity(MAX_EVENTS);

        loop {
            // Completions waiting to be triggered count as progress, but only after one pass.
            let pending = context.pending() > 0;
            let remaining = match deadline {
                _ if pending => Duration::ZERO,
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };

            let mut progressed = match &self.core.poll_set {
                Some(poll) => self.progress_wait(poll, context, remaining, &mut events)?,
                None => self.progress_walk()?,
            };

            progressed |= self.progress_retries();

            if progressed || pending {
                return Ok(Progress::Progressed);
            }

            if remaining.is_zero() {
                return Ok(Progress::TimedOut);
            }

            if self.core.poll_set.is_none() {
                std::thread::yield_now();
            }
        }
    }

    fn progress_wait(
        &self,
        poll: &PollSet,
        context: &Context,
        remaining: Duration,
        events: &mut Vec<PollEvent>,
    ) -> Result<bool, Error> {
        let may_sleep = self.poll_try_wait(context);
        let timeout = if may_sleep { remaining } else { Duration::ZERO };

        poll.wait(timeout, MAX_EVENTS, events)?;

        let mut progressed = false;
        for event in events.iter() {
            match PollKey::from_token(event.token) {
                Some(PollKey::Sock) => progressed |= self.progress_cmd()?,
                Some(PollKey::TxNotify) => {
                    if let Some(notify) = &self.local_notify {
                        progressed |= notify.get()?;
                    }
                }
                Some(PollKey::RxNotify(serial)) => {
                    let addr = self
                        .poll_addrs
                        .lock()
                        .iter()
                        .find(|addr| addr.serial() == serial)
                        .cloned();

                    let Some(addr) = addr else {
                        tracing::debug!(serial, "notification of an address no longer polled");
                        continue;
                    };

                    addr.take_rx_notify()?;
                    progressed |= self.progress_rx(&addr);
                }
                None => tracing::warn!(token = event.token, "unknown poll token"),
            }
        }

        // Messages may sit in a ring without a wakeup, if the peer does not notify.
        if !progressed && !may_sleep {
            progressed = self.progress_walk()?;
        }

        Ok(progressed)
    }

    /// Look at every ring once.
    fn progress_walk(&self) -> Result<bool, Error> {
        let addrs = self.poll_addrs.lock().clone();

        let mut progressed = false;
        for addr in &addrs {
            progressed |= self.progress_rx(addr);
        }

        if self.listen {
            progressed |= self.progress_cmd()?;
        }

        Ok(progressed)
    }

    /// Whether a blocking wait would not miss anything.
    pub(crate) fn poll_try_wait(&self, context: &Context) -> bool {
        if self.core.poll_set.is_none() || context.pending() > 0 {
            return false;
        }

        if !self.retry_ops.lock().is_empty() {
            return false;
        }

        self.poll_addrs
            .lock()
            .iter()
            .all(|addr| addr.channel().map_or(true, |channel| channel.rx().is_empty()))
    }

    /// Handle one message from the rx ring of `addr`, returns whether there was one.
    pub(crate) fn progress_rx(&self, addr: &Addr) -> bool {
        let Some(channel) = addr.channel() else {
            return false;
        };

        let Some(raw) = channel.rx().pop() else {
            return false;
        };

        let hdr = match MsgHdr::decode(raw) {
            Ok(hdr) => hdr,
            Err(err) => {
                tracing::error!(%err, %addr, "dropping undecodable message");
                return true;
            }
        };

        if usize::from(hdr.buf_idx) >= NUM_BUFS {
            tracing::error!(%addr, idx = hdr.buf_idx, "dropping message with bad buffer index");
            return true;
        }

        if usize::from(hdr.buf_size) > COPY_BUF_SIZE {
            tracing::error!(%addr, size = hdr.buf_size, "dropping oversized message");
            channel.bufs().release(hdr.buf_idx);
            return true;
        }

        match hdr.kind {
            MsgKind::Unexpected => self.recv_unexpected_msg(addr, &channel, &hdr),
            MsgKind::Expected => self.recv_expected_msg(addr, &channel, &hdr),
        }

        true
    }

    fn recv_unexpected_msg(&self, addr: &Addr, channel: &Channel, hdr: &MsgHdr) {
        let mut data = vec![0; usize::from(hdr.buf_size)];
        channel.bufs().copy_from(hdr.buf_idx, &mut data);
        channel.bufs().release(hdr.buf_idx);

        let mut unexpected = self.unexpected.lock();
        match unexpected.ops.pop_front() {
            Some(op) => {
                op.clear_queued();
                drop(unexpected);
                self.deliver(&op, addr.clone(), &data, hdr.tag);
            }
            None => {
                tracing::debug!(%addr, tag = hdr.tag, "holding unexpected message");
                unexpected.msgs.push_back(UnexpectedMsg {
                    addr: addr.clone(),
                    buf: data,
                    tag: hdr.tag,
                });
            }
        }
    }

    fn recv_expected_msg(&self, addr: &Addr, channel: &Channel, hdr: &MsgHdr) {
        let op = {
            let mut expected = self.expected_ops.lock();
            let pos = expected.iter().position(|op| {
                let state = op.state();
                state.tag == hdr.tag && state.addr.as_ref() == Some(addr)
            });

            let op = pos.and_then(|pos| expected.remove(pos));
            if let Some(op) = &op {
                op.clear_queued();
            }

            op
        };

        let Some(op) = op else {
            tracing::error!(%addr, tag = hdr.tag, "no receive posted for expected message");
            channel.bufs().release(hdr.buf_idx);
            return;
        };

        let ret = {
            let mut state = op.state();
            let size = usize::from(hdr.buf_size);
            let len = size.min(state.buf.len());
            channel.bufs().copy_from(hdr.buf_idx, &mut state.buf[..len]);
            state.actual_size = len;

            if len < size {
                Err(Error::MsgSize)
            } else {
                Ok(())
            }
        };

        channel.bufs().release(hdr.buf_idx);
        op.complete(ret, self.local_notify.as_ref());
    }

    /// Handle one connection command, returns whether there was one.
    pub(crate) fn progress_cmd(&self) -> Result<bool, Error> {
        let Some(Received { raw, fds }) = self.core.handshake.recv(self.region.as_deref())? else {
            return Ok(false);
        };

        let cmd = NonZeroU64::new(raw)
            .ok_or(HdrError::Kind(0))
            .and_then(CmdHdr::decode);

        match cmd {
            Ok(cmd) if cmd.kind == CmdKind::Reserved => self.accept(&cmd, fds),
            Ok(cmd) => self.release(&cmd),
            Err(err) => tracing::error!(%err, "dropping undecodable command"),
        }

        Ok(true)
    }

    /// A peer reserved a queue pair of our region.
    fn accept(&self, cmd: &CmdHdr, fds: Vec<std::os::fd::OwnedFd>) {
        let Some(region) = &self.region else {
            tracing::error!(pid = cmd.pid, id = cmd.id, "reservation on an endpoint that does not listen");
            return;
        };

        if self.core.poll_set.is_some() && fds.len() != 2 {
            tracing::error!(pid = cmd.pid, id = cmd.id, count = fds.len(), "reservation without notification descriptors");
            return;
        }

        let mut poll_addrs = self.poll_addrs.lock();
        let duplicate = poll_addrs
            .iter()
            .any(|addr| addr.is_unexpected() && addr.pair_idx() == Some(cmd.pair_idx));

        if duplicate {
            tracing::error!(pid = cmd.pid, id = cmd.id, pair = cmd.pair_idx, "queue pair reserved twice");
            return;
        }

        match Addr::accepted(Arc::clone(&self.core), cmd, Arc::clone(region), fds) {
            Ok(addr) => {
                tracing::debug!(%addr, pair = cmd.pair_idx, "accepted peer");
                poll_addrs.push(addr);
            }
            Err(err) => tracing::error!(%err, pid = cmd.pid, id = cmd.id, "could not accept peer"),
        }
    }

    /// A peer released its queue pair of our region.
    fn release(&self, cmd: &CmdHdr) {
        let removed = {
            let mut poll_addrs = self.poll_addrs.lock();
            poll_addrs
                .iter()
                .position(|addr| {
                    addr.is_unexpected()
                        && (addr.pid(), addr.id()) == (cmd.pid, cmd.id)
                        && addr.pair_idx() == Some(cmd.pair_idx)
                })
                .map(|pos| poll_addrs.swap_remove(pos))
        };

        let Some(addr) = removed else {
            tracing::debug!(pid = cmd.pid, id = cmd.id, "release of an unknown peer");
            return;
        };

        // The peer pushed everything before releasing, nothing arrives after this.
        if let Err(err) = addr.take_rx_notify() {
            tracing::warn!(%err, %addr, "could not clear notification of released peer");
        }

        let mut drained = 0;
        while self.progress_rx(&addr) {
            drained += 1;
        }

        tracing::debug!(%addr, pair = cmd.pair_idx, drained, "peer released");
    }

    /// Cancel `op` if it still waits in one of our queues.
    ///
    /// An operation that already left its queue completes as it would have otherwise.
    pub(crate) fn cancel(&self, op: &OpId) {
        let kind = op.state().kind;
        let notify = self.local_notify.as_ref();

        match kind {
            OpKind::SendUnexpected | OpKind::SendExpected => {
                cancel_queued(&mut self.retry_ops.lock(), op, notify);
            }
            OpKind::RecvUnexpected => {
                cancel_queued(&mut self.unexpected.lock().ops, op, notify);
            }
            OpKind::RecvExpected => {
                cancel_queued(&mut self.expected_ops.lock(), op, notify);
            }
            // Transfers complete before the call that posted them returns.
            OpKind::Put | OpKind::Get => {}
        }
    }
}

fn cancel_queued(queue: &mut VecDeque<OpId>, op: &OpId, notify: Option<&shm_fd::Event>) {
    if op.status() & QUEUED == 0 {
        return;
    }

    op.set_canceled();
    if let Some(pos) = queue.iter().position(|other| other.ptr_eq(op)) {
        queue.remove(pos);
    }

    op.complete(Err(Error::Canceled), notify);
}
