//! Posting messages, and the queue of sends waiting for resources.
use shm_region::{MsgHdr, MsgKind, COPY_BUF_SIZE};

use crate::addr::{Addr, Channel};
use crate::endpoint::Endpoint;
use crate::op::{Callback, Context, OpId, OpKind};
use crate::{Error, Tag};

impl Endpoint {
    /// Post a send of `buf` to `dest`.
    ///
    /// If the peer is not reachable yet, or no copy buffer is free, the send is parked and posted
    /// by a later progress call.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn msg_send(
        &self,
        kind: MsgKind,
        context: &Context,
        callback: Callback,
        buf: Vec<u8>,
        dest: &Addr,
        tag: Tag,
        op: &OpId,
    ) -> Result<(), Error> {
        if buf.len() > COPY_BUF_SIZE {
            return Err(Error::Overflow);
        }

        let op_kind = match kind {
            MsgKind::Unexpected => OpKind::SendUnexpected,
            MsgKind::Expected => OpKind::SendExpected,
        };

        op.begin(op_kind, context, callback, Some(dest.clone()), buf, tag)?;

        match self.send_now(op, kind, dest) {
            Ok(()) => Ok(()),
            Err(Error::Again) => {
                let mut retry = self.retry_ops.lock();
                op.set_queued();
                retry.push_back(op.clone());
                tracing::debug!(%dest, "parked send for retry");
                Ok(())
            }
            Err(err) => {
                op.abort();
                Err(err)
            }
        }
    }

    fn send_now(&self, op: &OpId, kind: MsgKind, dest: &Addr) -> Result<(), Error> {
        self.resolve(dest)?;
        let channel = dest.channel().ok_or(Error::ProtocolError)?;
        let idx = channel.bufs().reserve().ok_or(Error::Again)?;
        self.push_msg(op, kind, dest, &channel, idx)
    }

    /// Stage the payload in copy buffer `idx` and announce it to the peer.
    ///
    /// The buffer is released again if the ring has no room.
    fn push_msg(
        &self,
        op: &OpId,
        kind: MsgKind,
        dest: &Addr,
        channel: &Channel,
        idx: u8,
    ) -> Result<(), Error> {
        {
            let state = op.state();
            let size = channel.bufs().copy_to(idx, &state.buf);

            let hdr = MsgHdr {
                kind,
                buf_idx: idx,
                buf_size: size as u16,
                tag: state.tag,
            };

            if channel.tx().push(hdr.encode()).is_err() {
                channel.bufs().release(idx);
                return Err(Error::Again);
            }
        }

        if let Err(err) = dest.notify_tx() {
            tracing::warn!(%err, %dest, "could not notify peer");
        }

        op.complete(Ok(()), self.local_notify.as_ref());
        Ok(())
    }

    /// Post sends parked by [`Endpoint::msg_send`], in order.
    ///
    /// Stops at the first send that still cannot be posted. Returns whether any send left the
    /// queue.
    pub(crate) fn progress_retries(&self) -> bool {
        let mut progressed = false;

        loop {
            let Some(op) = self.retry_ops.lock().front().cloned() else {
                break;
            };

            let (dest, kind) = {
                let state = op.state();
                let kind = match state.kind {
                    OpKind::SendExpected => MsgKind::Expected,
                    _ => MsgKind::Unexpected,
                };
                (state.addr.clone(), kind)
            };

            let Some(dest) = dest else {
                // Completed and triggered since we peeked.
                self.take_retry(&op);
                continue;
            };

            match self.resolve(&dest) {
                Ok(()) => {}
                Err(Error::Again) => break,
                Err(err) => {
                    if self.take_retry(&op) {
                        op.complete(Err(err), self.local_notify.as_ref());
                    }

                    progressed = true;
                    continue;
                }
            }

            let Some(channel) = dest.channel() else {
                break;
            };

            let Some(idx) = channel.bufs().reserve() else {
                break;
            };

            if !self.take_retry(&op) {
                channel.bufs().release(idx);
                continue;
            }

            match self.push_msg(&op, kind, &dest, &channel, idx) {
                Ok(()) => progressed = true,
                Err(Error::Again) => {
                    let mut retry = self.retry_ops.lock();
                    op.set_queued();
                    retry.push_front(op);
                    break;
                }
                Err(err) => {
                    op.complete(Err(err), self.local_notify.as_ref());
                    progressed = true;
                }
            }
        }

        progressed
    }

    /// Remove `op` from the retry queue, if it is still queued there.
    fn take_retry(&self, op: &OpId) -> bool {
        let mut retry = self.retry_ops.lock();
        let queued = op.clear_queued();

        if let Some(pos) = retry.iter().position(|other| other.ptr_eq(op)) {
            retry.remove(pos);
        }

        queued
    }

    /// Post a receive for the next unexpected message.
    ///
    /// A message that arrived before is delivered right away.
    pub(crate) fn msg_recv_unexpected(
        &self,
        context: &Context,
        callback: Callback,
        buf: Vec<u8>,
        op: &OpId,
    ) -> Result<(), Error> {
        op.begin(OpKind::RecvUnexpected, context, callback, None, buf, 0)?;

        let mut unexpected = self.unexpected.lock();
        match unexpected.msgs.pop_front() {
            Some(msg) => {
                drop(unexpected);
                self.deliver(op, msg.addr, &msg.buf, msg.tag);
            }
            None => {
                op.set_queued();
                unexpected.ops.push_back(op.clone());
            }
        }

        Ok(())
    }

    /// Post a receive for the message tagged `tag` from `source`.
    pub(crate) fn msg_recv_expected(
        &self,
        context: &Context,
        callback: Callback,
        buf: Vec<u8>,
        source: &Addr,
        tag: Tag,
        op: &OpId,
    ) -> Result<(), Error> {
        op.begin(OpKind::RecvExpected, context, callback, Some(source.clone()), buf, tag)?;

        let mut expected = self.expected_ops.lock();
        op.set_queued();
        expected.push_back(op.clone());
        Ok(())
    }

    /// Complete an unexpected receive with a message that was held back.
    pub(crate) fn deliver(&self, op: &OpId, source: Addr, data: &[u8], tag: Tag) {
        let ret = {
            let mut state = op.state();
            let len = data.len().min(state.buf.len());
            state.buf[..len].copy_from_slice(&data[..len]);
            state.actual_size = len;
            state.tag = tag;
            state.addr = Some(source);

            if len < data.len() {
                Err(Error::MsgSize)
            } else {
                Ok(())
            }
        };

        op.complete(ret, self.local_notify.as_ref());
    }
}
