//! Memory handles and one-sided transfers between address spaces.
use shm_fd::{CmaError, IoSegment};

use crate::addr::Addr;
use crate::endpoint::Endpoint;
use crate::op::{Callback, Context, OpId, OpKind};
use crate::Error;

/// What a peer may do with registered memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemAccess {
    ReadOnly = 1,
    WriteOnly = 2,
    ReadWrite = 3,
}

/// Segments of our address space, to be handed to a peer for put and get.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemHandle {
    segments: Vec<IoSegment>,
    len: usize,
    access: MemAccess,
}

/// Count, total length, access flags and padding.
const HANDLE_HEADER_SIZE: usize = 24;
const SEGMENT_SIZE: usize = 16;

const PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

impl MemAccess {
    fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw {
            1 => Ok(MemAccess::ReadOnly),
            2 => Ok(MemAccess::WriteOnly),
            3 => Ok(MemAccess::ReadWrite),
            _ => Err(Error::InvalidArg),
        }
    }

    pub fn readable(self) -> bool {
        self as u8 & MemAccess::ReadOnly as u8 != 0
    }

    pub fn writable(self) -> bool {
        self as u8 & MemAccess::WriteOnly as u8 != 0
    }
}

impl MemHandle {
    pub(crate) fn new(segments: Vec<IoSegment>, access: MemAccess) -> Result<Self, Error> {
        let len = segments
            .iter()
            .try_fold(0usize, |acc, segment| acc.checked_add(segment.len))
            .ok_or(Error::Overflow)?;

        Ok(MemHandle {
            segments,
            len,
            access,
        })
    }

    pub fn segments(&self) -> &[IoSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> MemAccess {
        self.access
    }

    pub fn serialize_size(&self) -> usize {
        HANDLE_HEADER_SIZE + SEGMENT_SIZE * self.segments.len()
    }

    /// Write the wire form into `buf`, returns its length.
    ///
    /// All integers are native endian, the peer is on the same host.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let size = self.serialize_size();
        let buf = buf.get_mut(..size).ok_or(Error::Overflow)?;

        let (header, body) = buf.split_at_mut(HANDLE_HEADER_SIZE);
        header[..8].copy_from_slice(&(self.segments.len() as u64).to_ne_bytes());
        header[8..16].copy_from_slice(&(self.len as u64).to_ne_bytes());
        header[16] = self.access as u8;
        header[17..].fill(0);

        for (segment, out) in self.segments.iter().zip(body.chunks_exact_mut(SEGMENT_SIZE)) {
            out[..8].copy_from_slice(&(segment.base as u64).to_ne_bytes());
            out[8..].copy_from_slice(&(segment.len as u64).to_ne_bytes());
        }

        Ok(size)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        let header = buf.get(..HANDLE_HEADER_SIZE).ok_or(Error::Overflow)?;
        let count = read_usize(&header[..8])?;
        let len = read_usize(&header[8..16])?;
        let access = MemAccess::from_raw(header[16])?;

        let body_len = count.checked_mul(SEGMENT_SIZE).ok_or(Error::Overflow)?;
        let body = buf[HANDLE_HEADER_SIZE..]
            .get(..body_len)
            .ok_or(Error::Overflow)?;

        let segments = body
            .chunks_exact(SEGMENT_SIZE)
            .map(|raw| {
                Ok(IoSegment {
                    base: read_usize(&raw[..8])?,
                    len: read_usize(&raw[8..])?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let handle = MemHandle::new(segments, access)?;
        if handle.len != len {
            return Err(Error::InvalidArg);
        }

        Ok(handle)
    }

    /// The segments covering `len` bytes starting `offset` bytes into the handle.
    pub(crate) fn translate(&self, offset: usize, len: usize) -> Result<Vec<IoSegment>, Error> {
        let end = offset.checked_add(len).ok_or(Error::InvalidArg)?;
        if end > self.len {
            return Err(Error::InvalidArg);
        }

        let mut out = Vec::new();
        if len == 0 {
            return Ok(out);
        }

        let starts: Vec<usize> = self
            .segments
            .iter()
            .scan(0, |acc, segment| {
                let start = *acc;
                *acc += segment.len;
                Some(start)
            })
            .collect();

        // The last segment starting at or before the offset, at least one does.
        let first = starts.partition_point(|&start| start <= offset) - 1;
        let mut skip = offset - starts[first];
        let mut left = len;

        for segment in &self.segments[first..] {
            if left == 0 {
                break;
            }

            let take = (segment.len - skip).min(left);
            if take > 0 {
                out.push(IoSegment {
                    base: segment.base + skip,
                    len: take,
                });
            }

            left -= take;
            skip = 0;
        }

        Ok(out)
    }
}

fn read_usize(raw: &[u8]) -> Result<usize, Error> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(raw);
    usize::try_from(u64::from_ne_bytes(bytes)).map_err(|_| Error::Overflow)
}

/// Arguments of one put or get.
pub struct Transfer<'lt> {
    pub local: &'lt MemHandle,
    pub local_offset: usize,
    pub remote: &'lt MemHandle,
    pub remote_offset: usize,
    pub len: usize,
    /// The process whose memory `remote` describes.
    pub remote_addr: &'lt Addr,
}

impl Endpoint {
    /// Copy from local to remote memory.
    ///
    /// # Safety
    ///
    /// The local range must be valid for reads for the duration of the call.
    pub(crate) unsafe fn put(
        &self,
        context: &Context,
        callback: Callback,
        transfer: &Transfer<'_>,
        op: &OpId,
    ) -> Result<(), Error> {
        if !transfer.remote.access().writable() {
            return Err(Error::Permission);
        }

        self.transfer(OpKind::Put, context, callback, transfer, op)
    }

    /// Copy from remote to local memory.
    ///
    /// # Safety
    ///
    /// The local range must be valid for writes and not aliased by any reference for the duration
    /// of the call.
    pub(crate) unsafe fn get(
        &self,
        context: &Context,
        callback: Callback,
        transfer: &Transfer<'_>,
        op: &OpId,
    ) -> Result<(), Error> {
        if !transfer.remote.access().readable() {
            return Err(Error::Permission);
        }

        self.transfer(OpKind::Get, context, callback, transfer, op)
    }

    unsafe fn transfer(
        &self,
        kind: OpKind,
        context: &Context,
        callback: Callback,
        transfer: &Transfer<'_>,
        op: &OpId,
    ) -> Result<(), Error> {
        let local = transfer.local.translate(transfer.local_offset, transfer.len)?;
        let remote = transfer.remote.translate(transfer.remote_offset, transfer.len)?;
        let pid = transfer.remote_addr.pid();

        op.begin(kind, context, callback, Some(transfer.remote_addr.clone()), Vec::new(), 0)?;

        let copied = match kind {
            OpKind::Put => self.cma.write(pid, &local, &remote),
            _ => self.cma.read(pid, &local, &remote),
        };

        let ret = match copied {
            Ok(copied) if copied == transfer.len => Ok(()),
            Ok(copied) => {
                tracing::error!(copied, len = transfer.len, pid, "short transfer");
                Err(Error::MsgSize)
            }
            Err(err) => Err(cma_error(err)),
        };

        if let Err(err) = ret {
            op.abort();
            return Err(err);
        }

        op.complete(Ok(()), self.local_notify.as_ref());
        Ok(())
    }
}

fn cma_error(err: CmaError) -> Error {
    if err.raw_os_error() == libc::EPERM {
        ptrace_hint();
    }

    err.into()
}

fn ptrace_hint() {
    let Ok(scope) = std::fs::read_to_string(PTRACE_SCOPE) else {
        return;
    };

    let scope = scope.trim();
    if scope != "0" {
        tracing::error!(
            scope,
            "ptrace_scope restricts access to other processes; set {PTRACE_SCOPE} to 0 or grant CAP_SYS_PTRACE"
        );
    }
}
