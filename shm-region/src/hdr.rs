//! The words exchanged through rings.
//!
//! Both header kinds are packed into a single `u64`. A kind of `0` is never valid, so an encoded
//! header is never zero and fits a [`Ring`](crate::Ring) slot.
use core::num::NonZeroU64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    Unexpected = 1,
    Expected = 2,
}

/// Announces one payload staged in a copy buffer.
///
/// Layout: `tag` in bits 0-31, `buf_size` in 32-47, `buf_idx` in 48-55, `kind` in 56-63.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHdr {
    pub kind: MsgKind,
    pub buf_idx: u8,
    pub buf_size: u16,
    pub tag: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmdKind {
    Reserved = 1,
    Released = 2,
}

/// Announces the reservation or release of a queue pair.
///
/// Layout: `pid` in bits 0-31, `id` in 32-39, `pair_idx` in 40-47, `kind` in 48-55, and the
/// remaining byte zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdHdr {
    pub kind: CmdKind,
    pub pid: u32,
    pub id: u8,
    pub pair_idx: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HdrError {
    /// The kind byte names no known kind.
    Kind(u8),
    /// Reserved bits were set.
    Padding(u64),
}

impl MsgKind {
    fn from_raw(raw: u8) -> Result<Self, HdrError> {
        match raw {
            1 => Ok(MsgKind::Unexpected),
            2 => Ok(MsgKind::Expected),
            other => Err(HdrError::Kind(other)),
        }
    }
}

impl CmdKind {
    fn from_raw(raw: u8) -> Result<Self, HdrError> {
        match raw {
            1 => Ok(CmdKind::Reserved),
            2 => Ok(CmdKind::Released),
            other => Err(HdrError::Kind(other)),
        }
    }
}

impl MsgHdr {
    pub fn encode(&self) -> NonZeroU64 {
        let raw = u64::from(self.tag)
            | u64::from(self.buf_size) << 32
            | u64::from(self.buf_idx) << 48
            | u64::from(self.kind as u8) << 56;

        // Safety: the kind byte is at least 1.
        unsafe { NonZeroU64::new_unchecked(raw) }
    }

    pub fn decode(raw: NonZeroU64) -> Result<Self, HdrError> {
        let raw = raw.get();

        Ok(MsgHdr {
            kind: MsgKind::from_raw((raw >> 56) as u8)?,
            buf_idx: (raw >> 48) as u8,
            buf_size: (raw >> 32) as u16,
            tag: raw as u32,
        })
    }
}

impl CmdHdr {
    pub fn encode(&self) -> NonZeroU64 {
        let raw = u64::from(self.pid)
            | u64::from(self.id) << 32
            | u64::from(self.pair_idx) << 40
            | u64::from(self.kind as u8) << 48;

        // Safety: the kind byte is at least 1.
        unsafe { NonZeroU64::new_unchecked(raw) }
    }

    pub fn decode(raw: NonZeroU64) -> Result<Self, HdrError> {
        let raw = raw.get();

        if raw >> 56 != 0 {
            return Err(HdrError::Padding(raw));
        }

        Ok(CmdHdr {
            kind: CmdKind::from_raw((raw >> 48) as u8)?,
            pid: raw as u32,
            id: (raw >> 32) as u8,
            pair_idx: (raw >> 40) as u8,
        })
    }
}

impl core::fmt::Display for HdrError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HdrError::Kind(kind) => write!(f, "unknown header kind {kind}"),
            HdrError::Padding(raw) => write!(f, "reserved header bits set in {raw:#018x}"),
        }
    }
}

impl std::error::Error for HdrError {}
