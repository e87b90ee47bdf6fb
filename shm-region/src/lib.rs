//! The memory two processes share for message passing.
//!
//! A [`Region`] is created by the listening process and opened by every peer that wants to talk to
//! it. It holds a pool of copy buffers, one [`QueuePair`] per connected peer and a command ring
//! for connection management.
//!
//! ## Relocation-free
//!
//! Each process maps the region at its own address. Hence nothing inside it is a pointer, all
//! references between parts of the region are indices (buffer index, queue pair index) and all
//! state is kept in atomics so that the two processes only need to agree on the atomic memory
//! model, never on a lock implementation.
//!
//! ## Trust
//!
//! Peers sharing a region are assumed to be well-behaved processes of the same user. A malicious
//! peer can corrupt rings or hold a spin lock forever; nothing here defends against that.
mod area;
pub mod hdr;
mod pool;
mod region;
mod ring;

#[cfg(test)]
mod tests;

pub use area::AreaFd;
pub use hdr::{CmdHdr, CmdKind, HdrError, MsgHdr, MsgKind};
pub use pool::{BitPool, CopyBufs, SpinGuard, SpinLock, COPY_BUF_SIZE, NUM_BUFS};
pub use region::{
    CmdRing, MsgRing, QueuePair, Region, RegionError, SharedRegion, CMD_RING_SIZE, MAX_PEERS,
    MSG_RING_SIZE,
};
pub use ring::{Full, Ring};
