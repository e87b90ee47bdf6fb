//! Owns a file descriptor with known size.
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use shm_fd::Shm;

use crate::RegionError;

/// An owned file descriptor, with all information about the size of the object.
pub struct AreaFd {
    fd: OwnedFd,
    /// the usable length in the address space representation.
    len: usize,
}

impl AreaFd {
    pub fn new(fd: OwnedFd, shm: &Shm) -> Result<Self, RegionError> {
        let stat = shm.stat(fd.as_fd()).map_err(RegionError::Shm)?;
        let len = usize::try_from(stat.st_size).map_err(|_| RegionError::TooSmall { len: 0 })?;
        Ok(AreaFd { fd, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsFd for AreaFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for AreaFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
