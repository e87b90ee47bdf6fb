//! Instance ids, which tell apart the endpoints of one process.
use shm_region::BitPool;

use crate::Error;

static IDS: BitPool<4> = BitPool::full();

/// One of 256 ids of this process, returned when dropped.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct InstanceId(u8);

impl InstanceId {
    /// Fails with [`Error::Overflow`] while all ids are taken.
    pub fn allocate() -> Result<Self, Error> {
        match IDS.reserve() {
            Some(id) => Ok(InstanceId(id as u8)),
            None => Err(Error::Overflow),
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Drop for InstanceId {
    fn drop(&mut self) {
        IDS.release(usize::from(self.0));
    }
}
