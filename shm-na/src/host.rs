use core::fmt;
use core::str::FromStr;

/// The identifier of this host, as reported by `gethostid`.
///
/// Two processes can only share memory if they agree on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostId(u32);

impl HostId {
    pub fn get() -> Self {
        // The id is 32 bits wide, even where `long` is not.
        HostId(unsafe { libc::gethostid() } as u32)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for HostId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s.trim_start_matches("0x"), 16).map(HostId)
    }
}
