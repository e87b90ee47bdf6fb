use core::ffi::c_int;
use core::fmt;

use shm_fd::{CmaError, ShmError};
use shm_region::RegionError;

/// The return codes of the network abstraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    Permission,
    NoEntry,
    Interrupt,
    /// A resource is momentarily exhausted, the call should be repeated later.
    Again,
    NoMem,
    Access,
    Fault,
    /// The resource is still in use.
    Busy,
    Exist,
    NoDev,
    InvalidArg,
    ProtocolError,
    Overflow,
    MsgSize,
    ProtoNoSupport,
    OpNotSupported,
    AddrInUse,
    AddrNotAvail,
    Timeout,
    Canceled,
}

impl Error {
    pub fn from_errno(errno: c_int) -> Self {
        match errno {
            libc::EPERM => Error::Permission,
            libc::ENOENT => Error::NoEntry,
            libc::EINTR => Error::Interrupt,
            libc::EAGAIN => Error::Again,
            libc::ENOMEM => Error::NoMem,
            libc::EACCES => Error::Access,
            libc::EFAULT => Error::Fault,
            libc::EBUSY => Error::Busy,
            libc::EEXIST => Error::Exist,
            libc::ENODEV => Error::NoDev,
            libc::EINVAL => Error::InvalidArg,
            libc::EOVERFLOW | libc::ENAMETOOLONG => Error::Overflow,
            libc::EMSGSIZE => Error::MsgSize,
            libc::EPROTONOSUPPORT => Error::ProtoNoSupport,
            libc::EOPNOTSUPP => Error::OpNotSupported,
            libc::EADDRINUSE => Error::AddrInUse,
            libc::EADDRNOTAVAIL => Error::AddrNotAvail,
            libc::ETIMEDOUT => Error::Timeout,
            libc::ECANCELED => Error::Canceled,
            _ => Error::ProtocolError,
        }
    }

    /// Whether the failed call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Again | Error::Interrupt)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Error::Permission => "operation not permitted",
            Error::NoEntry => "no such file or directory",
            Error::Interrupt => "operation interrupted",
            Error::Again => "operation must be retried",
            Error::NoMem => "out of memory",
            Error::Access => "permission denied",
            Error::Fault => "bad address",
            Error::Busy => "device or resource busy",
            Error::Exist => "entry already exists",
            Error::NoDev => "no such device",
            Error::InvalidArg => "invalid argument",
            Error::ProtocolError => "protocol error",
            Error::Overflow => "value too large",
            Error::MsgSize => "message size too long",
            Error::ProtoNoSupport => "protocol not supported",
            Error::OpNotSupported => "operation not supported on endpoint",
            Error::AddrInUse => "address already in use",
            Error::AddrNotAvail => "cannot assign requested address",
            Error::Timeout => "operation reached timeout",
            Error::Canceled => "operation canceled",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Error::from_errno(errno),
            None => match err.kind() {
                std::io::ErrorKind::WouldBlock => Error::Again,
                std::io::ErrorKind::InvalidInput => Error::InvalidArg,
                std::io::ErrorKind::OutOfMemory => Error::NoMem,
                _ => Error::ProtocolError,
            },
        }
    }
}

impl From<ShmError> for Error {
    fn from(err: ShmError) -> Self {
        Error::from_errno(err.raw_os_error())
    }
}

impl From<CmaError> for Error {
    fn from(err: CmaError) -> Self {
        Error::from_errno(err.raw_os_error())
    }
}

impl From<RegionError> for Error {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::Shm(err) => err.into(),
            RegionError::Map(err) => err.into(),
            RegionError::TooSmall { .. } => Error::NoDev,
        }
    }
}
