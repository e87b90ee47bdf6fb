//! Cross-memory-attach: copy between our address space and another process'.
use core::ffi::c_int;
use std::sync::Arc;

/// A `(base, len)` range of some process' address space.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IoSegment {
    pub base: usize,
    pub len: usize,
}

/// Interact with `process_vm_readv` and `process_vm_writev`.
#[derive(Clone)]
pub struct Cma {
    inner: Arc<CmaVTable>,
}

/// An error of a cross-memory transfer, the raw errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmaError(c_int);

/// A table of OS functions.
///
/// Both functions have the signature of `process_vm_readv` and `process_vm_writev` with the
/// trailing flags argument dropped.
#[non_exhaustive]
pub struct CmaVTable {
    pub readv: fn(libc::pid_t, &[libc::iovec], &[libc::iovec]) -> isize,
    pub writev: fn(libc::pid_t, &[libc::iovec], &[libc::iovec]) -> isize,
    pub errno: fn() -> c_int,
}

impl Cma {
    /// Create a `Cma` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The functions must not touch memory of the calling process outside the local segments.
    pub unsafe fn new_unchecked(vtable: CmaVTable) -> Self {
        Cma {
            inner: Arc::new(vtable),
        }
    }

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        unsafe { Self::new_unchecked(CmaVTable::new_libc()) }
    }

    /// Copy from the `remote` segments of process `pid` into our `local` segments.
    ///
    /// # Safety
    ///
    /// The `local` segments must be valid for writes and not aliased by any reference.
    pub unsafe fn read(
        &self,
        pid: u32,
        local: &[IoSegment],
        remote: &[IoSegment],
    ) -> Result<usize, CmaError> {
        self.transfer(self.inner.readv, pid, local, remote)
    }

    /// Copy our `local` segments into the `remote` segments of process `pid`.
    ///
    /// # Safety
    ///
    /// The `local` segments must be valid for reads.
    pub unsafe fn write(
        &self,
        pid: u32,
        local: &[IoSegment],
        remote: &[IoSegment],
    ) -> Result<usize, CmaError> {
        self.transfer(self.inner.writev, pid, local, remote)
    }

    fn transfer(
        &self,
        call: fn(libc::pid_t, &[libc::iovec], &[libc::iovec]) -> isize,
        pid: u32,
        local: &[IoSegment],
        remote: &[IoSegment],
    ) -> Result<usize, CmaError> {
        let pid = libc::pid_t::try_from(pid).map_err(|_| CmaError(libc::ESRCH))?;
        let local: Vec<_> = local.iter().map(to_iovec).collect();
        let remote: Vec<_> = remote.iter().map(to_iovec).collect();

        let ret = call(pid, &local, &remote);
        if ret < 0 {
            return Err(CmaError((self.inner.errno)()));
        }

        Ok(ret as usize)
    }
}

impl CmaError {
    pub fn raw_os_error(&self) -> c_int {
        self.0
    }
}

impl core::fmt::Display for CmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        std::io::Error::from_raw_os_error(self.0).fmt(f)
    }
}

impl std::error::Error for CmaError {}

fn to_iovec(segment: &IoSegment) -> libc::iovec {
    libc::iovec {
        iov_base: segment.base as *mut libc::c_void,
        iov_len: segment.len,
    }
}

impl CmaVTable {
    pub fn new_libc() -> Self {
        fn _readv(pid: libc::pid_t, local: &[libc::iovec], remote: &[libc::iovec]) -> isize {
            unsafe {
                libc::process_vm_readv(
                    pid,
                    local.as_ptr(),
                    local.len() as libc::c_ulong,
                    remote.as_ptr(),
                    remote.len() as libc::c_ulong,
                    0,
                )
            }
        }

        fn _writev(pid: libc::pid_t, local: &[libc::iovec], remote: &[libc::iovec]) -> isize {
            unsafe {
                libc::process_vm_writev(
                    pid,
                    local.as_ptr(),
                    local.len() as libc::c_ulong,
                    remote.as_ptr(),
                    remote.len() as libc::c_ulong,
                    0,
                )
            }
        }

        fn _errno() -> c_int {
            unsafe { *libc::__errno_location() }
        }

        CmaVTable {
            readv: _readv,
            writev: _writev,
            errno: _errno,
        }
    }
}

#[test]
fn copy_within_own_process() {
    let source = *b"Hello, world";
    let mut target = [0u8; 12];

    let local = [IoSegment { base: source.as_ptr() as usize, len: 5 }];
    let remote = [
        IoSegment { base: target.as_mut_ptr() as usize, len: 2 },
        IoSegment { base: target.as_mut_ptr() as usize + 8, len: 3 },
    ];

    let cma = Cma::new();
    let written = unsafe { cma.write(std::process::id(), &local, &remote) }.unwrap();
    assert_eq!(written, 5);
    assert_eq!(&target[..2], b"He");
    assert_eq!(&target[8..11], b"llo");
}
