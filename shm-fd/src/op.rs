use core::ffi::{c_int, CStr};
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// Interact with `shm*` and related calls.
#[derive(Clone)]
pub struct Shm {
    inner: Arc<ShmInner>,
}

struct ShmInner {
    vtable: ShmVTable,
}

/// An error returned when interaction with a shared memory file.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShmError(c_int);

type OffT = i64;

/// The part of `fstat` a mapping cares about.
#[non_exhaustive]
#[derive(Default)]
pub struct Stat {
    pub st_size: OffT,
}

/// How a shared memory object is to be opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a new object, failing if it exists.
    Create,
    /// Open an existing object for reading and writing.
    Existing,
}

/// A table of OS functions.
///
/// This enumerates the functions required to create, open and size shared memory objects. A
/// vtable must contain functions that behave according the POSIX/libc's specification of the
/// correspondingly named functions, see Safety precondition of [`Shm::new_unchecked`]. Note that a
/// default table can be initialized when linking against `libc`.
///
/// You're encouraged to provide your own objects here instead of hooking the functions themselves
/// with override/linker tricks.
#[non_exhaustive]
pub struct ShmVTable {
    pub shm_open: fn(&CStr, OpenMode) -> c_int,
    pub shm_unlink: fn(&CStr) -> c_int,
    pub ftruncate: fn(c_int, OffT) -> c_int,
    pub fstat: fn(c_int, Option<&mut Stat>) -> c_int,
    pub errno: fn() -> c_int,
}

impl Shm {
    /// Create an `Shm` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain a correct set of functions that implement the `shm*` interface. In
    /// particular a non-negative return of `shm_open` must be a fresh, owned file descriptor.
    pub unsafe fn new_unchecked(vtable: ShmVTable) -> Self {
        Shm {
            inner: Arc::new(ShmInner { vtable }),
        }
    }

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        unsafe { Self::new_unchecked(ShmVTable::new_libc()) }
    }

    /// Create a new object called `name` and size it to `len` bytes.
    ///
    /// The object is unlinked again if it can not be sized.
    pub fn create(&self, name: &str, len: usize) -> Result<OwnedFd, ShmError> {
        let cname = Self::object_name(name)?;
        let fd = self.open_with(&cname, OpenMode::Create)?;

        let len = OffT::try_from(len).map_err(|_| ShmError(libc::EOVERFLOW))?;
        if (self.inner.vtable.ftruncate)(fd.as_raw_fd(), len) < 0 {
            let err = self.last_error();
            (self.inner.vtable.shm_unlink)(&cname);
            return Err(err);
        }

        Ok(fd)
    }

    /// Open an existing object, read-write.
    pub fn open(&self, name: &str) -> Result<OwnedFd, ShmError> {
        let cname = Self::object_name(name)?;
        self.open_with(&cname, OpenMode::Existing)
    }

    pub fn unlink(&self, name: &str) -> Result<(), ShmError> {
        let cname = Self::object_name(name)?;
        if (self.inner.vtable.shm_unlink)(&cname) < 0 {
            return Err(self.last_error());
        }

        Ok(())
    }

    pub fn stat(&self, fd: BorrowedFd<'_>) -> Result<Stat, ShmError> {
        let mut stat = Stat::default();
        let inner = (self.inner.vtable.fstat)(fd.as_raw_fd(), Some(&mut stat));

        if inner < 0 {
            Err(self.last_error())
        } else {
            Ok(stat)
        }
    }

    fn open_with(&self, name: &CStr, mode: OpenMode) -> Result<OwnedFd, ShmError> {
        let fd = (self.inner.vtable.shm_open)(name, mode);

        if fd < 0 {
            return Err(self.last_error());
        }

        // Safety: the vtable guarantees that this is a fresh descriptor owned by us.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn last_error(&self) -> ShmError {
        ShmError((self.inner.vtable.errno)())
    }

    /// Objects are addressed with a single leading slash, nothing else.
    fn object_name(name: &str) -> Result<CString, ShmError> {
        let name = name.trim_start_matches('/');
        if name.is_empty() || name.contains('/') {
            return Err(ShmError(libc::EINVAL));
        }

        CString::new(format!("/{name}")).map_err(|_| ShmError(libc::EINVAL))
    }
}

impl ShmError {
    pub fn raw_os_error(&self) -> c_int {
        self.0
    }
}

impl core::fmt::Debug for ShmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("ShmError").field(&self.0).finish()
    }
}

impl core::fmt::Display for ShmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        std::io::Error::from_raw_os_error(self.0).fmt(f)
    }
}

impl std::error::Error for ShmError {}

impl From<ShmError> for std::io::Error {
    fn from(err: ShmError) -> Self {
        std::io::Error::from_raw_os_error(err.0)
    }
}

impl ShmVTable {
    pub fn new_libc() -> Self {
        fn _shm_open(name: &CStr, mode: OpenMode) -> c_int {
            let flags = match mode {
                OpenMode::Create => libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                OpenMode::Existing => libc::O_RDWR,
            };

            // Safety: `name` is a valid, nul-terminated string.
            unsafe { libc::shm_open(name.as_ptr(), flags | libc::O_CLOEXEC, 0o600) }
        }

        fn _shm_unlink(name: &CStr) -> c_int {
            unsafe { libc::shm_unlink(name.as_ptr()) }
        }

        fn _ftruncate(fd: c_int, len: OffT) -> c_int {
            unsafe { libc::ftruncate(fd, len as libc::off_t) }
        }

        fn _fstat(fd: c_int, stat: Option<&mut Stat>) -> c_int {
            let mut raw = core::mem::MaybeUninit::<libc::stat>::zeroed();
            let ret = unsafe { libc::fstat(fd, raw.as_mut_ptr()) };

            match stat {
                // Filled in by a successful call.
                Some(stat) if ret == 0 => {
                    stat.st_size = unsafe { raw.assume_init() }.st_size;
                }
                _ => {}
            }

            ret
        }

        fn _errno() -> c_int {
            unsafe { *libc::__errno_location() }
        }

        ShmVTable {
            shm_open: _shm_open,
            shm_unlink: _shm_unlink,
            ftruncate: _ftruncate,
            fstat: _fstat,
            errno: _errno,
        }
    }
}
