use std::ffi::CStr;
use std::path::{Path, PathBuf};

/// Prefix of every object name in the shared namespaces.
pub const NAME_PREFIX: &str = "na_sm";

/// Environment variable overriding the directory that holds sockets.
pub const TMP_DIRECTORY_ENV: &str = "NA_SM_TMP_DIRECTORY";

/// How [`Class::progress`](crate::Class::progress) waits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressMode {
    /// Sleep in an epoll set; handshakes go over a socket and carry notification descriptors.
    #[default]
    Blocking,
    /// Busy-poll every ring; handshakes go over the command ring of the region.
    NoBlock,
}

/// Options of [`Class::initialize`](crate::Class::initialize).
#[derive(Clone, Debug)]
pub struct Config {
    /// Create a region and socket peers can connect to.
    pub listen: bool,
    pub progress_mode: ProgressMode,
    /// Advertised to the caller, contexts are not limited internally.
    pub max_contexts: u8,
    /// Directory below which sockets are created.
    pub tmp_dir: PathBuf,
    /// User name embedded in object names, the name of the current user if unset.
    pub user: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let tmp_dir = std::env::var_os(TMP_DIRECTORY_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Config {
            listen: false,
            progress_mode: ProgressMode::Blocking,
            max_contexts: 1,
            tmp_dir,
            user: None,
        }
    }
}

/// Where the objects of one `(user, pid, id)` instance live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Naming {
    pub tmp_dir: PathBuf,
    pub user: String,
}

impl Naming {
    pub fn new(tmp_dir: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Naming {
            tmp_dir: tmp_dir.into(),
            user: user.into(),
        }
    }

    pub(crate) fn from_config(config: &Config) -> Self {
        let user = config.user.clone().unwrap_or_else(current_user);
        Naming::new(config.tmp_dir.clone(), user)
    }

    /// `na_sm_<user>-<pid>-<id>`
    pub fn shm_name(&self, pid: u32, id: u8) -> String {
        format!("{}-{pid}-{id}", self.shm_prefix())
    }

    /// Every shared memory object of this user starts with this.
    pub fn shm_prefix(&self) -> String {
        format!("{NAME_PREFIX}_{}", self.user)
    }

    /// `<tmp>/na_sm_<user>`
    pub fn user_dir(&self) -> PathBuf {
        self.tmp_dir.join(self.shm_prefix())
    }

    /// `<tmp>/na_sm_<user>/<pid>/<id>/sock`
    pub fn sock_path(&self, pid: u32, id: u8) -> PathBuf {
        self.user_dir()
            .join(pid.to_string())
            .join(id.to_string())
            .join("sock")
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }
}

/// The login name of the real user, `unknown` if there is none.
pub fn current_user() -> String {
    let uid = unsafe { libc::getuid() };
    let mut pwd = core::mem::MaybeUninit::<libc::passwd>::zeroed();
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result = core::ptr::null_mut();

    loop {
        let ret = unsafe {
            libc::getpwuid_r(uid, pwd.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut result)
        };

        if ret == libc::ERANGE && buf.len() < 1 << 16 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }

        if ret != 0 || result.is_null() {
            return "unknown".to_owned();
        }

        break;
    }

    // Safety: `result` is non-null, so `pwd` was filled and its strings point into `buf`.
    let name = unsafe { CStr::from_ptr(pwd.assume_init_ref().pw_name) };
    name.to_string_lossy().into_owned()
}
