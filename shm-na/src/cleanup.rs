//! Removing what crashed processes left behind.
use std::io;
use std::path::PathBuf;

use shm_fd::Shm;

use crate::config::Naming;
use crate::Error;

/// Where to look for leftovers of one user.
#[derive(Clone, Debug)]
pub struct Cleanup {
    pub naming: Naming,
    /// Directory listing the shared memory objects of the host.
    pub shm_dir: PathBuf,
    /// Only report, remove nothing.
    pub dry_run: bool,
}

/// What [`cleanup`] removed, or would have removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub dirs: Vec<PathBuf>,
    pub segments: Vec<String>,
}

impl Cleanup {
    pub fn new(naming: Naming) -> Self {
        Cleanup {
            naming,
            shm_dir: PathBuf::from("/dev/shm"),
            dry_run: false,
        }
    }
}

/// Remove the socket tree and the shared memory objects of the user.
///
/// Nothing checks whether the owning processes are still alive, do not run this while any
/// instance of the user is.
pub fn cleanup(cleanup: &Cleanup) -> Result<Report, Error> {
    let mut report = Report::default();

    let user_dir = cleanup.naming.user_dir();
    if user_dir.exists() {
        if !cleanup.dry_run {
            match std::fs::remove_dir_all(&user_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        tracing::debug!(dir = %user_dir.display(), dry_run = cleanup.dry_run, "removed socket tree");
        report.dirs.push(user_dir);
    }

    let entries = match std::fs::read_dir(&cleanup.shm_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(err) => return Err(err.into()),
    };

    let prefix = format!("{}-", cleanup.naming.shm_prefix());
    let mut names = vec![];
    for entry in entries {
        let name = entry?.file_name();
        match name.to_str() {
            Some(name) if is_instance_object(name, &prefix) => names.push(name.to_owned()),
            _ => {}
        }
    }

    names.sort();

    let shm = Shm::new();
    for name in names {
        if !cleanup.dry_run {
            match shm.unlink(&name) {
                Ok(()) => {}
                Err(err) if err.raw_os_error() == libc::ENOENT => {}
                Err(err) => return Err(err.into()),
            }
        }

        tracing::debug!(name, dry_run = cleanup.dry_run, "removed shared memory object");
        report.segments.push(name);
    }

    Ok(report)
}

/// `<prefix><pid>-<id>`, and not an object of a user whose name merely starts like ours.
fn is_instance_object(name: &str, prefix: &str) -> bool {
    let Some((pid, id)) = name.strip_prefix(prefix).and_then(|rest| rest.split_once('-')) else {
        return false;
    };

    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(pid) && digits(id) && pid.parse::<u32>().is_ok() && id.parse::<u8>().is_ok()
}
