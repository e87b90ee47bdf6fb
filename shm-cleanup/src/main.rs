use std::path::PathBuf;

use clap::Parser;
use shm_na::{cleanup, current_user, Cleanup, Config, Naming};

/// Remove sockets and shared memory objects of shm-na processes that did not exit cleanly.
///
/// Only run this while no process of the user uses the transport, nothing checks whether the
/// owners of the objects are still alive.
#[derive(Parser)]
#[command(version)]
struct CleanupCommand {
    /// Directory below which the sockets were created.
    ///
    /// Defaults to `$NA_SM_TMP_DIRECTORY`, or the temporary directory of the system.
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Remove the objects of this user instead of the current one.
    #[arg(long)]
    user: Option<String>,

    /// Directory listing the shared memory objects.
    #[arg(long, default_value = "/dev/shm")]
    shm_dir: PathBuf,

    /// Print what would be removed, remove nothing.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<(), shm_na::Error> {
    #[cfg(feature = "tracing")]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let CleanupCommand {
        tmp_dir,
        user,
        shm_dir,
        dry_run,
    } = CleanupCommand::parse();

    let tmp_dir = tmp_dir.unwrap_or_else(|| Config::default().tmp_dir);
    let user = user.unwrap_or_else(current_user);

    let options = Cleanup {
        naming: Naming::new(tmp_dir, user),
        shm_dir,
        dry_run,
    };

    let report = cleanup(&options)?;

    let verb = if dry_run { "would remove" } else { "removed" };
    for dir in &report.dirs {
        println!("{verb} {}", dir.display());
    }

    for name in &report.segments {
        println!("{verb} {}", options.shm_dir.join(name).display());
    }

    Ok(())
}
