//! Host-wide run lock.
//!
//! Device bindings and the module table are host-global, so runs are
//! serialized with an exclusive advisory `flock` held for the run's
//! duration. A second run fails fast instead of waiting.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use nicprep_common::{HostPrepError, HostPrepResult};

/// Default lock file.
pub const DEFAULT_LOCK_PATH: &str = "/run/nicprep.lock";

/// An acquired run lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl RunLock {
    /// Takes the lock at `path`, creating the file if needed.
    ///
    /// Returns `ConcurrentRunRejected` if another run holds it.
    pub fn acquire(path: impl AsRef<Path>) -> HostPrepResult<Self> {
        let path = path.as_ref();
        let io_err = |source: std::io::Error| HostPrepError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                HostPrepError::ConcurrentRunRejected {
                    lock_path: path.to_path_buf(),
                }
            } else {
                io_err(std::io::Error::from(errno))
            }
        })?;

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    /// The lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
