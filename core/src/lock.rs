//! Cross-process ownership of a migration.
//!
//! A process running or rolling back a migration holds an exclusive
//! `flock` on `<id>.lock` in the work directory for as long as it works on
//! it, with its PID written into the file. The kernel drops the lock when
//! the process dies, so an in-progress snapshot whose lock can be taken
//! belongs to a run that no longer exists.

use crate::FerryError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock, or `None` when another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, FerryError> {
        let file = match open_locked(path)? {
            Some(file) => file,
            None => return Ok(None),
        };
        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        lock.write_owner()?;
        Ok(Some(lock))
    }

    /// Whether some live holder has the lock right now.
    pub fn is_held(path: &Path) -> Result<bool, FerryError> {
        probe_held(path)
    }

    /// PID recorded by the last holder, if any.
    pub fn owner(path: &Path) -> Option<u32> {
        let mut content = String::new();
        File::open(path).ok()?.read_to_string(&mut content).ok()?;
        content.trim().parse().ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_owner(&mut self) -> Result<(), FerryError> {
        let path = &self.path;
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(self.file, "{}", std::process::id()))
            .and_then(|_| self.file.flush())
            .map_err(|e| FerryError::persistence(path, e))
    }
}

#[cfg(unix)]
fn open_locked(path: &Path) -> Result<Option<File>, FerryError> {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| FerryError::persistence(path, e))?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(Some(file)),
        Err(e) if e == Errno::EWOULDBLOCK => Ok(None),
        Err(e) => Err(FerryError::persistence(path, e)),
    }
}

#[cfg(unix)]
fn probe_held(path: &Path) -> Result<bool, FerryError> {
    Ok(open_locked(path)?.is_none())
}

#[cfg(not(unix))]
fn probe_held(path: &Path) -> Result<bool, FerryError> {
    Ok(path.exists())
}

// Without flock the lock file's existence is the lock; a crashed holder
// leaves it behind and it has to be removed by hand.
#[cfg(not(unix))]
fn open_locked(path: &Path) -> Result<Option<File>, FerryError> {
    match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(FerryError::persistence(path, e)),
    }
}

#[cfg(not(unix))]
impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
