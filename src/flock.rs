//! Advisory locking for the database directory.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Exclusive advisory lock over the `LOCK` file, guaranteeing one process
/// owns the directory at a time. Dropping the guard closes the descriptor
/// and with it the lock; the file itself is left behind so a concurrent
/// opener never races its re-creation.
pub struct FileLock {
    _file: File,
}

impl FileLock {
    pub fn lock(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.as_ref())?;

        acquire_exclusive(&file)?;

        // Stamp the holder. The lock lives on the inode, so this is
        // informational only; truncating after acquisition means a failed
        // attempt never clobbers the real holder's stamp.
        file.set_len(0)?;
        writeln!(file, "pid {}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn acquire_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // Non-blocking: a second opener must fail fast, not queue behind the
    // first.
    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(not(unix))]
fn acquire_exclusive(_file: &File) -> io::Result<()> {
    // No advisory locking on this platform; single-process use only.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs;

    #[test]
    fn test_lock_stamps_holder_pid() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("LOCK");

        let _lock = FileLock::lock(&lock_path).expect("failed to acquire lock");
        let stamp = fs::read_to_string(&lock_path).expect("failed to read lock file");
        assert_eq!(stamp, format!("pid {}\n", std::process::id()));
    }

    #[test]
    fn test_second_lock_fails_fast() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("LOCK");

        let _held = FileLock::lock(&lock_path).expect("failed to acquire lock");
        assert!(FileLock::lock(&lock_path).is_err());
    }

    #[test]
    fn test_drop_releases_and_keeps_file() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("LOCK");

        {
            let _lock = FileLock::lock(&lock_path).expect("failed to acquire lock");
        }
        // The lock is free again but the file was not removed.
        assert!(lock_path.exists());
        let _again = FileLock::lock(&lock_path).expect("lock should be free after drop");
    }
}
