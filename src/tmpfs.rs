//! Scratch directories and files for tests.
//!
//! Paths are minted from the process id plus a process-wide counter, so
//! parallel test binaries and parallel tests within one binary never
//! collide. Everything lands directly under the platform temp directory
//! and is removed again on drop, best effort.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCRATCH_ID: AtomicU64 = AtomicU64::new(0);

fn mint_path(kind: &str) -> PathBuf {
    let id = NEXT_SCRATCH_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "cinderdb-{kind}-{pid}-{id}",
        pid = std::process::id()
    ))
}

/// A directory that exists for the lifetime of the value.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let path = mint_path("dir");
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A file created up front so it can be reopened any number of times
/// (readers and writers concurrently, as the log and table tests need).
pub struct NamedTempFile {
    path: PathBuf,
}

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        let path = mint_path("file");
        fs::File::create(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh read/write handle onto the same file, positioned at the
    /// start and leaving existing contents alone.
    pub fn reopen(&self) -> std::io::Result<fs::File> {
        fs::File::options().read(true).write(true).open(&self.path)
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_unique() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_dir_removed_on_drop() {
        let path = {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("leftover"), b"x").unwrap();
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_file_exists_and_reopens() {
        let file = NamedTempFile::new().unwrap();
        assert!(file.path().exists());
        let _first = file.reopen().unwrap();
        let _second = file.reopen().unwrap();

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }
}
