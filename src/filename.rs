//! Database directory layout.
//!
//! Every file in a database directory is either one of the fixed-name
//! control files or a numbered file drawn from the single 64-bit file
//! counter persisted in the manifest:
//!
//! ```text
//! LOCK              advisory file lock
//! CURRENT           name of the live manifest, trailing newline
//! LOG, LOG.old      human-readable info log
//! MANIFEST-<n>      version-edit records, log framed
//! <n>.log           write-ahead log
//! <n>.ldb           sstable
//! <n>.dbtmp         scratch file for atomic renames
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Manifest,
    Current,
    Lock,
    InfoLog,
    OldInfoLog,
    Temp,
}

pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.ldb"))
}

pub fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn info_log_file_name(dir: &Path) -> PathBuf {
    dir.join("LOG")
}

pub fn old_info_log_file_name(dir: &Path) -> PathBuf {
    dir.join("LOG.old")
}

/// Classifies a directory entry by name. Returns None for foreign files.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        "LOG" => return Some((FileType::InfoLog, 0)),
        "LOG.old" => return Some((FileType::OldInfoLog, 0)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse::<u64>().ok()?;
        return Some((FileType::Manifest, number));
    }
    let (stem, suffix) = name.split_once('.')?;
    let number = stem.parse::<u64>().ok()?;
    match suffix {
        "log" => Some((FileType::Log, number)),
        "ldb" | "sst" => Some((FileType::Table, number)),
        "dbtmp" => Some((FileType::Temp, number)),
        _ => None,
    }
}

/// Points `CURRENT` at `MANIFEST-<manifest_number>` atomically: the new
/// contents are written to a temp file, fsynced, then renamed over CURRENT.
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let tmp = temp_file_name(dir, manifest_number);
    let contents = format!("MANIFEST-{manifest_number:06}\n");

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, current_file_name(dir))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Reads the manifest name out of `CURRENT`.
pub fn read_current_file(dir: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file_name(dir))?;
    let Some(name) = contents.strip_suffix('\n') else {
        return crate::corruption!("CURRENT file missing trailing newline");
    };
    if name.is_empty() {
        return crate::corruption!("CURRENT file is empty");
    }
    Ok(name.to_string())
}

/// Append-only human-readable event log (`LOG`). The previous incarnation
/// is rotated to `LOG.old` when the database opens.
pub struct InfoLog {
    file: std::sync::Mutex<File>,
}

impl InfoLog {
    /// Rotates `LOG` to `LOG.old` and opens a fresh `LOG`.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = info_log_file_name(dir);
        if path.exists() {
            let _ = fs::rename(&path, old_info_log_file_name(dir));
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: std::sync::Mutex::new(file),
        })
    }

    pub fn log(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_file_names() {
        let dir = PathBuf::from("/db");
        assert_eq!(log_file_name(&dir, 7), PathBuf::from("/db/000007.log"));
        assert_eq!(table_file_name(&dir, 123), PathBuf::from("/db/000123.ldb"));
        assert_eq!(
            manifest_file_name(&dir, 4),
            PathBuf::from("/db/MANIFEST-000004")
        );
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_file_name("LOCK"), Some((FileType::Lock, 0)));
        assert_eq!(parse_file_name("LOG"), Some((FileType::InfoLog, 0)));
        assert_eq!(parse_file_name("LOG.old"), Some((FileType::OldInfoLog, 0)));
        assert_eq!(parse_file_name("MANIFEST-000042"), Some((FileType::Manifest, 42)));
        assert_eq!(parse_file_name("000007.log"), Some((FileType::Log, 7)));
        assert_eq!(parse_file_name("000123.ldb"), Some((FileType::Table, 123)));
        assert_eq!(parse_file_name("000123.sst"), Some((FileType::Table, 123)));
        assert_eq!(parse_file_name("000001.dbtmp"), Some((FileType::Temp, 1)));

        assert_eq!(parse_file_name("garbage"), None);
        assert_eq!(parse_file_name("123.txt"), None);
        assert_eq!(parse_file_name("MANIFEST-abc"), None);
    }

    #[test]
    fn test_set_and_read_current() {
        let dir = TempDir::new().unwrap();
        set_current_file(dir.path(), 5).expect("failed to install CURRENT");
        let name = read_current_file(dir.path()).expect("failed to read CURRENT");
        assert_eq!(name, "MANIFEST-000005");

        // Re-pointing replaces atomically.
        set_current_file(dir.path(), 9).unwrap();
        assert_eq!(read_current_file(dir.path()).unwrap(), "MANIFEST-000009");
    }

    #[test]
    fn test_info_log_rotation() {
        let dir = TempDir::new().unwrap();
        {
            let log = InfoLog::open(dir.path()).unwrap();
            log.log("first incarnation");
        }
        let _log2 = InfoLog::open(dir.path()).unwrap();
        assert!(old_info_log_file_name(dir.path()).exists());
        let old = std::fs::read_to_string(old_info_log_file_name(dir.path())).unwrap();
        assert!(old.contains("first incarnation"));
    }
}
