//! Last-resort maintenance entry points: [`destroy`] removes a database;
//! [`repair`] rebuilds a usable manifest from whatever files survive.
//!
//! Repair ignores the existing manifest entirely: orphaned write-ahead
//! logs are converted to tables, every readable table is scanned for its
//! key range and newest sequence, and a fresh manifest places all of them
//! at level 0 (first compaction re-sorts the tree). Unreadable tables are
//! moved aside into `lost/` rather than deleted.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::batch::WriteBatch;
use crate::cache::ShardedCache;
use crate::config::{Options, ReadOptions};
use crate::error::{Error, Result};
use crate::filename::{
    lock_file_name, log_file_name, parse_file_name, set_current_file, table_file_name, FileType,
};
use crate::flock::FileLock;
use crate::iterator::DbIter;
use crate::key::{parse_internal_key, Comparator, InternalKeyComparator, SequenceNumber};
use crate::memtable::MemTable;
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::FileMetaData;
use crate::wal::{LogReader, LogWriter};

/// Deletes the database in `dir`: every file the engine recognises, then
/// the directory itself if nothing foreign remains.
pub fn destroy(dir: impl AsRef<Path>, _options: Options) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    let lock = FileLock::lock(lock_file_name(dir))
        .map_err(|e| Error::Io(format!("could not lock database directory: {e}")))?;

    for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some((kind, _)) = parse_file_name(&name) else {
            continue;
        };
        if kind == FileType::Lock {
            continue;
        }
        std::fs::remove_file(entry.path())?;
    }
    drop(lock);
    let _ = std::fs::remove_file(lock_file_name(dir));
    let _ = std::fs::remove_dir(dir);
    Ok(())
}

struct TableInfo {
    meta: FileMetaData,
    max_sequence: SequenceNumber,
}

/// Rebuilds the manifest of the database in `dir` from its surviving log
/// and table files.
pub fn repair(dir: impl AsRef<Path>, options: Options) -> Result<()> {
    let dir = dir.as_ref().to_path_buf();
    let opts = Arc::new(options);
    let _lock = FileLock::lock(lock_file_name(&dir))
        .map_err(|e| Error::Io(format!("could not lock database directory: {e}")))?;

    let icmp = Arc::new(InternalKeyComparator::new(Arc::clone(&opts.comparator)));
    let table_cache = Arc::new(TableCache::new(
        dir.clone(),
        Arc::clone(&opts),
        Arc::clone(&icmp),
        Arc::new(ShardedCache::new(opts.block_cache_capacity)),
    ));

    // Inventory the directory.
    let mut log_numbers = Vec::new();
    let mut table_numbers = Vec::new();
    let mut manifests = Vec::new();
    let mut max_number = 1;
    for entry in std::fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some((kind, number)) = parse_file_name(&name) else {
            continue;
        };
        max_number = max_number.max(number);
        match kind {
            FileType::Log => log_numbers.push(number),
            FileType::Table => table_numbers.push(number),
            FileType::Manifest => manifests.push(name),
            _ => {}
        }
    }
    log_numbers.sort_unstable();
    let mut next_file_number = max_number + 1;

    // Convert every log into a fresh table, salvaging what decodes.
    for &log_number in &log_numbers {
        let mem = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::clone(
            &opts.comparator,
        ))));
        let file = File::open(log_file_name(&dir, log_number))?;
        let mut reader = LogReader::new(file, false);
        loop {
            let record = match reader.read_record() {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(log_number, error = %e, "stopping log salvage early");
                    break;
                }
            };
            if record.len() < crate::batch::BATCH_HEADER_SIZE {
                continue;
            }
            let Ok(batch) = WriteBatch::from_contents(record) else {
                continue;
            };
            if batch.insert_into(&mem).is_err() {
                tracing::warn!(log_number, "skipping undecodable batch during repair");
            }
        }
        if !mem.is_empty() {
            let number = next_file_number;
            next_file_number += 1;
            let mut iter = mem.iter();
            let meta = super::builder::build_table(
                &dir,
                &opts,
                &icmp,
                &table_cache,
                &mut iter,
                number,
            )?;
            if meta.size > 0 {
                tracing::info!(log_number, table = number, "salvaged log into table");
                table_numbers.push(number);
            }
        }
        std::fs::remove_file(log_file_name(&dir, log_number))?;
    }

    // Scan every table for its bounds; quarantine unreadable ones.
    let mut tables: Vec<TableInfo> = Vec::new();
    for &number in &table_numbers {
        match scan_table(&dir, &table_cache, number) {
            Ok(info) => tables.push(info),
            Err(e) => {
                tracing::warn!(table = number, error = %e, "moving unreadable table to lost/");
                let lost = dir.join("lost");
                let _ = std::fs::create_dir_all(&lost);
                let name = format!("{number:06}.ldb");
                let _ = std::fs::rename(table_file_name(&dir, number), lost.join(name));
            }
        }
    }

    let max_sequence = tables.iter().map(|t| t.max_sequence).max().unwrap_or(0);

    // Fresh manifest: everything at level 0, ordered for recovery. The
    // manifest takes a number of its own so nothing ever reuses it.
    let manifest_number = next_file_number;
    next_file_number += 1;

    let mut edit = VersionEdit::new();
    edit.set_comparator_name(opts.comparator.name());
    edit.set_log_number(0);
    edit.set_next_file_number(next_file_number);
    edit.set_last_sequence(max_sequence);
    for table in &tables {
        edit.add_file(0, table.meta.clone());
    }
    let manifest_path = crate::filename::manifest_file_name(&dir, manifest_number);
    {
        let file = File::create(&manifest_path)?;
        let mut log = LogWriter::new(file)?;
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        log.add_record(&record)?;
        log.sync()?;
    }
    set_current_file(&dir, manifest_number)?;

    // Old manifests describe a file set that no longer exists.
    for name in manifests {
        let _ = std::fs::remove_file(dir.join(name));
    }

    tracing::info!(
        tables = tables.len(),
        last_sequence = max_sequence,
        "repair complete"
    );
    Ok(())
}

fn scan_table(dir: &Path, table_cache: &TableCache, number: u64) -> Result<TableInfo> {
    let size = std::fs::metadata(table_file_name(dir, number))?.len();
    let mut iter = table_cache.iter(&ReadOptions::new().verify_checksums(true), number, size)?;

    let mut smallest: Option<Vec<u8>> = None;
    let mut largest: Vec<u8> = Vec::new();
    let mut max_sequence = 0;
    let mut entries = 0u64;

    iter.seek_to_first();
    while iter.valid() {
        let key = iter.key();
        if smallest.is_none() {
            smallest = Some(key.to_vec());
        }
        largest.clear();
        largest.extend_from_slice(key);
        if let Some(parsed) = parse_internal_key(key) {
            max_sequence = max_sequence.max(parsed.sequence);
        }
        entries += 1;
        iter.next();
    }
    iter.status()?;

    let smallest =
        smallest.ok_or_else(|| Error::Corruption(format!("table {number:06} is empty")))?;
    tracing::debug!(table = number, entries, "scanned table during repair");
    Ok(TableInfo {
        meta: FileMetaData::new(number, size, smallest, largest),
        max_sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteOptions;
    use crate::db::Database;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_destroy_removes_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let db = Database::open(&path, Options::default().create_if_missing(true)).unwrap();
            db.put(&WriteOptions::default(), b"k", b"v").unwrap();
        }
        assert!(path.join("CURRENT").exists());
        destroy(&path, Options::default()).expect("destroy failed");
        assert!(!path.join("CURRENT").exists());
    }

    #[test]
    fn test_repair_rebuilds_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let db = Database::open(&path, Options::default().create_if_missing(true)).unwrap();
            for i in 0..100 {
                db.put(
                    &WriteOptions::default(),
                    format!("key-{i:03}").as_bytes(),
                    format!("val-{i:03}").as_bytes(),
                )
                .unwrap();
            }
            db.flush_memtable().unwrap();
        }

        // Simulate a mangled control file set.
        std::fs::remove_file(path.join("CURRENT")).unwrap();

        repair(&path, Options::default()).expect("repair failed");

        let db = Database::open(&path, Options::default()).expect("reopen after repair failed");
        for i in (0..100).step_by(9) {
            let value = db
                .get(&ReadOptions::new(), format!("key-{i:03}").as_bytes())
                .unwrap();
            assert_eq!(value.as_deref(), Some(format!("val-{i:03}").as_bytes()));
        }
    }

    #[test]
    fn test_repair_salvages_logs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let db = Database::open(&path, Options::default().create_if_missing(true)).unwrap();
            // Left in the log only; never flushed.
            db.put(&WriteOptions::default(), b"only-in-log", b"survives")
                .unwrap();
        }
        std::fs::remove_file(path.join("CURRENT")).unwrap();

        repair(&path, Options::default()).expect("repair failed");
        let db = Database::open(&path, Options::default()).unwrap();
        assert_eq!(
            db.get(&ReadOptions::new(), b"only-in-log").unwrap(),
            Some(b"survives".to_vec())
        );
    }
}
