//! Builds a level-0 table file from an in-memory iterator.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::config::Options;
use crate::error::Result;
use crate::filename::table_file_name;
use crate::iterator::DbIter;
use crate::key::InternalKeyComparator;
use crate::sstable::table::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::FileMetaData;

/// Drains `iter` (already ordered by internal key) into table file
/// `number`. Returns metadata with `size == 0` when the iterator was
/// empty; the file is removed in that case, and on any error.
pub fn build_table(
    dir: &Path,
    opts: &Arc<Options>,
    icmp: &Arc<InternalKeyComparator>,
    table_cache: &TableCache,
    iter: &mut dyn DbIter,
    number: u64,
) -> Result<FileMetaData> {
    let path = table_file_name(dir, number);
    iter.seek_to_first();
    if !iter.valid() {
        iter.status()?;
        return Ok(FileMetaData::new(number, 0, Vec::new(), Vec::new()));
    }

    let result = (|| -> Result<FileMetaData> {
        let file = File::create(&path)?;
        let mut builder = TableBuilder::new(Arc::clone(opts), Arc::clone(icmp), file);

        let smallest = iter.key().to_vec();
        let mut largest = smallest.clone();
        while iter.valid() {
            largest.clear();
            largest.extend_from_slice(iter.key());
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;

        let size = builder.finish()?;
        let meta = FileMetaData::new(number, size, smallest, largest);

        // Verify the file is usable; this also primes the table cache.
        table_cache.find_table(number, size)?;
        Ok(meta)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ShardedCache;
    use crate::config::ReadOptions;
    use crate::key::{make_internal_key, BytewiseComparator, ValueTag, TAG_FOR_SEEK};
    use crate::memtable::MemTable;
    use crate::tmpfs::TempDir;

    fn icmp() -> Arc<InternalKeyComparator> {
        Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn table_cache(dir: &TempDir, opts: &Arc<Options>) -> TableCache {
        TableCache::new(
            dir.path().to_path_buf(),
            Arc::clone(opts),
            icmp(),
            Arc::new(ShardedCache::new(1 << 20)),
        )
    }

    #[test]
    fn test_build_from_memtable() {
        let dir = TempDir::new().unwrap();
        let opts = Arc::new(Options::default());
        let cache = table_cache(&dir, &opts);

        let mem = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))));
        for i in 0..100 {
            mem.add(
                i + 1,
                ValueTag::Value,
                format!("key-{i:03}").as_bytes(),
                format!("val-{i:03}").as_bytes(),
            );
        }

        let mut iter = mem.iter();
        let meta = build_table(dir.path(), &opts, &icmp(), &cache, &mut iter, 7)
            .expect("build failed");
        assert_eq!(meta.number, 7);
        assert!(meta.size > 0);
        assert_eq!(crate::key::extract_user_key(&meta.smallest), b"key-000");
        assert_eq!(crate::key::extract_user_key(&meta.largest), b"key-099");

        // The table round-trips through the cache.
        let probe = make_internal_key(b"key-050", 1000, TAG_FOR_SEEK);
        let (_, value) = cache
            .get(&ReadOptions::new(), 7, meta.size, &probe)
            .unwrap()
            .expect("missing key");
        assert_eq!(value, b"val-050");
    }

    #[test]
    fn test_empty_iterator_builds_nothing() {
        let dir = TempDir::new().unwrap();
        let opts = Arc::new(Options::default());
        let cache = table_cache(&dir, &opts);

        let mem = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))));
        let mut iter = mem.iter();
        let meta = build_table(dir.path(), &opts, &icmp(), &cache, &mut iter, 9)
            .expect("build failed");
        assert_eq!(meta.size, 0);
        assert!(!table_file_name(dir.path(), 9).exists());
    }
}
