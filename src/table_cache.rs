//! Cache of open sstables.
//!
//! Maps file numbers to open [`Table`] readers (file descriptor, resident
//! index and filter blocks). Bounded by `max_open_files`; the charge per
//! entry is 1 so capacity counts tables, not bytes. Eviction closes the
//! descriptor once the last reader drops its handle.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::ShardedCache;
use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::filename::table_file_name;
use crate::key::InternalKeyComparator;
use crate::sstable::table::{BlockCache, Table};
use crate::sstable::two_level::TwoLevelIter;

pub struct TableCache {
    dir: PathBuf,
    opts: Arc<Options>,
    cmp: Arc<InternalKeyComparator>,
    block_cache: Arc<BlockCache>,
    cache: ShardedCache<u64, Arc<Table>>,
}

impl TableCache {
    pub fn new(
        dir: PathBuf,
        opts: Arc<Options>,
        cmp: Arc<InternalKeyComparator>,
        block_cache: Arc<BlockCache>,
    ) -> Self {
        let capacity = opts.max_open_files;
        Self {
            dir,
            opts,
            cmp,
            block_cache,
            cache: ShardedCache::new(capacity),
        }
    }

    /// Opens (or fetches the cached) reader for a table file.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lookup(&file_number) {
            return Ok(Arc::clone(&*table));
        }
        let path = table_file_name(&self.dir, file_number);
        let file = File::open(&path)?;
        let table = Arc::new(Table::open(
            Arc::clone(&self.opts),
            Arc::clone(&self.cmp),
            Some(Arc::clone(&self.block_cache)),
            file,
            file_size,
        )?);
        let handle = self.cache.insert(file_number, Arc::clone(&table), 1);
        drop(handle);
        Ok(table)
    }

    /// Iterator over a table's internal entries.
    pub fn iter(
        &self,
        ropts: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TwoLevelIter> {
        let table = self.find_table(file_number, file_size)?;
        Ok(table.iter(ropts))
    }

    /// Point lookup inside one table.
    pub fn get(
        &self,
        ropts: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.get(ropts, internal_key)
    }

    /// Drops the cached reader for a deleted table file.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}
