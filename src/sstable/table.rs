//! Immutable sorted table files.
//!
//! ```text
//! +--------------------+
//! | data block 0       |   prefix-compressed entries + trailer
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | filter block       |   optional, uncompressed
//! +--------------------+
//! | metaindex block    |   "filter.<policy>" -> filter handle
//! +--------------------+
//! | index block        |   separator key -> data block handle
//! +--------------------+
//! | footer (48 bytes)  |
//! +--------------------+
//! ```
//!
//! The builder accepts strictly increasing internal keys. Index entries use
//! shortened separators so the index stays small; the index block uses a
//! restart interval of 1 because it is loaded whole and binary searched.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::ShardedCache;
use crate::config::{Compression, Options, ReadOptions};
use crate::encoding::masked_crc;
use crate::error::{Error, Result};
use crate::iterator::DbIter;
use crate::key::{extract_user_key, Comparator, InternalKeyComparator};
use crate::sstable::block::{Block, BlockBuilder, BlockIter};
use crate::sstable::filter::{FilterBlockBuilder, FilterBlockReader};
use crate::sstable::footer::{read_block, BlockHandle, Footer, BLOCK_TRAILER_SIZE, FOOTER_SIZE};
use crate::sstable::two_level::TwoLevelIter;

/// Decoded data blocks are cached under `(cache id, block offset)`.
pub type BlockCacheKey = (u64, u64);
pub type BlockCache = ShardedCache<BlockCacheKey, Block>;

const METAINDEX_FILTER_PREFIX: &str = "filter.";

/// Streams a sorted run of internal keys into a table file.
pub struct TableBuilder {
    opts: Arc<Options>,
    cmp: Arc<InternalKeyComparator>,
    file: BufWriter<File>,
    offset: u64,
    num_entries: u64,
    closed: bool,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    /// An index entry for the just-finished data block is deferred until
    /// the next key arrives, so its separator can sit between the blocks.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    filter_block: Option<FilterBlockBuilder>,
}

impl TableBuilder {
    pub fn new(opts: Arc<Options>, cmp: Arc<InternalKeyComparator>, file: File) -> Self {
        let filter_block = opts
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(Arc::clone(policy)));
        let data_restart = opts.block_restart_interval;
        Self {
            opts,
            cmp,
            file: BufWriter::new(file),
            offset: 0,
            num_entries: 0,
            closed: false,
            data_block: BlockBuilder::new(data_restart),
            // The index block is read whole and binary searched; every
            // entry is a restart point.
            index_block: BlockBuilder::new(1),
            last_key: Vec::new(),
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            filter_block,
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        if self.num_entries > 0 {
            debug_assert!(self.cmp.compare(key, &self.last_key) == std::cmp::Ordering::Greater);
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            let mut separator = self.last_key.clone();
            self.cmp.find_shortest_separator(&mut separator, key);
            self.index_block
                .add(&separator, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }

        if let Some(filter) = &mut self.filter_block {
            filter.add_key(extract_user_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.opts.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Finishes the current data block and records its pending index entry.
    fn flush(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let restart = self.opts.block_restart_interval;
        let contents = std::mem::replace(&mut self.data_block, BlockBuilder::new(restart)).finish();
        self.pending_handle = self.write_block(&contents, self.opts.compression)?;
        self.pending_index_entry = true;

        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Compresses (when worthwhile), appends the block and its trailer.
    fn write_block(&mut self, contents: &[u8], compression: Compression) -> Result<BlockHandle> {
        match compression {
            Compression::None => self.write_raw_block(contents, Compression::None),
            Compression::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(contents)
                    .map_err(|e| Error::Io(e.to_string()))?;
                // Only keep the compressed form if it saves at least 1/8.
                if compressed.len() < contents.len() - contents.len() / 8 {
                    self.write_raw_block(&compressed, Compression::Snappy)
                } else {
                    self.write_raw_block(contents, Compression::None)
                }
            }
        }
    }

    fn write_raw_block(&mut self, data: &[u8], compression: Compression) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, data.len() as u64);
        self.file.write_all(data)?;

        let tag = compression as u8;
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = tag;
        LittleEndian::write_u32(&mut trailer[1..], masked_crc(&[data, &[tag]]));
        self.file.write_all(&trailer)?;

        self.offset += (data.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far; the final size once `finish` returns.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// Writes the filter, metaindex, index blocks and the footer, then
    /// flushes and fsyncs. Returns the total file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Filter block, uncompressed: its offsets are absolute.
        let filter_handle = match self.filter_block.take() {
            Some(filter) => Some(self.write_raw_block(&filter.finish(), Compression::None)?),
            None => None,
        };

        // Metaindex.
        let mut metaindex = BlockBuilder::new(1);
        if let (Some(handle), Some(policy)) = (filter_handle, self.opts.filter_policy.as_ref()) {
            let key = format!("{METAINDEX_FILTER_PREFIX}{}", policy.name());
            metaindex.add(key.as_bytes(), &handle.encoded());
        }
        let metaindex_handle = {
            let contents = metaindex.finish();
            self.write_block(&contents, self.opts.compression)?
        };

        // Index.
        if self.pending_index_entry {
            let mut separator = self.last_key.clone();
            self.cmp.find_short_successor(&mut separator);
            self.index_block
                .add(&separator, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }
        let index_handle = {
            let restart = 1;
            let contents =
                std::mem::replace(&mut self.index_block, BlockBuilder::new(restart)).finish();
            self.write_block(&contents, self.opts.compression)?
        };

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.file.write_all(&footer.encode())?;
        self.offset += FOOTER_SIZE as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.offset)
    }
}

/// An open table file: footer verified, index and filter blocks resident.
pub struct Table {
    file: File,
    opts: Arc<Options>,
    cmp: Arc<InternalKeyComparator>,
    block_cache: Option<Arc<BlockCache>>,
    cache_id: u64,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
}

impl Table {
    pub fn open(
        opts: Arc<Options>,
        cmp: Arc<InternalKeyComparator>,
        block_cache: Option<Arc<BlockCache>>,
        file: File,
        file_size: u64,
    ) -> Result<Table> {
        if (file_size as usize) < FOOTER_SIZE {
            return crate::corruption!("file too short to be an sstable");
        }
        let mut footer_buf = [0u8; FOOTER_SIZE];
        {
            use std::os::unix::fs::FileExt;
            file.read_exact_at(&mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        }
        let footer = Footer::decode(&footer_buf)?;

        let index_contents = read_block(&file, footer.index_handle, true)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        // The filter handle hides behind the metaindex; a missing or
        // unreadable filter only costs performance.
        let filter = match opts.filter_policy.as_ref() {
            Some(policy) => {
                Self::read_filter(&file, footer.metaindex_handle, policy.name()).unwrap_or(None)
            }
            None => None,
        };

        let cache_id = block_cache.as_ref().map_or(0, |c| c.new_id());
        Ok(Table {
            file,
            opts,
            cmp,
            block_cache,
            cache_id,
            index_block,
            filter,
        })
    }

    fn read_filter(
        file: &File,
        metaindex_handle: BlockHandle,
        policy_name: &str,
    ) -> Result<Option<FilterBlockReader>> {
        let contents = read_block(file, metaindex_handle, true)?;
        let metaindex = Arc::new(Block::new(contents)?);
        let mut iter = metaindex.iter(Arc::new(crate::key::BytewiseComparator));
        let key = format!("{METAINDEX_FILTER_PREFIX}{policy_name}");
        iter.seek(key.as_bytes());
        if !iter.valid() || iter.key() != key.as_bytes() {
            return Ok(None);
        }
        let (handle, _) = BlockHandle::decode_from(iter.value())?;
        let filter_contents = read_block(file, handle, true)?;
        Ok(FilterBlockReader::new(filter_contents))
    }

    /// Fetches a data block, consulting the block cache.
    fn data_block(&self, handle: BlockHandle, ropts: &ReadOptions) -> Result<Arc<Block>> {
        if let Some(cache) = &self.block_cache {
            let key = (self.cache_id, handle.offset);
            if let Some(block) = cache.lookup(&key) {
                return Ok(block);
            }
            let contents = read_block(&self.file, handle, ropts.verify_checksums)?;
            let block = Block::new(contents)?;
            if ropts.fill_cache {
                let charge = block.size();
                return Ok(cache.insert(key, block, charge));
            }
            return Ok(Arc::new(block));
        }
        let contents = read_block(&self.file, handle, ropts.verify_checksums)?;
        Ok(Arc::new(Block::new(contents)?))
    }

    fn block_iter(&self, encoded_handle: &[u8], ropts: &ReadOptions) -> Result<BlockIter> {
        let (handle, _) = BlockHandle::decode_from(encoded_handle)?;
        let block = self.data_block(handle, ropts)?;
        let cmp: Arc<dyn Comparator> = Arc::clone(&self.cmp) as Arc<dyn Comparator>;
        Ok(block.iter(cmp))
    }

    /// Iterator over the table's internal entries.
    pub fn iter(self: &Arc<Self>, ropts: &ReadOptions) -> TwoLevelIter {
        let cmp: Arc<dyn Comparator> = Arc::clone(&self.cmp) as Arc<dyn Comparator>;
        let index_iter = self.index_block.iter(cmp);
        let table = Arc::clone(self);
        let ropts = ropts.clone();
        TwoLevelIter::new(
            index_iter,
            Box::new(move |encoded| table.block_iter(encoded, &ropts)),
        )
    }

    /// Point lookup: returns the first entry at or after `internal_key`
    /// within its data block, or None when the table cannot contain it.
    pub fn get(
        &self,
        ropts: &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cmp: Arc<dyn Comparator> = Arc::clone(&self.cmp) as Arc<dyn Comparator>;
        let mut index_iter = self.index_block.iter(cmp);
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;
        if let (Some(filter), Some(policy)) = (&self.filter, self.opts.filter_policy.as_ref()) {
            if !filter.key_may_match(policy.as_ref(), handle.offset, extract_user_key(internal_key))
            {
                return Ok(None);
            }
        }

        let block = self.data_block(handle, ropts)?;
        let cmp: Arc<dyn Comparator> = Arc::clone(&self.cmp) as Arc<dyn Comparator>;
        let mut block_iter = block.iter(cmp);
        block_iter.seek(internal_key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// Approximate file offset at which `internal_key` would live.
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let cmp: Arc<dyn Comparator> = Arc::clone(&self.cmp) as Arc<dyn Comparator>;
        let mut index_iter = self.index_block.iter(cmp);
        index_iter.seek(internal_key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        // Past every data block: approximate with the metaindex offset,
        // i.e. close to the file size.
        self.file
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0)
    }
}
