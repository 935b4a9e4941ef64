//! Composition of an index-block cursor with per-data-block cursors.
//!
//! The index iterator yields encoded block handles; the data iterator is
//! materialised lazily through a loader callback and replaced whenever the
//! index moves to a different handle. Movement skips empty or exhausted
//! data blocks in whichever direction it is travelling.

use crate::error::{Error, Result};
use crate::iterator::DbIter;
use crate::sstable::block::BlockIter;

pub type BlockLoader = Box<dyn Fn(&[u8]) -> Result<BlockIter> + Send>;

pub struct TwoLevelIter {
    index_iter: BlockIter,
    load_block: BlockLoader,
    data_iter: Option<BlockIter>,
    /// Handle the current data iterator was loaded from.
    data_block_handle: Vec<u8>,
    err: Option<Error>,
}

impl TwoLevelIter {
    pub fn new(index_iter: BlockIter, load_block: BlockLoader) -> Self {
        Self {
            index_iter,
            load_block,
            data_iter: None,
            data_block_handle: Vec::new(),
            err: None,
        }
    }

    fn save_error(&mut self, result: Result<()>) {
        if self.err.is_none() {
            if let Err(e) = result {
                self.err = Some(e);
            }
        }
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.clear_data_iter();
            return;
        }
        let handle = self.index_iter.value().to_vec();
        if self.data_iter.is_some() && handle == self.data_block_handle {
            return;
        }
        match (self.load_block)(&handle) {
            Ok(iter) => {
                self.clear_data_iter();
                self.data_block_handle = handle;
                self.data_iter = Some(iter);
            }
            Err(e) => {
                self.clear_data_iter();
                self.err = Some(e);
            }
        }
    }

    fn clear_data_iter(&mut self) {
        if let Some(iter) = self.data_iter.take() {
            self.save_error(iter.status());
        }
        self.data_block_handle.clear();
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|d| !d.valid()) {
            if !self.index_iter.valid() {
                self.clear_data_iter();
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|d| !d.valid()) {
            if !self.index_iter.valid() {
                self.clear_data_iter();
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_last();
            }
        }
    }
}

impl DbIter for TwoLevelIter {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|d| d.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data_iter {
            data.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data_iter {
            data.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not valid").value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(data) = &self.data_iter {
            data.status()?;
        }
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
