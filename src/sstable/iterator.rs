//! Two-level iteration: an index iterator driving per-block iterators.
//!
//! The same shape serves two purposes: iterating one table (index block →
//! data blocks) and iterating a sorted level (file list → table
//! iterators). The index iterator yields opaque handle bytes; a
//! caller-supplied function turns a handle into the iterator it denotes.

use crate::iterator::InternalIterator;

use super::TableError;

/// Maps index-entry value bytes to the iterator they reference.
pub type BlockFunction =
    Box<dyn Fn(&[u8]) -> Result<Box<dyn InternalIterator>, TableError> + Send>;

/// An iterator over an index of iterators.
///
/// Empty or unreadable sub-iterators are skipped; a failed block load
/// parks the iterator invalid with the error held for `status()`.
pub struct TwoLevelIterator {
    index_iter: Box<dyn InternalIterator>,
    block_function: BlockFunction,
    data_iter: Option<Box<dyn InternalIterator>>,
    /// Handle bytes backing `data_iter`, to avoid reloading the same
    /// block on repeated seeks.
    data_block_handle: Vec<u8>,
    error: Option<TableError>,
}

impl TwoLevelIterator {
    pub fn new(index_iter: Box<dyn InternalIterator>, block_function: BlockFunction) -> Self {
        Self {
            index_iter,
            block_function,
            data_iter: None,
            data_block_handle: Vec::new(),
            error: None,
        }
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let handle = self.index_iter.value();
        if self.data_iter.is_some() && self.data_block_handle == handle {
            // Same block as before; keep the existing position machinery.
            return;
        }
        match (self.block_function)(handle) {
            Ok(iter) => {
                self.data_block_handle = handle.to_vec();
                self.data_iter = Some(iter);
            }
            Err(err) => {
                if self.error.is_none() {
                    self.error = Some(err);
                }
                self.data_iter = None;
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|d| !d.valid()) {
            if self.error.is_some() || !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().is_none_or(|d| !d.valid()) {
            if self.error.is_some() || !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TwoLevelIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|d| d.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = self.data_iter.as_mut() {
            data.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = self.data_iter.as_mut() {
            data.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("key() on invalid two-level iterator")
            .key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("value() on invalid two-level iterator")
            .value()
    }

    fn status(&self) -> Result<(), TableError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.index_iter.status()?;
        if let Some(data) = &self.data_iter {
            data.status()?;
        }
        Ok(())
    }
}
