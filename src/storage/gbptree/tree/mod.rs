//! Tree handles.
//!
//! [`GbpTree`] owns the paged file through a shared core: readers seek without
//! locks, a single writer at a time mutates through [`TreeWriter`], and
//! checkpoints publish everything written since the previous one.

pub(crate) mod inner;
mod recovery;
mod sample;
pub(crate) mod seek;
pub(crate) mod walk;
pub(crate) mod writer;

use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use parking_lot::MutexGuard;

use self::inner::{TreeInner, WriterState};
use self::seek::{RootSource, SeekCursor};
use self::writer::Writer;
use super::checker::{self, ConsistencyReport, ConsistencyVisitor};
use super::inspect::{self, TreeInspection};
use super::layout::{encode_key, encode_value, Layout};
use super::merge::{MergeOutcome, ValueMerger};
use super::node::corruption::Corruption;
use super::node::Schema;
use super::options::GbpTreeOptions;
use super::state::{self, TreeState};
use super::stats::GbpTreeStatsSnapshot;
use crate::primitives::io::MemFileIo;
use crate::primitives::pager::PagedFile;
use crate::types::{GbpError, Result};

pub(crate) use recovery::collector_for;
pub use recovery::{
    BackgroundCleanup, CleanupJob, CleanupWorkCollector, DeferredCleanup, ImmediateCleanup,
};

/// A generation-safe B+Tree mapping `L::Key` to `L::Value`.
pub struct GbpTree<L: Layout> {
    inner: Arc<TreeInner>,
    layout: L,
    collector: Arc<dyn CleanupWorkCollector>,
}

fn file_pages(path: &Path, options: &GbpTreeOptions) -> Result<PagedFile> {
    let page_size = options.page_size as usize;
    if (options.read_only || !options.create_if_missing) && !path.exists() {
        return Err(GbpError::NotFound);
    }
    if options.read_only {
        PagedFile::open_read_only(path, page_size)
    } else {
        PagedFile::open(path, page_size)
    }
}

fn memory_pages(io: MemFileIo, options: &GbpTreeOptions) -> Result<PagedFile> {
    PagedFile::map(Arc::new(io), options.page_size as usize, options.read_only)
}

fn encode_bound<L: Layout>(layout: &L, bound: Bound<&L::Key>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(encode_key(layout, key)),
        Bound::Excluded(key) => Bound::Excluded(encode_key(layout, key)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl<L: Layout> GbpTree<L> {
    /// Opens or creates the tree stored at `path`.
    pub fn open(path: impl AsRef<Path>, layout: L, options: GbpTreeOptions) -> Result<Self> {
        options.validate()?;
        let pages = file_pages(path.as_ref(), &options)?;
        let collector = collector_for(options.cleanup);
        Self::open_with(pages, layout, options, collector, &[])
    }

    /// Opens or creates a tree over an in-memory file. Clones of `io` see
    /// exactly what was flushed, which makes them usable as crash images.
    pub fn in_memory(io: MemFileIo, layout: L, options: GbpTreeOptions) -> Result<Self> {
        options.validate()?;
        let pages = memory_pages(io, &options)?;
        let collector = collector_for(options.cleanup);
        Self::open_with(pages, layout, options, collector, &[])
    }

    /// Opens over an already mapped file with an explicit cleanup collector.
    /// `initial_header` is stored only when the tree is created.
    pub fn open_with(
        pages: PagedFile,
        layout: L,
        options: GbpTreeOptions,
        collector: Arc<dyn CleanupWorkCollector>,
        initial_header: &[u8],
    ) -> Result<Self> {
        Self::open_schemas(pages, layout, Vec::new(), options, collector, initial_header)
    }

    /// Opens with `extra` node schemas after the one derived from `layout`.
    pub(crate) fn open_schemas(
        pages: PagedFile,
        layout: L,
        extra: Vec<Schema>,
        options: GbpTreeOptions,
        collector: Arc<dyn CleanupWorkCollector>,
        initial_header: &[u8],
    ) -> Result<Self> {
        options.validate()?;
        if initial_header.len() > state::max_header_len(pages.page_size()) {
            return Err(GbpError::Invalid("tree state header does not fit in a page"));
        }
        let mut schemas = vec![Schema::for_layout(
            &layout,
            pages.page_size(),
            options.max_key_count,
        )?];
        schemas.extend(extra);
        let inner = TreeInner::open(pages, schemas, layout.identifier(), options, initial_header)?;
        if inner.recovery_pending() && !inner.options.read_only {
            collector.add(CleanupJob::new(Arc::clone(&inner)))?;
        }
        Ok(Self {
            inner,
            layout,
            collector,
        })
    }

    /// Header bytes stored with the tree state of the file at `path`, read
    /// without opening the tree.
    pub fn read_header(path: impl AsRef<Path>, options: &GbpTreeOptions) -> Result<Vec<u8>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GbpError::NotFound);
        }
        let pages = PagedFile::open_read_only(path, options.page_size as usize)?;
        if pages.page_count() == 0 {
            return Err(GbpError::NotFound);
        }
        let (record, _) = state::select_newest(&pages)?;
        Ok(record.header)
    }

    pub(crate) fn core(&self) -> &Arc<TreeInner> {
        &self.inner
    }

    /// Layout used to encode keys and values.
    pub fn layout(&self) -> &L {
        &self.layout
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let key = encode_key(&self.layout, key);
        let mut cursor = SeekCursor::new(
            Arc::clone(&self.inner),
            0,
            RootSource::Base,
            Bound::Included(key.clone()),
            Bound::Included(key),
        )?;
        match cursor.next() {
            Some(entry) => Ok(Some(self.layout.decode_value(&entry?.1)?)),
            None => Ok(None),
        }
    }

    /// Entries in `range`, in key order. The seek observes writes made while
    /// it runs only for keys it has not passed yet.
    pub fn seek<R: RangeBounds<L::Key>>(&self, range: R) -> Result<Seek<L>> {
        let cursor = SeekCursor::new(
            Arc::clone(&self.inner),
            0,
            RootSource::Base,
            encode_bound(&self.layout, range.start_bound()),
            encode_bound(&self.layout, range.end_bound()),
        )?;
        Ok(Seek::new(cursor, self.layout.clone()))
    }

    /// Entries in `range`, in descending key order.
    pub fn seek_backward<R: RangeBounds<L::Key>>(&self, range: R) -> Result<Seek<L>> {
        let cursor = SeekCursor::new(
            Arc::clone(&self.inner),
            0,
            RootSource::Base,
            encode_bound(&self.layout, range.start_bound()),
            encode_bound(&self.layout, range.end_bound()),
        )?
        .backward();
        Ok(Seek::new(cursor, self.layout.clone()))
    }

    /// Splits `range` into at most `desired_partitions` seeks over adjacent
    /// sub-ranges, in key order, for scanning from several threads. The
    /// boundaries are separator keys of the highest internal level that has
    /// enough of them, so the parts hold similar shares of the tree; a small
    /// tree yields fewer parts than asked for.
    pub fn partitioned_seek<R: RangeBounds<L::Key>>(
        &self,
        range: R,
        desired_partitions: usize,
    ) -> Result<Vec<Seek<L>>> {
        if desired_partitions == 0 {
            return Err(GbpError::Invalid("at least one partition is required"));
        }
        let lower = encode_bound(&self.layout, range.start_bound());
        let upper = encode_bound(&self.layout, range.end_bound());
        let splits = sample::partition_keys(&self.inner, &lower, &upper, desired_partitions)?;
        let mut starts = vec![lower];
        starts.extend(splits.iter().cloned().map(Bound::Included));
        let mut ends: Vec<Bound<Vec<u8>>> = splits.into_iter().map(Bound::Excluded).collect();
        ends.push(upper);
        starts
            .into_iter()
            .zip(ends)
            .map(|(start, end)| {
                let cursor =
                    SeekCursor::new(Arc::clone(&self.inner), 0, RootSource::Base, start, end)?;
                Ok(Seek::new(cursor, self.layout.clone()))
            })
            .collect()
    }

    /// Approximate number of entries, from a sample of nodes on each level.
    /// Exact for trees whose levels are all at most 64 nodes wide.
    pub fn estimate_entry_count(&self) -> Result<u64> {
        sample::estimate_entries(&self.inner)
    }

    /// Takes the writer lock, blocking while another writer holds it.
    pub fn writer(&self) -> Result<TreeWriter<'_, L>> {
        let guard = self.inner.writer.lock();
        self.inner.check_writable()?;
        Ok(TreeWriter { tree: self, guard })
    }

    /// Inserts or replaces one entry; returns the previous value.
    pub fn put(&self, key: &L::Key, value: &L::Value) -> Result<Option<L::Value>> {
        self.writer()?.put(key, value)
    }

    /// Removes one entry; returns its value.
    pub fn remove(&self, key: &L::Key) -> Result<Option<L::Value>> {
        self.writer()?.remove(key)
    }

    /// Makes every change so far durable and visible to a reopen.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint(None)
    }

    /// Checkpoints, replacing the stored header with `update(current)`.
    pub fn checkpoint_with_header(&self, update: impl Fn(&[u8]) -> Vec<u8>) -> Result<()> {
        let update: &dyn Fn(&[u8]) -> Vec<u8> = &update;
        self.inner.checkpoint(Some(update))
    }

    /// Header bytes stored with the tree state.
    pub fn header(&self) -> Vec<u8> {
        self.inner.header()
    }

    /// True while crash cleanup has not run for this handle.
    pub fn recovery_pending(&self) -> bool {
        self.inner.recovery_pending()
    }

    /// True when the file was not closed cleanly before this open.
    pub fn was_dirty_on_startup(&self) -> bool {
        self.inner.dirty_on_startup()
    }

    /// Runs or waits for crash cleanup queued on this handle's collector.
    pub fn finish_recovery(&self) -> Result<()> {
        self.collector.drain()
    }

    /// Checkpoints with the clean flag and closes the file.
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }

    /// Walks the whole file and reports every violation found.
    pub fn consistency_report(&self) -> Result<ConsistencyReport> {
        checker::report(&self.inner)
    }

    /// Walks the whole file, passing each violation to `visitor`. Returns
    /// true when nothing was found. Blocks while a writer is active.
    pub fn consistency_check(&self, visitor: &mut dyn ConsistencyVisitor) -> Result<bool> {
        checker::check(&self.inner, visitor)
    }

    /// Structural summary: levels, node counts and freelist contents.
    pub fn inspect(&self) -> Result<TreeInspection> {
        inspect::inspect(&self.inner)
    }

    /// Damages the file on purpose, for testing checkers and recovery.
    pub fn corrupt(&self, corruption: Corruption) -> Result<()> {
        self.inner.corrupt(corruption)
    }

    /// Counters accumulated since open.
    pub fn stats(&self) -> GbpTreeStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Tree state as the next checkpoint would persist it.
    pub fn state(&self) -> TreeState {
        self.inner.writer.lock().snapshot()
    }

    /// Underlying paged file.
    pub fn page_file(&self) -> &PagedFile {
        &self.inner.pages
    }
}

/// Exclusive write access, held until dropped.
pub struct TreeWriter<'t, L: Layout> {
    tree: &'t GbpTree<L>,
    guard: MutexGuard<'t, WriterState>,
}

impl<L: Layout> TreeWriter<'_, L> {
    pub(crate) fn mutate<T>(&mut self, f: impl FnOnce(&mut Writer<'_>) -> Result<T>) -> Result<T> {
        self.tree.inner.mutate(&mut self.guard, f)
    }

    /// Inserts or replaces one entry; returns the previous value.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<Option<L::Value>> {
        let tree = self.tree;
        let layout = &tree.layout;
        let key = encode_key(layout, key);
        let value = encode_value(layout, value);
        let previous = self.mutate(|writer| writer.put_base(&key, &value))?;
        previous.map(|raw| layout.decode_value(&raw)).transpose()
    }

    /// Removes one entry; returns its value.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let tree = self.tree;
        let layout = &tree.layout;
        let key = encode_key(layout, key);
        let removed = self.mutate(|writer| writer.remove_base(&key))?;
        removed.map(|raw| layout.decode_value(&raw)).transpose()
    }

    /// Stores `value` under `key`, or, when the key is present, applies what
    /// `merger` decides for the stored value and `value`.
    pub fn merge<M: ValueMerger<L>>(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &M,
    ) -> Result<()> {
        self.merge_entry(key, value, merger, true)
    }

    /// Like [`TreeWriter::merge`] but leaves absent keys absent.
    pub fn merge_if_exists<M: ValueMerger<L>>(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &M,
    ) -> Result<()> {
        self.merge_entry(key, value, merger, false)
    }

    fn merge_entry<M: ValueMerger<L>>(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &M,
        insert_missing: bool,
    ) -> Result<()> {
        let tree = self.tree;
        let layout = &tree.layout;
        let raw_key = encode_key(layout, key);
        let existing = Writer::new(&tree.inner, &mut self.guard).get_base(&raw_key)?;
        let outcome = match existing {
            Some(raw) => merger.merge(key, &layout.decode_value(&raw)?, value),
            None if insert_missing => MergeOutcome::Replace(value.clone()),
            None => MergeOutcome::Unchanged,
        };
        match outcome {
            MergeOutcome::Unchanged => {}
            MergeOutcome::Replace(merged) => {
                let raw_value = encode_value(layout, &merged);
                self.mutate(|writer| writer.put_base(&raw_key, &raw_value))?;
            }
            MergeOutcome::Remove => {
                self.mutate(|writer| writer.remove_base(&raw_key))?;
            }
        }
        Ok(())
    }

    /// Value under `key`, including this writer's uncommitted changes.
    pub fn get(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let tree = self.tree;
        let layout = &tree.layout;
        let key = encode_key(layout, key);
        let found = Writer::new(&tree.inner, &mut self.guard).get_base(&key)?;
        found.map(|raw| layout.decode_value(&raw)).transpose()
    }
}

/// Iterator over a key range, decoding entries with the tree's layout.
pub struct Seek<L: Layout> {
    cursor: SeekCursor,
    layout: L,
}

impl<L: Layout> Seek<L> {
    pub(crate) fn new(cursor: SeekCursor, layout: L) -> Self {
        Self { cursor, layout }
    }
}

impl<L: Layout> Iterator for Seek<L> {
    type Item = Result<(L::Key, L::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor.next()?;
        Some(entry.and_then(|(key, value)| {
            Ok((
                self.layout.decode_key(&key)?,
                self.layout.decode_value(&value)?,
            ))
        }))
    }
}
