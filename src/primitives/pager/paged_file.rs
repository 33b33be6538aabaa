use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::cursor::{PageAccess, PageCursor};
use super::frame::Frame;
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::types::{GbpError, PageId, Result};

/// Arena of page frames indexed by page id, backed by positioned file I/O.
///
/// Every page of the file is resident once mapped; the arena only grows.
/// Dirty frames reach the file on [`PagedFile::flush`], which may be called at
/// any time, emulating a cache that writes back in the background.
pub struct PagedFile {
    io: Arc<dyn FileIo>,
    page_size: usize,
    frames: RwLock<Vec<Arc<Frame>>>,
    read_only: bool,
    closed: AtomicBool,
}

impl PagedFile {
    /// Maps `io` with the given page size, loading every complete page.
    pub fn map(io: Arc<dyn FileIo>, page_size: usize, read_only: bool) -> Result<Self> {
        if page_size == 0 {
            return Err(GbpError::Invalid("page size must be non-zero"));
        }
        let len = io.len()?;
        let whole_pages = len / page_size as u64;
        let trailing = len % page_size as u64;
        if trailing != 0 {
            warn!(
                len,
                page_size, trailing, "ignoring partial trailing page in mapped file"
            );
            if !read_only {
                io.truncate(whole_pages * page_size as u64)?;
            }
        }
        let mut frames = Vec::with_capacity(whole_pages as usize);
        for idx in 0..whole_pages {
            let mut buf = vec![0u8; page_size].into_boxed_slice();
            io.read_at(idx * page_size as u64, &mut buf)?;
            frames.push(Arc::new(Frame::with_contents(buf, false)));
        }
        debug!(pages = whole_pages, page_size, read_only, "paged file mapped");
        Ok(Self {
            io,
            page_size,
            frames: RwLock::new(frames),
            read_only,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens (creating if needed) a file on disk.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        Self::map(Arc::new(StdFileIo::open(path)?), page_size, false)
    }

    /// Opens an existing file on disk without write access.
    pub fn open_read_only(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        Self::map(Arc::new(StdFileIo::open_read_only(path)?), page_size, true)
    }

    /// Maps an in-memory file; clones of `io` observe flushed pages.
    pub fn in_memory(io: MemFileIo, page_size: usize) -> Result<Self> {
        Self::map(Arc::new(io), page_size, false)
    }

    /// Size of each page in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages currently addressable.
    pub fn page_count(&self) -> u64 {
        self.frames.read().len() as u64
    }

    /// True if the file was mapped without write access.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns an unpinned cursor that pins `page` on its first [`PageCursor::next`].
    pub fn io(&self, page: PageId, access: PageAccess) -> Result<PageCursor<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GbpError::Closed);
        }
        if self.read_only && access.is_exclusive() {
            return Err(GbpError::ReadOnly);
        }
        Ok(PageCursor::new(self, page, access))
    }

    pub(crate) fn frame(&self, page: PageId, grow: bool) -> Result<Option<Arc<Frame>>> {
        let idx = usize::try_from(page.0).map_err(|_| GbpError::Invalid("page id overflow"))?;
        {
            let frames = self.frames.read();
            if let Some(frame) = frames.get(idx) {
                return Ok(Some(Arc::clone(frame)));
            }
        }
        if !grow {
            return Ok(None);
        }
        let mut frames = self.frames.write();
        while frames.len() <= idx {
            frames.push(Arc::new(Frame::new(self.page_size)));
        }
        Ok(Some(Arc::clone(&frames[idx])))
    }

    /// Writes every dirty page and syncs the file. Errors propagate; pages that
    /// failed to write stay dirty.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let frames: Vec<Arc<Frame>> = self.frames.read().clone();
        let mut written = 0usize;
        for (idx, frame) in frames.iter().enumerate() {
            if !frame.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }
            let offset = idx as u64 * self.page_size as u64;
            let buf = frame.buf.read();
            if let Err(err) = self.io.write_at(offset, &buf) {
                frame.dirty.store(true, Ordering::Release);
                return Err(err);
            }
            written += 1;
        }
        self.io.sync_all()?;
        debug!(written, "paged file flushed");
        Ok(())
    }

    /// Flushes and refuses further cursors.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// True once [`PagedFile::close`] succeeded.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
