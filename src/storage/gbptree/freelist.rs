//! Persistent queue of released page ids.
//!
//! Freelist pages form a singly linked chain. Ids are appended at the write
//! cursor and consumed at the read cursor; both cursors live in the tree
//! state, so entries appended after the last checkpoint vanish with a crash.
//! An id released in generation `g` is only handed out again once `g` is
//! stable, which keeps pages alive for readers that started before the
//! release.

use std::io;

use tracing::debug;

use super::state::TreeState;
use super::stats::GbpTreeStats;
use crate::primitives::pager::{PageAccess, PagedFile};
use crate::types::page::{PageType, MIN_TREE_NODE_ID};
use crate::types::{GbpError, PageId, Result};

const NEXT_OFFSET: usize = 8;
const ENTRIES_OFFSET: usize = 16;
const ENTRY_SIZE: usize = 16;

/// Freelist cursors plus the highest id handed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FreeList {
    pub(crate) last_id: PageId,
    pub(crate) write_page: PageId,
    pub(crate) write_pos: u32,
    pub(crate) read_page: PageId,
    pub(crate) read_pos: u32,
    capacity: u32,
}

/// Pages and entries currently making up the freelist.
#[derive(Clone, Debug, Default)]
pub(crate) struct FreelistContents {
    pub(crate) pages: Vec<PageId>,
    pub(crate) entries: Vec<(u64, PageId)>,
}

pub(crate) fn entries_per_page(page_size: usize) -> u32 {
    ((page_size - ENTRIES_OFFSET) / ENTRY_SIZE) as u32
}

fn entry_offset(pos: u32) -> usize {
    ENTRIES_OFFSET + pos as usize * ENTRY_SIZE
}

/// Writes an empty freelist page.
pub(crate) fn initialize_page(pages: &PagedFile, page: PageId) -> Result<()> {
    let mut cursor = pages.io(page, PageAccess::WriteGrow)?;
    if !cursor.next()? {
        return Err(GbpError::at_page(page, "freelist page unavailable"));
    }
    let page_size = cursor.page_size();
    cursor.zero(0, page_size);
    cursor.put_u8_at(0, PageType::FreeList.as_u8());
    cursor.put_u64_at(NEXT_OFFSET, PageId::NONE.0);
    Ok(())
}

impl FreeList {
    /// Cursors for a brand new tree whose only freelist page is `page`.
    pub(crate) fn empty(page: PageId, page_size: usize) -> Self {
        Self {
            last_id: page,
            write_page: page,
            write_pos: 0,
            read_page: page,
            read_pos: 0,
            capacity: entries_per_page(page_size),
        }
    }

    pub(crate) fn from_state(state: &TreeState, page_size: usize) -> Self {
        Self {
            last_id: state.last_id,
            write_page: state.freelist_write_page,
            write_pos: state.freelist_write_pos,
            read_page: state.freelist_read_page,
            read_pos: state.freelist_read_pos,
            capacity: entries_per_page(page_size),
        }
    }

    pub(crate) fn copy_into(&self, state: &mut TreeState) {
        state.last_id = self.last_id;
        state.freelist_write_page = self.write_page;
        state.freelist_write_pos = self.write_pos;
        state.freelist_read_page = self.read_page;
        state.freelist_read_pos = self.read_pos;
    }

    fn is_empty(&self) -> bool {
        self.read_page == self.write_page && self.read_pos == self.write_pos
    }

    fn grow(&mut self, stats: &GbpTreeStats) -> Result<PageId> {
        let next = self
            .last_id
            .0
            .checked_add(1)
            .filter(|id| id & (1 << 63) == 0)
            .ok_or_else(|| {
                GbpError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "page id space exhausted",
                ))
            })?;
        self.last_id = PageId(next);
        stats.inc_pages_acquired();
        Ok(self.last_id)
    }

    /// Rejects cursors pointing past the end of their page.
    fn check_cursors(&self) -> Result<()> {
        if self.write_pos > self.capacity {
            return Err(GbpError::at_page(
                self.write_page,
                format!("freelist write cursor {} past {} entries", self.write_pos, self.capacity),
            ));
        }
        if self.read_pos > self.capacity {
            return Err(GbpError::at_page(
                self.read_page,
                format!("freelist read cursor {} past {} entries", self.read_pos, self.capacity),
            ));
        }
        Ok(())
    }

    fn check_id(&self, id: PageId) -> Result<()> {
        if id < MIN_TREE_NODE_ID || id > self.last_id {
            return Err(GbpError::at_page(
                id,
                format!(
                    "freelist id outside [{MIN_TREE_NODE_ID}, {}]",
                    self.last_id
                ),
            ));
        }
        Ok(())
    }

    /// Queues `id` for reuse once `unstable` has become stable.
    pub(crate) fn release(
        &mut self,
        pages: &PagedFile,
        unstable: u64,
        id: PageId,
        stats: &GbpTreeStats,
    ) -> Result<()> {
        self.check_id(id)?;
        self.check_cursors()?;
        if self.write_pos >= self.capacity {
            let page = self.grow(stats)?;
            initialize_page(pages, page)?;
            let mut cursor = pages.io(self.write_page, PageAccess::Write)?;
            if !cursor.next()? {
                return Err(GbpError::at_page(self.write_page, "freelist page unavailable"));
            }
            cursor.put_u64_at(NEXT_OFFSET, page.0);
            if cursor.check_and_clear_bounds() {
                return Err(GbpError::at_page(self.write_page, "freelist link out of bounds"));
            }
            debug!(page = page.0, "freelist grew a page");
            self.write_page = page;
            self.write_pos = 0;
        }
        let mut cursor = pages.io(self.write_page, PageAccess::Write)?;
        if !cursor.next()? {
            return Err(GbpError::at_page(self.write_page, "freelist page unavailable"));
        }
        let offset = entry_offset(self.write_pos);
        cursor.put_u64_at(offset, unstable);
        cursor.put_u64_at(offset + 8, id.0);
        if cursor.check_and_clear_bounds() {
            return Err(GbpError::at_page(self.write_page, "freelist entry out of bounds"));
        }
        self.write_pos += 1;
        stats.inc_pages_released();
        Ok(())
    }

    /// Hands out a released id whose release generation is stable, or a new
    /// id past `last_id`.
    pub(crate) fn acquire(
        &mut self,
        pages: &PagedFile,
        stable: u64,
        unstable: u64,
        stats: &GbpTreeStats,
    ) -> Result<PageId> {
        self.check_cursors()?;
        loop {
            if self.is_empty() {
                return self.grow(stats);
            }
            if self.read_pos >= self.capacity {
                let old = self.read_page;
                self.read_page = self.next_page(pages, old)?;
                self.read_pos = 0;
                self.release(pages, unstable, old, stats)?;
                continue;
            }
            let mut cursor = pages.io(self.read_page, PageAccess::Read)?;
            if !cursor.next()? {
                return Err(GbpError::at_page(self.read_page, "freelist page unavailable"));
            }
            let offset = entry_offset(self.read_pos);
            let generation = cursor.get_u64_at(offset);
            let id = PageId(cursor.get_u64_at(offset + 8));
            if cursor.check_and_clear_bounds() {
                return Err(GbpError::at_page(self.read_page, "freelist entry out of bounds"));
            }
            drop(cursor);
            if generation > stable {
                return self.grow(stats);
            }
            self.check_id(id)?;
            self.read_pos += 1;
            stats.inc_pages_acquired();
            stats.inc_pages_reused();
            return Ok(id);
        }
    }

    fn next_page(&self, pages: &PagedFile, page: PageId) -> Result<PageId> {
        let mut cursor = pages.io(page, PageAccess::Read)?;
        if !cursor.next()? {
            return Err(GbpError::at_page(page, "freelist page unavailable"));
        }
        if cursor.get_u8_at(0) != PageType::FreeList.as_u8() {
            return Err(GbpError::at_page(page, "expected a freelist page"));
        }
        let next = PageId(cursor.get_u64_at(NEXT_OFFSET));
        if !next.is_some() || next > self.last_id {
            return Err(GbpError::at_page(page, format!("bad freelist link to {next}")));
        }
        Ok(next)
    }

    /// Walks the chain from the read cursor to the write cursor.
    pub(crate) fn contents(&self, pages: &PagedFile) -> Result<FreelistContents> {
        let mut contents = FreelistContents::default();
        let mut page = self.read_page;
        let mut pos = self.read_pos;
        loop {
            if contents.pages.len() as u64 > self.last_id.0 {
                return Err(GbpError::Corruption("freelist chain has a cycle"));
            }
            contents.pages.push(page);
            let end = if page == self.write_page {
                self.write_pos
            } else {
                self.capacity
            };
            let mut cursor = pages.io(page, PageAccess::Read)?;
            if !cursor.next()? {
                return Err(GbpError::at_page(page, "freelist page unavailable"));
            }
            while pos < end.min(self.capacity) {
                let offset = entry_offset(pos);
                let generation = cursor.get_u64_at(offset);
                let id = PageId(cursor.get_u64_at(offset + 8));
                contents.entries.push((generation, id));
                pos += 1;
            }
            drop(cursor);
            if page == self.write_page {
                return Ok(contents);
            }
            page = self.next_page(pages, page)?;
            pos = 0;
        }
    }

    /// Moves the write cursor back one entry; used by corruption tooling.
    pub(crate) fn decrement_write_pos(&mut self) {
        self.write_pos = self.write_pos.saturating_sub(1);
    }
}
