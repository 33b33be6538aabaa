use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{ArcRwLockWriteGuard, RawRwLock};

use super::frame::Frame;
use super::paged_file::PagedFile;
use crate::types::{PageId, Result};

/// How a cursor pins its pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageAccess {
    /// Optimistic shared reads; callers must loop on [`PageCursor::should_retry`].
    Read,
    /// Exclusive access to existing pages.
    Write,
    /// Exclusive access, growing the file when the page lies past its end.
    WriteGrow,
}

impl PageAccess {
    /// True for the exclusive modes.
    pub fn is_exclusive(self) -> bool {
        !matches!(self, PageAccess::Read)
    }
}

enum Pin {
    Unpinned,
    Shared {
        frame: Arc<Frame>,
        version: u64,
    },
    Exclusive {
        frame: Arc<Frame>,
        guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
        wrote: bool,
    },
}

/// Positioned accessor over one page at a time.
///
/// Shared cursors never block writers for longer than a single access: each
/// read takes the frame lock briefly and the whole sequence is validated by
/// [`PageCursor::should_retry`]. Exclusive cursors hold the frame lock until
/// they move on or drop, and publish a new version when they wrote.
///
/// Out-of-bounds accesses never panic. Reads return zeroes, writes are
/// discarded, and a flag is raised for [`PageCursor::check_and_clear_bounds`].
pub struct PageCursor<'f> {
    file: &'f PagedFile,
    access: PageAccess,
    pending: Option<PageId>,
    current: PageId,
    pin: Pin,
    offset: usize,
    out_of_bounds: bool,
}

macro_rules! int_accessors {
    ($($ty:ty => $get:ident, $get_at:ident, $put:ident, $put_at:ident;)*) => {
        $(
            /// Reads a big-endian integer at an absolute offset.
            pub fn $get_at(&mut self, off: usize) -> $ty {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                self.read_into(off, &mut bytes);
                <$ty>::from_be_bytes(bytes)
            }

            /// Reads a big-endian integer at the current offset and advances.
            pub fn $get(&mut self) -> $ty {
                let off = self.offset;
                self.offset = off.saturating_add(std::mem::size_of::<$ty>());
                self.$get_at(off)
            }

            /// Writes a big-endian integer at an absolute offset.
            pub fn $put_at(&mut self, off: usize, value: $ty) {
                self.write_from(off, &value.to_be_bytes());
            }

            /// Writes a big-endian integer at the current offset and advances.
            pub fn $put(&mut self, value: $ty) {
                let off = self.offset;
                self.offset = off.saturating_add(std::mem::size_of::<$ty>());
                self.$put_at(off, value);
            }
        )*
    };
}

impl<'f> PageCursor<'f> {
    pub(crate) fn new(file: &'f PagedFile, page: PageId, access: PageAccess) -> Self {
        Self {
            file,
            access,
            pending: Some(page),
            current: page,
            pin: Pin::Unpinned,
            offset: 0,
            out_of_bounds: false,
        }
    }

    /// Pins the page the cursor was opened on, or the page after the current
    /// one. Returns `false` when that page does not exist and cannot be grown.
    pub fn next(&mut self) -> Result<bool> {
        let page = match self.pending.take() {
            Some(page) => page,
            None => PageId(self.current.0.saturating_add(1)),
        };
        self.next_page(page)
    }

    /// Pins `page`, releasing whatever page was pinned before.
    pub fn next_page(&mut self, page: PageId) -> Result<bool> {
        self.unpin();
        self.pending = None;
        let grow = self.access == PageAccess::WriteGrow;
        let Some(frame) = self.file.frame(page, grow)? else {
            return Ok(false);
        };
        self.current = page;
        self.offset = 0;
        self.out_of_bounds = false;
        self.pin = match self.access {
            PageAccess::Read => {
                let version = frame.version.load(Ordering::Acquire);
                Pin::Shared { frame, version }
            }
            PageAccess::Write | PageAccess::WriteGrow => {
                let guard = frame.buf.write_arc();
                Pin::Exclusive {
                    frame,
                    guard,
                    wrote: false,
                }
            }
        };
        Ok(true)
    }

    /// Releases the pinned page, publishing writes if any were made.
    pub fn unpin(&mut self) {
        if let Pin::Exclusive {
            frame,
            guard,
            wrote,
        } = std::mem::replace(&mut self.pin, Pin::Unpinned)
        {
            if wrote {
                frame.dirty.store(true, Ordering::Release);
                frame.version.fetch_add(1, Ordering::AcqRel);
            }
            drop(guard);
        }
    }

    /// Page currently (or most recently) pinned.
    pub fn current_page(&self) -> PageId {
        self.current
    }

    /// True while a page is pinned.
    pub fn is_pinned(&self) -> bool {
        !matches!(self.pin, Pin::Unpinned)
    }

    /// True for cursors that hold their page exclusively.
    pub fn is_exclusive(&self) -> bool {
        self.access.is_exclusive()
    }

    /// Page size of the underlying file.
    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    /// Current relative offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Moves the relative offset.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// True if the page changed since it was pinned or last validated. A shared
    /// cursor re-arms itself and rewinds to offset zero, so the caller can
    /// simply redo its reads.
    pub fn should_retry(&mut self) -> bool {
        match &mut self.pin {
            Pin::Shared { frame, version } => {
                let now = frame.version.load(Ordering::Acquire);
                if now == *version {
                    return false;
                }
                *version = now;
                self.offset = 0;
                self.out_of_bounds = false;
                true
            }
            _ => false,
        }
    }

    /// Returns and clears the out-of-bounds flag.
    pub fn check_and_clear_bounds(&mut self) -> bool {
        std::mem::take(&mut self.out_of_bounds)
    }

    int_accessors! {
        u8 => get_u8, get_u8_at, put_u8, put_u8_at;
        u16 => get_u16, get_u16_at, put_u16, put_u16_at;
        u32 => get_u32, get_u32_at, put_u32, put_u32_at;
        u64 => get_u64, get_u64_at, put_u64, put_u64_at;
    }

    /// Fills `dst` from an absolute offset.
    pub fn get_bytes_at(&mut self, off: usize, dst: &mut [u8]) {
        self.read_into(off, dst);
    }

    /// Fills `dst` from the current offset and advances.
    pub fn get_bytes(&mut self, dst: &mut [u8]) {
        let off = self.offset;
        self.offset = off.saturating_add(dst.len());
        self.read_into(off, dst);
    }

    /// Copies `src` to an absolute offset.
    pub fn put_bytes_at(&mut self, off: usize, src: &[u8]) {
        self.write_from(off, src);
    }

    /// Copies `src` to the current offset and advances.
    pub fn put_bytes(&mut self, src: &[u8]) {
        let off = self.offset;
        self.offset = off.saturating_add(src.len());
        self.write_from(off, src);
    }

    /// Moves `len` bytes inside the page; ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        let page_size = self.page_size();
        let fits = |start: usize| start.checked_add(len).is_some_and(|end| end <= page_size);
        if !fits(src) || !fits(dst) {
            self.out_of_bounds = true;
            return;
        }
        match &mut self.pin {
            Pin::Exclusive { guard, wrote, .. } => {
                guard.copy_within(src..src + len, dst);
                *wrote = true;
            }
            _ => self.reject_write(),
        }
    }

    /// Zeroes `len` bytes starting at `off`.
    pub fn zero(&mut self, off: usize, len: usize) {
        let Some(end) = self.checked_end(off, len) else {
            return;
        };
        match &mut self.pin {
            Pin::Exclusive { guard, wrote, .. } => {
                guard[off..end].fill(0);
                *wrote = true;
            }
            _ => self.reject_write(),
        }
    }

    /// Copies the whole pinned page out.
    pub fn read_page(&mut self) -> Vec<u8> {
        let mut page = vec![0u8; self.page_size()];
        self.read_into(0, &mut page);
        page
    }

    /// Overwrites the whole pinned page.
    pub fn write_page(&mut self, page: &[u8]) {
        if page.len() != self.page_size() {
            self.out_of_bounds = true;
            return;
        }
        self.write_from(0, page);
    }

    fn checked_end(&mut self, off: usize, len: usize) -> Option<usize> {
        match off.checked_add(len) {
            Some(end) if end <= self.page_size() => Some(end),
            _ => {
                self.out_of_bounds = true;
                None
            }
        }
    }

    fn read_into(&mut self, off: usize, dst: &mut [u8]) {
        let Some(end) = self.checked_end(off, dst.len()) else {
            dst.fill(0);
            return;
        };
        match &self.pin {
            Pin::Unpinned => {
                self.out_of_bounds = true;
                dst.fill(0);
            }
            Pin::Shared { frame, .. } => dst.copy_from_slice(&frame.buf.read()[off..end]),
            Pin::Exclusive { guard, .. } => dst.copy_from_slice(&guard[off..end]),
        }
    }

    fn write_from(&mut self, off: usize, src: &[u8]) {
        let Some(end) = self.checked_end(off, src.len()) else {
            return;
        };
        match &mut self.pin {
            Pin::Exclusive { guard, wrote, .. } => {
                guard[off..end].copy_from_slice(src);
                *wrote = true;
            }
            _ => self.reject_write(),
        }
    }

    fn reject_write(&mut self) {
        debug_assert!(false, "write through a cursor without an exclusive pin");
        self.out_of_bounds = true;
    }
}

impl Drop for PageCursor<'_> {
    fn drop(&mut self) {
        self.unpin();
    }
}
