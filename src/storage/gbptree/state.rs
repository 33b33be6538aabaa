//! The two redundant tree state pages.
//!
//! Each checkpoint writes the page that was not written last, so one valid
//! record always survives a torn write. See the table in the crate docs of
//! [`super`] for the byte layout.

use serde::Serialize;

use crate::primitives::pager::{PageAccess, PagedFile};
use crate::types::checksum::state_checksum;
use crate::types::page::{PageType, FORMAT_VERSION, STATE_MAGIC, STATE_PAGE_A, STATE_PAGE_B};
use crate::types::{GbpError, PageId, Result};

const FORMAT_OFFSET: usize = 2;
const MAGIC_OFFSET: usize = 4;
const PAGE_SIZE_OFFSET: usize = 8;
const LAYOUT_OFFSET: usize = 12;
const STABLE_OFFSET: usize = 20;
const UNSTABLE_OFFSET: usize = 28;
const ROOT_ID_OFFSET: usize = 36;
const ROOT_GENERATION_OFFSET: usize = 44;
const LAST_ID_OFFSET: usize = 52;
const FREELIST_WRITE_PAGE_OFFSET: usize = 60;
const FREELIST_READ_PAGE_OFFSET: usize = 68;
const FREELIST_WRITE_POS_OFFSET: usize = 76;
const FREELIST_READ_POS_OFFSET: usize = 80;
const CLEAN_OFFSET: usize = 84;
const HEADER_LEN_OFFSET: usize = 85;
const CHECKSUM_OFFSET: usize = 87;
const RECORD_SIZE: usize = 91;

/// Root, generations and freelist cursors of a tree, as persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreeState {
    /// Page size the file was created with.
    pub page_size: u32,
    /// Identifier of the layout the file was created with.
    pub layout_id: u64,
    /// Last checkpointed generation.
    pub stable_generation: u64,
    /// Generation currently being written.
    pub unstable_generation: u64,
    /// Root node.
    pub root_id: PageId,
    /// Generation the root pointer was set in.
    pub root_generation: u64,
    /// Highest page id ever handed out.
    pub last_id: PageId,
    /// Freelist page receiving released ids.
    pub freelist_write_page: PageId,
    /// Freelist page ids are acquired from.
    pub freelist_read_page: PageId,
    /// Next entry slot on the write page.
    pub freelist_write_pos: u32,
    /// Next entry slot on the read page.
    pub freelist_read_pos: u32,
    /// True only when the tree was closed cleanly.
    pub clean: bool,
}

/// A decoded state page together with its raw bytes.
#[derive(Clone, Debug)]
pub(crate) struct StateRecord {
    pub(crate) state: TreeState,
    pub(crate) header: Vec<u8>,
    raw: Vec<u8>,
}

/// Largest caller header that fits next to the state record.
pub(crate) fn max_header_len(page_size: usize) -> usize {
    (page_size - RECORD_SIZE).min(u16::MAX as usize)
}

fn encode(state: &TreeState, header: &[u8], page_size: usize) -> Result<Vec<u8>> {
    if header.len() > max_header_len(page_size) {
        return Err(GbpError::Invalid("tree state header does not fit in a page"));
    }
    let mut page = vec![0u8; page_size];
    page[0] = PageType::TreeState.as_u8();
    page[FORMAT_OFFSET..FORMAT_OFFSET + 2].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    page[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&STATE_MAGIC);
    let put_u32 = |page: &mut [u8], off: usize, v: u32| {
        page[off..off + 4].copy_from_slice(&v.to_be_bytes())
    };
    let put_u64 = |page: &mut [u8], off: usize, v: u64| {
        page[off..off + 8].copy_from_slice(&v.to_be_bytes())
    };
    put_u32(&mut page, PAGE_SIZE_OFFSET, state.page_size);
    put_u64(&mut page, LAYOUT_OFFSET, state.layout_id);
    put_u64(&mut page, STABLE_OFFSET, state.stable_generation);
    put_u64(&mut page, UNSTABLE_OFFSET, state.unstable_generation);
    put_u64(&mut page, ROOT_ID_OFFSET, state.root_id.0);
    put_u64(&mut page, ROOT_GENERATION_OFFSET, state.root_generation);
    put_u64(&mut page, LAST_ID_OFFSET, state.last_id.0);
    put_u64(&mut page, FREELIST_WRITE_PAGE_OFFSET, state.freelist_write_page.0);
    put_u64(&mut page, FREELIST_READ_PAGE_OFFSET, state.freelist_read_page.0);
    put_u32(&mut page, FREELIST_WRITE_POS_OFFSET, state.freelist_write_pos);
    put_u32(&mut page, FREELIST_READ_POS_OFFSET, state.freelist_read_pos);
    page[CLEAN_OFFSET] = u8::from(state.clean);
    page[HEADER_LEN_OFFSET..HEADER_LEN_OFFSET + 2]
        .copy_from_slice(&(header.len() as u16).to_be_bytes());
    page[RECORD_SIZE..RECORD_SIZE + header.len()].copy_from_slice(header);
    let crc = state_checksum(&page[..CHECKSUM_OFFSET], header);
    put_u32(&mut page, CHECKSUM_OFFSET, crc);
    Ok(page)
}

fn decode(page: &[u8]) -> Option<StateRecord> {
    let u32_at = |off: usize| -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&page[off..off + 4]);
        u32::from_be_bytes(b)
    };
    let u64_at = |off: usize| -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&page[off..off + 8]);
        u64::from_be_bytes(b)
    };
    if page.len() < RECORD_SIZE || page[0] != PageType::TreeState.as_u8() {
        return None;
    }
    if page[MAGIC_OFFSET..MAGIC_OFFSET + 4] != STATE_MAGIC
        || page[FORMAT_OFFSET..FORMAT_OFFSET + 2] != FORMAT_VERSION.to_be_bytes()
    {
        return None;
    }
    let header_len =
        u16::from_be_bytes([page[HEADER_LEN_OFFSET], page[HEADER_LEN_OFFSET + 1]]) as usize;
    if RECORD_SIZE + header_len > page.len() {
        return None;
    }
    let header = &page[RECORD_SIZE..RECORD_SIZE + header_len];
    if state_checksum(&page[..CHECKSUM_OFFSET], header) != u32_at(CHECKSUM_OFFSET) {
        return None;
    }
    let state = TreeState {
        page_size: u32_at(PAGE_SIZE_OFFSET),
        layout_id: u64_at(LAYOUT_OFFSET),
        stable_generation: u64_at(STABLE_OFFSET),
        unstable_generation: u64_at(UNSTABLE_OFFSET),
        root_id: PageId(u64_at(ROOT_ID_OFFSET)),
        root_generation: u64_at(ROOT_GENERATION_OFFSET),
        last_id: PageId(u64_at(LAST_ID_OFFSET)),
        freelist_write_page: PageId(u64_at(FREELIST_WRITE_PAGE_OFFSET)),
        freelist_read_page: PageId(u64_at(FREELIST_READ_PAGE_OFFSET)),
        freelist_write_pos: u32_at(FREELIST_WRITE_POS_OFFSET),
        freelist_read_pos: u32_at(FREELIST_READ_POS_OFFSET),
        clean: page[CLEAN_OFFSET] != 0,
    };
    if state.stable_generation >= state.unstable_generation {
        return None;
    }
    Some(StateRecord {
        state,
        header: header.to_vec(),
        raw: page[..RECORD_SIZE + header_len].to_vec(),
    })
}

/// Page size recorded on page 0, if page 0 carries the state magic.
pub(crate) fn recorded_page_size(pages: &PagedFile) -> Result<Option<u32>> {
    let page = read_raw(pages, STATE_PAGE_A)?;
    match page {
        Some(page) if page[MAGIC_OFFSET..MAGIC_OFFSET + 4] == STATE_MAGIC => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&page[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4]);
            Ok(Some(u32::from_be_bytes(b)))
        }
        _ => Ok(None),
    }
}

fn read_raw(pages: &PagedFile, page: PageId) -> Result<Option<Vec<u8>>> {
    let mut cursor = pages.io(page, PageAccess::Read)?;
    if !cursor.next()? {
        return Ok(None);
    }
    loop {
        let bytes = cursor.read_page();
        if !cursor.should_retry() {
            return Ok(Some(bytes));
        }
    }
}

/// Decodes one state page; `None` when it is missing or invalid.
pub(crate) fn read(pages: &PagedFile, page: PageId) -> Result<Option<StateRecord>> {
    Ok(read_raw(pages, page)?.and_then(|raw| decode(&raw)))
}

/// Picks the newest valid record of the two state pages and the page it came from.
pub(crate) fn select_newest(pages: &PagedFile) -> Result<(StateRecord, PageId)> {
    let a = read(pages, STATE_PAGE_A)?;
    let b = read(pages, STATE_PAGE_B)?;
    match (a, b) {
        (None, None) => Err(GbpError::Corruption("no valid tree state page")),
        (Some(a), None) => Ok((a, STATE_PAGE_A)),
        (None, Some(b)) => Ok((b, STATE_PAGE_B)),
        (Some(a), Some(b)) => {
            if a.raw == b.raw {
                return Err(GbpError::Corruption("tree state pages are bit-identical"));
            }
            let (ua, ub) = (a.state.unstable_generation, b.state.unstable_generation);
            if ua == ub {
                return Err(GbpError::Corruption(
                    "tree state pages share an unstable generation",
                ));
            }
            if ua > ub {
                Ok((a, STATE_PAGE_A))
            } else {
                Ok((b, STATE_PAGE_B))
            }
        }
    }
}

/// The state page a write following one to `page` must target.
pub(crate) fn other(page: PageId) -> PageId {
    if page == STATE_PAGE_A {
        STATE_PAGE_B
    } else {
        STATE_PAGE_A
    }
}

/// Writes `state` and `header` to `page`. Not durable until the file is flushed.
pub(crate) fn write(
    pages: &PagedFile,
    page: PageId,
    state: &TreeState,
    header: &[u8],
) -> Result<()> {
    let bytes = encode(state, header, pages.page_size())?;
    let mut cursor = pages.io(page, PageAccess::WriteGrow)?;
    if !cursor.next()? {
        return Err(GbpError::at_page(page, "tree state page unavailable"));
    }
    cursor.write_page(&bytes);
    Ok(())
}
