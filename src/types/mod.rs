//! Shared identifiers, error types, and on-disk page constants.

use std::fmt;

use thiserror::Error;

/// Checksum helpers for tree state records and pointer slots.
pub mod checksum;

/// Identifier of a fixed-size page inside a tree file.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel meaning "no node"; page 0 always holds tree state, never a node.
    pub const NONE: PageId = PageId(0);

    /// Returns true when this id refers to an actual page rather than the sentinel.
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Byte offset of this page in a file with the given page size.
    pub fn byte_offset(self, page_size: usize) -> Option<u64> {
        self.0.checked_mul(page_size as u64)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

/// Errors surfaced by the tree and its page cache.
#[derive(Debug, Error)]
pub enum GbpError {
    /// Underlying file I/O failed, including out-of-space and page-id exhaustion.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Structural corruption without a more specific location.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Structural corruption located at a specific page.
    #[error("corruption at page {page}: {detail}")]
    PageCorruption {
        /// Page where the corruption was observed.
        page: PageId,
        /// Expected-versus-found description.
        detail: String,
    },
    /// The caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Options could not be parsed or validated.
    #[error("configuration: {0}")]
    Config(String),
    /// The file was written with a different page size or layout.
    #[error("metadata mismatch: {0}")]
    MetadataMismatch(String),
    /// A key/value pair does not fit the node layout.
    #[error("entry of {size} bytes exceeds the {limit} byte limit")]
    EntryTooLarge {
        /// Encoded size of the rejected entry.
        size: usize,
        /// Largest encoded size the layout accepts.
        limit: usize,
    },
    /// Crash recovery is still running; the operation may be retried later.
    #[error("tree is recovering from an unclean shutdown; retry later")]
    Recovering,
    /// The file was not closed cleanly and this handle cannot recover it.
    #[error("tree requires crash recovery before it can be modified")]
    NeedsRecovery,
    /// Crash recovery failed; the file must be rebuilt.
    #[error("tree is unrecoverable: {0}")]
    Unrecoverable(String),
    /// A usage or programming invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    /// Mutation attempted through a read-only handle.
    #[error("tree is opened read-only")]
    ReadOnly,
    /// Operation attempted on a closed tree.
    #[error("tree is closed")]
    Closed,
    /// The requested item does not exist.
    #[error("not found")]
    NotFound,
    /// A root with the same key is already registered.
    #[error("root already exists")]
    RootExists,
}

/// Coarse classification that tells callers how to react to a [`GbpError`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Try the operation again later.
    Retryable,
    /// The tree must be recovered (reopened writable) first.
    RequiresRecovery,
    /// The tree cannot be repaired in place.
    Unrecoverable,
    /// The file is structurally corrupt.
    Corruption,
    /// The caller misused the API.
    Caller,
    /// Storage failed underneath the tree.
    Io,
}

impl GbpError {
    /// Classifies the error for retry and escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GbpError::Io(_) => ErrorKind::Io,
            GbpError::Corruption(_) | GbpError::PageCorruption { .. } => ErrorKind::Corruption,
            GbpError::Recovering => ErrorKind::Retryable,
            GbpError::NeedsRecovery => ErrorKind::RequiresRecovery,
            GbpError::Unrecoverable(_) | GbpError::Invariant(_) => ErrorKind::Unrecoverable,
            GbpError::Invalid(_)
            | GbpError::Config(_)
            | GbpError::MetadataMismatch(_)
            | GbpError::EntryTooLarge { .. }
            | GbpError::ReadOnly
            | GbpError::Closed
            | GbpError::NotFound
            | GbpError::RootExists => ErrorKind::Caller,
        }
    }

    pub(crate) fn at_page(page: PageId, detail: impl Into<String>) -> Self {
        GbpError::PageCorruption {
            page,
            detail: detail.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GbpError>;

pub mod page {
    //! Page-level constants shared by every page kind.

    use core::convert::TryFrom;

    use super::{GbpError, PageId, Result};

    /// Magic bytes stored in each tree state page.
    pub const STATE_MAGIC: [u8; 4] = *b"GBPT";
    /// Version of the on-disk format.
    pub const FORMAT_VERSION: u16 = 1;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 256;
    /// Largest supported page size; dynamic nodes address bytes with u16 offsets.
    pub const MAX_PAGE_SIZE: u32 = 32768;

    /// First of the two redundant tree state pages.
    pub const STATE_PAGE_A: PageId = PageId(0);
    /// Second of the two redundant tree state pages.
    pub const STATE_PAGE_B: PageId = PageId(1);
    /// Lowest id a tree node or freelist page may occupy.
    pub const MIN_TREE_NODE_ID: PageId = PageId(2);
    /// Root leaf of a freshly created tree.
    pub const INITIAL_ROOT_ID: PageId = PageId(2);
    /// Freelist page of a freshly created tree.
    pub const INITIAL_FREELIST_ID: PageId = PageId(3);

    /// Offset of the page type byte, common to all page kinds.
    pub const PAGE_TYPE_OFFSET: usize = 0;

    /// Kind of content stored in a page, encoded in its first byte.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
    pub enum PageType {
        /// Leaf or internal tree node.
        TreeNode = 1,
        /// Freelist page holding released ids.
        FreeList = 2,
        /// Redundant tree state record.
        TreeState = 3,
    }

    impl PageType {
        /// Returns the on-disk byte.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageType {
        type Error = GbpError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageType::TreeNode),
                2 => Ok(PageType::FreeList),
                3 => Ok(PageType::TreeState),
                _ => Err(GbpError::Corruption("unknown page type")),
            }
        }
    }
}
