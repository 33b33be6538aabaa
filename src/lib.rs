//! Generation-safe, crash-recoverable B+Tree over a paged file.
//!
//! See [`storage::gbptree`] for the tree itself and
//! [`primitives::pager`] for the page cache it runs on.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::gbptree::{
    BytesLayout, CleanupMode, GbpTree, GbpTreeOptions, Layout, MergeOutcome, MultiRootGbpTree,
    U64Layout, ValueMerger,
};
pub use types::{ErrorKind, GbpError, PageId, Result};
