//! Low-level primitives the tree is built on.
//!
//! Positioned file I/O and the page cache with its cursors.

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Page cache and cursors.
///
/// Maps a file into page frames and hands out shared or exclusive cursors.
pub mod pager;
