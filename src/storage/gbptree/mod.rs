//! Generation-safe, crash-recoverable B+Tree.
//!
//! A tree file is a sequence of fixed-size pages. Nothing written after the
//! last checkpoint is trusted after a crash: every pointer between pages is a
//! generation-safe pointer pair ([`gspp`]), and a node that belongs to a
//! checkpointed generation is never modified in place. Writers copy it, link
//! the old node to its successor and move on; readers that land on the old
//! node follow the successor or restart.
//!
//! Pages 0 and 1 hold the tree state, written alternately by checkpoints.
//! Each starts with a fixed record followed by the caller's header bytes
//! (big-endian):
//!
//! | bytes   | field                                   |
//! |---------|-----------------------------------------|
//! | 0       | page type (tree state)                  |
//! | 2..4    | format version                          |
//! | 4..8    | magic `GBPT`                            |
//! | 8..12   | page size                               |
//! | 12..20  | layout identifier                       |
//! | 20..28  | stable generation                       |
//! | 28..36  | unstable generation                     |
//! | 36..44  | root id                                 |
//! | 44..52  | root generation                         |
//! | 52..60  | last allocated id                       |
//! | 60..68  | freelist write page                     |
//! | 68..76  | freelist read page                      |
//! | 76..80  | freelist write position                 |
//! | 80..84  | freelist read position                  |
//! | 84      | clean flag                              |
//! | 85..87  | header length                           |
//! | 87..91  | CRC32 over bytes 0..87 and the header   |
//! | 91..    | header                                  |
//!
//! Freelist pages carry the id of the next freelist page at byte 8 and
//! 16-byte entries (release generation, page id) from byte 16 on. Tree node
//! pages start with a 136-byte header holding the node kind, schema tag,
//! generation and key count, followed by the right sibling, left sibling and
//! successor pointer pairs.

mod checker;
mod freelist;
pub mod gspp;
mod inspect;
mod layout;
mod merge;
mod multi_root;
mod node;
mod options;
mod state;
mod stats;
mod tree;

pub use checker::{ConsistencyReport, ConsistencyVisitor, Violation, ViolationKind};
pub use gspp::{GsppFailure, GsppFailureKind, Pointer, SlotState};
pub use inspect::{FreelistEntry, NodeSummary, TreeInspection, TreeShape};
pub use layout::{BytesLayout, Layout, U64Layout};
pub use merge::{KeepExisting, MergeOutcome, Overwrite, ValueMerger};
pub use multi_root::{MultiRootGbpTree, RegistryLayout, RootEntry, RootHandle};
pub use node::corruption::{Corruption, PageCorruption};
pub use node::{NodeKind, PointerType};
pub use options::{CleanupMode, GbpTreeOptions};
pub use state::TreeState;
pub use stats::{GbpTreeStats, GbpTreeStatsSnapshot};
pub use tree::{
    BackgroundCleanup, CleanupJob, CleanupWorkCollector, DeferredCleanup, GbpTree,
    ImmediateCleanup, Seek, TreeWriter,
};

#[cfg(test)]
mod tests;
