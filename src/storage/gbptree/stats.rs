use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct GbpTreeStatsSnapshot {
    /// Number of seeks started (point lookups included)
    pub seeks: u64,
    /// Number of times a seeker restarted from the root
    pub seek_restarts: u64,
    /// Number of node reads repeated because a writer changed the page
    pub optimistic_rereads: u64,
    /// Number of leaf splits performed
    pub leaf_splits: u64,
    /// Number of internal node splits performed
    pub internal_splits: u64,
    /// Number of sibling merges performed
    pub merges: u64,
    /// Number of redistributions between siblings
    pub rebalances: u64,
    /// Number of stable nodes copied into a new unstable version
    pub successors_created: u64,
    /// Number of times the tree grew a level
    pub root_splits: u64,
    /// Number of times the tree lost a level
    pub root_collapses: u64,
    /// Number of page ids handed out
    pub pages_acquired: u64,
    /// Number of acquired ids that came from the freelist
    pub pages_reused: u64,
    /// Number of page ids released
    pub pages_released: u64,
    /// Number of completed checkpoints
    pub checkpoints: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct GbpTreeStats {
    seeks: AtomicU64,
    seek_restarts: AtomicU64,
    optimistic_rereads: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    merges: AtomicU64,
    rebalances: AtomicU64,
    successors_created: AtomicU64,
    root_splits: AtomicU64,
    root_collapses: AtomicU64,
    pages_acquired: AtomicU64,
    pages_reused: AtomicU64,
    pages_released: AtomicU64,
    checkpoints: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident;)*) => {
        $(
            pub(crate) fn $inc(&self) {
                self.$field.fetch_add(1, AtomicOrdering::Relaxed);
            }
        )*
    };
}

impl GbpTreeStats {
    counters! {
        seeks => inc_seeks;
        seek_restarts => inc_seek_restarts;
        optimistic_rereads => inc_optimistic_rereads;
        leaf_splits => inc_leaf_splits;
        internal_splits => inc_internal_splits;
        merges => inc_merges;
        rebalances => inc_rebalances;
        successors_created => inc_successors_created;
        root_splits => inc_root_splits;
        root_collapses => inc_root_collapses;
        pages_acquired => inc_pages_acquired;
        pages_reused => inc_pages_reused;
        pages_released => inc_pages_released;
        checkpoints => inc_checkpoints;
    }

    /// Returns the number of seeker restarts so far.
    pub fn seek_restarts(&self) -> u64 {
        self.seek_restarts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of stable nodes copied on write so far.
    pub fn successors_created(&self) -> u64 {
        self.successors_created.load(AtomicOrdering::Relaxed)
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> GbpTreeStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        GbpTreeStatsSnapshot {
            seeks: load(&self.seeks),
            seek_restarts: load(&self.seek_restarts),
            optimistic_rereads: load(&self.optimistic_rereads),
            leaf_splits: load(&self.leaf_splits),
            internal_splits: load(&self.internal_splits),
            merges: load(&self.merges),
            rebalances: load(&self.rebalances),
            successors_created: load(&self.successors_created),
            root_splits: load(&self.root_splits),
            root_collapses: load(&self.root_collapses),
            pages_acquired: load(&self.pages_acquired),
            pages_reused: load(&self.pages_reused),
            pages_released: load(&self.pages_released),
            checkpoints: load(&self.checkpoints),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "gbptree::stats",
            seeks = snapshot.seeks,
            seek_restarts = snapshot.seek_restarts,
            optimistic_rereads = snapshot.optimistic_rereads,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            merges = snapshot.merges,
            rebalances = snapshot.rebalances,
            successors_created = snapshot.successors_created,
            root_splits = snapshot.root_splits,
            root_collapses = snapshot.root_collapses,
            pages_acquired = snapshot.pages_acquired,
            pages_reused = snapshot.pages_reused,
            pages_released = snapshot.pages_released,
            checkpoints = snapshot.checkpoints,
            "gbptree stats snapshot"
        );
    }
}
