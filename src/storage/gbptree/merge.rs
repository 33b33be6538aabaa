//! Combining a written value with the one already stored under its key.

use super::layout::Layout;

/// What a [`ValueMerger`] decided for an existing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome<V> {
    /// Keep the stored value.
    Unchanged,
    /// Store this value instead.
    Replace(V),
    /// Remove the entry.
    Remove,
}

/// Decides what happens when a merge finds the key already present.
///
/// Closures taking `(&key, &existing, &new)` implement this trait.
pub trait ValueMerger<L: Layout> {
    /// Outcome for `key`, currently mapped to `existing`, merged with `new`.
    fn merge(&self, key: &L::Key, existing: &L::Value, new: &L::Value) -> MergeOutcome<L::Value>;
}

impl<L, F> ValueMerger<L> for F
where
    L: Layout,
    F: Fn(&L::Key, &L::Value, &L::Value) -> MergeOutcome<L::Value>,
{
    fn merge(&self, key: &L::Key, existing: &L::Value, new: &L::Value) -> MergeOutcome<L::Value> {
        self(key, existing, new)
    }
}

/// Replaces the stored value with the new one.
#[derive(Copy, Clone, Debug, Default)]
pub struct Overwrite;

impl<L: Layout> ValueMerger<L> for Overwrite {
    fn merge(&self, _key: &L::Key, _existing: &L::Value, new: &L::Value) -> MergeOutcome<L::Value> {
        MergeOutcome::Replace(new.clone())
    }
}

/// Leaves the stored value in place.
#[derive(Copy, Clone, Debug, Default)]
pub struct KeepExisting;

impl<L: Layout> ValueMerger<L> for KeepExisting {
    fn merge(&self, _key: &L::Key, _existing: &L::Value, _new: &L::Value) -> MergeOutcome<L::Value> {
        MergeOutcome::Unchanged
    }
}
