use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use super::{
    BytesLayout, CleanupWorkCollector, Corruption, DeferredCleanup, GbpTree, GbpTreeOptions,
    NodeKind, PageCorruption, PointerType, TreeInspection, U64Layout, ViolationKind,
};
use crate::primitives::io::MemFileIo;
use crate::primitives::pager::PagedFile;
use crate::types::{ErrorKind, GbpError, PageId, Result};

fn small_options() -> GbpTreeOptions {
    GbpTreeOptions::default()
        .with_page_size(512)
        .with_max_key_count(3)
}

fn open_mem(io: &MemFileIo) -> Result<GbpTree<U64Layout>> {
    GbpTree::in_memory(io.clone(), U64Layout, small_options())
}

fn all_keys(tree: &GbpTree<U64Layout>) -> Result<Vec<u64>> {
    tree.seek(..)?.map(|entry| entry.map(|(key, _)| key)).collect()
}

fn leaves(inspection: &TreeInspection) -> Vec<PageId> {
    inspection.tree.leaves.clone()
}

fn assert_clean(tree: &GbpTree<U64Layout>) -> Result<()> {
    let report = tree.consistency_report()?;
    assert!(report.is_clean(), "unexpected violations: {:?}", report.violations);
    Ok(())
}

#[test]
fn empty_tree_has_no_entries() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    assert!(tree.get(&42)?.is_none());
    assert!(all_keys(&tree)?.is_empty());
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn small_tree_scenario() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    for key in [5u64, 3, 8, 1, 4, 7, 9, 2, 6] {
        assert!(tree.put(&key, &(key * 10))?.is_none());
    }
    let inspection = tree.inspect()?;
    assert!(inspection.tree.height() >= 2);
    assert_eq!(inspection.tree.key_count, 9);

    let range: Vec<(u64, u64)> = tree.seek(3..=7)?.collect::<Result<_>>()?;
    assert_eq!(range, vec![(3, 30), (4, 40), (5, 50), (6, 60), (7, 70)]);

    assert_eq!(tree.remove(&5)?, Some(50));
    assert_eq!(tree.remove(&6)?, Some(60));
    assert_eq!(tree.remove(&6)?, None);
    let keys: Vec<u64> = tree
        .seek(3..=7)?
        .map(|entry| entry.map(|(key, _)| key))
        .collect::<Result<_>>()?;
    assert_eq!(keys, vec![3, 4, 7]);
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn put_replaces_and_returns_previous_value() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    assert_eq!(tree.put(&7, &1)?, None);
    assert_eq!(tree.put(&7, &2)?, Some(1));
    assert_eq!(tree.put(&7, &2)?, Some(2));
    assert_eq!(tree.get(&7)?, Some(2));
    Ok(())
}

#[test]
fn seek_honours_every_bound_kind() -> Result<()> {
    use std::ops::Bound;

    let tree = open_mem(&MemFileIo::new())?;
    for key in 0..40u64 {
        tree.put(&key, &key)?;
    }
    let collect = |lower: Bound<u64>, upper: Bound<u64>| -> Result<Vec<u64>> {
        tree.seek((lower, upper))?
            .map(|entry| entry.map(|(key, _)| key))
            .collect()
    };
    assert_eq!(
        collect(Bound::Excluded(10), Bound::Excluded(14))?,
        vec![11, 12, 13]
    );
    assert_eq!(collect(Bound::Unbounded, Bound::Included(2))?, vec![0, 1, 2]);
    assert_eq!(collect(Bound::Included(38), Bound::Unbounded)?, vec![38, 39]);
    assert!(collect(Bound::Included(20), Bound::Excluded(20))?.is_empty());
    assert!(collect(Bound::Included(100), Bound::Unbounded)?.is_empty());
    Ok(())
}

#[test]
fn sequential_inserts_split_and_drain_collapses() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    for key in 0..200u64 {
        tree.put(&key, &(key + 1))?;
    }
    let stats = tree.stats();
    assert!(stats.leaf_splits > 0);
    assert!(stats.internal_splits > 0);
    assert!(stats.root_splits >= 2);
    assert!(tree.inspect()?.tree.height() >= 3);
    assert_clean(&tree)?;

    for key in 0..200u64 {
        assert_eq!(tree.remove(&key)?, Some(key + 1));
    }
    assert!(all_keys(&tree)?.is_empty());
    let inspection = tree.inspect()?;
    assert_eq!(inspection.tree.height(), 1);
    assert!(tree.stats().root_collapses > 0);
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn checkpoint_advances_generations() -> Result<()> {
    let io = MemFileIo::new();
    let tree = open_mem(&io)?;
    let before = tree.state();
    assert_eq!(before.unstable_generation, before.stable_generation + 2);
    for round in 0..5u64 {
        for key in 0..30u64 {
            tree.put(&key, &(key * round))?;
        }
        let previous = tree.state();
        tree.checkpoint()?;
        let state = tree.state();
        assert_eq!(state.stable_generation, previous.unstable_generation);
        assert_eq!(state.unstable_generation, state.stable_generation + 1);
        let inspection = tree.inspect()?;
        for node in inspection.tree.levels.iter().flatten() {
            assert!(node.generation <= state.stable_generation);
        }
    }
    assert_eq!(tree.stats().checkpoints, 5);
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn stable_nodes_are_copied_not_modified() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    for key in 0..20u64 {
        tree.put(&key, &key)?;
    }
    tree.checkpoint()?;
    let stable = tree.state().stable_generation;
    let before: Vec<PageId> = leaves(&tree.inspect()?);
    let successors = tree.stats().successors_created;

    tree.put(&0, &1000)?;
    let after = tree.inspect()?;
    assert!(tree.stats().successors_created > successors);
    // The leaf holding key 0 moved to a fresh page written in this generation.
    assert_ne!(after.tree.leaves[0], before[0]);
    let first_leaf = after
        .tree
        .levels
        .last()
        .and_then(|level| level.first())
        .ok_or(GbpError::Corruption("tree has no leaves"))?;
    assert_eq!(first_leaf.kind, NodeKind::Leaf);
    assert!(first_leaf.generation > stable);
    assert!(after
        .freelist_entries
        .iter()
        .any(|entry| entry.page == before[0]));
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn released_pages_are_reused_after_checkpoint() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    for round in 0..6u64 {
        for key in 0..50u64 {
            tree.put(&key, &round)?;
        }
        tree.checkpoint()?;
    }
    let stats = tree.stats();
    assert!(stats.pages_reused > 0);
    assert!(stats.pages_released > 0);
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn reopen_after_close_sees_checkpointed_data() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = open_mem(&io)?;
        for key in 0..100u64 {
            tree.put(&key, &(key * 3))?;
        }
        tree.close()?;
    }
    let tree = open_mem(&io)?;
    assert!(!tree.was_dirty_on_startup());
    assert!(!tree.recovery_pending());
    for key in 0..100u64 {
        assert_eq!(tree.get(&key)?, Some(key * 3));
    }
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn crash_discards_writes_after_last_checkpoint() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = open_mem(&io)?;
        for key in 0..60u64 {
            tree.put(&key, &key)?;
        }
        tree.checkpoint()?;
        for key in 60..120u64 {
            tree.put(&key, &key)?;
        }
        for key in 0..30u64 {
            tree.remove(&key)?;
        }
        // Everything reaches the file, but no checkpoint marks it stable.
        tree.page_file().flush()?;
    }
    let tree = open_mem(&io)?;
    assert!(tree.was_dirty_on_startup());
    assert!(!tree.recovery_pending());
    assert_eq!(all_keys(&tree)?, (0..60).collect::<Vec<_>>());
    assert_clean(&tree)?;

    tree.put(&500, &5)?;
    tree.close()?;
    let tree = open_mem(&io)?;
    assert!(!tree.was_dirty_on_startup());
    assert_eq!(tree.get(&500)?, Some(5));
    Ok(())
}

#[test]
fn deferred_cleanup_blocks_writes_until_run() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = open_mem(&io)?;
        for key in 0..40u64 {
            tree.put(&key, &key)?;
        }
        tree.checkpoint()?;
        tree.put(&1000, &1)?;
        tree.page_file().flush()?;
    }
    let deferred = Arc::new(DeferredCleanup::default());
    let collector: Arc<dyn CleanupWorkCollector> = deferred.clone();
    let pages = PagedFile::in_memory(io.clone(), 512)?;
    let tree = GbpTree::open_with(pages, U64Layout, small_options(), collector, &[])?;

    assert!(tree.recovery_pending());
    assert_eq!(deferred.pending(), 1);
    assert_eq!(tree.get(&10)?, Some(10));
    assert!(tree.get(&1000)?.is_none());
    let err = tree.put(&1, &2).err();
    assert!(matches!(err, Some(GbpError::Recovering)));
    assert!(matches!(tree.checkpoint(), Err(GbpError::Recovering)));

    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::DirtyOnStartup), 1);

    assert_eq!(deferred.run_pending()?, 1);
    assert!(!tree.recovery_pending());
    tree.put(&1, &2)?;
    assert_eq!(tree.get(&1)?, Some(2));
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn read_only_handles_never_write() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ro.gbpt");
    let options = small_options();
    {
        let tree = GbpTree::open(&path, U64Layout, options.clone())?;
        for key in 0..25u64 {
            tree.put(&key, &key)?;
        }
        tree.close()?;
    }
    let before = std::fs::read(&path)?;
    let tree = GbpTree::open(&path, U64Layout, options.clone().read_only())?;
    assert_eq!(tree.get(&24)?, Some(24));
    assert!(matches!(tree.put(&1, &1), Err(GbpError::ReadOnly)));
    assert!(matches!(tree.checkpoint(), Err(GbpError::ReadOnly)));
    assert!(tree.corrupt(Corruption::DecrementFreelistWritePos).is_err());
    tree.close()?;
    assert_eq!(std::fs::read(&path)?, before);

    let missing = dir.path().join("missing.gbpt");
    assert!(matches!(
        GbpTree::open(&missing, U64Layout, options.read_only()),
        Err(GbpError::NotFound)
    ));
    Ok(())
}

#[test]
fn read_only_open_of_dirty_file_needs_recovery() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = open_mem(&io)?;
        for key in 0..30u64 {
            tree.put(&key, &key)?;
        }
        tree.checkpoint()?;
        tree.put(&99, &99)?;
        tree.page_file().flush()?;
    }
    let tree = GbpTree::in_memory(io.clone(), U64Layout, small_options().read_only())?;
    assert!(tree.was_dirty_on_startup());
    assert!(tree.recovery_pending());
    assert_eq!(tree.get(&29)?, Some(29));
    assert!(tree.get(&99)?.is_none());
    let err = tree.put(&1, &1).err().map(|err| err.kind());
    assert_eq!(err, Some(ErrorKind::RequiresRecovery));
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::DirtyOnStartup), 1);
    Ok(())
}

#[test]
fn reopen_with_other_layout_or_page_size_fails() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("meta.gbpt");
    GbpTree::open(&path, U64Layout, small_options())?.close()?;

    let wrong_layout = GbpTree::open(&path, BytesLayout, small_options());
    assert!(matches!(wrong_layout, Err(GbpError::MetadataMismatch(_))));
    let wrong_size = GbpTree::open(&path, U64Layout, small_options().with_page_size(1024));
    assert!(matches!(wrong_size, Err(GbpError::MetadataMismatch(_))));
    Ok(())
}

#[test]
fn header_is_stored_and_replaced_by_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("header.gbpt");
    let options = small_options();
    {
        let pages = PagedFile::open(&path, 512)?;
        let collector: Arc<dyn CleanupWorkCollector> = Arc::new(DeferredCleanup::default());
        let tree = GbpTree::open_with(pages, U64Layout, options.clone(), collector, b"v1")?;
        assert_eq!(tree.header(), b"v1".to_vec());
        tree.put(&1, &1)?;
        tree.checkpoint_with_header(|current| {
            let mut next = current.to_vec();
            next.extend_from_slice(b"+v2");
            next
        })?;
        assert_eq!(tree.header(), b"v1+v2".to_vec());
        tree.close()?;
    }
    assert_eq!(GbpTree::<U64Layout>::read_header(&path, &options)?, b"v1+v2".to_vec());

    let tree = GbpTree::open(&path, U64Layout, options)?;
    assert_eq!(tree.header(), b"v1+v2".to_vec());
    let too_large = tree.checkpoint_with_header(|_| vec![0u8; 600]);
    assert!(matches!(too_large, Err(GbpError::Invalid(_))));
    Ok(())
}

#[test]
fn writer_sees_its_own_changes() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    let mut writer = tree.writer()?;
    for key in 0..10u64 {
        writer.put(&key, &(key + 100))?;
    }
    assert_eq!(writer.get(&3)?, Some(103));
    assert_eq!(writer.remove(&3)?, Some(103));
    assert!(writer.get(&3)?.is_none());
    drop(writer);
    assert_eq!(all_keys(&tree)?.len(), 9);
    Ok(())
}

#[test]
fn seek_outliving_close_fails() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    tree.put(&1, &1)?;
    let mut seek = tree.seek(..)?;
    tree.close()?;
    assert!(matches!(seek.next(), Some(Err(GbpError::Closed))));
    Ok(())
}

#[test]
fn dynamic_layout_round_trip() -> Result<()> {
    let tree = GbpTree::in_memory(
        MemFileIo::new(),
        BytesLayout,
        GbpTreeOptions::default().with_page_size(512),
    )?;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut reference = BTreeMap::new();
    for n in 0..300u32 {
        let key = format!("key-{:05}-{}", n * 7 % 300, "x".repeat(rng.gen_range(0..20)));
        let value = vec![b'v'; rng.gen_range(0..40)];
        tree.put(&Bytes::from(key.clone()), &Bytes::from(value.clone()))?;
        reference.insert(key.into_bytes(), value);
    }
    let removed: Vec<Vec<u8>> = reference.keys().step_by(3).cloned().collect();
    for key in removed {
        let value = reference.remove(&key);
        let found = tree.remove(&Bytes::from(key))?;
        assert_eq!(found.map(|bytes| bytes.to_vec()), value);
    }
    let scanned: Vec<(Vec<u8>, Vec<u8>)> = tree
        .seek(..)?
        .map(|entry| entry.map(|(key, value)| (key.to_vec(), value.to_vec())))
        .collect::<Result<_>>()?;
    let expected: Vec<(Vec<u8>, Vec<u8>)> = reference.into_iter().collect();
    assert_eq!(scanned, expected);
    let report = tree.consistency_report()?;
    assert!(report.is_clean(), "{:?}", report.violations);

    let oversized = tree.put(&Bytes::from_static(b"big"), &Bytes::from(vec![0u8; 400]));
    assert!(matches!(oversized, Err(GbpError::EntryTooLarge { .. })));
    // A rejected entry does not poison the handle.
    tree.put(&Bytes::from_static(b"small"), &Bytes::from_static(b"ok"))?;
    Ok(())
}

fn two_level_tree() -> Result<GbpTree<U64Layout>> {
    let tree = open_mem(&MemFileIo::new())?;
    for key in 0..12u64 {
        tree.put(&key, &key)?;
    }
    Ok(tree)
}

#[test]
fn crashed_sibling_slot_is_reported_once() -> Result<()> {
    let tree = two_level_tree()?;
    let first = leaves(&tree.inspect()?)[0];
    tree.corrupt(Corruption::page(
        first,
        PageCorruption::Crashed(PointerType::RightSibling),
    ))?;
    let report = tree.consistency_report()?;
    assert_eq!(report.violations.len(), 1, "{:?}", report.violations);
    let violation = &report.violations[0];
    assert_eq!(violation.kind, ViolationKind::CrashedPointer);
    assert_eq!(violation.page, first);
    assert_eq!(violation.pointer, Some(PointerType::RightSibling));
    // Readers skip the crashed slot.
    assert_eq!(all_keys(&tree)?, (0..12).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn crashed_slot_needs_a_crash_generation() -> Result<()> {
    let tree = two_level_tree()?;
    tree.checkpoint()?;
    let first = leaves(&tree.inspect()?)[0];
    let result = tree.corrupt(Corruption::page(
        first,
        PageCorruption::Crashed(PointerType::RightSibling),
    ));
    assert!(matches!(result, Err(GbpError::Invariant(_))));
    Ok(())
}

#[test]
fn broken_slot_is_reported() -> Result<()> {
    let tree = two_level_tree()?;
    let first = leaves(&tree.inspect()?)[0];
    tree.corrupt(Corruption::page(
        first,
        PageCorruption::Broken(PointerType::RightSibling),
    ))?;
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::BrokenPointer), 1);
    Ok(())
}

#[test]
fn node_corruptions_are_detected() -> Result<()> {
    let cases: Vec<(PageCorruption, ViolationKind)> = vec![
        (PageCorruption::NotATreeNode, ViolationKind::NotATreeNode),
        (
            PageCorruption::UnknownTreeNodeType,
            ViolationKind::UnknownTreeNodeType,
        ),
        (PageCorruption::SwapKeyOrder, ViolationKind::KeysOutOfOrderInNode),
        (
            PageCorruption::HasSuccessor,
            ViolationKind::PointerToOldVersionOfTreeNode,
        ),
        (
            PageCorruption::RightSiblingPointToNonExisting,
            ViolationKind::PageIdExceedLastId,
        ),
        (
            PageCorruption::SetHighestReasonableKeyCount,
            ViolationKind::KeysOutOfOrderInNode,
        ),
    ];
    for (corruption, expected) in cases {
        let tree = two_level_tree()?;
        let first = leaves(&tree.inspect()?)[0];
        tree.corrupt(Corruption::page(first, corruption.clone()))?;
        let report = tree.consistency_report()?;
        assert!(
            report.count(expected) >= 1,
            "{corruption:?} produced {:?}",
            report.violations
        );
    }
    Ok(())
}

#[test]
fn freelist_corruptions_are_detected() -> Result<()> {
    let tree = two_level_tree()?;
    let root = tree.state().root_id;
    tree.corrupt(Corruption::AddFreelistEntry { page: root })?;
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::ReachablePageInFreelist), 1);

    let tree = two_level_tree()?;
    assert!(!tree.inspect()?.freelist_entries.is_empty());
    tree.corrupt(Corruption::DecrementFreelistWritePos)?;
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::UnusedPage), 1);
    Ok(())
}

#[test]
fn child_pointer_corruptions_are_detected() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    for key in 0..40u64 {
        tree.put(&key, &key)?;
    }
    let inspection = tree.inspect()?;
    assert!(inspection.tree.height() >= 3);
    let root = inspection.tree.root;
    let parents = &inspection.tree.levels[1];
    assert!(parents.len() >= 2);

    tree.corrupt(Corruption::page(root, PageCorruption::SetChild { pos: 0, child: root }))?;
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::ChildNodeFoundAmongParentNodes), 1);

    let tree = open_mem(&MemFileIo::new())?;
    for key in 0..40u64 {
        tree.put(&key, &key)?;
    }
    let inspection = tree.inspect()?;
    let parents = &inspection.tree.levels[1];
    tree.corrupt(Corruption::CopyChildPointerFromOther {
        from: parents[0].id,
        from_pos: 0,
        to: parents[1].id,
        to_pos: 0,
    })?;
    let report = tree.consistency_report()?;
    assert!(report.count(ViolationKind::PageIdSeenMultipleTimes) >= 1);
    Ok(())
}

#[test]
fn checker_visits_every_node() -> Result<()> {
    let tree = two_level_tree()?;
    let inspection = tree.inspect()?;
    let nodes = inspection.tree.leaves.len() + inspection.tree.internal_nodes.len();
    let report = tree.consistency_report()?;
    assert_eq!(report.nodes_visited, nodes);
    let mut collected = super::ConsistencyReport::default();
    assert!(tree.consistency_check(&mut collected)?);
    assert!(collected.violations.is_empty());
    Ok(())
}

#[test]
fn unreadable_leaf_fails_reads_with_its_page() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    for key in 0..12u64 {
        tree.put(&key, &key)?;
    }
    let broken = leaves(&tree.inspect()?)[1];
    tree.corrupt(Corruption::page(broken, PageCorruption::NotATreeNode))?;

    let failure = tree
        .seek(..)?
        .find_map(|entry| entry.err())
        .ok_or(GbpError::Corruption("seek skipped the damaged leaf"))?;
    assert!(
        matches!(failure, GbpError::PageCorruption { page, .. } if page == broken),
        "{failure}"
    );

    let failures: Vec<GbpError> = (0..12u64).filter_map(|key| tree.get(&key).err()).collect();
    assert!(!failures.is_empty());
    for failure in failures {
        assert!(
            matches!(failure, GbpError::PageCorruption { page, .. } if page == broken),
            "{failure}"
        );
    }
    // One retry per read, not a restart storm.
    assert!(tree.stats().seek_restarts <= 16);
    Ok(())
}

/// Key count ceiling set by [`small_options`].
const MAX_KEYS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u64),
    Remove(u64),
    Checkpoint,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u64..256, any::<u64>()).prop_map(|(key, value)| Op::Put(key, value)),
        3 => (0u64..256).prop_map(Op::Remove),
        1 => Just(Op::Checkpoint),
    ]
}

#[derive(Debug, Clone)]
enum BytesOp {
    Put(u16, Vec<u8>),
    Remove(u16),
    Checkpoint,
}

fn bytes_op_strategy() -> impl Strategy<Value = BytesOp> {
    prop_oneof![
        6 => (0u16..256, prop::collection::vec(any::<u8>(), 0..60))
            .prop_map(|(key, value)| BytesOp::Put(key, value)),
        3 => (0u16..256).prop_map(BytesOp::Remove),
        1 => Just(BytesOp::Checkpoint),
    ]
}

/// No page may be both reachable and free, or reachable twice.
fn freelist_is_safe(report: &super::ConsistencyReport) -> bool {
    report.count(ViolationKind::ReachablePageInFreelist) == 0
        && report.count(ViolationKind::PageIdSeenMultipleTimes) == 0
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn tree_matches_btreemap(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let tree = open_mem(&MemFileIo::new()).expect("open tree");
        let mut reference = BTreeMap::new();
        let mut stable = tree.state().stable_generation;
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    let previous = tree.put(&key, &value).expect("put");
                    prop_assert_eq!(previous, reference.insert(key, value));
                }
                Op::Remove(key) => {
                    let removed = tree.remove(&key).expect("remove");
                    prop_assert_eq!(removed, reference.remove(&key));
                }
                Op::Checkpoint => {
                    tree.checkpoint().expect("checkpoint");
                    let next = tree.state().stable_generation;
                    prop_assert!(next > stable);
                    stable = next;
                }
            }

            let inspection = tree.inspect().expect("inspect");
            for (depth, level) in inspection.tree.levels.iter().enumerate() {
                for node in level {
                    prop_assert!(node.key_count <= MAX_KEYS, "{:?} overflows", node);
                    if depth > 0 {
                        prop_assert!(node.key_count >= MAX_KEYS / 2, "{:?} underflows", node);
                    }
                }
            }
            let report = tree.consistency_report().expect("check");
            prop_assert!(freelist_is_safe(&report), "{:?}", report.violations);
        }
        let scanned: Vec<(u64, u64)> = tree
            .seek(..)
            .expect("seek")
            .collect::<Result<_>>()
            .expect("scan");
        let expected: Vec<(u64, u64)> = reference.into_iter().collect();
        prop_assert_eq!(scanned, expected);

        let report = tree.consistency_report().expect("check");
        prop_assert!(report.is_clean(), "{:?}", report.violations);
    }

    #[test]
    fn dynamic_tree_matches_btreemap(ops in prop::collection::vec(bytes_op_strategy(), 1..300)) {
        let options = GbpTreeOptions::default().with_page_size(512);
        let tree = GbpTree::in_memory(MemFileIo::new(), BytesLayout, options).expect("open tree");
        let mut reference: BTreeMap<Bytes, Bytes> = BTreeMap::new();
        for op in ops {
            match op {
                BytesOp::Put(key, value) => {
                    let key = Bytes::copy_from_slice(&key.to_be_bytes());
                    let value = Bytes::from(value);
                    let previous = tree.put(&key, &value).expect("put");
                    prop_assert_eq!(previous, reference.insert(key, value));
                }
                BytesOp::Remove(key) => {
                    let key = Bytes::copy_from_slice(&key.to_be_bytes());
                    let removed = tree.remove(&key).expect("remove");
                    prop_assert_eq!(removed, reference.remove(&key));
                }
                BytesOp::Checkpoint => tree.checkpoint().expect("checkpoint"),
            }

            let inspection = tree.inspect().expect("inspect");
            if let Some((_, below_root)) = inspection.tree.levels.split_first() {
                if let Some(leaf_level) = below_root.last() {
                    for node in leaf_level {
                        prop_assert!(node.key_count > 0, "{:?} is an empty leaf", node);
                    }
                }
            }
            let report = tree.consistency_report().expect("check");
            prop_assert!(freelist_is_safe(&report), "{:?}", report.violations);
        }
        let scanned: Vec<(Bytes, Bytes)> = tree
            .seek(..)
            .expect("seek")
            .collect::<Result<_>>()
            .expect("scan");
        let expected: Vec<(Bytes, Bytes)> = reference.into_iter().collect();
        prop_assert_eq!(scanned, expected);

        let report = tree.consistency_report().expect("check");
        prop_assert!(report.is_clean(), "{:?}", report.violations);
    }
}
