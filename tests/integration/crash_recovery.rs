#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use gbptree::primitives::io::MemFileIo;
use gbptree::primitives::pager::PagedFile;
use gbptree::storage::gbptree::{ImmediateCleanup, ViolationKind};
use gbptree::{CleanupMode, ErrorKind, GbpError, GbpTree, GbpTreeOptions, Result, U64Layout};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn options() -> GbpTreeOptions {
    GbpTreeOptions::default()
        .with_page_size(512)
        .with_max_key_count(4)
}

fn entries(tree: &GbpTree<U64Layout>) -> Result<BTreeMap<u64, u64>> {
    tree.seek(..)?.collect()
}

/// Flushes every page written so far and drops the handle without closing.
fn crash(tree: GbpTree<U64Layout>) -> Result<()> {
    tree.page_file().flush()?;
    drop(tree);
    Ok(())
}

#[test]
fn file_backed_crash_keeps_last_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crash.gbpt");
    {
        let tree = GbpTree::open(&path, U64Layout, options())?;
        for key in 0..100u64 {
            tree.put(&key, &(key * 2))?;
        }
        tree.checkpoint()?;
        for key in 100..160u64 {
            tree.put(&key, &key)?;
        }
        for key in (0..100u64).step_by(3) {
            tree.remove(&key)?;
        }
        crash(tree)?;
    }

    let tree = GbpTree::open(&path, U64Layout, options())?;
    assert!(tree.was_dirty_on_startup());
    assert!(!tree.recovery_pending());
    let expected: BTreeMap<u64, u64> = (0..100u64).map(|key| (key, key * 2)).collect();
    assert_eq!(entries(&tree)?, expected);
    let report = tree.consistency_report()?;
    assert!(report.is_clean(), "{:?}", report.violations);
    tree.close()?;

    let tree = GbpTree::open(&path, U64Layout, options())?;
    assert!(!tree.was_dirty_on_startup());
    assert_eq!(entries(&tree)?.len(), 100);
    Ok(())
}

#[test]
fn crash_before_first_checkpoint_leaves_empty_tree() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = GbpTree::in_memory(io.clone(), U64Layout, options())?;
        for key in 0..50u64 {
            tree.put(&key, &key)?;
        }
        crash(tree)?;
    }
    let tree = GbpTree::in_memory(io, U64Layout, options())?;
    assert!(tree.was_dirty_on_startup());
    assert!(entries(&tree)?.is_empty());
    assert!(tree.consistency_report()?.is_clean());
    Ok(())
}

#[test]
fn repeated_crashes_match_checkpointed_model() -> Result<()> {
    let io = MemFileIo::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0x6b9e_2024);
    let mut committed: BTreeMap<u64, u64> = BTreeMap::new();

    for round in 0..12 {
        let tree = GbpTree::in_memory(io.clone(), U64Layout, options())?;
        assert_eq!(entries(&tree)?, committed, "round {round} after reopen");
        let report = tree.consistency_report()?;
        assert!(report.is_clean(), "round {round}: {:?}", report.violations);

        let mut working = committed.clone();
        for _ in 0..rng.gen_range(20..200) {
            let key = rng.gen_range(0..400u64);
            if rng.gen_bool(0.7) {
                let value = rng.gen::<u64>();
                assert_eq!(tree.put(&key, &value)?, working.insert(key, value));
            } else {
                assert_eq!(tree.remove(&key)?, working.remove(&key));
            }
            if rng.gen_ratio(1, 50) {
                tree.checkpoint()?;
                committed = working.clone();
            }
        }
        assert_eq!(entries(&tree)?, working);
        crash(tree)?;
    }
    Ok(())
}

#[test]
fn background_cleanup_refuses_writes_until_finished() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = GbpTree::in_memory(io.clone(), U64Layout, options())?;
        for key in 0..300u64 {
            tree.put(&key, &key)?;
        }
        tree.checkpoint()?;
        for key in 0..300u64 {
            tree.put(&key, &(key + 1))?;
        }
        crash(tree)?;
    }

    let options = options().with_cleanup(CleanupMode::Background);
    let tree = GbpTree::in_memory(io.clone(), U64Layout, options)?;
    assert!(tree.was_dirty_on_startup());
    assert_eq!(tree.get(&7)?, Some(7));
    match tree.put(&1, &1) {
        Ok(_) => assert!(!tree.recovery_pending()),
        Err(err) => {
            assert!(matches!(err, GbpError::Recovering));
            assert_eq!(err.kind(), ErrorKind::Retryable);
        }
    }
    tree.finish_recovery()?;
    assert!(!tree.recovery_pending());
    tree.put(&1, &100)?;
    assert_eq!(tree.get(&1)?, Some(100));
    assert!(tree.consistency_report()?.is_clean());
    Ok(())
}

#[test]
fn read_only_open_of_crashed_file_reads_checkpoint() -> Result<()> {
    let io = MemFileIo::new();
    {
        let tree = GbpTree::in_memory(io.clone(), U64Layout, options())?;
        for key in 0..30u64 {
            tree.put(&key, &key)?;
        }
        tree.checkpoint()?;
        tree.put(&999, &1)?;
        crash(tree)?;
    }
    let before = io.snapshot();

    let tree = GbpTree::in_memory(io.clone(), U64Layout, options().read_only())?;
    assert!(tree.was_dirty_on_startup());
    assert!(tree.recovery_pending());
    assert_eq!(entries(&tree)?.len(), 30);
    assert!(tree.get(&999)?.is_none());

    let err = tree.put(&1, &2).err();
    assert!(matches!(err, Some(GbpError::NeedsRecovery)));
    assert_eq!(
        GbpError::NeedsRecovery.kind(),
        ErrorKind::RequiresRecovery
    );
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::DirtyOnStartup), 1);
    drop(tree);
    assert_eq!(io.snapshot(), before);

    // A writable open recovers and the file is clean again.
    let tree = GbpTree::in_memory(io, U64Layout, options())?;
    assert!(tree.consistency_report()?.is_clean());
    Ok(())
}

#[test]
fn header_survives_crash_at_last_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("header.gbpt");
    {
        let pages = PagedFile::open(&path, 512)?;
        let tree = GbpTree::open_with(
            pages,
            U64Layout,
            options(),
            Arc::new(ImmediateCleanup),
            b"schema-1",
        )?;
        tree.put(&1, &1)?;
        tree.checkpoint_with_header(|current| {
            let mut next = current.to_vec();
            next.extend_from_slice(b"+index");
            next
        })?;
        tree.checkpoint_with_header(|_| b"discarded".to_vec())?;
        tree.put(&2, &2)?;
        crash(tree)?;
    }
    // Both checkpoints were complete; only the writes after them are lost.
    assert_eq!(GbpTree::<U64Layout>::read_header(&path, &options())?, b"discarded");
    let tree = GbpTree::open(&path, U64Layout, options())?;
    assert_eq!(tree.header(), b"discarded");
    assert_eq!(tree.get(&1)?, Some(1));
    assert!(tree.get(&2)?.is_none());
    Ok(())
}
