#![allow(missing_docs)]

use std::ops::Bound;
use std::thread;

use gbptree::primitives::io::MemFileIo;
use gbptree::storage::gbptree::{KeepExisting, Overwrite};
use gbptree::{GbpError, GbpTree, GbpTreeOptions, MergeOutcome, Result, U64Layout};

fn tree_with(
    max_key_count: usize,
    keys: impl IntoIterator<Item = u64>,
) -> Result<GbpTree<U64Layout>> {
    let options = GbpTreeOptions::default()
        .with_page_size(512)
        .with_max_key_count(max_key_count);
    let tree = GbpTree::in_memory(MemFileIo::new(), U64Layout, options)?;
    for key in keys {
        tree.put(&key, &(key * 10))?;
    }
    Ok(tree)
}

fn backward_keys(
    tree: &GbpTree<U64Layout>,
    lower: Bound<u64>,
    upper: Bound<u64>,
) -> Result<Vec<u64>> {
    tree.seek_backward((lower, upper))?
        .map(|entry| entry.map(|(key, _)| key))
        .collect()
}

#[test]
fn backward_seek_mirrors_forward() -> Result<()> {
    let tree = tree_with(4, 0..200)?;
    let forward: Vec<(u64, u64)> = tree.seek(..)?.collect::<Result<_>>()?;
    let mut backward: Vec<(u64, u64)> = tree.seek_backward(..)?.collect::<Result<_>>()?;
    backward.reverse();
    assert_eq!(backward, forward);

    assert_eq!(
        backward_keys(&tree, Bound::Included(10), Bound::Excluded(14))?,
        vec![13, 12, 11, 10]
    );
    assert_eq!(
        backward_keys(&tree, Bound::Excluded(10), Bound::Included(14))?,
        vec![14, 13, 12, 11]
    );
    assert_eq!(
        backward_keys(&tree, Bound::Unbounded, Bound::Included(1))?,
        vec![1, 0]
    );
    assert_eq!(
        backward_keys(&tree, Bound::Included(198), Bound::Unbounded)?,
        vec![199, 198]
    );
    assert!(backward_keys(&tree, Bound::Included(20), Bound::Excluded(20))?.is_empty());
    assert!(backward_keys(&tree, Bound::Included(500), Bound::Unbounded)?.is_empty());

    let empty = tree_with(4, [])?;
    assert!(empty.seek_backward(..)?.next().is_none());
    Ok(())
}

#[test]
fn backward_seek_survives_writes_between_steps() -> Result<()> {
    // Odd keys stay put; the writer rewrites and removes even keys around them.
    let tree = tree_with(4, (0..600u64).map(|n| n * 2 + 1))?;
    tree.checkpoint()?;
    let mut seek = tree.seek_backward(..)?;
    let mut keys = Vec::new();
    for _ in 0..300 {
        keys.push(seek.next().ok_or(GbpError::NotFound)??.0);
    }
    for round in 0..3u64 {
        for n in 0..600u64 {
            tree.put(&(n * 2), &round)?;
        }
        for n in (0..600u64).step_by(3) {
            tree.remove(&(n * 2))?;
        }
        tree.checkpoint()?;
    }
    for entry in seek {
        keys.push(entry?.0);
    }
    assert!(keys.windows(2).all(|pair| pair[0] > pair[1]));
    let odd: Vec<u64> = keys.into_iter().filter(|key| key % 2 == 1).collect();
    let expected: Vec<u64> = (0..600u64).rev().map(|n| n * 2 + 1).collect();
    assert_eq!(odd, expected);
    Ok(())
}

#[test]
fn partitions_cover_the_range_once() -> Result<()> {
    let tree = tree_with(8, 0..2_000)?;
    let parts = tree.partitioned_seek(100..1_900, 4)?;
    assert_eq!(parts.len(), 4);

    let scanned: Vec<Vec<u64>> = thread::scope(|scope| {
        let handles: Vec<_> = parts
            .into_iter()
            .map(|part| {
                scope.spawn(move || -> Result<Vec<u64>> {
                    part.map(|entry| entry.map(|(key, _)| key)).collect()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("partition thread panicked"))
            .collect::<Result<_>>()
    })?;
    assert!(scanned.iter().all(|part| !part.is_empty()));
    let joined: Vec<u64> = scanned.into_iter().flatten().collect();
    assert_eq!(joined, (100..1_900).collect::<Vec<u64>>());

    let whole = tree.partitioned_seek(.., 1)?;
    assert_eq!(whole.len(), 1);
    assert!(matches!(
        tree.partitioned_seek(.., 0),
        Err(GbpError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn small_trees_yield_fewer_partitions() -> Result<()> {
    let tree = tree_with(8, 0..5)?;
    let parts = tree.partitioned_seek(.., 6)?;
    assert_eq!(parts.len(), 1);
    let mut keys = Vec::new();
    for part in parts {
        for entry in part {
            keys.push(entry?.0);
        }
    }
    assert_eq!(keys, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn entry_estimate_is_exact_for_narrow_trees() -> Result<()> {
    assert_eq!(tree_with(3, [])?.estimate_entry_count()?, 0);
    assert_eq!(tree_with(3, 0..60)?.estimate_entry_count()?, 60);
    let tree = tree_with(8, 0..200)?;
    for key in (0..200u64).step_by(4) {
        tree.remove(&key)?;
    }
    assert_eq!(tree.estimate_entry_count()?, 150);
    Ok(())
}

#[test]
fn entry_estimate_extrapolates_wide_levels() -> Result<()> {
    let tree = tree_with(3, 0..1_000)?;
    let leaves = tree.inspect()?.tree.leaves.len();
    assert!(leaves > 64);
    let estimate = tree.estimate_entry_count()?;
    assert!((800..=1_200).contains(&estimate), "estimate {estimate}");
    Ok(())
}

#[test]
fn merge_combines_inserts_and_removes() -> Result<()> {
    let tree = tree_with(4, [])?;
    let add = |_: &u64, existing: &u64, new: &u64| MergeOutcome::Replace(existing + new);
    let drop_zero = |_: &u64, _: &u64, new: &u64| -> MergeOutcome<u64> {
        if *new == 0 {
            MergeOutcome::Remove
        } else {
            MergeOutcome::Unchanged
        }
    };

    let mut writer = tree.writer()?;
    writer.merge(&1, &5, &add)?;
    writer.merge(&1, &7, &add)?;
    assert_eq!(writer.get(&1)?, Some(12));

    writer.merge_if_exists(&2, &9, &add)?;
    assert_eq!(writer.get(&2)?, None);
    writer.merge_if_exists(&1, &1, &add)?;
    assert_eq!(writer.get(&1)?, Some(13));

    writer.merge(&1, &3, &drop_zero)?;
    assert_eq!(writer.get(&1)?, Some(13));
    writer.merge(&1, &0, &drop_zero)?;
    assert_eq!(writer.get(&1)?, None);

    writer.merge(&4, &40, &KeepExisting)?;
    writer.merge(&4, &41, &KeepExisting)?;
    writer.merge(&5, &50, &Overwrite)?;
    writer.merge(&5, &51, &Overwrite)?;
    drop(writer);

    assert_eq!(tree.get(&4)?, Some(40));
    assert_eq!(tree.get(&5)?, Some(51));
    let report = tree.consistency_report()?;
    assert!(report.is_clean(), "{:?}", report.violations);
    Ok(())
}

#[test]
fn merges_split_like_puts() -> Result<()> {
    let tree = tree_with(3, [])?;
    let mut writer = tree.writer()?;
    for round in 0..3u64 {
        for key in 0..100u64 {
            writer.merge(&key, &1, &|_: &u64, existing: &u64, new: &u64| {
                MergeOutcome::Replace(existing + new)
            })?;
        }
        assert_eq!(writer.get(&50)?, Some(round + 1));
    }
    drop(writer);
    assert_eq!(tree.estimate_entry_count()?, 100);
    assert!(tree.inspect()?.tree.height() >= 3);
    Ok(())
}
