#![allow(missing_docs)]

use bytes::Bytes;
use gbptree::primitives::io::MemFileIo;
use gbptree::{
    BytesLayout, GbpError, GbpTreeOptions, MultiRootGbpTree, Result, U64Layout,
};
use tempfile::tempdir;

fn options() -> GbpTreeOptions {
    GbpTreeOptions::default()
        .with_page_size(512)
        .with_max_key_count(4)
}

fn open_mem(io: &MemFileIo) -> Result<MultiRootGbpTree<U64Layout, U64Layout>> {
    MultiRootGbpTree::in_memory(io.clone(), U64Layout, U64Layout, options())
}

fn assert_clean(tree: &MultiRootGbpTree<U64Layout, U64Layout>) -> Result<()> {
    let report = tree.registry().consistency_report()?;
    assert!(report.is_clean(), "{:?}", report.violations);
    Ok(())
}

#[test]
fn roots_are_added_once_and_deleted_once() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    assert!(tree.roots()?.is_empty());
    tree.add_root(&7)?;
    tree.add_root(&3)?;
    assert!(matches!(tree.add_root(&7), Err(GbpError::RootExists)));
    assert_eq!(tree.roots()?, vec![3, 7]);

    tree.delete_root(&3)?;
    assert!(matches!(tree.delete_root(&3), Err(GbpError::NotFound)));
    assert_eq!(tree.roots()?, vec![7]);

    // Caller mistakes leave the handle usable.
    tree.root_at(&7).put(&1, &1)?;
    assert_eq!(tree.root_at(&7).get(&1)?, Some(1));
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn missing_root_is_not_found() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    let missing = tree.root_at(&42);
    assert!(matches!(missing.get(&1), Err(GbpError::NotFound)));
    assert!(matches!(missing.put(&1, &1), Err(GbpError::NotFound)));
    assert!(matches!(missing.remove(&1), Err(GbpError::NotFound)));
    assert!(matches!(missing.seek(..), Err(GbpError::NotFound)));
    Ok(())
}

#[test]
fn data_trees_are_independent() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    for root in 0..5u64 {
        tree.add_root(&root)?;
    }
    for root in 0..5u64 {
        let handle = tree.root_at(&root);
        for key in 0..(40 * (root + 1)) {
            handle.put(&key, &(key * 100 + root))?;
        }
    }
    for root in 0..5u64 {
        let handle = tree.root_at(&root);
        let entries: Vec<(u64, u64)> = handle.seek(10..20)?.collect::<Result<_>>()?;
        let expected: Vec<(u64, u64)> = (10..20).map(|key| (key, key * 100 + root)).collect();
        assert_eq!(entries, expected);
        assert_eq!(handle.seek(..)?.count() as u64, 40 * (root + 1));
    }

    assert_eq!(tree.root_at(&2).remove(&15)?, Some(1502));
    assert_eq!(tree.root_at(&2).get(&15)?, None);
    assert_eq!(tree.root_at(&1).get(&15)?, Some(1501));

    let inspection = tree.registry().inspect()?;
    assert_eq!(inspection.data_trees.len(), 5);
    assert!(inspection.data_trees[4].height() >= 3);
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn deleting_a_root_releases_its_pages() -> Result<()> {
    let tree = open_mem(&MemFileIo::new())?;
    tree.add_root(&1)?;
    let handle = tree.root_at(&1);
    for key in 0..300u64 {
        handle.put(&key, &key)?;
    }
    tree.checkpoint()?;
    let before = tree.registry().state().last_id;

    tree.delete_root(&1)?;
    tree.checkpoint()?;
    tree.checkpoint()?;
    assert_clean(&tree)?;

    // A tree of the same size fits in the released pages.
    tree.add_root(&2)?;
    let handle = tree.root_at(&2);
    for key in 0..300u64 {
        handle.put(&key, &key)?;
    }
    assert!(tree.registry().stats().pages_reused > 0);
    assert!(tree.registry().state().last_id.0 <= before.0 + 32);
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn roots_survive_close_and_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("multi.gbpt");
    {
        let tree = MultiRootGbpTree::open(&path, U64Layout, BytesLayout, options())?;
        tree.add_root(&10)?;
        tree.root_at(&10)
            .put(&Bytes::from_static(b"alpha"), &Bytes::from_static(b"1"))?;
        tree.close()?;
    }
    {
        let tree = MultiRootGbpTree::open(&path, U64Layout, BytesLayout, options())?;
        assert!(!tree.registry().was_dirty_on_startup());
        tree.add_root(&20)?;
        tree.root_at(&10)
            .put(&Bytes::from_static(b"beta"), &Bytes::from_static(b"2"))?;
        tree.checkpoint()?;
        tree.add_root(&30)?;
        tree.root_at(&20)
            .put(&Bytes::from_static(b"lost"), &Bytes::from_static(b"3"))?;
        tree.registry().page_file().flush()?;
    }
    let tree = MultiRootGbpTree::open(&path, U64Layout, BytesLayout, options())?;
    assert!(tree.registry().was_dirty_on_startup());
    assert_eq!(tree.roots()?, vec![10, 20]);
    let keys: Vec<Bytes> = tree
        .root_at(&10)
        .seek(..)?
        .map(|entry| entry.map(|(key, _)| key))
        .collect::<Result<_>>()?;
    assert_eq!(keys, vec![Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")]);
    assert!(tree.root_at(&20).seek(..)?.next().is_none());
    let report = tree.registry().consistency_report()?;
    assert!(report.is_clean(), "{:?}", report.violations);
    Ok(())
}

#[test]
fn layouts_must_match_on_reopen() -> Result<()> {
    let io = MemFileIo::new();
    open_mem(&io)?.close()?;
    let other = MultiRootGbpTree::in_memory(io, U64Layout, BytesLayout, options());
    assert!(matches!(other, Err(GbpError::MetadataMismatch(_))));
    Ok(())
}
