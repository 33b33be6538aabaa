#![allow(missing_docs)]

use bytes::Bytes;
use gbptree::primitives::io::MemFileIo;
use gbptree::storage::gbptree::{
    ConsistencyVisitor, Corruption, PageCorruption, PointerType, Violation, ViolationKind,
};
use gbptree::{BytesLayout, GbpTree, GbpTreeOptions, PageId, Result, U64Layout};
use tempfile::tempdir;

fn fixed_tree(keys: u64) -> Result<GbpTree<U64Layout>> {
    let options = GbpTreeOptions::default()
        .with_page_size(512)
        .with_max_key_count(3);
    let tree = GbpTree::in_memory(MemFileIo::new(), U64Layout, options)?;
    for key in 0..keys {
        tree.put(&key, &key)?;
    }
    Ok(tree)
}

fn dynamic_tree() -> Result<GbpTree<BytesLayout>> {
    let options = GbpTreeOptions::default().with_page_size(512);
    let tree = GbpTree::in_memory(MemFileIo::new(), BytesLayout, options)?;
    for n in 0..120u32 {
        let key = Bytes::from(format!("key-{n:04}"));
        let value = Bytes::from(vec![b'v'; (n % 24) as usize]);
        tree.put(&key, &value)?;
    }
    // Leave dead space behind in some nodes.
    for n in (0..120u32).step_by(5) {
        tree.put(&Bytes::from(format!("key-{n:04}")), &Bytes::from_static(b"x"))?;
    }
    Ok(tree)
}

/// Counts violations without keeping them.
#[derive(Default)]
struct Counting {
    total: usize,
    pages: Vec<PageId>,
}

impl ConsistencyVisitor for Counting {
    fn violation(&mut self, violation: Violation) {
        self.total += 1;
        self.pages.push(violation.page);
    }
}

#[test]
fn healthy_trees_pass() -> Result<()> {
    let tree = fixed_tree(500)?;
    tree.checkpoint()?;
    for key in (0..500u64).step_by(2) {
        tree.remove(&key)?;
    }
    let mut counting = Counting::default();
    assert!(tree.consistency_check(&mut counting)?);
    assert_eq!(counting.total, 0);

    let tree = dynamic_tree()?;
    let report = tree.consistency_report()?;
    assert!(report.is_clean(), "{:?}", report.violations);
    Ok(())
}

#[test]
fn visitor_sees_every_violation_the_report_holds() -> Result<()> {
    let tree = fixed_tree(30)?;
    let leaves = tree.inspect()?.tree.leaves;
    tree.corrupt(Corruption::page(leaves[0], PageCorruption::SwapKeyOrder))?;
    tree.corrupt(Corruption::page(leaves[2], PageCorruption::UnknownTreeNodeType))?;

    let report = tree.consistency_report()?;
    let mut counting = Counting::default();
    assert!(!tree.consistency_check(&mut counting)?);
    assert_eq!(counting.total, report.violations.len());
    assert!(counting.pages.contains(&leaves[0]));
    assert!(counting.pages.contains(&leaves[2]));
    Ok(())
}

#[test]
fn misplaced_and_uncountable_keys_are_reported() -> Result<()> {
    let tree = fixed_tree(30)?;
    let leaves = tree.inspect()?.tree.leaves;
    tree.corrupt(Corruption::page(
        leaves[0],
        PageCorruption::OverwriteKeyAtPos {
            pos: 0,
            key: 1_000_000u64.to_be_bytes().to_vec(),
        },
    ))?;
    let report = tree.consistency_report()?;
    assert!(report.count(ViolationKind::KeysLocatedInWrongNode) >= 1);

    let tree = fixed_tree(30)?;
    let leaves = tree.inspect()?.tree.leaves;
    tree.corrupt(Corruption::page(leaves[1], PageCorruption::SetKeyCount(10_000)))?;
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::UnreasonableKeyCount), 1);
    Ok(())
}

#[test]
fn outdated_pointer_generations_are_reported() -> Result<()> {
    let tree = fixed_tree(30)?;
    let leaves = tree.inspect()?.tree.leaves;
    tree.corrupt(Corruption::page(
        leaves[0],
        PageCorruption::RightSiblingPointerHasTooLowGeneration,
    ))?;
    let report = tree.consistency_report()?;
    assert!(report.count(ViolationKind::PointerHasLowerGenerationThanNode) >= 1);
    Ok(())
}

#[test]
fn sibling_mismatch_is_reported() -> Result<()> {
    let tree = fixed_tree(30)?;
    let leaves = tree.inspect()?.tree.leaves;
    assert!(leaves.len() >= 3);
    tree.corrupt(Corruption::page(
        leaves[0],
        PageCorruption::SetPointer {
            pointer: PointerType::RightSibling,
            target: leaves[2],
        },
    ))?;
    let report = tree.consistency_report()?;
    assert!(report.count(ViolationKind::SiblingsDontPointToEachOther) >= 1);

    let tree = fixed_tree(30)?;
    let leaves = tree.inspect()?.tree.leaves;
    let last = *leaves.last().expect("tree has leaves");
    tree.corrupt(Corruption::page(
        last,
        PageCorruption::SetPointer {
            pointer: PointerType::RightSibling,
            target: leaves[0],
        },
    ))?;
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::RightmostNodeHasRightSibling), 1);
    Ok(())
}

#[test]
fn dynamic_node_meta_damage_is_reported() -> Result<()> {
    for corruption in [
        PageCorruption::MaximizeAllocOffset,
        PageCorruption::IncrementDeadSpace,
    ] {
        let tree = dynamic_tree()?;
        let leaf = tree.inspect()?.tree.leaves[0];
        tree.corrupt(Corruption::page(leaf, corruption.clone()))?;
        let report = tree.consistency_report()?;
        assert!(
            report.count(ViolationKind::NodeMetaInconsistency) >= 1,
            "{corruption:?} produced {:?}",
            report.violations
        );
    }

    let tree = fixed_tree(10)?;
    let leaf = tree.inspect()?.tree.leaves[0];
    assert!(tree
        .corrupt(Corruption::page(leaf, PageCorruption::IncrementDeadSpace))
        .is_err());
    Ok(())
}

#[test]
fn freelist_damage_on_disk_is_reported_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("freelist.gbpt");
    let options = GbpTreeOptions::default()
        .with_page_size(512)
        .with_max_key_count(3);
    {
        let tree = GbpTree::open(&path, U64Layout, options.clone())?;
        for key in 0..40u64 {
            tree.put(&key, &key)?;
        }
        tree.checkpoint()?;
        let root = tree.state().root_id;
        tree.corrupt(Corruption::AddFreelistEntry { page: root })?;
        tree.close()?;
    }
    let tree = GbpTree::open(&path, U64Layout, options.read_only())?;
    let report = tree.consistency_report()?;
    assert_eq!(report.count(ViolationKind::ReachablePageInFreelist), 1);
    Ok(())
}
