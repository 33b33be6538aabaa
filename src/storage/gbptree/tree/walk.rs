//! Depth-first walks used by cleanup, root deletion and inspection.

use std::collections::HashSet;

use super::inner::{NodeRead, TreeInner, WriterState, MAX_DEPTH};
use crate::storage::gbptree::gspp::Pointer;
use crate::storage::gbptree::multi_root::RootEntry;
use crate::storage::gbptree::node::Body;
use crate::types::{GbpError, PageId, Result};

/// Visits every node under `root` in key order, parents before children.
/// `visit` receives the node and its depth below `root`.
pub(crate) fn visit_subtree(
    inner: &TreeInner,
    root: PageId,
    stable: u64,
    unstable: u64,
    visit: &mut dyn FnMut(&NodeRead, usize) -> Result<()>,
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((id, depth)) = stack.pop() {
        if depth >= MAX_DEPTH {
            return Err(GbpError::Corruption("tree deeper than any valid tree"));
        }
        if !seen.insert(id) {
            return Err(GbpError::at_page(id, "node reachable through two parents"));
        }
        let node = inner.read_node(id, stable, unstable)?;
        visit(&node, depth)?;
        if let Body::Internal(image) = &node.body {
            stack.extend(image.children.iter().rev().map(|child| (*child, depth + 1)));
        }
    }
    Ok(())
}

pub(crate) fn subtree_pages(
    inner: &TreeInner,
    root: PageId,
    stable: u64,
    unstable: u64,
) -> Result<Vec<PageId>> {
    let mut pages = Vec::new();
    visit_subtree(inner, root, stable, unstable, &mut |node, _| {
        pages.push(node.id);
        Ok(())
    })?;
    Ok(pages)
}

/// Key and root pointer of every data tree listed in the registry under
/// `registry_root`.
pub(crate) fn registry_roots(
    inner: &TreeInner,
    registry_root: PageId,
    stable: u64,
    unstable: u64,
) -> Result<Vec<(Vec<u8>, Pointer)>> {
    let mut roots = Vec::new();
    visit_subtree(inner, registry_root, stable, unstable, &mut |node, _| {
        if let Body::Leaf(image) = &node.body {
            for (key, value) in image.keys.iter().zip(&image.values) {
                roots.push((key.clone(), RootEntry::decode(value)?.pointer()));
            }
        }
        Ok(())
    })?;
    Ok(roots)
}

/// Every page in use: tree nodes of all trees plus the freelist chain.
pub(crate) fn reachable(inner: &TreeInner, w: &WriterState) -> Result<HashSet<PageId>> {
    let (stable, unstable) = w.generations();
    let base = w.state.root_id;
    let mut pages: HashSet<PageId> = subtree_pages(inner, base, stable, unstable)?
        .into_iter()
        .collect();
    if inner.schemas.len() > 1 {
        for (_, root) in registry_roots(inner, base, stable, unstable)? {
            pages.extend(subtree_pages(inner, root.id, stable, unstable)?);
        }
    }
    pages.extend(w.freelist.contents(&inner.pages)?.pages);
    Ok(pages)
}
