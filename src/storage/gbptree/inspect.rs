//! Structural snapshots for tooling and tests.

use serde::Serialize;

use super::node::{Body, NodeKind};
use super::state::TreeState;
use super::tree::inner::TreeInner;
use super::tree::walk;
use crate::types::{PageId, Result};

/// One node as seen by [`inspect`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    /// Page id.
    pub id: PageId,
    /// Leaf or internal.
    pub kind: NodeKind,
    /// Generation the node was written in.
    pub generation: u64,
    /// Keys in the node.
    pub key_count: usize,
}

/// Shape of one tree.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TreeShape {
    /// Root node id.
    pub root: PageId,
    /// Nodes on each level, root level first, left to right.
    pub levels: Vec<Vec<NodeSummary>>,
    /// Leaf ids in key order.
    pub leaves: Vec<PageId>,
    /// Internal node ids in visit order.
    pub internal_nodes: Vec<PageId>,
    /// Entries stored in the leaves.
    pub key_count: usize,
}

impl TreeShape {
    /// Number of levels.
    pub fn height(&self) -> usize {
        self.levels.len()
    }
}

/// A released page id waiting in the freelist.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FreelistEntry {
    /// Generation the id was released in.
    pub generation: u64,
    /// Released id.
    pub page: PageId,
}

/// Everything [`super::GbpTree::inspect`] reports.
#[derive(Clone, Debug, Serialize)]
pub struct TreeInspection {
    /// State as the next checkpoint would persist it.
    pub state: TreeState,
    /// The base tree; the root registry in a multi-root file.
    #[serde(flatten)]
    pub tree: TreeShape,
    /// Data trees of a multi-root file, in root key order.
    pub data_trees: Vec<TreeShape>,
    /// Pages making up the freelist chain.
    pub freelist_pages: Vec<PageId>,
    /// Released ids, oldest first.
    pub freelist_entries: Vec<FreelistEntry>,
}

fn shape(inner: &TreeInner, root: PageId, stable: u64, unstable: u64) -> Result<TreeShape> {
    let mut shape = TreeShape {
        root,
        ..TreeShape::default()
    };
    walk::visit_subtree(inner, root, stable, unstable, &mut |node, depth| {
        if shape.levels.len() <= depth {
            shape.levels.resize_with(depth + 1, Vec::new);
        }
        shape.levels[depth].push(NodeSummary {
            id: node.id,
            kind: node.kind,
            generation: node.generation,
            key_count: node.body.keys().len(),
        });
        match &node.body {
            Body::Leaf(image) => {
                shape.leaves.push(node.id);
                shape.key_count += image.len();
            }
            Body::Internal(_) => shape.internal_nodes.push(node.id),
        }
        Ok(())
    })?;
    Ok(shape)
}

pub(crate) fn inspect(inner: &TreeInner) -> Result<TreeInspection> {
    inner.check_readable()?;
    let w = inner.writer.lock();
    let (stable, unstable) = w.generations();
    let tree = shape(inner, w.state.root_id, stable, unstable)?;
    let mut data_trees = Vec::new();
    if inner.schemas.len() > 1 {
        for (_, root) in walk::registry_roots(inner, w.state.root_id, stable, unstable)? {
            data_trees.push(shape(inner, root.id, stable, unstable)?);
        }
    }
    let contents = w.freelist.contents(&inner.pages)?;
    Ok(TreeInspection {
        state: w.snapshot(),
        tree,
        data_trees,
        freelist_pages: contents.pages,
        freelist_entries: contents
            .entries
            .into_iter()
            .map(|(generation, page)| FreelistEntry { generation, page })
            .collect(),
    })
}
