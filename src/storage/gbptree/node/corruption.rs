//! Deliberate damage to tree pages, used to exercise the consistency checker
//! and the reader's restart paths.

use serde::Serialize;

use super::{
    generation, is_tree_node, key_count, kind, pointer_error, schema_tag, set_key_count,
    NodeKind, PointerType, Schema, TreeNode, KIND_OFFSET,
};
use crate::primitives::pager::{PageAccess, PageCursor, PagedFile};
use crate::storage::gbptree::gspp;
use crate::storage::gbptree::state::TreeState;
use crate::types::page::PageType;
use crate::types::{GbpError, PageId, Result};

/// Damage applied to a single tree node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PageCorruption {
    /// Stamp a non-node page type over the node.
    NotATreeNode,
    /// Replace the node kind byte with an unknown value.
    UnknownTreeNodeType,
    /// Point the right sibling past the last allocated id.
    RightSiblingPointToNonExisting,
    /// Point the left sibling past the last allocated id.
    LeftSiblingPointToNonExisting,
    /// Give a live node a successor.
    HasSuccessor,
    /// Rewrite the right sibling pointer with a generation older than its target.
    RightSiblingPointerHasTooLowGeneration,
    /// Rewrite the left sibling pointer with a generation older than its target.
    LeftSiblingPointerHasTooLowGeneration,
    /// Rewrite a child pointer with a generation older than its target.
    ChildPointerHasTooLowGeneration {
        /// Child position.
        pos: usize,
    },
    /// Swap the first and last key.
    SwapKeyOrder,
    /// Overwrite one key in place.
    OverwriteKeyAtPos {
        /// Key position.
        pos: usize,
        /// Encoded replacement; must match the stored key length.
        key: Vec<u8>,
    },
    /// Move the allocation offset of a dynamic node to the page end.
    MaximizeAllocOffset,
    /// Move the allocation offset of a dynamic node onto its slot array.
    MinimizeAllocOffset,
    /// Move the allocation offset of a dynamic node back one byte.
    DecrementAllocOffset,
    /// Claim one more byte of dead space than a dynamic node has.
    IncrementDeadSpace,
    /// Write a slot from a crashed generation next to the pointer's winner.
    Crashed(PointerType),
    /// Write a slot with a bad checksum next to the pointer's winner.
    Broken(PointerType),
    /// Redirect a pointer.
    SetPointer {
        /// Pointer to rewrite.
        pointer: PointerType,
        /// New target.
        target: PageId,
    },
    /// Overwrite the key count.
    SetKeyCount(u32),
    /// Redirect a child pointer.
    SetChild {
        /// Child position.
        pos: usize,
        /// New target.
        child: PageId,
    },
    /// Set the key count to the largest value the layout still accepts.
    SetHighestReasonableKeyCount,
}

/// Damage applied through [`super::super::GbpTree::corrupt`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Corruption {
    /// Damage one node.
    Page {
        /// Node to damage.
        page: PageId,
        /// What to do to it.
        corruption: PageCorruption,
    },
    /// Forget the most recently released id.
    DecrementFreelistWritePos,
    /// Release an id that is still in use.
    AddFreelistEntry {
        /// Id to release.
        page: PageId,
    },
    /// Replace the in-memory tree state.
    SetTreeState(TreeState),
    /// Copy a child pointer of one internal node into another.
    CopyChildPointerFromOther {
        /// Node to copy from.
        from: PageId,
        /// Child position in `from`.
        from_pos: usize,
        /// Node to overwrite.
        to: PageId,
        /// Child position in `to`.
        to_pos: usize,
    },
}

impl Corruption {
    /// Shorthand for [`Corruption::Page`].
    pub fn page(page: PageId, corruption: PageCorruption) -> Self {
        Corruption::Page { page, corruption }
    }
}

fn unavailable(page: PageId) -> GbpError {
    GbpError::at_page(page, "page unavailable")
}

fn schema_of<'s>(schemas: &'s [Schema], tag: u8) -> Result<&'s Schema> {
    schemas
        .get(tag as usize)
        .or_else(|| schemas.first())
        .ok_or(GbpError::Invalid("tree has no schema"))
}

fn dynamic(node: &TreeNode) -> Result<&super::DynamicSizeNode> {
    match node {
        TreeNode::Dynamic(node) => Ok(node),
        TreeNode::Fixed(_) => Err(GbpError::Invalid(
            "corruption applies to dynamic-size nodes only",
        )),
    }
}

fn read_generation(pages: &PagedFile, page: PageId) -> Result<u64> {
    let mut cursor = pages.io(page, PageAccess::Read)?;
    if !cursor.next()? {
        return Err(unavailable(page));
    }
    loop {
        let found = generation(&mut cursor);
        if !cursor.should_retry() {
            return Ok(found);
        }
    }
}

/// Applies `corruption` to `page` using generations `(stable, unstable)`.
pub(crate) fn apply(
    pages: &PagedFile,
    schemas: &[Schema],
    page: PageId,
    corruption: &PageCorruption,
    stable: u64,
    unstable: u64,
    last_id: PageId,
) -> Result<()> {
    let (tag, node_kind) = {
        let mut cursor = pages.io(page, PageAccess::Read)?;
        if !cursor.next()? {
            return Err(unavailable(page));
        }
        if !is_tree_node(&mut cursor) {
            return Err(GbpError::at_page(page, "not a tree node"));
        }
        (schema_tag(&mut cursor), kind(&mut cursor))
    };
    let schema = schema_of(schemas, tag)?;
    let node = &schema.node;
    let node_kind = node_kind.ok_or_else(|| GbpError::at_page(page, "unknown node kind"))?;

    let lowered = match corruption {
        PageCorruption::RightSiblingPointerHasTooLowGeneration => Some(PointerType::RightSibling),
        PageCorruption::LeftSiblingPointerHasTooLowGeneration => Some(PointerType::LeftSibling),
        PageCorruption::ChildPointerHasTooLowGeneration { pos } => Some(PointerType::Child(*pos)),
        _ => None,
    };
    let lowered = match lowered {
        Some(pointer) => {
            let mut cursor = pages.io(page, PageAccess::Read)?;
            if !cursor.next()? {
                return Err(unavailable(page));
            }
            let target = node
                .read_pointer(&mut cursor, pointer, stable, unstable)
                .map_err(|failure| pointer_error(page, pointer, failure))?;
            drop(cursor);
            if !target.id.is_some() {
                return Err(GbpError::Invalid("pointer has no target to outdate"));
            }
            let target_generation = read_generation(pages, target.id)?;
            Some((
                pointer,
                target.id,
                target_generation.saturating_sub(1).min(stable),
            ))
        }
        None => None,
    };

    let mut cursor = pages.io(page, PageAccess::Write)?;
    if !cursor.next()? {
        return Err(unavailable(page));
    }
    let count = key_count(&mut cursor);
    let beyond = PageId(last_id.0 + 1);
    let set = |cursor: &mut PageCursor<'_>, pointer: PointerType, target: PageId| {
        node.write_pointer(cursor, pointer, target, stable, unstable)
            .map_err(|failure| pointer_error(page, pointer, failure))
    };
    match corruption {
        PageCorruption::NotATreeNode => cursor.put_u8_at(0, PageType::FreeList.as_u8()),
        PageCorruption::UnknownTreeNodeType => cursor.put_u8_at(KIND_OFFSET, 0xEE),
        PageCorruption::RightSiblingPointToNonExisting => {
            set(&mut cursor, PointerType::RightSibling, beyond)?
        }
        PageCorruption::LeftSiblingPointToNonExisting => {
            set(&mut cursor, PointerType::LeftSibling, beyond)?
        }
        PageCorruption::HasSuccessor => set(&mut cursor, PointerType::Successor, last_id)?,
        PageCorruption::RightSiblingPointerHasTooLowGeneration
        | PageCorruption::LeftSiblingPointerHasTooLowGeneration
        | PageCorruption::ChildPointerHasTooLowGeneration { .. } => {
            if let Some((pointer, target, low)) = lowered {
                gspp::write_fresh(&mut cursor, node.pointer_offset(pointer), low, target);
            }
        }
        PageCorruption::SwapKeyOrder => {
            if count < 2 {
                return Err(GbpError::Invalid("swapping keys needs at least two keys"));
            }
            let first = node.key_at(&mut cursor, node_kind, 0);
            let last = node.key_at(&mut cursor, node_kind, count - 1);
            if !node.set_key_at(&mut cursor, node_kind, 0, &last)
                || !node.set_key_at(&mut cursor, node_kind, count - 1, &first)
            {
                return Err(GbpError::Invalid("swapped keys differ in length"));
            }
        }
        PageCorruption::OverwriteKeyAtPos { pos, key } => {
            if *pos >= count {
                return Err(GbpError::Invalid("key position beyond key count"));
            }
            if !node.set_key_at(&mut cursor, node_kind, *pos, key) {
                return Err(GbpError::Invalid("replacement key differs in length"));
            }
        }
        PageCorruption::MaximizeAllocOffset => {
            let dynamic = dynamic(node)?;
            let end = cursor.page_size();
            dynamic.set_alloc_offset(&mut cursor, end);
        }
        PageCorruption::MinimizeAllocOffset => {
            let dynamic = dynamic(node)?;
            let end = dynamic.slots_end(node_kind, count);
            dynamic.set_alloc_offset(&mut cursor, end);
        }
        PageCorruption::DecrementAllocOffset => {
            let dynamic = dynamic(node)?;
            let alloc = dynamic.alloc_offset(&mut cursor);
            dynamic.set_alloc_offset(&mut cursor, alloc.saturating_sub(1));
        }
        PageCorruption::IncrementDeadSpace => {
            let dynamic = dynamic(node)?;
            let dead = dynamic.dead_space(&mut cursor);
            dynamic.set_dead_space(&mut cursor, dead + 1);
        }
        PageCorruption::Crashed(pointer) | PageCorruption::Broken(pointer) => {
            let crashed = matches!(corruption, PageCorruption::Crashed(_));
            if crashed && unstable.saturating_sub(stable) < 2 {
                return Err(GbpError::Invariant(
                    "no crash generation between stable and unstable",
                ));
            }
            let offset = node.pointer_offset(*pointer);
            let winner = gspp::read(&mut cursor, offset, stable, unstable)
                .map_err(|failure| pointer_error(page, *pointer, failure))?;
            let slot_generation = if crashed { unstable - 1 } else { unstable };
            gspp::write_loser_slot(
                &mut cursor,
                offset,
                stable,
                unstable,
                slot_generation,
                winner.id.0,
                crashed,
            )
            .map_err(|failure| pointer_error(page, *pointer, failure))?;
        }
        PageCorruption::SetPointer { pointer, target } => set(&mut cursor, *pointer, *target)?,
        PageCorruption::SetKeyCount(count) => set_key_count(&mut cursor, *count as usize),
        PageCorruption::SetChild { pos, child } => {
            if node_kind != NodeKind::Internal {
                return Err(GbpError::Invalid("only internal nodes have children"));
            }
            set(&mut cursor, PointerType::Child(*pos), *child)?
        }
        PageCorruption::SetHighestReasonableKeyCount => {
            let highest = node.highest_reasonable_key_count(node_kind);
            set_key_count(&mut cursor, highest);
        }
    }
    if cursor.check_and_clear_bounds() {
        return Err(GbpError::at_page(page, "corruption wrote out of bounds"));
    }
    Ok(())
}
