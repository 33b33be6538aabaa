//! Tree node pages: a common header followed by a fixed- or dynamic-size
//! entry area.
//!
//! Header layout (big-endian):
//!
//! | bytes   | field                                |
//! |---------|--------------------------------------|
//! | 0       | page type (tree node)                |
//! | 1       | node kind (1 leaf, 2 internal)       |
//! | 2       | schema tag                           |
//! | 4..12   | generation the node was written in   |
//! | 12..16  | key count                            |
//! | 16..56  | right sibling pointer pair           |
//! | 56..96  | left sibling pointer pair            |
//! | 96..136 | successor pointer pair               |

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;

use super::gspp::{self, GsppFailure, Pointer};
use super::layout::{KeyOrder, Layout};
use crate::primitives::pager::PageCursor;
use crate::types::page::PageType;
use crate::types::{GbpError, PageId, Result};

pub mod corruption;
mod dynamic;
mod fixed;

pub(crate) use dynamic::DynamicSizeNode;
pub(crate) use fixed::FixedSizeNode;

pub(crate) const KIND_OFFSET: usize = 1;
pub(crate) const SCHEMA_OFFSET: usize = 2;
pub(crate) const GENERATION_OFFSET: usize = 4;
pub(crate) const KEY_COUNT_OFFSET: usize = 12;
pub(crate) const RIGHT_SIBLING_OFFSET: usize = 16;
pub(crate) const LEFT_SIBLING_OFFSET: usize = 56;
pub(crate) const SUCCESSOR_OFFSET: usize = 96;
pub(crate) const HEADER_SIZE: usize = 136;

/// Leaf or internal node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum NodeKind {
    /// Holds keys and values.
    Leaf,
    /// Holds separator keys and child pointers.
    Internal,
}

impl NodeKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            NodeKind::Leaf => 1,
            NodeKind::Internal => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(NodeKind::Leaf),
            2 => Some(NodeKind::Internal),
            _ => None,
        }
    }
}

/// Which pointer of a node a diagnostic or corruption refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum PointerType {
    /// Left sibling on the same level.
    LeftSibling,
    /// Right sibling on the same level.
    RightSibling,
    /// Newer copy of this node.
    Successor,
    /// Child at the given position of an internal node.
    Child(usize),
}

/// Keys and values of a leaf, detached from its page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LeafImage {
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) values: Vec<Vec<u8>>,
}

impl LeafImage {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn insert(&mut self, pos: usize, key: Vec<u8>, value: Vec<u8>) {
        self.keys.insert(pos, key);
        self.values.insert(pos, value);
    }

    pub(crate) fn remove(&mut self, pos: usize) -> (Vec<u8>, Vec<u8>) {
        (self.keys.remove(pos), self.values.remove(pos))
    }

    /// Moves entries `[at..]` into a new image.
    pub(crate) fn split_off(&mut self, at: usize) -> LeafImage {
        LeafImage {
            keys: self.keys.split_off(at),
            values: self.values.split_off(at),
        }
    }

    pub(crate) fn append(&mut self, other: &mut LeafImage) {
        self.keys.append(&mut other.keys);
        self.values.append(&mut other.values);
    }
}

/// Separator keys and child ids of an internal node, detached from its page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct InternalImage {
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) children: Vec<PageId>,
}

impl InternalImage {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            children: Vec::with_capacity(capacity + 1),
        }
    }

    /// Splits around key `at`: `self` keeps keys `[..at]`, the returned image
    /// gets keys `(at..]`, and the key at `at` is returned for the parent.
    pub(crate) fn split_around(&mut self, at: usize) -> (Vec<u8>, InternalImage) {
        let mut right_keys = self.keys.split_off(at);
        let separator = right_keys.remove(0);
        let right_children = self.children.split_off(at + 1);
        (
            separator,
            InternalImage {
                keys: right_keys,
                children: right_children,
            },
        )
    }

    /// Appends `separator` followed by every key and child of `other`.
    pub(crate) fn join(&mut self, separator: Vec<u8>, other: &mut InternalImage) {
        self.keys.push(separator);
        self.keys.append(&mut other.keys);
        self.children.append(&mut other.children);
    }
}

/// Contents of either node kind, detached from its page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Body {
    Leaf(LeafImage),
    Internal(InternalImage),
}

impl Body {
    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            Body::Leaf(_) => NodeKind::Leaf,
            Body::Internal(_) => NodeKind::Internal,
        }
    }

    pub(crate) fn keys(&self) -> &[Vec<u8>] {
        match self {
            Body::Leaf(image) => &image.keys,
            Body::Internal(image) => &image.keys,
        }
    }

    pub(crate) fn fits(&self, node: &TreeNode) -> bool {
        match self {
            Body::Leaf(image) => node.leaf_fits(image),
            Body::Internal(image) => node.internal_fits(image),
        }
    }

    pub(crate) fn underflow(&self, node: &TreeNode) -> bool {
        match self {
            Body::Leaf(image) => node.leaf_underflow(image),
            Body::Internal(image) => node.internal_underflow(image),
        }
    }

    /// `self` followed by `other`. Internal nodes pull `separator` down
    /// between the two; leaves drop it.
    pub(crate) fn concat(self, separator: Vec<u8>, other: Body) -> Result<Body> {
        match (self, other) {
            (Body::Leaf(mut left), Body::Leaf(mut right)) => {
                left.append(&mut right);
                Ok(Body::Leaf(left))
            }
            (Body::Internal(mut left), Body::Internal(mut right)) => {
                left.join(separator, &mut right);
                Ok(Body::Internal(left))
            }
            _ => Err(GbpError::Corruption("sibling nodes of different kinds")),
        }
    }

    /// Splits an overfull node into a left part, the separator for the
    /// parent, and a right part.
    pub(crate) fn split(self, node: &TreeNode) -> (Body, Vec<u8>, Body) {
        match self {
            Body::Leaf(mut left) => {
                let at = node.leaf_split_point(&left);
                let right = left.split_off(at);
                let separator = right.keys.first().cloned().unwrap_or_default();
                (Body::Leaf(left), separator, Body::Leaf(right))
            }
            Body::Internal(mut left) => {
                let at = node.internal_split_point(&left);
                let (separator, right) = left.split_around(at);
                (Body::Internal(left), separator, Body::Internal(right))
            }
        }
    }
}

pub(crate) fn is_tree_node(cursor: &mut PageCursor<'_>) -> bool {
    cursor.get_u8_at(0) == PageType::TreeNode.as_u8()
}

pub(crate) fn raw_kind(cursor: &mut PageCursor<'_>) -> u8 {
    cursor.get_u8_at(KIND_OFFSET)
}

pub(crate) fn kind(cursor: &mut PageCursor<'_>) -> Option<NodeKind> {
    NodeKind::from_u8(raw_kind(cursor))
}

pub(crate) fn schema_tag(cursor: &mut PageCursor<'_>) -> u8 {
    cursor.get_u8_at(SCHEMA_OFFSET)
}

pub(crate) fn generation(cursor: &mut PageCursor<'_>) -> u64 {
    cursor.get_u64_at(GENERATION_OFFSET)
}

pub(crate) fn set_generation(cursor: &mut PageCursor<'_>, generation: u64) {
    cursor.put_u64_at(GENERATION_OFFSET, generation);
}

pub(crate) fn key_count(cursor: &mut PageCursor<'_>) -> usize {
    cursor.get_u32_at(KEY_COUNT_OFFSET) as usize
}

pub(crate) fn set_key_count(cursor: &mut PageCursor<'_>, count: usize) {
    cursor.put_u32_at(KEY_COUNT_OFFSET, count as u32);
}

/// Converts a pointer failure into an error naming the page and pointer.
pub(crate) fn pointer_error(page: PageId, pointer: PointerType, failure: GsppFailure) -> GbpError {
    GbpError::at_page(page, format!("{pointer:?}: {failure}"))
}

/// Entry layout used by nodes of one schema.
#[derive(Clone, Debug)]
pub(crate) enum TreeNode {
    Fixed(FixedSizeNode),
    Dynamic(DynamicSizeNode),
}

macro_rules! dispatch {
    ($self:ident, $node:ident => $body:expr) => {
        match $self {
            TreeNode::Fixed($node) => $body,
            TreeNode::Dynamic($node) => $body,
        }
    };
}

impl TreeNode {
    pub(crate) fn new(
        page_size: usize,
        key_size: Option<usize>,
        value_size: Option<usize>,
        cap: Option<usize>,
    ) -> Result<Self> {
        match (key_size, value_size) {
            (Some(key_size), Some(value_size)) => Ok(TreeNode::Fixed(FixedSizeNode::new(
                page_size, key_size, value_size, cap,
            )?)),
            _ => Ok(TreeNode::Dynamic(DynamicSizeNode::new(page_size)?)),
        }
    }

    /// Writes an empty node of `kind` over the whole page.
    pub(crate) fn initialize(
        &self,
        cursor: &mut PageCursor<'_>,
        kind: NodeKind,
        tag: u8,
        unstable: u64,
    ) {
        let page_size = cursor.page_size();
        cursor.zero(0, page_size);
        cursor.put_u8_at(0, PageType::TreeNode.as_u8());
        cursor.put_u8_at(KIND_OFFSET, kind.as_u8());
        cursor.put_u8_at(SCHEMA_OFFSET, tag);
        set_generation(cursor, unstable);
        set_key_count(cursor, 0);
        for offset in [RIGHT_SIBLING_OFFSET, LEFT_SIBLING_OFFSET, SUCCESSOR_OFFSET] {
            gspp::write_fresh(cursor, offset, unstable, PageId::NONE);
        }
        if let TreeNode::Dynamic(node) = self {
            node.initialize(cursor);
        }
    }

    pub(crate) fn pointer_offset(&self, pointer: PointerType) -> usize {
        match pointer {
            PointerType::RightSibling => RIGHT_SIBLING_OFFSET,
            PointerType::LeftSibling => LEFT_SIBLING_OFFSET,
            PointerType::Successor => SUCCESSOR_OFFSET,
            PointerType::Child(pos) => dispatch!(self, node => node.child_offset(pos)),
        }
    }

    pub(crate) fn read_pointer(
        &self,
        cursor: &mut PageCursor<'_>,
        pointer: PointerType,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<Pointer, GsppFailure> {
        gspp::read(cursor, self.pointer_offset(pointer), stable, unstable)
    }

    pub(crate) fn write_pointer(
        &self,
        cursor: &mut PageCursor<'_>,
        pointer: PointerType,
        target: PageId,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<(), GsppFailure> {
        gspp::write(
            cursor,
            self.pointer_offset(pointer),
            stable,
            unstable,
            target,
        )
    }

    pub(crate) fn child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<Pointer, GsppFailure> {
        self.read_pointer(cursor, PointerType::Child(pos), stable, unstable)
    }

    pub(crate) fn set_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        child: PageId,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<(), GsppFailure> {
        self.write_pointer(cursor, PointerType::Child(pos), child, stable, unstable)
    }

    pub(crate) fn key_at(&self, cursor: &mut PageCursor<'_>, kind: NodeKind, pos: usize) -> Vec<u8> {
        match self {
            TreeNode::Fixed(node) => node.key_at(cursor, pos),
            TreeNode::Dynamic(node) => node.key_at(cursor, kind, pos),
        }
    }

    pub(crate) fn value_at(&self, cursor: &mut PageCursor<'_>, pos: usize) -> Vec<u8> {
        dispatch!(self, node => node.value_at(cursor, pos))
    }

    /// Replaces a key in place; false when the layout cannot do so without
    /// relocating the entry.
    pub(crate) fn set_key_at(
        &self,
        cursor: &mut PageCursor<'_>,
        kind: NodeKind,
        pos: usize,
        key: &[u8],
    ) -> bool {
        match self {
            TreeNode::Fixed(node) => node.set_key_at(cursor, pos, key),
            TreeNode::Dynamic(node) => node.set_key_at(cursor, kind, pos, key),
        }
    }

    /// Replaces a value in place; false when the layout cannot do so.
    pub(crate) fn set_value_at(&self, cursor: &mut PageCursor<'_>, pos: usize, value: &[u8]) -> bool {
        dispatch!(self, node => node.set_value_at(cursor, pos, value))
    }

    /// Inserts into a leaf and bumps its key count; false when it does not fit.
    pub(crate) fn insert_key_value_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        key: &[u8],
        value: &[u8],
        count: usize,
    ) -> bool {
        let inserted = dispatch!(self, node => node.insert_key_value_at(cursor, pos, key, value, count));
        if inserted {
            set_key_count(cursor, count + 1);
        }
        inserted
    }

    pub(crate) fn remove_key_value_at(&self, cursor: &mut PageCursor<'_>, pos: usize, count: usize) {
        dispatch!(self, node => node.remove_key_value_at(cursor, pos, count));
        set_key_count(cursor, count - 1);
    }

    /// Inserts a separator with its right child; false when it does not fit.
    pub(crate) fn insert_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        key: &[u8],
        child: PageId,
        count: usize,
        unstable: u64,
    ) -> bool {
        let inserted = dispatch!(self, node => {
            node.insert_key_and_right_child_at(cursor, pos, key, child, count, unstable)
        });
        if inserted {
            set_key_count(cursor, count + 1);
        }
        inserted
    }

    pub(crate) fn remove_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        count: usize,
    ) {
        dispatch!(self, node => node.remove_key_and_right_child_at(cursor, pos, count));
        set_key_count(cursor, count - 1);
    }

    /// Removes key `pos` together with the child on its left.
    pub(crate) fn remove_key_and_left_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        count: usize,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<(), GsppFailure> {
        let right = self.child_at(cursor, pos + 1, stable, unstable)?;
        self.set_child_at(cursor, pos, right.id, stable, unstable)?;
        self.remove_key_and_right_child_at(cursor, pos, count);
        Ok(())
    }

    pub(crate) fn defragment(&self, cursor: &mut PageCursor<'_>, kind: NodeKind) {
        if let TreeNode::Dynamic(node) = self {
            let count = key_count(cursor);
            node.defragment(cursor, kind, count);
        }
    }

    pub(crate) fn read_leaf(&self, cursor: &mut PageCursor<'_>) -> LeafImage {
        let count = key_count(cursor);
        dispatch!(self, node => node.read_leaf(cursor, count))
    }

    /// Replaces every entry of a leaf; the image must fit.
    pub(crate) fn write_leaf(&self, cursor: &mut PageCursor<'_>, image: &LeafImage) {
        dispatch!(self, node => node.write_leaf(cursor, image));
        set_key_count(cursor, image.len());
    }

    pub(crate) fn read_internal(
        &self,
        cursor: &mut PageCursor<'_>,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<InternalImage, (usize, GsppFailure)> {
        let count = key_count(cursor);
        dispatch!(self, node => node.read_internal(cursor, count, stable, unstable))
    }

    /// Replaces every key and child of an internal node created in the
    /// current unstable generation; the image must fit.
    pub(crate) fn write_internal(
        &self,
        cursor: &mut PageCursor<'_>,
        image: &InternalImage,
        unstable: u64,
    ) {
        dispatch!(self, node => node.write_internal(cursor, image, unstable));
        set_key_count(cursor, image.keys.len());
    }

    pub(crate) fn write_body(&self, cursor: &mut PageCursor<'_>, body: &Body, unstable: u64) {
        match body {
            Body::Leaf(image) => self.write_leaf(cursor, image),
            Body::Internal(image) => self.write_internal(cursor, image, unstable),
        }
    }

    pub(crate) fn leaf_fits(&self, image: &LeafImage) -> bool {
        dispatch!(self, node => node.leaf_fits(image))
    }

    pub(crate) fn leaf_underflow(&self, image: &LeafImage) -> bool {
        dispatch!(self, node => node.leaf_underflow(image))
    }

    pub(crate) fn internal_fits(&self, image: &InternalImage) -> bool {
        dispatch!(self, node => node.internal_fits(image))
    }

    pub(crate) fn internal_underflow(&self, image: &InternalImage) -> bool {
        dispatch!(self, node => node.internal_underflow(image))
    }

    /// Number of entries the left half keeps when splitting an overfull leaf.
    pub(crate) fn leaf_split_point(&self, image: &LeafImage) -> usize {
        dispatch!(self, node => node.leaf_split_point(image))
    }

    /// Position of the key pushed up when splitting an overfull internal node.
    pub(crate) fn internal_split_point(&self, image: &InternalImage) -> usize {
        dispatch!(self, node => node.internal_split_point(image))
    }

    pub(crate) fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        dispatch!(self, node => node.check_entry(key, value))
    }

    pub(crate) fn reasonable_key_count(&self, kind: NodeKind, count: usize) -> bool {
        dispatch!(self, node => node.reasonable_key_count(kind, count))
    }

    pub(crate) fn max_key_count(&self, kind: NodeKind) -> usize {
        dispatch!(self, node => node.max_key_count(kind))
    }

    pub(crate) fn highest_reasonable_key_count(&self, kind: NodeKind) -> usize {
        dispatch!(self, node => node.highest_reasonable_key_count(kind))
    }

    /// Header/content disagreements; only dynamic nodes carry such metadata.
    pub(crate) fn meta_problem(&self, cursor: &mut PageCursor<'_>, kind: NodeKind) -> Option<String> {
        match self {
            TreeNode::Fixed(_) => None,
            TreeNode::Dynamic(node) => {
                let count = key_count(cursor);
                node.meta_problem(cursor, kind, count)
            }
        }
    }
}

/// Node layout plus key ordering for every node stamped with one schema tag.
#[derive(Clone)]
pub(crate) struct Schema {
    pub(crate) node: TreeNode,
    order: Arc<dyn KeyOrder>,
}

impl Schema {
    pub(crate) fn new(
        node: TreeNode,
        order: Arc<dyn KeyOrder>,
    ) -> Self {
        Self { node, order }
    }

    pub(crate) fn for_layout<L: Layout>(
        layout: &L,
        page_size: usize,
        cap: Option<usize>,
    ) -> Result<Self> {
        let node = TreeNode::new(
            page_size,
            layout.fixed_key_size(),
            layout.fixed_value_size(),
            cap,
        )?;
        Ok(Self::new(node, Arc::new(layout.clone())))
    }

    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.order.compare(a, b)
    }

    /// Position of the child to follow for `key`: the number of keys ≤ `key`.
    pub(crate) fn child_position(&self, keys: &[Vec<u8>], key: &[u8]) -> usize {
        keys.partition_point(|candidate| self.compare(candidate, key) != Ordering::Greater)
    }

    /// Binary search over sorted keys.
    pub(crate) fn search(&self, keys: &[Vec<u8>], key: &[u8]) -> std::result::Result<usize, usize> {
        keys.binary_search_by(|candidate| self.compare(candidate, key))
    }
}
