use super::{InternalImage, LeafImage, NodeKind, HEADER_SIZE};
use crate::primitives::pager::PageCursor;
use crate::storage::gbptree::gspp::{self, GsppFailure, GSPP_SIZE};
use crate::types::{GbpError, PageId, Result};

/// Node layout for keys and values of constant encoded size.
///
/// Leaf: `keys[slots]` then `values[slots]`. Internal: `keys[slots]` then
/// `children[slots + 1]`. Slot counts come from the page size alone so offsets
/// never depend on the configured entry cap.
#[derive(Clone, Debug)]
pub(crate) struct FixedSizeNode {
    key_size: usize,
    value_size: usize,
    leaf_slots: usize,
    internal_slots: usize,
    leaf_max: usize,
    internal_max: usize,
}

impl FixedSizeNode {
    pub(crate) fn new(
        page_size: usize,
        key_size: usize,
        value_size: usize,
        cap: Option<usize>,
    ) -> Result<Self> {
        if key_size == 0 {
            return Err(GbpError::Config(
                "fixed-size layouts need a non-zero key size".to_string(),
            ));
        }
        let leaf_slots = (page_size - HEADER_SIZE) / (key_size + value_size);
        let internal_slots = (page_size - HEADER_SIZE - GSPP_SIZE) / (key_size + GSPP_SIZE);
        if leaf_slots < 2 || internal_slots < 2 {
            return Err(GbpError::Config(format!(
                "page size {page_size} holds fewer than two entries per node"
            )));
        }
        let cap = cap.unwrap_or(usize::MAX);
        Ok(Self {
            key_size,
            value_size,
            leaf_slots,
            internal_slots,
            leaf_max: leaf_slots.min(cap),
            internal_max: internal_slots.min(cap),
        })
    }

    fn key_offset(&self, pos: usize) -> usize {
        HEADER_SIZE + pos * self.key_size
    }

    fn value_offset(&self, pos: usize) -> usize {
        HEADER_SIZE + self.leaf_slots * self.key_size + pos * self.value_size
    }

    pub(crate) fn child_offset(&self, pos: usize) -> usize {
        HEADER_SIZE + self.internal_slots * self.key_size + pos * GSPP_SIZE
    }

    pub(crate) fn max_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_max,
            NodeKind::Internal => self.internal_max,
        }
    }

    pub(crate) fn min_key_count(&self, kind: NodeKind) -> usize {
        self.max_key_count(kind) / 2
    }

    pub(crate) fn highest_reasonable_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_slots,
            NodeKind::Internal => self.internal_slots,
        }
    }

    pub(crate) fn reasonable_key_count(&self, kind: NodeKind, count: usize) -> bool {
        count <= self.highest_reasonable_key_count(kind)
    }

    pub(crate) fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() != self.key_size || value.len() != self.value_size {
            return Err(GbpError::Invalid(
                "encoded entry does not match the fixed layout sizes",
            ));
        }
        Ok(())
    }

    pub(crate) fn key_at(&self, cursor: &mut PageCursor<'_>, pos: usize) -> Vec<u8> {
        let mut key = vec![0u8; self.key_size];
        cursor.get_bytes_at(self.key_offset(pos), &mut key);
        key
    }

    pub(crate) fn value_at(&self, cursor: &mut PageCursor<'_>, pos: usize) -> Vec<u8> {
        let mut value = vec![0u8; self.value_size];
        cursor.get_bytes_at(self.value_offset(pos), &mut value);
        value
    }

    pub(crate) fn set_key_at(&self, cursor: &mut PageCursor<'_>, pos: usize, key: &[u8]) -> bool {
        cursor.put_bytes_at(self.key_offset(pos), key);
        true
    }

    pub(crate) fn set_value_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        value: &[u8],
    ) -> bool {
        cursor.put_bytes_at(self.value_offset(pos), value);
        true
    }

    pub(crate) fn insert_key_value_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        key: &[u8],
        value: &[u8],
        count: usize,
    ) -> bool {
        if count >= self.leaf_max {
            return false;
        }
        let tail = count - pos;
        cursor.copy_within(
            self.key_offset(pos),
            self.key_offset(pos + 1),
            tail * self.key_size,
        );
        cursor.copy_within(
            self.value_offset(pos),
            self.value_offset(pos + 1),
            tail * self.value_size,
        );
        cursor.put_bytes_at(self.key_offset(pos), key);
        cursor.put_bytes_at(self.value_offset(pos), value);
        true
    }

    pub(crate) fn remove_key_value_at(&self, cursor: &mut PageCursor<'_>, pos: usize, count: usize) {
        let tail = count - pos - 1;
        cursor.copy_within(
            self.key_offset(pos + 1),
            self.key_offset(pos),
            tail * self.key_size,
        );
        cursor.copy_within(
            self.value_offset(pos + 1),
            self.value_offset(pos),
            tail * self.value_size,
        );
    }

    pub(crate) fn insert_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        key: &[u8],
        child: PageId,
        count: usize,
        unstable: u64,
    ) -> bool {
        if count >= self.internal_max {
            return false;
        }
        let tail = count - pos;
        cursor.copy_within(
            self.key_offset(pos),
            self.key_offset(pos + 1),
            tail * self.key_size,
        );
        cursor.copy_within(
            self.child_offset(pos + 1),
            self.child_offset(pos + 2),
            tail * GSPP_SIZE,
        );
        cursor.put_bytes_at(self.key_offset(pos), key);
        gspp::write_fresh(cursor, self.child_offset(pos + 1), unstable, child);
        true
    }

    pub(crate) fn remove_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        count: usize,
    ) {
        let tail = count - pos - 1;
        cursor.copy_within(
            self.key_offset(pos + 1),
            self.key_offset(pos),
            tail * self.key_size,
        );
        cursor.copy_within(
            self.child_offset(pos + 2),
            self.child_offset(pos + 1),
            tail * GSPP_SIZE,
        );
    }

    pub(crate) fn read_leaf(&self, cursor: &mut PageCursor<'_>, count: usize) -> LeafImage {
        let count = count.min(self.leaf_slots);
        let mut image = LeafImage::with_capacity(count);
        for pos in 0..count {
            image.keys.push(self.key_at(cursor, pos));
            image.values.push(self.value_at(cursor, pos));
        }
        image
    }

    pub(crate) fn write_leaf(&self, cursor: &mut PageCursor<'_>, image: &LeafImage) {
        for (pos, (key, value)) in image.keys.iter().zip(&image.values).enumerate() {
            cursor.put_bytes_at(self.key_offset(pos), key);
            cursor.put_bytes_at(self.value_offset(pos), value);
        }
    }

    pub(crate) fn read_internal(
        &self,
        cursor: &mut PageCursor<'_>,
        count: usize,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<InternalImage, (usize, GsppFailure)> {
        let count = count.min(self.internal_slots);
        let mut image = InternalImage::with_capacity(count);
        for pos in 0..count {
            image.keys.push(self.key_at(cursor, pos));
        }
        for pos in 0..=count {
            let child = gspp::read(cursor, self.child_offset(pos), stable, unstable)
                .map_err(|failure| (pos, failure))?;
            image.children.push(child.id);
        }
        Ok(image)
    }

    pub(crate) fn write_internal(
        &self,
        cursor: &mut PageCursor<'_>,
        image: &InternalImage,
        unstable: u64,
    ) {
        for (pos, key) in image.keys.iter().enumerate() {
            cursor.put_bytes_at(self.key_offset(pos), key);
        }
        for (pos, child) in image.children.iter().enumerate() {
            gspp::write_fresh(cursor, self.child_offset(pos), unstable, *child);
        }
    }

    pub(crate) fn leaf_fits(&self, image: &LeafImage) -> bool {
        image.len() <= self.leaf_max
    }

    pub(crate) fn leaf_underflow(&self, image: &LeafImage) -> bool {
        image.len() < self.min_key_count(NodeKind::Leaf)
    }

    pub(crate) fn internal_fits(&self, image: &InternalImage) -> bool {
        image.keys.len() <= self.internal_max
    }

    pub(crate) fn internal_underflow(&self, image: &InternalImage) -> bool {
        image.keys.len() < self.min_key_count(NodeKind::Internal)
    }

    pub(crate) fn leaf_split_point(&self, image: &LeafImage) -> usize {
        (image.len() + 1) / 2
    }

    pub(crate) fn internal_split_point(&self, image: &InternalImage) -> usize {
        image.keys.len() / 2
    }
}
