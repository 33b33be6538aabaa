use super::{InternalImage, LeafImage, NodeKind, HEADER_SIZE};
use crate::primitives::pager::PageCursor;
use crate::storage::gbptree::gspp::{self, GsppFailure, GSPP_SIZE};
use crate::types::{GbpError, PageId, Result};

const ALLOC_OFFSET: usize = HEADER_SIZE;
const DEAD_SPACE: usize = HEADER_SIZE + 2;
const LEAF_OFFSETS: usize = HEADER_SIZE + 4;
const CHILD_ZERO: usize = HEADER_SIZE + 4;
const INTERNAL_SLOTS: usize = CHILD_ZERO + GSPP_SIZE;
const OFFSET_SIZE: usize = 2;
const INTERNAL_SLOT_SIZE: usize = OFFSET_SIZE + GSPP_SIZE;
const LEAF_BLOB_HEADER: usize = 4;
const INTERNAL_BLOB_HEADER: usize = 2;
const DEAD_FLAG: u16 = 0x8000;
const LENGTH_MASK: u16 = 0x7FFF;

/// Node layout for variable-size keys and values.
///
/// Fixed-width slots grow upward from the header while key and value blobs
/// are allocated downward from the end of the page. Removing an entry only
/// marks its blob dead; the space returns on [`DynamicSizeNode::defragment`].
#[derive(Clone, Debug)]
pub(crate) struct DynamicSizeNode {
    page_size: usize,
}

impl DynamicSizeNode {
    pub(crate) fn new(page_size: usize) -> Result<Self> {
        let node = Self { page_size };
        if node.internal_capacity() / 4 <= INTERNAL_SLOT_SIZE + INTERNAL_BLOB_HEADER {
            return Err(GbpError::Config(format!(
                "page size {page_size} is too small for dynamic-size nodes"
            )));
        }
        Ok(node)
    }

    fn leaf_capacity(&self) -> usize {
        self.page_size - LEAF_OFFSETS
    }

    fn internal_capacity(&self) -> usize {
        self.page_size - INTERNAL_SLOTS
    }

    fn leaf_cost(key: &[u8], value: &[u8]) -> usize {
        OFFSET_SIZE + LEAF_BLOB_HEADER + key.len() + value.len()
    }

    fn internal_cost(key: &[u8]) -> usize {
        INTERNAL_SLOT_SIZE + INTERNAL_BLOB_HEADER + key.len()
    }

    fn slot_offset(kind: NodeKind, pos: usize) -> usize {
        match kind {
            NodeKind::Leaf => LEAF_OFFSETS + pos * OFFSET_SIZE,
            NodeKind::Internal => INTERNAL_SLOTS + pos * INTERNAL_SLOT_SIZE,
        }
    }

    fn blob_header(kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => LEAF_BLOB_HEADER,
            NodeKind::Internal => INTERNAL_BLOB_HEADER,
        }
    }

    pub(crate) fn child_offset(&self, pos: usize) -> usize {
        if pos == 0 {
            CHILD_ZERO
        } else {
            Self::slot_offset(NodeKind::Internal, pos - 1) + OFFSET_SIZE
        }
    }

    pub(crate) fn alloc_offset(&self, cursor: &mut PageCursor<'_>) -> usize {
        cursor.get_u16_at(ALLOC_OFFSET) as usize
    }

    pub(crate) fn set_alloc_offset(&self, cursor: &mut PageCursor<'_>, offset: usize) {
        cursor.put_u16_at(ALLOC_OFFSET, offset as u16);
    }

    pub(crate) fn dead_space(&self, cursor: &mut PageCursor<'_>) -> usize {
        cursor.get_u16_at(DEAD_SPACE) as usize
    }

    pub(crate) fn set_dead_space(&self, cursor: &mut PageCursor<'_>, dead: usize) {
        cursor.put_u16_at(DEAD_SPACE, dead as u16);
    }

    /// First byte past the slot array for `count` entries.
    pub(crate) fn slots_end(&self, kind: NodeKind, count: usize) -> usize {
        Self::slot_offset(kind, count)
    }

    pub(crate) fn initialize(&self, cursor: &mut PageCursor<'_>) {
        self.set_alloc_offset(cursor, self.page_size);
        self.set_dead_space(cursor, 0);
    }

    pub(crate) fn max_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_capacity() / (OFFSET_SIZE + LEAF_BLOB_HEADER),
            NodeKind::Internal => {
                self.internal_capacity() / (INTERNAL_SLOT_SIZE + INTERNAL_BLOB_HEADER)
            }
        }
    }

    pub(crate) fn highest_reasonable_key_count(&self, kind: NodeKind) -> usize {
        self.max_key_count(kind)
    }

    pub(crate) fn reasonable_key_count(&self, kind: NodeKind, count: usize) -> bool {
        count <= self.highest_reasonable_key_count(kind)
    }

    pub(crate) fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let leaf_limit = self.leaf_capacity() / 4;
        if Self::leaf_cost(key, value) > leaf_limit {
            return Err(GbpError::EntryTooLarge {
                size: key.len() + value.len(),
                limit: leaf_limit - OFFSET_SIZE - LEAF_BLOB_HEADER,
            });
        }
        let internal_limit = self.internal_capacity() / 4;
        if Self::internal_cost(key) > internal_limit {
            return Err(GbpError::EntryTooLarge {
                size: key.len(),
                limit: internal_limit - INTERNAL_SLOT_SIZE - INTERNAL_BLOB_HEADER,
            });
        }
        Ok(())
    }

    fn blob_at(&self, cursor: &mut PageCursor<'_>, kind: NodeKind, pos: usize) -> usize {
        cursor.get_u16_at(Self::slot_offset(kind, pos)) as usize
    }

    fn blob_size(&self, cursor: &mut PageCursor<'_>, kind: NodeKind, blob: usize) -> usize {
        let key_len = (cursor.get_u16_at(blob) & LENGTH_MASK) as usize;
        match kind {
            NodeKind::Leaf => LEAF_BLOB_HEADER + key_len + cursor.get_u16_at(blob + 2) as usize,
            NodeKind::Internal => INTERNAL_BLOB_HEADER + key_len,
        }
    }

    pub(crate) fn key_at(&self, cursor: &mut PageCursor<'_>, kind: NodeKind, pos: usize) -> Vec<u8> {
        let blob = self.blob_at(cursor, kind, pos);
        let key_len = (cursor.get_u16_at(blob) & LENGTH_MASK) as usize;
        let mut key = vec![0u8; key_len];
        cursor.get_bytes_at(blob + Self::blob_header(kind), &mut key);
        key
    }

    pub(crate) fn value_at(&self, cursor: &mut PageCursor<'_>, pos: usize) -> Vec<u8> {
        let blob = self.blob_at(cursor, NodeKind::Leaf, pos);
        let key_len = (cursor.get_u16_at(blob) & LENGTH_MASK) as usize;
        let value_len = cursor.get_u16_at(blob + 2) as usize;
        let mut value = vec![0u8; value_len];
        cursor.get_bytes_at(blob + LEAF_BLOB_HEADER + key_len, &mut value);
        value
    }

    /// Overwrites a key in place when the new key has the same length.
    pub(crate) fn set_key_at(
        &self,
        cursor: &mut PageCursor<'_>,
        kind: NodeKind,
        pos: usize,
        key: &[u8],
    ) -> bool {
        let blob = self.blob_at(cursor, kind, pos);
        let key_len = (cursor.get_u16_at(blob) & LENGTH_MASK) as usize;
        if key_len != key.len() {
            return false;
        }
        cursor.put_bytes_at(blob + Self::blob_header(kind), key);
        true
    }

    /// Overwrites a value in place when the new value has the same length.
    pub(crate) fn set_value_at(&self, cursor: &mut PageCursor<'_>, pos: usize, value: &[u8]) -> bool {
        let blob = self.blob_at(cursor, NodeKind::Leaf, pos);
        let key_len = (cursor.get_u16_at(blob) & LENGTH_MASK) as usize;
        if cursor.get_u16_at(blob + 2) as usize != value.len() {
            return false;
        }
        cursor.put_bytes_at(blob + LEAF_BLOB_HEADER + key_len, value);
        true
    }

    /// Reserves `size` blob bytes for an entry being added to a node holding
    /// `count` entries, compacting first when only dead space would make room.
    fn allocate(
        &self,
        cursor: &mut PageCursor<'_>,
        kind: NodeKind,
        count: usize,
        size: usize,
    ) -> Option<usize> {
        let slots_end = self.slots_end(kind, count + 1);
        let mut alloc = self.alloc_offset(cursor);
        if alloc < slots_end + size {
            let dead = self.dead_space(cursor);
            if alloc + dead < slots_end + size {
                return None;
            }
            self.defragment(cursor, kind, count);
            alloc = self.alloc_offset(cursor);
            if alloc < slots_end + size {
                return None;
            }
        }
        let blob = alloc - size;
        self.set_alloc_offset(cursor, blob);
        Some(blob)
    }

    fn kill_blob(&self, cursor: &mut PageCursor<'_>, kind: NodeKind, pos: usize) {
        let blob = self.blob_at(cursor, kind, pos);
        let size = self.blob_size(cursor, kind, blob);
        let raw = cursor.get_u16_at(blob);
        cursor.put_u16_at(blob, raw | DEAD_FLAG);
        let dead = self.dead_space(cursor);
        self.set_dead_space(cursor, dead + size);
    }

    pub(crate) fn insert_key_value_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        key: &[u8],
        value: &[u8],
        count: usize,
    ) -> bool {
        let size = LEAF_BLOB_HEADER + key.len() + value.len();
        let Some(blob) = self.allocate(cursor, NodeKind::Leaf, count, size) else {
            return false;
        };
        cursor.put_u16_at(blob, key.len() as u16);
        cursor.put_u16_at(blob + 2, value.len() as u16);
        cursor.put_bytes_at(blob + LEAF_BLOB_HEADER, key);
        cursor.put_bytes_at(blob + LEAF_BLOB_HEADER + key.len(), value);
        cursor.copy_within(
            Self::slot_offset(NodeKind::Leaf, pos),
            Self::slot_offset(NodeKind::Leaf, pos + 1),
            (count - pos) * OFFSET_SIZE,
        );
        cursor.put_u16_at(Self::slot_offset(NodeKind::Leaf, pos), blob as u16);
        true
    }

    pub(crate) fn remove_key_value_at(&self, cursor: &mut PageCursor<'_>, pos: usize, count: usize) {
        self.kill_blob(cursor, NodeKind::Leaf, pos);
        cursor.copy_within(
            Self::slot_offset(NodeKind::Leaf, pos + 1),
            Self::slot_offset(NodeKind::Leaf, pos),
            (count - pos - 1) * OFFSET_SIZE,
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
        let size = INTERNAL_BLOB_HEADER + key.len();
        let Some(blob) = self.allocate(cursor, NodeKind::Internal, count, size) else {
            return false;
        };
        cursor.put_u16_at(blob, key.len() as u16);
        cursor.put_bytes_at(blob + INTERNAL_BLOB_HEADER, key);
        cursor.copy_within(
            Self::slot_offset(NodeKind::Internal, pos),
            Self::slot_offset(NodeKind::Internal, pos + 1),
            (count - pos) * INTERNAL_SLOT_SIZE,
        );
        let slot = Self::slot_offset(NodeKind::Internal, pos);
        cursor.put_u16_at(slot, blob as u16);
        gspp::write_fresh(cursor, slot + OFFSET_SIZE, unstable, child);
        true
    }

    pub(crate) fn remove_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor<'_>,
        pos: usize,
        count: usize,
    ) {
        self.kill_blob(cursor, NodeKind::Internal, pos);
        cursor.copy_within(
            Self::slot_offset(NodeKind::Internal, pos + 1),
            Self::slot_offset(NodeKind::Internal, pos),
            (count - pos - 1) * INTERNAL_SLOT_SIZE,
        );
    }

    /// Compacts live blobs against the end of the page and clears dead space.
    pub(crate) fn defragment(&self, cursor: &mut PageCursor<'_>, kind: NodeKind, count: usize) {
        let mut blobs = Vec::with_capacity(count);
        for pos in 0..count {
            let blob = self.blob_at(cursor, kind, pos);
            let mut bytes = vec![0u8; self.blob_size(cursor, kind, blob)];
            cursor.get_bytes_at(blob, &mut bytes);
            blobs.push(bytes);
        }
        let mut alloc = self.page_size;
        for (pos, bytes) in blobs.iter().enumerate() {
            alloc -= bytes.len();
            cursor.put_bytes_at(alloc, bytes);
            cursor.put_u16_at(Self::slot_offset(kind, pos), alloc as u16);
        }
        self.set_alloc_offset(cursor, alloc);
        self.set_dead_space(cursor, 0);
    }

    pub(crate) fn read_leaf(&self, cursor: &mut PageCursor<'_>, count: usize) -> LeafImage {
        let count = count.min(self.max_key_count(NodeKind::Leaf));
        let mut image = LeafImage::with_capacity(count);
        for pos in 0..count {
            image.keys.push(self.key_at(cursor, NodeKind::Leaf, pos));
            image.values.push(self.value_at(cursor, pos));
        }
        image
    }

    pub(crate) fn write_leaf(&self, cursor: &mut PageCursor<'_>, image: &LeafImage) {
        let mut alloc = self.page_size;
        for (pos, (key, value)) in image.keys.iter().zip(&image.values).enumerate() {
            alloc -= LEAF_BLOB_HEADER + key.len() + value.len();
            cursor.put_u16_at(alloc, key.len() as u16);
            cursor.put_u16_at(alloc + 2, value.len() as u16);
            cursor.put_bytes_at(alloc + LEAF_BLOB_HEADER, key);
            cursor.put_bytes_at(alloc + LEAF_BLOB_HEADER + key.len(), value);
            cursor.put_u16_at(Self::slot_offset(NodeKind::Leaf, pos), alloc as u16);
        }
        self.set_alloc_offset(cursor, alloc);
        self.set_dead_space(cursor, 0);
    }

    pub(crate) fn read_internal(
        &self,
        cursor: &mut PageCursor<'_>,
        count: usize,
        stable: u64,
        unstable: u64,
    ) -> std::result::Result<InternalImage, (usize, GsppFailure)> {
        let count = count.min(self.max_key_count(NodeKind::Internal));
        let mut image = InternalImage::with_capacity(count);
        for pos in 0..count {
            image.keys.push(self.key_at(cursor, NodeKind::Internal, pos));
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
        let mut alloc = self.page_size;
        if let Some(first) = image.children.first() {
            gspp::write_fresh(cursor, CHILD_ZERO, unstable, *first);
        }
        for (pos, (key, child)) in image
            .keys
            .iter()
            .zip(image.children.get(1..).unwrap_or_default())
            .enumerate() {
            alloc -= INTERNAL_BLOB_HEADER + key.len();
            cursor.put_u16_at(alloc, key.len() as u16);
            cursor.put_bytes_at(alloc + INTERNAL_BLOB_HEADER, key);
            let slot = Self::slot_offset(NodeKind::Internal, pos);
            cursor.put_u16_at(slot, alloc as u16);
            gspp::write_fresh(cursor, slot + OFFSET_SIZE, unstable, *child);
        }
        self.set_alloc_offset(cursor, alloc);
        self.set_dead_space(cursor, 0);
    }

    fn leaf_used(image: &LeafImage) -> usize {
        image
            .keys
            .iter()
            .zip(&image.values)
            .map(|(k, v)| Self::leaf_cost(k, v))
            .sum()
    }

    fn internal_used(image: &InternalImage) -> usize {
        image.keys.iter().map(|k| Self::internal_cost(k)).sum()
    }

    pub(crate) fn leaf_fits(&self, image: &LeafImage) -> bool {
        Self::leaf_used(image) <= self.leaf_capacity()
    }

    pub(crate) fn leaf_underflow(&self, image: &LeafImage) -> bool {
        Self::leaf_used(image) < self.leaf_capacity() / 4
    }

    pub(crate) fn internal_fits(&self, image: &InternalImage) -> bool {
        Self::internal_used(image) <= self.internal_capacity()
    }

    pub(crate) fn internal_underflow(&self, image: &InternalImage) -> bool {
        Self::internal_used(image) < self.internal_capacity() / 4
    }

    pub(crate) fn leaf_split_point(&self, image: &LeafImage) -> usize {
        let costs: Vec<usize> = image
            .keys
            .iter()
            .zip(&image.values)
            .map(|(k, v)| Self::leaf_cost(k, v))
            .collect();
        let split = byte_midpoint(&costs) + 1;
        split.clamp(1, image.len().saturating_sub(1).max(1))
    }

    pub(crate) fn internal_split_point(&self, image: &InternalImage) -> usize {
        let count = image.keys.len();
        if count < 3 {
            return count / 2;
        }
        let costs: Vec<usize> = image.keys.iter().map(|k| Self::internal_cost(k)).collect();
        byte_midpoint(&costs).clamp(1, count - 2)
    }

    /// Describes the first disagreement between the header fields and the
    /// blobs actually present between the allocation offset and the page end.
    pub(crate) fn meta_problem(
        &self,
        cursor: &mut PageCursor<'_>,
        kind: NodeKind,
        count: usize,
    ) -> Option<String> {
        let alloc = self.alloc_offset(cursor);
        let dead = self.dead_space(cursor);
        let slots_end = self.slots_end(kind, count);
        if alloc < slots_end || alloc > self.page_size {
            return Some(format!(
                "alloc offset {alloc} outside [{slots_end}, {}]",
                self.page_size
            ));
        }
        let mut live = Vec::new();
        let mut dead_total = 0usize;
        let mut offset = alloc;
        while offset < self.page_size {
            let raw = cursor.get_u16_at(offset);
            let size = self.blob_size(cursor, kind, offset);
            if offset + size > self.page_size {
                return Some(format!("blob at {offset} of {size} bytes overruns the page"));
            }
            if raw & DEAD_FLAG != 0 {
                dead_total += size;
            } else {
                live.push(offset);
            }
            offset += size;
        }
        if live.len() != count {
            return Some(format!(
                "{} live blobs but key count {count}",
                live.len()
            ));
        }
        if dead_total != dead {
            return Some(format!(
                "dead space {dead} but dead blobs total {dead_total}"
            ));
        }
        for pos in 0..count {
            let blob = self.blob_at(cursor, kind, pos);
            if !live.contains(&blob) {
                return Some(format!(
                    "slot {pos} points at {blob}, which is not a live blob"
                ));
            }
        }
        None
    }
}

/// Index of the first entry at which the running total reaches half of all bytes.
fn byte_midpoint(costs: &[usize]) -> usize {
    let total: usize = costs.iter().sum();
    let mut running = 0usize;
    for (idx, cost) in costs.iter().enumerate() {
        running += cost;
        if running * 2 >= total {
            return idx;
        }
    }
    costs.len().saturating_sub(1)
}
