//! Structural mutations under the writer lock.
//!
//! Nodes written in an earlier generation are never modified in place: the
//! first change in the current generation copies the node to a fresh page and
//! links the old page to the copy through its successor pointer. Entries only
//! ever move rightward between siblings, so a reader scanning right from a
//! stale position still sees every key.

use smallvec::SmallVec;
use tracing::debug;

use super::inner::{NodeRead, TreeInner, WriterState, MAX_DEPTH};
use super::walk;
use crate::primitives::pager::{PageAccess, PageCursor};
use crate::storage::gbptree::gspp;
use crate::storage::gbptree::node::{
    self, Body, InternalImage, NodeKind, PointerType, Schema, SUCCESSOR_OFFSET,
};
use crate::types::{GbpError, PageId, Result};

/// Node visited on the way down and the child position taken from it.
#[derive(Copy, Clone, Debug)]
struct Step {
    id: PageId,
    pos: usize,
}

type Path = SmallVec<[Step; 8]>;

pub(crate) struct Writer<'a> {
    inner: &'a TreeInner,
    w: &'a mut WriterState,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(inner: &'a TreeInner, w: &'a mut WriterState) -> Self {
        Self { inner, w }
    }

    pub(crate) fn stable(&self) -> u64 {
        self.w.state.stable_generation
    }

    pub(crate) fn unstable(&self) -> u64 {
        self.w.state.unstable_generation
    }

    fn schema(&self, tag: u8) -> Result<&'a Schema> {
        let inner: &'a TreeInner = self.inner;
        inner
            .schemas
            .get(tag as usize)
            .ok_or(GbpError::Invalid("unknown schema tag"))
    }

    fn node(&self, id: PageId) -> Result<NodeRead> {
        self.inner.read_node(id, self.stable(), self.unstable())
    }

    fn body(&self, id: PageId) -> Result<Body> {
        Ok(self.node(id)?.body)
    }

    fn internal(&self, id: PageId) -> Result<InternalImage> {
        match self.body(id)? {
            Body::Internal(image) => Ok(image),
            Body::Leaf(_) => Err(GbpError::at_page(id, "expected an internal node")),
        }
    }

    fn with_page<T>(
        &self,
        id: PageId,
        access: PageAccess,
        f: impl FnOnce(&mut PageCursor<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut cursor = self.inner.pages.io(id, access)?;
        if !cursor.next()? {
            return Err(GbpError::at_page(id, "page unavailable"));
        }
        let out = f(&mut cursor)?;
        if cursor.check_and_clear_bounds() {
            return Err(GbpError::at_page(id, "page access out of bounds"));
        }
        Ok(out)
    }

    fn acquire(&mut self) -> Result<PageId> {
        let (stable, unstable) = self.w.generations();
        self.w
            .freelist
            .acquire(&self.inner.pages, stable, unstable, &self.inner.stats)
    }

    fn release(&mut self, id: PageId) -> Result<()> {
        let unstable = self.unstable();
        self.w
            .freelist
            .release(&self.inner.pages, unstable, id, &self.inner.stats)
    }

    fn init_node(&self, id: PageId, kind: NodeKind, tag: u8) -> Result<()> {
        let schema = self.schema(tag)?;
        let unstable = self.unstable();
        self.with_page(id, PageAccess::WriteGrow, |c| {
            schema.node.initialize(c, kind, tag, unstable);
            Ok(())
        })
    }

    fn write_body(&self, tag: u8, id: PageId, body: &Body) -> Result<()> {
        let schema = self.schema(tag)?;
        let unstable = self.unstable();
        self.with_page(id, PageAccess::Write, |c| {
            schema.node.write_body(c, body, unstable);
            Ok(())
        })
    }

    fn set_pointer(&self, tag: u8, id: PageId, which: PointerType, target: PageId) -> Result<()> {
        let schema = self.schema(tag)?;
        let (stable, unstable) = (self.stable(), self.unstable());
        self.with_page(id, PageAccess::Write, |c| {
            schema
                .node
                .write_pointer(c, which, target, stable, unstable)
                .map_err(|failure| node::pointer_error(id, which, failure))
        })
    }

    /// Fresh leaf in the current generation, for a new data tree.
    pub(crate) fn new_leaf(&mut self, tag: u8) -> Result<PageId> {
        let id = self.acquire()?;
        self.init_node(id, NodeKind::Leaf, tag)?;
        Ok(id)
    }

    /// Releases every page of the subtree under `root`.
    pub(crate) fn release_subtree(&mut self, root: PageId) -> Result<usize> {
        let pages = walk::subtree_pages(self.inner, root, self.stable(), self.unstable())?;
        for id in &pages {
            self.release(*id)?;
        }
        Ok(pages.len())
    }

    /// Copies `id` into a page of the current generation and links the old
    /// version and both siblings to the copy. The caller redirects the parent.
    fn copy_on_write(&mut self, tag: u8, id: PageId) -> Result<PageId> {
        let raw = self.with_page(id, PageAccess::Read, |c| Ok(c.read_page()))?;
        let copy = self.acquire()?;
        let unstable = self.unstable();
        self.with_page(copy, PageAccess::WriteGrow, |c| {
            c.write_page(&raw);
            node::set_generation(c, unstable);
            gspp::write_fresh(c, SUCCESSOR_OFFSET, unstable, PageId::NONE);
            Ok(())
        })?;
        self.set_pointer(tag, id, PointerType::Successor, copy)?;
        let written = self.node(copy)?;
        if written.left.id.is_some() {
            self.set_pointer(tag, written.left.id, PointerType::RightSibling, copy)?;
        }
        if written.right.id.is_some() {
            self.set_pointer(tag, written.right.id, PointerType::LeftSibling, copy)?;
        }
        self.inner.stats.inc_successors_created();
        Ok(copy)
    }

    /// Returns a version of `id` writable in the current generation.
    /// `parent` names the path level and child position pointing at `id`;
    /// `None` means `id` is the root.
    fn ensure_unstable(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &Path,
        id: PageId,
        parent: Option<(usize, usize)>,
    ) -> Result<PageId> {
        let generation = self.with_page(id, PageAccess::Read, |c| Ok(node::generation(c)))?;
        if generation == self.unstable() {
            return Ok(id);
        }
        let copy = self.copy_on_write(tag, id)?;
        match parent {
            None => *root = copy,
            Some((level, pos)) => {
                self.set_pointer(tag, path[level].id, PointerType::Child(pos), copy)?
            }
        }
        self.release(id)?;
        Ok(copy)
    }

    fn ensure_path_unstable(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &mut Path,
        level: usize,
    ) -> Result<PageId> {
        let parent = level.checked_sub(1).map(|up| (up, path[up].pos));
        let id = self.ensure_unstable(tag, root, path, path[level].id, parent)?;
        path[level].id = id;
        Ok(id)
    }

    fn descend(&self, tag: u8, root: PageId, key: &[u8]) -> Result<(Path, NodeRead)> {
        let schema = self.schema(tag)?;
        let mut path = Path::new();
        let mut id = root;
        while path.len() < MAX_DEPTH {
            let current = self.node(id)?;
            if current.successor.id.is_some() {
                return Err(GbpError::at_page(id, "reachable node has a successor"));
            }
            match &current.body {
                Body::Internal(image) => {
                    let pos = schema.child_position(&image.keys, key);
                    path.push(Step { id, pos });
                    id = image.children[pos];
                }
                Body::Leaf(_) => {
                    path.push(Step { id, pos: 0 });
                    return Ok((path, current));
                }
            }
        }
        Err(GbpError::Corruption("tree deeper than any valid tree"))
    }

    pub(crate) fn get(&self, tag: u8, root: PageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let schema = self.schema(tag)?;
        let (_, leaf) = self.descend(tag, root, key)?;
        let Body::Leaf(mut image) = leaf.body else {
            return Ok(None);
        };
        Ok(schema
            .search(&image.keys, key)
            .ok()
            .map(|pos| image.values.swap_remove(pos)))
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub(crate) fn put(
        &mut self,
        tag: u8,
        root: &mut PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let schema = self.schema(tag)?;
        schema.node.check_entry(key, value)?;
        let (mut path, leaf) = self.descend(tag, *root, key)?;
        let Body::Leaf(mut image) = leaf.body else {
            return Err(GbpError::Corruption("descent ended on an internal node"));
        };
        let found = schema.search(&image.keys, key);
        if let Ok(pos) = found {
            if image.values[pos] == value {
                return Ok(Some(value.to_vec()));
            }
        }
        let level = path.len() - 1;
        let leaf_id = self.ensure_path_unstable(tag, root, &mut path, level)?;
        match found {
            Ok(pos) => {
                let replaced = self.with_page(leaf_id, PageAccess::Write, |c| {
                    Ok(schema.node.set_value_at(c, pos, value))
                })?;
                let previous = std::mem::replace(&mut image.values[pos], value.to_vec());
                if !replaced {
                    self.store(tag, root, &mut path, level, Body::Leaf(image))?;
                }
                Ok(Some(previous))
            }
            Err(pos) => {
                let count = image.len();
                let inserted = self.with_page(leaf_id, PageAccess::Write, |c| {
                    Ok(schema.node.insert_key_value_at(c, pos, key, value, count))
                })?;
                if !inserted {
                    image.insert(pos, key.to_vec(), value.to_vec());
                    self.store(tag, root, &mut path, level, Body::Leaf(image))?;
                }
                Ok(None)
            }
        }
    }

    /// Removes `key`, returning its value.
    pub(crate) fn remove(
        &mut self,
        tag: u8,
        root: &mut PageId,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let schema = self.schema(tag)?;
        let (mut path, leaf) = self.descend(tag, *root, key)?;
        let Body::Leaf(mut image) = leaf.body else {
            return Err(GbpError::Corruption("descent ended on an internal node"));
        };
        let Ok(pos) = schema.search(&image.keys, key) else {
            return Ok(None);
        };
        let level = path.len() - 1;
        let leaf_id = self.ensure_path_unstable(tag, root, &mut path, level)?;
        let count = image.len();
        self.with_page(leaf_id, PageAccess::Write, |c| {
            schema.node.remove_key_value_at(c, pos, count);
            Ok(())
        })?;
        let (_, value) = image.remove(pos);
        let body = Body::Leaf(image);
        if level > 0 && body.underflow(&schema.node) {
            self.rebalance(tag, root, &mut path, level, body)?;
        }
        Ok(Some(value))
    }

    /// Writes `body` over node `path[level]`, splitting when it overflows.
    fn store(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &mut Path,
        level: usize,
        body: Body,
    ) -> Result<()> {
        let schema = self.schema(tag)?;
        if body.fits(&schema.node) {
            self.write_body(tag, path[level].id, &body)
        } else {
            self.split_node(tag, root, path, level, body)
        }
    }

    fn split_node(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &mut Path,
        level: usize,
        body: Body,
    ) -> Result<()> {
        let schema = self.schema(tag)?;
        let id = path[level].id;
        let current = self.node(id)?;
        let kind = body.kind();
        let (left, separator, right) = body.split(&schema.node);

        let sibling = self.acquire()?;
        self.init_node(sibling, kind, tag)?;
        self.write_body(tag, sibling, &right)?;
        self.set_pointer(tag, sibling, PointerType::RightSibling, current.right.id)?;
        self.set_pointer(tag, sibling, PointerType::LeftSibling, id)?;
        if current.right.id.is_some() {
            self.set_pointer(tag, current.right.id, PointerType::LeftSibling, sibling)?;
        }
        self.write_body(tag, id, &left)?;
        self.set_pointer(tag, id, PointerType::RightSibling, sibling)?;
        match kind {
            NodeKind::Leaf => self.inner.stats.inc_leaf_splits(),
            NodeKind::Internal => self.inner.stats.inc_internal_splits(),
        }
        self.insert_into_parent(tag, root, path, level, separator, sibling)
    }

    fn insert_into_parent(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &mut Path,
        level: usize,
        separator: Vec<u8>,
        sibling: PageId,
    ) -> Result<()> {
        let Some(parent_level) = level.checked_sub(1) else {
            let old_root = path[0].id;
            let new_root = self.acquire()?;
            self.init_node(new_root, NodeKind::Internal, tag)?;
            let image = InternalImage {
                keys: vec![separator],
                children: vec![old_root, sibling],
            };
            self.write_body(tag, new_root, &Body::Internal(image))?;
            *root = new_root;
            self.inner.stats.inc_root_splits();
            debug!(root = new_root.0, "root split");
            return Ok(());
        };
        let schema = self.schema(tag)?;
        let parent = self.ensure_path_unstable(tag, root, path, parent_level)?;
        let pos = path[parent_level].pos;
        let unstable = self.unstable();
        let inserted = self.with_page(parent, PageAccess::Write, |c| {
            let count = node::key_count(c);
            Ok(schema
                .node
                .insert_key_and_right_child_at(c, pos, &separator, sibling, count, unstable))
        })?;
        if inserted {
            return Ok(());
        }
        let mut image = self.internal(parent)?;
        image.keys.insert(pos, separator);
        image.children.insert(pos + 1, sibling);
        self.split_node(tag, root, path, parent_level, Body::Internal(image))
    }

    fn update_parent(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &mut Path,
        level: usize,
        edit: impl FnOnce(&mut InternalImage),
    ) -> Result<()> {
        let id = self.ensure_path_unstable(tag, root, path, level)?;
        let mut image = self.internal(id)?;
        edit(&mut image);
        self.store(tag, root, path, level, Body::Internal(image))
    }

    /// Unlinks `absorbed` after its entries moved into `into`, its right
    /// neighbour.
    fn absorb(&self, tag: u8, absorbed: &NodeRead, into: PageId) -> Result<()> {
        self.set_pointer(tag, into, PointerType::LeftSibling, absorbed.left.id)?;
        if absorbed.left.id.is_some() {
            self.set_pointer(tag, absorbed.left.id, PointerType::RightSibling, into)?;
        }
        self.set_pointer(tag, absorbed.id, PointerType::Successor, into)
    }

    /// Fixes an underfull node at `path[level]`, already writable in this
    /// generation, whose contents are `body`.
    fn rebalance(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &mut Path,
        level: usize,
        body: Body,
    ) -> Result<()> {
        let schema = self.schema(tag)?;
        let parent_level = level - 1;
        let pos = path[parent_level].pos;
        let parent = self.internal(path[parent_level].id)?;
        let id = path[level].id;

        if pos > 0 {
            // Take entries from the left sibling, or fold it in.
            let left_id = parent.children[pos - 1];
            let combined = self
                .body(left_id)?
                .concat(parent.keys[pos - 1].clone(), body)?;
            let (left, separator, right) = combined.clone().split(&schema.node);
            let balanced = [&left, &right]
                .iter()
                .all(|part| part.fits(&schema.node) && !part.underflow(&schema.node));
            if balanced {
                self.write_body(tag, id, &right)?;
                let left_id =
                    self.ensure_unstable(tag, root, path, left_id, Some((parent_level, pos - 1)))?;
                self.write_body(tag, left_id, &left)?;
                self.update_parent(tag, root, path, parent_level, |image| {
                    image.keys[pos - 1] = separator;
                })?;
                self.inner.stats.inc_rebalances();
                return Ok(());
            }
            if combined.fits(&schema.node) {
                let absorbed = self.node(left_id)?;
                self.write_body(tag, id, &combined)?;
                self.absorb(tag, &absorbed, id)?;
                self.update_parent(tag, root, path, parent_level, |image| {
                    image.keys.remove(pos - 1);
                    image.children.remove(pos - 1);
                })?;
                path[parent_level].pos = pos - 1;
                self.release(left_id)?;
                self.inner.stats.inc_merges();
                return self.after_shrink(tag, root, path, parent_level);
            }
            return Ok(());
        }

        if parent.children.len() < 2 {
            return Ok(());
        }
        // Leftmost child: its entries move into the right sibling, which
        // splits again when the union is too large.
        let absorbed = self.node(id)?;
        let right_id =
            self.ensure_unstable(tag, root, path, parent.children[1], Some((parent_level, 1)))?;
        let combined = body.concat(parent.keys[0].clone(), self.body(right_id)?)?;
        if combined.fits(&schema.node) {
            self.write_body(tag, right_id, &combined)?;
            self.absorb(tag, &absorbed, right_id)?;
            self.update_parent(tag, root, path, parent_level, |image| {
                image.keys.remove(0);
                image.children.remove(0);
            })?;
            self.release(id)?;
            self.inner.stats.inc_merges();
            return self.after_shrink(tag, root, path, parent_level);
        }
        let (left, separator, right) = combined.split(&schema.node);
        let right_node = self.node(right_id)?;
        let sibling = self.acquire()?;
        self.init_node(sibling, right.kind(), tag)?;
        self.write_body(tag, sibling, &right)?;
        self.set_pointer(tag, sibling, PointerType::RightSibling, right_node.right.id)?;
        self.set_pointer(tag, sibling, PointerType::LeftSibling, right_id)?;
        if right_node.right.id.is_some() {
            self.set_pointer(tag, right_node.right.id, PointerType::LeftSibling, sibling)?;
        }
        self.write_body(tag, right_id, &left)?;
        self.set_pointer(tag, right_id, PointerType::RightSibling, sibling)?;
        self.absorb(tag, &absorbed, right_id)?;
        self.update_parent(tag, root, path, parent_level, |image| {
            image.keys[0] = separator;
            image.children[0] = right_id;
            image.children[1] = sibling;
        })?;
        self.release(id)?;
        self.inner.stats.inc_rebalances();
        Ok(())
    }

    /// Called after node `path[level]` lost a child.
    fn after_shrink(
        &mut self,
        tag: u8,
        root: &mut PageId,
        path: &mut Path,
        level: usize,
    ) -> Result<()> {
        if level == 0 {
            return self.collapse_root(root);
        }
        let schema = self.schema(tag)?;
        let body = self.body(path[level].id)?;
        if body.underflow(&schema.node) {
            self.rebalance(tag, root, path, level, body)
        } else {
            Ok(())
        }
    }

    fn collapse_root(&mut self, root: &mut PageId) -> Result<()> {
        loop {
            let current = self.node(*root)?;
            match current.body {
                Body::Internal(image) if image.keys.is_empty() => {
                    let old = *root;
                    *root = image.children[0];
                    self.release(old)?;
                    self.inner.stats.inc_root_collapses();
                    debug!(root = root.0, "root collapsed");
                }
                _ => return Ok(()),
            }
        }
    }

    pub(crate) fn put_base(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut root = self.w.state.root_id;
        let result = self.put(0, &mut root, key, value);
        self.inner.set_root(self.w, root);
        result
    }

    pub(crate) fn remove_base(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut root = self.w.state.root_id;
        let result = self.remove(0, &mut root, key);
        self.inner.set_root(self.w, root);
        result
    }

    pub(crate) fn get_base(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get(0, self.w.state.root_id, key)
    }
}
