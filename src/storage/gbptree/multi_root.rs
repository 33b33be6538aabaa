//! Many data trees sharing one file.
//!
//! The base tree of a multi-root file is a registry mapping root keys to the
//! root pointer of each data tree. Registry nodes carry schema tag 0 and data
//! nodes tag 1, so every node decodes with its own layout. Data trees share
//! the file's generations, freelist and checkpoints.

use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use super::gspp::Pointer;
use super::layout::{encode_key, encode_value, Layout};
use super::node::Schema;
use super::options::GbpTreeOptions;
use super::tree::seek::{self, RootSource, SeekCursor};
use super::tree::{collector_for, CleanupWorkCollector, GbpTree, Seek};
use crate::primitives::io::MemFileIo;
use crate::primitives::pager::PagedFile;
use crate::types::{GbpError, PageId, Result};

const DATA_TAG: u8 = 1;
const ROOT_ENTRY_SIZE: usize = 16;

/// Root pointer of one data tree, as stored in the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RootEntry {
    /// Root node id.
    pub id: PageId,
    /// Generation the root pointer was written in.
    pub generation: u64,
}

impl RootEntry {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ROOT_ENTRY_SIZE);
        out.extend_from_slice(&self.id.0.to_be_bytes());
        out.extend_from_slice(&self.generation.to_be_bytes());
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ROOT_ENTRY_SIZE {
            return Err(GbpError::Corruption("root entry is not 16 bytes"));
        }
        let mut id = [0u8; 8];
        let mut generation = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        generation.copy_from_slice(&bytes[8..]);
        Ok(Self {
            id: PageId(u64::from_be_bytes(id)),
            generation: u64::from_be_bytes(generation),
        })
    }

    pub(crate) fn pointer(&self) -> Pointer {
        Pointer {
            id: self.id,
            generation: self.generation,
        }
    }
}

/// Registry layout: root keys encoded by `K`, values are [`RootEntry`].
#[derive(Clone, Debug)]
pub struct RegistryLayout<K: Layout> {
    keys: K,
    data_layout: u64,
}

impl<K: Layout> RegistryLayout<K> {
    /// Registry for root keys `keys` over data trees with layout id `data_layout`.
    pub fn new(keys: K, data_layout: u64) -> Self {
        Self { keys, data_layout }
    }
}

impl<K: Layout> Layout for RegistryLayout<K> {
    type Key = K::Key;
    type Value = RootEntry;

    fn identifier(&self) -> u64 {
        self.keys.identifier().rotate_left(29) ^ self.data_layout ^ u64::from_be_bytes(*b"registry")
    }

    fn fixed_key_size(&self) -> Option<usize> {
        self.keys.fixed_key_size()
    }

    fn fixed_value_size(&self) -> Option<usize> {
        Some(ROOT_ENTRY_SIZE)
    }

    fn encode_key(&self, key: &Self::Key, out: &mut Vec<u8>) {
        self.keys.encode_key(key, out)
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key> {
        self.keys.decode_key(bytes)
    }

    fn encode_value(&self, value: &RootEntry, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.encode())
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<RootEntry> {
        RootEntry::decode(bytes)
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        self.keys.compare_encoded(a, b)
    }
}

/// Any number of independent trees with layout `L`, addressed by root keys
/// with layout `K`.
pub struct MultiRootGbpTree<K: Layout, L: Layout> {
    registry: GbpTree<RegistryLayout<K>>,
    layout: L,
}

impl<K: Layout, L: Layout> MultiRootGbpTree<K, L> {
    /// Opens or creates a multi-root file at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        keys: K,
        layout: L,
        options: GbpTreeOptions,
    ) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();
        if (options.read_only || !options.create_if_missing) && !path.exists() {
            return Err(GbpError::NotFound);
        }
        let pages = if options.read_only {
            PagedFile::open_read_only(path, options.page_size as usize)?
        } else {
            PagedFile::open(path, options.page_size as usize)?
        };
        let collector = collector_for(options.cleanup);
        Self::open_with(pages, keys, layout, options, collector)
    }

    /// Opens or creates a multi-root tree over an in-memory file.
    pub fn in_memory(io: MemFileIo, keys: K, layout: L, options: GbpTreeOptions) -> Result<Self> {
        options.validate()?;
        let pages = PagedFile::map(Arc::new(io), options.page_size as usize, options.read_only)?;
        let collector = collector_for(options.cleanup);
        Self::open_with(pages, keys, layout, options, collector)
    }

    /// Opens over an already mapped file with an explicit cleanup collector.
    pub fn open_with(
        pages: PagedFile,
        keys: K,
        layout: L,
        options: GbpTreeOptions,
        collector: Arc<dyn CleanupWorkCollector>,
    ) -> Result<Self> {
        let data = Schema::for_layout(&layout, pages.page_size(), options.max_key_count)?;
        let registry_layout = RegistryLayout::new(keys, layout.identifier());
        let registry =
            GbpTree::open_schemas(pages, registry_layout, vec![data], options, collector, &[])?;
        Ok(Self { registry, layout })
    }

    /// The registry tree; checkpoint, close and diagnostics go through it.
    pub fn registry(&self) -> &GbpTree<RegistryLayout<K>> {
        &self.registry
    }

    /// Makes every change in every data tree durable.
    pub fn checkpoint(&self) -> Result<()> {
        self.registry.checkpoint()
    }

    /// Checkpoints with the clean flag and closes the file.
    pub fn close(self) -> Result<()> {
        self.registry.close()
    }

    fn encode_root_key(&self, key: &K::Key) -> Vec<u8> {
        encode_key(self.registry.layout(), key)
    }

    /// Creates an empty data tree under `key`.
    pub fn add_root(&self, key: &K::Key) -> Result<()> {
        let root_key = self.encode_root_key(key);
        self.registry.writer()?.mutate(|writer| {
            if writer.get_base(&root_key)?.is_some() {
                return Err(GbpError::RootExists);
            }
            let entry = RootEntry {
                id: writer.new_leaf(DATA_TAG)?,
                generation: writer.unstable(),
            };
            writer.put_base(&root_key, &entry.encode())?;
            Ok(())
        })
    }

    /// Deletes the data tree under `key`, releasing all of its pages.
    pub fn delete_root(&self, key: &K::Key) -> Result<()> {
        let root_key = self.encode_root_key(key);
        self.registry.writer()?.mutate(|writer| {
            let raw = writer.get_base(&root_key)?.ok_or(GbpError::NotFound)?;
            let entry = RootEntry::decode(&raw)?;
            writer.release_subtree(entry.id)?;
            writer.remove_base(&root_key)?;
            Ok(())
        })
    }

    /// Root keys in order.
    pub fn roots(&self) -> Result<Vec<K::Key>> {
        self.registry
            .seek(..)?
            .map(|entry| entry.map(|(key, _)| key))
            .collect()
    }

    /// Handle on the data tree under `key`. Operations fail with
    /// [`GbpError::NotFound`] when no such tree exists.
    pub fn root_at(&self, key: &K::Key) -> RootHandle<'_, K, L> {
        RootHandle {
            tree: self,
            root_key: self.encode_root_key(key),
        }
    }
}

/// One data tree of a [`MultiRootGbpTree`].
pub struct RootHandle<'t, K: Layout, L: Layout> {
    tree: &'t MultiRootGbpTree<K, L>,
    root_key: Vec<u8>,
}

impl<K: Layout, L: Layout> RootHandle<'_, K, L> {
    fn require_root(&self) -> Result<()> {
        seek::registry_lookup(self.tree.registry.core(), &self.root_key)?
            .map(|_| ())
            .ok_or(GbpError::NotFound)
    }

    /// Entries in `range`, in key order.
    pub fn seek<R: RangeBounds<L::Key>>(&self, range: R) -> Result<Seek<L>> {
        self.require_root()?;
        let layout = &self.tree.layout;
        let bound = |bound: Bound<&L::Key>| match bound {
            Bound::Included(key) => Bound::Included(encode_key(layout, key)),
            Bound::Excluded(key) => Bound::Excluded(encode_key(layout, key)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let cursor = SeekCursor::new(
            Arc::clone(self.tree.registry.core()),
            DATA_TAG,
            RootSource::Registry {
                key: self.root_key.clone(),
            },
            bound(range.start_bound()),
            bound(range.end_bound()),
        )?;
        Ok(Seek::new(cursor, layout.clone()))
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        self.seek((Bound::Included(key), Bound::Included(key)))?
            .next()
            .transpose()
            .map(|entry| entry.map(|(_, value)| value))
    }

    /// Inserts or replaces one entry; returns the previous value.
    pub fn put(&self, key: &L::Key, value: &L::Value) -> Result<Option<L::Value>> {
        let layout = &self.tree.layout;
        let key = encode_key(layout, key);
        let value = encode_value(layout, value);
        let previous = self.update(|writer, root| writer.put(DATA_TAG, root, &key, &value))?;
        previous.map(|raw| layout.decode_value(&raw)).transpose()
    }

    /// Removes one entry; returns its value.
    pub fn remove(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let layout = &self.tree.layout;
        let key = encode_key(layout, key);
        let removed = self.update(|writer, root| writer.remove(DATA_TAG, root, &key))?;
        removed.map(|raw| layout.decode_value(&raw)).transpose()
    }

    /// Runs `change` against this data tree and records a moved root in the
    /// registry.
    fn update<T>(
        &self,
        change: impl FnOnce(&mut super::tree::writer::Writer<'_>, &mut PageId) -> Result<T>,
    ) -> Result<T> {
        let root_key = &self.root_key;
        self.tree.registry.writer()?.mutate(|writer| {
            let raw = writer.get_base(root_key)?.ok_or(GbpError::NotFound)?;
            let entry = RootEntry::decode(&raw)?;
            let mut root = entry.id;
            let out = change(writer, &mut root)?;
            if root != entry.id {
                let moved = RootEntry {
                    id: root,
                    generation: writer.unstable(),
                };
                writer.put_base(root_key, &moved.encode())?;
            }
            Ok(out)
        })
    }
}
