//! Lock-free range seeks.
//!
//! A seeker never blocks the writer. It reads each node optimistically and
//! validates what it saw against the generations of the pointer it followed;
//! any sign that the structure moved underneath (a node newer than its
//! pointer, a sibling that does not point back, a page that no longer decodes)
//! sends it back to the root, resuming after the last key it returned. A page
//! that fails to decode twice under the same generations is corrupt, not
//! moving, and the seek fails with the page's error.
//!
//! Entries only move rightward between siblings. A backward seek stepping
//! left therefore rereads the node it came from and restarts when that node
//! gained keys or a new left neighbour in the meantime.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use super::inner::{NodeRead, TreeInner, MAX_DEPTH};
use crate::storage::gbptree::gspp::Pointer;
use crate::storage::gbptree::multi_root::RootEntry;
use crate::storage::gbptree::node::{Body, NodeKind, Schema};
use crate::types::{ErrorKind, GbpError, PageId, Result};

/// Restarts tolerated without returning a new key.
const MAX_RESTARTS: u32 = 10_000;

/// Where a seek finds the root of the tree it scans.
#[derive(Clone, Debug)]
pub(crate) enum RootSource {
    /// The tree rooted in the tree state.
    Base,
    /// A data tree whose root is stored in the registry under `key`.
    Registry { key: Vec<u8> },
}

enum Position {
    Descend,
    Sibling {
        pointer: Pointer,
        prev: PageId,
        /// First key of `prev` when it was read; backward seeks only.
        anchor: Option<Vec<u8>>,
        stable: u64,
        unstable: u64,
    },
}

enum Visit {
    Leaf(NodeRead, u64, u64),
    Restart,
    Missing,
}

/// A page that did not decode, and the generations it was read under.
struct Failure {
    page: PageId,
    stable: u64,
    unstable: u64,
}

pub(crate) struct SeekCursor {
    inner: Arc<TreeInner>,
    tag: u8,
    source: RootSource,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    last: Option<Vec<u8>>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    position: Position,
    finished: bool,
    forward: bool,
    restarts: u32,
    failure: Option<Failure>,
}

impl SeekCursor {
    pub(crate) fn new(
        inner: Arc<TreeInner>,
        tag: u8,
        source: RootSource,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> Result<Self> {
        inner.check_readable()?;
        if inner.schemas.get(tag as usize).is_none() {
            return Err(GbpError::Invalid("unknown schema tag"));
        }
        inner.stats.inc_seeks();
        Ok(Self {
            inner,
            tag,
            source,
            lower,
            upper,
            last: None,
            buffer: VecDeque::new(),
            position: Position::Descend,
            finished: false,
            forward: true,
            restarts: 0,
            failure: None,
        })
    }

    /// Returns entries from the upper bound down to the lower bound.
    pub(crate) fn backward(mut self) -> Self {
        self.forward = false;
        self
    }

    /// Key the next descent aims for. `None` means the leftmost leaf going
    /// forward and the rightmost going backward.
    fn target(&self) -> Option<Vec<u8>> {
        let start = if self.forward { &self.lower } else { &self.upper };
        match (&self.last, start) {
            (Some(last), _) => Some(last.clone()),
            (None, Bound::Included(key) | Bound::Excluded(key)) => Some(key.clone()),
            (None, Bound::Unbounded) => None,
        }
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.finished {
            let visit = match std::mem::replace(&mut self.position, Position::Descend) {
                Position::Descend => self.descend()?,
                Position::Sibling {
                    pointer,
                    prev,
                    anchor,
                    stable,
                    unstable,
                } => self.sibling(pointer, prev, anchor, stable, unstable)?,
            };
            match visit {
                Visit::Leaf(node, stable, unstable) => self.consume(node, stable, unstable),
                Visit::Restart => {
                    self.restarts += 1;
                    self.inner.stats.inc_seek_restarts();
                    if self.restarts > MAX_RESTARTS {
                        return Err(GbpError::Corruption("seek restarted without progress"));
                    }
                }
                Visit::Missing => self.finished = true,
            }
        }
        Ok(())
    }

    fn root(&self) -> Result<Option<(Pointer, u64, u64)>> {
        let view = self.inner.view();
        match &self.source {
            RootSource::Base => Ok(Some((view.root, view.stable, view.unstable))),
            RootSource::Registry { key } => {
                Ok(registry_lookup(&self.inner, key)?.map(|root| (root, view.stable, view.unstable)))
            }
        }
    }

    fn descend(&mut self) -> Result<Visit> {
        let Some((mut pointer, stable, unstable)) = self.root()? else {
            return Ok(Visit::Missing);
        };
        let inner = Arc::clone(&self.inner);
        let schema = &inner.schemas[self.tag as usize];
        let target = self.target();
        for _ in 0..MAX_DEPTH {
            let Some(node) = self.read(pointer, stable, unstable)? else {
                return Ok(Visit::Restart);
            };
            let Body::Internal(image) = &node.body else {
                return Ok(Visit::Leaf(node, stable, unstable));
            };
            let pos = match target.as_deref() {
                Some(key) => schema.child_position(&image.keys, key),
                None if self.forward => 0,
                None => image.keys.len(),
            };
            let (Some(&id), Some(&generation)) =
                (image.children.get(pos), node.child_generations.get(pos))
            else {
                return Ok(Visit::Restart);
            };
            pointer = Pointer { id, generation };
        }
        Ok(Visit::Restart)
    }

    fn sibling(
        &mut self,
        pointer: Pointer,
        prev: PageId,
        anchor: Option<Vec<u8>>,
        stable: u64,
        unstable: u64,
    ) -> Result<Visit> {
        let Some(node) = self.read(pointer, stable, unstable)? else {
            return Ok(Visit::Restart);
        };
        let back = if self.forward { node.left.id } else { node.right.id };
        if node.kind != NodeKind::Leaf || back != prev {
            return Ok(Visit::Restart);
        }
        if !self.forward && !self.unchanged(prev, node.id, anchor, stable, unstable)? {
            return Ok(Visit::Restart);
        }
        Ok(Visit::Leaf(node, stable, unstable))
    }

    /// True when `prev` still has `left` as its left sibling and still starts
    /// with `anchor`, so no entries moved into it from the left.
    fn unchanged(
        &self,
        prev: PageId,
        left: PageId,
        anchor: Option<Vec<u8>>,
        stable: u64,
        unstable: u64,
    ) -> Result<bool> {
        let node = match self.inner.read_node(prev, stable, unstable) {
            Ok(node) => node,
            Err(err) if err.kind() == ErrorKind::Corruption => return Ok(false),
            Err(err) => return Err(err),
        };
        if node.successor.id.is_some() || node.left.id != left {
            return Ok(false);
        }
        let Body::Leaf(image) = node.body else {
            return Ok(false);
        };
        Ok(image.keys.first() == anchor.as_ref())
    }

    /// Reads the node `pointer` leads to, following successors. `None` means
    /// the structure changed and the seek must restart.
    fn read(
        &mut self,
        mut pointer: Pointer,
        stable: u64,
        unstable: u64,
    ) -> Result<Option<NodeRead>> {
        for _ in 0..MAX_DEPTH {
            if !pointer.id.is_some() {
                return Ok(None);
            }
            let node = match self.inner.read_node(pointer.id, stable, unstable) {
                Ok(node) => node,
                Err(err) if err.kind() == ErrorKind::Corruption => {
                    let repeated = self.failure.as_ref().is_some_and(|failure| {
                        failure.page == pointer.id
                            && failure.stable == stable
                            && failure.unstable == unstable
                    });
                    if repeated {
                        return Err(err);
                    }
                    self.failure = Some(Failure {
                        page: pointer.id,
                        stable,
                        unstable,
                    });
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            if node.generation > pointer.generation || node.tag != self.tag {
                return Ok(None);
            }
            if node.successor.id.is_some() {
                pointer = node.successor;
                continue;
            }
            return Ok(Some(node));
        }
        Ok(None)
    }

    fn consume(&mut self, node: NodeRead, stable: u64, unstable: u64) {
        let Body::Leaf(image) = node.body else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let schema = &inner.schemas[self.tag as usize];
        let anchor = image.keys.first().cloned();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> =
            image.keys.into_iter().zip(image.values).collect();
        if !self.forward {
            entries.reverse();
        }
        let passed = if self.forward {
            Ordering::Greater
        } else {
            Ordering::Less
        };
        let mut progressed = false;
        for (key, value) in entries {
            if let Some(last) = &self.last {
                if schema.compare(&key, last) != passed {
                    continue;
                }
            }
            let below = !above_lower(schema, &self.lower, &key);
            let above = beyond_upper(schema, &self.upper, &key);
            let (before, after) = if self.forward {
                (below, above)
            } else {
                (above, below)
            };
            if before {
                continue;
            }
            if after {
                self.finished = true;
                break;
            }
            self.last = Some(key.clone());
            self.buffer.push_back((key, value));
            progressed = true;
        }
        if progressed {
            self.restarts = 0;
            self.failure = None;
        }
        if self.finished {
            return;
        }
        let next = if self.forward { node.right } else { node.left };
        if next.id.is_some() {
            self.position = Position::Sibling {
                pointer: next,
                prev: node.id,
                anchor: if self.forward { None } else { anchor },
                stable,
                unstable,
            };
        } else {
            self.finished = true;
        }
    }
}

pub(crate) fn above_lower(schema: &Schema, bound: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match bound {
        Bound::Unbounded => true,
        Bound::Included(lower) => schema.compare(key, lower) != Ordering::Less,
        Bound::Excluded(lower) => schema.compare(key, lower) == Ordering::Greater,
    }
}

pub(crate) fn beyond_upper(schema: &Schema, bound: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match bound {
        Bound::Unbounded => false,
        Bound::Included(upper) => schema.compare(key, upper) == Ordering::Greater,
        Bound::Excluded(upper) => schema.compare(key, upper) != Ordering::Less,
    }
}

/// Current root of the data tree registered under `key`.
pub(crate) fn registry_lookup(inner: &Arc<TreeInner>, key: &[u8]) -> Result<Option<Pointer>> {
    let mut cursor = SeekCursor::new(
        Arc::clone(inner),
        0,
        RootSource::Base,
        Bound::Included(key.to_vec()),
        Bound::Included(key.to_vec()),
    )?;
    match cursor.next() {
        Some(entry) => Ok(Some(RootEntry::decode(&entry?.1)?.pointer())),
        None => Ok(None),
    }
}

impl Iterator for SeekCursor {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.fill() {
            self.finished = true;
            self.buffer.clear();
            return Some(Err(err));
        }
        self.buffer.pop_front().map(Ok)
    }
}
