//! Walks over the upper levels of a tree that never touch most leaves:
//! partition boundaries for parallel seeks and entry count estimates.
//!
//! Both run lock-free like a seek. A walk that observes a concurrent change
//! starts over from the current root.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use super::inner::{NodeRead, TreeInner, MAX_DEPTH};
use super::seek::beyond_upper;
use crate::storage::gbptree::gspp::Pointer;
use crate::storage::gbptree::node::{Body, Schema};
use crate::types::{ErrorKind, GbpError, PageId, Result};

/// Walks started over before giving up.
const MAX_ATTEMPTS: u32 = 64;

/// Nodes read per level by [`estimate_entries`].
const SAMPLE_WIDTH: usize = 64;

/// Reads the current version of the node `pointer` leads to. `None` means the
/// tree changed and the walk must start over; a page that failed to decode is
/// kept in `failure` so a walk that never completes can report it.
fn read_current(
    inner: &TreeInner,
    mut pointer: Pointer,
    stable: u64,
    unstable: u64,
    failure: &mut Option<GbpError>,
) -> Result<Option<NodeRead>> {
    for _ in 0..MAX_DEPTH {
        if !pointer.id.is_some() {
            return Ok(None);
        }
        let node = match inner.read_node(pointer.id, stable, unstable) {
            Ok(node) => node,
            Err(err) if err.kind() == ErrorKind::Corruption => {
                *failure = Some(err);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if node.generation > pointer.generation || node.tag != 0 {
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

/// Runs `walk` from the current root until one pass completes.
fn retry<T>(
    inner: &TreeInner,
    mut walk: impl FnMut(Pointer, u64, u64, &mut Option<GbpError>) -> Result<Option<T>>,
) -> Result<T> {
    inner.check_readable()?;
    let mut failure = None;
    for _ in 0..MAX_ATTEMPTS {
        let view = inner.view();
        if let Some(done) = walk(view.root, view.stable, view.unstable, &mut failure)? {
            return Ok(done);
        }
    }
    Err(failure.unwrap_or(GbpError::Corruption("tree kept changing under a sampling walk")))
}

fn child_pointers(node: &NodeRead) -> impl Iterator<Item = (usize, Pointer)> + '_ {
    let children: &[PageId] = match &node.body {
        Body::Internal(image) => image.children.as_slice(),
        Body::Leaf(_) => &[],
    };
    children
        .iter()
        .zip(&node.child_generations)
        .enumerate()
        .map(|(pos, (id, generation))| {
            (
                pos,
                Pointer {
                    id: *id,
                    generation: *generation,
                },
            )
        })
}

fn strictly_above(schema: &Schema, bound: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match bound {
        Bound::Unbounded => true,
        Bound::Included(lower) | Bound::Excluded(lower) => {
            schema.compare(key, lower) == Ordering::Greater
        }
    }
}

fn strictly_below(schema: &Schema, bound: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match bound {
        Bound::Unbounded => true,
        Bound::Included(upper) | Bound::Excluded(upper) => {
            schema.compare(key, upper) == Ordering::Less
        }
    }
}

/// At most `count` items spread evenly over `items`.
fn spread<T: Clone>(items: &[T], count: usize) -> Vec<T> {
    if items.len() <= count {
        return items.to_vec();
    }
    (0..count).map(|i| items[i * items.len() / count].clone()).collect()
}

/// Up to `desired - 1` separator keys strictly inside the range, taken from
/// the highest internal level holding enough of them, or from the lowest
/// internal level when none does.
pub(crate) fn partition_keys(
    inner: &Arc<TreeInner>,
    lower: &Bound<Vec<u8>>,
    upper: &Bound<Vec<u8>>,
    desired: usize,
) -> Result<Vec<Vec<u8>>> {
    let schema = &inner.schemas[0];
    let wanted = desired.saturating_sub(1);
    retry(inner, |root, stable, unstable, failure| {
        let mut level = vec![root];
        let mut best: Vec<Vec<u8>> = Vec::new();
        for _ in 0..MAX_DEPTH {
            if wanted == 0 || best.len() >= wanted || level.is_empty() {
                break;
            }
            let mut found = Vec::new();
            let mut next = Vec::new();
            for pointer in &level {
                let Some(node) = read_current(inner, *pointer, stable, unstable, failure)? else {
                    return Ok(None);
                };
                let Body::Internal(image) = &node.body else {
                    return Ok(Some(pick(best, wanted)));
                };
                for (pos, child) in child_pointers(&node) {
                    // Child `pos` holds keys in [keys[pos - 1], keys[pos]).
                    let starts_in_range =
                        pos == 0 || !beyond_upper(schema, upper, &image.keys[pos - 1]);
                    let ends_in_range = image
                        .keys
                        .get(pos)
                        .map_or(true, |key| strictly_above(schema, lower, key));
                    if starts_in_range && ends_in_range {
                        next.push(child);
                    }
                }
                found.extend(
                    image
                        .keys
                        .iter()
                        .filter(|key| {
                            strictly_above(schema, lower, key.as_slice())
                                && strictly_below(schema, upper, key.as_slice())
                        })
                        .cloned(),
                );
            }
            if found.len() >= best.len() {
                best = found;
            }
            level = next;
        }
        Ok(Some(pick(best, wanted)))
    })
}

fn pick(keys: Vec<Vec<u8>>, wanted: usize) -> Vec<Vec<u8>> {
    if keys.len() <= wanted {
        return keys;
    }
    let parts = wanted + 1;
    (1..parts).map(|i| keys[i * keys.len() / parts].clone()).collect()
}

/// Entry count extrapolated from up to [`SAMPLE_WIDTH`] nodes per level.
/// Exact while no level is wider than the sample.
pub(crate) fn estimate_entries(inner: &Arc<TreeInner>) -> Result<u64> {
    retry(inner, |root, stable, unstable, failure| {
        let mut level = vec![root];
        let mut width = 1.0f64;
        for _ in 0..MAX_DEPTH {
            let sample = spread(&level, SAMPLE_WIDTH);
            if sample.is_empty() {
                return Ok(None);
            }
            let mut children = Vec::new();
            let mut keys = 0usize;
            let mut leaves = 0usize;
            for pointer in &sample {
                let Some(node) = read_current(inner, *pointer, stable, unstable, failure)? else {
                    return Ok(None);
                };
                match &node.body {
                    Body::Leaf(image) => {
                        leaves += 1;
                        keys += image.len();
                    }
                    Body::Internal(_) => {
                        children.extend(child_pointers(&node).map(|(_, pointer)| pointer))
                    }
                }
            }
            let per_node = |count: usize| count as f64 / sample.len() as f64;
            if leaves > 0 {
                if leaves != sample.len() {
                    return Ok(None);
                }
                return Ok(Some((width * per_node(keys)).round() as u64));
            }
            width *= per_node(children.len());
            level = children;
        }
        Ok(None)
    })
}
