//! Structural consistency checker.
//!
//! Walks every tree in the file and the freelist under the writer lock,
//! reporting each violation to a [`ConsistencyVisitor`]. The walk never
//! modifies a page and keeps going after a violation wherever the damaged
//! node can still be decoded.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;

use super::gspp::{self, Pointer, SlotState};
use super::multi_root::RootEntry;
use super::node::{self, Body, NodeKind, PointerType};
use super::tree::inner::{NodeRead, TreeInner, WriterState, MAX_DEPTH};
use crate::primitives::pager::PageAccess;
use crate::types::page::MIN_TREE_NODE_ID;
use crate::types::{ErrorKind, PageId, Result};

/// Kind of inconsistency found by the checker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ViolationKind {
    /// Reachable page is not a tree node.
    NotATreeNode,
    /// Node kind byte or schema tag is not recognised.
    UnknownTreeNodeType,
    /// Key count exceeds what the node layout can hold.
    UnreasonableKeyCount,
    /// Keys inside one node are not strictly ascending.
    KeysOutOfOrderInNode,
    /// Key lies outside the range given by the parent's separators.
    KeysLocatedInWrongNode,
    /// Dynamic-node allocation offset or dead space disagrees with its content.
    NodeMetaInconsistency,
    /// Pointer pair holds a slot from a crashed generation.
    CrashedPointer,
    /// Pointer pair holds a broken slot or cannot be resolved.
    BrokenPointer,
    /// Pointer was written before the node it points to.
    PointerHasLowerGenerationThanNode,
    /// Adjacent nodes on a level disagree about being siblings.
    SiblingsDontPointToEachOther,
    /// Last node of a level points right.
    RightmostNodeHasRightSibling,
    /// First node of a level points left.
    LeftmostNodeHasLeftSibling,
    /// A reachable node has a successor, so a newer version exists.
    PointerToOldVersionOfTreeNode,
    /// Child pointer leads back to an ancestor.
    ChildNodeFoundAmongParentNodes,
    /// Page reachable or listed more than once.
    PageIdSeenMultipleTimes,
    /// Released page is still reachable.
    ReachablePageInFreelist,
    /// Page id outside the allocated range.
    PageIdExceedLastId,
    /// Page neither reachable nor in the freelist.
    UnusedPage,
    /// The file was not closed cleanly and crash cleanup has not run.
    DirtyOnStartup,
    /// A node could not be decoded for a reason not covered above.
    Exception,
}

/// One reported inconsistency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Page the violation was found on; [`PageId::NONE`] for file-level ones.
    pub page: PageId,
    /// Pointer involved, when there is one.
    pub pointer: Option<PointerType>,
    /// What is wrong.
    pub kind: ViolationKind,
    /// Expected-versus-found detail.
    pub detail: String,
}

/// Receives violations as the checker finds them.
pub trait ConsistencyVisitor {
    /// Called once per violation.
    fn violation(&mut self, violation: Violation);
}

/// Visitor that collects every violation.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConsistencyReport {
    /// Violations in discovery order.
    pub violations: Vec<Violation>,
    /// Tree nodes visited.
    pub nodes_visited: usize,
}

impl ConsistencyReport {
    /// True when nothing was reported.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Number of violations of `kind`.
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }
}

impl ConsistencyVisitor for ConsistencyReport {
    fn violation(&mut self, violation: Violation) {
        self.violations.push(violation);
    }
}

/// Last node seen on one level, for sibling checks.
struct Tail {
    id: PageId,
    generation: u64,
    right: Pointer,
}

/// Parent pointer a node was reached through.
#[derive(Copy, Clone)]
struct Parent {
    id: PageId,
    pos: usize,
    generation: u64,
}

struct Checker<'a, 'v> {
    inner: &'a TreeInner,
    visitor: &'v mut dyn ConsistencyVisitor,
    stable: u64,
    unstable: u64,
    last_id: PageId,
    tree_pages: HashSet<PageId>,
    data_roots: Vec<Pointer>,
    reported: usize,
}

impl Checker<'_, '_> {
    fn report(
        &mut self,
        page: PageId,
        pointer: Option<PointerType>,
        kind: ViolationKind,
        detail: impl Into<String>,
    ) {
        self.reported += 1;
        self.visitor.violation(Violation {
            page,
            pointer,
            kind,
            detail: detail.into(),
        });
    }

    fn in_range(&self, id: PageId) -> bool {
        id >= MIN_TREE_NODE_ID && id <= self.last_id
    }

    fn tree(&mut self, root: PageId, tag: u8) -> Result<()> {
        let mut levels: Vec<Option<Tail>> = Vec::new();
        let mut ancestors = Vec::new();
        self.visit(root, tag, None, None, None, 0, &mut levels, &mut ancestors)?;
        for tail in levels.into_iter().flatten() {
            if tail.right.id.is_some() {
                self.report(
                    tail.id,
                    Some(PointerType::RightSibling),
                    ViolationKind::RightmostNodeHasRightSibling,
                    format!("rightmost node points right to {}", tail.right.id),
                );
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        id: PageId,
        tag: u8,
        parent: Option<Parent>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        levels: &mut Vec<Option<Tail>>,
        ancestors: &mut Vec<PageId>,
    ) -> Result<()> {
        let (from, via) = match parent {
            Some(parent) => (parent.id, Some(PointerType::Child(parent.pos))),
            None => (PageId::NONE, None),
        };
        if depth >= MAX_DEPTH {
            self.report(id, None, ViolationKind::Exception, "tree deeper than any valid tree");
            return Ok(());
        }
        if !self.in_range(id) {
            self.report(
                from,
                via,
                ViolationKind::PageIdExceedLastId,
                format!("child {id} outside [{MIN_TREE_NODE_ID}, {}]", self.last_id),
            );
            return Ok(());
        }
        if ancestors.contains(&id) {
            self.report(
                from,
                via,
                ViolationKind::ChildNodeFoundAmongParentNodes,
                format!("child {id} is also an ancestor"),
            );
            return Ok(());
        }
        if !self.tree_pages.insert(id) {
            self.report(
                id,
                None,
                ViolationKind::PageIdSeenMultipleTimes,
                "node reachable more than once",
            );
            return Ok(());
        }
        let Some(node) = self.decode(id, tag)? else {
            return Ok(());
        };

        if node.successor.id.is_some() {
            self.report(
                id,
                Some(PointerType::Successor),
                ViolationKind::PointerToOldVersionOfTreeNode,
                format!("reachable node has successor {}", node.successor.id),
            );
        }
        if let Some(parent) = parent {
            if parent.generation < node.generation {
                self.report(
                    parent.id,
                    Some(PointerType::Child(parent.pos)),
                    ViolationKind::PointerHasLowerGenerationThanNode,
                    format!(
                        "pointer generation {} below node {id} generation {}",
                        parent.generation, node.generation
                    ),
                );
            }
        }
        self.siblings(&node, depth, levels);
        self.keys(&node, tag, lower, upper);
        if tag == 0 && self.inner.schemas.len() > 1 {
            self.collect_data_roots(&node);
        }

        if let Body::Internal(image) = &node.body {
            ancestors.push(id);
            for (pos, child) in image.children.iter().enumerate() {
                let child_lower = match pos {
                    0 => lower,
                    _ => Some(image.keys[pos - 1].as_slice()),
                };
                let child_upper = match image.keys.get(pos) {
                    Some(key) => Some(key.as_slice()),
                    None => upper,
                };
                let parent = Parent {
                    id,
                    pos,
                    generation: node.child_generations.get(pos).copied().unwrap_or(0),
                };
                self.visit(
                    *child,
                    tag,
                    Some(parent),
                    child_lower,
                    child_upper,
                    depth + 1,
                    levels,
                    ancestors,
                )?;
            }
            ancestors.pop();
        }
        Ok(())
    }

    /// Checks the raw page and decodes it; `None` when it cannot be walked.
    fn decode(&mut self, id: PageId, tag: u8) -> Result<Option<NodeRead>> {
        let inner = self.inner;
        let (stable, unstable) = (self.stable, self.unstable);
        let before = self.reported;
        {
            let mut cursor = inner.pages.io(id, PageAccess::Read)?;
            if !cursor.next()? {
                self.report(id, None, ViolationKind::PageIdExceedLastId, "page beyond end of file");
                return Ok(None);
            }
            if !node::is_tree_node(&mut cursor) {
                let found = cursor.get_u8_at(0);
                self.report(
                    id,
                    None,
                    ViolationKind::NotATreeNode,
                    format!("page type {found}"),
                );
                return Ok(None);
            }
            let Some(kind) = node::kind(&mut cursor) else {
                let raw = node::raw_kind(&mut cursor);
                self.report(
                    id,
                    None,
                    ViolationKind::UnknownTreeNodeType,
                    format!("node kind {raw}"),
                );
                return Ok(None);
            };
            let found_tag = node::schema_tag(&mut cursor);
            let Some(schema) = inner.schemas.get(found_tag as usize) else {
                self.report(
                    id,
                    None,
                    ViolationKind::UnknownTreeNodeType,
                    format!("schema tag {found_tag}"),
                );
                return Ok(None);
            };
            if found_tag != tag {
                self.report(
                    id,
                    None,
                    ViolationKind::UnknownTreeNodeType,
                    format!("schema tag {found_tag} in a tree of tag {tag}"),
                );
                return Ok(None);
            }
            let count = node::key_count(&mut cursor);
            if !schema.node.reasonable_key_count(kind, count) {
                self.report(
                    id,
                    None,
                    ViolationKind::UnreasonableKeyCount,
                    format!("{count} keys in a {kind:?} node"),
                );
                return Ok(None);
            }
            if let Some(problem) = schema.node.meta_problem(&mut cursor, kind) {
                self.report(id, None, ViolationKind::NodeMetaInconsistency, problem);
            }
            let mut pointers = vec![
                PointerType::RightSibling,
                PointerType::LeftSibling,
                PointerType::Successor,
            ];
            if kind == NodeKind::Internal {
                pointers.extend((0..=count).map(PointerType::Child));
            }
            for pointer in pointers {
                let offset = schema.node.pointer_offset(pointer);
                let pair = gspp::view(&mut cursor, offset, stable, unstable);
                if pair.has_state(SlotState::Crash) {
                    self.report(
                        id,
                        Some(pointer),
                        ViolationKind::CrashedPointer,
                        format!(
                            "slot generations {} / {} with stable {stable}, unstable {unstable}",
                            pair.a.generation, pair.b.generation
                        ),
                    );
                }
                if pair.has_state(SlotState::Broken) {
                    self.report(
                        id,
                        Some(pointer),
                        ViolationKind::BrokenPointer,
                        format!("slot states {:?} / {:?}", pair.state_a, pair.state_b),
                    );
                } else if let Err(failure) = pair.winner() {
                    self.report(id, Some(pointer), ViolationKind::BrokenPointer, failure.to_string());
                }
            }
        }
        let node = match inner.read_node(id, stable, unstable) {
            Ok(node) => node,
            Err(err) if err.kind() == ErrorKind::Corruption => {
                if self.reported == before {
                    self.report(id, None, ViolationKind::Exception, err.to_string());
                }
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        for (pointer, target) in [
            (PointerType::RightSibling, node.right.id),
            (PointerType::LeftSibling, node.left.id),
            (PointerType::Successor, node.successor.id),
        ] {
            if target.is_some() && !self.in_range(target) {
                self.report(
                    id,
                    Some(pointer),
                    ViolationKind::PageIdExceedLastId,
                    format!("points to {target} beyond last id {}", self.last_id),
                );
            }
        }
        Ok(Some(node))
    }

    fn siblings(&mut self, node: &NodeRead, depth: usize, levels: &mut Vec<Option<Tail>>) {
        if levels.len() <= depth {
            levels.resize_with(depth + 1, || None);
        }
        match levels[depth].take() {
            None => {
                if node.left.id.is_some() {
                    self.report(
                        node.id,
                        Some(PointerType::LeftSibling),
                        ViolationKind::LeftmostNodeHasLeftSibling,
                        format!("leftmost node points left to {}", node.left.id),
                    );
                }
            }
            Some(prev) => {
                if prev.right.id != node.id || node.left.id != prev.id {
                    self.report(
                        node.id,
                        None,
                        ViolationKind::SiblingsDontPointToEachOther,
                        format!(
                            "{} points right to {}, {} points left to {}",
                            prev.id, prev.right.id, node.id, node.left.id
                        ),
                    );
                } else {
                    if prev.right.generation < node.generation {
                        self.report(
                            prev.id,
                            Some(PointerType::RightSibling),
                            ViolationKind::PointerHasLowerGenerationThanNode,
                            format!(
                                "pointer generation {} below node {} generation {}",
                                prev.right.generation, node.id, node.generation
                            ),
                        );
                    }
                    if node.left.generation < prev.generation {
                        self.report(
                            node.id,
                            Some(PointerType::LeftSibling),
                            ViolationKind::PointerHasLowerGenerationThanNode,
                            format!(
                                "pointer generation {} below node {} generation {}",
                                node.left.generation, prev.id, prev.generation
                            ),
                        );
                    }
                }
            }
        }
        levels[depth] = Some(Tail {
            id: node.id,
            generation: node.generation,
            right: node.right,
        });
    }

    fn keys(&mut self, node: &NodeRead, tag: u8, lower: Option<&[u8]>, upper: Option<&[u8]>) {
        let inner = self.inner;
        let schema = &inner.schemas[tag as usize];
        let keys = node.body.keys();
        if let Some(pos) = keys
            .windows(2)
            .position(|pair| schema.compare(&pair[0], &pair[1]) != Ordering::Less)
        {
            self.report(
                node.id,
                None,
                ViolationKind::KeysOutOfOrderInNode,
                format!("key {pos} is not below key {}", pos + 1),
            );
        }
        let misplaced = keys.iter().position(|key| {
            lower.is_some_and(|lower| schema.compare(key, lower) == Ordering::Less)
                || upper.is_some_and(|upper| schema.compare(key, upper) != Ordering::Less)
        });
        if let Some(pos) = misplaced {
            self.report(
                node.id,
                None,
                ViolationKind::KeysLocatedInWrongNode,
                format!("key {pos} falls outside the range given by the parent"),
            );
        }
    }

    fn collect_data_roots(&mut self, node: &NodeRead) {
        let Body::Leaf(image) = &node.body else {
            return;
        };
        for value in &image.values {
            match RootEntry::decode(value) {
                Ok(entry) => self.data_roots.push(entry.pointer()),
                Err(err) => self.report(node.id, None, ViolationKind::Exception, err.to_string()),
            }
        }
    }

    fn freelist(&mut self, w: &WriterState) -> Result<()> {
        let contents = match w.freelist.contents(&self.inner.pages) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::Corruption => {
                self.report(PageId::NONE, None, ViolationKind::Exception, err.to_string());
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut listed = HashSet::new();
        for page in contents.pages {
            if self.tree_pages.contains(&page) || !listed.insert(page) {
                self.report(
                    page,
                    None,
                    ViolationKind::PageIdSeenMultipleTimes,
                    "freelist page also used elsewhere",
                );
            }
        }
        for (generation, id) in contents.entries {
            if !self.in_range(id) {
                self.report(
                    id,
                    None,
                    ViolationKind::PageIdExceedLastId,
                    format!("freelist entry beyond last id {}", self.last_id),
                );
            } else if self.tree_pages.contains(&id) {
                self.report(
                    id,
                    None,
                    ViolationKind::ReachablePageInFreelist,
                    format!("released in generation {generation} but still reachable"),
                );
            } else if !listed.insert(id) {
                self.report(
                    id,
                    None,
                    ViolationKind::PageIdSeenMultipleTimes,
                    "listed in the freelist more than once",
                );
            }
        }
        for raw in MIN_TREE_NODE_ID.0..=self.last_id.0 {
            let id = PageId(raw);
            if !self.tree_pages.contains(&id) && !listed.contains(&id) {
                self.report(
                    id,
                    None,
                    ViolationKind::UnusedPage,
                    "neither reachable nor in the freelist",
                );
            }
        }
        Ok(())
    }
}

/// Runs a full check; returns true when no violation was reported.
pub(crate) fn check(inner: &TreeInner, visitor: &mut dyn ConsistencyVisitor) -> Result<bool> {
    run(inner, visitor).map(|(clean, _)| clean)
}

/// Runs a full check and collects the result.
pub(crate) fn report(inner: &TreeInner) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();
    let (_, visited) = run(inner, &mut report)?;
    report.nodes_visited = visited;
    Ok(report)
}

fn run(inner: &TreeInner, visitor: &mut dyn ConsistencyVisitor) -> Result<(bool, usize)> {
    inner.check_readable()?;
    let w = inner.writer.lock();
    let (stable, unstable) = w.generations();
    let mut checker = Checker {
        inner,
        visitor,
        stable,
        unstable,
        last_id: w.freelist.last_id,
        tree_pages: HashSet::new(),
        data_roots: Vec::new(),
        reported: 0,
    };
    if inner.dirty_on_startup() && inner.recovery_pending() {
        checker.report(
            PageId::NONE,
            None,
            ViolationKind::DirtyOnStartup,
            "crash cleanup has not run",
        );
    }
    checker.tree(w.state.root_id, 0)?;
    for root in std::mem::take(&mut checker.data_roots) {
        checker.tree(root.id, 1)?;
    }
    checker.freelist(&w)?;
    Ok((checker.reported == 0, checker.tree_pages.len()))
}
