//! State shared by every handle, seeker and cleanup job of one tree file.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::writer::Writer;
use crate::primitives::pager::{PageAccess, PageCursor, PagedFile};
use crate::storage::gbptree::freelist::{self, FreeList};
use crate::storage::gbptree::gspp::Pointer;
use crate::storage::gbptree::node::corruption::{self, Corruption};
use crate::storage::gbptree::node::{self, Body, NodeKind, PointerType, Schema};
use crate::storage::gbptree::options::GbpTreeOptions;
use crate::storage::gbptree::state::{self, TreeState};
use crate::storage::gbptree::stats::GbpTreeStats;
use crate::types::page::{INITIAL_FREELIST_ID, INITIAL_ROOT_ID, STATE_PAGE_A};
use crate::types::{ErrorKind, GbpError, PageId, Result};

/// Deepest tree any walk will descend before declaring a cycle.
pub(crate) const MAX_DEPTH: usize = 64;

/// What readers need to start a descent.
#[derive(Copy, Clone, Debug)]
pub(crate) struct View {
    pub(crate) stable: u64,
    pub(crate) unstable: u64,
    pub(crate) root: Pointer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Open,
    Recovering,
    Unrecoverable(String),
    Closed,
}

/// A decoded node.
#[derive(Clone, Debug)]
pub(crate) struct NodeRead {
    pub(crate) id: PageId,
    pub(crate) kind: NodeKind,
    pub(crate) tag: u8,
    pub(crate) generation: u64,
    pub(crate) left: Pointer,
    pub(crate) right: Pointer,
    pub(crate) successor: Pointer,
    pub(crate) body: Body,
    /// Generations of the child pointers; empty for leaves.
    pub(crate) child_generations: Vec<u64>,
}

/// Everything guarded by the writer lock.
pub(crate) struct WriterState {
    /// Current state; freelist cursors are only refreshed at checkpoint.
    pub(crate) state: TreeState,
    pub(crate) freelist: FreeList,
    /// State page written most recently.
    pub(crate) state_page: PageId,
    pub(crate) header: Vec<u8>,
}

impl WriterState {
    pub(crate) fn generations(&self) -> (u64, u64) {
        (self.state.stable_generation, self.state.unstable_generation)
    }

    /// The state as a checkpoint would persist it right now.
    pub(crate) fn snapshot(&self) -> TreeState {
        let mut state = self.state.clone();
        self.freelist.copy_into(&mut state);
        state
    }
}

pub(crate) struct TreeInner {
    pub(crate) pages: PagedFile,
    /// Node layouts indexed by the schema tag stamped on each node.
    pub(crate) schemas: Vec<Schema>,
    pub(crate) options: GbpTreeOptions,
    pub(crate) stats: GbpTreeStats,
    pub(crate) writer: Mutex<WriterState>,
    view: RwLock<View>,
    status: Mutex<Status>,
    dirty_on_startup: bool,
}

fn create(pages: &PagedFile, schemas: &[Schema], layout_id: u64, header: &[u8]) -> Result<()> {
    let schema = schemas
        .first()
        .ok_or(GbpError::Invalid("tree needs at least one schema"))?;
    let page_size = pages.page_size();
    let (stable, unstable) = (1, 2);
    {
        let mut cursor = pages.io(INITIAL_ROOT_ID, PageAccess::WriteGrow)?;
        if !cursor.next()? {
            return Err(GbpError::at_page(INITIAL_ROOT_ID, "root page unavailable"));
        }
        schema.node.initialize(&mut cursor, NodeKind::Leaf, 0, unstable);
    }
    freelist::initialize_page(pages, INITIAL_FREELIST_ID)?;
    let mut state = TreeState {
        page_size: page_size as u32,
        layout_id,
        stable_generation: stable,
        unstable_generation: unstable,
        root_id: INITIAL_ROOT_ID,
        root_generation: unstable,
        last_id: INITIAL_FREELIST_ID,
        freelist_write_page: INITIAL_FREELIST_ID,
        freelist_read_page: INITIAL_FREELIST_ID,
        freelist_write_pos: 0,
        freelist_read_pos: 0,
        clean: false,
    };
    state::write(pages, STATE_PAGE_A, &state, header)?;
    pages.flush()?;

    state.stable_generation = unstable;
    state.unstable_generation = unstable + 1;
    state.clean = true;
    state::write(pages, state::other(STATE_PAGE_A), &state, header)?;
    pages.flush()?;
    info!(page_size, layout_id, "created tree");
    Ok(())
}

impl TreeInner {
    /// Opens the tree stored in `pages`, creating it when the file is empty.
    pub(crate) fn open(
        pages: PagedFile,
        schemas: Vec<Schema>,
        layout_id: u64,
        options: GbpTreeOptions,
        initial_header: &[u8],
    ) -> Result<Arc<Self>> {
        let page_size = pages.page_size();
        if page_size != options.page_size as usize {
            return Err(GbpError::Invalid(
                "paged file and options disagree on the page size",
            ));
        }
        if pages.page_count() == 0 {
            if options.read_only || !options.create_if_missing {
                return Err(GbpError::NotFound);
            }
            create(&pages, &schemas, layout_id, initial_header)?;
        }
        if let Some(recorded) = state::recorded_page_size(&pages)? {
            if recorded != options.page_size {
                return Err(GbpError::MetadataMismatch(format!(
                    "file uses {recorded} byte pages, options ask for {}",
                    options.page_size
                )));
            }
        }
        let (record, page) = state::select_newest(&pages)?;
        let persisted = record.state;
        if persisted.layout_id != layout_id {
            return Err(GbpError::MetadataMismatch(format!(
                "file layout {:#x}, expected {layout_id:#x}",
                persisted.layout_id
            )));
        }
        if persisted.page_size != options.page_size {
            return Err(GbpError::MetadataMismatch(format!(
                "state records {} byte pages, options ask for {}",
                persisted.page_size, options.page_size
            )));
        }
        let dirty = !persisted.clean;
        if dirty {
            warn!(
                stable = persisted.stable_generation,
                unstable = persisted.unstable_generation,
                "tree was not closed cleanly"
            );
        }
        let freelist = FreeList::from_state(&persisted, page_size);
        let (state, state_page, view_unstable) = if options.read_only {
            // Slots written in the persisted unstable generation belong to a
            // session that never checkpointed; read past them. Never persisted.
            let mut view_state = persisted;
            view_state.unstable_generation += 1;
            let unstable = view_state.unstable_generation;
            (view_state, page, unstable)
        } else {
            let mut next = persisted;
            next.unstable_generation += 1;
            next.clean = false;
            let target = state::other(page);
            state::write(&pages, target, &next, &record.header)?;
            pages.flush()?;
            let unstable = next.unstable_generation;
            (next, target, unstable)
        };
        let view = View {
            stable: state.stable_generation,
            unstable: view_unstable,
            root: Pointer {
                id: state.root_id,
                generation: state.root_generation,
            },
        };
        let status = if dirty && !options.read_only {
            Status::Recovering
        } else {
            Status::Open
        };
        info!(
            page_size,
            stable = state.stable_generation,
            unstable = state.unstable_generation,
            root = state.root_id.0,
            read_only = options.read_only,
            dirty,
            "opened tree"
        );
        Ok(Arc::new(Self {
            pages,
            schemas,
            options,
            stats: GbpTreeStats::default(),
            writer: Mutex::new(WriterState {
                state,
                freelist,
                state_page,
                header: record.header,
            }),
            view: RwLock::new(view),
            status: Mutex::new(status),
            dirty_on_startup: dirty,
        }))
    }

    pub(crate) fn view(&self) -> View {
        *self.view.read()
    }

    pub(crate) fn status(&self) -> Status {
        self.status.lock().clone()
    }

    pub(crate) fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    pub(crate) fn dirty_on_startup(&self) -> bool {
        self.dirty_on_startup
    }

    pub(crate) fn recovery_pending(&self) -> bool {
        self.status() == Status::Recovering
            || (self.options.read_only && self.dirty_on_startup)
    }

    pub(crate) fn check_readable(&self) -> Result<()> {
        match &*self.status.lock() {
            Status::Closed => Err(GbpError::Closed),
            Status::Unrecoverable(reason) => Err(GbpError::Unrecoverable(reason.clone())),
            Status::Open | Status::Recovering => Ok(()),
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(if self.dirty_on_startup {
                GbpError::NeedsRecovery
            } else {
                GbpError::ReadOnly
            });
        }
        match &*self.status.lock() {
            Status::Open => Ok(()),
            Status::Recovering => Err(GbpError::Recovering),
            Status::Unrecoverable(reason) => Err(GbpError::Unrecoverable(reason.clone())),
            Status::Closed => Err(GbpError::Closed),
        }
    }

    /// Runs a structural mutation. A failure other than a rejected argument
    /// leaves pages half-written, so the handle stops accepting work and the
    /// next open recovers from the last checkpoint.
    pub(crate) fn mutate<T>(
        &self,
        w: &mut WriterState,
        f: impl FnOnce(&mut Writer<'_>) -> Result<T>,
    ) -> Result<T> {
        self.check_writable()?;
        let mut writer = Writer::new(self, w);
        let result = f(&mut writer);
        if let Err(err) = &result {
            if err.kind() != ErrorKind::Caller {
                error!(error = %err, "mutation failed; tree needs recovery");
                self.set_status(Status::Unrecoverable(err.to_string()));
            }
        }
        result
    }

    /// Publishes a new root of the base tree.
    pub(crate) fn set_root(&self, w: &mut WriterState, root: PageId) {
        if root == w.state.root_id {
            return;
        }
        w.state.root_id = root;
        w.state.root_generation = w.state.unstable_generation;
        self.view.write().root = Pointer {
            id: root,
            generation: w.state.root_generation,
        };
    }

    /// Makes everything written so far stable.
    pub(crate) fn checkpoint_locked(&self, w: &mut WriterState, clean: bool) -> Result<()> {
        self.pages.flush()?;
        let mut next = w.snapshot();
        next.stable_generation = w.state.unstable_generation;
        next.unstable_generation = w.state.unstable_generation + 1;
        next.clean = clean;
        let target = state::other(w.state_page);
        state::write(&self.pages, target, &next, &w.header)?;
        self.pages.flush()?;
        {
            let mut view = self.view.write();
            view.stable = next.stable_generation;
            view.unstable = next.unstable_generation;
        }
        debug!(
            stable = next.stable_generation,
            unstable = next.unstable_generation,
            clean,
            "checkpoint"
        );
        w.state = next;
        w.state_page = target;
        self.stats.inc_checkpoints();
        if self.options.emit_stats_on_checkpoint {
            self.stats.emit_tracing();
        }
        Ok(())
    }

    pub(crate) fn checkpoint(&self, header: Option<&dyn Fn(&[u8]) -> Vec<u8>>) -> Result<()> {
        let mut w = self.writer.lock();
        self.check_writable()?;
        if let Some(update) = header {
            let next = update(&w.header);
            if next.len() > state::max_header_len(self.pages.page_size()) {
                return Err(GbpError::Invalid("tree state header does not fit in a page"));
            }
            w.header = next;
        }
        self.checkpoint_locked(&mut w, false)
    }

    pub(crate) fn header(&self) -> Vec<u8> {
        self.writer.lock().header.clone()
    }

    /// Checkpoints with the clean flag set and closes the file. With recovery
    /// still pending the state stays dirty, so the next open recovers again.
    pub(crate) fn close(&self) -> Result<()> {
        let mut w = self.writer.lock();
        match self.status() {
            Status::Closed => return Ok(()),
            Status::Open if !self.options.read_only => self.checkpoint_locked(&mut w, true)?,
            Status::Open => {}
            Status::Recovering => warn!("closing with crash cleanup pending"),
            Status::Unrecoverable(reason) => warn!(%reason, "closing unrecoverable tree"),
        }
        self.pages.close()?;
        self.set_status(Status::Closed);
        info!("closed tree");
        Ok(())
    }

    /// Reads and decodes node `id` under `(stable, unstable)`, rereading
    /// whenever a concurrent writer touched the page.
    pub(crate) fn read_node(&self, id: PageId, stable: u64, unstable: u64) -> Result<NodeRead> {
        let mut cursor = self.pages.io(id, PageAccess::Read)?;
        if !cursor.next()? {
            return Err(GbpError::at_page(id, "node page beyond end of file"));
        }
        loop {
            let decoded = self.decode_node(&mut cursor, id, stable, unstable);
            if cursor.should_retry() {
                self.stats.inc_optimistic_rereads();
                continue;
            }
            if cursor.check_and_clear_bounds() {
                return Err(GbpError::at_page(id, "node read out of bounds"));
            }
            return decoded;
        }
    }

    fn decode_node(
        &self,
        cursor: &mut PageCursor<'_>,
        id: PageId,
        stable: u64,
        unstable: u64,
    ) -> Result<NodeRead> {
        if !node::is_tree_node(cursor) {
            return Err(GbpError::at_page(id, "not a tree node"));
        }
        let raw_kind = node::raw_kind(cursor);
        let kind = NodeKind::from_u8(raw_kind)
            .ok_or_else(|| GbpError::at_page(id, format!("unknown node kind {raw_kind}")))?;
        let tag = node::schema_tag(cursor);
        let schema = self
            .schemas
            .get(tag as usize)
            .ok_or_else(|| GbpError::at_page(id, format!("unknown schema tag {tag}")))?;
        let generation = node::generation(cursor);
        if generation > unstable {
            return Err(GbpError::at_page(
                id,
                format!("node generation {generation} is newer than {unstable}"),
            ));
        }
        let count = node::key_count(cursor);
        if !schema.node.reasonable_key_count(kind, count) {
            return Err(GbpError::at_page(id, format!("unreasonable key count {count}")));
        }
        let pointer = |cursor: &mut PageCursor<'_>, which: PointerType| {
            schema
                .node
                .read_pointer(cursor, which, stable, unstable)
                .map_err(|failure| node::pointer_error(id, which, failure))
        };
        let left = pointer(cursor, PointerType::LeftSibling)?;
        let right = pointer(cursor, PointerType::RightSibling)?;
        let successor = pointer(cursor, PointerType::Successor)?;
        let (body, child_generations) = match kind {
            NodeKind::Leaf => (Body::Leaf(schema.node.read_leaf(cursor)), Vec::new()),
            NodeKind::Internal => {
                let image = schema
                    .node
                    .read_internal(cursor, stable, unstable)
                    .map_err(|(pos, failure)| {
                        node::pointer_error(id, PointerType::Child(pos), failure)
                    })?;
                let mut generations = Vec::with_capacity(image.children.len());
                for pos in 0..image.children.len() {
                    generations.push(pointer(cursor, PointerType::Child(pos))?.generation);
                }
                (Body::Internal(image), generations)
            }
        };
        Ok(NodeRead {
            id,
            kind,
            tag,
            generation,
            left,
            right,
            successor,
            body,
            child_generations,
        })
    }

    pub(crate) fn corrupt(&self, corruption: Corruption) -> Result<()> {
        if self.options.read_only {
            return Err(GbpError::ReadOnly);
        }
        let mut w = self.writer.lock();
        if self.status() == Status::Closed {
            return Err(GbpError::Closed);
        }
        let (stable, unstable) = w.generations();
        match corruption {
            Corruption::Page { page, corruption: damage } => corruption::apply(
                &self.pages,
                &self.schemas,
                page,
                &damage,
                stable,
                unstable,
                w.freelist.last_id,
            ),
            Corruption::DecrementFreelistWritePos => {
                w.freelist.decrement_write_pos();
                Ok(())
            }
            Corruption::AddFreelistEntry { page } => {
                w.freelist.release(&self.pages, unstable, page, &self.stats)
            }
            Corruption::SetTreeState(state) => {
                w.freelist = FreeList::from_state(&state, self.pages.page_size());
                *self.view.write() = View {
                    stable: state.stable_generation,
                    unstable: state.unstable_generation,
                    root: Pointer {
                        id: state.root_id,
                        generation: state.root_generation,
                    },
                };
                w.state = state;
                Ok(())
            }
            Corruption::CopyChildPointerFromOther {
                from,
                from_pos,
                to,
                to_pos,
            } => {
                let source = self.read_node(from, stable, unstable)?;
                let Body::Internal(image) = &source.body else {
                    return Err(GbpError::Invalid("source node is not internal"));
                };
                let child = *image
                    .children
                    .get(from_pos)
                    .ok_or(GbpError::Invalid("child position beyond key count"))?;
                corruption::apply(
                    &self.pages,
                    &self.schemas,
                    to,
                    &corruption::PageCorruption::SetChild { pos: to_pos, child },
                    stable,
                    unstable,
                    w.freelist.last_id,
                )
            }
        }
    }
}
