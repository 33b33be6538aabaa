//! Crash cleanup and the collectors that decide where it runs.
//!
//! A tree opened after an unclean shutdown still carries pointer slots from
//! the generation that never reached a checkpoint, and page ids that were
//! released after the last checkpoint are no longer on the freelist. Cleanup
//! wipes the former and releases the latter; until it finishes, the tree only
//! serves reads.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::inner::{Status, TreeInner, WriterState};
use super::walk;
use crate::primitives::pager::PageAccess;
use crate::storage::gbptree::gspp;
use crate::storage::gbptree::node::{self, NodeKind, PointerType};
use crate::storage::gbptree::options::CleanupMode;
use crate::types::page::MIN_TREE_NODE_ID;
use crate::types::{GbpError, PageId, Result};

/// Pending crash cleanup for one tree.
pub struct CleanupJob {
    inner: Arc<TreeInner>,
}

impl CleanupJob {
    pub(crate) fn new(inner: Arc<TreeInner>) -> Self {
        Self { inner }
    }

    /// Runs the cleanup and opens the tree for writes. A failure marks the
    /// tree unrecoverable.
    pub fn run(self) -> Result<()> {
        let inner = self.inner;
        let mut w = inner.writer.lock();
        if inner.status() != Status::Recovering {
            return Ok(());
        }
        info!("crash cleanup started");
        match clean(&inner, &mut w) {
            Ok((slots, released)) => {
                inner.set_status(Status::Open);
                info!(slots, released, "crash cleanup finished");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "crash cleanup failed");
                let reason = err.to_string();
                inner.set_status(Status::Unrecoverable(reason.clone()));
                Err(GbpError::Unrecoverable(reason))
            }
        }
    }
}

fn clean(inner: &TreeInner, w: &mut WriterState) -> Result<(usize, usize)> {
    let (stable, unstable) = w.generations();
    if unstable.saturating_sub(stable) < 2 {
        return Err(GbpError::Invariant(
            "crash cleanup needs a crashed generation between stable and unstable",
        ));
    }
    let last = w.freelist.last_id;
    let mut slots = 0;
    for raw in MIN_TREE_NODE_ID.0..=last.0 {
        slots += clean_page(inner, PageId(raw), stable, unstable)?;
    }

    let reachable = walk::reachable(inner, w)?;
    let listed: HashSet<PageId> = w
        .freelist
        .contents(&inner.pages)?
        .entries
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    let mut released = 0;
    for raw in MIN_TREE_NODE_ID.0..=last.0 {
        let id = PageId(raw);
        if !reachable.contains(&id) && !listed.contains(&id) {
            w.freelist.release(&inner.pages, unstable, id, &inner.stats)?;
            released += 1;
        }
    }
    inner.checkpoint_locked(w, false)?;
    Ok((slots, released))
}

/// Wipes crashed slots of one node; returns how many pairs changed.
fn clean_page(inner: &TreeInner, id: PageId, stable: u64, unstable: u64) -> Result<usize> {
    let mut cursor = inner.pages.io(id, PageAccess::Write)?;
    if !cursor.next()? {
        warn!(page = id.0, "page missing during crash cleanup");
        return Ok(0);
    }
    if !node::is_tree_node(&mut cursor) {
        return Ok(0);
    }
    let generation = node::generation(&mut cursor);
    // Nodes written by the crashed session are unreachable garbage.
    if generation > stable && generation != unstable {
        return Ok(0);
    }
    let Some(kind) = node::kind(&mut cursor) else {
        return Ok(0);
    };
    let Some(schema) = inner.schemas.get(node::schema_tag(&mut cursor) as usize) else {
        return Ok(0);
    };
    let count = node::key_count(&mut cursor);
    if !schema.node.reasonable_key_count(kind, count) {
        return Ok(0);
    }
    let mut offsets = vec![
        node::RIGHT_SIBLING_OFFSET,
        node::LEFT_SIBLING_OFFSET,
        node::SUCCESSOR_OFFSET,
    ];
    if kind == NodeKind::Internal {
        offsets.extend((0..=count).map(|pos| schema.node.pointer_offset(PointerType::Child(pos))));
    }
    let cleaned = offsets
        .into_iter()
        .filter(|offset| gspp::clean_crashed(&mut cursor, *offset, stable, unstable))
        .count();
    if cursor.check_and_clear_bounds() {
        return Err(GbpError::at_page(id, "crash cleanup wrote out of bounds"));
    }
    Ok(cleaned)
}

/// Decides where crash cleanup runs.
pub trait CleanupWorkCollector: Send + Sync {
    /// Accepts a job; may run it right away.
    fn add(&self, job: CleanupJob) -> Result<()>;

    /// Runs or waits for every job accepted so far.
    fn drain(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs cleanup inside `add`, so `open` returns a writable tree.
#[derive(Debug, Default)]
pub struct ImmediateCleanup;

impl CleanupWorkCollector for ImmediateCleanup {
    fn add(&self, job: CleanupJob) -> Result<()> {
        job.run()
    }
}

/// Runs each job on its own thread.
#[derive(Default)]
pub struct BackgroundCleanup {
    handles: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl BackgroundCleanup {
    /// Blocks until every started job has finished.
    pub fn wait(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle
                .join()
                .map_err(|_| GbpError::Unrecoverable("crash cleanup thread panicked".into()))??;
        }
        Ok(())
    }
}

impl CleanupWorkCollector for BackgroundCleanup {
    fn add(&self, job: CleanupJob) -> Result<()> {
        let handle = thread::Builder::new()
            .name("gbptree-cleanup".into())
            .spawn(move || job.run())?;
        self.handles.lock().push(handle);
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        self.wait()
    }
}

/// Holds jobs until [`DeferredCleanup::run_pending`] is called.
#[derive(Default)]
pub struct DeferredCleanup {
    jobs: Mutex<Vec<CleanupJob>>,
}

impl DeferredCleanup {
    /// Number of queued jobs.
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Runs every queued job; returns how many ran.
    pub fn run_pending(&self) -> Result<usize> {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        let count = jobs.len();
        for job in jobs {
            job.run()?;
        }
        Ok(count)
    }
}

impl CleanupWorkCollector for DeferredCleanup {
    fn add(&self, job: CleanupJob) -> Result<()> {
        self.jobs.lock().push(job);
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        self.run_pending().map(|_| ())
    }
}

pub(crate) fn collector_for(mode: CleanupMode) -> Arc<dyn CleanupWorkCollector> {
    match mode {
        CleanupMode::Immediate => Arc::new(ImmediateCleanup),
        CleanupMode::Background => Arc::new(BackgroundCleanup::default()),
        CleanupMode::Deferred => Arc::new(DeferredCleanup::default()),
    }
}
