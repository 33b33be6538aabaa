use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

/// One cached page. Shared readers validate against `version`, which exclusive
/// writers bump before releasing the buffer lock.
pub(crate) struct Frame {
    pub(crate) buf: Arc<RwLock<Box<[u8]>>>,
    pub(crate) version: AtomicU64,
    pub(crate) dirty: AtomicBool,
}

impl Frame {
    pub(crate) fn new(page_size: usize) -> Self {
        Self::with_contents(vec![0u8; page_size].into_boxed_slice(), true)
    }

    pub(crate) fn with_contents(buf: Box<[u8]>, dirty: bool) -> Self {
        Self {
            buf: Arc::new(RwLock::new(buf)),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(dirty),
        }
    }
}
