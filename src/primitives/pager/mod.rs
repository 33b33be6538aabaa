#![forbid(unsafe_code)]

mod cursor;
mod frame;
mod paged_file;

pub use cursor::{PageAccess, PageCursor};
pub use paged_file::PagedFile;
