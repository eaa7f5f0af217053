//! # Configuration Constants
//!
//! Centralizes the tunable constants of the storage core. Values that depend
//! on each other are co-located so a change to one is visible next to the
//! others.
//!
//! ```text
//! DEFAULT_PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> HeapPage::slots_per_page     (bitmap + fixed-width slots)
//!       ├─> LeafPage::capacity           (12-byte pointer block + bitmap + slots)
//!       ├─> InternalPage::capacity       (5-byte header + bitmap + keys + children)
//!       └─> HeaderPage::slots_per_page   ((page_size - 8) * 8 allocation bits)
//!
//! DEFAULT_POOL_CAPACITY (50 pages)
//!       └─> NO-STEAL eviction fails once every resident page is dirty, so a
//!           single transaction must keep its dirty set under this bound.
//!
//! DEFAULT_LOCK_TIMEOUT (10 s)
//!       └─> the only deadlock detector: a lock wait that outlives this
//!           budget aborts its transaction.
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Bytes per heap, leaf, internal, and header page.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Bytes in the singleton root-pointer page of a B+ tree file:
/// root page-no (4) + root category (1) + first header page-no (4).
pub const ROOT_PTR_SIZE: usize = 9;

/// Default number of resident pages in the buffer pool.
pub const DEFAULT_POOL_CAPACITY: usize = 50;

/// Default budget for a single lock wait before the transaction aborts.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_PAGE_SIZE);

/// Current page size in bytes.
#[inline]
pub fn page_size() -> usize {
    PAGE_SIZE.load(Ordering::Relaxed)
}

/// Overrides the page size. Tests only: existing files and cached pages are
/// not rewritten, so this must run before any file is opened.
pub fn set_page_size(bytes: usize) {
    PAGE_SIZE.store(bytes, Ordering::Relaxed);
}
