//! Typed storage errors.
//!
//! Every fallible path in the crate returns `eyre::Result`; the variants here
//! are attached where a caller needs to match on the failure, e.g. the
//! deadlock-timeout path:
//!
//! ```ignore
//! match db.get_page(tid, pid, Permissions::ReadWrite) {
//!     Err(e) if e.downcast_ref::<DbError>() == Some(&DbError::TransactionAborted) => {
//!         db.abort(tid)?;
//!     }
//!     other => { /* ... */ }
//! }
//! ```
//!
//! `PageFull` is consumed internally (it triggers a leaf/internal split or a
//! heap page append); the remaining variants surface to the operator layer.
//! Disk failures travel as eyre-wrapped `std::io::Error` and are fatal.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DbError {
    #[error("tuple schema does not match the table schema")]
    SchemaMismatch,

    #[error("no free slots on page")]
    PageFull,

    #[error("tuple, slot, or field not found")]
    NotFound,

    #[error("page {0} is past the end of the file")]
    IllegalPage(usize),

    #[error("transaction aborted waiting for a page lock")]
    TransactionAborted,

    #[error("buffer pool cannot evict: every resident page is dirty")]
    NoEvictablePage,

    #[error("iterator is not open")]
    NotOpen,

    #[error("iterator is exhausted")]
    NoSuchElement,
}
