//! # Storage Layer
//!
//! The storage layer owns everything below the operator surface: page
//! identity, the on-disk page codecs, the file access methods, and the
//! buffer pool that arbitrates all page access.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │      Operators (SeqScan, Insert, ...)     │
//! ├───────────────────────────────────────────┤
//! │   DbFileIterator (pull-model tuple flow)  │
//! ├───────────────────────────────────────────┤
//! │  BufferPool: page cache + 2PL lock tables │
//! ├───────────────────────────────────────────┤
//! │   DbFile: HeapFile / BTreeFile (no cache) │
//! ├───────────────────────────────────────────┤
//! │     Page codecs (bytes to structs)        │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Every page access flows through [`BufferPool::get_page`]: the pool
//! acquires a shared or exclusive transaction lock on the page id, then
//! serves the resident page or asks the owning [`DbFile`] to decode it from
//! disk. Files never cache; the pool exclusively owns in-memory pages for
//! as long as they are resident.
//!
//! ## Page identity
//!
//! A heap page is `(table_id, page_no)`. A B+ tree page additionally
//! carries a category tag (root-ptr / header / internal / leaf) because the
//! four categories decode differently from the same file. [`PageId`] is the
//! closed union the buffer pool keys its cache and lock tables on.
//!
//! ## Ownership
//!
//! Cached pages live behind `Arc<RwLock<DbPage>>` handles. The transaction
//! lock table is the real serialization point: a `ReadWrite` page lock
//! guarantees no other transaction touches the page, and the `RwLock` makes
//! the guarantee visible to the borrow checker at each access.

mod buffer_pool;
mod heap_file;
mod heap_page;

pub use buffer_pool::BufferPool;
pub use heap_file::HeapFile;
pub use heap_page::HeapPage;

use crate::btree::{BTreePageId, HeaderPage, InternalPage, LeafPage, RootPtrPage};
use crate::database::Database;
use crate::tuple::{Tuple, TupleDesc};
use eyre::{bail, ensure, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub type TableId = u32;

/// Opaque token naming a transaction. Every lock and dirty page is tagged
/// with the id of the transaction that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

impl TransactionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Lock strength requested from the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
}

/// Identity of a heap page: the owning table and the page's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapPageId {
    pub table_id: TableId,
    pub page_no: usize,
}

impl HeapPageId {
    pub fn new(table_id: TableId, page_no: usize) -> Self {
        Self { table_id, page_no }
    }
}

/// Identity of any page the buffer pool can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageId {
    Heap(HeapPageId),
    BTree(BTreePageId),
}

impl PageId {
    pub fn table_id(&self) -> TableId {
        match self {
            PageId::Heap(pid) => pid.table_id,
            PageId::BTree(pid) => pid.table_id,
        }
    }

    pub fn page_no(&self) -> usize {
        match self {
            PageId::Heap(pid) => pid.page_no,
            PageId::BTree(pid) => pid.page_no,
        }
    }
}

impl From<HeapPageId> for PageId {
    fn from(pid: HeapPageId) -> Self {
        PageId::Heap(pid)
    }
}

impl From<BTreePageId> for PageId {
    fn from(pid: BTreePageId) -> Self {
        PageId::BTree(pid)
    }
}

/// A decoded page of any category, the buffer pool's cache value.
#[derive(Debug)]
pub enum DbPage {
    Heap(HeapPage),
    RootPtr(RootPtrPage),
    Header(HeaderPage),
    Internal(InternalPage),
    Leaf(LeafPage),
}

macro_rules! dispatch_page {
    ($self:expr, $page:ident => $body:expr) => {
        match $self {
            DbPage::Heap($page) => $body,
            DbPage::RootPtr($page) => $body,
            DbPage::Header($page) => $body,
            DbPage::Internal($page) => $body,
            DbPage::Leaf($page) => $body,
        }
    };
}

macro_rules! page_accessors {
    ($ref_name:ident, $mut_name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $ref_name(&self) -> Result<&$ty> {
            match self {
                DbPage::$variant(page) => Ok(page),
                other => bail!("expected {} page, found {:?}", $label, other.id()),
            }
        }

        pub fn $mut_name(&mut self) -> Result<&mut $ty> {
            match self {
                DbPage::$variant(page) => Ok(page),
                other => bail!("expected {} page, found {:?}", $label, other.id()),
            }
        }
    };
}

impl DbPage {
    pub fn id(&self) -> PageId {
        dispatch_page!(self, page => page.id())
    }

    /// Encodes the page to its exact on-disk form.
    pub fn page_data(&self) -> Vec<u8> {
        dispatch_page!(self, page => page.page_data())
    }

    /// The transaction that dirtied this page, if any.
    pub fn is_dirty(&self) -> Option<TransactionId> {
        dispatch_page!(self, page => page.is_dirty())
    }

    pub fn mark_dirty(&mut self, dirty: bool, tid: TransactionId) {
        dispatch_page!(self, page => page.mark_dirty(dirty, tid))
    }

    page_accessors!(as_heap, as_heap_mut, Heap, HeapPage, "heap");
    page_accessors!(as_root_ptr, as_root_ptr_mut, RootPtr, RootPtrPage, "root-ptr");
    page_accessors!(as_header, as_header_mut, Header, HeaderPage, "header");
    page_accessors!(as_internal, as_internal_mut, Internal, InternalPage, "internal");
    page_accessors!(as_leaf, as_leaf_mut, Leaf, LeafPage, "leaf");
}

/// Shared handle to a resident page.
pub type PageHandle = Arc<RwLock<DbPage>>;

/// Pages dirtied by a single file mutation; rarely more than a split chain.
pub type DirtyPages = SmallVec<[PageId; 4]>;

/// A disk-backed access method: a heap of unordered tuples or a B+ tree.
///
/// Files own their on-disk bytes and nothing else; page residency belongs
/// to the buffer pool, which is why `read_page`/`write_page` must only be
/// called from it. The mutating operations acquire their own page locks
/// through the pool and report every page they touched.
pub trait DbFile: Send + Sync {
    fn id(&self) -> TableId;

    fn tuple_desc(&self) -> &TupleDesc;

    fn num_pages(&self) -> Result<usize>;

    /// Decodes one page from disk. Called by the buffer pool on cache miss.
    fn read_page(&self, pid: &PageId) -> Result<DbPage>;

    /// Writes one page to disk. Called by the buffer pool on flush.
    fn write_page(&self, page: &DbPage) -> Result<()>;

    /// Inserts under READ_WRITE locks, growing the file when necessary.
    /// Returns every page dirtied.
    fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        tuple: &mut Tuple,
    ) -> Result<DirtyPages>;

    /// Deletes the tuple named by its record id under a READ_WRITE lock.
    fn delete_tuple(&self, db: &Database, tid: TransactionId, tuple: &Tuple)
        -> Result<DirtyPages>;

    /// A restartable scan over every tuple in the file.
    fn iter<'a>(&self, db: &'a Database, tid: TransactionId)
        -> Result<Box<dyn DbFileIterator + 'a>>;
}

/// Pull-model tuple stream over a file.
///
/// `next` past exhaustion fails `NoSuchElement`; any call before `open` or
/// after `close` fails `NotOpen`. `rewind` is close-then-open: page locks
/// are re-acquired fresh and no page handles survive the restart.
pub trait DbFileIterator {
    fn open(&mut self) -> Result<()>;
    fn has_next(&mut self) -> Result<bool>;
    fn next(&mut self) -> Result<Tuple>;
    fn rewind(&mut self) -> Result<()>;
    fn close(&mut self);
}

/// Parses a zerocopy struct from the front of a byte slice.
#[inline]
pub(crate) fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Writes a zerocopy struct to the front of a byte slice.
#[inline]
pub(crate) fn write_zerocopy<T: IntoBytes + Immutable>(
    value: &T,
    bytes: &mut [u8],
    type_name: &str,
) -> Result<()> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    bytes[..size].copy_from_slice(value.as_bytes());
    Ok(())
}

/// True iff bit `i` (LSB-first) is set in the bitmap.
#[inline]
pub(crate) fn bitmap_get(bitmap: &[u8], i: usize) -> bool {
    bitmap[i / 8] & (1 << (i % 8)) != 0
}

#[inline]
pub(crate) fn bitmap_set(bitmap: &mut [u8], i: usize, used: bool) {
    if used {
        bitmap[i / 8] |= 1 << (i % 8);
    } else {
        bitmap[i / 8] &= !(1 << (i % 8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_unique() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn page_ids_compare_componentwise() {
        let a = PageId::Heap(HeapPageId::new(1, 2));
        let b = PageId::Heap(HeapPageId::new(1, 2));
        let c = PageId::Heap(HeapPageId::new(1, 3));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn bitmap_bits_are_lsb_first() {
        let mut bits = vec![0u8; 2];
        bitmap_set(&mut bits, 0, true);
        bitmap_set(&mut bits, 9, true);
        assert_eq!(bits, vec![0b0000_0001, 0b0000_0010]);
        assert!(bitmap_get(&bits, 0));
        assert!(!bitmap_get(&bits, 1));
        assert!(bitmap_get(&bits, 9));
        bitmap_set(&mut bits, 0, false);
        assert!(!bitmap_get(&bits, 0));
    }
}
