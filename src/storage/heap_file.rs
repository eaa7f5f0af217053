//! # Heap File
//!
//! A heap file backs one table as a bare concatenation of page-sized
//! blocks; page `n` lives at byte offset `n * page_size`. The file keeps no
//! residency state of its own: reads and writes are issued by the buffer
//! pool, and the mutating paths acquire their page locks through it.
//!
//! Inserts scan from page 0 under READ_WRITE locks and take the first free
//! slot; when every page is full a fresh zeroed page is appended to the
//! file and the tuple lands there. A zero-length file reports one page so
//! the very first insert follows the same path: the scan materializes page
//! 0 on disk before locking it.
//!
//! The table id is a hash of the canonical file path, so the same file
//! opened twice resolves to the same table.

use crate::config;
use crate::database::Database;
use crate::errors::DbError;
use crate::storage::{
    DbFile, DbFileIterator, DbPage, DirtyPages, HeapPage, HeapPageId, PageId, Permissions,
    TableId, TransactionId,
};
use crate::tuple::{Tuple, TupleDesc};
use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use smallvec::smallvec;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// FNV-1a over the canonical path, folded to 32 bits.
fn table_id_for_path(path: &Path) -> TableId {
    let canonical = path.to_string_lossy();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in canonical.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash ^ (hash >> 32)) as TableId
}

#[derive(Debug)]
pub struct HeapFile {
    file: Mutex<File>,
    path: PathBuf,
    table_id: TableId,
    desc: TupleDesc,
}

impl HeapFile {
    /// Opens (creating if absent) the heap file at `path`.
    pub fn open(path: impl AsRef<Path>, desc: TupleDesc) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("opening heap file {:?}", path))?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(Self {
            table_id: table_id_for_path(&canonical),
            file: Mutex::new(file),
            path: canonical,
            desc,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Writes a zeroed page at `page_no` if the file does not reach it yet.
    /// The length check and the write are atomic under the file lock so two
    /// first inserts cannot clobber each other.
    fn materialize_page(&self, page_no: usize) -> Result<()> {
        let page_size = config::page_size();
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let offset = (page_no * page_size) as u64;
        if offset >= len {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&HeapPage::empty_page_data())?;
        }
        Ok(())
    }

    /// Appends one zeroed page and returns its page number.
    fn append_page(&self) -> Result<usize> {
        let page_size = config::page_size();
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let page_no = (len as usize) / page_size;
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&HeapPage::empty_page_data())?;
        Ok(page_no)
    }
}

impl DbFile for HeapFile {
    fn id(&self) -> TableId {
        self.table_id
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.desc
    }

    /// A zero-length file reports one page: the first insert creates it.
    fn num_pages(&self) -> Result<usize> {
        let len = self.file_len()? as usize;
        Ok(std::cmp::max(1, len.div_ceil(config::page_size())))
    }

    fn read_page(&self, pid: &PageId) -> Result<DbPage> {
        let page_size = config::page_size();
        let page_no = pid.page_no();
        let offset = (page_no * page_size) as u64;

        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        ensure!(offset < len, DbError::IllegalPage(page_no));

        let mut buf = vec![0u8; page_size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)
            .wrap_err_with(|| format!("reading page {} of {:?}", page_no, self.path))?;
        drop(file);

        let page = HeapPage::new(HeapPageId::new(self.table_id, page_no), &buf, self.desc.clone())?;
        Ok(DbPage::Heap(page))
    }

    fn write_page(&self, page: &DbPage) -> Result<()> {
        let page_size = config::page_size();
        let data = page.page_data();
        ensure!(
            data.len() == page_size,
            "heap page image is {} bytes, expected {}",
            data.len(),
            page_size
        );
        let offset = (page.id().page_no() * page_size) as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)
            .wrap_err_with(|| format!("writing page {} of {:?}", page.id().page_no(), self.path))?;
        Ok(())
    }

    fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        tuple: &mut Tuple,
    ) -> Result<DirtyPages> {
        ensure!(tuple.desc() == &self.desc, DbError::SchemaMismatch);

        let num_pages = self.num_pages()?;
        for page_no in 0..num_pages {
            self.materialize_page(page_no)?;
            let pid = PageId::Heap(HeapPageId::new(self.table_id, page_no));
            let handle = db.get_page(tid, pid, Permissions::ReadWrite)?;
            let mut guard = handle.write();
            if guard.as_heap()?.empty_slot_count() > 0 {
                guard.as_heap_mut()?.insert_tuple(tuple)?;
                guard.mark_dirty(true, tid);
                return Ok(smallvec![pid]);
            }
        }

        // Every existing page is full: grow the file by one page.
        let page_no = self.append_page()?;
        let pid = PageId::Heap(HeapPageId::new(self.table_id, page_no));
        let handle = db.get_page(tid, pid, Permissions::ReadWrite)?;
        let mut guard = handle.write();
        guard.as_heap_mut()?.insert_tuple(tuple)?;
        guard.mark_dirty(true, tid);
        Ok(smallvec![pid])
    }

    fn delete_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        tuple: &Tuple,
    ) -> Result<DirtyPages> {
        let rid = tuple.record_id().ok_or(DbError::NotFound)?;
        ensure!(rid.page_id.table_id() == self.table_id, DbError::NotFound);
        let handle = db.get_page(tid, rid.page_id, Permissions::ReadWrite)?;
        let mut guard = handle.write();
        guard.as_heap_mut()?.delete_tuple(tuple)?;
        guard.mark_dirty(true, tid);
        Ok(smallvec![rid.page_id])
    }

    fn iter<'a>(
        &self,
        db: &'a Database,
        tid: TransactionId,
    ) -> Result<Box<dyn DbFileIterator + 'a>> {
        Ok(Box::new(HeapFileIterator::new(db, tid, self.table_id)))
    }
}

/// Scans a heap file page-by-page under READ_ONLY locks, advancing to the
/// next page only once the current one is exhausted. Closed and exhausted
/// states hold no page data.
pub struct HeapFileIterator<'a> {
    db: &'a Database,
    tid: TransactionId,
    table_id: TableId,
    state: Option<ScanState>,
}

struct ScanState {
    num_pages: usize,
    page_no: usize,
    tuples: std::vec::IntoIter<Tuple>,
    pending: Option<Tuple>,
}

impl<'a> HeapFileIterator<'a> {
    pub fn new(db: &'a Database, tid: TransactionId, table_id: TableId) -> Self {
        Self { db, tid, table_id, state: None }
    }

    fn page_tuples(&self, page_no: usize) -> Result<std::vec::IntoIter<Tuple>> {
        let pid = PageId::Heap(HeapPageId::new(self.table_id, page_no));
        let handle = self.db.get_page(self.tid, pid, Permissions::ReadOnly)?;
        let guard = handle.read();
        let tuples: Vec<Tuple> = guard.as_heap()?.iter().cloned().collect();
        Ok(tuples.into_iter())
    }
}

impl DbFileIterator for HeapFileIterator<'_> {
    fn open(&mut self) -> Result<()> {
        let num_pages = self.db.db_file(self.table_id)?.num_pages()?;
        // A table that never saw an insert has no page 0 on disk yet.
        let tuples = match self.page_tuples(0) {
            Ok(tuples) => tuples,
            Err(e) if e.downcast_ref::<DbError>() == Some(&DbError::IllegalPage(0)) => {
                Vec::new().into_iter()
            }
            Err(e) => return Err(e),
        };
        self.state = Some(ScanState { num_pages, page_no: 0, tuples, pending: None });
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool> {
        let state = self.state.as_mut().ok_or(DbError::NotOpen)?;
        if state.pending.is_some() {
            return Ok(true);
        }
        loop {
            if let Some(tuple) = state.tuples.next() {
                state.pending = Some(tuple);
                return Ok(true);
            }
            if state.page_no + 1 >= state.num_pages {
                return Ok(false);
            }
            state.page_no += 1;
            let pid = PageId::Heap(HeapPageId::new(self.table_id, state.page_no));
            let handle = self.db.get_page(self.tid, pid, Permissions::ReadOnly)?;
            let guard = handle.read();
            state.tuples = guard
                .as_heap()?
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .into_iter();
        }
    }

    fn next(&mut self) -> Result<Tuple> {
        if !self.has_next()? {
            return Err(DbError::NoSuchElement.into());
        }
        let state = self.state.as_mut().ok_or(DbError::NotOpen)?;
        Ok(state.pending.take().expect("has_next staged a tuple"))
    }

    fn rewind(&mut self) -> Result<()> {
        self.close();
        self.open()
    }

    fn close(&mut self) {
        self.state = None;
    }
}
