//! # B+ Tree File
//!
//! The access method tying the tree pages together. All page traffic flows
//! through the buffer pool under the caller's transaction id; this module
//! never caches pages and never holds a page guard across a blocking call
//! on the same page.
//!
//! ## Search
//!
//! `find_leaf_page` descends from any starting page, taking READ_ONLY
//! locks on internal pages and the caller's permission on the leaf. At an
//! internal page it follows the left child of the first entry whose key is
//! `>=` the search key, or the rightmost child when every key is smaller.
//! A `None` key descends leftmost, which is how full scans begin.
//!
//! ## Insert
//!
//! The target leaf is found with READ_WRITE. A full leaf splits first: a
//! fresh page becomes the *left* sibling, the lower `floor(n/2)` tuples
//! move into it, and the first key remaining on the right half is pushed
//! into the parent, splitting internal pages recursively as needed. When
//! the parent is the root pointer, a new internal root is allocated above.
//! Parent pointers of every child touched by a split are repaired before
//! the insert lands.
//!
//! ## Delete
//!
//! After removing the tuple, a leaf below half occupancy is repaired from
//! a same-parent sibling (left preferred): redistribution when the sibling
//! has tuples to spare, merge when it is itself at minimum. Merging drains
//! the right page into the left, repairs both sibling links, deletes the
//! separator from the parent, and releases the drained page onto the free
//! list; an internal parent emptied down to its last child collapses the
//! root. Internal redistribution rotates entries through the parent: the
//! old separator descends into the receiver and a new separator rises from
//! the donor.
//!
//! ## Free pages
//!
//! Released pages are tracked by header-page bitmaps chained from the root
//! pointer. `get_empty_page` reuses a cleared bit (zeroing the stale page
//! image on disk first) before growing the file; `set_empty_page` truncates
//! when the freed page is the last one, and otherwise clears its bit,
//! extending the header chain on demand.

use crate::config::{self, ROOT_PTR_SIZE};
use crate::database::Database;
use crate::errors::DbError;
use crate::storage::{
    DbFile, DbFileIterator, DbPage, DirtyPages, PageHandle, PageId, Permissions, TableId,
    TransactionId,
};
use crate::tuple::{Tuple, TupleDesc};
use crate::types::{DataType, Op, Value};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    BTreePageId, HeaderPage, IndexPredicate, InternalPage, LeafPage, PageCategory, RootPtrPage,
};
use super::internal::Entry;

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

/// Runs a closure against the leaf behind `handle` and dirties it.
fn write_leaf<R>(
    handle: &PageHandle,
    tid: TransactionId,
    f: impl FnOnce(&mut LeafPage) -> Result<R>,
) -> Result<R> {
    let mut guard = handle.write();
    let result = f(guard.as_leaf_mut()?)?;
    guard.mark_dirty(true, tid);
    Ok(result)
}

fn write_internal<R>(
    handle: &PageHandle,
    tid: TransactionId,
    f: impl FnOnce(&mut InternalPage) -> Result<R>,
) -> Result<R> {
    let mut guard = handle.write();
    let result = f(guard.as_internal_mut()?)?;
    guard.mark_dirty(true, tid);
    Ok(result)
}

fn write_header<R>(
    handle: &PageHandle,
    tid: TransactionId,
    f: impl FnOnce(&mut HeaderPage) -> Result<R>,
) -> Result<R> {
    let mut guard = handle.write();
    let result = f(guard.as_header_mut()?)?;
    guard.mark_dirty(true, tid);
    Ok(result)
}

fn write_root_ptr<R>(
    handle: &PageHandle,
    tid: TransactionId,
    f: impl FnOnce(&mut RootPtrPage) -> Result<R>,
) -> Result<R> {
    let mut guard = handle.write();
    let result = f(guard.as_root_ptr_mut()?)?;
    guard.mark_dirty(true, tid);
    Ok(result)
}

/// Recursive descent shared by the file and its iterators. Internal pages
/// are locked READ_ONLY; the leaf is locked with `perm`.
fn locate_leaf(
    db: &Database,
    tid: TransactionId,
    key: Option<&Value>,
    pid: BTreePageId,
    perm: Permissions,
) -> Result<BTreePageId> {
    if pid.category == PageCategory::Leaf {
        db.get_page(tid, pid.into(), perm)?;
        return Ok(pid);
    }
    ensure!(
        pid.category == PageCategory::Internal,
        "search descended into a {:?} page",
        pid.category
    );

    let next = {
        let handle = db.get_page(tid, pid.into(), Permissions::ReadOnly)?;
        let guard = handle.read();
        let page = guard.as_internal()?;
        let entries = page.entries();
        ensure!(!entries.is_empty(), "internal page {} has no entries", pid.page_no);

        let mut chosen = None;
        for entry in &entries {
            let descend_left = match key {
                None => true,
                Some(k) => k.compare(Op::LessThanOrEq, &entry.key)?,
            };
            if descend_left {
                chosen = Some(entry.left);
                break;
            }
        }
        chosen.unwrap_or_else(|| entries.last().expect("nonempty").right)
    };

    locate_leaf(db, tid, key, next, perm)
}

#[derive(Debug)]
pub struct BTreeFile {
    file: Mutex<File>,
    path: PathBuf,
    table_id: TableId,
    key_field: usize,
    desc: TupleDesc,
}

impl BTreeFile {
    /// Opens (creating if absent) the tree file at `path`, keyed on
    /// `key_field` of `desc`.
    pub fn open(path: impl AsRef<Path>, key_field: usize, desc: TupleDesc) -> Result<Self> {
        let path = path.as_ref();
        ensure!(key_field < desc.num_fields(), DbError::NotFound);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("opening b+ tree file {:?}", path))?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(Self {
            table_id: table_id_for_path(&canonical),
            file: Mutex::new(file),
            path: canonical,
            key_field,
            desc,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    fn key_type(&self) -> DataType {
        self.desc.field_type(self.key_field)
    }

    fn key_of(&self, tuple: &Tuple) -> Value {
        tuple.value(self.key_field).clone()
    }

    fn leaf_pid(&self, page_no: usize) -> BTreePageId {
        BTreePageId::new(self.table_id, page_no, PageCategory::Leaf)
    }

    fn page_offset(page_no: usize) -> u64 {
        (ROOT_PTR_SIZE + (page_no - 1) * config::page_size()) as u64
    }

    /// Bootstraps an empty file (root pointer plus one blank leaf) and
    /// takes a READ_ONLY lock on the root pointer.
    fn get_root_ptr_page(&self, db: &Database, tid: TransactionId) -> Result<PageHandle> {
        {
            let mut file = self.file.lock();
            if file.metadata()?.len() == 0 {
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&RootPtrPage::empty_page_data())?;
                file.write_all(&LeafPage::empty_page_data())?;
            }
        }
        db.get_page(
            tid,
            BTreePageId::root_ptr(self.table_id).into(),
            Permissions::ReadOnly,
        )
    }

    /// Overwrites a page's on-disk image with zeros so a reallocated page
    /// never decodes as its former category.
    fn zero_page_on_disk(&self, page_no: usize) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_no)))?;
        file.write_all(&vec![0u8; config::page_size()])?;
        Ok(())
    }

    /// Appends one blank page and returns its page number.
    fn append_blank_page(&self) -> Result<usize> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        ensure!(len >= ROOT_PTR_SIZE as u64, "tree file is not bootstrapped");
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&vec![0u8; config::page_size()])?;
        Ok((len as usize - ROOT_PTR_SIZE) / config::page_size() + 1)
    }

    /// Drops every cached incarnation of `page_no`, whatever category it
    /// was last decoded as.
    fn discard_page_everywhere(&self, db: &Database, page_no: usize) {
        for category in [
            PageCategory::Header,
            PageCategory::Internal,
            PageCategory::Leaf,
        ] {
            db.buffer_pool()
                .discard_page(BTreePageId::new(self.table_id, page_no, category).into());
        }
    }

    /// Page number of a free page, reusing the header chain's first clear
    /// bit before growing the file. The chosen page is zeroed on disk.
    fn get_empty_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
    ) -> Result<usize> {
        let root_ptr = self.get_root_ptr_page(db, tid)?;
        let first_header = root_ptr.read().as_root_ptr()?.header_id();

        let mut cursor = first_header;
        let mut chain_index = 0;
        while let Some(header_pid) = cursor {
            let handle = db.get_page(tid, header_pid.into(), Permissions::ReadOnly)?;
            let (slot, next) = {
                let guard = handle.read();
                let header = guard.as_header()?;
                (header.first_empty_slot(), header.next_id())
            };
            if let Some(slot) = slot {
                let handle = db.get_page(tid, header_pid.into(), Permissions::ReadWrite)?;
                write_header(&handle, tid, |header| {
                    header.mark_slot_used(slot, true);
                    Ok(())
                })?;
                dirty.insert(header_pid.into());

                let page_no = chain_index * HeaderPage::slots_per_page() + slot;
                self.zero_page_on_disk(page_no)?;
                self.discard_page_everywhere(db, page_no);
                return Ok(page_no);
            }
            cursor = next;
            chain_index += 1;
        }

        self.append_blank_page()
    }

    /// Returns `page_no` to the free list: truncate if it is the last page
    /// of the file, otherwise clear its bit in the covering header page,
    /// creating and chaining header pages as needed.
    fn set_empty_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        page_no: usize,
    ) -> Result<()> {
        {
            let file = self.file.lock();
            let len = file.metadata()?.len();
            let num_pages = (len as usize).saturating_sub(ROOT_PTR_SIZE) / config::page_size();
            if page_no == num_pages {
                // A one-page file stays: that page is the (possibly empty) root.
                if page_no > 1 {
                    file.set_len(len - config::page_size() as u64)?;
                    drop(file);
                    self.discard_page_everywhere(db, page_no);
                }
                return Ok(());
            }
        }

        let root_ptr = self.get_root_ptr_page(db, tid)?;
        let mut header_id = root_ptr.read().as_root_ptr()?.header_id();

        if header_id.is_none() {
            let root_ptr = db.get_page(
                tid,
                BTreePageId::root_ptr(self.table_id).into(),
                Permissions::ReadWrite,
            )?;
            let header_no = self.get_empty_page(db, tid, dirty)?;
            let header_pid = BTreePageId::new(self.table_id, header_no, PageCategory::Header);
            let handle = db.get_page(tid, header_pid.into(), Permissions::ReadWrite)?;
            write_header(&handle, tid, |header| {
                header.init();
                Ok(())
            })?;
            write_root_ptr(&root_ptr, tid, |page| {
                page.set_header_id(Some(header_pid));
                Ok(())
            })?;
            dirty.insert(header_pid.into());
            dirty.insert(BTreePageId::root_ptr(self.table_id).into());
            header_id = Some(header_pid);
        }

        // Walk to the header page covering page_no.
        let slots = HeaderPage::slots_per_page();
        let mut current = header_id.expect("chain head exists");
        let mut chain_index = 0;
        while page_no >= (chain_index + 1) * slots {
            let handle = db.get_page(tid, current.into(), Permissions::ReadOnly)?;
            let next = handle.read().as_header()?.next_id();
            match next {
                Some(next_pid) => {
                    current = next_pid;
                    chain_index += 1;
                }
                None => break,
            }
        }

        // Extend the chain until it covers page_no.
        while page_no >= (chain_index + 1) * slots {
            let prev_pid = current;
            let header_no = self.get_empty_page(db, tid, dirty)?;
            let new_pid = BTreePageId::new(self.table_id, header_no, PageCategory::Header);
            let handle = db.get_page(tid, new_pid.into(), Permissions::ReadWrite)?;
            write_header(&handle, tid, |header| {
                header.init();
                header.set_prev_id(Some(prev_pid));
                Ok(())
            })?;
            let prev_handle = db.get_page(tid, prev_pid.into(), Permissions::ReadWrite)?;
            write_header(&prev_handle, tid, |header| {
                header.set_next_id(Some(new_pid));
                Ok(())
            })?;
            dirty.insert(new_pid.into());
            dirty.insert(prev_pid.into());
            current = new_pid;
            chain_index += 1;
        }

        let handle = db.get_page(tid, current.into(), Permissions::ReadWrite)?;
        write_header(&handle, tid, |header| {
            header.mark_slot_used(page_no - chain_index * slots, false);
            Ok(())
        })?;
        dirty.insert(current.into());
        Ok(())
    }

    /// Finds and locks the leaf that may contain `key` (the leftmost such
    /// leaf), descending from `pid`. A `None` key finds the leftmost leaf.
    pub fn find_leaf_page(
        &self,
        db: &Database,
        tid: TransactionId,
        key: Option<&Value>,
        pid: BTreePageId,
        perm: Permissions,
    ) -> Result<BTreePageId> {
        locate_leaf(db, tid, key, pid, perm)
    }

    /// Splits a full leaf, pushing a separator into the parent (splitting
    /// it recursively if full), and returns the half that should receive a
    /// tuple with key `key`.
    fn split_leaf_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        page_pid: BTreePageId,
        key: &Value,
    ) -> Result<BTreePageId> {
        let parent_pid = self.resolve_split_parent(db, tid, dirty, page_pid)?;

        let new_no = self.get_empty_page(db, tid, dirty)?;
        let left_pid = self.leaf_pid(new_no);
        let left_handle = db.get_page(tid, left_pid.into(), Permissions::ReadWrite)?;
        let page_handle = db.get_page(tid, page_pid.into(), Permissions::ReadWrite)?;
        dirty.insert(left_pid.into());
        dirty.insert(page_pid.into());
        dirty.insert(parent_pid.into());

        // Thread the new page in as the left sibling of the original.
        let old_left = page_handle.read().as_leaf()?.left_sibling_id();
        if let Some(neighbor_pid) = old_left {
            let handle = db.get_page(tid, neighbor_pid.into(), Permissions::ReadWrite)?;
            write_leaf(&handle, tid, |leaf| {
                leaf.set_right_sibling_id(Some(left_pid));
                Ok(())
            })?;
            dirty.insert(neighbor_pid.into());
        }
        write_leaf(&left_handle, tid, |leaf| {
            leaf.set_left_sibling_id(old_left);
            leaf.set_right_sibling_id(Some(page_pid));
            Ok(())
        })?;
        write_leaf(&page_handle, tid, |leaf| {
            leaf.set_left_sibling_id(Some(left_pid));
            Ok(())
        })?;

        // Lower half moves left; the push key is the first tuple staying
        // on the right, which also decides where the incoming key lands.
        let (to_move, push_key, goes_left) = {
            let guard = page_handle.read();
            let page = guard.as_leaf()?;
            let tuples: Vec<Tuple> = page.iter().cloned().collect();
            let move_count = tuples.len() / 2;
            let push_key = self.key_of(&tuples[move_count]);
            let mut insert_pos = None;
            for (i, t) in tuples.iter().enumerate() {
                if self.key_of(t).compare(Op::GreaterThanOrEq, key)? {
                    insert_pos = Some(i);
                    break;
                }
            }
            let goes_left = insert_pos.is_some_and(|i| i <= move_count);
            (tuples[..move_count].to_vec(), push_key, goes_left)
        };
        for tuple in &to_move {
            write_leaf(&page_handle, tid, |leaf| leaf.delete_tuple(tuple))?;
            let mut moved = tuple.clone();
            write_leaf(&left_handle, tid, |leaf| leaf.insert_tuple(&mut moved))?;
        }

        // Push the separator up, splitting the parent first if necessary.
        let parent_pid = {
            let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
            let full = parent_handle.read().as_internal()?.empty_slot_count() == 0;
            if full {
                self.split_internal_page(db, tid, dirty, parent_pid, &push_key)?
            } else {
                parent_pid
            }
        };
        let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        write_internal(&parent_handle, tid, |parent| {
            parent.insert_entry(&Entry::new(push_key.clone(), left_pid, page_pid))
        })?;
        dirty.insert(parent_pid.into());
        self.update_parent_pointers(db, tid, dirty, parent_pid)?;

        Ok(if goes_left { left_pid } else { page_pid })
    }

    /// Splits a full internal page around its middle entry, which is
    /// promoted to the parent. Returns the half that should receive an
    /// entry with key `key`.
    fn split_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        page_pid: BTreePageId,
        key: &Value,
    ) -> Result<BTreePageId> {
        let parent_pid = self.resolve_split_parent(db, tid, dirty, page_pid)?;

        let new_no = self.get_empty_page(db, tid, dirty)?;
        let left_pid = BTreePageId::new(self.table_id, new_no, PageCategory::Internal);
        let left_handle = db.get_page(tid, left_pid.into(), Permissions::ReadWrite)?;
        let page_handle = db.get_page(tid, page_pid.into(), Permissions::ReadWrite)?;
        dirty.insert(left_pid.into());
        dirty.insert(page_pid.into());
        dirty.insert(parent_pid.into());

        let (entries, move_count, goes_left) = {
            let guard = page_handle.read();
            let page = guard.as_internal()?;
            let entries = page.entries();
            let move_count = entries.len() / 2;
            let mut insert_pos = None;
            for (i, e) in entries.iter().enumerate() {
                if e.key.compare(Op::GreaterThanOrEq, key)? {
                    insert_pos = Some(i);
                    break;
                }
            }
            let goes_left = insert_pos.is_some_and(|i| i <= move_count);
            (entries, move_count, goes_left)
        };

        // Lower half moves left; the middle entry is promoted, its left
        // child staying as the left page's rightmost pointer and its right
        // child as the right page's leftmost.
        for entry in entries.iter().take(move_count) {
            write_internal(&page_handle, tid, |page| {
                page.delete_key_and_left_child(entry.slot)
            })?;
            write_internal(&left_handle, tid, |page| {
                page.insert_entry(entry).map(|_| ())
            })?;
        }
        let middle = &entries[move_count];
        write_internal(&page_handle, tid, |page| {
            page.delete_key_and_left_child(middle.slot)
        })?;
        let push = Entry::new(middle.key.clone(), left_pid, page_pid);

        let parent_pid = {
            let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
            let full = parent_handle.read().as_internal()?.empty_slot_count() == 0;
            if full {
                self.split_internal_page(db, tid, dirty, parent_pid, &push.key)?
            } else {
                parent_pid
            }
        };
        let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        write_internal(&parent_handle, tid, |parent| {
            parent.insert_entry(&push).map(|_| ())
        })?;
        dirty.insert(parent_pid.into());

        self.update_parent_pointers(db, tid, dirty, parent_pid)?;
        self.update_parent_pointers(db, tid, dirty, page_pid)?;
        self.update_parent_pointers(db, tid, dirty, left_pid)?;

        Ok(if goes_left { left_pid } else { page_pid })
    }

    /// The parent a splitting page pushes into. If the page was the root,
    /// allocates a fresh internal page, records it in the root pointer, and
    /// returns it.
    fn resolve_split_parent(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        page_pid: BTreePageId,
    ) -> Result<BTreePageId> {
        let parent_pid = {
            let handle = db.get_page(tid, page_pid.into(), Permissions::ReadWrite)?;
            let guard = handle.read();
            match page_pid.category {
                PageCategory::Leaf => guard.as_leaf()?.parent_id(),
                _ => guard.as_internal()?.parent_id(),
            }
        };
        if parent_pid.category != PageCategory::RootPtr {
            return Ok(parent_pid);
        }

        let new_root_no = self.get_empty_page(db, tid, dirty)?;
        let new_root_pid = BTreePageId::new(self.table_id, new_root_no, PageCategory::Internal);
        let root_ptr_pid = BTreePageId::root_ptr(self.table_id);
        let root_ptr = db.get_page(tid, root_ptr_pid.into(), Permissions::ReadWrite)?;
        write_root_ptr(&root_ptr, tid, |page| page.set_root_id(Some(new_root_pid)))?;
        dirty.insert(root_ptr_pid.into());
        Ok(new_root_pid)
    }

    /// Rewrites the parent pointer of every child of `internal_pid` that
    /// still points elsewhere.
    fn update_parent_pointers(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        internal_pid: BTreePageId,
    ) -> Result<()> {
        let children = {
            let handle = db.get_page(tid, internal_pid.into(), Permissions::ReadOnly)?;
            let guard = handle.read();
            guard.as_internal()?.children()
        };
        for child in children {
            let handle = db.get_page(tid, child.into(), Permissions::ReadOnly)?;
            let current = {
                let guard = handle.read();
                match child.category {
                    PageCategory::Leaf => guard.as_leaf()?.parent_id(),
                    _ => guard.as_internal()?.parent_id(),
                }
            };
            if current != internal_pid {
                let handle = db.get_page(tid, child.into(), Permissions::ReadWrite)?;
                let mut guard = handle.write();
                match child.category {
                    PageCategory::Leaf => guard.as_leaf_mut()?.set_parent_id(&internal_pid)?,
                    _ => guard.as_internal_mut()?.set_parent_id(&internal_pid)?,
                }
                guard.mark_dirty(true, tid);
                drop(guard);
                dirty.insert(child.into());
            }
        }
        Ok(())
    }

    /// Locates the same-parent siblings of `page_pid` through the parent's
    /// entry list. Returns (left sibling + entry, right sibling + entry).
    #[allow(clippy::type_complexity)]
    fn sibling_entries(
        &self,
        db: &Database,
        tid: TransactionId,
        page_pid: BTreePageId,
        parent_pid: BTreePageId,
    ) -> Result<(Option<(BTreePageId, Entry)>, Option<(BTreePageId, Entry)>)> {
        let handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        let guard = handle.read();
        let parent = guard.as_internal()?;
        let mut left = None;
        let mut right = None;
        for entry in parent.entries() {
            if entry.left == page_pid {
                right = Some((entry.right, entry));
                break;
            } else if entry.right == page_pid {
                left = Some((entry.left, entry.clone()));
            }
        }
        Ok((left, right))
    }

    /// Repairs a leaf that fell below half occupancy: redistribute from a
    /// same-parent sibling with tuples to spare, merge otherwise. The left
    /// sibling is preferred.
    fn handle_min_occupancy_leaf_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        page_pid: BTreePageId,
    ) -> Result<()> {
        let parent_pid = {
            let handle = db.get_page(tid, page_pid.into(), Permissions::ReadWrite)?;
            let guard = handle.read();
            guard.as_leaf()?.parent_id()
        };
        if parent_pid.category == PageCategory::RootPtr {
            // The root may underflow freely.
            return Ok(());
        }

        let (left, right) = self.sibling_entries(db, tid, page_pid, parent_pid)?;
        let capacity = LeafPage::capacity(&self.desc);
        let max_empty = capacity - capacity / 2;

        if let Some((sibling_pid, entry)) = left {
            let sibling = db.get_page(tid, sibling_pid.into(), Permissions::ReadWrite)?;
            let sibling_empty = sibling.read().as_leaf()?.empty_slot_count();
            if sibling_empty >= max_empty {
                self.merge_leaf_pages(db, tid, dirty, sibling_pid, page_pid, parent_pid, &entry)
            } else {
                self.redistribute_leaf_tuples(
                    db, tid, dirty, sibling_pid, page_pid, parent_pid, &entry, true,
                )
            }
        } else if let Some((sibling_pid, entry)) = right {
            let sibling = db.get_page(tid, sibling_pid.into(), Permissions::ReadWrite)?;
            let sibling_empty = sibling.read().as_leaf()?.empty_slot_count();
            if sibling_empty >= max_empty {
                self.merge_leaf_pages(db, tid, dirty, page_pid, sibling_pid, parent_pid, &entry)
            } else {
                self.redistribute_leaf_tuples(
                    db, tid, dirty, page_pid, sibling_pid, parent_pid, &entry, false,
                )
            }
        } else {
            bail!(
                "leaf {} has a parent but no entry referencing it",
                page_pid.page_no
            );
        }
    }

    /// Moves tuples one at a time from the richer leaf to the poorer one
    /// until their counts differ by at most one, then refreshes the
    /// parent's separator to the right page's first key.
    #[allow(clippy::too_many_arguments)]
    fn redistribute_leaf_tuples(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        left_pid: BTreePageId,
        right_pid: BTreePageId,
        parent_pid: BTreePageId,
        entry: &Entry,
        donor_is_left: bool,
    ) -> Result<()> {
        let left_handle = db.get_page(tid, left_pid.into(), Permissions::ReadWrite)?;
        let right_handle = db.get_page(tid, right_pid.into(), Permissions::ReadWrite)?;

        loop {
            let (donor, receiver) = if donor_is_left {
                (&left_handle, &right_handle)
            } else {
                (&right_handle, &left_handle)
            };
            let (donor_count, moved) = {
                let guard = donor.read();
                let leaf = guard.as_leaf()?;
                let tuple = if donor_is_left {
                    leaf.last_tuple().cloned()
                } else {
                    leaf.first_tuple().cloned()
                };
                (leaf.tuple_count(), tuple)
            };
            let receiver_count = receiver.read().as_leaf()?.tuple_count();
            if donor_count <= receiver_count {
                break;
            }
            let tuple = moved.expect("richer leaf is nonempty");
            write_leaf(donor, tid, |leaf| leaf.delete_tuple(&tuple))?;
            let mut moved = tuple;
            write_leaf(receiver, tid, |leaf| leaf.insert_tuple(&mut moved))?;
        }

        let separator = {
            let guard = right_handle.read();
            self.key_of(guard.as_leaf()?.first_tuple().ok_or(DbError::NotFound)?)
        };
        let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        write_internal(&parent_handle, tid, |parent| {
            parent.update_key(entry.slot, separator)
        })?;

        dirty.insert(left_pid.into());
        dirty.insert(right_pid.into());
        dirty.insert(parent_pid.into());
        Ok(())
    }

    /// Merges two sibling leaves: drains the right page into the left,
    /// repairs both sibling links, deletes the parent's separator, and
    /// releases the right page. Cascades into the parent when it empties or
    /// falls below half occupancy.
    #[allow(clippy::too_many_arguments)]
    fn merge_leaf_pages(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        left_pid: BTreePageId,
        right_pid: BTreePageId,
        parent_pid: BTreePageId,
        entry: &Entry,
    ) -> Result<()> {
        let left_handle = db.get_page(tid, left_pid.into(), Permissions::ReadWrite)?;
        let right_handle = db.get_page(tid, right_pid.into(), Permissions::ReadWrite)?;

        let tuples: Vec<Tuple> = {
            let guard = right_handle.read();
            guard.as_leaf()?.iter().cloned().collect()
        };
        for tuple in tuples {
            write_leaf(&right_handle, tid, |leaf| leaf.delete_tuple(&tuple))?;
            let mut moved = tuple;
            write_leaf(&left_handle, tid, |leaf| leaf.insert_tuple(&mut moved))?;
        }

        // The drained page leaves the sibling list in both directions.
        let new_right = right_handle.read().as_leaf()?.right_sibling_id();
        write_leaf(&left_handle, tid, |leaf| {
            leaf.set_right_sibling_id(new_right);
            Ok(())
        })?;
        if let Some(neighbor_pid) = new_right {
            let handle = db.get_page(tid, neighbor_pid.into(), Permissions::ReadWrite)?;
            write_leaf(&handle, tid, |leaf| {
                leaf.set_left_sibling_id(Some(left_pid));
                Ok(())
            })?;
            dirty.insert(neighbor_pid.into());
        }

        let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        write_internal(&parent_handle, tid, |parent| {
            parent.delete_key_and_right_child(entry.slot)
        })?;

        dirty.insert(left_pid.into());
        dirty.insert(right_pid.into());
        dirty.insert(parent_pid.into());
        self.set_empty_page(db, tid, dirty, right_pid.page_no)?;
        self.rebalance_parent_after_delete(db, tid, dirty, parent_pid, left_pid)
    }

    /// Repairs an internal page that fell below half occupancy, preferring
    /// the left sibling like the leaf path.
    fn handle_min_occupancy_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        page_pid: BTreePageId,
    ) -> Result<()> {
        let parent_pid = {
            let handle = db.get_page(tid, page_pid.into(), Permissions::ReadWrite)?;
            let guard = handle.read();
            guard.as_internal()?.parent_id()
        };
        if parent_pid.category == PageCategory::RootPtr {
            return Ok(());
        }

        let (left, right) = self.sibling_entries(db, tid, page_pid, parent_pid)?;
        let capacity = InternalPage::capacity(self.key_type());
        let max_empty = capacity - capacity / 2;

        if let Some((sibling_pid, entry)) = left {
            let sibling = db.get_page(tid, sibling_pid.into(), Permissions::ReadWrite)?;
            let sibling_empty = sibling.read().as_internal()?.empty_slot_count();
            if sibling_empty >= max_empty {
                self.merge_internal_pages(db, tid, dirty, sibling_pid, page_pid, parent_pid, &entry)
            } else {
                self.redistribute_internal_entries(
                    db, tid, dirty, sibling_pid, page_pid, parent_pid, &entry, true,
                )
            }
        } else if let Some((sibling_pid, entry)) = right {
            let sibling = db.get_page(tid, sibling_pid.into(), Permissions::ReadWrite)?;
            let sibling_empty = sibling.read().as_internal()?.empty_slot_count();
            if sibling_empty >= max_empty {
                self.merge_internal_pages(db, tid, dirty, page_pid, sibling_pid, parent_pid, &entry)
            } else {
                self.redistribute_internal_entries(
                    db, tid, dirty, page_pid, sibling_pid, parent_pid, &entry, false,
                )
            }
        } else {
            bail!(
                "internal page {} has a parent but no entry referencing it",
                page_pid.page_no
            );
        }
    }

    /// Rotates entries through the parent one at a time until the sibling
    /// counts differ by at most one: the parent's separator descends into
    /// the receiver and the donor's edge key rises to replace it.
    #[allow(clippy::too_many_arguments)]
    fn redistribute_internal_entries(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        left_pid: BTreePageId,
        right_pid: BTreePageId,
        parent_pid: BTreePageId,
        entry: &Entry,
        donor_is_left: bool,
    ) -> Result<()> {
        let left_handle = db.get_page(tid, left_pid.into(), Permissions::ReadWrite)?;
        let right_handle = db.get_page(tid, right_pid.into(), Permissions::ReadWrite)?;
        let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        let mut separator = entry.key.clone();

        loop {
            let donor_count = if donor_is_left {
                left_handle.read().as_internal()?.entry_count()
            } else {
                right_handle.read().as_internal()?.entry_count()
            };
            let receiver_count = if donor_is_left {
                right_handle.read().as_internal()?.entry_count()
            } else {
                left_handle.read().as_internal()?.entry_count()
            };
            if donor_count <= receiver_count {
                break;
            }

            if donor_is_left {
                let moved = left_handle
                    .read()
                    .as_internal()?
                    .last_entry()
                    .ok_or(DbError::NotFound)?;
                write_internal(&left_handle, tid, |page| {
                    page.delete_key_and_right_child(moved.slot)
                })?;
                let receiver_leftmost = right_handle.read().as_internal()?.leftmost_child_id()?;
                write_internal(&right_handle, tid, |page| {
                    page.insert_entry(&Entry::new(separator.clone(), moved.right, receiver_leftmost))
                        .map(|_| ())
                })?;
                separator = moved.key;
            } else {
                let moved = right_handle
                    .read()
                    .as_internal()?
                    .first_entry()
                    .ok_or(DbError::NotFound)?;
                write_internal(&right_handle, tid, |page| {
                    page.delete_key_and_left_child(moved.slot)
                })?;
                let receiver_rightmost = left_handle.read().as_internal()?.rightmost_child_id()?;
                write_internal(&left_handle, tid, |page| {
                    page.insert_entry(&Entry::new(separator.clone(), receiver_rightmost, moved.left))
                        .map(|_| ())
                })?;
                separator = moved.key;
            }
            write_internal(&parent_handle, tid, |parent| {
                parent.update_key(entry.slot, separator.clone())
            })?;
        }

        dirty.insert(left_pid.into());
        dirty.insert(right_pid.into());
        dirty.insert(parent_pid.into());
        self.update_parent_pointers(db, tid, dirty, left_pid)?;
        self.update_parent_pointers(db, tid, dirty, right_pid)
    }

    /// Merges two sibling internal pages: the parent's separator descends
    /// as a bridging entry, the right page drains into the left, the
    /// separator leaves the parent, and the right page is released.
    #[allow(clippy::too_many_arguments)]
    fn merge_internal_pages(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        left_pid: BTreePageId,
        right_pid: BTreePageId,
        parent_pid: BTreePageId,
        entry: &Entry,
    ) -> Result<()> {
        let left_handle = db.get_page(tid, left_pid.into(), Permissions::ReadWrite)?;
        let right_handle = db.get_page(tid, right_pid.into(), Permissions::ReadWrite)?;

        let bridge = {
            let left_guard = left_handle.read();
            let right_guard = right_handle.read();
            Entry::new(
                entry.key.clone(),
                left_guard.as_internal()?.rightmost_child_id()?,
                right_guard.as_internal()?.leftmost_child_id()?,
            )
        };
        write_internal(&left_handle, tid, |page| {
            page.insert_entry(&bridge).map(|_| ())
        })?;

        let drained = right_handle.read().as_internal()?.entries();
        for moved in drained {
            write_internal(&right_handle, tid, |page| {
                page.delete_key_and_left_child(moved.slot)
            })?;
            write_internal(&left_handle, tid, |page| {
                page.insert_entry(&moved).map(|_| ())
            })?;
        }

        let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        write_internal(&parent_handle, tid, |parent| {
            parent.delete_key_and_right_child(entry.slot)
        })?;

        dirty.insert(left_pid.into());
        dirty.insert(right_pid.into());
        dirty.insert(parent_pid.into());
        self.update_parent_pointers(db, tid, dirty, left_pid)?;
        self.set_empty_page(db, tid, dirty, right_pid.page_no)?;
        self.rebalance_parent_after_delete(db, tid, dirty, parent_pid, left_pid)
    }

    /// After a merge removed a separator from `parent_pid`: collapse the
    /// root when the parent emptied under the root pointer, or cascade the
    /// min-occupancy repair when it fell below half full.
    fn rebalance_parent_after_delete(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut HashSet<PageId>,
        parent_pid: BTreePageId,
        merged_child: BTreePageId,
    ) -> Result<()> {
        let parent_handle = db.get_page(tid, parent_pid.into(), Permissions::ReadWrite)?;
        let (entry_count, empty_slots, grandparent) = {
            let guard = parent_handle.read();
            let parent = guard.as_internal()?;
            (parent.entry_count(), parent.empty_slot_count(), parent.parent_id())
        };

        if entry_count == 0 {
            ensure!(
                grandparent.category == PageCategory::RootPtr,
                "internal page {} emptied below the root",
                parent_pid.page_no
            );
            let root_ptr_pid = BTreePageId::root_ptr(self.table_id);
            let root_ptr = db.get_page(tid, root_ptr_pid.into(), Permissions::ReadWrite)?;
            write_root_ptr(&root_ptr, tid, |page| page.set_root_id(Some(merged_child)))?;
            dirty.insert(root_ptr_pid.into());

            let child_handle = db.get_page(tid, merged_child.into(), Permissions::ReadWrite)?;
            {
                let mut guard = child_handle.write();
                match merged_child.category {
                    PageCategory::Leaf => guard.as_leaf_mut()?.set_parent_id(&root_ptr_pid)?,
                    _ => guard.as_internal_mut()?.set_parent_id(&root_ptr_pid)?,
                }
                guard.mark_dirty(true, tid);
            }
            dirty.insert(merged_child.into());
            return self.set_empty_page(db, tid, dirty, parent_pid.page_no);
        }

        let capacity = InternalPage::capacity(self.key_type());
        if empty_slots > capacity - capacity / 2 {
            self.handle_min_occupancy_internal_page(db, tid, dirty, parent_pid)?;
        }
        Ok(())
    }

    /// An iterator over tuples whose key satisfies `predicate`, in key
    /// order.
    pub fn index_iter<'a>(
        &self,
        db: &'a Database,
        tid: TransactionId,
        predicate: IndexPredicate,
    ) -> BTreeSearchIterator<'a> {
        BTreeSearchIterator::new(db, tid, self.table_id, self.key_field, predicate)
    }
}

impl DbFile for BTreeFile {
    fn id(&self) -> TableId {
        self.table_id
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.desc
    }

    fn num_pages(&self) -> Result<usize> {
        let len = self.file.lock().metadata()?.len() as usize;
        Ok(len.saturating_sub(ROOT_PTR_SIZE) / config::page_size())
    }

    fn read_page(&self, pid: &PageId) -> Result<DbPage> {
        let PageId::BTree(pid) = pid else {
            bail!("b+ tree file asked for a non-tree page {:?}", pid)
        };
        let page_size = config::page_size();

        if pid.category == PageCategory::RootPtr {
            let mut buf = vec![0u8; ROOT_PTR_SIZE];
            let mut file = self.file.lock();
            if file.metadata()?.len() == 0 {
                // A tree file is born empty: no root, no headers.
                return Ok(DbPage::RootPtr(RootPtrPage::new(*pid, &buf)?));
            }
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)
                .wrap_err_with(|| format!("reading root pointer of {:?}", self.path))?;
            return Ok(DbPage::RootPtr(RootPtrPage::new(*pid, &buf)?));
        }

        ensure!(pid.page_no >= 1, DbError::IllegalPage(pid.page_no));
        let offset = Self::page_offset(pid.page_no);
        let mut buf = vec![0u8; page_size];
        {
            let mut file = self.file.lock();
            let len = file.metadata()?.len();
            ensure!(
                offset + page_size as u64 <= len,
                DbError::IllegalPage(pid.page_no)
            );
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)
                .wrap_err_with(|| format!("reading page {} of {:?}", pid.page_no, self.path))?;
        }

        match pid.category {
            PageCategory::Header => Ok(DbPage::Header(HeaderPage::new(*pid, &buf)?)),
            PageCategory::Internal => {
                Ok(DbPage::Internal(InternalPage::new(*pid, &buf, self.key_type())?))
            }
            PageCategory::Leaf => Ok(DbPage::Leaf(LeafPage::new(
                *pid,
                &buf,
                self.desc.clone(),
                self.key_field,
            )?)),
            PageCategory::RootPtr => unreachable!("handled above"),
        }
    }

    fn write_page(&self, page: &DbPage) -> Result<()> {
        let PageId::BTree(pid) = page.id() else {
            bail!("b+ tree file asked to write a non-tree page {:?}", page.id())
        };
        let data = page.page_data();
        let offset = if pid.category == PageCategory::RootPtr {
            0
        } else {
            Self::page_offset(pid.page_no)
        };
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)
            .wrap_err_with(|| format!("writing page {} of {:?}", pid.page_no, self.path))?;
        Ok(())
    }

    fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        tuple: &mut Tuple,
    ) -> Result<DirtyPages> {
        ensure!(tuple.desc() == &self.desc, DbError::SchemaMismatch);
        let mut dirty: HashSet<PageId> = HashSet::new();

        let root_ptr = self.get_root_ptr_page(db, tid)?;
        let root_id = root_ptr.read().as_root_ptr()?.root_id();
        let root_id = match root_id {
            Some(root_id) => root_id,
            None => {
                // Empty tree: the bootstrap leaf becomes the root.
                let root_ptr_pid = BTreePageId::root_ptr(self.table_id);
                let handle = db.get_page(tid, root_ptr_pid.into(), Permissions::ReadWrite)?;
                let leaf_pid = self.leaf_pid(self.num_pages()?);
                write_root_ptr(&handle, tid, |page| page.set_root_id(Some(leaf_pid)))?;
                dirty.insert(root_ptr_pid.into());
                leaf_pid
            }
        };

        let key = self.key_of(tuple);
        let mut leaf_pid =
            self.find_leaf_page(db, tid, Some(&key), root_id, Permissions::ReadWrite)?;
        let full = {
            let handle = db.get_page(tid, leaf_pid.into(), Permissions::ReadWrite)?;
            let guard = handle.read();
            guard.as_leaf()?.empty_slot_count() == 0
        };
        if full {
            leaf_pid = self.split_leaf_page(db, tid, &mut dirty, leaf_pid, &key)?;
        }

        let handle = db.get_page(tid, leaf_pid.into(), Permissions::ReadWrite)?;
        write_leaf(&handle, tid, |leaf| leaf.insert_tuple(tuple))?;
        dirty.insert(leaf_pid.into());

        Ok(dirty.into_iter().collect())
    }

    fn delete_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        tuple: &Tuple,
    ) -> Result<DirtyPages> {
        let rid = tuple.record_id().ok_or(DbError::NotFound)?;
        ensure!(rid.page_id.table_id() == self.table_id, DbError::NotFound);
        let mut dirty: HashSet<PageId> = HashSet::new();

        let leaf_pid = self.leaf_pid(rid.page_id.page_no());
        let handle = db.get_page(tid, leaf_pid.into(), Permissions::ReadWrite)?;
        let empty_slots = write_leaf(&handle, tid, |leaf| {
            leaf.delete_tuple(tuple)?;
            Ok(leaf.empty_slot_count())
        })?;
        dirty.insert(leaf_pid.into());

        let capacity = LeafPage::capacity(&self.desc);
        if empty_slots > capacity - capacity / 2 {
            self.handle_min_occupancy_leaf_page(db, tid, &mut dirty, leaf_pid)?;
        }

        Ok(dirty.into_iter().collect())
    }

    fn iter<'a>(
        &self,
        db: &'a Database,
        tid: TransactionId,
    ) -> Result<Box<dyn DbFileIterator + 'a>> {
        Ok(Box::new(BTreeFileIterator::new(db, tid, self.table_id)))
    }
}

/// Full scan: leftmost leaf, then the right-sibling chain, all under
/// READ_ONLY locks. Yields tuples in key order.
pub struct BTreeFileIterator<'a> {
    db: &'a Database,
    tid: TransactionId,
    table_id: TableId,
    state: Option<TreeScanState>,
}

struct TreeScanState {
    tuples: std::vec::IntoIter<Tuple>,
    next_leaf: Option<BTreePageId>,
    pending: Option<Tuple>,
}

/// Snapshot of one leaf: its tuples and its right sibling.
fn load_leaf(
    db: &Database,
    tid: TransactionId,
    pid: BTreePageId,
) -> Result<(Vec<Tuple>, Option<BTreePageId>)> {
    let handle = db.get_page(tid, pid.into(), Permissions::ReadOnly)?;
    let guard = handle.read();
    let leaf = guard.as_leaf()?;
    Ok((leaf.iter().cloned().collect(), leaf.right_sibling_id()))
}

fn leftmost_leaf(db: &Database, tid: TransactionId, table_id: TableId) -> Result<Option<BTreePageId>> {
    let root_ptr_pid = BTreePageId::root_ptr(table_id);
    let handle = db.get_page(tid, root_ptr_pid.into(), Permissions::ReadOnly)?;
    let root_id = handle.read().as_root_ptr()?.root_id();
    match root_id {
        None => Ok(None),
        Some(root_id) => Ok(Some(locate_leaf(db, tid, None, root_id, Permissions::ReadOnly)?)),
    }
}

impl<'a> BTreeFileIterator<'a> {
    pub fn new(db: &'a Database, tid: TransactionId, table_id: TableId) -> Self {
        Self { db, tid, table_id, state: None }
    }
}

impl DbFileIterator for BTreeFileIterator<'_> {
    fn open(&mut self) -> Result<()> {
        let state = match leftmost_leaf(self.db, self.tid, self.table_id)? {
            None => TreeScanState {
                tuples: Vec::new().into_iter(),
                next_leaf: None,
                pending: None,
            },
            Some(leaf_pid) => {
                let (tuples, next_leaf) = load_leaf(self.db, self.tid, leaf_pid)?;
                TreeScanState { tuples: tuples.into_iter(), next_leaf, pending: None }
            }
        };
        self.state = Some(state);
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
            let Some(next) = state.next_leaf else { return Ok(false) };
            let (tuples, next_leaf) = load_leaf(self.db, self.tid, next)?;
            state.tuples = tuples.into_iter();
            state.next_leaf = next_leaf;
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

/// Index scan on `(op, key)`: starts at the matching leaf for
/// Equals/Gt/Ge, at the leftmost leaf for Lt/Le, and short-circuits once
/// the sorted order proves no further tuple can match.
pub struct BTreeSearchIterator<'a> {
    db: &'a Database,
    tid: TransactionId,
    table_id: TableId,
    key_field: usize,
    predicate: IndexPredicate,
    state: Option<TreeScanState>,
}

impl<'a> BTreeSearchIterator<'a> {
    pub fn new(
        db: &'a Database,
        tid: TransactionId,
        table_id: TableId,
        key_field: usize,
        predicate: IndexPredicate,
    ) -> Self {
        Self { db, tid, table_id, key_field, predicate, state: None }
    }
}

impl DbFileIterator for BTreeSearchIterator<'_> {
    fn open(&mut self) -> Result<()> {
        let root_ptr_pid = BTreePageId::root_ptr(self.table_id);
        let handle = self.db.get_page(self.tid, root_ptr_pid.into(), Permissions::ReadOnly)?;
        let root_id = handle.read().as_root_ptr()?.root_id();

        let leaf_pid = match root_id {
            None => None,
            Some(root_id) => {
                let key = match self.predicate.op {
                    Op::Equals | Op::GreaterThan | Op::GreaterThanOrEq => {
                        Some(&self.predicate.value)
                    }
                    _ => None,
                };
                Some(locate_leaf(self.db, self.tid, key, root_id, Permissions::ReadOnly)?)
            }
        };

        let state = match leaf_pid {
            None => TreeScanState {
                tuples: Vec::new().into_iter(),
                next_leaf: None,
                pending: None,
            },
            Some(leaf_pid) => {
                let (tuples, next_leaf) = load_leaf(self.db, self.tid, leaf_pid)?;
                TreeScanState { tuples: tuples.into_iter(), next_leaf, pending: None }
            }
        };
        self.state = Some(state);
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool> {
        let predicate = self.predicate.clone();
        let key_field = self.key_field;
        let state = self.state.as_mut().ok_or(DbError::NotOpen)?;
        if state.pending.is_some() {
            return Ok(true);
        }
        loop {
            while let Some(tuple) = state.tuples.next() {
                let key = tuple.value(key_field);
                if key.compare(predicate.op, &predicate.value)? {
                    state.pending = Some(tuple);
                    return Ok(true);
                }
                // Sorted exhaustion: below-key scans end at the first
                // failure, equality scans end once the key is passed.
                match predicate.op {
                    Op::LessThan | Op::LessThanOrEq => return Ok(false),
                    Op::Equals if key.compare(Op::GreaterThan, &predicate.value)? => {
                        return Ok(false)
                    }
                    _ => {}
                }
            }
            let Some(next) = state.next_leaf else { return Ok(false) };
            let (tuples, next_leaf) = load_leaf(self.db, self.tid, next)?;
            state.tuples = tuples.into_iter();
            state.next_leaf = next_leaf;
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
