//! # B+ Tree Internal Page
//!
//! Internal pages hold `m` sorted keys separating `m + 1` child pointers.
//! Slot 0 carries only the leftmost child pointer; slots `1..=m` each carry
//! one key and the child to its right:
//!
//! ```text
//! Offset              Size          Field
//! ------              ------------  -----------------------------------
//! 0                   4             parent page-no (0 = root-ptr)
//! 4                   1             category of every child (leaf/internal)
//! 5                   header        occupancy bitmap over m + 1 slots
//! 5 + header          m * key_size  keys for slots 1..=m
//! 5 + header + keys   (m + 1) * 4   child page-nos for slots 0..=m
//! ```
//!
//! `m` solves `m * ((key_size + 4) * 8 + 1) <= (page_size - 5 - 4) * 8`.
//!
//! The logical unit is the [`Entry`]: a key with its left and right child.
//! Adjacent entries share a child, so inserting an entry matches one of its
//! children against an existing pointer and splices the other in beside it,
//! shifting slots toward the nearest vacancy to preserve key order.

use crate::config;
use crate::errors::DbError;
use crate::storage::{
    bitmap_get, bitmap_set, parse_zerocopy, write_zerocopy, PageId, TransactionId,
};
use crate::types::{DataType, Value};
use eyre::{bail, ensure, Result};
use std::cmp::Ordering;
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{BTreePageId, PageCategory};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct InternalHeader {
    parent: U32,
    child_category: u8,
}

impl InternalHeader {
    zerocopy_accessors! {
        parent: u32,
    }
}

const HEADER_BLOCK_SIZE: usize = 5;

/// One key and the two children it separates. `slot` names the key's slot
/// in its page (the right child's slot), so callers can delete or update
/// the entry they iterated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Value,
    pub left: BTreePageId,
    pub right: BTreePageId,
    pub slot: usize,
}

impl Entry {
    pub fn new(key: Value, left: BTreePageId, right: BTreePageId) -> Self {
        Self { key, left, right, slot: 0 }
    }
}

#[derive(Debug)]
pub struct InternalPage {
    pid: BTreePageId,
    key_type: DataType,
    header: InternalHeader,
    used: Vec<bool>,
    keys: Vec<Option<Value>>,
    children: Vec<u32>,
    dirty: Option<TransactionId>,
}

impl InternalPage {
    /// Maximum number of entries (keys) on a page: `m`.
    pub fn capacity(key_type: DataType) -> usize {
        let usable_bits = (config::page_size() - HEADER_BLOCK_SIZE - 4) * 8;
        usable_bits / ((key_type.size() + 4) * 8 + 1)
    }

    fn slot_count(key_type: DataType) -> usize {
        Self::capacity(key_type) + 1
    }

    fn header_bytes(key_type: DataType) -> usize {
        Self::slot_count(key_type).div_ceil(8)
    }

    pub fn empty_page_data() -> Vec<u8> {
        vec![0u8; config::page_size()]
    }

    pub fn new(pid: BTreePageId, data: &[u8], key_type: DataType) -> Result<Self> {
        ensure!(
            pid.category == PageCategory::Internal,
            "internal page constructed with {:?} id",
            pid.category
        );
        ensure!(
            data.len() == config::page_size(),
            "internal page image is {} bytes, expected {}",
            data.len(),
            config::page_size()
        );

        let header = *parse_zerocopy::<InternalHeader>(data, "InternalHeader")?;
        let slots = Self::slot_count(key_type);
        let header_bytes = Self::header_bytes(key_type);
        let bitmap = &data[HEADER_BLOCK_SIZE..HEADER_BLOCK_SIZE + header_bytes];
        let key_size = key_type.size();
        let key_base = HEADER_BLOCK_SIZE + header_bytes;
        let child_base = key_base + (slots - 1) * key_size;

        let mut used = Vec::with_capacity(slots);
        let mut keys = Vec::with_capacity(slots);
        let mut children = Vec::with_capacity(slots);
        for i in 0..slots {
            let in_use = bitmap_get(bitmap, i);
            used.push(in_use);
            if in_use && i > 0 {
                let start = key_base + (i - 1) * key_size;
                keys.push(Some(Value::deserialize(key_type, &data[start..start + key_size])?));
            } else {
                keys.push(None);
            }
            let start = child_base + i * 4;
            let child =
                u32::from_be_bytes(data[start..start + 4].try_into().expect("4-byte slice"));
            children.push(if in_use { child } else { 0 });
        }

        Ok(Self { pid, key_type, header, used, keys, children, dirty: None })
    }

    pub fn id(&self) -> PageId {
        PageId::BTree(self.pid)
    }

    pub fn btree_id(&self) -> BTreePageId {
        self.pid
    }

    pub fn page_data(&self) -> Vec<u8> {
        let mut data = vec![0u8; config::page_size()];
        write_zerocopy(&self.header, &mut data, "InternalHeader").expect("fixed-size block");
        let slots = self.used.len();
        let header_bytes = Self::header_bytes(self.key_type);
        let key_size = self.key_type.size();
        let key_base = HEADER_BLOCK_SIZE + header_bytes;
        let child_base = key_base + (slots - 1) * key_size;

        for i in 0..slots {
            if !self.used[i] {
                continue;
            }
            bitmap_set(&mut data[HEADER_BLOCK_SIZE..HEADER_BLOCK_SIZE + header_bytes], i, true);
            if i > 0 {
                let start = key_base + (i - 1) * key_size;
                self.keys[i]
                    .as_ref()
                    .expect("used slot above 0 has a key")
                    .serialize_into(&mut data[start..start + key_size])
                    .expect("key width matches type width");
            }
            let start = child_base + i * 4;
            data[start..start + 4].copy_from_slice(&self.children[i].to_be_bytes());
        }
        data
    }

    /// Category of every child of this page.
    pub fn child_category(&self) -> PageCategory {
        PageCategory::from_byte(self.header.child_category).unwrap_or(PageCategory::Leaf)
    }

    fn child_pid(&self, slot: usize) -> BTreePageId {
        BTreePageId::new(self.pid.table_id, self.children[slot] as usize, self.child_category())
    }

    /// Entries in key order: `(key, left child, right child)` per used key
    /// slot, adjacent entries sharing a child.
    pub fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::new();
        let mut prev_child: Option<usize> = if self.used[0] { Some(0) } else { None };
        for i in 1..self.used.len() {
            if !self.used[i] {
                continue;
            }
            let left_slot = prev_child.expect("entry has a child pointer to its left");
            out.push(Entry {
                key: self.keys[i].clone().expect("used slot has a key"),
                left: self.child_pid(left_slot),
                right: self.child_pid(i),
                slot: i,
            });
            prev_child = Some(i);
        }
        out
    }

    /// Child pointers in order, one per used slot.
    pub fn children(&self) -> Vec<BTreePageId> {
        (0..self.used.len())
            .filter(|&i| self.used[i])
            .map(|i| self.child_pid(i))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.used.iter().skip(1).filter(|&&u| u).count()
    }

    pub fn empty_slot_count(&self) -> usize {
        Self::capacity(self.key_type) - self.entry_count()
    }

    /// Leftmost child pointer of a non-empty page.
    pub fn leftmost_child_id(&self) -> Result<BTreePageId> {
        ensure!(self.used[0], "internal page has no children");
        Ok(self.child_pid(0))
    }

    /// Rightmost child pointer of a non-empty page.
    pub fn rightmost_child_id(&self) -> Result<BTreePageId> {
        let last = (0..self.used.len())
            .rev()
            .find(|&i| self.used[i])
            .ok_or_else(|| eyre::eyre!("internal page has no children"))?;
        Ok(self.child_pid(last))
    }

    fn set_child_category(&mut self, category: PageCategory) -> Result<()> {
        ensure!(
            matches!(category, PageCategory::Leaf | PageCategory::Internal),
            "internal page children must be leaves or internal pages, got {:?}",
            category
        );
        self.header.child_category = category as u8;
        Ok(())
    }

    fn move_entry(&mut self, from: usize, to: usize) {
        if from == to || !self.used[from] || self.used[to] {
            return;
        }
        self.keys[to] = self.keys[from].take();
        self.children[to] = self.children[from];
        self.children[from] = 0;
        self.used[from] = false;
        self.used[to] = true;
    }

    /// Inserts `(key, left, right)`, matching one of the entry's children
    /// against an existing pointer. Returns the slot the key landed in.
    pub fn insert_entry(&mut self, entry: &Entry) -> Result<usize> {
        ensure!(
            entry.key.data_type() == self.key_type,
            DbError::SchemaMismatch
        );
        ensure!(
            entry.left.category == entry.right.category,
            "entry children disagree on category"
        );

        // First entry initializes both child slots and the child category.
        if self.entry_count() == 0 && !self.used[0] {
            self.set_child_category(entry.left.category)?;
            self.used[0] = true;
            self.children[0] = entry.left.page_no as u32;
            self.used[1] = true;
            self.keys[1] = Some(entry.key.clone());
            self.children[1] = entry.right.page_no as u32;
            return Ok(1);
        }

        ensure!(
            entry.left.category == self.child_category(),
            "entry child category {:?} does not match page child category {:?}",
            entry.left.category,
            self.child_category()
        );

        let empty_slot = (1..self.used.len())
            .find(|&i| !self.used[i])
            .ok_or(DbError::PageFull)?;

        // Find the slot whose child pointer this entry extends.
        let left_no = entry.left.page_no as u32;
        let right_no = entry.right.page_no as u32;
        let mut less_or_eq: Option<usize> = None;
        for i in 0..self.used.len() {
            if !self.used[i] {
                continue;
            }
            if self.children[i] == left_no || self.children[i] == right_no {
                if i > 0 {
                    let existing = self.keys[i].as_ref().expect("used slot has a key");
                    ensure!(
                        existing.cmp_same_type(&entry.key)? != Ordering::Greater,
                        "entry key is out of order with its matched child"
                    );
                }
                less_or_eq = Some(i);
                if self.children[i] == right_no {
                    self.children[i] = left_no;
                }
            } else if less_or_eq.is_some() {
                break;
            }
        }
        let Some(less_or_eq) = less_or_eq else {
            bail!("entry has no child pointer in common with this page");
        };

        let target = if empty_slot < less_or_eq {
            for i in empty_slot..less_or_eq {
                self.move_entry(i + 1, i);
            }
            less_or_eq
        } else {
            for i in ((less_or_eq + 2)..=empty_slot).rev() {
                self.move_entry(i - 1, i);
            }
            less_or_eq + 1
        };

        self.used[target] = true;
        self.keys[target] = Some(entry.key.clone());
        self.children[target] = right_no;
        Ok(target)
    }

    fn ensure_entry_slot(&self, slot: usize) -> Result<()> {
        ensure!(slot > 0 && slot < self.used.len(), DbError::NotFound);
        ensure!(self.used[slot], DbError::NotFound);
        Ok(())
    }

    /// Removes the key at `slot` together with its right child pointer.
    pub fn delete_key_and_right_child(&mut self, slot: usize) -> Result<()> {
        self.ensure_entry_slot(slot)?;
        self.used[slot] = false;
        self.keys[slot] = None;
        self.children[slot] = 0;
        Ok(())
    }

    /// Removes the key at `slot` together with its left child pointer; the
    /// right child takes the left child's place.
    pub fn delete_key_and_left_child(&mut self, slot: usize) -> Result<()> {
        self.ensure_entry_slot(slot)?;
        let prev = (0..slot)
            .rev()
            .find(|&i| self.used[i])
            .ok_or(DbError::NotFound)?;
        self.children[prev] = self.children[slot];
        self.used[slot] = false;
        self.keys[slot] = None;
        self.children[slot] = 0;
        Ok(())
    }

    /// Replaces the separator key at `slot`.
    pub fn update_key(&mut self, slot: usize, key: Value) -> Result<()> {
        self.ensure_entry_slot(slot)?;
        ensure!(key.data_type() == self.key_type, DbError::SchemaMismatch);
        self.keys[slot] = Some(key);
        Ok(())
    }

    pub fn first_entry(&self) -> Option<Entry> {
        self.entries().into_iter().next()
    }

    pub fn last_entry(&self) -> Option<Entry> {
        self.entries().into_iter().next_back()
    }

    pub fn parent_id(&self) -> BTreePageId {
        match self.header.parent() {
            0 => BTreePageId::root_ptr(self.pid.table_id),
            n => BTreePageId::new(self.pid.table_id, n as usize, PageCategory::Internal),
        }
    }

    pub fn set_parent_id(&mut self, parent: &BTreePageId) -> Result<()> {
        match parent.category {
            PageCategory::RootPtr => self.header.set_parent(0),
            PageCategory::Internal => self.header.set_parent(parent.page_no as u32),
            other => bail!("internal parent cannot be a {:?} page", other),
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, dirty: bool, tid: TransactionId) {
        self.dirty = if dirty { Some(tid) } else { None };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internal_pid() -> BTreePageId {
        BTreePageId::new(1, 4, PageCategory::Internal)
    }

    fn leaf(n: usize) -> BTreePageId {
        BTreePageId::new(1, n, PageCategory::Leaf)
    }

    fn empty_page() -> InternalPage {
        InternalPage::new(internal_pid(), &InternalPage::empty_page_data(), DataType::Int).unwrap()
    }

    fn entry(key: i32, left: usize, right: usize) -> Entry {
        Entry::new(Value::Int(key), leaf(left), leaf(right))
    }

    fn key_list(page: &InternalPage) -> Vec<i32> {
        page.entries()
            .iter()
            .map(|e| match &e.key {
                Value::Int(v) => *v,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    fn child_list(page: &InternalPage) -> Vec<usize> {
        page.children().iter().map(|c| c.page_no).collect()
    }

    #[test]
    fn capacity_matches_the_bit_budget() {
        let m = InternalPage::capacity(DataType::Int);
        assert_eq!(m, (4096 - 9) * 8 / 65);
        // layout must fit in the page
        let bytes = HEADER_BLOCK_SIZE + (m + 1).div_ceil(8) + m * 4 + (m + 1) * 4;
        assert!(bytes <= 4096, "{} > 4096", bytes);
    }

    #[test]
    fn first_entry_initializes_both_children() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        assert_eq!(key_list(&page), vec![10]);
        assert_eq!(child_list(&page), vec![2, 3]);
        assert_eq!(page.child_category(), PageCategory::Leaf);
        assert_eq!(page.entry_count(), 1);
    }

    #[test]
    fn inserts_extend_the_child_chain_in_key_order() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        // split of child 3 pushes (20, 3, 4)
        page.insert_entry(&entry(20, 3, 4)).unwrap();
        // split of child 2 pushes (5, 2, 9): 9 is 2's new right half
        page.insert_entry(&entry(5, 9, 2)).unwrap();

        assert_eq!(key_list(&page), vec![5, 10, 20]);
        assert_eq!(child_list(&page), vec![9, 2, 3, 4]);

        let entries = page.entries();
        assert_eq!(entries[0].left.page_no, 9);
        assert_eq!(entries[0].right.page_no, 2);
        assert_eq!(entries[2].left.page_no, 3);
        assert_eq!(entries[2].right.page_no, 4);
    }

    #[test]
    fn rejects_entries_with_no_shared_child() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        assert!(page.insert_entry(&entry(30, 8, 9)).is_err());
    }

    #[test]
    fn delete_right_child_keeps_the_left_pointer() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        page.insert_entry(&entry(20, 3, 4)).unwrap();

        let e = page.entries().into_iter().find(|e| e.key == Value::Int(20)).unwrap();
        page.delete_key_and_right_child(e.slot).unwrap();
        assert_eq!(key_list(&page), vec![10]);
        assert_eq!(child_list(&page), vec![2, 3]);
    }

    #[test]
    fn delete_left_child_promotes_the_right_pointer() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        page.insert_entry(&entry(20, 3, 4)).unwrap();

        let e = page.entries().into_iter().find(|e| e.key == Value::Int(10)).unwrap();
        page.delete_key_and_left_child(e.slot).unwrap();
        assert_eq!(key_list(&page), vec![20]);
        assert_eq!(child_list(&page), vec![3, 4]);
    }

    #[test]
    fn update_key_replaces_the_separator() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        let e = page.first_entry().unwrap();
        page.update_key(e.slot, Value::Int(15)).unwrap();
        assert_eq!(key_list(&page), vec![15]);
    }

    #[test]
    fn page_data_round_trips_with_gaps() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        page.insert_entry(&entry(20, 3, 4)).unwrap();
        page.insert_entry(&entry(30, 4, 5)).unwrap();
        let e = page.entries().into_iter().find(|e| e.key == Value::Int(20)).unwrap();
        page.delete_key_and_right_child(e.slot).unwrap();
        page.set_parent_id(&BTreePageId::new(1, 8, PageCategory::Internal)).unwrap();

        let bytes = page.page_data();
        let back = InternalPage::new(internal_pid(), &bytes, DataType::Int).unwrap();
        assert_eq!(back.page_data(), bytes);
        assert_eq!(key_list(&back), key_list(&page));
        assert_eq!(child_list(&back), child_list(&page));
        assert_eq!(back.parent_id().page_no, 8);
    }

    #[test]
    fn full_page_reports_page_full() {
        let mut page = empty_page();
        let m = InternalPage::capacity(DataType::Int);
        page.insert_entry(&entry(0, 100, 101)).unwrap();
        for i in 1..m {
            page.insert_entry(&entry(i as i32, 100 + i, 101 + i)).unwrap();
        }
        assert_eq!(page.entry_count(), m);
        assert_eq!(page.empty_slot_count(), 0);
        let err = page
            .insert_entry(&entry(m as i32, 100 + m, 101 + m))
            .unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::PageFull));
    }

    #[test]
    fn extremes_report_leftmost_and_rightmost_children() {
        let mut page = empty_page();
        page.insert_entry(&entry(10, 2, 3)).unwrap();
        page.insert_entry(&entry(20, 3, 4)).unwrap();
        assert_eq!(page.leftmost_child_id().unwrap().page_no, 2);
        assert_eq!(page.rightmost_child_id().unwrap().page_no, 4);
    }
}
