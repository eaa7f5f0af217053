//! # B+ Tree Leaf Page
//!
//! Leaf pages hold the tree's tuples in nondecreasing key order and chain
//! to their siblings, forming a doubly linked list across the bottom of the
//! tree:
//!
//! ```text
//! Offset            Size     Field
//! ------            -------  -------------------------------------
//! 0                 4        parent page-no (0 = parent is root-ptr)
//! 4                 4        left sibling page-no (0 = leftmost)
//! 8                 4        right sibling page-no (0 = rightmost)
//! 12                header   occupancy bitmap, bit i = slot i used
//! 12 + header       slots    tuple_size bytes per slot
//! ```
//!
//! Capacity solves `slots * (tuple_bits + 1) <= (page_size - 12) * 8`.
//!
//! Insertion keeps the sorted order by shifting tuples between the target
//! position and the nearest vacant slot; every move rewrites the moved
//! tuple's record id. Vacant slots may sit between occupied ones after a
//! delete; iteration simply yields occupied slots in slot order, which is
//! key order.

use crate::config;
use crate::errors::DbError;
use crate::storage::{
    bitmap_get, bitmap_set, parse_zerocopy, write_zerocopy, PageId, TransactionId,
};
use crate::tuple::{RecordId, Tuple, TupleDesc};
use crate::types::Value;
use eyre::{ensure, Result};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{BTreePageId, PageCategory};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct LeafPointers {
    parent: U32,
    left_sibling: U32,
    right_sibling: U32,
}

impl LeafPointers {
    zerocopy_accessors! {
        parent: u32,
        left_sibling: u32,
        right_sibling: u32,
    }
}

const POINTER_BLOCK_SIZE: usize = 12;

#[derive(Debug)]
pub struct LeafPage {
    pid: BTreePageId,
    desc: TupleDesc,
    key_field: usize,
    ptrs: LeafPointers,
    slots: Vec<Option<Tuple>>,
    dirty: Option<TransactionId>,
}

impl LeafPage {
    /// Tuple slots on a leaf with the current page size.
    pub fn capacity(desc: &TupleDesc) -> usize {
        ((config::page_size() - POINTER_BLOCK_SIZE) * 8) / (desc.size() * 8 + 1)
    }

    fn header_bytes(desc: &TupleDesc) -> usize {
        Self::capacity(desc).div_ceil(8)
    }

    pub fn empty_page_data() -> Vec<u8> {
        vec![0u8; config::page_size()]
    }

    pub fn new(pid: BTreePageId, data: &[u8], desc: TupleDesc, key_field: usize) -> Result<Self> {
        ensure!(
            pid.category == PageCategory::Leaf,
            "leaf page constructed with {:?} id",
            pid.category
        );
        ensure!(
            data.len() == config::page_size(),
            "leaf page image is {} bytes, expected {}",
            data.len(),
            config::page_size()
        );
        ensure!(key_field < desc.num_fields(), DbError::NotFound);

        let ptrs = *parse_zerocopy::<LeafPointers>(data, "LeafPointers")?;
        let capacity = Self::capacity(&desc);
        let header = Self::header_bytes(&desc);
        let bitmap = &data[POINTER_BLOCK_SIZE..POINTER_BLOCK_SIZE + header];
        let tuple_size = desc.size();
        let slot_base = POINTER_BLOCK_SIZE + header;

        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            if bitmap_get(bitmap, i) {
                let start = slot_base + i * tuple_size;
                let mut tuple = Tuple::deserialize(&desc, &data[start..start + tuple_size])?;
                tuple.set_record_id(Some(RecordId::new(PageId::BTree(pid), i)));
                slots.push(Some(tuple));
            } else {
                slots.push(None);
            }
        }

        Ok(Self { pid, desc, key_field, ptrs, slots, dirty: None })
    }

    pub fn id(&self) -> PageId {
        PageId::BTree(self.pid)
    }

    pub fn btree_id(&self) -> BTreePageId {
        self.pid
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    pub fn page_data(&self) -> Vec<u8> {
        let mut data = vec![0u8; config::page_size()];
        write_zerocopy(&self.ptrs, &mut data, "LeafPointers").expect("fixed-size block");
        let header = Self::header_bytes(&self.desc);
        let tuple_size = self.desc.size();
        let slot_base = POINTER_BLOCK_SIZE + header;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(tuple) = slot {
                bitmap_set(&mut data[POINTER_BLOCK_SIZE..POINTER_BLOCK_SIZE + header], i, true);
                let start = slot_base + i * tuple_size;
                tuple
                    .serialize_into(&mut data[start..start + tuple_size])
                    .expect("slot width matches schema width");
            }
        }
        data
    }

    fn key_of(&self, tuple: &Tuple) -> Value {
        tuple.value(self.key_field).clone()
    }

    pub fn tuple_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn empty_slot_count(&self) -> usize {
        self.slots.len() - self.tuple_count()
    }

    /// Occupied slots in slot order, which is key order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.slots.iter().flatten()
    }

    pub fn first_tuple(&self) -> Option<&Tuple> {
        self.iter().next()
    }

    pub fn last_tuple(&self) -> Option<&Tuple> {
        self.slots.iter().rev().flatten().next()
    }

    fn move_tuple(&mut self, from: usize, to: usize) {
        if from == to || self.slots[from].is_none() || self.slots[to].is_some() {
            return;
        }
        let mut tuple = self.slots[from].take().expect("checked above");
        tuple.set_record_id(Some(RecordId::new(PageId::BTree(self.pid), to)));
        self.slots[to] = Some(tuple);
    }

    /// Inserts in sorted position, shifting between the chosen position and
    /// the nearest vacancy. Stamps the tuple's record id.
    pub fn insert_tuple(&mut self, tuple: &mut Tuple) -> Result<()> {
        ensure!(tuple.desc() == &self.desc, DbError::SchemaMismatch);
        let empty_slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(DbError::PageFull)?;

        // Last occupied slot whose key <= the incoming key.
        let key = self.key_of(tuple);
        let mut less_or_eq: Option<usize> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(existing) = slot {
                if self.key_of(existing).cmp_same_type(&key)? != std::cmp::Ordering::Greater {
                    less_or_eq = Some(i);
                } else {
                    break;
                }
            }
        }

        let target = match less_or_eq {
            Some(le) if empty_slot < le => {
                for i in empty_slot..le {
                    self.move_tuple(i + 1, i);
                }
                le
            }
            _ => {
                let lower = less_or_eq.map_or(0, |le| le + 1);
                for i in ((lower + 1)..=empty_slot).rev() {
                    self.move_tuple(i - 1, i);
                }
                lower
            }
        };

        tuple.set_record_id(Some(RecordId::new(PageId::BTree(self.pid), target)));
        self.slots[target] = Some(tuple.clone());
        Ok(())
    }

    /// Clears the slot named by the tuple's record id.
    pub fn delete_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        let rid = tuple.record_id().ok_or(DbError::NotFound)?;
        ensure!(rid.page_id == PageId::BTree(self.pid), DbError::NotFound);
        ensure!(rid.slot < self.slots.len(), DbError::NotFound);
        ensure!(self.slots[rid.slot].is_some(), DbError::NotFound);
        self.slots[rid.slot] = None;
        Ok(())
    }

    /// Parent page: an internal page, or the root-ptr when this leaf is the
    /// root.
    pub fn parent_id(&self) -> BTreePageId {
        match self.ptrs.parent() {
            0 => BTreePageId::root_ptr(self.pid.table_id),
            n => BTreePageId::new(self.pid.table_id, n as usize, PageCategory::Internal),
        }
    }

    pub fn set_parent_id(&mut self, parent: &BTreePageId) -> Result<()> {
        match parent.category {
            PageCategory::RootPtr => self.ptrs.set_parent(0),
            PageCategory::Internal => self.ptrs.set_parent(parent.page_no as u32),
            other => eyre::bail!("leaf parent cannot be a {:?} page", other),
        }
        Ok(())
    }

    pub fn left_sibling_id(&self) -> Option<BTreePageId> {
        match self.ptrs.left_sibling() {
            0 => None,
            n => Some(BTreePageId::new(self.pid.table_id, n as usize, PageCategory::Leaf)),
        }
    }

    pub fn set_left_sibling_id(&mut self, sibling: Option<BTreePageId>) {
        self.ptrs.set_left_sibling(sibling.map_or(0, |pid| pid.page_no as u32));
    }

    pub fn right_sibling_id(&self) -> Option<BTreePageId> {
        match self.ptrs.right_sibling() {
            0 => None,
            n => Some(BTreePageId::new(self.pid.table_id, n as usize, PageCategory::Leaf)),
        }
    }

    pub fn set_right_sibling_id(&mut self, sibling: Option<BTreePageId>) {
        self.ptrs.set_right_sibling(sibling.map_or(0, |pid| pid.page_no as u32));
    }

    pub fn is_dirty(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, dirty: bool, tid: TransactionId) {
        self.dirty = if dirty { Some(tid) } else { None };
    }
}
