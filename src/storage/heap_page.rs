//! # Slotted Heap Page
//!
//! A heap page is a fixed-size block holding fixed-width tuples behind an
//! occupancy bitmap:
//!
//! ```text
//! Offset                 Content
//! ------                 -------
//! 0                      header bitmap, bit i (LSB-first) = slot i occupied
//! header_bytes           slot 0 (tuple_size bytes)
//! header_bytes + size    slot 1
//! ...                    trailing padding (zeroed)
//! ```
//!
//! With one header bit per slot, capacity solves
//! `slots * (tuple_bits + 1) <= page_size * 8`:
//!
//! ```text
//! slots_per_page = (page_size * 8) / (tuple_size * 8 + 1)
//! header_bytes   = ceil(slots_per_page / 8)
//! ```
//!
//! Decoding parses every occupied slot into a [`Tuple`] whose record id is
//! `(page_id, slot)`; encoding is the exact inverse, with vacant slots and
//! the tail zero-filled so `decode(encode(p)) == p` holds byte-for-byte.
//!
//! The page tracks which transaction dirtied it; the buffer pool consults
//! that bit for NO-STEAL eviction and commit-time flushing.

use crate::config;
use crate::errors::DbError;
use crate::storage::{bitmap_get, bitmap_set, HeapPageId, PageId, TransactionId};
use crate::tuple::{RecordId, Tuple, TupleDesc};
use eyre::{ensure, Result};

#[derive(Debug)]
pub struct HeapPage {
    pid: HeapPageId,
    desc: TupleDesc,
    slots: Vec<Option<Tuple>>,
    dirty: Option<TransactionId>,
}

impl HeapPage {
    /// Number of tuple slots on a page with the current page size.
    pub fn slots_per_page(desc: &TupleDesc) -> usize {
        (config::page_size() * 8) / (desc.size() * 8 + 1)
    }

    /// Bytes of occupancy bitmap preceding the slots.
    pub fn header_bytes(desc: &TupleDesc) -> usize {
        Self::slots_per_page(desc).div_ceil(8)
    }

    /// All-zero page image: every slot vacant.
    pub fn empty_page_data() -> Vec<u8> {
        vec![0u8; config::page_size()]
    }

    /// Decodes a page image.
    pub fn new(pid: HeapPageId, data: &[u8], desc: TupleDesc) -> Result<Self> {
        ensure!(
            data.len() == config::page_size(),
            "heap page image is {} bytes, expected {}",
            data.len(),
            config::page_size()
        );
        let slot_count = Self::slots_per_page(&desc);
        let header = Self::header_bytes(&desc);
        let tuple_size = desc.size();

        let mut slots = Vec::with_capacity(slot_count);
        for i in 0..slot_count {
            if bitmap_get(&data[..header], i) {
                let start = header + i * tuple_size;
                let mut tuple = Tuple::deserialize(&desc, &data[start..start + tuple_size])?;
                tuple.set_record_id(Some(RecordId::new(PageId::Heap(pid), i)));
                slots.push(Some(tuple));
            } else {
                slots.push(None);
            }
        }

        Ok(Self { pid, desc, slots, dirty: None })
    }

    pub fn id(&self) -> PageId {
        PageId::Heap(self.pid)
    }

    pub fn heap_id(&self) -> HeapPageId {
        self.pid
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    /// Encodes the page to its on-disk image.
    pub fn page_data(&self) -> Vec<u8> {
        let mut data = vec![0u8; config::page_size()];
        let header = Self::header_bytes(&self.desc);
        let tuple_size = self.desc.size();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(tuple) = slot {
                bitmap_set(&mut data[..header], i, true);
                let start = header + i * tuple_size;
                tuple
                    .serialize_into(&mut data[start..start + tuple_size])
                    .expect("slot width matches schema width");
            }
        }
        data
    }

    pub fn empty_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Stores the tuple in the lowest-numbered vacant slot and stamps its
    /// record id. Fails `PageFull` with no vacancy, `SchemaMismatch` if the
    /// tuple's schema differs from the page's.
    pub fn insert_tuple(&mut self, tuple: &mut Tuple) -> Result<()> {
        ensure!(tuple.desc() == &self.desc, DbError::SchemaMismatch);
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(DbError::PageFull)?;
        tuple.set_record_id(Some(RecordId::new(PageId::Heap(self.pid), slot)));
        self.slots[slot] = Some(tuple.clone());
        Ok(())
    }

    /// Clears the slot named by the tuple's record id. Fails `NotFound` if
    /// the tuple lives on another page or the slot is already vacant.
    pub fn delete_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        let rid = tuple.record_id().ok_or(DbError::NotFound)?;
        ensure!(rid.page_id == PageId::Heap(self.pid), DbError::NotFound);
        ensure!(rid.slot < self.slots.len(), DbError::NotFound);
        ensure!(self.slots[rid.slot].is_some(), DbError::NotFound);
        self.slots[rid.slot] = None;
        Ok(())
    }

    /// Occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.slots.iter().flatten()
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
    use crate::types::{DataType, Value};

    fn int_desc() -> TupleDesc {
        TupleDesc::unnamed(vec![DataType::Int])
    }

    fn int_tuple(v: i32) -> Tuple {
        Tuple::new(int_desc(), vec![Value::Int(v)]).unwrap()
    }

    #[test]
    fn capacity_follows_the_slot_formula() {
        // one 4-byte int: 33 bits per slot
        assert_eq!(HeapPage::slots_per_page(&int_desc()), 4096 * 8 / 33);
        let wide = TupleDesc::unnamed(vec![DataType::Int, DataType::Text]);
        assert_eq!(HeapPage::slots_per_page(&wide), 4096 * 8 / (136 * 8 + 1));
    }

    #[test]
    fn empty_page_decodes_to_all_vacant_slots() {
        let pid = HeapPageId::new(1, 0);
        let page = HeapPage::new(pid, &HeapPage::empty_page_data(), int_desc()).unwrap();
        assert_eq!(page.empty_slot_count(), HeapPage::slots_per_page(&int_desc()));
        assert_eq!(page.iter().count(), 0);
    }

    #[test]
    fn insert_uses_lowest_empty_slot_and_stamps_rid() {
        let pid = HeapPageId::new(1, 0);
        let mut page = HeapPage::new(pid, &HeapPage::empty_page_data(), int_desc()).unwrap();

        let mut t = int_tuple(42);
        page.insert_tuple(&mut t).unwrap();

        let rid = t.record_id().unwrap();
        assert_eq!(rid.page_id, PageId::Heap(pid));
        assert_eq!(rid.slot, 0);

        let mut t2 = int_tuple(43);
        page.insert_tuple(&mut t2).unwrap();
        assert_eq!(t2.record_id().unwrap().slot, 1);
    }

    #[test]
    fn delete_then_insert_reuses_the_slot() {
        let pid = HeapPageId::new(1, 0);
        let mut page = HeapPage::new(pid, &HeapPage::empty_page_data(), int_desc()).unwrap();

        let mut a = int_tuple(1);
        let mut b = int_tuple(2);
        page.insert_tuple(&mut a).unwrap();
        page.insert_tuple(&mut b).unwrap();
        page.delete_tuple(&a).unwrap();

        let mut c = int_tuple(3);
        page.insert_tuple(&mut c).unwrap();
        assert_eq!(c.record_id().unwrap().slot, 0);
    }

    #[test]
    fn delete_of_foreign_tuple_fails() {
        let mut page =
            HeapPage::new(HeapPageId::new(1, 0), &HeapPage::empty_page_data(), int_desc()).unwrap();
        let mut other =
            HeapPage::new(HeapPageId::new(1, 1), &HeapPage::empty_page_data(), int_desc()).unwrap();

        let mut t = int_tuple(5);
        other.insert_tuple(&mut t).unwrap();

        let err = page.delete_tuple(&t).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::NotFound));
    }

    #[test]
    fn double_delete_fails() {
        let mut page =
            HeapPage::new(HeapPageId::new(1, 0), &HeapPage::empty_page_data(), int_desc()).unwrap();
        let mut t = int_tuple(5);
        page.insert_tuple(&mut t).unwrap();
        page.delete_tuple(&t).unwrap();
        let err = page.delete_tuple(&t).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::NotFound));
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let mut page =
            HeapPage::new(HeapPageId::new(1, 0), &HeapPage::empty_page_data(), int_desc()).unwrap();
        let desc = TupleDesc::unnamed(vec![DataType::Text]);
        let mut t = Tuple::new(desc, vec![Value::Text("x".into())]).unwrap();
        let err = page.insert_tuple(&mut t).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::SchemaMismatch));
    }

    #[test]
    fn full_page_reports_page_full() {
        let pid = HeapPageId::new(1, 0);
        let mut page = HeapPage::new(pid, &HeapPage::empty_page_data(), int_desc()).unwrap();
        for i in 0..HeapPage::slots_per_page(&int_desc()) {
            let mut t = int_tuple(i as i32);
            page.insert_tuple(&mut t).unwrap();
        }
        assert_eq!(page.empty_slot_count(), 0);
        let err = page.insert_tuple(&mut int_tuple(-1)).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::PageFull));
    }

    #[test]
    fn page_data_round_trips() {
        let pid = HeapPageId::new(7, 3);
        let mut page = HeapPage::new(pid, &HeapPage::empty_page_data(), int_desc()).unwrap();
        for v in [10, 20, 30] {
            page.insert_tuple(&mut int_tuple(v)).unwrap();
        }
        let victim = page.iter().nth(1).cloned().unwrap();
        page.delete_tuple(&victim).unwrap();

        let bytes = page.page_data();
        let decoded = HeapPage::new(pid, &bytes, int_desc()).unwrap();
        assert_eq!(decoded.page_data(), bytes);
        let values: Vec<_> = decoded.iter().map(|t| t.value(0).clone()).collect();
        assert_eq!(values, vec![Value::Int(10), Value::Int(30)]);
    }

    #[test]
    fn iteration_is_in_slot_order() {
        let pid = HeapPageId::new(1, 0);
        let mut page = HeapPage::new(pid, &HeapPage::empty_page_data(), int_desc()).unwrap();
        for v in [3, 1, 2] {
            page.insert_tuple(&mut int_tuple(v)).unwrap();
        }
        let slots: Vec<_> = page.iter().map(|t| t.record_id().unwrap().slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[test]
    fn dirty_bit_tracks_the_dirtying_transaction() {
        let mut page =
            HeapPage::new(HeapPageId::new(1, 0), &HeapPage::empty_page_data(), int_desc()).unwrap();
        assert!(page.is_dirty().is_none());
        let tid = TransactionId::new();
        page.mark_dirty(true, tid);
        assert_eq!(page.is_dirty(), Some(tid));
        page.mark_dirty(false, tid);
        assert!(page.is_dirty().is_none());
    }
}
