//! Header page: the allocation bitmap of a tree file.
//!
//! ```text
//! Offset  Size             Field
//! ------  ---------------  --------------------------------
//! 0       4                prev header page-no (0 = none)
//! 4       4                next header page-no (0 = none)
//! 8       page_size - 8    bitmap, bit i (LSB-first) = page
//!                          (chain_offset + i) is allocated
//! ```
//!
//! One header page covers `(page_size - 8) * 8` page numbers; chained
//! headers cover the rest. A freshly initialized header reports every slot
//! used, so pages already in the file stay allocated; `set_empty_page`
//! clears exactly the bits it frees.

use crate::config;
use crate::storage::{bitmap_get, bitmap_set, parse_zerocopy, write_zerocopy, PageId, TransactionId};
use eyre::{ensure, Result};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{BTreePageId, PageCategory};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct HeaderChain {
    prev: U32,
    next: U32,
}

impl HeaderChain {
    zerocopy_accessors! {
        prev: u32,
        next: u32,
    }
}

const CHAIN_SIZE: usize = 8;

#[derive(Debug)]
pub struct HeaderPage {
    pid: BTreePageId,
    chain: HeaderChain,
    bitmap: Vec<u8>,
    dirty: Option<TransactionId>,
}

impl HeaderPage {
    /// Allocation bits carried by one header page.
    pub fn slots_per_page() -> usize {
        (config::page_size() - CHAIN_SIZE) * 8
    }

    pub fn empty_page_data() -> Vec<u8> {
        vec![0u8; config::page_size()]
    }

    pub fn new(pid: BTreePageId, data: &[u8]) -> Result<Self> {
        ensure!(
            pid.category == PageCategory::Header,
            "header page constructed with {:?} id",
            pid.category
        );
        ensure!(
            data.len() == config::page_size(),
            "header page image is {} bytes, expected {}",
            data.len(),
            config::page_size()
        );
        let chain = *parse_zerocopy::<HeaderChain>(data, "HeaderChain")?;
        Ok(Self {
            pid,
            chain,
            bitmap: data[CHAIN_SIZE..].to_vec(),
            dirty: None,
        })
    }

    pub fn id(&self) -> PageId {
        PageId::BTree(self.pid)
    }

    pub fn page_data(&self) -> Vec<u8> {
        let mut data = vec![0u8; config::page_size()];
        write_zerocopy(&self.chain, &mut data, "HeaderChain").expect("fixed-size image");
        data[CHAIN_SIZE..].copy_from_slice(&self.bitmap);
        data
    }

    /// Marks every slot used. Called once when the page joins the chain, so
    /// pages the file already contains remain allocated.
    pub fn init(&mut self) {
        self.bitmap.fill(0xFF);
    }

    pub fn slot_used(&self, slot: usize) -> bool {
        bitmap_get(&self.bitmap, slot)
    }

    pub fn mark_slot_used(&mut self, slot: usize, used: bool) {
        bitmap_set(&mut self.bitmap, slot, used);
    }

    /// Lowest free slot on this page, if any.
    pub fn first_empty_slot(&self) -> Option<usize> {
        for (byte_index, byte) in self.bitmap.iter().enumerate() {
            if *byte != 0xFF {
                let bit = byte.trailing_ones() as usize;
                return Some(byte_index * 8 + bit);
            }
        }
        None
    }

    pub fn prev_id(&self) -> Option<BTreePageId> {
        match self.chain.prev() {
            0 => None,
            n => Some(BTreePageId::new(self.pid.table_id, n as usize, PageCategory::Header)),
        }
    }

    pub fn set_prev_id(&mut self, prev: Option<BTreePageId>) {
        self.chain.set_prev(prev.map_or(0, |pid| pid.page_no as u32));
    }

    pub fn next_id(&self) -> Option<BTreePageId> {
        match self.chain.next() {
            0 => None,
            n => Some(BTreePageId::new(self.pid.table_id, n as usize, PageCategory::Header)),
        }
    }

    pub fn set_next_id(&mut self, next: Option<BTreePageId>) {
        self.chain.set_next(next.map_or(0, |pid| pid.page_no as u32));
    }

    /// Count of set bits; used by structural invariant checks.
    pub fn used_count(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum()
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

    fn header_pid() -> BTreePageId {
        BTreePageId::new(1, 3, PageCategory::Header)
    }

    #[test]
    fn slot_count_covers_the_bitmap_area() {
        assert_eq!(HeaderPage::slots_per_page(), (4096 - 8) * 8);
    }

    #[test]
    fn init_marks_everything_used() {
        let mut page = HeaderPage::new(header_pid(), &HeaderPage::empty_page_data()).unwrap();
        page.init();
        assert!(page.first_empty_slot().is_none());
        assert_eq!(page.used_count(), HeaderPage::slots_per_page());
    }

    #[test]
    fn freed_slot_is_found_first() {
        let mut page = HeaderPage::new(header_pid(), &HeaderPage::empty_page_data()).unwrap();
        page.init();
        page.mark_slot_used(300, false);
        page.mark_slot_used(12, false);
        assert_eq!(page.first_empty_slot(), Some(12));
        page.mark_slot_used(12, true);
        assert_eq!(page.first_empty_slot(), Some(300));
    }

    #[test]
    fn chain_pointers_round_trip() {
        let mut page = HeaderPage::new(header_pid(), &HeaderPage::empty_page_data()).unwrap();
        page.init();
        page.set_prev_id(Some(BTreePageId::new(1, 2, PageCategory::Header)));
        page.set_next_id(Some(BTreePageId::new(1, 7, PageCategory::Header)));

        let bytes = page.page_data();
        let back = HeaderPage::new(header_pid(), &bytes).unwrap();
        assert_eq!(back.prev_id().unwrap().page_no, 2);
        assert_eq!(back.next_id().unwrap().page_no, 7);
        assert_eq!(back.page_data(), bytes);
        assert!(back.first_empty_slot().is_none());
    }

    #[test]
    fn zeroed_image_reports_every_slot_free() {
        let page = HeaderPage::new(header_pid(), &HeaderPage::empty_page_data()).unwrap();
        assert_eq!(page.first_empty_slot(), Some(0));
        assert_eq!(page.used_count(), 0);
    }
}
