//! Root-pointer page: the 9-byte singleton at the front of a tree file.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------
//! 0       4     root page-no (0 = empty tree)
//! 4       1     category of the root page
//! 5       4     first header page-no (0 = none)
//! ```

use crate::config::ROOT_PTR_SIZE;
use crate::errors::DbError;
use crate::storage::{parse_zerocopy, write_zerocopy, PageId, TransactionId};
use eyre::{ensure, Result};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{BTreePageId, PageCategory};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RootPtrBlock {
    root: U32,
    root_category: u8,
    header: U32,
}

impl RootPtrBlock {
    zerocopy_accessors! {
        root: u32,
        header: u32,
    }
}

#[derive(Debug)]
pub struct RootPtrPage {
    pid: BTreePageId,
    block: RootPtrBlock,
    dirty: Option<TransactionId>,
}

impl RootPtrPage {
    pub fn empty_page_data() -> Vec<u8> {
        vec![0u8; ROOT_PTR_SIZE]
    }

    pub fn new(pid: BTreePageId, data: &[u8]) -> Result<Self> {
        ensure!(
            pid.category == PageCategory::RootPtr,
            "root-ptr page constructed with {:?} id",
            pid.category
        );
        ensure!(
            data.len() == ROOT_PTR_SIZE,
            "root-ptr image is {} bytes, expected {}",
            data.len(),
            ROOT_PTR_SIZE
        );
        let block = *parse_zerocopy::<RootPtrBlock>(data, "RootPtrBlock")?;
        if block.root() != 0 {
            ensure!(
                matches!(
                    PageCategory::from_byte(block.root_category),
                    Some(PageCategory::Leaf) | Some(PageCategory::Internal)
                ),
                "root category byte {} is not leaf or internal",
                block.root_category
            );
        }
        Ok(Self { pid, block, dirty: None })
    }

    pub fn id(&self) -> PageId {
        PageId::BTree(self.pid)
    }

    pub fn page_data(&self) -> Vec<u8> {
        let mut data = vec![0u8; ROOT_PTR_SIZE];
        write_zerocopy(&self.block, &mut data, "RootPtrBlock").expect("fixed-size image");
        data
    }

    /// Identity of the tree's root page, if the tree has one.
    pub fn root_id(&self) -> Option<BTreePageId> {
        if self.block.root() == 0 {
            return None;
        }
        let category = PageCategory::from_byte(self.block.root_category)
            .unwrap_or(PageCategory::Leaf);
        Some(BTreePageId::new(self.pid.table_id, self.block.root() as usize, category))
    }

    pub fn set_root_id(&mut self, root: Option<BTreePageId>) -> Result<()> {
        match root {
            Some(pid) => {
                ensure!(
                    matches!(pid.category, PageCategory::Leaf | PageCategory::Internal),
                    "tree root must be a leaf or internal page, got {:?}",
                    pid.category
                );
                ensure!(pid.page_no != 0, DbError::IllegalPage(0));
                self.block.set_root(pid.page_no as u32);
                self.block.root_category = pid.category as u8;
            }
            None => {
                self.block.set_root(0);
                self.block.root_category = 0;
            }
        }
        Ok(())
    }

    /// Head of the header-page chain, if any header pages exist.
    pub fn header_id(&self) -> Option<BTreePageId> {
        if self.block.header() == 0 {
            return None;
        }
        Some(BTreePageId::new(
            self.pid.table_id,
            self.block.header() as usize,
            PageCategory::Header,
        ))
    }

    pub fn set_header_id(&mut self, header: Option<BTreePageId>) {
        self.block.set_header(header.map_or(0, |pid| pid.page_no as u32));
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

    #[test]
    fn empty_image_has_no_root_and_no_header() {
        let pid = BTreePageId::root_ptr(1);
        let page = RootPtrPage::new(pid, &RootPtrPage::empty_page_data()).unwrap();
        assert!(page.root_id().is_none());
        assert!(page.header_id().is_none());
    }

    #[test]
    fn root_and_header_round_trip() {
        let pid = BTreePageId::root_ptr(1);
        let mut page = RootPtrPage::new(pid, &RootPtrPage::empty_page_data()).unwrap();
        page.set_root_id(Some(BTreePageId::new(1, 5, PageCategory::Internal))).unwrap();
        page.set_header_id(Some(BTreePageId::new(1, 9, PageCategory::Header)));

        let bytes = page.page_data();
        assert_eq!(bytes.len(), ROOT_PTR_SIZE);
        let back = RootPtrPage::new(pid, &bytes).unwrap();
        assert_eq!(back.root_id(), Some(BTreePageId::new(1, 5, PageCategory::Internal)));
        assert_eq!(back.header_id(), Some(BTreePageId::new(1, 9, PageCategory::Header)));
        assert_eq!(back.page_data(), bytes);
    }

    #[test]
    fn root_page_numbers_are_big_endian() {
        let pid = BTreePageId::root_ptr(1);
        let mut page = RootPtrPage::new(pid, &RootPtrPage::empty_page_data()).unwrap();
        page.set_root_id(Some(BTreePageId::new(1, 0x0102, PageCategory::Leaf))).unwrap();
        let bytes = page.page_data();
        assert_eq!(&bytes[..4], &[0, 0, 1, 2]);
        assert_eq!(bytes[4], PageCategory::Leaf as u8);
    }

    #[test]
    fn rejects_header_category_as_root() {
        let pid = BTreePageId::root_ptr(1);
        let mut page = RootPtrPage::new(pid, &RootPtrPage::empty_page_data()).unwrap();
        let err = page.set_root_id(Some(BTreePageId::new(1, 2, PageCategory::Header)));
        assert!(err.is_err());
    }
}
