//! Sequential scan over a table's file, heap or tree alike.

use crate::database::Database;
use crate::errors::DbError;
use crate::storage::{DbFileIterator, TableId, TransactionId};
use crate::tuple::{Tuple, TupleDesc};
use eyre::Result;

use super::OpIterator;

/// Pulls every tuple of one table through the buffer pool under READ_ONLY
/// page locks. Field names in the visible schema are prefixed with the
/// scan's alias, so joins over self-paired tables stay unambiguous.
pub struct SeqScan<'a> {
    db: &'a Database,
    tid: TransactionId,
    table_id: TableId,
    desc: TupleDesc,
    iter: Option<Box<dyn DbFileIterator + 'a>>,
}

impl<'a> SeqScan<'a> {
    pub fn new(
        db: &'a Database,
        tid: TransactionId,
        table_id: TableId,
        alias: &str,
    ) -> Result<Self> {
        let base = db.tuple_desc(table_id)?;
        let types = (0..base.num_fields()).map(|i| base.field_type(i)).collect();
        let names = (0..base.num_fields())
            .map(|i| base.field_name(i).map(|name| format!("{}.{}", alias, name)))
            .collect();
        Ok(Self {
            db,
            tid,
            table_id,
            desc: TupleDesc::new(types, names),
            iter: None,
        })
    }
}

impl OpIterator for SeqScan<'_> {
    fn open(&mut self) -> Result<()> {
        let file = self.db.db_file(self.table_id)?;
        let mut iter = file.iter(self.db, self.tid)?;
        iter.open()?;
        self.iter = Some(iter);
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool> {
        self.iter.as_mut().ok_or(DbError::NotOpen)?.has_next()
    }

    fn next(&mut self) -> Result<Tuple> {
        self.iter.as_mut().ok_or(DbError::NotOpen)?.next()
    }

    fn rewind(&mut self) -> Result<()> {
        self.close();
        self.open()
    }

    fn close(&mut self) {
        self.iter = None;
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DbFile, HeapFile};
    use crate::types::{DataType, Value};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn scans_a_heap_table_and_aliases_names() {
        let dir = tempdir().unwrap();
        let db = Database::new();
        let desc = TupleDesc::new(vec![DataType::Int], vec![Some("a".into())]);
        let file = Arc::new(HeapFile::open(dir.path().join("t.dat"), desc.clone()).unwrap());
        let table_id = file.id();
        db.add_table(file, "t", "a");

        let tid = TransactionId::new();
        for i in 0..5 {
            let mut t = Tuple::new(desc.clone(), vec![Value::Int(i)]).unwrap();
            db.buffer_pool().insert_tuple(&db, tid, table_id, &mut t).unwrap();
        }
        db.commit(tid).unwrap();

        let tid = TransactionId::new();
        let mut scan = SeqScan::new(&db, tid, table_id, "s").unwrap();
        assert_eq!(scan.tuple_desc().field_name(0), Some("s.a"));

        scan.open().unwrap();
        let mut count = 0;
        while scan.has_next().unwrap() {
            scan.next().unwrap();
            count += 1;
        }
        assert_eq!(count, 5);

        scan.rewind().unwrap();
        assert!(scan.has_next().unwrap());
        db.commit(tid).unwrap();
    }
}
