//! Insert operator: drains its child into a table through the buffer pool.

use crate::database::Database;
use crate::errors::DbError;
use crate::storage::{TableId, TransactionId};
use crate::tuple::{Tuple, TupleDesc};
use crate::types::{DataType, Value};
use eyre::{ensure, Result};

use super::OpIterator;

/// Inserts every tuple its child produces and yields one single-column
/// tuple holding the affected-row count. A second fetch yields nothing.
pub struct Insert<'a> {
    db: &'a Database,
    tid: TransactionId,
    child: Box<dyn OpIterator + 'a>,
    table_id: TableId,
    desc: TupleDesc,
    open: bool,
    done: bool,
}

impl<'a> std::fmt::Debug for Insert<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Insert")
            .field("tid", &self.tid)
            .field("table_id", &self.table_id)
            .field("desc", &self.desc)
            .field("open", &self.open)
            .field("done", &self.done)
            .finish()
    }
}

impl<'a> Insert<'a> {
    pub fn new(
        db: &'a Database,
        tid: TransactionId,
        child: Box<dyn OpIterator + 'a>,
        table_id: TableId,
    ) -> Result<Self> {
        ensure!(
            child.tuple_desc() == &db.tuple_desc(table_id)?,
            DbError::SchemaMismatch
        );
        Ok(Self {
            db,
            tid,
            child,
            table_id,
            desc: TupleDesc::unnamed(vec![DataType::Int]),
            open: false,
            done: false,
        })
    }
}

impl OpIterator for Insert<'_> {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;
        self.open = true;
        self.done = false;
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool> {
        if !self.open {
            return Err(DbError::NotOpen.into());
        }
        Ok(!self.done)
    }

    fn next(&mut self) -> Result<Tuple> {
        if !self.has_next()? {
            return Err(DbError::NoSuchElement.into());
        }
        self.done = true;
        let mut inserted = 0;
        while self.child.has_next()? {
            let mut tuple = self.child.next()?;
            self.db
                .buffer_pool()
                .insert_tuple(self.db, self.tid, self.table_id, &mut tuple)?;
            inserted += 1;
        }
        Tuple::new(self.desc.clone(), vec![Value::Int(inserted)])
    }

    // Rewinding does not re-arm the count row: the inserts happened.
    fn rewind(&mut self) -> Result<()> {
        self.child.rewind()
    }

    fn close(&mut self) {
        self.child.close();
        self.open = false;
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::TupleIterator;
    use crate::storage::{DbFile, HeapFile};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn inserts_all_child_tuples_and_reports_the_count() {
        let dir = tempdir().unwrap();
        let db = Database::new();
        let desc = TupleDesc::unnamed(vec![DataType::Int]);
        let file = Arc::new(HeapFile::open(dir.path().join("t.dat"), desc.clone()).unwrap());
        let table_id = file.id();
        db.add_table(file.clone(), "t", "");

        let rows: Vec<Tuple> = (0..4)
            .map(|i| Tuple::new(desc.clone(), vec![Value::Int(i)]).unwrap())
            .collect();
        let child = Box::new(TupleIterator::new(desc.clone(), rows));

        let tid = TransactionId::new();
        let mut insert = Insert::new(&db, tid, child, table_id).unwrap();
        insert.open().unwrap();
        assert!(insert.has_next().unwrap());
        let result = insert.next().unwrap();
        assert_eq!(result.value(0), &Value::Int(4));
        assert!(!insert.has_next().unwrap());
        db.commit(tid).unwrap();

        let tid = TransactionId::new();
        let mut iter = file.iter(&db, tid).unwrap();
        iter.open().unwrap();
        let mut count = 0;
        while iter.has_next().unwrap() {
            iter.next().unwrap();
            count += 1;
        }
        assert_eq!(count, 4);
        db.commit(tid).unwrap();
    }

    #[test]
    fn schema_mismatch_is_rejected_at_construction() {
        let dir = tempdir().unwrap();
        let db = Database::new();
        let desc = TupleDesc::unnamed(vec![DataType::Int]);
        let file = Arc::new(HeapFile::open(dir.path().join("t.dat"), desc).unwrap());
        let table_id = file.id();
        db.add_table(file, "t", "");

        let wrong = TupleDesc::unnamed(vec![DataType::Text]);
        let child = Box::new(TupleIterator::new(wrong, Vec::new()));
        let tid = TransactionId::new();
        let err = Insert::new(&db, tid, child, table_id).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::SchemaMismatch));
    }
}
