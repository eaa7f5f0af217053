//! Delete operator: removes every tuple its child produces.

use crate::database::Database;
use crate::errors::DbError;
use crate::storage::TransactionId;
use crate::tuple::{Tuple, TupleDesc};
use crate::types::{DataType, Value};
use eyre::Result;

use super::OpIterator;

/// Deletes each child tuple from its owning table (resolved through the
/// tuple's record id) and yields one single-column count tuple, once.
pub struct Delete<'a> {
    db: &'a Database,
    tid: TransactionId,
    child: Box<dyn OpIterator + 'a>,
    desc: TupleDesc,
    open: bool,
    done: bool,
}

impl<'a> Delete<'a> {
    pub fn new(db: &'a Database, tid: TransactionId, child: Box<dyn OpIterator + 'a>) -> Self {
        Self {
            db,
            tid,
            child,
            desc: TupleDesc::unnamed(vec![DataType::Int]),
            open: false,
            done: false,
        }
    }
}

impl OpIterator for Delete<'_> {
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
        let mut deleted = 0;
        while self.child.has_next()? {
            let tuple = self.child.next()?;
            self.db.buffer_pool().delete_tuple(self.db, self.tid, &tuple)?;
            deleted += 1;
        }
        Tuple::new(self.desc.clone(), vec![Value::Int(deleted)])
    }

    // Rewinding does not re-arm the count row: the deletes happened.
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
