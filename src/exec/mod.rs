//! # Operators
//!
//! The minimal pull-model operator set driving the end-to-end paths:
//! sequential scan, insert, delete, and aggregation. Every operator speaks
//! [`OpIterator`]; plans are trees of boxed operators pulled from the top.
//!
//! The contract is strict: `open` before anything else, `next` only after
//! `has_next` reported a row (otherwise `NoSuchElement`), any use after
//! `close` fails `NotOpen`, and `rewind` restarts from scratch.

mod aggregate;
mod delete;
mod insert;
mod seq_scan;

pub use aggregate::{Aggregate, AggregateOp, Aggregator};
pub use delete::Delete;
pub use insert::Insert;
pub use seq_scan::SeqScan;

use crate::tuple::{Tuple, TupleDesc};
use eyre::Result;

use crate::errors::DbError;

/// Pull-model tuple stream, restartable via `rewind`.
pub trait OpIterator {
    fn open(&mut self) -> Result<()>;
    fn has_next(&mut self) -> Result<bool>;
    fn next(&mut self) -> Result<Tuple>;
    fn rewind(&mut self) -> Result<()>;
    fn close(&mut self);
    fn tuple_desc(&self) -> &TupleDesc;
}

/// An operator over a materialized tuple list; the leaf of test plans and
/// the output stage of the aggregator.
pub struct TupleIterator {
    desc: TupleDesc,
    tuples: Vec<Tuple>,
    cursor: Option<usize>,
}

impl TupleIterator {
    pub fn new(desc: TupleDesc, tuples: Vec<Tuple>) -> Self {
        Self { desc, tuples, cursor: None }
    }
}

impl OpIterator for TupleIterator {
    fn open(&mut self) -> Result<()> {
        self.cursor = Some(0);
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool> {
        let cursor = self.cursor.ok_or(DbError::NotOpen)?;
        Ok(cursor < self.tuples.len())
    }

    fn next(&mut self) -> Result<Tuple> {
        let cursor = self.cursor.ok_or(DbError::NotOpen)?;
        let tuple = self.tuples.get(cursor).ok_or(DbError::NoSuchElement)?.clone();
        self.cursor = Some(cursor + 1);
        Ok(tuple)
    }

    fn rewind(&mut self) -> Result<()> {
        self.cursor = Some(0);
        Ok(())
    }

    fn close(&mut self) {
        self.cursor = None;
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.desc
    }
}
